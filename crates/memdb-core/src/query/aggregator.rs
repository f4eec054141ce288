//! Streaming aggregation over accepted rows.
//!
//! Aggregators are constructed per query from its aggregation entries,
//! fed every payload the selection loop accepts, and emit their results
//! when the loop ends. When a query aggregates, it emits no rows.

use std::collections::HashMap;

use memdb_types::{AggType, IdType, KeyValue, PayloadValue};

/// One facet bucket: a value and how many accepted rows carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetResult {
    pub value: KeyValue,
    pub count: usize,
}

/// The outcome of one aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationResult {
    Value(f64),
    Facet(Vec<FacetResult>),
}

#[derive(Debug)]
pub struct Aggregator {
    agg_type: AggType,
    field: usize,
    sum: f64,
    count: usize,
    min: Option<f64>,
    max: Option<f64>,
    facets: HashMap<KeyValue, usize>,
}

impl Aggregator {
    pub fn new(agg_type: AggType, field: usize) -> Self {
        Self {
            agg_type,
            field,
            sum: 0.0,
            count: 0,
            min: None,
            max: None,
            facets: HashMap::new(),
        }
    }

    /// Fold one accepted row in.
    pub fn aggregate(&mut self, payload: &PayloadValue, _id: IdType) {
        for value in payload.get(self.field) {
            match self.agg_type {
                AggType::Facet => {
                    *self.facets.entry(value.clone()).or_insert(0) += 1;
                }
                _ => {
                    if let Some(v) = value.as_double() {
                        self.sum += v;
                        self.count += 1;
                        self.min = Some(self.min.map_or(v, |m| m.min(v)));
                        self.max = Some(self.max.map_or(v, |m| m.max(v)));
                    }
                }
            }
        }
    }

    pub fn result(self) -> AggregationResult {
        match self.agg_type {
            AggType::Sum => AggregationResult::Value(self.sum),
            AggType::Avg => AggregationResult::Value(if self.count > 0 {
                self.sum / self.count as f64
            } else {
                0.0
            }),
            AggType::Min => AggregationResult::Value(self.min.unwrap_or(0.0)),
            AggType::Max => AggregationResult::Value(self.max.unwrap_or(0.0)),
            AggType::Facet => {
                let mut buckets: Vec<FacetResult> = self
                    .facets
                    .into_iter()
                    .map(|(value, count)| FacetResult { value, count })
                    .collect();
                buckets.sort_by(|a, b| a.value.cmp(&b.value));
                AggregationResult::Facet(buckets)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(v: i32) -> PayloadValue {
        let mut pv = PayloadValue::alloc(1);
        pv.set(0, vec![KeyValue::Int(v)]);
        pv
    }

    #[test]
    fn test_sum_avg_min_max() {
        let values = [10, 20, 30];
        let mut sum = Aggregator::new(AggType::Sum, 0);
        let mut avg = Aggregator::new(AggType::Avg, 0);
        let mut min = Aggregator::new(AggType::Min, 0);
        let mut max = Aggregator::new(AggType::Max, 0);
        for (id, v) in values.iter().enumerate() {
            for agg in [&mut sum, &mut avg, &mut min, &mut max] {
                agg.aggregate(&row(*v), id);
            }
        }
        assert_eq!(sum.result(), AggregationResult::Value(60.0));
        assert_eq!(avg.result(), AggregationResult::Value(20.0));
        assert_eq!(min.result(), AggregationResult::Value(10.0));
        assert_eq!(max.result(), AggregationResult::Value(30.0));
    }

    #[test]
    fn test_facet() {
        let mut facet = Aggregator::new(AggType::Facet, 0);
        for (id, v) in [1, 2, 1, 1].iter().enumerate() {
            facet.aggregate(&row(*v), id);
        }
        let AggregationResult::Facet(buckets) = facet.result() else {
            panic!("expected facet result");
        };
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].value, KeyValue::Int(1));
        assert_eq!(buckets[0].count, 3);
        assert_eq!(buckets[1].count, 1);
    }

    #[test]
    fn test_empty_aggregation() {
        let avg = Aggregator::new(AggType::Avg, 0);
        assert_eq!(avg.result(), AggregationResult::Value(0.0));
    }
}
