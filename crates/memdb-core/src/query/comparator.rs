//! Iterator-less predicate evaluation.
//!
//! A [`Comparator`] walks candidate rows and decodes the compared field on
//! demand - from a dense payload slot or, for JSON-path predicates, from
//! the dynamic tail through the tagsmatcher. The planner falls back to
//! comparators when an entry has no usable index, when the index is
//! sparse, or when a full-text predicate owns the scan.

use memdb_types::{CollateOpts, CondType, FieldsSet, KeyValue, PayloadValue};

use crate::tagsmatcher::TagsMatcher;

#[derive(Debug, Clone)]
pub struct Comparator {
    cond: CondType,
    values: Vec<KeyValue>,
    fields: FieldsSet,
    collate: CollateOpts,
}

impl Comparator {
    pub fn new(
        cond: CondType,
        values: Vec<KeyValue>,
        fields: FieldsSet,
        collate: CollateOpts,
    ) -> Self {
        Self {
            cond,
            values,
            fields,
            collate,
        }
    }

    /// Evaluate the predicate against one row.
    pub fn matches(&self, payload: &PayloadValue, tags: &TagsMatcher) -> bool {
        let mut candidates: Vec<KeyValue> = Vec::new();
        for &field in self.fields.fields() {
            candidates.extend_from_slice(payload.get(field));
        }
        for path in self.fields.tags_paths() {
            if let Some(value) = tags.extract(payload.tail(), path) {
                json_to_values(value, &mut candidates);
            }
        }
        self.matches_values(&candidates)
    }

    fn matches_values(&self, candidates: &[KeyValue]) -> bool {
        match self.cond {
            CondType::Any => candidates
                .iter()
                .any(|c| !matches!(c, KeyValue::Empty)),
            CondType::Eq | CondType::Set => candidates.iter().any(|c| {
                self.values
                    .iter()
                    .any(|v| c.cmp_collated(v, &self.collate).is_eq())
            }),
            CondType::Lt => self.cmp_first(candidates, |ord| ord.is_lt()),
            CondType::Le => self.cmp_first(candidates, |ord| ord.is_le()),
            CondType::Gt => self.cmp_first(candidates, |ord| ord.is_gt()),
            CondType::Ge => self.cmp_first(candidates, |ord| ord.is_ge()),
            CondType::Range => {
                if self.values.len() < 2 {
                    return false;
                }
                candidates.iter().any(|c| {
                    c.cmp_collated(&self.values[0], &self.collate).is_ge()
                        && c.cmp_collated(&self.values[1], &self.collate).is_le()
                })
            }
            CondType::AllSet => self.values.iter().all(|v| {
                candidates
                    .iter()
                    .any(|c| c.cmp_collated(v, &self.collate).is_eq())
            }),
        }
    }

    fn cmp_first(
        &self,
        candidates: &[KeyValue],
        accept: impl Fn(std::cmp::Ordering) -> bool,
    ) -> bool {
        let Some(value) = self.values.first() else {
            return false;
        };
        candidates
            .iter()
            .any(|c| accept(c.cmp_collated(value, &self.collate)))
    }
}

/// Flatten a JSON value into comparable scalars.
fn json_to_values(value: &serde_json::Value, out: &mut Vec<KeyValue>) {
    match value {
        serde_json::Value::Null => {}
        serde_json::Value::Bool(b) => out.push(KeyValue::Int(*b as i32)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push(KeyValue::Int64(i));
            } else if let Some(f) = n.as_f64() {
                out.push(KeyValue::Double(f));
            }
        }
        serde_json::Value::String(s) => out.push(KeyValue::Str(s.clone())),
        serde_json::Value::Array(items) => {
            for item in items {
                json_to_values(item, out);
            }
        }
        serde_json::Value::Object(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdb_types::{CollateMode, FieldsSet};

    fn row(values: Vec<KeyValue>) -> PayloadValue {
        let mut pv = PayloadValue::alloc(1);
        pv.set(0, values);
        pv
    }

    fn cmp(cond: CondType, values: Vec<KeyValue>) -> Comparator {
        Comparator::new(
            cond,
            values,
            FieldsSet::from_fields(vec![0]),
            CollateOpts::default(),
        )
    }

    #[test]
    fn test_eq_and_set() {
        let tm = TagsMatcher::new();
        let pv = row(vec![KeyValue::Int(20)]);
        assert!(cmp(CondType::Eq, vec![KeyValue::Int(20)]).matches(&pv, &tm));
        assert!(!cmp(CondType::Eq, vec![KeyValue::Int(21)]).matches(&pv, &tm));
        assert!(cmp(
            CondType::Set,
            vec![KeyValue::Int(10), KeyValue::Int(20)]
        )
        .matches(&pv, &tm));
    }

    #[test]
    fn test_ranges() {
        let tm = TagsMatcher::new();
        let pv = row(vec![KeyValue::Int(20)]);
        assert!(cmp(CondType::Gt, vec![KeyValue::Int(19)]).matches(&pv, &tm));
        assert!(cmp(CondType::Le, vec![KeyValue::Int(20)]).matches(&pv, &tm));
        assert!(cmp(
            CondType::Range,
            vec![KeyValue::Int(10), KeyValue::Int(30)]
        )
        .matches(&pv, &tm));
        assert!(!cmp(
            CondType::Range,
            vec![KeyValue::Int(21), KeyValue::Int(30)]
        )
        .matches(&pv, &tm));
    }

    #[test]
    fn test_all_set_on_array() {
        let tm = TagsMatcher::new();
        let pv = row(vec![KeyValue::Int(1), KeyValue::Int(2), KeyValue::Int(3)]);
        assert!(cmp(
            CondType::AllSet,
            vec![KeyValue::Int(1), KeyValue::Int(3)]
        )
        .matches(&pv, &tm));
        assert!(!cmp(
            CondType::AllSet,
            vec![KeyValue::Int(1), KeyValue::Int(4)]
        )
        .matches(&pv, &tm));
    }

    #[test]
    fn test_json_path_extraction() {
        let mut tm = TagsMatcher::new();
        let path = tm.path_to_tags("specs.weight");
        let mut pv = PayloadValue::alloc(1);
        pv.set_tail(serde_json::json!({"specs": {"weight": 12}}));

        let mut fields = FieldsSet::default();
        fields.push_tags(path);
        let comparator = Comparator::new(
            CondType::Gt,
            vec![KeyValue::Int(10)],
            fields,
            CollateOpts::default(),
        );
        assert!(comparator.matches(&pv, &tm));
    }

    #[test]
    fn test_collated_eq() {
        let tm = TagsMatcher::new();
        let pv = row(vec![KeyValue::Str("Alice".into())]);
        let comparator = Comparator::new(
            CondType::Eq,
            vec![KeyValue::Str("ALICE".into())],
            FieldsSet::from_fields(vec![0]),
            CollateOpts::new(CollateMode::AsciiCi),
        );
        assert!(comparator.matches(&pv, &tm));
    }
}
