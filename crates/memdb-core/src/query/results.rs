//! Query results.
//!
//! A [`QueryResults`] is an ordered list of [`ItemRef`]s plus the total
//! count (0 unless requested), aggregation outcomes, joined rows keyed by
//! outer id, and one rendering context per participating namespace so
//! callers can serialize rows to JSON out of band.

use std::collections::HashMap;

use memdb_types::{IdType, KeyValue, PayloadType, PayloadValue};

use crate::query::aggregator::AggregationResult;
use crate::tagsmatcher::TagsMatcher;

/// Reference to one matched document.
#[derive(Debug, Clone)]
pub struct ItemRef {
    pub id: IdType,
    pub version: u64,
    pub value: PayloadValue,
    /// Full-text relevance percent; 0 outside full-text queries.
    pub proc: u8,
    /// Index into [`QueryResults::contexts`].
    pub nsid: usize,
}

/// Rendering context of one namespace.
#[derive(Debug, Clone)]
pub struct NsContext {
    pub payload_type: PayloadType,
    pub tags_matcher: TagsMatcher,
    /// Fields to expose; empty means all.
    pub select_filter: Vec<String>,
}

/// Inner rows attached to one outer row by a join.
#[derive(Debug, Clone, Default)]
pub struct JoinedRows {
    pub namespace: String,
    pub items: Vec<ItemRef>,
}

#[derive(Debug, Default)]
pub struct QueryResults {
    pub items: Vec<ItemRef>,
    pub total_count: usize,
    pub aggregation_results: Vec<AggregationResult>,
    pub contexts: Vec<NsContext>,
    /// Joined rows per outer document id.
    pub joined: HashMap<IdType, Vec<JoinedRows>>,
    /// Whether items carry full-text relevance.
    pub have_procent: bool,
}

impl QueryResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemRef> {
        self.items.iter()
    }

    /// Register a namespace context, returning its nsid.
    pub fn add_ns_context(&mut self, ctx: NsContext) -> usize {
        self.contexts.push(ctx);
        self.contexts.len() - 1
    }

    /// Render one row as a JSON object: fixed fields first, then the
    /// dynamic tail, honoring the namespace select filter.
    pub fn to_json(&self, item: &ItemRef) -> serde_json::Value {
        let Some(ctx) = self.contexts.get(item.nsid) else {
            return serde_json::Value::Null;
        };
        let mut out = serde_json::Map::new();
        if let serde_json::Value::Object(tail) = item.value.tail() {
            for (k, v) in tail {
                if ctx.select_filter.is_empty() || ctx.select_filter.iter().any(|f| f == k) {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        for (idx, field) in ctx.payload_type.fields().iter().enumerate() {
            if !ctx.select_filter.is_empty()
                && !ctx.select_filter.iter().any(|f| f == &field.name)
            {
                continue;
            }
            let values = item.value.get(idx);
            let rendered = if field.is_array {
                serde_json::Value::Array(values.iter().map(value_to_json).collect())
            } else {
                match values.first() {
                    Some(v) => value_to_json(v),
                    None => serde_json::Value::Null,
                }
            };
            out.insert(field.name.clone(), rendered);
        }
        serde_json::Value::Object(out)
    }
}

fn value_to_json(value: &KeyValue) -> serde_json::Value {
    match value {
        KeyValue::Empty | KeyValue::Composite(_) => serde_json::Value::Null,
        KeyValue::Int(v) => serde_json::json!(v),
        KeyValue::Int64(v) => serde_json::json!(v),
        KeyValue::Double(v) => serde_json::json!(v),
        KeyValue::Str(s) => serde_json::json!(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdb_types::{KeyValueType, PayloadFieldType};

    #[test]
    fn test_to_json_with_filter() {
        let mut pt = PayloadType::new("users");
        pt.add_field(PayloadFieldType::new("id", KeyValueType::Int)).unwrap();
        pt.add_field(PayloadFieldType::new("name", KeyValueType::Str)).unwrap();

        let mut pv = PayloadValue::alloc(2);
        pv.set(0, vec![KeyValue::Int(7)]);
        pv.set(1, vec![KeyValue::Str("ada".into())]);
        pv.set_tail(serde_json::json!({"extra": 1}));

        let mut results = QueryResults::new();
        let nsid = results.add_ns_context(NsContext {
            payload_type: pt,
            tags_matcher: TagsMatcher::new(),
            select_filter: vec![],
        });
        let item = ItemRef {
            id: 0,
            version: 1,
            value: pv.clone(),
            proc: 0,
            nsid,
        };
        let json = results.to_json(&item);
        assert_eq!(json["id"], serde_json::json!(7));
        assert_eq!(json["name"], serde_json::json!("ada"));
        assert_eq!(json["extra"], serde_json::json!(1));

        results.contexts[0].select_filter = vec!["name".into()];
        let filtered = results.to_json(&item);
        assert!(filtered.get("id").is_none());
        assert_eq!(filtered["name"], serde_json::json!("ada"));
    }
}
