//! Declarative query IR.
//!
//! A [`Query`] is a flat list of [`QueryEntry`] predicates joined by
//! And/Or/Not operators, plus sorting, pagination, aggregation and join
//! clauses. The executor rewrites entries (index binding, AND-merge,
//! composite substitution) before planning, so entries keep the raw
//! caller-supplied form here.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::value::KeyValue;

/// Predicate condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondType {
    /// Field has any (non-empty) value.
    Any,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    /// Inclusive range between two values.
    Range,
    /// Equals any of the listed values.
    Set,
    /// Array field contains all listed values.
    AllSet,
}

impl CondType {
    /// Range-like conditions can drive an ordered index scan.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            CondType::Lt | CondType::Le | CondType::Gt | CondType::Ge | CondType::Range
        )
    }
}

/// Boolean operator linking an entry to the running result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    And,
    Or,
    Not,
}

/// How an entry's `index` name resolved against the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexNo {
    /// Not resolved yet.
    Unset,
    /// No such index; the predicate is evaluated through the JSON tail.
    ByJsonPath,
    /// Bound to the index at this slot.
    Index(usize),
}

impl IndexNo {
    pub fn index(&self) -> Option<usize> {
        match self {
            IndexNo::Index(i) => Some(*i),
            _ => None,
        }
    }
}

/// A single predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEntry {
    pub op: OpType,
    pub condition: CondType,
    pub index: String,
    pub idx_no: IndexNo,
    pub values: Vec<KeyValue>,
    pub distinct: bool,
}

impl QueryEntry {
    pub fn new(
        op: OpType,
        condition: CondType,
        index: impl Into<String>,
        values: Vec<KeyValue>,
    ) -> Self {
        Self {
            op,
            condition,
            index: index.into(),
            idx_no: IndexNo::Unset,
            values,
            distinct: false,
        }
    }
}

/// Total-count calculation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CalcTotalMode {
    #[default]
    None,
    /// Count matches exactly during execution.
    Accurate,
    /// Serve the total from the query cache when possible.
    Cached,
}

/// Aggregation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggType {
    Sum,
    Avg,
    Min,
    Max,
    /// Per-value counts.
    Facet,
}

/// One aggregation request over an indexed field.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    pub index: String,
    pub agg_type: AggType,
}

/// Join flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    /// Outer row survives only with >= 1 matched inner row.
    Inner,
    /// ORed into the boolean verdict of the preceding conditions.
    OrInner,
    /// Matched inner rows are attached; outer row always survives.
    Left,
    /// Results of another query appended to this one.
    Merge,
}

/// Field equation driving a join: `left_field <condition> right_field`.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinEntry {
    pub op: OpType,
    pub condition: CondType,
    /// Field of the outer namespace.
    pub left_field: String,
    /// Field of the inner (joined) namespace.
    pub right_field: String,
}

/// A joined sub-query.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedQuery {
    pub join_type: JoinType,
    pub query: Query,
    pub on: Vec<JoinEntry>,
}

/// Declarative query over one namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub namespace: String,
    pub entries: Vec<QueryEntry>,
    pub sort_by: String,
    pub sort_dir_desc: bool,
    /// Explicit bucket order for the sort field; matched rows come first,
    /// in this order, stable within a bucket.
    pub forced_sort_order: Vec<KeyValue>,
    pub aggregations: Vec<AggregateEntry>,
    pub start: usize,
    pub count: usize,
    pub calc_total: CalcTotalMode,
    /// Fields to expose when rendering results; empty means all.
    pub select_filter: Vec<String>,
    pub join_queries: Vec<JoinedQuery>,
    pub merge_queries: Vec<Query>,
    /// Verbosity of per-query diagnostics (0 = namespace default).
    pub debug_level: u8,
}

impl Query {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            count: usize::MAX,
            ..Default::default()
        }
    }

    /// Add an And-predicate.
    pub fn where_cond(
        mut self,
        index: impl Into<String>,
        condition: CondType,
        values: Vec<KeyValue>,
    ) -> Self {
        self.entries
            .push(QueryEntry::new(OpType::And, condition, index, values));
        self
    }

    /// Add a predicate with an explicit operator.
    pub fn where_op(
        mut self,
        op: OpType,
        index: impl Into<String>,
        condition: CondType,
        values: Vec<KeyValue>,
    ) -> Self {
        self.entries
            .push(QueryEntry::new(op, condition, index, values));
        self
    }

    /// Request distinct values of a field.
    pub fn distinct(mut self, index: impl Into<String>) -> Self {
        let mut entry = QueryEntry::new(OpType::And, CondType::Any, index, Vec::new());
        entry.distinct = true;
        self.entries.push(entry);
        self
    }

    pub fn sort(mut self, index: impl Into<String>, desc: bool) -> Self {
        self.sort_by = index.into();
        self.sort_dir_desc = desc;
        self
    }

    pub fn forced_sort(mut self, order: Vec<KeyValue>) -> Self {
        self.forced_sort_order = order;
        self
    }

    pub fn limit(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn offset(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    pub fn calc_total(mut self, mode: CalcTotalMode) -> Self {
        self.calc_total = mode;
        self
    }

    pub fn aggregate(mut self, index: impl Into<String>, agg_type: AggType) -> Self {
        self.aggregations.push(AggregateEntry {
            index: index.into(),
            agg_type,
        });
        self
    }

    pub fn select_fields(mut self, fields: Vec<String>) -> Self {
        self.select_filter = fields;
        self
    }

    fn join(mut self, join_type: JoinType, query: Query, on: Vec<JoinEntry>) -> Self {
        self.join_queries.push(JoinedQuery {
            join_type,
            query,
            on,
        });
        self
    }

    pub fn inner_join(self, query: Query, on: Vec<JoinEntry>) -> Self {
        self.join(JoinType::Inner, query, on)
    }

    pub fn or_inner_join(self, query: Query, on: Vec<JoinEntry>) -> Self {
        self.join(JoinType::OrInner, query, on)
    }

    pub fn left_join(self, query: Query, on: Vec<JoinEntry>) -> Self {
        self.join(JoinType::Left, query, on)
    }

    pub fn merge(mut self, query: Query) -> Self {
        self.merge_queries.push(query);
        self
    }

    /// Structural fingerprint: predicates, index bindings and sort, but not
    /// pagination or aggregations. Queries differing only in
    /// `start`/`count` share a fingerprint, which is what lets the query
    /// cache serve totals across pages.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.namespace.hash(&mut hasher);
        for entry in &self.entries {
            entry.op.hash(&mut hasher);
            entry.condition.hash(&mut hasher);
            entry.index.hash(&mut hasher);
            entry.distinct.hash(&mut hasher);
            entry.values.hash(&mut hasher);
        }
        self.sort_by.hash(&mut hasher);
        self.sort_dir_desc.hash(&mut hasher);
        self.forced_sort_order.hash(&mut hasher);
        for joined in &self.join_queries {
            joined.join_type.hash(&mut hasher);
            joined.query.fingerprint().hash(&mut hasher);
            for on in &joined.on {
                on.op.hash(&mut hasher);
                on.condition.hash(&mut hasher);
                on.left_field.hash(&mut hasher);
                on.right_field.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let q = Query::new("users")
            .where_cond("age", CondType::Gt, vec![KeyValue::Int(18)])
            .sort("age", false)
            .offset(10)
            .limit(20);
        assert_eq!(q.namespace, "users");
        assert_eq!(q.entries.len(), 1);
        assert_eq!(q.entries[0].condition, CondType::Gt);
        assert_eq!(q.sort_by, "age");
        assert_eq!(q.start, 10);
        assert_eq!(q.count, 20);
    }

    #[test]
    fn test_fingerprint_ignores_pagination() {
        let base = Query::new("users").where_cond("age", CondType::Gt, vec![KeyValue::Int(18)]);
        let paged = base.clone().offset(100).limit(10);
        assert_eq!(base.fingerprint(), paged.fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_values() {
        let a = Query::new("users").where_cond("age", CondType::Eq, vec![KeyValue::Int(18)]);
        let b = Query::new("users").where_cond("age", CondType::Eq, vec![KeyValue::Int(19)]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_condition() {
        let a = Query::new("users").where_cond("age", CondType::Eq, vec![KeyValue::Int(18)]);
        let b = Query::new("users").where_cond("age", CondType::Gt, vec![KeyValue::Int(18)]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_distinct_entry() {
        let q = Query::new("users").distinct("name");
        assert!(q.entries[0].distinct);
        assert_eq!(q.entries[0].condition, CondType::Any);
    }
}
