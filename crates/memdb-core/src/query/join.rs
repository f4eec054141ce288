//! Join plumbing: pre-results and per-row joined selectors.
//!
//! The inner side of a join runs once in build mode over its common
//! (outer-independent) conditions; the selection loop of the outer query
//! then consumes that pre-result on every candidate row instead of
//! re-planning the inner query. Per-outer-row verdicts are additionally
//! memoized in the namespace join cache.

use std::sync::Arc;

use memdb_types::{IdType, JoinType, PayloadValue, Result};

use crate::idset::IdSet;
use crate::query::select_iterator::SelectIterator;

/// A build-mode pre-result switches to iterators instead of materializing
/// an IdSet when the plan expects at least this many iterations. Tuning
/// heuristic: wide plans are cheaper to re-drive than to materialize.
pub const PRERESULT_ITERATORS_THRESHOLD: usize = 10_000;

/// State of an inner-query pre-result.
#[derive(Debug)]
pub enum PreResultState {
    /// Being filled by a build-mode select: accepted ids accumulate here.
    Build(IdSet),
    /// Materialized ids, consumed as a single extra iterator.
    Ids(Arc<IdSet>),
    /// The built iterators themselves, re-driven by the consumer.
    Iterators(Vec<SelectIterator>),
}

#[derive(Debug)]
pub struct PreResult {
    pub state: PreResultState,
}

impl PreResult {
    pub fn for_build() -> Self {
        Self {
            state: PreResultState::Build(IdSet::new()),
        }
    }
}

impl Default for PreResult {
    fn default() -> Self {
        Self::for_build()
    }
}

/// Callback evaluating the inner side of a join for one outer row.
/// Receives `(outer_id, outer_payload, attach_rows)` and returns whether
/// any inner row matched.
pub type JoinFn<'a> = Box<dyn FnMut(IdType, &PayloadValue, bool) -> Result<bool> + 'a>;

/// One joined sub-query, driven from within the outer selection loop.
pub struct JoinedSelector<'a> {
    pub join_type: JoinType,
    pub ns_name: String,
    /// How many outer rows invoked this selector.
    pub called: usize,
    /// How many invocations matched.
    pub matched: usize,
    /// The join only filters; no inner rows are attached to the result.
    pub nodata: bool,
    pub func: JoinFn<'a>,
}

impl std::fmt::Debug for JoinedSelector<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinedSelector")
            .field("join_type", &self.join_type)
            .field("ns_name", &self.ns_name)
            .field("called", &self.called)
            .field("matched", &self.matched)
            .field("nodata", &self.nodata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_result_starts_in_build() {
        let pre = PreResult::default();
        assert!(matches!(pre.state, PreResultState::Build(_)));
    }
}
