//! Query execution: rewriting, planning, the selection loop and
//! post-processing.

pub mod aggregator;
pub mod comparator;
pub mod join;
pub mod results;
pub mod select_iterator;
pub mod selecter;

pub use aggregator::{AggregationResult, Aggregator, FacetResult};
pub use comparator::Comparator;
pub use join::{JoinedSelector, PreResult, PreResultState, PRERESULT_ITERATORS_THRESHOLD};
pub use results::{ItemRef, JoinedRows, NsContext, QueryResults};
pub use select_iterator::SelectIterator;
pub use selecter::{NsSelecter, SelectCtx};
