//! MEMDB core - the query execution engine.
//!
//! An embeddable in-memory document database with secondary indexes,
//! composite indexes, full-text search, joins, sorting, aggregation and
//! optional sled persistence. The centerpiece is the selecter: given a
//! declarative [`Query`] it rewrites predicates, picks the cheapest access
//! path, merges boolean sub-results over sorted posting lists, applies
//! joins, sorts, paginates and aggregates - all under the namespace
//! reader lock, coordinating commits with ongoing writes.

pub mod cache;
pub mod db;
pub mod idset;
pub mod index;
pub mod item;
pub mod namespace;
pub mod query;
pub mod stats;
pub mod storage;
pub mod tagsmatcher;

pub use db::Database;
pub use idset::IdSet;
pub use item::Item;
pub use namespace::Namespace;
pub use query::results::{ItemRef, QueryResults};
pub use stats::{NamespaceMemStat, NamespacePerfStat};

/// Re-export of the shared types crate.
pub use memdb_types as types;
pub use memdb_types::{
    AggType, CalcTotalMode, CollateMode, CollateOpts, CondType, Error, ErrorCode, IdType,
    IndexDef, IndexOpts, IndexType, JoinEntry, JoinType, KeyValue, KeyValueType, NamespaceDef,
    OpType, Query, Result,
};
