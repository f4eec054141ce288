//! MEMDB shared types - values, payload layout, query IR, and errors.
//!
//! This crate carries the types that cross every interface boundary of the
//! engine: the scalar [`KeyValue`] variant, the fixed-schema payload layout
//! ([`PayloadType`] / [`PayloadValue`]), the declarative query IR
//! ([`Query`] / [`QueryEntry`]), index and namespace definitions, and the
//! code-carrying [`Error`] type. It has no locking and no storage.

pub mod defs;
pub mod error;
pub mod payload;
pub mod query;
pub mod value;

pub use defs::{CollateMode, CollateOpts, IndexDef, IndexOpts, IndexType, NamespaceDef};
pub use error::{Error, ErrorCode, Result};
pub use payload::{FieldsSet, IdType, PayloadFieldType, PayloadType, PayloadValue, TagsPath};
pub use query::{
    AggType, AggregateEntry, CalcTotalMode, CondType, IndexNo, JoinEntry, JoinType, JoinedQuery,
    OpType, Query, QueryEntry,
};
pub use value::{CompositeValue, IndexKey, KeyValue, KeyValueType};
