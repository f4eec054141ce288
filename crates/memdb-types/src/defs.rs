//! Index and namespace definitions.
//!
//! These are the serde-round-trippable descriptions a namespace persists
//! under its schema key and returns from `definition()`.

use serde::{Deserialize, Serialize};

use crate::value::KeyValueType;

/// String collation applied by ordered indexes and sorts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollateMode {
    /// Byte-wise comparison.
    #[default]
    None,
    /// Case-insensitive ASCII comparison.
    AsciiCi,
    /// Case-insensitive comparison after Unicode lowercasing.
    Utf8Ci,
    /// Compare by leading numeric value, ties broken byte-wise.
    Numeric,
}

/// Collation options attached to an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateOpts {
    pub mode: CollateMode,
}

impl CollateOpts {
    pub fn new(mode: CollateMode) -> Self {
        Self { mode }
    }
}

/// Physical index family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    /// Unordered hash map, equality lookups only.
    Hash,
    /// Ordered tree, supports ranges and sort orders.
    Tree,
    /// Full-text token index; treated as a black-box iterator provider.
    FullText,
    /// Hash index over a tuple of fields.
    CompositeHash,
    /// Ordered index over a tuple of fields.
    CompositeTree,
}

impl IndexType {
    /// Ordered types can produce sort permutations and range results.
    pub fn is_ordered(&self) -> bool {
        matches!(self, IndexType::Tree | IndexType::CompositeTree)
    }

    /// Composite types key on a tuple of fields.
    pub fn is_composite(&self) -> bool {
        matches!(self, IndexType::CompositeHash | IndexType::CompositeTree)
    }

    pub fn is_fulltext(&self) -> bool {
        matches!(self, IndexType::FullText)
    }
}

/// Per-index options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOpts {
    /// Values are unique across live items.
    pub unique: bool,
    /// The indexed field holds an array of values.
    pub array: bool,
    /// Field exists only in the dynamic tail; evaluated by comparator.
    pub sparse: bool,
    /// This index is the primary key.
    pub pk: bool,
    /// Collation for string keys.
    pub collate: CollateOpts,
}

impl IndexOpts {
    pub fn pk() -> Self {
        Self {
            unique: true,
            pk: true,
            ..Default::default()
        }
    }

    pub fn array() -> Self {
        Self {
            array: true,
            ..Default::default()
        }
    }

    pub fn with_collate(mut self, mode: CollateMode) -> Self {
        self.collate = CollateOpts::new(mode);
        self
    }
}

/// Declarative index description.
///
/// Composite indexes are named `"a+b"`; member fields are resolved by
/// splitting the name on `+`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    /// JSON path the field is read from when parsing documents. Empty means
    /// the path equals the name.
    pub json_path: String,
    pub index_type: IndexType,
    pub key_type: KeyValueType,
    pub opts: IndexOpts,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, index_type: IndexType, key_type: KeyValueType) -> Self {
        Self {
            name: name.into(),
            json_path: String::new(),
            index_type,
            key_type,
            opts: IndexOpts::default(),
        }
    }

    pub fn with_opts(mut self, opts: IndexOpts) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_json_path(mut self, path: impl Into<String>) -> Self {
        self.json_path = path.into();
        self
    }

    /// Effective JSON path of the field.
    pub fn json_path(&self) -> &str {
        if self.json_path.is_empty() {
            &self.name
        } else {
            &self.json_path
        }
    }

    /// Member field names for composite indexes.
    pub fn composite_fields(&self) -> Vec<&str> {
        self.name.split('+').collect()
    }
}

/// Declarative namespace description: a name plus its indexes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDef {
    pub name: String,
    pub indexes: Vec<IndexDef>,
}

impl NamespaceDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }
}
