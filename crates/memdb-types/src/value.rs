//! Scalar runtime values.
//!
//! [`KeyValue`] is the variant scalar carried by query entries, index keys
//! and payload fields. [`IndexKey`] is its hashable/orderable projection
//! used as the posting-map key inside indexes: floats are mapped to
//! sort-preserving bit patterns, strings are folded according to the
//! index collation, and composites are kept as order-preserving encoded
//! tuples.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::defs::{CollateMode, CollateOpts};
use crate::error::{Error, Result};
use crate::payload::{FieldsSet, PayloadType, PayloadValue};

/// Type tag of a [`KeyValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyValueType {
    Empty,
    Int,
    Int64,
    Double,
    Str,
    Composite,
}

impl KeyValueType {
    pub fn name(&self) -> &'static str {
        match self {
            KeyValueType::Empty => "empty",
            KeyValueType::Int => "int",
            KeyValueType::Int64 => "int64",
            KeyValueType::Double => "double",
            KeyValueType::Str => "string",
            KeyValueType::Composite => "composite",
        }
    }
}

/// A composite key value: an ordered sequence of child scalars that is
/// materialized into an owned [`PayloadValue`] before an index can use it.
///
/// While `value` is `None` the composite is transient and compares
/// structurally over `parts`; materialization consumes `parts`.
#[derive(Debug, Clone, Default)]
pub struct CompositeValue {
    pub value: Option<PayloadValue>,
    pub parts: Vec<KeyValue>,
}

impl CompositeValue {
    pub fn new(parts: Vec<KeyValue>) -> Self {
        Self { value: None, parts }
    }

    pub fn is_materialized(&self) -> bool {
        self.value.is_some()
    }
}

/// Tagged variant scalar over `{int32, int64, double, string, composite}`.
#[derive(Debug, Clone, Default)]
pub enum KeyValue {
    #[default]
    Empty,
    Int(i32),
    Int64(i64),
    Double(f64),
    Str(String),
    Composite(CompositeValue),
}

impl KeyValue {
    /// Build a transient composite from child values.
    pub fn composite(parts: Vec<KeyValue>) -> Self {
        KeyValue::Composite(CompositeValue::new(parts))
    }

    pub fn value_type(&self) -> KeyValueType {
        match self {
            KeyValue::Empty => KeyValueType::Empty,
            KeyValue::Int(_) => KeyValueType::Int,
            KeyValue::Int64(_) => KeyValueType::Int64,
            KeyValue::Double(_) => KeyValueType::Double,
            KeyValue::Str(_) => KeyValueType::Str,
            KeyValue::Composite(_) => KeyValueType::Composite,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            KeyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match self {
            KeyValue::Int(v) => Some(*v as i64),
            KeyValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value; strings parse their leading number.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            KeyValue::Int(v) => Some(*v as f64),
            KeyValue::Int64(v) => Some(*v as f64),
            KeyValue::Double(v) => Some(*v),
            KeyValue::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// In-place lossy-tolerant cast between scalar types.
    ///
    /// Idempotent: converting to the current type is a no-op. Casts to or
    /// from composites, and unparseable strings, are logic errors.
    pub fn convert(&mut self, target: KeyValueType) -> Result<()> {
        if self.value_type() == target {
            return Ok(());
        }
        let converted = match (&*self, target) {
            (KeyValue::Int(v), KeyValueType::Int64) => KeyValue::Int64(*v as i64),
            (KeyValue::Int(v), KeyValueType::Double) => KeyValue::Double(*v as f64),
            (KeyValue::Int(v), KeyValueType::Str) => KeyValue::Str(v.to_string()),
            (KeyValue::Int64(v), KeyValueType::Int) => KeyValue::Int(*v as i32),
            (KeyValue::Int64(v), KeyValueType::Double) => KeyValue::Double(*v as f64),
            (KeyValue::Int64(v), KeyValueType::Str) => KeyValue::Str(v.to_string()),
            (KeyValue::Double(v), KeyValueType::Int) => KeyValue::Int(*v as i32),
            (KeyValue::Double(v), KeyValueType::Int64) => KeyValue::Int64(*v as i64),
            (KeyValue::Double(v), KeyValueType::Str) => KeyValue::Str(v.to_string()),
            (KeyValue::Str(s), KeyValueType::Int) => KeyValue::Int(parse_num(s)? as i32),
            (KeyValue::Str(s), KeyValueType::Int64) => KeyValue::Int64(parse_num(s)? as i64),
            (KeyValue::Str(s), KeyValueType::Double) => KeyValue::Double(parse_num(s)?),
            (from, to) => {
                return Err(Error::logic(format!(
                    "can't convert value from type '{}' to type '{}'",
                    from.value_type().name(),
                    to.name()
                )))
            }
        };
        *self = converted;
        Ok(())
    }

    /// Materialize a transient composite into an owned payload tuple laid
    /// out under `fields`. Idempotent once materialized.
    ///
    /// The child count must match the composite arity; members addressed by
    /// JSON path are not representable in a payload tuple and are rejected.
    pub fn convert_to_composite(
        &mut self,
        payload_type: &PayloadType,
        fields: &FieldsSet,
    ) -> Result<()> {
        let composite = match self {
            KeyValue::Composite(c) => c,
            other => {
                return Err(Error::logic(format!(
                    "can't convert '{}' value to composite",
                    other.value_type().name()
                )))
            }
        };
        if composite.is_materialized() {
            return Ok(());
        }
        if composite.parts.len() != fields.len() {
            return Err(Error::logic(format!(
                "invalid count of arguments for composite index, expected {}, got {}",
                fields.len(),
                composite.parts.len()
            )));
        }
        if fields.has_tags_paths() {
            return Err(Error::conflict(
                "composite indexes over json-path fields are not supported",
            ));
        }

        let mut value = PayloadValue::alloc(payload_type.num_fields());
        for (field, part) in fields.fields().iter().zip(composite.parts.drain(..)) {
            value.set(*field, vec![part]);
        }
        composite.value = Some(value);
        Ok(())
    }

    /// Total ordering under the given collation. Mixed numeric types
    /// compare as doubles; unrelated types order by type tag.
    pub fn cmp_collated(&self, other: &KeyValue, collate: &CollateOpts) -> Ordering {
        match (self, other) {
            (KeyValue::Str(a), KeyValue::Str(b)) => collate_cmp_str(a, b, collate.mode),
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Int64(a), KeyValue::Int64(b)) => a.cmp(b),
            (KeyValue::Double(a), KeyValue::Double(b)) => a.total_cmp(b),
            (KeyValue::Composite(a), KeyValue::Composite(b)) => cmp_composite(a, b),
            (a, b) => {
                // Only genuinely numeric variants mix; strings keep their
                // own ordering so equality stays consistent with hashing.
                let numeric = |v: &KeyValue| {
                    matches!(v, KeyValue::Int(_) | KeyValue::Int64(_) | KeyValue::Double(_))
                };
                if numeric(a) && numeric(b) {
                    let x = a.as_double().unwrap_or(0.0);
                    let y = b.as_double().unwrap_or(0.0);
                    x.total_cmp(&y)
                } else {
                    type_rank(a).cmp(&type_rank(b))
                }
            }
        }
    }
}

fn parse_num(s: &str) -> Result<f64> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| Error::logic(format!("can't convert '{s}' to number")))
}

fn type_rank(v: &KeyValue) -> u8 {
    match v {
        KeyValue::Empty => 0,
        KeyValue::Int(_) => 1,
        KeyValue::Int64(_) => 2,
        KeyValue::Double(_) => 3,
        KeyValue::Str(_) => 4,
        KeyValue::Composite(_) => 5,
    }
}

fn cmp_composite(a: &CompositeValue, b: &CompositeValue) -> Ordering {
    match (&a.value, &b.value) {
        // Materialized composites compare over the laid-out tuple.
        (Some(x), Some(y)) => x.cmp_all_fields(y),
        _ => {
            let common = a.parts.len().min(b.parts.len());
            for i in 0..common {
                let ord = a.parts[i].cmp(&b.parts[i]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.parts.len().cmp(&b.parts.len())
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_collated(other, &CollateOpts::default())
    }
}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Numeric variants share a rank and hash through their double
        // view, keeping Hash consistent with the cross-type equality of
        // `cmp_collated`.
        match self {
            KeyValue::Empty => 0u8.hash(state),
            KeyValue::Int(_) | KeyValue::Int64(_) | KeyValue::Double(_) => {
                1u8.hash(state);
                self.as_double().unwrap_or(0.0).to_bits().hash(state);
            }
            KeyValue::Str(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            KeyValue::Composite(c) => {
                5u8.hash(state);
                if let Some(value) = &c.value {
                    value.hash_all_fields(state);
                } else {
                    c.parts.hash(state);
                }
            }
        }
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int(v)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int64(v)
    }
}

impl From<f64> for KeyValue {
    fn from(v: f64) -> Self {
        KeyValue::Double(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Str(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Str(v)
    }
}

/// Compare two strings under a collation mode.
pub fn collate_cmp_str(a: &str, b: &str, mode: CollateMode) -> Ordering {
    match mode {
        CollateMode::None => a.cmp(b),
        CollateMode::AsciiCi => a
            .bytes()
            .map(|c| c.to_ascii_lowercase())
            .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
        CollateMode::Utf8Ci => a.to_lowercase().cmp(&b.to_lowercase()),
        CollateMode::Numeric => leading_number(a)
            .total_cmp(&leading_number(b))
            .then_with(|| a.cmp(b)),
    }
}

fn leading_number(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = 0;
    let bytes = s.as_bytes();
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    s[..end].parse::<f64>().unwrap_or(0.0)
}

/// Map a double to bits whose unsigned order matches numeric order.
pub fn f64_sortable_bits(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & 0x8000_0000_0000_0000 != 0 {
        !bits
    } else {
        bits ^ 0x8000_0000_0000_0000
    }
}

/// Hashable, orderable posting-map key.
///
/// Construction folds the collation into the stored representation so the
/// derived `Ord`/`Hash` match collated semantics: CI modes lowercase,
/// numeric collation leads with sortable float bits, composites are kept
/// as order-preserving encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Int(i32),
    Int64(i64),
    Double(u64),
    Str(String),
    NumericStr(u64, String),
    Composite(Vec<u8>),
}

impl IndexKey {
    /// Project a scalar into key form under the index collation.
    ///
    /// `fields` is consulted only for composite values, whose key is the
    /// order-preserving encoding of the member tuple.
    pub fn from_value(
        value: &KeyValue,
        collate: &CollateOpts,
        fields: &FieldsSet,
    ) -> Result<IndexKey> {
        match value {
            KeyValue::Int(v) => Ok(IndexKey::Int(*v)),
            KeyValue::Int64(v) => Ok(IndexKey::Int64(*v)),
            KeyValue::Double(v) => Ok(IndexKey::Double(f64_sortable_bits(*v))),
            KeyValue::Str(s) => Ok(match collate.mode {
                CollateMode::None => IndexKey::Str(s.clone()),
                CollateMode::AsciiCi => IndexKey::Str(s.to_ascii_lowercase()),
                CollateMode::Utf8Ci => IndexKey::Str(s.to_lowercase()),
                CollateMode::Numeric => {
                    IndexKey::NumericStr(f64_sortable_bits(leading_number(s)), s.clone())
                }
            }),
            KeyValue::Composite(c) => {
                let value = c.value.as_ref().ok_or_else(|| {
                    Error::logic("composite value was not materialized before indexing")
                })?;
                Ok(IndexKey::Composite(value.encode_key(fields)))
            }
            KeyValue::Empty => Err(Error::logic("empty value can't be used as an index key")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_fixed_point() {
        let mut v = KeyValue::Str("42".into());
        v.convert(KeyValueType::Int).unwrap();
        assert_eq!(v, KeyValue::Int(42));
        // Converting again to the same type is a fixed point.
        v.convert(KeyValueType::Int).unwrap();
        assert_eq!(v, KeyValue::Int(42));
    }

    #[test]
    fn test_convert_lossy() {
        let mut v = KeyValue::Double(3.7);
        v.convert(KeyValueType::Int).unwrap();
        assert_eq!(v, KeyValue::Int(3));
    }

    #[test]
    fn test_convert_bad_string() {
        let mut v = KeyValue::Str("not a number".into());
        assert!(v.convert(KeyValueType::Int).is_err());
    }

    #[test]
    fn test_collate_ascii_ci() {
        assert_eq!(
            collate_cmp_str("HELLO", "hello", CollateMode::AsciiCi),
            Ordering::Equal
        );
        assert_eq!(
            collate_cmp_str("abc", "ABD", CollateMode::AsciiCi),
            Ordering::Less
        );
    }

    #[test]
    fn test_collate_numeric() {
        assert_eq!(
            collate_cmp_str("10 apples", "9 apples", CollateMode::Numeric),
            Ordering::Greater
        );
        assert_eq!(
            collate_cmp_str("2", "10", CollateMode::Numeric),
            Ordering::Less
        );
    }

    #[test]
    fn test_sortable_double_bits() {
        let values = [-10.5, -1.0, -0.0, 0.0, 0.5, 1.0, 100.0];
        for pair in values.windows(2) {
            assert!(f64_sortable_bits(pair[0]) <= f64_sortable_bits(pair[1]));
        }
    }

    #[test]
    fn test_mixed_numeric_ordering() {
        assert_eq!(
            KeyValue::Int(5).cmp(&KeyValue::Int64(7)),
            Ordering::Less
        );
        assert_eq!(
            KeyValue::Double(2.0).cmp(&KeyValue::Int(2)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_composite_structural_equality() {
        let a = KeyValue::composite(vec![KeyValue::Int(1), KeyValue::Str("x".into())]);
        let b = KeyValue::composite(vec![KeyValue::Int(1), KeyValue::Str("x".into())]);
        let c = KeyValue::composite(vec![KeyValue::Int(2), KeyValue::Str("x".into())]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_index_key_case_folding() {
        let collate = CollateOpts::new(CollateMode::AsciiCi);
        let fields = FieldsSet::default();
        let a = IndexKey::from_value(&KeyValue::Str("Alice".into()), &collate, &fields).unwrap();
        let b = IndexKey::from_value(&KeyValue::Str("ALICE".into()), &collate, &fields).unwrap();
        assert_eq!(a, b);
    }
}
