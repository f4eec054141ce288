//! Fixed-schema payload layout.
//!
//! A document is a tuple of typed field slots described by a
//! [`PayloadType`], plus an opaque JSON tail carrying dynamic fields that
//! are not part of the fixed schema. Rows are shared as cheap [`Arc`]
//! clones ([`PayloadValue`]); mutation is copy-on-write, so iterators and
//! caches holding a row keep observing the snapshot they captured.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::defs::CollateOpts;
use crate::error::{Error, Result};
use crate::value::{f64_sortable_bits, KeyValue, KeyValueType};

/// Dense document id: an index into the namespace item vector.
pub type IdType = usize;

/// A tag path into the dynamic JSON tail (sequence of tag ids registered
/// with the namespace tagsmatcher).
pub type TagsPath = Vec<u32>;

/// Description of one fixed field slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadFieldType {
    pub name: String,
    pub key_type: KeyValueType,
    pub is_array: bool,
    /// JSON paths this slot is filled from when parsing documents.
    pub json_paths: Vec<String>,
}

impl PayloadFieldType {
    pub fn new(name: impl Into<String>, key_type: KeyValueType) -> Self {
        let name = name.into();
        Self {
            json_paths: vec![name.clone()],
            name,
            key_type,
            is_array: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PayloadTypeInner {
    name: String,
    fields: Vec<PayloadFieldType>,
    by_name: HashMap<String, usize>,
}

/// Schema of the fixed tuple part of a document. Cheap to clone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadType(Arc<PayloadTypeInner>);

impl PayloadType {
    pub fn new(name: impl Into<String>) -> Self {
        PayloadType(Arc::new(PayloadTypeInner {
            name: name.into(),
            ..Default::default()
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn num_fields(&self) -> usize {
        self.0.fields.len()
    }

    pub fn field(&self, idx: usize) -> &PayloadFieldType {
        &self.0.fields[idx]
    }

    pub fn fields(&self) -> &[PayloadFieldType] {
        &self.0.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.0.by_name.get(name).copied()
    }

    /// Append a field slot. Names must be unique.
    pub fn add_field(&mut self, field: PayloadFieldType) -> Result<usize> {
        let inner = Arc::make_mut(&mut self.0);
        if inner.by_name.contains_key(&field.name) {
            return Err(Error::params(format!(
                "field '{}' is already defined in payload type '{}'",
                field.name, inner.name
            )));
        }
        let idx = inner.fields.len();
        inner.by_name.insert(field.name.clone(), idx);
        inner.fields.push(field);
        Ok(idx)
    }
}

/// Ordered set of dense field indices and/or tag paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldsSet {
    fields: Vec<usize>,
    tags_paths: Vec<TagsPath>,
}

impl FieldsSet {
    pub fn from_fields(fields: Vec<usize>) -> Self {
        Self {
            fields,
            tags_paths: Vec::new(),
        }
    }

    pub fn push(&mut self, field: usize) {
        if !self.fields.contains(&field) {
            self.fields.push(field);
        }
    }

    pub fn push_tags(&mut self, path: TagsPath) {
        self.tags_paths.push(path);
    }

    pub fn fields(&self) -> &[usize] {
        &self.fields
    }

    pub fn tags_paths(&self) -> &[TagsPath] {
        &self.tags_paths
    }

    pub fn has_tags_paths(&self) -> bool {
        !self.tags_paths.is_empty()
    }

    /// Total member count (dense fields plus tag paths).
    pub fn len(&self) -> usize {
        self.fields.len() + self.tags_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_field(&self, field: usize) -> bool {
        self.fields.contains(&field)
    }

    /// True when every member of `other` is a member of `self`.
    pub fn contains(&self, other: &FieldsSet) -> bool {
        other.fields.iter().all(|f| self.fields.contains(f))
            && other.tags_paths.iter().all(|t| self.tags_paths.contains(t))
    }

    pub fn clear(&mut self) {
        self.fields.clear();
        self.tags_paths.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PayloadData {
    fields: Vec<Vec<KeyValue>>,
    tail: serde_json::Value,
}

/// One document row: versioned, copy-on-write shared tuple data.
///
/// A default-constructed value is a free slot; free slots sit in the item
/// vector for ids on the namespace free list and must never surface in a
/// query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadValue {
    version: u64,
    data: Option<Arc<PayloadData>>,
}

impl PayloadValue {
    /// Allocate a row with `num_fields` empty slots.
    pub fn alloc(num_fields: usize) -> Self {
        Self {
            version: 0,
            data: Some(Arc::new(PayloadData {
                fields: vec![Vec::new(); num_fields],
                tail: serde_json::Value::Null,
            })),
        }
    }

    pub fn is_free(&self) -> bool {
        self.data.is_none()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Values of a field slot; empty for free rows and out-of-range slots.
    pub fn get(&self, field: usize) -> &[KeyValue] {
        static EMPTY: &[KeyValue] = &[];
        self.data
            .as_ref()
            .and_then(|d| d.fields.get(field))
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    /// Replace the values of a field slot (copy-on-write).
    pub fn set(&mut self, field: usize, values: Vec<KeyValue>) {
        if let Some(data) = self.data.as_mut() {
            let data = Arc::make_mut(data);
            if field < data.fields.len() {
                data.fields[field] = values;
            }
        }
    }

    /// Grow the tuple to `num_fields` slots (schema change).
    pub fn resize_fields(&mut self, num_fields: usize) {
        if let Some(data) = self.data.as_mut() {
            Arc::make_mut(data).fields.resize(num_fields, Vec::new());
        }
    }

    pub fn tail(&self) -> &serde_json::Value {
        static NULL: serde_json::Value = serde_json::Value::Null;
        self.data.as_ref().map(|d| &d.tail).unwrap_or(&NULL)
    }

    pub fn set_tail(&mut self, tail: serde_json::Value) {
        if let Some(data) = self.data.as_mut() {
            Arc::make_mut(data).tail = tail;
        }
    }

    /// Compare two rows over a set of dense fields under a collation.
    /// Only the first value of each slot participates, matching how
    /// single-value sort fields behave.
    pub fn compare(&self, other: &PayloadValue, fields: &FieldsSet, collate: &CollateOpts) -> Ordering {
        for &field in fields.fields() {
            let lhs = self.get(field).first().cloned().unwrap_or_default();
            let rhs = other.get(field).first().cloned().unwrap_or_default();
            let ord = lhs.cmp_collated(&rhs, collate);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Compare every slot of two rows (used by materialized composites).
    pub fn cmp_all_fields(&self, other: &PayloadValue) -> Ordering {
        match (&self.data, &other.data) {
            (Some(a), Some(b)) => a.fields.cmp(&b.fields),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        }
    }

    /// Hash every slot of the row (used by materialized composites).
    pub fn hash_all_fields<H: Hasher>(&self, state: &mut H) {
        if let Some(data) = &self.data {
            data.fields.hash(state);
        }
    }

    /// Order-preserving encoding of the row restricted to `fields`, in the
    /// field-set order. Byte-wise comparison of two encodings matches the
    /// tuple comparison, which makes this usable as a composite index key.
    pub fn encode_key(&self, fields: &FieldsSet) -> Vec<u8> {
        let mut buf = Vec::new();
        for &field in fields.fields() {
            let values = self.get(field);
            for value in values {
                encode_value_sortable(value, &mut buf);
            }
            buf.push(0x00);
        }
        buf
    }

    /// Serialize the row for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| Error::logic("can't serialize a free payload slot"))?;
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(data.fields.len() as u32).to_le_bytes());
        for slot in &data.fields {
            buf.extend_from_slice(&(slot.len() as u32).to_le_bytes());
            for value in slot {
                encode_value(value, &mut buf)?;
            }
        }
        let tail = serde_json::to_vec(&data.tail).map_err(Error::storage)?;
        buf.extend_from_slice(&(tail.len() as u32).to_le_bytes());
        buf.extend_from_slice(&tail);
        Ok(buf)
    }

    /// Deserialize a row previously written by [`PayloadValue::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut rd = Reader::new(bytes);
        let version = u64::from_le_bytes(rd.take(8)?.try_into().unwrap());
        let num_fields = rd.read_u32()? as usize;
        let mut fields = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            let count = rd.read_u32()? as usize;
            let mut slot = Vec::with_capacity(count);
            for _ in 0..count {
                slot.push(decode_value(&mut rd)?);
            }
            fields.push(slot);
        }
        let tail_len = rd.read_u32()? as usize;
        let tail = serde_json::from_slice(rd.take(tail_len)?).map_err(Error::storage)?;
        Ok(Self {
            version,
            data: Some(Arc::new(PayloadData { fields, tail })),
        })
    }
}

fn encode_value(value: &KeyValue, buf: &mut Vec<u8>) -> Result<()> {
    match value {
        KeyValue::Empty => buf.push(0x00),
        KeyValue::Int(v) => {
            buf.push(0x01);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        KeyValue::Int64(v) => {
            buf.push(0x02);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        KeyValue::Double(v) => {
            buf.push(0x03);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        KeyValue::Str(s) => {
            buf.push(0x04);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        KeyValue::Composite(_) => {
            return Err(Error::logic("composite values are not stored in payload slots"))
        }
    }
    Ok(())
}

fn decode_value(rd: &mut Reader<'_>) -> Result<KeyValue> {
    let tag = rd.take(1)?[0];
    Ok(match tag {
        0x00 => KeyValue::Empty,
        0x01 => KeyValue::Int(i32::from_le_bytes(rd.take(4)?.try_into().unwrap())),
        0x02 => KeyValue::Int64(i64::from_le_bytes(rd.take(8)?.try_into().unwrap())),
        0x03 => KeyValue::Double(f64::from_le_bytes(rd.take(8)?.try_into().unwrap())),
        0x04 => {
            let len = rd.read_u32()? as usize;
            let bytes = rd.take(len)?;
            KeyValue::Str(
                std::str::from_utf8(bytes)
                    .map_err(|_| Error::not_valid("stored string is not valid utf-8"))?
                    .to_string(),
            )
        }
        other => return Err(Error::not_valid(format!("unknown value tag {other:#x}"))),
    })
}

/// Encode a scalar so that byte order matches value order: integers with
/// the sign bit flipped, floats as sortable bit patterns, strings with a
/// terminator.
fn encode_value_sortable(value: &KeyValue, buf: &mut Vec<u8>) {
    match value {
        KeyValue::Empty => buf.push(0x00),
        KeyValue::Int(v) => {
            buf.push(0x01);
            buf.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes());
        }
        KeyValue::Int64(v) => {
            buf.push(0x02);
            buf.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
        }
        KeyValue::Double(v) => {
            buf.push(0x03);
            buf.extend_from_slice(&f64_sortable_bits(*v).to_be_bytes());
        }
        KeyValue::Str(s) => {
            buf.push(0x04);
            buf.extend_from_slice(s.as_bytes());
            buf.push(0x00);
        }
        KeyValue::Composite(c) => {
            // Nested composites never reach index keys; encode parts for
            // completeness.
            buf.push(0x05);
            for part in &c.parts {
                encode_value_sortable(part, buf);
            }
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::not_valid("truncated payload record"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::CollateMode;

    fn sample_type() -> PayloadType {
        let mut pt = PayloadType::new("users");
        pt.add_field(PayloadFieldType::new("id", KeyValueType::Int)).unwrap();
        pt.add_field(PayloadFieldType::new("name", KeyValueType::Str)).unwrap();
        pt.add_field(PayloadFieldType::new("age", KeyValueType::Int)).unwrap();
        pt
    }

    #[test]
    fn test_field_lookup() {
        let pt = sample_type();
        assert_eq!(pt.field_index("name"), Some(1));
        assert_eq!(pt.field_index("missing"), None);
        assert_eq!(pt.num_fields(), 3);
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let mut pt = sample_type();
        assert!(pt
            .add_field(PayloadFieldType::new("id", KeyValueType::Int))
            .is_err());
    }

    #[test]
    fn test_free_slot() {
        let pv = PayloadValue::default();
        assert!(pv.is_free());
        assert!(pv.get(0).is_empty());
    }

    #[test]
    fn test_copy_on_write() {
        let mut a = PayloadValue::alloc(2);
        a.set(0, vec![KeyValue::Int(1)]);
        let snapshot = a.clone();
        a.set(0, vec![KeyValue::Int(2)]);
        // The clone keeps observing the old value.
        assert_eq!(snapshot.get(0), &[KeyValue::Int(1)]);
        assert_eq!(a.get(0), &[KeyValue::Int(2)]);
    }

    #[test]
    fn test_compare_with_collate() {
        let mut a = PayloadValue::alloc(1);
        a.set(0, vec![KeyValue::Str("ALICE".into())]);
        let mut b = PayloadValue::alloc(1);
        b.set(0, vec![KeyValue::Str("alice".into())]);

        let fields = FieldsSet::from_fields(vec![0]);
        let ci = CollateOpts::new(CollateMode::AsciiCi);
        assert_eq!(a.compare(&b, &fields, &ci), Ordering::Equal);
        assert_ne!(a.compare(&b, &fields, &CollateOpts::default()), Ordering::Equal);
    }

    #[test]
    fn test_encode_key_order() {
        let fields = FieldsSet::from_fields(vec![0]);
        let mut rows: Vec<PayloadValue> = [-5i32, -1, 0, 3, 100]
            .iter()
            .map(|v| {
                let mut pv = PayloadValue::alloc(1);
                pv.set(0, vec![KeyValue::Int(*v)]);
                pv
            })
            .collect();
        rows.sort_by(|a, b| a.encode_key(&fields).cmp(&b.encode_key(&fields)));
        let decoded: Vec<i32> = rows.iter().map(|r| r.get(0)[0].as_int().unwrap()).collect();
        assert_eq!(decoded, vec![-5, -1, 0, 3, 100]);
    }

    #[test]
    fn test_codec_round_trip() {
        let mut pv = PayloadValue::alloc(3);
        pv.set(0, vec![KeyValue::Int(7)]);
        pv.set(1, vec![KeyValue::Str("hello".into())]);
        pv.set(2, vec![KeyValue::Int(1), KeyValue::Int(2)]);
        pv.set_version(42);
        pv.set_tail(serde_json::json!({"extra": true}));

        let bytes = pv.to_bytes().unwrap();
        let back = PayloadValue::from_bytes(&bytes).unwrap();
        assert_eq!(back, pv);
        assert_eq!(back.version(), 42);
        assert_eq!(back.tail()["extra"], serde_json::json!(true));
    }

    #[test]
    fn test_fields_set_contains() {
        let mut a = FieldsSet::default();
        a.push(1);
        a.push(2);
        a.push(3);
        let b = FieldsSet::from_fields(vec![2, 1]);
        assert!(a.contains(&b));
        assert!(!b.contains(&a));
    }
}
