//! Document handle used on the write path.
//!
//! An [`Item`] is a detached row under construction: field setters coerce
//! values to the schema types, and JSON documents split into fixed slots
//! (by the indexed json paths) plus the dynamic tail. The namespace
//! assigns the id on upsert.

use memdb_types::{Error, IdType, KeyValue, KeyValueType, PayloadType, PayloadValue, Result};

#[derive(Debug, Clone)]
pub struct Item {
    payload_type: PayloadType,
    value: PayloadValue,
    id: Option<IdType>,
}

impl Item {
    pub(crate) fn new(payload_type: PayloadType) -> Self {
        let value = PayloadValue::alloc(payload_type.num_fields());
        Self {
            payload_type,
            value,
            id: None,
        }
    }

    /// Id assigned by the last upsert, if any.
    pub fn id(&self) -> Option<IdType> {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: IdType) {
        self.id = Some(id);
    }

    pub fn payload_type(&self) -> &PayloadType {
        &self.payload_type
    }

    pub(crate) fn payload(&self) -> &PayloadValue {
        &self.value
    }

    pub(crate) fn payload_mut(&mut self) -> &mut PayloadValue {
        &mut self.value
    }

    /// Set a fixed field, coercing every value to the field type.
    pub fn set_field(&mut self, name: &str, values: Vec<KeyValue>) -> Result<()> {
        let idx = self
            .payload_type
            .field_index(name)
            .ok_or_else(|| Error::params(format!("unknown field '{name}'")))?;
        let field = self.payload_type.field(idx);
        if values.len() > 1 && !field.is_array {
            return Err(Error::params(format!(
                "field '{name}' is not an array field"
            )));
        }
        let key_type = field.key_type;
        let mut coerced = values;
        for value in &mut coerced {
            value.convert(key_type)?;
        }
        self.value.set(idx, coerced);
        Ok(())
    }

    pub fn get_field(&self, name: &str) -> Result<&[KeyValue]> {
        let idx = self
            .payload_type
            .field_index(name)
            .ok_or_else(|| Error::params(format!("unknown field '{name}'")))?;
        Ok(self.value.get(idx))
    }

    /// Fill the item from a JSON document. Keys matching an indexed json
    /// path land in fixed slots; everything else goes to the tail.
    pub fn from_json(&mut self, json: &str) -> Result<()> {
        let doc: serde_json::Value =
            serde_json::from_str(json).map_err(|e| Error::params(format!("bad json: {e}")))?;
        let serde_json::Value::Object(map) = doc else {
            return Err(Error::params("document root must be a json object"));
        };

        let mut tail = serde_json::Map::new();
        for (key, value) in map {
            let slot = self
                .payload_type
                .fields()
                .iter()
                .position(|f| f.json_paths.iter().any(|p| p == &key));
            match slot {
                Some(idx) => {
                    let field = self.payload_type.field(idx).clone();
                    let mut values = json_field_values(&value, field.key_type)?;
                    if values.len() > 1 && !field.is_array {
                        return Err(Error::params(format!(
                            "field '{}' is not an array field",
                            field.name
                        )));
                    }
                    for v in &mut values {
                        v.convert(field.key_type)?;
                    }
                    self.value.set(idx, values);
                }
                None => {
                    tail.insert(key, value);
                }
            }
        }
        self.value.set_tail(serde_json::Value::Object(tail));
        Ok(())
    }
}

pub(crate) fn json_field_values(
    value: &serde_json::Value,
    key_type: KeyValueType,
) -> Result<Vec<KeyValue>> {
    match value {
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.extend(json_field_values(item, key_type)?);
            }
            Ok(out)
        }
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Bool(b) => Ok(vec![KeyValue::Int(*b as i32)]),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(vec![KeyValue::Int64(i)])
            } else {
                Ok(vec![KeyValue::Double(n.as_f64().unwrap_or(0.0))])
            }
        }
        serde_json::Value::String(s) => Ok(vec![KeyValue::Str(s.clone())]),
        serde_json::Value::Object(_) => Err(Error::params(
            "nested objects are not allowed in indexed fields",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdb_types::PayloadFieldType;

    fn users_type() -> PayloadType {
        let mut pt = PayloadType::new("users");
        pt.add_field(PayloadFieldType::new("id", KeyValueType::Int)).unwrap();
        pt.add_field(PayloadFieldType::new("name", KeyValueType::Str)).unwrap();
        let mut tags = PayloadFieldType::new("tags", KeyValueType::Str);
        tags.is_array = true;
        pt.add_field(tags).unwrap();
        pt
    }

    #[test]
    fn test_set_field_coerces() {
        let mut item = Item::new(users_type());
        item.set_field("id", vec![KeyValue::Str("42".into())]).unwrap();
        assert_eq!(item.get_field("id").unwrap(), &[KeyValue::Int(42)]);
    }

    #[test]
    fn test_array_field_rules() {
        let mut item = Item::new(users_type());
        assert!(item
            .set_field("name", vec![KeyValue::Str("a".into()), KeyValue::Str("b".into())])
            .is_err());
        item.set_field(
            "tags",
            vec![KeyValue::Str("a".into()), KeyValue::Str("b".into())],
        )
        .unwrap();
        assert_eq!(item.get_field("tags").unwrap().len(), 2);
    }

    #[test]
    fn test_from_json_splits_tail() {
        let mut item = Item::new(users_type());
        item.from_json(r#"{"id": 1, "name": "ada", "note": "dynamic"}"#)
            .unwrap();
        assert_eq!(item.get_field("id").unwrap(), &[KeyValue::Int(1)]);
        assert_eq!(
            item.payload().tail()["note"],
            serde_json::json!("dynamic")
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut item = Item::new(users_type());
        assert!(item.set_field("missing", vec![KeyValue::Int(1)]).is_err());
    }
}
