//! Dynamic document value type.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::RecordId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Key of the tagged-reference wrapper object.
pub const RECORD_TAG: &str = "$rid";

/// A dynamic document value.
///
/// Rows, request payloads and cache entries are all values. Unlike plain
/// JSON, a record reference is its own variant, so business logic never has
/// to guess whether an object with `tb` and `id` fields is a reference.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Null value.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// Number (integer or float).
    Number(serde_json::Number),
    /// Text string.
    String(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Object with string keys, kept sorted.
    Object(BTreeMap<String, Value>),
    /// Reference to a record.
    Record(RecordId),
}

impl Value {
    /// Builds an object from key-value pairs.
    pub fn object<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Returns an empty object.
    pub fn empty_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Converts wire JSON into a value, decoding tagged references recursively.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if let Some(rid) = decode_tagged(&map) {
                    return Value::Record(rid);
                }
                Value::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Converts the value into wire JSON, encoding references as tagged objects.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Record(rid) => {
                let mut inner = serde_json::Map::new();
                inner.insert("tb".into(), serde_json::Value::String(rid.tb.clone()));
                inner.insert("id".into(), serde_json::Value::String(rid.id.clone()));
                let mut outer = serde_json::Map::new();
                outer.insert(RECORD_TAG.into(), serde_json::Value::Object(inner));
                serde_json::Value::Object(outer)
            }
        }
    }

    /// Parses wire JSON text.
    pub fn from_json_str(text: &str) -> ProtocolResult<Self> {
        let json: serde_json::Value = serde_json::from_str(text)?;
        Ok(Value::from_json(json))
    }

    /// Serializes to wire JSON text.
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    /// Returns a short name for the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Record(_) => "record",
        }
    }

    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the string slice if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean if this is a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the number as i64 if it is an integer that fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Returns the number as u64 if it is a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    /// Returns the number as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Returns the array if this is an array.
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the object map if this is an object.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the mutable object map if this is an object.
    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a field of an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Sets a field, turning the value into an object if it is not one.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        if !matches!(self, Value::Object(_)) {
            *self = Value::empty_object();
        }
        if let Value::Object(map) = self {
            map.insert(key.into(), value);
        }
    }

    /// Interprets the value as a record reference.
    ///
    /// Accepts [`Value::Record`] and `table:key` strings.
    pub fn as_record_id(&self) -> Option<RecordId> {
        match self {
            Value::Record(rid) => Some(rid.clone()),
            Value::String(s) => RecordId::parse(s),
            _ => None,
        }
    }

    /// Shallow-merges the fields of `patch` into this object.
    ///
    /// A non-object receiver is replaced by the patch. Null fields in the
    /// patch remove the field.
    pub fn merge(&mut self, patch: &Value) {
        let Value::Object(fields) = patch else {
            *self = patch.clone();
            return;
        };
        if !matches!(self, Value::Object(_)) {
            *self = Value::empty_object();
        }
        if let Value::Object(target) = self {
            for (key, value) in fields {
                if value.is_null() {
                    target.remove(key);
                } else {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Total ordering used for sorting rows.
    ///
    /// Values of different kinds order by kind; numbers compare numerically.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => {
                match (a.as_i64(), b.as_i64()) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    _ => {
                        let x = a.as_f64().unwrap_or(f64::NAN);
                        let y = b.as_f64().unwrap_or(f64::NAN);
                        x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                    }
                }
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Record(a), Value::Record(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => a.len().cmp(&b.len()),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Record(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }
}

/// Recognizes `{"$rid": {"tb": "...", "id": "..."}}`.
fn decode_tagged(map: &serde_json::Map<String, serde_json::Value>) -> Option<RecordId> {
    if map.len() != 1 {
        return None;
    }
    let inner = map.get(RECORD_TAG)?.as_object()?;
    let tb = inner.get("tb")?.as_str()?;
    let id = match inner.get("id")? {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(RecordId::new(tb, id))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number((n as u64).into())
    }
}

impl From<RecordId> for Value {
    fn from(rid: RecordId) -> Self {
        Value::Record(rid)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Converts any serializable type into a [`Value`].
pub fn to_value<T: Serialize>(item: &T) -> ProtocolResult<Value> {
    Ok(Value::from_json(serde_json::to_value(item)?))
}

/// Converts a [`Value`] into any deserializable type.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> ProtocolResult<T> {
    serde_json::from_value(value.to_json()).map_err(|e| ProtocolError::invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tagged_reference_decodes_recursively() {
        let text = r#"{"rows": [{"id": {"$rid": {"tb": "case", "id": "c1"}}, "n": 1}]}"#;
        let value = Value::from_json_str(text).unwrap();
        let rows = value.get("rows").and_then(Value::as_array).unwrap();
        assert_eq!(
            rows[0].get("id"),
            Some(&Value::Record(RecordId::new("case", "c1")))
        );
        assert_eq!(rows[0].get("n").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn tagged_reference_encodes_back() {
        let value = Value::object([("owner", Value::Record(RecordId::new("user", "u9")))]);
        let json = value.to_json();
        assert_eq!(json["owner"]["$rid"]["tb"], "user");
        assert_eq!(json["owner"]["$rid"]["id"], "u9");
    }

    #[test]
    fn plain_tb_id_objects_stay_objects() {
        // Only the explicit tag is a reference.
        let value = Value::from_json_str(r#"{"tb": "case", "id": "c1"}"#).unwrap();
        assert!(matches!(value, Value::Object(_)));

        let extra = Value::from_json_str(r#"{"$rid": {"tb": "a", "id": "b"}, "x": 1}"#).unwrap();
        assert!(matches!(extra, Value::Object(_)));
    }

    #[test]
    fn numeric_record_keys_are_accepted() {
        let value = Value::from_json_str(r#"{"$rid": {"tb": "invoice", "id": 7}}"#).unwrap();
        assert_eq!(value, Value::Record(RecordId::new("invoice", "7")));
    }

    #[test]
    fn merge_is_shallow_and_null_removes() {
        let mut row = Value::from_json_str(r#"{"a": 1, "b": {"x": 1}, "c": 3}"#).unwrap();
        let patch = Value::from_json_str(r#"{"b": {"y": 2}, "c": null, "d": 4}"#).unwrap();
        row.merge(&patch);
        assert_eq!(
            row,
            Value::from_json_str(r#"{"a": 1, "b": {"y": 2}, "d": 4}"#).unwrap()
        );
    }

    #[test]
    fn typed_roundtrip_through_value() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Cursor {
            table: String,
            owner: Value,
            retry_count: u32,
        }

        let cursor = Cursor {
            table: "case".into(),
            owner: Value::Record(RecordId::new("user", "u1")),
            retry_count: 2,
        };
        let value = to_value(&cursor).unwrap();
        assert_eq!(value.get("owner"), Some(&Value::Record(RecordId::new("user", "u1"))));
        let back: Cursor = from_value(&value).unwrap();
        assert_eq!(back, cursor);
    }

    #[test]
    fn compare_orders_numbers_numerically() {
        assert_eq!(Value::from(2i64).compare(&Value::from(10i64)), Ordering::Less);
        assert_eq!(Value::from("b").compare(&Value::from("a")), Ordering::Greater);
        assert_eq!(Value::Null.compare(&Value::from(1i64)), Ordering::Less);
    }

    proptest! {
        #[test]
        fn record_ids_survive_the_wire(tb in "[a-z_]{1,12}", id in "[a-zA-Z0-9-]{1,16}") {
            let value = Value::Array(vec![Value::Record(RecordId::new(tb.clone(), id.clone()))]);
            let decoded = Value::from_json_str(&value.to_json_string()).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
