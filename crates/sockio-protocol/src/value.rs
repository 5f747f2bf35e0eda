//! Structured message values.
//!
//! A [`Value`] is the tree carried in every packet payload. It mirrors the
//! JSON data model with one addition: [`Value::Binary`], an opaque byte buffer
//! that travels out of band as a separate binary frame.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Object member map. Key order carries no meaning on the wire.
pub type Map = BTreeMap<String, Value>;

/// Variant names, used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Double,
    String,
    Binary,
    Array,
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Double => "double",
            ValueKind::String => "string",
            ValueKind::Binary => "binary",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// Errors raised by typed accessors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// The value holds a different variant than the one requested.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: ValueKind,
        found: ValueKind,
    },

    /// The tree holds binary data, which JSON cannot carry.
    #[error("Binary data has no JSON representation")]
    Binary,
}

/// A message value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// NaN and the infinities have no JSON form and are written as `null`.
    Double(f64),
    String(String),
    Binary(Bytes),
    Array(Vec<Value>),
    Object(Map),
}

macro_rules! accessor {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $kind:ident, $ret:ty) => {
        $(#[$doc])*
        ///
        /// # Errors
        ///
        /// Returns [`ValueError::TypeMismatch`] for any other variant.
        pub fn $name(&self) -> Result<$ret, ValueError> {
            match self {
                Value::$variant(v) => Ok(v),
                other => Err(other.mismatch(ValueKind::$kind)),
            }
        }
    };
}

impl Value {
    /// Create an empty object.
    #[must_use]
    pub fn object() -> Self {
        Value::Object(Map::new())
    }

    /// Create an empty array.
    #[must_use]
    pub fn array() -> Self {
        Value::Array(Vec::new())
    }

    /// Create a binary value, copying from a slice.
    #[must_use]
    pub fn binary(data: impl AsRef<[u8]>) -> Self {
        Value::Binary(Bytes::copy_from_slice(data.as_ref()))
    }

    /// The variant held by this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Double(_) => ValueKind::Double,
            Value::String(_) => ValueKind::String,
            Value::Binary(_) => ValueKind::Binary,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn mismatch(&self, expected: ValueKind) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }

    /// Read a boolean.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::TypeMismatch`] for any other variant.
    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch(ValueKind::Bool)),
        }
    }

    /// Read an integer.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::TypeMismatch`] for any other variant,
    /// including `Double`.
    pub fn as_i64(&self) -> Result<i64, ValueError> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(other.mismatch(ValueKind::Int)),
        }
    }

    /// Read a floating point number. Integers are widened.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::TypeMismatch`] for non-numeric variants.
    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self {
            Value::Double(d) => Ok(*d),
            Value::Int(i) => Ok(*i as f64),
            other => Err(other.mismatch(ValueKind::Double)),
        }
    }

    /// Read a string slice.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::TypeMismatch`] for any other variant.
    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Value::String(s) => Ok(s.as_str()),
            other => Err(other.mismatch(ValueKind::String)),
        }
    }

    accessor!(
        /// Read a binary buffer.
        as_binary, Binary, Binary, &Bytes
    );
    accessor!(
        /// Read array elements.
        as_array, Array, Array, &Vec<Value>
    );
    accessor!(
        /// Read object members.
        as_object, Object, Object, &Map
    );

    /// Mutable access to array elements.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::TypeMismatch`] for any other variant.
    pub fn as_array_mut(&mut self) -> Result<&mut Vec<Value>, ValueError> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(other.mismatch(ValueKind::Array)),
        }
    }

    /// Mutable access to object members.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::TypeMismatch`] for any other variant.
    pub fn as_object_mut(&mut self) -> Result<&mut Map, ValueError> {
        match self {
            Value::Object(map) => Ok(map),
            other => Err(other.mismatch(ValueKind::Object)),
        }
    }

    /// Look up an object member. Returns `None` for non-objects.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Number of binary buffers in this tree.
    #[must_use]
    pub fn binary_count(&self) -> usize {
        match self {
            Value::Binary(_) => 1,
            Value::Array(items) => items.iter().map(Value::binary_count).sum(),
            Value::Object(map) => map.values().map(Value::binary_count).sum(),
            _ => 0,
        }
    }

    /// Convert to JSON, letting `binary` pick what each buffer becomes.
    /// Buffers are visited in pre-order, the order attachments are numbered.
    pub fn to_json_with<F>(&self, binary: &mut F) -> serde_json::Value
    where
        F: FnMut(&Bytes) -> serde_json::Value,
    {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Double(d) => match serde_json::Number::from_f64(*d) {
                Some(n) => serde_json::Value::Number(n),
                None => {
                    warn!(value = %d, "Non-finite double written as null");
                    serde_json::Value::Null
                }
            },
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(data) => binary(data),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json_with(binary)).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_with(binary)))
                    .collect(),
            ),
        }
    }
}

impl TryFrom<&Value> for serde_json::Value {
    type Error = ValueError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        if value.binary_count() > 0 {
            return Err(ValueError::Binary);
        }
        Ok(value.to_json_with(&mut |_| serde_json::Value::Null))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
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

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        assert_eq!(Value::from(true).as_bool(), Ok(true));
        assert_eq!(Value::from(7i64).as_i64(), Ok(7));
        assert_eq!(Value::from("hi").as_str(), Ok("hi"));
        assert_eq!(Value::binary(b"ab").as_binary().map(|b| b.len()), Ok(2));
    }

    #[test]
    fn test_int_widens_to_double() {
        assert_eq!(Value::Int(3).as_f64(), Ok(3.0));
        assert_eq!(Value::Double(2.5).as_f64(), Ok(2.5));
    }

    #[test]
    fn test_double_does_not_narrow_to_int() {
        assert_eq!(
            Value::Double(2.0).as_i64(),
            Err(ValueError::TypeMismatch {
                expected: ValueKind::Int,
                found: ValueKind::Double,
            })
        );
    }

    #[test]
    fn test_wrong_accessor_is_error() {
        let v = Value::from("text");
        assert!(v.as_bool().is_err());
        assert!(v.as_array().is_err());
        assert!(Value::Null.as_object().is_err());
        let err = v.as_i64().unwrap_err();
        assert_eq!(err.to_string(), "Type mismatch: expected int, found string");
    }

    #[test]
    fn test_containers_are_mutable() {
        let mut arr = Value::array();
        arr.as_array_mut().unwrap().push(Value::from(1i64));
        assert_eq!(arr.as_array().unwrap().len(), 1);

        let mut obj = Value::object();
        obj.as_object_mut()
            .unwrap()
            .insert("k".into(), Value::from("v"));
        assert_eq!(obj.get("k"), Some(&Value::from("v")));
        assert_eq!(obj.get("missing"), None);
    }

    #[test]
    fn test_binary_count_walks_tree() {
        let mut map = Map::new();
        map.insert("a".into(), Value::binary(b"1"));
        map.insert(
            "b".into(),
            Value::Array(vec![Value::binary(b"2"), Value::Null]),
        );
        let v = Value::Array(vec![Value::binary(b"0"), Value::Object(map)]);
        assert_eq!(v.binary_count(), 3);
    }

    #[test]
    fn test_from_json() {
        let json = serde_json::json!({"n": 1, "f": 1.5, "s": "x", "l": [null, true]});
        let v = Value::from(json);
        assert_eq!(v.get("n"), Some(&Value::Int(1)));
        assert_eq!(v.get("f"), Some(&Value::Double(1.5)));
        assert_eq!(v.get("s"), Some(&Value::from("x")));
        assert_eq!(
            v.get("l"),
            Some(&Value::Array(vec![Value::Null, Value::Bool(true)]))
        );
    }

    #[test]
    fn test_to_json_and_back() {
        let json = serde_json::json!({"id": 7, "tags": ["a", "b"], "score": 0.25, "ok": false});
        let value = Value::from(json.clone());
        assert_eq!(serde_json::Value::try_from(&value), Ok(json));
    }

    #[test]
    fn test_to_json_rejects_binary() {
        let value = Value::Array(vec![Value::from("f"), Value::binary(b"xyz")]);
        assert_eq!(serde_json::Value::try_from(&value), Err(ValueError::Binary));
    }

    #[test]
    fn test_to_json_with_visits_binary_in_order() {
        let mut map = Map::new();
        map.insert("a".into(), Value::binary(b"1"));
        let value = Value::Array(vec![Value::binary(b"0"), Value::Object(map)]);

        let mut seen = Vec::new();
        let json = value.to_json_with(&mut |data| {
            seen.push(data.clone());
            serde_json::Value::from(seen.len() - 1)
        });
        assert_eq!(json, serde_json::json!([0, {"a": 1}]));
        assert_eq!(seen, vec![Bytes::from_static(b"0"), Bytes::from_static(b"1")]);
    }

    #[test]
    fn test_non_finite_double_becomes_null() {
        assert_eq!(
            serde_json::Value::try_from(&Value::Double(f64::NAN)),
            Ok(serde_json::Value::Null)
        );
    }
}
