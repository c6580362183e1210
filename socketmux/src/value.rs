//! The payload value tree.
//!
//! Event and acknowledgement payloads travel as ordered lists of [`Value`]
//! trees. A tree can hold opaque binary leaves anywhere: the default parser
//! lifts them out as attachment frames, the msgpack parser encodes them
//! inline. Conversion from and to user types goes through serde so any
//! `Serialize`/`DeserializeOwned` type can be carried.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::{DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize};
use serde_json::Number;

/// A structured payload value with optional binary leaves.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// An opaque binary blob. The parsers decide how it travels on the
    /// wire; it never appears inside serialized JSON.
    Binary(Bytes),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether any leaf of the tree is binary.
    pub fn has_binary(&self) -> bool {
        match self {
            Value::Binary(_) => true,
            Value::Array(values) => values.iter().any(Value::has_binary),
            Value::Object(map) => map.values().any(Value::has_binary),
            _ => false,
        }
    }

    /// The number of binary leaves in the tree.
    pub fn binary_count(&self) -> usize {
        match self {
            Value::Binary(_) => 1,
            Value::Array(values) => values.iter().map(Value::binary_count).sum(),
            Value::Object(map) => map.values().map(Value::binary_count).sum(),
            _ => 0,
        }
    }
}

/// Errors converting between user types and [`Value`] trees.
#[derive(thiserror::Error, Debug)]
pub enum ValueError {
    #[error("unrepresentable value: {0}")]
    Unrepresentable(String),
    #[error("error converting value: {0}")]
    Convert(String),
}

/// Encode any serializable type as a [`Value`] tree. `bytes::Bytes` fields
/// become binary leaves.
pub fn to_value<T: Serialize>(data: T) -> Result<Value, ValueError> {
    let raw = rmpv::ext::to_value(data).map_err(|e| ValueError::Unrepresentable(e.to_string()))?;
    from_rmpv(raw)
}

/// Decode a [`Value`] tree into any deserializable type.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, ValueError> {
    rmpv::ext::from_value(into_rmpv(value)).map_err(|e| ValueError::Convert(e.to_string()))
}

/// Encode user data as an argument list: a top-level array spreads into
/// multiple arguments, anything else is a single argument.
pub fn to_args<T: Serialize>(data: T) -> Result<Vec<Value>, ValueError> {
    match to_value(data)? {
        Value::Array(args) => Ok(args),
        value => Ok(vec![value]),
    }
}

/// Decode an argument list into user data. A single argument decodes as
/// itself, multiple arguments decode as an array.
pub fn from_args<T: DeserializeOwned>(mut args: Vec<Value>) -> Result<T, ValueError> {
    if args.len() == 1 {
        from_value(args.pop().unwrap())
    } else {
        from_value(Value::Array(args))
    }
}

fn from_rmpv(value: rmpv::Value) -> Result<Value, ValueError> {
    let res = match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(i) = i.as_i64() {
                Value::Number(i.into())
            } else if let Some(u) = i.as_u64() {
                Value::Number(u.into())
            } else {
                return Err(ValueError::Unrepresentable(format!("integer {i}")));
            }
        }
        rmpv::Value::F32(f) => float_value(f as f64)?,
        rmpv::Value::F64(f) => float_value(f)?,
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => Value::String(s),
            None => return Err(ValueError::Unrepresentable("non utf-8 string".to_string())),
        },
        rmpv::Value::Binary(b) => Value::Binary(Bytes::from(b)),
        rmpv::Value::Array(values) => Value::Array(
            values
                .into_iter()
                .map(from_rmpv)
                .collect::<Result<_, _>>()?,
        ),
        rmpv::Value::Map(entries) => {
            let mut map = BTreeMap::new();
            for (k, v) in entries {
                let key = match k {
                    rmpv::Value::String(s) => s
                        .into_str()
                        .ok_or_else(|| ValueError::Unrepresentable("non utf-8 key".to_string()))?,
                    k => return Err(ValueError::Unrepresentable(format!("map key {k}"))),
                };
                map.insert(key, from_rmpv(v)?);
            }
            Value::Object(map)
        }
        rmpv::Value::Ext(tag, _) => {
            return Err(ValueError::Unrepresentable(format!("ext type {tag}")))
        }
    };
    Ok(res)
}

fn into_rmpv(value: Value) -> rmpv::Value {
    match value {
        Value::Null => rmpv::Value::Nil,
        Value::Bool(b) => rmpv::Value::Boolean(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rmpv::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                rmpv::Value::from(u)
            } else {
                rmpv::Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => rmpv::Value::from(s),
        Value::Array(values) => rmpv::Value::Array(values.into_iter().map(into_rmpv).collect()),
        Value::Object(map) => rmpv::Value::Map(
            map.into_iter()
                .map(|(k, v)| (rmpv::Value::from(k), into_rmpv(v)))
                .collect(),
        ),
        Value::Binary(b) => rmpv::Value::Binary(b.to_vec()),
    }
}

fn float_value(f: f64) -> Result<Value, ValueError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ValueError::Unrepresentable(format!("non-finite float {f}")))
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for value in values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            Value::Binary(b) => serializer.serialize_bytes(b),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("any payload value")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E: serde::de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D: serde::Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
                Value::deserialize(d)
            }

            fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Value, E> {
                float_value(v).map_err(serde::de::Error::custom)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Value, E> {
                Ok(Value::String(v.to_string()))
            }

            fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Value, E> {
                Ok(Value::String(v))
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Value, E> {
                Ok(Value::Binary(Bytes::copy_from_slice(v)))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
                Ok(Value::Binary(Bytes::from(v)))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(value) = seq.next_element()? {
                    values.push(value);
                }
                Ok(Value::Array(values))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
                let mut map = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
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
    fn from(i: i64) -> Self {
        Value::Number(i.into())
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Number(i.into())
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::Number(u.into())
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(b))
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Value::Array(iter.into_iter().collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(values) => {
                Value::Array(values.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}
