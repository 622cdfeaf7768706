//! Payload value model with timestamp annotation.
//!
//! JSON has no native timestamp type, so a naive round-trip turns every
//! `DateTime` into a plain string. The annotation codec rewrites timestamps
//! as `"<RFC 3339>@@@D"` on the way out and recovers them on the way in.
//! Strings that merely look like ISO-8601 never gain the suffix and so
//! always survive as strings, which keeps signed digests stable across the
//! round-trip.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Suffix appended to annotated timestamp strings.
const DATE_SUFFIX: &str = "@@@D";

/// A payload value.
///
/// This is the currency of every payload (`p`) in the system: a JSON tree
/// extended with a first-class timestamp variant. Its `Serialize` and
/// `Deserialize` impls apply the annotation codec, so
/// `serde_json::to_string` / `from_str` produce and consume the wire form
/// directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    DateTime(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Annotate this value into a plain JSON tree.
    ///
    /// Timestamps become `"<RFC 3339>@@@D"` strings; everything else maps
    /// structurally. Millisecond precision, matching the wire text form.
    pub fn annotate(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => serde_json::Value::String(format!(
                "{}{DATE_SUFFIX}",
                dt.to_rfc3339_opts(SecondsFormat::Millis, true)
            )),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::annotate).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.annotate()))
                    .collect(),
            ),
        }
    }

    /// Reverse [`Value::annotate`]: recover timestamps from suffixed strings.
    ///
    /// Only strings of the form `<stem>@@@D` with a non-empty, RFC 3339
    /// parseable stem become timestamps; anything else passes through
    /// unchanged.
    pub fn deannotate(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => match parse_annotated_date(&s) {
                Some(dt) => Value::DateTime(dt),
                None => Value::String(s),
            },
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::deannotate).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::deannotate(v)))
                    .collect(),
            ),
        }
    }

    /// The annotated JSON text of this value.
    ///
    /// This is the exact byte sequence signing digests are computed over, so
    /// it must be deterministic; object keys are sorted by construction
    /// (`BTreeMap`).
    pub fn to_wire_text(&self) -> String {
        self.annotate().to_string()
    }

    /// Parse a value from annotated JSON text.
    pub fn from_wire_text(text: &str) -> Result<Value, serde_json::Error> {
        Ok(Value::deannotate(serde_json::from_str(text)?))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a key on an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }
}

fn parse_annotated_date(s: &str) -> Option<DateTime<Utc>> {
    let stem = s.strip_suffix(DATE_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(stem)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.annotate().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Value::deannotate(serde_json::Value::deserialize(
            deserializer,
        )?))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire_text())
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

/// Convert an application type into a [`Value`].
///
/// Timestamps serialized as plain RFC 3339 strings by the application's own
/// serde impls stay strings here; use [`Value::DateTime`] directly (or
/// chrono's serde integration on the receiving side) when the timestamp type
/// must survive the wire.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, serde_json::Error> {
    Ok(plain_to_value(serde_json::to_value(value)?))
}

/// Convert a [`Value`] back into an application type.
///
/// Timestamp variants are lowered to plain RFC 3339 strings first so chrono
/// (and string) fields deserialize naturally.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(value_to_plain(value))
}

fn plain_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Number(n),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(plain_to_value).collect())
        }
        serde_json::Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, plain_to_value(v)))
                .collect(),
        ),
    }
}

fn value_to_plain(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::DateTime(dt) => {
            serde_json::Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_plain).collect()),
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_plain(v)))
                .collect(),
        ),
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
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

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        plain_to_value(json)
    }
}
