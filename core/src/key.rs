//! Canonical encoding for structured lookup keys.
//!
//! Loaders and caches are generic over `K: Hash + Eq`, so typed keys never
//! need to be stringified. Some call sites only have a JSON-shaped key (a
//! filter object coming from the catalog UI, say). Stringifying such a value
//! naively depends on member insertion order: `{"a":1,"b":2}` and
//! `{"b":2,"a":1}` would become two cache entries. [`CanonicalKey`] sorts
//! object members recursively so equal values always encode identically.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Order-independent string encoding of a JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Encode a JSON value.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let mut out = String::new();
        write_canonical(value, &mut out);
        Self(out)
    }

    /// Encode any serializable value by way of its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `value` cannot be represented as JSON
    /// (for example a map with non-string keys).
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(|v| Self::from_value(&v))
    }

    /// The encoded form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, member)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(member, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
