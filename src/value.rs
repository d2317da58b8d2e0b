//! The tagged value universe shared with the host language.
//!
//! Thunk arguments, stdin, environment entries, and labels are all
//! [`Value`]s. The JSON encoding probes each arm in order: scalars first,
//! then the specifically-shaped tagged objects, with plain arrays and
//! objects as the final catch-alls. Bindings are kept sorted by name so
//! every serialization of a value is canonical.

use crate::path::{CommandPath, DirPath, FilePath, FsPath, HostPath};
use crate::thunk::{Thunk, ThunkPath};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Name-sorted bindings, used for objects, env, and labels.
pub type Bindings = BTreeMap<String, Value>;

/// A host-language value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// JSON `null`.
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Secret(Secret),
    Command(CommandPath),
    File(FilePath),
    Dir(DirPath),
    Host(HostPath),
    Fs(FsPath),
    ThunkPath(ThunkPath),
    Thunk(Box<Thunk>),
    Array(Vec<Value>),
    Object(Bindings),
}

impl Value {
    /// A short name for the value's variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
            Value::Secret(_) => "secret",
            Value::Command(_) => "command path",
            Value::File(_) => "file path",
            Value::Dir(_) => "dir path",
            Value::Host(_) => "host path",
            Value::Fs(_) => "fs path",
            Value::ThunkPath(_) => "thunk path",
            Value::Thunk(_) => "thunk",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
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

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

// =============================================================================
// Secrets
// =============================================================================

/// A named secret.
///
/// Secrets identify by name alone: equality, hashing, and every JSON
/// serialization ignore the bytes, so swapping a secret's value never
/// changes a thunk's fingerprint. The bytes travel only through the
/// per-solve secret table (and the wire schema, which carries them for
/// transport).
#[derive(Debug, Clone)]
pub struct Secret {
    name: String,
    bytes: Vec<u8>,
}

impl Secret {
    /// Creates a secret with the given name and bytes.
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// The secret's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The secret's bytes. Callers feed these into the secret table; they
    /// never enter a build graph or a canonical form.
    pub fn reveal(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Secret {}

impl std::hash::Hash for Secret {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("secret", &self.name)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Repr {
            secret: String,
        }

        let repr = Repr::deserialize(deserializer)?;
        if repr.secret.is_empty() {
            return Err(D::Error::custom("secret name cannot be empty"));
        }

        Ok(Secret {
            name: repr.secret,
            bytes: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_identify_by_name() {
        let a = Secret::new("tok", b"xyz".to_vec());
        let b = Secret::new("tok", b"abc".to_vec());
        assert_eq!(a, b);

        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, r#"{"secret":"tok"}"#);
    }

    #[test]
    fn value_probes_scalars_before_objects() {
        assert_eq!(serde_json::from_str::<Value>("null").unwrap(), Value::Null);
        assert_eq!(serde_json::from_str::<Value>("42").unwrap(), Value::Int(42));
        assert_eq!(
            serde_json::from_str::<Value>(r#""hi""#).unwrap(),
            Value::String("hi".to_string())
        );
    }

    #[test]
    fn value_probes_tagged_paths_before_plain_objects() {
        let v: Value = serde_json::from_str(r#"{"file":"a/b"}"#).unwrap();
        assert!(matches!(v, Value::File(_)));

        let v: Value = serde_json::from_str(r#"{"files":"a/b"}"#).unwrap();
        assert!(matches!(v, Value::Object(_)));
    }

    #[test]
    fn bindings_serialize_sorted() {
        let mut obj = Bindings::new();
        obj.insert("zeta".to_string(), Value::Int(1));
        obj.insert("alpha".to_string(), Value::Int(2));

        let json = serde_json::to_string(&Value::Object(obj)).unwrap();
        assert_eq!(json, r#"{"alpha":2,"zeta":1}"#);
    }
}
