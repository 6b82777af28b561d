//! Canonical keys
//!
//! A [`Key`] couples a raw identifier with an optional namespace. Everything
//! downstream (caches, backends, the wire protocol) addresses entries by the
//! canonical string `namespace:normalized` (or just `normalized`), so two keys
//! are equal exactly when their canonical strings are.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Separator between namespace and raw value in the canonical form
pub const NAMESPACE_SEPARATOR: char = ':';

/// Raw identifier a key was built from
#[derive(Debug, Clone, PartialEq)]
pub enum RawKey {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    /// Rendered as lowercase hex
    Bytes(Vec<u8>),
    /// Debug representation of an arbitrary value
    Other(String),
}

impl RawKey {
    fn normalize(&self) -> String {
        match self {
            Self::Str(s) | Self::Other(s) => s.clone(),
            Self::Int(n) => n.to_string(),
            Self::UInt(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Bytes(b) => hex::encode(b),
        }
    }
}

/// Immutable, normalized store key
#[derive(Clone)]
pub struct Key {
    raw: RawKey,
    namespace: Option<String>,
    canonical: String,
}

impl Key {
    /// Create a key without a namespace
    pub fn new(raw: impl Into<RawKey>) -> Self {
        Self::build(raw.into(), None)
    }

    /// Create a key scoped to `namespace`. An empty namespace is ignored.
    pub fn with_namespace(raw: impl Into<RawKey>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self::build(raw.into(), (!namespace.is_empty()).then_some(namespace))
    }

    /// Create a key from any value through its `Debug` rendering
    pub fn from_debug<T: fmt::Debug + ?Sized>(value: &T) -> Self {
        Self::build(RawKey::Other(format!("{value:?}")), None)
    }

    /// Parse a canonical string, splitting the namespace at the first `:`
    pub fn parse(s: &str) -> Self {
        match s.split_once(NAMESPACE_SEPARATOR) {
            Some((namespace, raw)) => Self::with_namespace(RawKey::Str(raw.to_string()), namespace),
            None => Self::new(RawKey::Str(s.to_string())),
        }
    }

    fn build(raw: RawKey, namespace: Option<String>) -> Self {
        let normalized = raw.normalize();
        let canonical = match &namespace {
            Some(ns) => format!("{ns}{NAMESPACE_SEPARATOR}{normalized}"),
            None => normalized,
        };
        Self {
            raw,
            namespace,
            canonical,
        }
    }

    /// The raw identifier
    pub fn raw(&self) -> &RawKey {
        &self.raw
    }

    /// The namespace, if any
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Canonical string form
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Stable digest of the canonical string (MD5, hex encoded)
    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(self.canonical.as_bytes()))
    }

    /// Canonical length in bytes
    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "Key(value={:?}, namespace={ns:?})", self.raw),
            None => write!(f, "Key(value={:?})", self.raw),
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

// Store-level string keys honour the `namespace:value` convention.
impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&Key> for Key {
    fn from(k: &Key) -> Self {
        k.clone()
    }
}

macro_rules! key_from_integer {
    ($variant:ident: $($t:ty),*) => {
        $(
            impl From<$t> for RawKey {
                fn from(n: $t) -> Self {
                    Self::$variant(n.into())
                }
            }

            impl From<$t> for Key {
                fn from(n: $t) -> Self {
                    Self::new(n)
                }
            }
        )*
    };
}

key_from_integer!(Int: i64, i32, i16, i8);
key_from_integer!(UInt: u64, u32, u16, u8);

impl From<&str> for RawKey {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for RawKey {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<f64> for RawKey {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for RawKey {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for RawKey {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for RawKey {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Self::new(b)
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Self::new(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_plain_and_namespaced() {
        let plain = Key::new("user");
        assert_eq!(plain.as_str(), "user");
        assert_eq!(plain.namespace(), None);

        let scoped = Key::with_namespace("42", "users");
        assert_eq!(scoped.as_str(), "users:42");
        assert_eq!(scoped.namespace(), Some("users"));
    }

    #[test]
    fn test_normalization() {
        assert_eq!(Key::new(42i64).as_str(), "42");
        assert_eq!(Key::new(true).as_str(), "true");
        assert_eq!(Key::new(vec![0xde, 0xad, 0xbe, 0xef]).as_str(), "deadbeef");
        assert_eq!(Key::from_debug(&(1, "a")).as_str(), "(1, \"a\")");
    }

    #[test]
    fn test_equality_is_canonical() {
        // raw type is irrelevant once canonical strings match
        assert_eq!(Key::new(7i64), Key::new("7"));
        // explicit namespace equals its literal string form
        assert_eq!(Key::with_namespace("a", "b"), Key::new(RawKey::Str("b:a".into())));
        assert_ne!(Key::with_namespace("a", "b"), Key::with_namespace("b", "a"));

        let mut set = HashSet::new();
        set.insert(Key::with_namespace("a", "b"));
        assert!(set.contains(&Key::parse("b:a")));
    }

    #[test]
    fn test_parse_roundtrip() {
        for key in [Key::new("plain"), Key::with_namespace("item", "ns"), Key::new(12u32)] {
            let parsed = Key::parse(&key.to_string());
            assert_eq!(parsed, key);
        }
        let parsed = Key::parse("ns:item");
        assert_eq!(parsed.namespace(), Some("ns"));
        assert_eq!(parsed.raw(), &RawKey::Str("item".to_string()));
    }

    #[test]
    fn test_parse_splits_first_colon_only() {
        let key = Key::parse("a:b:c");
        assert_eq!(key.namespace(), Some("a"));
        assert_eq!(key.raw(), &RawKey::Str("b:c".to_string()));
        assert_eq!(key.as_str(), "a:b:c");
    }

    #[test]
    fn test_empty_namespace_ignored() {
        let key = Key::with_namespace("x", "");
        assert_eq!(key.namespace(), None);
        assert_eq!(key.as_str(), "x");
    }

    #[test]
    fn test_digest_is_stable() {
        let a = Key::with_namespace("a", "b");
        assert_eq!(a.digest(), Key::parse("b:a").digest());
        assert_eq!(a.digest().len(), 32);
        assert_ne!(a.digest(), Key::new("a").digest());
    }

    #[test]
    fn test_serde_as_string() {
        let key = Key::with_namespace("1", "orders");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"orders:1\"");
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
