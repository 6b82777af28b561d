//! Value envelopes
//!
//! A [`Value`] wraps a typed [`Payload`] with its creation timestamp, an
//! optional TTL and free-form metadata. The structured form is the JSON object
//! used both on the wire and by the persistent backends:
//!
//! ```text
//! {"value": <rendered payload>, "type": "StringValue", "created_at": 1700000000.25,
//!  "ttl": 60, "metadata": {...}}
//! ```
//!
//! Rendering per type:
//! - `StringValue`, `IntValue`, `FloatValue`: native JSON scalars
//! - `BytesValue`: lowercase hex string
//! - `JsonValue`: the JSON document itself
//! - `OpaqueValue`: hex string of a MessagePack encoding

use crate::KvError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata attached to a value
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Type tag of a payload, selects the codec used in the structured form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    StringValue,
    IntValue,
    FloatValue,
    BytesValue,
    JsonValue,
    OpaqueValue,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StringValue => "StringValue",
            Self::IntValue => "IntValue",
            Self::FloatValue => "FloatValue",
            Self::BytesValue => "BytesValue",
            Self::JsonValue => "JsonValue",
            Self::OpaqueValue => "OpaqueValue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "StringValue" => Self::StringValue,
            "IntValue" => Self::IntValue,
            "FloatValue" => Self::FloatValue,
            "BytesValue" => Self::BytesValue,
            "JsonValue" => Self::JsonValue,
            "OpaqueValue" => Self::OpaqueValue,
            _ => return None,
        })
    }
}

/// Closed set of supported payload kinds
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    String(String),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    /// Already-encoded MessagePack bytes
    Opaque(Vec<u8>),
}

impl Payload {
    /// Encode any serializable value as an opaque payload
    pub fn opaque<T: Serialize + ?Sized>(value: &T) -> crate::Result<Self> {
        rmp_serde::to_vec_named(value)
            .map(Self::Opaque)
            .map_err(|e| KvError::Serialization(format!("opaque encode: {e}")))
    }

    /// Decode an opaque payload back into `T`
    pub fn decode_opaque<T: DeserializeOwned>(&self) -> crate::Result<T> {
        match self {
            Self::Opaque(bytes) => rmp_serde::from_slice(bytes)
                .map_err(|e| KvError::Serialization(format!("opaque decode: {e}"))),
            other => Err(KvError::Serialization(format!(
                "expected OpaqueValue, found {}",
                other.value_type().as_str()
            ))),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::StringValue,
            Self::Int(_) => ValueType::IntValue,
            Self::Float(_) => ValueType::FloatValue,
            Self::Bytes(_) => ValueType::BytesValue,
            Self::Json(_) => ValueType::JsonValue,
            Self::Opaque(_) => ValueType::OpaqueValue,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Render the payload for the structured form
    pub fn to_wire(&self) -> crate::Result<serde_json::Value> {
        Ok(match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Int(n) => serde_json::Value::from(*n),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| KvError::Serialization(format!("non-finite float {f}")))?,
            Self::Bytes(b) | Self::Opaque(b) => serde_json::Value::String(hex::encode(b)),
            Self::Json(v) => v.clone(),
        })
    }

    /// Rebuild a payload of type `kind` from its rendered form
    pub fn from_wire(kind: ValueType, raw: &serde_json::Value) -> crate::Result<Self> {
        let mismatch = || {
            KvError::Serialization(format!("{} cannot hold {raw}", kind.as_str()))
        };
        Ok(match kind {
            ValueType::StringValue => Self::String(raw.as_str().ok_or_else(mismatch)?.to_string()),
            ValueType::IntValue => Self::Int(raw.as_i64().ok_or_else(mismatch)?),
            ValueType::FloatValue => Self::Float(raw.as_f64().ok_or_else(mismatch)?),
            ValueType::BytesValue => Self::Bytes(decode_hex(raw.as_str().ok_or_else(mismatch)?)?),
            ValueType::JsonValue => Self::Json(raw.clone()),
            ValueType::OpaqueValue => Self::Opaque(decode_hex(raw.as_str().ok_or_else(mismatch)?)?),
        })
    }

    /// Length of the rendered form, used for size accounting
    pub fn rendered_len(&self) -> usize {
        match self {
            Self::String(s) => s.len(),
            Self::Int(n) => n.to_string().len(),
            Self::Float(f) => f.to_string().len(),
            Self::Bytes(b) | Self::Opaque(b) => b.len() * 2,
            Self::Json(v) => v.to_string().len(),
        }
    }
}

fn decode_hex(s: &str) -> crate::Result<Vec<u8>> {
    hex::decode(s).map_err(|e| KvError::Serialization(format!("invalid hex: {e}")))
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Payload {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Payload {
    fn from(n: i32) -> Self {
        Self::Int(n.into())
    }
}

impl From<u32> for Payload {
    fn from(n: u32) -> Self {
        Self::Int(n.into())
    }
}

impl From<f64> for Payload {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// Stored value with TTL and metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    payload: Payload,
    /// Unix timestamp (seconds, fractional)
    created_at: f64,
    /// Time-to-live in seconds, relative to `created_at`
    ttl: Option<u64>,
    metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
struct StructuredValue {
    value: serde_json::Value,
    #[serde(rename = "type")]
    kind: ValueType,
    created_at: f64,
    #[serde(default)]
    ttl: Option<u64>,
    #[serde(default)]
    metadata: Metadata,
}

impl Value {
    /// Create a value stamped with the current time
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            created_at: current_timestamp(),
            ttl: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<u64>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_created_at(mut self, created_at: f64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn value_type(&self) -> ValueType {
        self.payload.value_type()
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Expiration timestamp, if a TTL is set
    pub fn expiry(&self) -> Option<f64> {
        self.ttl.map(|ttl| self.created_at + ttl as f64)
    }

    /// Check if the value has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp())
    }

    pub fn is_expired_at(&self, now: f64) -> bool {
        self.expiry().is_some_and(|expiry| now > expiry)
    }

    /// Estimated footprint of payload plus metadata
    pub fn estimated_size(&self) -> usize {
        let metadata: usize = self
            .metadata
            .iter()
            .map(|(k, v)| k.len() + metadata_len(v))
            .sum();
        self.payload.rendered_len() + metadata
    }

    /// Encode to the structured (JSON) form
    pub fn to_structured(&self) -> crate::Result<serde_json::Value> {
        let structured = StructuredValue {
            value: self.payload.to_wire()?,
            kind: self.value_type(),
            created_at: self.created_at,
            ttl: self.ttl,
            metadata: self.metadata.clone(),
        };
        Ok(serde_json::to_value(structured)?)
    }

    /// Decode from the structured (JSON) form
    pub fn from_structured(raw: &serde_json::Value) -> crate::Result<Self> {
        let structured = StructuredValue::deserialize(raw)
            .map_err(|e| KvError::Serialization(format!("invalid value envelope: {e}")))?;
        Ok(Self {
            payload: Payload::from_wire(structured.kind, &structured.value)?,
            created_at: structured.created_at,
            ttl: structured.ttl,
            metadata: structured.metadata,
        })
    }

    /// Encode the structured form as JSON bytes
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_structured()?)?)
    }

    /// Decode JSON bytes produced by [`Value::encode`]
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        Self::from_structured(&raw)
    }
}

fn metadata_len(v: &serde_json::Value) -> usize {
    match v {
        serde_json::Value::String(s) => s.len(),
        other => other.to_string().len(),
    }
}

/// Get the current Unix timestamp in fractional seconds
pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
