//! Best-effort replication between nodes
//!
//! A writing node hands every local mutation to a [`Replicator`]; the
//! [`DistributedClient`] implementation pushes it to each peer's
//! `POST {prefix}/propagate`, where a [`DistributedServer`] applies it to its
//! own store without forwarding it any further.

mod client;
mod server;

pub use client::{ClientBuilder, ClientStats, DistributedClient, PeerStats};
pub use server::{ApiError, DistributedServer, ServerState, SetRequest};

use crate::KvError;
use crate::core::{Key, Value};
use serde::{Deserialize, Serialize};

/// Propagated operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Set,
    Delete,
    Clear,
}

/// A store mutation, as replicated to peers
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Set { key: Key, value: Value },
    Delete { key: Key },
    Clear,
}

impl Mutation {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Set { .. } => Operation::Set,
            Self::Delete { .. } => Operation::Delete,
            Self::Clear => Operation::Clear,
        }
    }

    pub fn key(&self) -> Option<&Key> {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => Some(key),
            Self::Clear => None,
        }
    }

    /// Wire form sent to `/propagate`
    pub fn to_request(&self) -> crate::Result<PropagateRequest> {
        Ok(PropagateRequest {
            operation: self.operation(),
            key: self.key().map(|k| k.as_str().to_string()),
            value: match self {
                Self::Set { value, .. } => Some(value.to_structured()?),
                _ => None,
            },
        })
    }

    /// Rebuild a mutation from its wire form
    pub fn from_request(request: &PropagateRequest) -> crate::Result<Self> {
        let key = || {
            request
                .key
                .as_deref()
                .map(Key::parse)
                .ok_or_else(|| KvError::Validation("Missing key".to_string()))
        };
        Ok(match request.operation {
            Operation::Set => {
                let raw = request
                    .value
                    .as_ref()
                    .ok_or_else(|| KvError::Validation("Missing value".to_string()))?;
                Self::Set {
                    key: key()?,
                    value: Value::from_structured(raw)?,
                }
            }
            Operation::Delete => Self::Delete { key: key()? },
            Operation::Clear => Self::Clear,
        })
    }
}

/// Body of `POST {prefix}/propagate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagateRequest {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Sink for local mutations
///
/// Implementations must never fail the local write: the return value only
/// reports whether the mutation was accepted (queued or delivered).
pub trait Replicator: Send + Sync {
    fn propagate(&self, mutation: Mutation) -> bool;
}
