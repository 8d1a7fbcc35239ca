//! Key-value namespace capability used by the resolver and the CV store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv request timed out after {0:?}")]
    Timeout(Duration),
    #[error("kv transport failure: {0}")]
    Transport(String),
    #[error("kv responded with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("kv value is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),
}

impl KvError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// A namespace that stores JSON values under string keys.
#[async_trait]
pub trait KvNamespace: Send + Sync {
    /// `Ok(None)` when the key does not exist.
    async fn get_json(&self, key: &str) -> Result<Option<Value>, KvError>;
    async fn put_json(&self, key: &str, value: &Value) -> Result<(), KvError>;
}

/// What the environment provided for the KV binding.
#[derive(Clone)]
pub enum BindingSlot {
    Bound(Arc<dyn KvNamespace>),
    Missing,
    /// Something was provided but cannot be used; carries the reason.
    Misconfigured(String),
}

impl BindingSlot {
    pub fn bound(namespace: Arc<dyn KvNamespace>) -> Self {
        Self::Bound(namespace)
    }

    pub fn namespace(&self) -> Option<&Arc<dyn KvNamespace>> {
        match self {
            Self::Bound(namespace) => Some(namespace),
            Self::Missing | Self::Misconfigured(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Bound(_) => "bound".to_string(),
            Self::Missing => "KV binding is not configured".to_string(),
            Self::Misconfigured(reason) => format!("KV binding is misconfigured: {reason}"),
        }
    }
}

impl std::fmt::Debug for BindingSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bound(_) => f.write_str("Bound(..)"),
            Self::Missing => f.write_str("Missing"),
            Self::Misconfigured(reason) => f.debug_tuple("Misconfigured").field(reason).finish(),
        }
    }
}
