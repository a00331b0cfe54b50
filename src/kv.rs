// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Best-effort key-value client.
//!
//! Wraps a [`KvBackend`] with JSON encoding and the cache's failure rule:
//! **the cache never fails a caller**. Every store error (no connection,
//! transport failure, encode failure) is logged at `error` level, counted,
//! and turned into `None`.
//!
//! # Encoding
//!
//! Every value is JSON-encoded on write, strings included, so `"c1"` is
//! stored as `"\"c1\""`. On read the client decodes JSON and falls back to
//! the raw text when decoding fails, which keeps values written by other
//! producers as bare strings readable.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use std::sync::Arc;
//! use serde_json::json;
//! use tenant_cache::backend::{MemoryStore, SetOptions};
//! use tenant_cache::kv::KvClient;
//!
//! let kv = KvClient::new(Arc::new(MemoryStore::new()));
//! kv.set("settings:c1", &json!({"theme": "dark"}), SetOptions::default()).await;
//! assert_eq!(kv.get("settings:c1").await, Some(json!({"theme": "dark"})));
//! # }
//! ```

use crate::backend::{KvBackend, RedisStore, SetOptions};
use crate::error::CacheError;
use crate::metrics;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, trace};

/// JSON key-value client over a shared store handle.
pub struct KvClient<B: KvBackend = RedisStore> {
    backend: Arc<B>,
}

impl<B: KvBackend> Clone for KvClient<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: KvBackend> KvClient<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// The underlying store handle.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Encode `value` as JSON and store it under `key`.
    ///
    /// Returns `Some(true)` if written, `Some(false)` if `only_if_absent` found
    /// an existing key, `None` on failure.
    pub async fn set<T>(&self, key: &str, value: &T, opts: SetOptions) -> Option<bool>
    where
        T: Serialize + ?Sized,
    {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                let e = CacheError::from(e);
                self.log_failure("SET", key, &e);
                return None;
            }
        };

        match self.backend.set(key, encoded, opts).await {
            Ok(written) => {
                trace!(key, written, "Cache set");
                Some(written)
            }
            Err(e) => {
                self.log_failure("SET", key, &e);
                None
            }
        }
    }

    /// Fetch and decode the value under `key`.
    ///
    /// `None` if the key is absent or the store failed.
    pub async fn get(&self, key: &str) -> Option<Value> {
        match self.backend.get(key).await {
            Ok(raw) => raw.map(decode_value),
            Err(e) => {
                self.log_failure("GET", key, &e);
                None
            }
        }
    }

    /// Fetch and deserialize the value under `key` into `T`.
    ///
    /// A value that does not fit `T` is logged and treated as absent.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                error!(key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Delete keys. Returns the number removed, `None` on failure.
    pub async fn del(&self, keys: &[String]) -> Option<u64> {
        match self.backend.del(keys).await {
            Ok(removed) => Some(removed),
            Err(e) => {
                let first = keys.first().map(String::as_str).unwrap_or_default();
                self.log_failure("DEL", first, &e);
                None
            }
        }
    }

    fn log_failure(&self, operation: &'static str, key: &str, e: &CacheError) {
        metrics::record_store_error(operation, e.kind());
        error!(
            backend = self.backend.name(),
            operation,
            key,
            error = %e,
            "Cache operation failed, continuing without cache"
        );
    }
}

/// Decode stored text as JSON, falling back to the raw string.
pub fn decode_value(raw: String) -> Value {
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use serde::Deserialize;
    use serde_json::json;

    fn client() -> (Arc<MemoryStore>, KvClient<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Arc::clone(&store), KvClient::new(store))
    }

    #[test]
    fn test_decode_value() {
        assert_eq!(decode_value("{\"a\":1}".to_string()), json!({"a": 1}));
        assert_eq!(decode_value("\"c1\"".to_string()), json!("c1"));
        assert_eq!(decode_value("42".to_string()), json!(42));
        // Legacy bare string
        assert_eq!(decode_value("c1".to_string()), json!("c1"));
        assert_eq!(decode_value("{broken".to_string()), json!("{broken"));
    }

    #[tokio::test]
    async fn test_scalars_are_json_encoded() {
        let (store, kv) = client();
        assert_eq!(kv.set("idx:whatsapp:555", "c1", SetOptions::default()).await, Some(true));
        assert_eq!(store.raw("idx:whatsapp:555").await.as_deref(), Some("\"c1\""));
        assert_eq!(kv.get("idx:whatsapp:555").await, Some(json!("c1")));
    }

    #[tokio::test]
    async fn test_get_reads_legacy_bare_string() {
        let (store, kv) = client();
        store
            .set("idx:whatsapp:555", "c1".to_string(), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(kv.get("idx:whatsapp:555").await, Some(json!("c1")));
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (_, kv) = client();
        assert_eq!(kv.set("k", &1, SetOptions::if_absent()).await, Some(true));
        assert_eq!(kv.set("k", &2, SetOptions::if_absent()).await, Some(false));
        assert_eq!(kv.get("k").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_get_as_typed() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Prefs {
            theme: String,
        }

        let (_, kv) = client();
        let prefs = Prefs {
            theme: "dark".to_string(),
        };
        kv.set("prefs", &prefs, SetOptions::default()).await;
        assert_eq!(kv.get_as::<Prefs>("prefs").await, Some(prefs));

        kv.set("prefs", &json!([1, 2]), SetOptions::default()).await;
        assert_eq!(kv.get_as::<Prefs>("prefs").await, None);
    }

    #[tokio::test]
    async fn test_failures_become_none() {
        let (store, kv) = client();
        kv.set("k", &json!({"a": 1}), SetOptions::default()).await;
        store.set_available(false);

        assert_eq!(kv.get("k").await, None);
        assert_eq!(kv.set("k", &1, SetOptions::default()).await, None);
        assert_eq!(kv.del(&["k".to_string()]).await, None);
        assert_eq!(kv.get_as::<Value>("k").await, None);
    }

    #[tokio::test]
    async fn test_del() {
        let (_, kv) = client();
        kv.set("a", &1, SetOptions::default()).await;
        kv.set("b", &2, SetOptions::default()).await;
        let removed = kv
            .del(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await;
        assert_eq!(removed, Some(2));
        assert_eq!(kv.get("a").await, None);
    }
}
