// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the tenant cache.
//!
//! Most failures in this crate are *not* surfaced to callers: the cache is
//! best-effort and the record repository is the source of truth. The types
//! here exist for the few paths that do propagate (validation on the write
//! path, repository failures, stream operations a worker needs to back off
//! from) and as the internal currency between the store backends and the
//! clients that swallow them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Surfaced by |
//! |------------|-----------|-------------|
//! | `Redis` | Yes | stream primitives (KV client logs and swallows) |
//! | `ConnectionUnavailable` | Yes | stream primitives (KV client logs and swallows) |
//! | `Repository` | Yes | `read_settings`, `resolve_tenant_by_token` |
//! | `Validation` | No | `save_full`, `update_channel` |
//! | `UnknownPlatform` | No | `update_channel` |
//! | `Serialization` | No | stream publish |
//! | `Config` | No | construction |
//! | `IndexWrite` | Yes | background repopulation (logged only) |
//! | `Shutdown` | No | background pool after `close()` |
//! | `Internal` | No | unexpected state |

use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur in the cache, index and stream layers.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Redis command or transport error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// No live connection to the store.
    #[error("Store connection unavailable")]
    ConnectionUnavailable,

    /// The authoritative record is missing required data.
    ///
    /// Signals an upstream integrity problem, never a transient cache issue.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No indexer is configured for the requested platform.
    #[error("No indexer configured for platform '{0}'")]
    UnknownPlatform(String),

    /// The record repository failed.
    #[error("Repository error: {0}")]
    Repository(String),

    /// A secondary index entry could not be written.
    #[error("Index write failed ({platform}): {message}")]
    IndexWrite { platform: String, message: String },

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The component is shutting down.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Redis { .. } => true,
            Self::ConnectionUnavailable => true,
            Self::Repository(_) => true,
            Self::IndexWrite { .. } => true,
            Self::Validation(_) => false,
            Self::UnknownPlatform(_) => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Redis { .. } => "redis",
            Self::ConnectionUnavailable => "connection_unavailable",
            Self::Validation(_) => "validation",
            Self::UnknownPlatform(_) => "unknown_platform",
            Self::Repository(_) => "repository",
            Self::IndexWrite { .. } => "index_write",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_redis() {
        let err = CacheError::redis_msg("XREADGROUP", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("XREADGROUP"));
    }

    #[test]
    fn test_is_retryable_connection_unavailable() {
        assert!(CacheError::ConnectionUnavailable.is_retryable());
    }

    #[test]
    fn test_not_retryable_validation() {
        let err = CacheError::Validation("record has no id".to_string());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("no id"));
    }

    #[test]
    fn test_unknown_platform_formatting() {
        let err = CacheError::UnknownPlatform("carrier-pigeon".to_string());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_index_write_formatting() {
        let err = CacheError::IndexWrite {
            platform: "whatsapp".to_string(),
            message: "store unavailable".to_string(),
        };
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("whatsapp"));
        assert!(msg.contains("store unavailable"));
    }

    #[test]
    fn test_serialization_from_serde() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CacheError = json_err.into();
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "serialization");
    }

    #[test]
    fn test_redis_error_formatting() {
        let err = CacheError::Redis {
            operation: "SET".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Redis error"));
        assert!(msg.contains("SET"));
        assert!(msg.contains("timeout"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(CacheError::Shutdown.kind(), "shutdown");
        assert_eq!(CacheError::Repository("x".into()).kind(), "repository");
        assert_eq!(CacheError::Config("x".into()).kind(), "config");
    }
}
