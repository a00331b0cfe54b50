// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Records, messages and events passed through the cache and stream layers.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A tenant's settings object (the settingsBlob).
pub type Settings = Map<String, Value>;

/// Authoritative tenant record, owned by the external repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
}

impl TenantRecord {
    /// Create a record with settings.
    pub fn new(id: impl Into<String>, settings: Settings) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            settings: Some(settings),
        }
    }

    /// Set the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Return the settings, or a validation error if the record is incomplete.
    ///
    /// A record without an id or without settings cannot be cached.
    pub fn validated_settings(&self) -> Result<&Settings> {
        if self.id.trim().is_empty() {
            return Err(CacheError::Validation("tenant record has no id".to_string()));
        }
        self.settings.as_ref().ok_or_else(|| {
            CacheError::Validation(format!("tenant record '{}' has no settings", self.id))
        })
    }
}

/// A message read from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Store-assigned id (`{ms}-{seq}`), increasing within the stream.
    pub id: String,
    /// Decoded payload.
    pub payload: Value,
}

/// A consumer group on a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerGroup {
    pub stream_key: String,
    pub group_name: String,
}

impl ConsumerGroup {
    pub fn new(stream_key: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            group_name: group_name.into(),
        }
    }
}

/// Delivery state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
    Failed,
}

/// State-change event broadcast to delivery-status subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatusEvent {
    pub tenant_id: String,
    pub message_id: String,
    pub status: DeliveryState,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryStatusEvent {
    /// Create an event stamped with the current time.
    pub fn now(
        tenant_id: impl Into<String>,
        message_id: impl Into<String>,
        status: DeliveryState,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            message_id: message_id.into(),
            status,
            timestamp_ms: epoch_millis(),
            error: None,
        }
    }

    /// Attach an error description (for `Failed`).
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
