// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reliable stream messaging over consumer groups.
//!
//! # Delivery Contract
//!
//! ```text
//! publish ──► new ──read_group(new)──► pending ──ack──► acknowledged
//!                                        │  ▲
//!                                        └──┘ read_group(pending)
//! ```
//!
//! A message counts as processed only after [`StreamClient::ack`]. A worker
//! that dies between read and ack leaves the message pending; on restart it
//! reclaims it with `read_pending = true`. Delivery is therefore
//! at-least-once and handlers must be idempotent.
//!
//! Unlike the KV client, stream operations return `Result`: a worker needs
//! to see a failed read to back off instead of spinning on empty batches.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> tenant_cache::Result<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::json;
//! use tenant_cache::backend::{MemoryStore, ReadGroupOptions};
//! use tenant_cache::stream::StreamClient;
//!
//! let streams = StreamClient::new(Arc::new(MemoryStore::new()));
//! streams.ensure_group("orders", "workers").await?;
//! streams.publish("orders", &json!({"orderId": 42})).await?;
//!
//! let opts = ReadGroupOptions::new_messages(Duration::from_secs(1), 10);
//! for message in streams.read_group("orders", "workers", "w1", &opts).await? {
//!     // handle, then ack
//!     streams.ack("orders", "workers", &[message.id]).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::backend::{GroupCreate, KvBackend, ReadGroupOptions, RedisStore, StreamEntry};
use crate::error::Result;
use crate::kv::decode_value;
use crate::metrics;
use crate::model::StreamMessage;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Consumer-group stream client over a shared store handle.
pub struct StreamClient<B: KvBackend = RedisStore> {
    backend: Arc<B>,
}

impl<B: KvBackend> Clone for StreamClient<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: KvBackend> StreamClient<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Create the stream and the group at its tail if needed.
    ///
    /// Returns `Ok(true)` both when the group was created and when it already
    /// existed.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool> {
        match self.backend.xgroup_create(stream, group).await? {
            GroupCreate::Created => {
                debug!(stream, group, "Consumer group created");
            }
            GroupCreate::AlreadyExists => {
                trace!(stream, group, "Consumer group already exists");
            }
        }
        Ok(true)
    }

    /// Append one message; returns the store-assigned id.
    pub async fn publish<T>(&self, stream: &str, payload: &T) -> Result<String>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_json::to_string(payload)?;
        let id = self.backend.xadd(stream, encoded).await?;
        trace!(stream, id = %id, "Message published");
        Ok(id)
    }

    /// Read a batch as `consumer` in `group`.
    ///
    /// With `read_pending = false` returns messages never delivered to the
    /// group, blocking up to `opts.block`; an empty vec means the timeout
    /// elapsed. With `read_pending = true` returns this consumer's
    /// unacknowledged messages after `opts.pending_cursor`.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        opts: &ReadGroupOptions,
    ) -> Result<Vec<StreamMessage>> {
        let entries = self.backend.xreadgroup(stream, group, consumer, opts).await?;
        metrics::record_stream_read(stream, opts.read_pending, entries.len());

        Ok(entries
            .into_iter()
            .map(|entry| to_message(stream, entry))
            .collect())
    }

    /// Acknowledge processed messages. Returns how many were still pending.
    pub async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        let acked = self.backend.xack(stream, group, ids).await?;
        metrics::record_stream_ack(stream, acked);
        if acked < ids.len() as u64 {
            debug!(
                stream,
                group,
                requested = ids.len(),
                acked,
                "Some ids were not pending (already acknowledged)"
            );
        }
        Ok(acked)
    }
}

fn to_message(stream: &str, entry: StreamEntry) -> StreamMessage {
    let payload = match entry.payload {
        Some(raw) => decode_value(raw),
        None => {
            warn!(stream, id = %entry.id, "Pending entry has no payload (trimmed)");
            Value::Null
        }
    };
    StreamMessage {
        id: entry.id,
        payload,
    }
}

/// Compare two Redis stream IDs.
///
/// Stream IDs are formatted as `{timestamp}-{sequence}` (e.g., "1234567890123-0").
/// This function compares them numerically, not lexicographically.
pub fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> (u64, u64) {
        match s.split_once('-') {
            Some((ts, seq)) => (ts.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
            // "0" start marker or malformed
            None => (s.parse().unwrap_or(0), 0),
        }
    };

    parse(a).cmp(&parse(b))
}

/// Parse the timestamp (milliseconds since epoch) from a stream ID.
///
/// Returns `None` for malformed IDs or special cases like "0".
pub fn parse_stream_id_timestamp(stream_id: &str) -> Option<u64> {
    let (ts, seq) = stream_id.split_once('-')?;
    if seq.contains('-') {
        return None;
    }
    ts.parse().ok()
}

/// Time lag in milliseconds between a consumer position and the newest entry.
///
/// Returns 0 if `cursor` is ahead of `latest`.
pub fn calculate_lag_ms(cursor: &str, latest: &str) -> Option<u64> {
    let cursor_ts = parse_stream_id_timestamp(cursor)?;
    let latest_ts = parse_stream_id_timestamp(latest)?;
    Some(latest_ts.saturating_sub(cursor_ts))
}
