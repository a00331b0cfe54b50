// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store backend interface.
//!
//! [`KvBackend`] is the one seam between this crate and the key-value/stream
//! store. Backends report failures as [`CacheError`](crate::CacheError); the
//! clients built on top decide whether a failure is swallowed (KV, pub/sub)
//! or surfaced (streams).
//!
//! Two implementations ship with the crate:
//! - [`RedisStore`]: one shared multiplexed Redis connection per process
//! - [`MemoryStore`]: in-process store with the same semantics, for tests and
//!   standalone mode
//!
//! # Example
//!
//! ```rust,no_run
//! use tenant_cache::backend::{KvBackend, MemoryStore};
//!
//! # async fn example() -> tenant_cache::Result<()> {
//! let store = MemoryStore::new();
//! store.set("greeting", "\"hello\"".to_string(), Default::default()).await?;
//! assert_eq!(store.get("greeting").await?.as_deref(), Some("\"hello\""));
//! # Ok(())
//! # }
//! ```

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::{RedisStore, StoreState};

use crate::error::Result;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for boxed async futures returned by backends.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Options for a SET.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Only write if the key does not exist (`NX`).
    pub only_if_absent: bool,
}

impl SetOptions {
    pub fn if_absent() -> Self {
        Self { only_if_absent: true }
    }
}

/// Outcome of creating a consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreate {
    Created,
    AlreadyExists,
}

/// Options for a consumer-group read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroupOptions {
    /// How long to wait for new messages. `None` or zero returns immediately.
    /// Ignored for pending reads.
    pub block: Option<Duration>,
    /// Maximum messages returned. Zero means no limit.
    pub count: usize,
    /// `false`: only messages never delivered to this group.
    /// `true`: this consumer's own delivered-but-unacknowledged messages.
    pub read_pending: bool,
    /// For pending reads, return entries with ids strictly greater than this.
    /// `None` starts from the beginning of the pending list.
    pub pending_cursor: Option<String>,
}

impl Default for ReadGroupOptions {
    fn default() -> Self {
        Self {
            block: None,
            count: 10,
            read_pending: false,
            pending_cursor: None,
        }
    }
}

impl ReadGroupOptions {
    /// Read new messages, blocking up to `block`.
    pub fn new_messages(block: Duration, count: usize) -> Self {
        Self {
            block: Some(block),
            count,
            ..Default::default()
        }
    }

    /// Read this consumer's pending messages after `cursor`.
    pub fn pending(count: usize, cursor: Option<String>) -> Self {
        Self {
            count,
            read_pending: true,
            pending_cursor: cursor,
            ..Default::default()
        }
    }

    /// Block duration in milliseconds, `None` when the read must not block.
    pub(crate) fn block_millis(&self) -> Option<u64> {
        if self.read_pending {
            return None;
        }
        self.block
            .map(|d| d.as_millis() as u64)
            .filter(|millis| *millis > 0)
    }

    /// COUNT argument, `None` when unlimited.
    pub(crate) fn limit(&self) -> Option<usize> {
        (self.count > 0).then_some(self.count)
    }

    /// XREADGROUP id argument: `>` for new, the cursor for pending.
    pub(crate) fn start_id(&self) -> String {
        if self.read_pending {
            self.pending_cursor.clone().unwrap_or_else(|| "0".to_string())
        } else {
            ">".to_string()
        }
    }
}

/// A raw stream entry as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    /// The `payload` field; `None` if the entry was trimmed while pending.
    pub payload: Option<String>,
}

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Store operations needed by the cache, stream and notifier layers.
///
/// All values are strings on the wire; encoding is the caller's concern.
pub trait KvBackend: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// GET. `None` if the key does not exist.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>>;

    /// SET. Returns `false` if `only_if_absent` was set and the key existed.
    fn set<'a>(&'a self, key: &'a str, value: String, opts: SetOptions) -> BoxFuture<'a, bool>;

    /// DEL. Returns the number of keys removed.
    fn del<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, u64>;

    /// PUBLISH. Returns the number of subscribers that received the message.
    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, u64>;

    /// SUBSCRIBE to one channel.
    fn subscribe<'a>(&'a self, channel: &'a str)
        -> BoxFuture<'a, BoxStream<'static, ChannelMessage>>;

    /// XGROUP CREATE `$` MKSTREAM.
    fn xgroup_create<'a>(&'a self, stream: &'a str, group: &'a str) -> BoxFuture<'a, GroupCreate>;

    /// XADD `*` with a single `payload` field. Returns the assigned id.
    fn xadd<'a>(&'a self, stream: &'a str, payload: String) -> BoxFuture<'a, String>;

    /// XREADGROUP. An empty vec means nothing was available before the block
    /// timeout.
    fn xreadgroup<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        opts: &'a ReadGroupOptions,
    ) -> BoxFuture<'a, Vec<StreamEntry>>;

    /// XACK. Returns the number of ids removed from the pending list.
    fn xack<'a>(&'a self, stream: &'a str, group: &'a str, ids: &'a [String]) -> BoxFuture<'a, u64>;

    /// Round-trip health check.
    fn ping(&self) -> BoxFuture<'_, Duration>;
}
