// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process store.
//!
//! Implements the same semantics as the Redis backend for the subset of
//! commands the crate uses: string keys, streams with consumer groups and
//! per-consumer pending lists, blocking reads bounded by the block timeout,
//! and pub/sub fan-out.
//!
//! [`MemoryStore::set_available`] toggles the store off so that every
//! operation fails with `ConnectionUnavailable`, which is how tests exercise
//! the degraded paths.

use super::{
    BoxFuture, ChannelMessage, GroupCreate, KvBackend, ReadGroupOptions, SetOptions, StreamEntry,
};
use crate::error::{CacheError, Result};
use crate::model::epoch_millis;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

/// Parsed `{ms}-{seq}` stream id. Ordering is numeric on both parts.
type EntryId = (u64, u64);

fn parse_entry_id(id: &str) -> Option<EntryId> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

fn format_entry_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, String>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_id(&mut self) -> EntryId {
        let ms = epoch_millis();
        let id = if ms > self.last_id.0 {
            (ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = id;
        id
    }
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, String>,
    streams: HashMap<String, StreamState>,
    channels: HashMap<String, broadcast::Sender<ChannelMessage>>,
}

/// In-process [`KvBackend`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Woken on every XADD so blocked readers re-check.
    appended: Notify,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Number of string keys held.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.kv.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Raw stored value, bypassing availability.
    pub async fn raw(&self, key: &str) -> Option<String> {
        self.inner.lock().await.kv.get(key).cloned()
    }

    /// String keys starting with `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<String> = inner
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Entries in a group's pending list (all consumers).
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Times an entry has been delivered, if it is pending.
    pub async fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Option<u64> {
        let id = parse_entry_id(id)?;
        let inner = self.inner.lock().await;
        inner
            .streams
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&id)
            .map(|p| p.deliveries)
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CacheError::ConnectionUnavailable)
        }
    }

    /// One non-blocking XREADGROUP pass against the locked state.
    fn read_once(
        inner: &mut Inner,
        stream: &str,
        group: &str,
        consumer: &str,
        opts: &ReadGroupOptions,
    ) -> Result<Vec<StreamEntry>> {
        let no_group = || {
            CacheError::redis_msg(
                "XREADGROUP",
                format!("NOGROUP No such key '{}' or consumer group '{}'", stream, group),
            )
        };
        let state = inner.streams.get_mut(stream).ok_or_else(no_group)?;
        let StreamState { entries, groups, .. } = state;
        let group_state = groups.get_mut(group).ok_or_else(no_group)?;
        let limit = opts.limit().unwrap_or(usize::MAX);

        if opts.read_pending {
            let cursor = opts.start_id();
            let after = parse_entry_id(&cursor).ok_or_else(|| {
                CacheError::redis_msg("XREADGROUP", format!("Invalid stream ID '{}'", cursor))
            })?;

            let mut out = Vec::new();
            for (id, pending) in group_state.pending.range_mut((
                std::ops::Bound::Excluded(after),
                std::ops::Bound::Unbounded,
            )) {
                if out.len() >= limit {
                    break;
                }
                if pending.consumer != consumer {
                    continue;
                }
                pending.deliveries += 1;
                out.push(StreamEntry {
                    id: format_entry_id(*id),
                    payload: entries.get(id).cloned(),
                });
            }
            return Ok(out);
        }

        let fresh: Vec<(EntryId, String)> = entries
            .range((
                std::ops::Bound::Excluded(group_state.last_delivered),
                std::ops::Bound::Unbounded,
            ))
            .take(limit)
            .map(|(id, payload)| (*id, payload.clone()))
            .collect();

        let mut out = Vec::with_capacity(fresh.len());
        for (id, payload) in fresh {
            group_state.last_delivered = id;
            group_state.pending.insert(
                id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    deliveries: 1,
                },
            );
            out.push(StreamEntry {
                id: format_entry_id(id),
                payload: Some(payload),
            });
        }
        Ok(out)
    }
}

impl KvBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.inner.lock().await.kv.get(key).cloned())
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, opts: SetOptions) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.check_available()?;
            let mut inner = self.inner.lock().await;
            if opts.only_if_absent && inner.kv.contains_key(key) {
                return Ok(false);
            }
            inner.kv.insert(key.to_string(), value);
            Ok(true)
        })
    }

    fn del<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.check_available()?;
            let mut inner = self.inner.lock().await;
            let removed = keys
                .iter()
                .filter(|key| inner.kv.remove(key.as_str()).is_some())
                .count();
            Ok(removed as u64)
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.check_available()?;
            let inner = self.inner.lock().await;
            let receivers = match inner.channels.get(channel) {
                Some(sender) => sender
                    .send(ChannelMessage {
                        channel: channel.to_string(),
                        payload,
                    })
                    .unwrap_or(0),
                None => 0,
            };
            Ok(receivers as u64)
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, BoxStream<'static, ChannelMessage>> {
        Box::pin(async move {
            self.check_available()?;
            let mut inner = self.inner.lock().await;
            let receiver = inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe();

            let messages = stream::unfold(receiver, |mut receiver| async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => return Some((message, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            trace!(skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(messages.boxed())
        })
    }

    fn xgroup_create<'a>(&'a self, stream: &'a str, group: &'a str) -> BoxFuture<'a, GroupCreate> {
        Box::pin(async move {
            self.check_available()?;
            let mut inner = self.inner.lock().await;
            let state = inner.streams.entry(stream.to_string()).or_default();
            if state.groups.contains_key(group) {
                return Ok(GroupCreate::AlreadyExists);
            }
            let tail = state.last_id;
            state.groups.insert(
                group.to_string(),
                GroupState {
                    last_delivered: tail,
                    pending: BTreeMap::new(),
                },
            );
            Ok(GroupCreate::Created)
        })
    }

    fn xadd<'a>(&'a self, stream: &'a str, payload: String) -> BoxFuture<'a, String> {
        Box::pin(async move {
            self.check_available()?;
            let id = {
                let mut inner = self.inner.lock().await;
                let state = inner.streams.entry(stream.to_string()).or_default();
                let id = state.next_id();
                state.entries.insert(id, payload);
                id
            };
            self.appended.notify_waiters();
            Ok(format_entry_id(id))
        })
    }

    fn xreadgroup<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        opts: &'a ReadGroupOptions,
    ) -> BoxFuture<'a, Vec<StreamEntry>> {
        Box::pin(async move {
            let deadline = opts.block_millis().map(|ms| Instant::now() + Duration::from_millis(ms));

            loop {
                self.check_available()?;

                let appended = self.appended.notified();
                tokio::pin!(appended);
                // Register before releasing the lock so an XADD in between is not missed
                appended.as_mut().enable();

                {
                    let mut inner = self.inner.lock().await;
                    let entries = Self::read_once(&mut inner, stream, group, consumer, opts)?;
                    if !entries.is_empty() {
                        return Ok(entries);
                    }
                }

                let Some(deadline) = deadline else {
                    return Ok(Vec::new());
                };
                if tokio::time::timeout_at(deadline, appended).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        })
    }

    fn xack<'a>(&'a self, stream: &'a str, group: &'a str, ids: &'a [String]) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.check_available()?;
            let mut inner = self.inner.lock().await;
            let Some(group_state) = inner
                .streams
                .get_mut(stream)
                .and_then(|s| s.groups.get_mut(group))
            else {
                return Ok(0);
            };

            let mut acked = 0;
            for id in ids {
                let parsed = parse_entry_id(id).ok_or_else(|| {
                    CacheError::redis_msg("XACK", format!("Invalid stream ID '{}'", id))
                })?;
                if group_state.pending.remove(&parsed).is_some() {
                    acked += 1;
                }
            }
            Ok(acked)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Duration> {
        Box::pin(async move {
            self.check_available()?;
            Ok(Duration::ZERO)
        })
    }
}
