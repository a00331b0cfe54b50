// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store wrapper that fails selected writes.
//!
//! Wraps a [`MemoryStore`] and rejects `set()` for keys under chosen
//! prefixes, to exercise partial index failure. Everything else passes
//! through. Counts `get()`/`set()`/`xreadgroup()` calls.

use futures::stream::BoxStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tenant_cache::backend::{
    BoxFuture, ChannelMessage, GroupCreate, KvBackend, MemoryStore, ReadGroupOptions,
    SetOptions, StreamEntry,
};
use tenant_cache::CacheError;

pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing_prefixes: RwLock<Vec<String>>,
    gets: AtomicUsize,
    sets: AtomicUsize,
    reads: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_prefixes: RwLock::new(Vec::new()),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }

    /// Fail every `set()` whose key starts with `prefix`.
    pub fn fail_writes_under(&self, prefix: &str) {
        self.failing_prefixes.write().unwrap().push(prefix.to_string());
    }

    pub fn heal(&self) {
        self.failing_prefixes.write().unwrap().clear();
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    /// Stream reads issued, pending and new.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn should_fail(&self, key: &str) -> bool {
        self.failing_prefixes
            .read()
            .unwrap()
            .iter()
            .any(|p| key.starts_with(p.as_str()))
    }
}

impl KvBackend for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn set<'a>(&'a self, key: &'a str, value: String, opts: SetOptions) -> BoxFuture<'a, bool> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(key) {
            return Box::pin(async move {
                Err(CacheError::redis_msg("SET", format!("injected failure for {}", key)))
            });
        }
        self.inner.set(key, value, opts)
    }

    fn del<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, u64> {
        self.inner.del(keys)
    }

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, u64> {
        self.inner.publish(channel, payload)
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, BoxStream<'static, ChannelMessage>> {
        self.inner.subscribe(channel)
    }

    fn xgroup_create<'a>(&'a self, stream: &'a str, group: &'a str) -> BoxFuture<'a, GroupCreate> {
        self.inner.xgroup_create(stream, group)
    }

    fn xadd<'a>(&'a self, stream: &'a str, payload: String) -> BoxFuture<'a, String> {
        self.inner.xadd(stream, payload)
    }

    fn xreadgroup<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        opts: &'a ReadGroupOptions,
    ) -> BoxFuture<'a, Vec<StreamEntry>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.xreadgroup(stream, group, consumer, opts)
    }

    fn xack<'a>(&'a self, stream: &'a str, group: &'a str, ids: &'a [String]) -> BoxFuture<'a, u64> {
        self.inner.xack(stream, group, ids)
    }

    fn ping(&self) -> BoxFuture<'_, Duration> {
        self.inner.ping()
    }
}
