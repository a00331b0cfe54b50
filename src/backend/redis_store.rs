// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed store.
//!
//! Holds the process-wide Redis connection and implements [`KvBackend`] on
//! top of it.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected
//!      ↑             ↓             ↓
//!      └─── Backoff ←┴─────────────┘
//! ```
//!
//! [`RedisStore::connect()`] retries with exponential backoff. Until it
//! succeeds every operation fails with `ConnectionUnavailable`, which the KV
//! client turns into a logged cache miss. Once connected, the
//! `ConnectionManager` reconnects by itself after transport errors; the store
//! only tracks the state (`Backoff` after a connection-class error,
//! `Connected` again after the next success).
//!
//! # Blocking Reads
//!
//! `XREADGROUP BLOCK` holds its connection server-side until the timeout.
//! Each consumer (keyed by stream, group and consumer name) therefore gets
//! its own connection for blocking reads, created on first use. Cache
//! traffic never waits behind a worker, and competing consumers sharing one
//! store block side by side instead of taking turns.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> tenant_cache::Result<()> {
//! use tenant_cache::backend::RedisStore;
//! use tenant_cache::config::RedisConfig;
//!
//! let store = RedisStore::new(RedisConfig::default())?;
//! store.connect_default().await?;
//! # Ok(())
//! # }
//! ```

use super::{
    BoxFuture, ChannelMessage, GroupCreate, KvBackend, ReadGroupOptions, SetOptions, StreamEntry,
};
use crate::config::RedisConfig;
use crate::error::{CacheError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Stream field carrying the JSON payload.
const PAYLOAD_FIELD: &str = "payload";

/// State of the store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Not yet connected (initial state).
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and healthy.
    Connected,
    /// Connection failed or last command hit a transport error.
    Backoff,
}

/// Identifies a consumer for its blocking-read connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConsumerKey {
    stream: String,
    group: String,
    consumer: String,
}

impl ConsumerKey {
    fn new(stream: &str, group: &str, consumer: &str) -> Self {
        Self {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        }
    }
}

/// The process-wide Redis handle.
///
/// `ConnectionManager` is multiplexed and cheap to clone; each operation
/// clones it out of the lock and releases the lock before awaiting.
pub struct RedisStore {
    config: RedisConfig,
    client: Client,
    /// Shared connection for KV, publish and non-blocking stream commands.
    conn: RwLock<Option<ConnectionManager>>,
    /// One connection per consumer for blocking XREADGROUP.
    blocking_conns: RwLock<HashMap<ConsumerKey, ConnectionManager>>,
    state: RwLock<StoreState>,
    shutdown: AtomicBool,
}

impl RedisStore {
    /// Create a store (not yet connected).
    ///
    /// Fails only if the URL cannot be parsed.
    pub fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| CacheError::Config(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            config,
            client,
            conn: RwLock::new(None),
            blocking_conns: RwLock::new(HashMap::new()),
            state: RwLock::new(StoreState::Disconnected),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Get current connection state.
    pub async fn state(&self) -> StoreState {
        *self.state.read().await
    }

    /// Check if connected.
    pub async fn is_connected(&self) -> bool {
        self.state().await == StoreState::Connected
    }

    /// Connect using the retry policy from the config.
    pub async fn connect_default(&self) -> Result<()> {
        self.connect(&self.config.retry_config()).await
    }

    /// Connect to Redis with retry logic.
    pub async fn connect(&self, retry_config: &RetryConfig) -> Result<()> {
        *self.state.write().await = StoreState::Connecting;
        info!(url = %redacted_url(&self.config.url), "Connecting to store");

        let mut attempt = 0;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(CacheError::Shutdown);
            }

            attempt += 1;

            let conn_result = timeout(
                retry_config.connection_timeout,
                self.client.get_connection_manager(),
            )
            .await;

            let message = match conn_result {
                Ok(Ok(conn)) => {
                    *self.conn.write().await = Some(conn);
                    *self.state.write().await = StoreState::Connected;
                    metrics::set_store_connected(true);

                    if attempt > 1 {
                        info!(attempt, "Connected to store after retry");
                    } else {
                        info!("Connected to store");
                    }
                    return Ok(());
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "timed out after {}ms",
                    retry_config.connection_timeout.as_millis()
                ),
            };

            if attempt >= retry_config.max_attempts {
                *self.state.write().await = StoreState::Backoff;
                metrics::set_store_connected(false);
                error!(attempt, error = %message, "Failed to connect to store after max retries");
                return Err(CacheError::redis_msg(
                    "CONNECT",
                    format!("Connection failed after {} attempts: {}", attempt, message),
                ));
            }

            let delay = retry_config.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Store connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Get a clone of the shared connection, if connected.
    pub async fn connection(&self) -> Option<ConnectionManager> {
        self.conn.read().await.clone()
    }

    /// Drop the connections; operations fail until the next `connect()`.
    pub async fn mark_disconnected(&self) {
        *self.conn.write().await = None;
        self.blocking_conns.write().await.clear();
        *self.state.write().await = StoreState::Disconnected;
        metrics::set_store_connected(false);
        warn!("Store connection marked as disconnected");
    }

    /// Signal shutdown (aborts any connect retry loop).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    async fn shared(&self) -> Result<ConnectionManager> {
        self.connection()
            .await
            .ok_or(CacheError::ConnectionUnavailable)
    }

    /// Number of consumers holding a blocking-read connection.
    pub async fn blocking_connection_count(&self) -> usize {
        self.blocking_conns.read().await.len()
    }

    /// The consumer's connection for blocking reads, created on first use.
    async fn blocking(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<ConnectionManager> {
        if self.connection().await.is_none() {
            return Err(CacheError::ConnectionUnavailable);
        }
        let key = ConsumerKey::new(stream, group, consumer);
        if let Some(conn) = self.blocking_conns.read().await.get(&key) {
            return Ok(conn.clone());
        }

        let mut conns = self.blocking_conns.write().await;
        if let Some(conn) = conns.get(&key) {
            return Ok(conn.clone());
        }
        let conn = timeout(
            self.config.connect_timeout_duration(),
            self.client.get_connection_manager(),
        )
        .await
        .map_err(|_| CacheError::redis_msg("CONNECT", "blocking connection timed out"))?
        .map_err(|e| CacheError::redis("CONNECT", e))?;
        debug!(
            stream = %stream,
            group = %group,
            consumer = %consumer,
            "Opened blocking-read connection"
        );
        conns.insert(key, conn.clone());
        Ok(conn)
    }

    /// Track state from a command result and convert the error.
    async fn observe<T>(
        &self,
        operation: &'static str,
        started: Instant,
        result: redis::RedisResult<T>,
    ) -> Result<T> {
        metrics::record_store_latency(operation, started.elapsed());
        match result {
            Ok(value) => {
                let mut state = self.state.write().await;
                if *state == StoreState::Backoff {
                    info!(operation, "Store connection recovered");
                    *state = StoreState::Connected;
                    metrics::set_store_connected(true);
                }
                Ok(value)
            }
            Err(e) => {
                if is_connection_error(&e) {
                    *self.state.write().await = StoreState::Backoff;
                    metrics::set_store_connected(false);
                }
                Err(CacheError::redis(operation, e))
            }
        }
    }
}

impl KvBackend for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.shared().await?;
            let started = Instant::now();
            let result: redis::RedisResult<Option<String>> = conn.get(key).await;
            self.observe("GET", started, result).await
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, opts: SetOptions) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.shared().await?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if opts.only_if_absent {
                cmd.arg("NX");
            }
            let started = Instant::now();
            // "OK" when written, nil when NX found an existing key
            let result: redis::RedisResult<Option<String>> = cmd.query_async(&mut conn).await;
            Ok(self.observe("SET", started, result).await?.is_some())
        })
    }

    fn del<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.shared().await?;
            let started = Instant::now();
            let result: redis::RedisResult<u64> = conn.del(keys).await;
            self.observe("DEL", started, result).await
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.shared().await?;
            let started = Instant::now();
            let result: redis::RedisResult<u64> = conn.publish(channel, payload).await;
            self.observe("PUBLISH", started, result).await
        })
    }

    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, BoxStream<'static, ChannelMessage>> {
        Box::pin(async move {
            if self.connection().await.is_none() {
                return Err(CacheError::ConnectionUnavailable);
            }
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| CacheError::redis("SUBSCRIBE", e))?;
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| CacheError::redis("SUBSCRIBE", e))?;

            let messages = pubsub.into_on_message().filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(ChannelMessage {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    }),
                    Err(e) => {
                        warn!(error = %e, "Dropping non-UTF-8 pub/sub message");
                        None
                    }
                }
            });
            Ok(messages.boxed())
        })
    }

    fn xgroup_create<'a>(&'a self, stream: &'a str, group: &'a str) -> BoxFuture<'a, GroupCreate> {
        Box::pin(async move {
            let mut conn = self.shared().await?;
            let started = Instant::now();
            let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;
            match result {
                Err(e) if e.code() == Some("BUSYGROUP") => {
                    metrics::record_store_latency("XGROUP", started.elapsed());
                    Ok(GroupCreate::AlreadyExists)
                }
                other => {
                    self.observe("XGROUP", started, other).await?;
                    Ok(GroupCreate::Created)
                }
            }
        })
    }

    fn xadd<'a>(&'a self, stream: &'a str, payload: String) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut conn = self.shared().await?;
            let started = Instant::now();
            let result: redis::RedisResult<String> =
                conn.xadd(stream, "*", &[(PAYLOAD_FIELD, payload.as_str())]).await;
            self.observe("XADD", started, result).await
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
            let block_millis = opts.block_millis();
            let mut conn = match block_millis {
                Some(_) => self.blocking(stream, group, consumer).await?,
                None => self.shared().await?,
            };

            let mut read_opts = StreamReadOptions::default().group(group, consumer);
            if let Some(count) = opts.limit() {
                read_opts = read_opts.count(count);
            }
            if let Some(millis) = block_millis {
                read_opts = read_opts.block(millis as usize);
            }

            let start_id = opts.start_id();
            let started = Instant::now();
            // Nil reply on block timeout
            let result: redis::RedisResult<Option<StreamReadReply>> = conn
                .xread_options(&[stream], &[start_id.as_str()], &read_opts)
                .await;
            let reply = self.observe("XREADGROUP", started, result).await?;

            let entries = reply
                .map(|reply| {
                    reply
                        .keys
                        .into_iter()
                        .flat_map(|key| key.ids)
                        .map(|entry| StreamEntry {
                            payload: get_string_field(&entry.map, PAYLOAD_FIELD),
                            id: entry.id,
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(entries)
        })
    }

    fn xack<'a>(&'a self, stream: &'a str, group: &'a str, ids: &'a [String]) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(0);
            }
            let mut conn = self.shared().await?;
            let started = Instant::now();
            let result: redis::RedisResult<u64> = conn.xack(stream, group, ids).await;
            self.observe("XACK", started, result).await
        })
    }

    fn ping(&self) -> BoxFuture<'_, Duration> {
        Box::pin(async move {
            let mut conn = self.shared().await?;
            let started = Instant::now();
            let result: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            self.observe("PING", started, result).await?;
            Ok(started.elapsed())
        })
    }
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn is_connection_error(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

/// Strip credentials from a Redis URL for logging.
fn redacted_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
