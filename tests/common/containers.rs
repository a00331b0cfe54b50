// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use std::sync::Arc;
use tenant_cache::config::RedisConfig;
use tenant_cache::resilience::RetryConfig;
use tenant_cache::RedisStore;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A running Redis container plus a connected store.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
    pub store: Arc<RedisStore>,
}

impl<'a> TestRedis<'a> {
    /// Start Redis and connect a store to it.
    pub async fn start(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        let store = RedisStore::new(RedisConfig {
            url: url.clone(),
            connect_timeout: "2s".to_string(),
            max_connect_attempts: 5,
        })
        .expect("valid redis url");
        store
            .connect(&RetryConfig::testing())
            .await
            .expect("connect to test redis");

        Self {
            container,
            url,
            store: Arc::new(store),
        }
    }

    /// Read a key with a plain connection, bypassing the crate.
    pub async fn raw_get(&self, key: &str) -> redis::RedisResult<Option<String>> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        use redis::AsyncCommands;
        conn.get(key).await
    }

    /// Write a key with a plain connection, bypassing the crate's encoding.
    pub async fn raw_set(&self, key: &str, value: &str) -> redis::RedisResult<()> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        use redis::AsyncCommands;
        conn.set(key, value).await
    }

    /// Number of entries pending in a group (XPENDING summary).
    pub async fn pending_count(&self, stream: &str, group: &str) -> redis::RedisResult<usize> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        use redis::AsyncCommands;
        let reply: redis::streams::StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(reply.count())
    }
}
