// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Tenant Cache
//!
//! Settings cache, secondary-index synchronizer and stream messaging
//! primitives for a multi-tenant messaging platform, all sharing one Redis
//! connection and one failure model.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              tenant-cache                                 │
//! │                                                                           │
//! │  ┌───────────────┐   miss   ┌──────────────────┐                          │
//! │  │ SettingsCache │─────────►│ TenantRepository │ (source of truth)        │
//! │  │ save / read / │          └──────────────────┘                          │
//! │  │ resolve token │──dispatch──►┌─────────────┐                            │
//! │  └───────┬───────┘             │ Repopulator │ (background pool)          │
//! │          │                     └─────────────┘                            │
//! │          ▼                                                                │
//! │  ┌──────────┐  ┌──────────────┐  ┌──────────┐  ┌──────────────┐           │
//! │  │ KvClient │  │ StreamClient │◄─│  Worker  │  │   Notifier   │           │
//! │  └────┬─────┘  └──────┬───────┘  └──────────┘  └──────┬───────┘           │
//! │       └───────────────┼─────────────────────────────────┘                 │
//! │                       ▼                                                   │
//! │              ┌─────────────────┐                                          │
//! │              │ KvBackend       │  RedisStore | MemoryStore                │
//! │              └─────────────────┘                                          │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Model
//!
//! The store is a cache, never the source of truth. KV and pub/sub failures
//! are logged and degrade to misses; readers fall back to the repository.
//! Stream operations return `Result` so workers can back off.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenant_cache::{CacheConfig, KvClient, RedisStore, SettingsCache};
//! use tenant_cache::repository::InMemoryRepository;
//!
//! #[tokio::main]
//! async fn main() -> tenant_cache::Result<()> {
//!     let config = CacheConfig::default();
//!     let store = Arc::new(RedisStore::new(config.redis.clone())?);
//!     store.connect_default().await?;
//!
//!     let repository = Arc::new(InMemoryRepository::new());
//!     let cache = SettingsCache::new(KvClient::new(store), repository, &config)?;
//!
//!     let tenant = cache.resolve_tenant_by_token("whatsapp", "555").await?;
//!     println!("{:?}", tenant);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod path;
pub mod repopulate;
pub mod repository;
pub mod resilience;
pub mod settings;
pub mod stream;
pub mod worker;

// Re-exports for convenience
pub use backend::{KvBackend, MemoryStore, ReadGroupOptions, RedisStore, SetOptions, StoreState};
pub use config::{CacheConfig, IndexerDescriptor, RedisConfig, StreamSettings};
pub use error::{CacheError, Result};
pub use kv::KvClient;
pub use model::{
    ConsumerGroup, DeliveryState, DeliveryStatusEvent, Settings, StreamMessage, TenantRecord,
};
pub use notify::{Notifier, PubSubMessage};
pub use path::TokenPath;
pub use repository::{Projection, RecordFilter, TenantRepository};
pub use settings::{IndexOutcome, SettingsCache, SyncReport};
pub use stream::StreamClient;
pub use worker::{MessageHandler, StreamWorker, WorkerConfig, WorkerStats};
