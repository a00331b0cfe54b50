// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Settings cache and secondary-index synchronizer.
//!
//! Keeps two kinds of derived entries eventually consistent with the
//! authoritative tenant records:
//!
//! | Entry | Key | Value |
//! |-------|-----|-------|
//! | Primary | `settings:{tenantId}` | full settings object |
//! | Secondary | `{cacheKeyPrefix}:{token}` | tenant id |
//!
//! One secondary entry exists per configured [`IndexerDescriptor`] whose
//! token path is present in the tenant's settings. Secondary entries let an
//! inbound webhook carrying only a channel token (a phone id, a page id)
//! find its tenant without touching the repository.
//!
//! # Failure Model
//!
//! The cache is best-effort. Store failures never reach callers: a failed
//! read is a miss and falls back to the repository, a failed write is
//! logged. Each secondary entry is written independently; one failing does
//! not stop the primary write or its siblings. The only errors that
//! propagate are validation failures on the write path and repository
//! failures on the read path.
//!
//! # Read Paths
//!
//! ```text
//! read_settings(id)            resolve_tenant_by_token(platform, token)
//!   │                            │
//!   ├─ hit  → settings           ├─ hit  → tenant id
//!   └─ miss → repository         └─ miss → repository (by settings field)
//!             └─ save_full              ├─ tenant id returned now
//!                                       └─ update_channel on the
//!                                          background pool
//! ```
//!
//! # Known Limitation
//!
//! Removing a token from a tenant's settings does not delete its old
//! secondary entry; it keeps resolving to the tenant until overwritten.

use crate::backend::{KvBackend, RedisStore, SetOptions};
use crate::config::{CacheConfig, IndexerDescriptor};
use crate::error::{CacheError, Result};
use crate::kv::KvClient;
use crate::metrics;
use crate::model::{Settings, TenantRecord};
use crate::path::token_string;
use crate::repopulate::Repopulator;
use crate::repository::{Projection, RecordFilter, TenantRepository};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const PRIMARY_KEY_PREFIX: &str = "settings";

/// Cache key of a tenant's primary entry.
pub fn primary_key(tenant_id: &str) -> String {
    format!("{}:{}", PRIMARY_KEY_PREFIX, tenant_id)
}

/// Result of syncing one secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Entry written under `key`.
    Written { key: String },
    /// Token absent from the settings; nothing to index.
    Skipped,
    /// Token present but the entry could not be written.
    Failed(String),
}

impl IndexOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Written { .. } => "written",
            Self::Skipped => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

/// What a full sync wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub tenant_id: String,
    /// Whether the primary entry reached the store.
    pub primary_written: bool,
    /// One outcome per configured indexer, in table order.
    pub indexes: Vec<(String, IndexOutcome)>,
}

impl SyncReport {
    /// Outcome for one platform.
    pub fn outcome(&self, platform: &str) -> Option<&IndexOutcome> {
        self.indexes
            .iter()
            .find(|(name, _)| name == platform)
            .map(|(_, outcome)| outcome)
    }

    /// Number of secondary entries written.
    pub fn written_count(&self) -> usize {
        self.indexes.iter().filter(|(_, o)| o.is_written()).count()
    }

    /// Platforms whose secondary write failed.
    pub fn failed_platforms(&self) -> Vec<&str> {
        self.indexes
            .iter()
            .filter(|(_, o)| o.is_failed())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Tenant settings cache with secondary indexes.
///
/// Cheap to clone; clones share the store handle, the repository and the
/// background pool.
pub struct SettingsCache<R: TenantRepository, B: KvBackend = RedisStore> {
    kv: KvClient<B>,
    repository: Arc<R>,
    indexers: Arc<[IndexerDescriptor]>,
    repopulator: Arc<Repopulator>,
}

impl<R: TenantRepository, B: KvBackend> Clone for SettingsCache<R, B> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            repository: Arc::clone(&self.repository),
            indexers: Arc::clone(&self.indexers),
            repopulator: Arc::clone(&self.repopulator),
        }
    }
}

impl<R: TenantRepository, B: KvBackend> SettingsCache<R, B> {
    /// Build the cache.
    ///
    /// Does not need a Tokio runtime: the background pool starts on the
    /// first repopulation, which must happen inside one. Fails with
    /// `CacheError::Config` if the indexer table is invalid.
    pub fn new(kv: KvClient<B>, repository: Arc<R>, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        info!(
            backend = kv.backend().name(),
            indexers = config.indexers.len(),
            "Settings cache initialized"
        );
        Ok(Self {
            kv,
            repository,
            indexers: config.indexers.clone().into(),
            repopulator: Arc::new(Repopulator::new(&config.repopulation)),
        })
    }

    /// Configured indexer table.
    pub fn indexers(&self) -> &[IndexerDescriptor] {
        &self.indexers
    }

    /// Descriptor for a platform.
    pub fn indexer(&self, platform: &str) -> Option<&IndexerDescriptor> {
        self.indexers.iter().find(|d| d.platform_name == platform)
    }

    /// Background pool running repopulation jobs.
    pub fn repopulator(&self) -> &Repopulator {
        &self.repopulator
    }

    /// Write the primary entry and every secondary entry for `record`.
    ///
    /// Only fails if the record has no id or no settings.
    pub async fn save_full(&self, record: &TenantRecord) -> Result<SyncReport> {
        let settings = record.validated_settings()?;
        let tenant_id = record.id.as_str();

        let primary_written = self
            .kv
            .set(&primary_key(tenant_id), settings, SetOptions::default())
            .await
            .is_some();
        if !primary_written {
            warn!(tenant_id = %tenant_id, "Primary settings entry not written");
        }

        let outcomes = join_all(
            self.indexers
                .iter()
                .map(|descriptor| self.write_index(descriptor, tenant_id, settings)),
        )
        .await;

        let indexes: Vec<(String, IndexOutcome)> = self
            .indexers
            .iter()
            .map(|d| d.platform_name.clone())
            .zip(outcomes)
            .collect();

        let report = SyncReport {
            tenant_id: tenant_id.to_string(),
            primary_written,
            indexes,
        };
        debug!(
            tenant_id = %tenant_id,
            primary_written,
            indexed = report.written_count(),
            failed = report.failed_platforms().len(),
            "Settings synced"
        );
        Ok(report)
    }

    /// Re-sync the secondary entry of one platform.
    pub async fn update_channel(&self, record: &TenantRecord, platform: &str) -> Result<IndexOutcome> {
        let descriptor = self
            .indexer(platform)
            .ok_or_else(|| CacheError::UnknownPlatform(platform.to_string()))?;
        let settings = record.validated_settings()?;
        Ok(self.write_index(descriptor, &record.id, settings).await)
    }

    /// Settings for a tenant, from cache or repository.
    ///
    /// `Ok(None)` when the tenant or its settings do not exist.
    pub async fn read_settings(&self, tenant_id: &str) -> Result<Option<Settings>> {
        let key = primary_key(tenant_id);
        match self.kv.get(&key).await {
            Some(Value::Object(settings)) => {
                metrics::record_cache_lookup("primary", true);
                debug!(tenant_id = %tenant_id, "Settings cache hit");
                return Ok(Some(settings));
            }
            Some(other) => {
                warn!(
                    tenant_id = %tenant_id,
                    found = value_kind(&other),
                    "Cached settings are not an object, treating as miss"
                );
            }
            None => {}
        }
        metrics::record_cache_lookup("primary", false);
        debug!(tenant_id = %tenant_id, "Settings cache miss");

        let filter = RecordFilter::ById(tenant_id.to_string());
        let Some(record) = self.find_record(&filter).await? else {
            return Ok(None);
        };
        let Some(settings) = record.settings.clone() else {
            debug!(tenant_id = %tenant_id, "Tenant has no settings");
            return Ok(None);
        };

        if let Err(e) = self.save_full(&record).await {
            warn!(tenant_id = %tenant_id, error = %e, "Could not repopulate settings cache");
        }
        Ok(Some(settings))
    }

    /// Tenant id owning `token` on `platform`.
    ///
    /// A miss answers from the repository and refreshes the secondary entry
    /// in the background; the refresh is not awaited.
    pub async fn resolve_tenant_by_token(&self, platform: &str, token: &str) -> Result<Option<String>> {
        let Some(descriptor) = self.indexer(platform) else {
            debug!(platform = %platform, "No indexer for platform");
            return Ok(None);
        };

        let key = descriptor.cache_key(token);
        match self.kv.get(&key).await {
            Some(value) => match token_string(&value) {
                Some(tenant_id) => {
                    metrics::record_cache_lookup("secondary", true);
                    debug!(platform = %platform, tenant_id = %tenant_id, "Index hit");
                    return Ok(Some(tenant_id));
                }
                None => warn!(
                    platform = %platform,
                    key = %key,
                    found = value_kind(&value),
                    "Index entry is not a tenant id, treating as miss"
                ),
            },
            None => {}
        }
        metrics::record_cache_lookup("secondary", false);

        let filter = RecordFilter::BySettingsField {
            path: descriptor.token_path.clone(),
            value: token.to_string(),
        };
        let Some(record) = self.find_record(&filter).await? else {
            debug!(platform = %platform, "No tenant owns token");
            return Ok(None);
        };

        let tenant_id = record.id.clone();
        self.dispatch_update_channel(record, platform);
        Ok(Some(tenant_id))
    }

    /// Queue `update_channel` on the background pool.
    fn dispatch_update_channel(&self, record: TenantRecord, platform: &str) {
        let cache = self.clone();
        let platform = platform.to_string();
        let label = format!("index:{}:{}", platform, record.id);

        self.repopulator.dispatch(label, async move {
            match cache.update_channel(&record, &platform).await? {
                IndexOutcome::Failed(message) => Err(CacheError::IndexWrite { platform, message }),
                _ => Ok(()),
            }
        });
    }

    async fn find_record(&self, filter: &RecordFilter) -> Result<Option<TenantRecord>> {
        let record = self
            .repository
            .find_one(filter, Projection::Settings)
            .await
            .map_err(|e| match e {
                CacheError::Repository(_) => e,
                other => CacheError::Repository(other.to_string()),
            })?;
        metrics::record_repository_read(filter.kind(), record.is_some());
        Ok(record)
    }

    async fn write_index(
        &self,
        descriptor: &IndexerDescriptor,
        tenant_id: &str,
        settings: &Settings,
    ) -> IndexOutcome {
        let platform = descriptor.platform_name.as_str();

        let outcome = match descriptor.token_path.resolve(settings) {
            None => IndexOutcome::Skipped,
            Some(value) => match token_string(value) {
                None => IndexOutcome::Failed(format!(
                    "value at {} is not a token ({})",
                    descriptor.token_path,
                    value_kind(value)
                )),
                Some(token) => {
                    let key = descriptor.cache_key(&token);
                    match self.kv.set(&key, tenant_id, SetOptions::default()).await {
                        Some(_) => IndexOutcome::Written { key },
                        None => IndexOutcome::Failed("store write failed".to_string()),
                    }
                }
            },
        };

        if let IndexOutcome::Failed(reason) = &outcome {
            warn!(
                tenant_id = %tenant_id,
                platform = %platform,
                reason = %reason,
                "Secondary index not written"
            );
        }
        metrics::record_index_outcome(platform, outcome.label());
        outcome
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
