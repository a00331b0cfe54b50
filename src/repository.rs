// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record repository integration trait.
//!
//! The repository owns the authoritative [`TenantRecord`]s; the cache only
//! reads from it on a miss. The host application implements
//! [`TenantRepository`] over its document store.
//!
//! # Example
//!
//! ```rust,no_run
//! use tenant_cache::repository::{Projection, RecordFilter, TenantRepository};
//! use tenant_cache::backend::BoxFuture;
//! use tenant_cache::model::TenantRecord;
//!
//! struct Documents { /* ... */ }
//!
//! impl TenantRepository for Documents {
//!     fn find_one<'a>(
//!         &'a self,
//!         _filter: &'a RecordFilter,
//!         _projection: Projection,
//!     ) -> BoxFuture<'a, Option<TenantRecord>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use crate::backend::BoxFuture;
use crate::model::TenantRecord;
use crate::path::TokenPath;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Which record to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// Record with this tenant id.
    ById(String),
    /// First record whose settings hold `value` at `path`.
    BySettingsField { path: TokenPath, value: String },
}

impl RecordFilter {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ById(_) => "by_id",
            Self::BySettingsField { .. } => "by_settings_field",
        }
    }
}

/// Which fields to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// Id and settings only.
    #[default]
    Settings,
    /// Every field.
    Full,
}

/// What the cache needs from the record store.
///
/// Failures are reported as `CacheError::Repository` and propagate to the
/// cache's callers; the repository is the source of truth.
pub trait TenantRepository: Send + Sync + 'static {
    fn find_one<'a>(
        &'a self,
        filter: &'a RecordFilter,
        projection: Projection,
    ) -> BoxFuture<'a, Option<TenantRecord>>;
}

impl<R: TenantRepository + ?Sized> TenantRepository for Arc<R> {
    fn find_one<'a>(
        &'a self,
        filter: &'a RecordFilter,
        projection: Projection,
    ) -> BoxFuture<'a, Option<TenantRecord>> {
        (**self).find_one(filter, projection)
    }
}

/// In-process repository for standalone mode and tests.
///
/// Counts every `find_one` call so callers can assert on cache hits.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    records: RwLock<BTreeMap<String, TenantRecord>>,
    reads: AtomicUsize,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn insert(&self, record: TenantRecord) {
        if let Ok(mut records) = self.records.write() {
            records.insert(record.id.clone(), record);
        }
    }

    pub fn remove(&self, id: &str) -> Option<TenantRecord> {
        self.records.write().ok()?.remove(id)
    }

    /// Number of `find_one` calls so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn lookup(&self, filter: &RecordFilter) -> Option<TenantRecord> {
        let records = self.records.read().ok()?;
        match filter {
            RecordFilter::ById(id) => records.get(id).cloned(),
            RecordFilter::BySettingsField { path, value } => records
                .values()
                .find(|record| {
                    record
                        .settings
                        .as_ref()
                        .and_then(|settings| path.token(settings))
                        .is_some_and(|token| &token == value)
                })
                .cloned(),
        }
    }
}

impl TenantRepository for InMemoryRepository {
    fn find_one<'a>(
        &'a self,
        filter: &'a RecordFilter,
        projection: Projection,
    ) -> BoxFuture<'a, Option<TenantRecord>> {
        Box::pin(async move {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.lookup(filter).map(|mut record| {
                if projection == Projection::Settings {
                    record.display_name = None;
                }
                record
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, settings: serde_json::Value) -> TenantRecord {
        TenantRecord::new(id, settings.as_object().cloned().unwrap()).with_display_name("Acme")
    }

    #[tokio::test]
    async fn test_find_by_id_with_projection() {
        let repo = InMemoryRepository::new();
        repo.insert(record("c1", json!({"theme": "dark"})));

        let found = repo
            .find_one(&RecordFilter::ById("c1".into()), Projection::Settings)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.display_name, None);
        assert_eq!(found.settings.unwrap()["theme"], json!("dark"));

        let full = repo
            .find_one(&RecordFilter::ById("c1".into()), Projection::Full)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.display_name.as_deref(), Some("Acme"));
        assert_eq!(repo.read_count(), 2);
    }

    #[tokio::test]
    async fn test_find_by_settings_field() {
        let repo = InMemoryRepository::new();
        repo.insert(record("c1", json!({"integrations": {"whatsapp": {"phoneId": "555"}}})));
        repo.insert(record("c2", json!({"integrations": {"whatsapp": {"phoneId": 777}}})));

        let path: TokenPath = "integrations.whatsapp.phoneId".parse().unwrap();
        let by_string = RecordFilter::BySettingsField {
            path: path.clone(),
            value: "555".into(),
        };
        let by_number = RecordFilter::BySettingsField {
            path: path.clone(),
            value: "777".into(),
        };
        let missing = RecordFilter::BySettingsField {
            path,
            value: "000".into(),
        };

        let found = repo.find_one(&by_string, Projection::Settings).await.unwrap();
        assert_eq!(found.unwrap().id, "c1");
        let found = repo.find_one(&by_number, Projection::Settings).await.unwrap();
        assert_eq!(found.unwrap().id, "c2");
        assert!(repo.find_one(&missing, Projection::Settings).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_and_arc_impl() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.insert(record("c1", json!({})));
        assert!(repo.remove("c1").is_some());

        let shared: Arc<InMemoryRepository> = Arc::clone(&repo);
        let found = shared
            .find_one(&RecordFilter::ById("c1".into()), Projection::Settings)
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(RecordFilter::ById("x".into()).kind(), "by_id");
    }
}
