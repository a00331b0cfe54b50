// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mock TenantRepository for testing.
//!
//! Records every `find_one()` call so tests can assert when the cache was
//! (or was not) bypassed. Can be switched into a failing mode.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tenant_cache::backend::BoxFuture;
use tenant_cache::model::TenantRecord;
use tenant_cache::repository::{Projection, RecordFilter, TenantRepository};
use tenant_cache::CacheError;
use tokio::sync::RwLock;

/// Mock repository that records all lookups.
///
/// # Example
/// ```rust,ignore
/// let repo = MockRepository::new();
/// repo.insert(record("c1", json!({"theme": "dark"}))).await;
///
/// // Use in tests...
///
/// assert_eq!(repo.read_count().await, 1);
/// ```
#[derive(Default)]
pub struct MockRepository {
    records: RwLock<BTreeMap<String, TenantRecord>>,
    calls: RwLock<Vec<RecordFilter>>,
    failing: AtomicBool,
}

impl MockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: TenantRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn remove(&self, id: &str) {
        self.records.write().await.remove(id);
    }

    /// Make every lookup fail with a repository error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Total `find_one()` calls.
    pub async fn read_count(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Recorded filters, in call order.
    pub async fn calls(&self) -> Vec<RecordFilter> {
        self.calls.read().await.clone()
    }

    pub async fn reset_calls(&self) {
        self.calls.write().await.clear();
    }
}

impl TenantRepository for MockRepository {
    fn find_one<'a>(
        &'a self,
        filter: &'a RecordFilter,
        _projection: Projection,
    ) -> BoxFuture<'a, Option<TenantRecord>> {
        Box::pin(async move {
            self.calls.write().await.push(filter.clone());
            if self.failing.load(Ordering::SeqCst) {
                return Err(CacheError::Repository("database unreachable".to_string()));
            }

            let records = self.records.read().await;
            Ok(match filter {
                RecordFilter::ById(id) => records.get(id).cloned(),
                RecordFilter::BySettingsField { path, value } => records
                    .values()
                    .find(|r| {
                        r.settings
                            .as_ref()
                            .and_then(|s| path.token(s))
                            .as_deref()
                            == Some(value.as_str())
                    })
                    .cloned(),
            })
        })
    }
}
