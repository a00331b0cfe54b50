// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Mock TenantRepository recording every lookup
//! - A store wrapper that fails writes for chosen key prefixes

#![allow(dead_code)] // Each test binary uses a different subset

pub mod containers;
pub mod flaky_store;
pub mod mock_repo;

pub use containers::*;
pub use flaky_store::*;
pub use mock_repo::*;

use serde_json::Value;
use tenant_cache::model::{Settings, TenantRecord};

/// Build settings from a `json!` object literal.
pub fn settings(value: Value) -> Settings {
    value.as_object().cloned().expect("settings must be a JSON object")
}

/// Build a record from a `json!` object literal.
pub fn record(id: &str, value: Value) -> TenantRecord {
    TenantRecord::new(id, settings(value))
}
