// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed nested-path lookups over settings objects.
//!
//! A [`TokenPath`] is an ordered list of keys into a string-keyed JSON map.
//! Lookups return `None` on any missing segment or non-object intermediate,
//! never panic.
//!
//! In configuration files a path is written in dotted form:
//!
//! ```rust
//! use tenant_cache::path::TokenPath;
//! use serde_json::json;
//!
//! let path: TokenPath = "integrations.whatsapp.phoneId".parse().unwrap();
//! let settings = json!({"integrations": {"whatsapp": {"phoneId": "555"}}});
//! let settings = settings.as_object().unwrap();
//!
//! assert_eq!(path.token(settings).as_deref(), Some("555"));
//! ```

use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Ordered key path into a settings object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenPath(Vec<String>);

impl TokenPath {
    /// Build a path from its segments.
    ///
    /// Returns `CacheError::Config` if the list is empty or any segment is empty.
    pub fn new<I, S>(segments: I) -> Result<Self, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(CacheError::Config("token path is empty".to_string()));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(CacheError::Config(format!(
                "token path has an empty segment: {:?}",
                segments
            )));
        }
        Ok(Self(segments))
    }

    /// Path segments in order.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Dotted form, e.g. `integrations.whatsapp.phoneId`.
    pub fn dotted(&self) -> String {
        self.0.join(".")
    }

    /// Walk the path through `root`.
    pub fn resolve<'a>(&self, root: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.0.split_first()?;
        let mut current = root.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Resolve the path and render the value as an index token.
    pub fn token(&self, root: &Map<String, Value>) -> Option<String> {
        self.resolve(root).and_then(token_string)
    }
}

/// Render a JSON value as an index token.
///
/// Strings, numbers and booleans are tokens. Empty strings, null, arrays and
/// objects are not.
pub fn token_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl FromStr for TokenPath {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.split('.'))
    }
}

impl TryFrom<String> for TokenPath {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TokenPath> for String {
    fn from(path: TokenPath) -> Self {
        path.dotted()
    }
}

impl fmt::Display for TokenPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dotted())
    }
}
