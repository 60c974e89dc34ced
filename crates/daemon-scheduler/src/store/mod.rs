// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment persistence.
//!
//! Environments are stored as one JSON document per environment in a
//! versioned key-value backend ([`KeyValueStore`]). All writes go through
//! [`EnvironmentStore::put_environment`], which runs an optimistic
//! read-modify-write transaction:
//!
//! ```text
//!   get(key) ──► decode ──► mutation.apply(existing) ──► encode ──► compare_and_put(key, version)
//!      ▲                                                                     │
//!      └──────────────────────── version changed: retry ─────────────────────┘
//! ```
//!
//! Business rules live in [`EnvironmentMutation`] implementations, so every
//! rule is checked against the latest stored document. A rejected mutation
//! writes nothing.

mod memory;
mod sqlite;

pub use memory::MemoryKeyValueStore;
pub use sqlite::SqliteKeyValueStore;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::Environment;

/// Key prefix of environment documents.
pub const ENVIRONMENT_KEY_PREFIX: &str = "blox/daemon-scheduler/environments/";

/// Default number of attempts for one transaction.
pub const DEFAULT_MAX_RETRIES: u32 = 16;

/// A stored value and its opaque version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Stored document.
    pub value: String,
    /// Changes on every write. Never reused for the same key.
    pub version: String,
}

/// Versioned key-value backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Read every key starting with `prefix`, ordered by key.
    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>>;

    /// Write `value` if the key's current version is `expected_version`
    /// (`None`: the key must not exist). Returns `false` when the version
    /// did not match and nothing was written.
    async fn compare_and_put(
        &self,
        key: &str,
        expected_version: Option<&str>,
        value: &str,
    ) -> Result<bool>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// A validate-and-update step executed inside an environment transaction.
///
/// `apply` receives the currently stored environment (`None` if there is
/// none) and returns the replacement document plus an operation-specific
/// output. It may be called several times when the transaction retries, so
/// it must not keep state from a previous attempt.
#[async_trait]
pub trait EnvironmentMutation: Send + Sync {
    /// Value handed back to the caller after a successful commit.
    type Output: Send;

    /// Validate `existing` and produce the replacement document.
    async fn apply(&self, existing: Option<Environment>) -> Result<(Environment, Self::Output)>;
}

/// Adapts a synchronous closure into an [`EnvironmentMutation`] whose output
/// is the written document.
pub struct FnMutation<F>(F);

impl<F> FnMutation<F>
where
    F: Fn(Option<Environment>) -> Result<Environment> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> EnvironmentMutation for FnMutation<F>
where
    F: Fn(Option<Environment>) -> Result<Environment> + Send + Sync,
{
    type Output = Environment;

    async fn apply(&self, existing: Option<Environment>) -> Result<(Environment, Environment)> {
        let updated = (self.0)(existing)?;
        Ok((updated.clone(), updated))
    }
}

/// Transactional access to environment documents.
#[derive(Clone)]
pub struct EnvironmentStore {
    kv: Arc<dyn KeyValueStore>,
    max_retries: u32,
}

impl EnvironmentStore {
    /// Create a store over a backend with the default retry budget.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Set the number of attempts a transaction makes before giving up.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Run `mutation` against the stored environment `name` and commit its
    /// result atomically, retrying on concurrent writes.
    pub async fn put_environment<M>(&self, name: &str, mutation: &M) -> Result<M::Output>
    where
        M: EnvironmentMutation + ?Sized,
    {
        let key = environment_key(name)?;

        for attempt in 1..=self.max_retries {
            let current = self.kv.get(&key).await?;
            let (existing, version) = match current {
                Some(stored) => (
                    Some(serde_json::from_str::<Environment>(&stored.value)?),
                    Some(stored.version),
                ),
                None => (None, None),
            };

            let (updated, output) = mutation.apply(existing).await?;
            if updated.name() != name {
                return Err(Error::BadRequest(format!(
                    "Environment '{}' cannot be stored under name '{}'",
                    updated.name(),
                    name
                )));
            }

            let encoded = serde_json::to_string(&updated)?;
            if self
                .kv
                .compare_and_put(&key, version.as_deref(), &encoded)
                .await?
            {
                debug!(environment = %name, attempt, "Committed environment transaction");
                return Ok(output);
            }

            debug!(environment = %name, attempt, "Environment changed concurrently, retrying");
        }

        warn!(
            environment = %name,
            attempts = self.max_retries,
            "Giving up on environment transaction"
        );
        Err(Error::TransactionConflict {
            key,
            attempts: self.max_retries,
        })
    }

    /// Run a synchronous update closure in a transaction and return the
    /// written document.
    pub async fn update_environment<F>(&self, name: &str, f: F) -> Result<Environment>
    where
        F: Fn(Option<Environment>) -> Result<Environment> + Send + Sync,
    {
        self.put_environment(name, &FnMutation::new(f)).await
    }

    /// Read one environment.
    pub async fn get_environment(&self, name: &str) -> Result<Option<Environment>> {
        let key = environment_key(name)?;
        match self.kv.get(&key).await? {
            Some(stored) => Ok(Some(serde_json::from_str(&stored.value)?)),
            None => Ok(None),
        }
    }

    /// Read every environment, ordered by name.
    pub async fn list_environments(&self) -> Result<Vec<Environment>> {
        self.kv
            .get_with_prefix(ENVIRONMENT_KEY_PREFIX)
            .await?
            .into_iter()
            .map(|(_, stored)| serde_json::from_str(&stored.value).map_err(Error::from))
            .collect()
    }

    /// Remove an environment document.
    pub async fn delete_environment(&self, name: &str) -> Result<()> {
        let key = environment_key(name)?;
        self.kv.delete(&key).await
    }
}

fn environment_key(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(Error::BadRequest("Environment name is missing".to_string()));
    }
    Ok(format!("{}{}", ENVIRONMENT_KEY_PREFIX, name))
}
