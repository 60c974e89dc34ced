// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local key-value backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::{KeyValueStore, VersionedValue};
use crate::error::Result;

/// In-memory [`KeyValueStore`] for tests and simulation runs.
///
/// Versions come from a store-wide counter, so a deleted and recreated key
/// never gets a version it had before.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<BTreeMap<String, VersionedValue>>,
    next_version: AtomicU64,
}

impl MemoryKeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected_version: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).map(|v| v.version.as_str());
        if current != expected_version {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            VersionedValue {
                value: value.to_string(),
                version: self.bump(),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
