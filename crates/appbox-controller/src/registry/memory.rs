// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry for tests and embedding.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{AppRegistry, RegistryError, Result};
use crate::model::{AppRecord, AppUpdate};

/// Registry keeping records in insertion order behind a mutex.
#[derive(Clone, Default)]
pub struct MemoryAppRegistry {
    records: Arc<Mutex<Vec<AppRecord>>>,
}

impl MemoryAppRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

/// First uniqueness violation of `candidate` against the other records.
fn find_collision<'a>(
    candidate: &AppRecord,
    others: impl Iterator<Item = &'a AppRecord>,
) -> Option<String> {
    for other in others {
        if other.location == candidate.location {
            return Some(format!("location {}", candidate.location));
        }
        for port in candidate.port_bindings.values() {
            if other.port_bindings.values().any(|p| p == port) {
                return Some(format!("host port {}", port));
            }
        }
    }
    None
}

#[async_trait]
impl AppRegistry for MemoryAppRegistry {
    async fn get(&self, id: &str) -> Result<Option<AppRecord>> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn get_by_location(&self, location: &str) -> Result<Option<AppRecord>> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.location == location).cloned())
    }

    async fn list(&self) -> Result<Vec<AppRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn add(&self, record: &AppRecord) -> Result<()> {
        let mut records = self.records.lock().await;

        if records.iter().any(|r| r.id == record.id) {
            return Err(RegistryError::AlreadyExists(format!("app {}", record.id)));
        }
        if let Some(what) = find_collision(record, records.iter()) {
            return Err(RegistryError::AlreadyExists(what));
        }

        records.push(record.clone());
        Ok(())
    }

    async fn update(&self, id: &str, update: AppUpdate) -> Result<AppRecord> {
        let mut records = self.records.lock().await;

        let index = records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let mut updated = records[index].clone();
        update.apply(&mut updated);

        if matches!(update, AppUpdate::Reconfigure { .. }) {
            let others = records.iter().filter(|r| r.id != id);
            if let Some(what) = find_collision(&updated, others) {
                return Err(RegistryError::AlreadyExists(what));
            }
        }

        records[index] = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }
}
