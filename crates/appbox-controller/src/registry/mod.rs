// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable store of [`AppRecord`]s and their port bindings.
//!
//! All operations are point operations on a single record. Multi-step
//! consistency is the orchestrator's job; the registry only guarantees that
//! `add` enforces id, location and host-port uniqueness atomically.

mod memory;
mod sqlite;

pub use memory::MemoryAppRegistry;
pub use sqlite::SqliteAppRegistry;

use async_trait::async_trait;

use crate::model::{AppRecord, AppUpdate};

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No record with this id.
    #[error("app not found: {0}")]
    NotFound(String),

    /// Duplicate id, location or host port.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt record {app_id}: {details}")]
    Corrupt {
        /// Offending record.
        app_id: String,
        /// What failed to decode.
        details: String,
    },
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Durable application store.
#[async_trait]
pub trait AppRegistry: Send + Sync {
    /// Fetch a record by id.
    async fn get(&self, id: &str) -> Result<Option<AppRecord>>;

    /// Fetch the record holding `location`, if any.
    async fn get_by_location(&self, location: &str) -> Result<Option<AppRecord>>;

    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<AppRecord>>;

    /// Insert a new record with its port bindings.
    ///
    /// Fails with [`RegistryError::AlreadyExists`] on a duplicate id, location
    /// or host port.
    async fn add(&self, record: &AppRecord) -> Result<()>;

    /// Apply a typed update and return the updated record.
    ///
    /// Fails with [`RegistryError::NotFound`] if absent, and with
    /// [`RegistryError::AlreadyExists`] if a reconfigure collides with another
    /// record's location or host ports.
    async fn update(&self, id: &str, update: AppUpdate) -> Result<AppRecord>;

    /// Delete a record and its port bindings. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}
