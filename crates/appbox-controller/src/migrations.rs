// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for appbox-controller.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use appbox_controller::migrations;
//!
//! let pool = SqlitePool::connect("sqlite://.data/appbox.db?mode=rwc").await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with the registry and credential tables embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
