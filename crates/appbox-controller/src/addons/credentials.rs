// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-(app, addon) generated credentials.
//!
//! Issuing credentials for a pair replaces whatever was stored before in one
//! statement, so the previous secret stops verifying the moment the new one
//! exists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::model::AddonKind;

/// Username/secret pair handed to an app for one addon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Client id or user name.
    pub username: String,
    /// Secret or password.
    pub secret: String,
}

/// 64 lowercase hex characters from a fresh random UUID.
pub fn generate_secret() -> String {
    let digest = Sha256::digest(uuid::Uuid::new_v4().as_bytes());
    format!("{:x}", digest)
}

/// Durable credential storage consulted by the addon gateways.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Store credentials for `(app_id, kind)`, replacing any previous pair.
    async fn issue(&self, app_id: &str, kind: AddonKind, credentials: &Credentials)
    -> Result<(), sqlx::Error>;

    /// Current credentials for `(app_id, kind)`.
    async fn get(&self, app_id: &str, kind: AddonKind) -> Result<Option<Credentials>, sqlx::Error>;

    /// Whether `username`/`secret` is the current pair.
    async fn verify(
        &self,
        app_id: &str,
        kind: AddonKind,
        username: &str,
        secret: &str,
    ) -> Result<bool, sqlx::Error> {
        Ok(self
            .get(app_id, kind)
            .await?
            .is_some_and(|c| c.username == username && c.secret == secret))
    }

    /// Drop credentials for `(app_id, kind)`. Absent pairs are fine.
    async fn revoke(&self, app_id: &str, kind: AddonKind) -> Result<(), sqlx::Error>;
}

/// Credential store on the registry's SQLite database.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    /// Use an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn issue(
        &self,
        app_id: &str,
        kind: AddonKind,
        credentials: &Credentials,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO addon_credentials (app_id, kind, username, secret, created_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (app_id, kind) DO UPDATE SET
                username = excluded.username,
                secret = excluded.secret,
                created_at = excluded.created_at
            "#,
        )
        .bind(app_id)
        .bind(kind.as_str())
        .bind(&credentials.username)
        .bind(&credentials.secret)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, app_id: &str, kind: AddonKind) -> Result<Option<Credentials>, sqlx::Error> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT username, secret FROM addon_credentials WHERE app_id = ? AND kind = ?",
        )
        .bind(app_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(username, secret)| Credentials { username, secret }))
    }

    async fn revoke(&self, app_id: &str, kind: AddonKind) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM addon_credentials WHERE app_id = ? AND kind = ?")
            .bind(app_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory credential store.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    entries: Arc<Mutex<HashMap<(String, AddonKind), Credentials>>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored pairs.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn issue(
        &self,
        app_id: &str,
        kind: AddonKind,
        credentials: &Credentials,
    ) -> Result<(), sqlx::Error> {
        self.entries
            .lock()
            .await
            .insert((app_id.to_string(), kind), credentials.clone());
        Ok(())
    }

    async fn get(&self, app_id: &str, kind: AddonKind) -> Result<Option<Credentials>, sqlx::Error> {
        Ok(self
            .entries
            .lock()
            .await
            .get(&(app_id.to_string(), kind))
            .cloned())
    }

    async fn revoke(&self, app_id: &str, kind: AddonKind) -> Result<(), sqlx::Error> {
        self.entries.lock().await.remove(&(app_id.to_string(), kind));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(secret, generate_secret());
    }

    #[tokio::test]
    async fn test_sqlite_reissue_invalidates_previous() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run(&pool).await.unwrap();
        let store = SqliteCredentialStore::new(pool);

        let old = Credentials {
            username: "cid-old".into(),
            secret: "s1".into(),
        };
        let new = Credentials {
            username: "cid-new".into(),
            secret: "s2".into(),
        };
        store.issue("a1", AddonKind::Oauth, &old).await.unwrap();
        store.issue("a1", AddonKind::Oauth, &new).await.unwrap();

        assert!(!store.verify("a1", AddonKind::Oauth, "cid-old", "s1").await.unwrap());
        assert!(store.verify("a1", AddonKind::Oauth, "cid-new", "s2").await.unwrap());

        store.revoke("a1", AddonKind::Oauth).await.unwrap();
        assert!(store.get("a1", AddonKind::Oauth).await.unwrap().is_none());
    }
}
