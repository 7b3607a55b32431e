// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed registry.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::{AppRegistry, RegistryError, Result};
use crate::model::{
    AccessRestriction, AppRecord, AppUpdate, InstallationState, Manifest, PortBindings, RunState,
    TlsMaterial,
};

/// SQLite-backed application registry.
#[derive(Clone)]
pub struct SqliteAppRegistry {
    pool: SqlitePool,
}

impl SqliteAppRegistry {
    /// Wrap an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        crate::migrations::run(&pool)
            .await
            .map_err(|e| RegistryError::Database(e.into()))?;

        Ok(Self { pool })
    }

    /// Create the database file (and parent directories) at `path` and connect.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::Database(e.into()))?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Underlying pool, shared with the addon credential store.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_bindings(&self, app_id: &str) -> Result<PortBindings> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT env_name, host_port FROM app_port_bindings WHERE app_id = ?",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(name, port)| Ok((name, decode_port(app_id, port)?)))
            .collect()
    }

    async fn hydrate(&self, row: AppRow) -> Result<AppRecord> {
        let bindings = self.load_bindings(&row.id).await?;
        row.into_record(bindings)
    }
}

#[derive(sqlx::FromRow)]
struct AppRow {
    id: String,
    app_store_id: String,
    manifest_json: String,
    location: String,
    access_restriction_json: Option<String>,
    container_id: Option<String>,
    http_port: Option<i64>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
    installation_state: String,
    run_state: Option<String>,
    last_error: Option<String>,
    creation_time: DateTime<Utc>,
}

const APP_COLUMNS: &str = "id, app_store_id, manifest_json, location, access_restriction_json, \
     container_id, http_port, tls_cert, tls_key, installation_state, run_state, last_error, \
     creation_time";

impl AppRow {
    fn into_record(self, port_bindings: PortBindings) -> Result<AppRecord> {
        let id = self.id;
        let corrupt = |details: String| RegistryError::Corrupt {
            app_id: id.clone(),
            details,
        };

        let manifest: Manifest = serde_json::from_str(&self.manifest_json)
            .map_err(|e| corrupt(format!("manifest: {}", e)))?;
        let access_restriction = self
            .access_restriction_json
            .map(|json| serde_json::from_str::<AccessRestriction>(&json))
            .transpose()
            .map_err(|e| corrupt(format!("access restriction: {}", e)))?;
        let installation_state = self
            .installation_state
            .parse::<InstallationState>()
            .map_err(corrupt)?;
        let run_state = self
            .run_state
            .map(|s| s.parse::<RunState>())
            .transpose()
            .map_err(corrupt)?;
        let http_port = self
            .http_port
            .map(|port| decode_port(&id, port))
            .transpose()?;
        let tls = match (self.tls_cert, self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsMaterial { cert, key }),
            _ => None,
        };

        Ok(AppRecord {
            id,
            app_store_id: self.app_store_id,
            manifest,
            location: self.location,
            port_bindings,
            access_restriction,
            container_id: self.container_id,
            http_port,
            tls,
            installation_state,
            run_state,
            creation_time: self.creation_time,
            last_error: self.last_error,
        })
    }
}

fn decode_port(app_id: &str, port: i64) -> Result<u16> {
    u16::try_from(port).map_err(|_| RegistryError::Corrupt {
        app_id: app_id.to_string(),
        details: format!("port {} out of range", port),
    })
}

fn encode_json<T: serde::Serialize>(app_id: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| RegistryError::Corrupt {
        app_id: app_id.to_string(),
        details: e.to_string(),
    })
}

/// Translate unique-constraint violations into [`RegistryError::AlreadyExists`].
fn map_write_error(err: sqlx::Error, record: &str) -> RegistryError {
    if let Some(db_err) = err.as_database_error()
        && db_err.is_unique_violation()
    {
        let message = db_err.message();
        let what = if message.contains("apps.location") {
            "location".to_string()
        } else if message.contains("host_port") {
            "host port".to_string()
        } else {
            format!("app {}", record)
        };
        return RegistryError::AlreadyExists(what);
    }
    RegistryError::Database(err)
}

async fn insert_bindings(
    tx: &mut Transaction<'_, Sqlite>,
    app_id: &str,
    bindings: &PortBindings,
) -> Result<()> {
    for (name, port) in bindings {
        sqlx::query("INSERT INTO app_port_bindings (app_id, env_name, host_port) VALUES (?, ?, ?)")
            .bind(app_id)
            .bind(name)
            .bind(i64::from(*port))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_write_error(e, app_id))?;
    }
    Ok(())
}

#[async_trait]
impl AppRegistry for SqliteAppRegistry {
    async fn get(&self, id: &str) -> Result<Option<AppRecord>> {
        let row = sqlx::query_as::<_, AppRow>(&format!(
            "SELECT {} FROM apps WHERE id = ?",
            APP_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_by_location(&self, location: &str) -> Result<Option<AppRecord>> {
        let row = sqlx::query_as::<_, AppRow>(&format!(
            "SELECT {} FROM apps WHERE location = ?",
            APP_COLUMNS
        ))
        .bind(location)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<AppRecord>> {
        let rows = sqlx::query_as::<_, AppRow>(&format!(
            "SELECT {} FROM apps ORDER BY creation_time, id",
            APP_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let binding_rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT app_id, env_name, host_port FROM app_port_bindings")
                .fetch_all(&self.pool)
                .await?;

        let mut bindings: HashMap<String, PortBindings> = HashMap::new();
        for (app_id, name, port) in binding_rows {
            let port = decode_port(&app_id, port)?;
            bindings.entry(app_id).or_default().insert(name, port);
        }

        rows.into_iter()
            .map(|row| {
                let app_bindings = bindings.remove(&row.id).unwrap_or_default();
                row.into_record(app_bindings)
            })
            .collect()
    }

    async fn add(&self, record: &AppRecord) -> Result<()> {
        let manifest_json = encode_json(&record.id, &record.manifest)?;
        let access_json = record
            .access_restriction
            .as_ref()
            .map(|restriction| encode_json(&record.id, restriction))
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO apps (id, app_store_id, manifest_json, location, access_restriction_json,
                              container_id, http_port, tls_cert, tls_key, installation_state,
                              run_state, last_error, creation_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.app_store_id)
        .bind(manifest_json)
        .bind(&record.location)
        .bind(access_json)
        .bind(&record.container_id)
        .bind(record.http_port.map(i64::from))
        .bind(record.tls.as_ref().map(|t| t.cert.as_str()))
        .bind(record.tls.as_ref().map(|t| t.key.as_str()))
        .bind(record.installation_state.as_str())
        .bind(record.run_state.map(|s| s.as_str()))
        .bind(&record.last_error)
        .bind(record.creation_time)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, &record.id))?;

        insert_bindings(&mut tx, &record.id, &record.port_bindings).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, id: &str, update: AppUpdate) -> Result<AppRecord> {
        let mut tx = self.pool.begin().await?;

        let result = match &update {
            AppUpdate::InstallationState { state, last_error } => {
                sqlx::query("UPDATE apps SET installation_state = ?, last_error = ? WHERE id = ?")
                    .bind(state.as_str())
                    .bind(last_error)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
            }
            AppUpdate::Container {
                container_id,
                http_port,
            } => {
                sqlx::query("UPDATE apps SET container_id = ?, http_port = ? WHERE id = ?")
                    .bind(container_id)
                    .bind(http_port.map(i64::from))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
            }
            AppUpdate::RunState(run_state) => {
                sqlx::query("UPDATE apps SET run_state = ? WHERE id = ?")
                    .bind(run_state.map(|s| s.as_str()))
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
            }
            AppUpdate::LastError(last_error) => {
                sqlx::query("UPDATE apps SET last_error = ? WHERE id = ?")
                    .bind(last_error)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
            }
            AppUpdate::Reconfigure { fields, state } => {
                let access_json = fields
                    .access_restriction
                    .as_ref()
                    .map(|restriction| encode_json(id, restriction))
                    .transpose()?;

                let result = sqlx::query(
                    r#"
                    UPDATE apps
                    SET location = ?, access_restriction_json = ?, tls_cert = ?, tls_key = ?,
                        installation_state = ?, last_error = NULL
                    WHERE id = ?
                    "#,
                )
                .bind(&fields.location)
                .bind(access_json)
                .bind(fields.tls.as_ref().map(|t| t.cert.as_str()))
                .bind(fields.tls.as_ref().map(|t| t.key.as_str()))
                .bind(state.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_write_error(e, id))?;

                if result.rows_affected() > 0 {
                    sqlx::query("DELETE FROM app_port_bindings WHERE app_id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    insert_bindings(&mut tx, id, &fields.port_bindings).await?;
                }
                result
            }
        };

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }

        tx.commit().await?;

        self.get(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM app_port_bindings WHERE app_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM apps WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
