// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis cache addon: one password-protected container per app.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Addon, AddonContext, AddonError, CredentialStore, Credentials, Result, generate_secret};
use crate::driver::{ContainerDriver, ContainerSpec, DriverError};
use crate::model::AddonKind;
use crate::retry::RetryPolicy;

const REDIS_PORT: u16 = 6379;

/// Deterministic addon container name, e.g. `redis-<app id>`.
pub fn addon_container_name(kind: AddonKind, app_id: &str) -> String {
    format!("{}-{}", kind.as_str(), app_id)
}

/// Cache addon backed by a redis container.
pub struct RedisAddon {
    driver: Arc<dyn ContainerDriver>,
    credentials: Arc<dyn CredentialStore>,
    image: String,
    retry: RetryPolicy,
}

impl RedisAddon {
    /// Create the addon.
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        credentials: Arc<dyn CredentialStore>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            credentials,
            image: image.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy for runtime calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn driver_err(source: DriverError) -> AddonError {
        AddonError::Driver {
            kind: AddonKind::Redis,
            source,
        }
    }

    fn store_err(source: sqlx::Error) -> AddonError {
        AddonError::Credentials {
            kind: AddonKind::Redis,
            source,
        }
    }
}

#[async_trait]
impl Addon for RedisAddon {
    fn kind(&self) -> AddonKind {
        AddonKind::Redis
    }

    async fn provision(&self, ctx: &AddonContext) -> Result<Vec<(String, String)>> {
        let name = addon_container_name(AddonKind::Redis, &ctx.app_id);
        let password = generate_secret();

        self.retry
            .run_if("pull_image", || self.driver.pull_image(&self.image), DriverError::is_transient)
            .await
            .map_err(Self::driver_err)?;

        // Existing container carries the old password; replace it.
        self.driver
            .remove_container(&name)
            .await
            .map_err(Self::driver_err)?;

        let spec = ContainerSpec {
            name: name.clone(),
            image: self.image.clone(),
            hostname: Some(name.clone()),
            cmd: Some(vec![
                "redis-server".to_string(),
                "--requirepass".to_string(),
                password.clone(),
            ]),
            labels: [
                ("appbox.app_id".to_string(), ctx.app_id.clone()),
                ("appbox.addon".to_string(), AddonKind::Redis.to_string()),
            ]
            .into(),
            ..Default::default()
        };
        self.driver
            .create_container(&spec)
            .await
            .map_err(Self::driver_err)?;
        self.driver
            .start_container(&name)
            .await
            .map_err(Self::driver_err)?;

        self.credentials
            .issue(
                &ctx.app_id,
                AddonKind::Redis,
                &Credentials {
                    username: String::new(),
                    secret: password.clone(),
                },
            )
            .await
            .map_err(Self::store_err)?;

        debug!(app_id = %ctx.app_id, container = %name, "Redis container ready");

        // The container name resolves on the box network the app shares.

        Ok(vec![
            (
                "REDIS_URL".to_string(),
                format!("redis://:{}@{}:{}", password, name, REDIS_PORT),
            ),
            ("REDIS_HOST".to_string(), name),
            ("REDIS_PORT".to_string(), REDIS_PORT.to_string()),
            ("REDIS_PASSWORD".to_string(), password),
        ])
    }

    async fn start(&self, app_id: &str) -> Result<()> {
        self.driver
            .start_container(&addon_container_name(AddonKind::Redis, app_id))
            .await
            .map_err(Self::driver_err)
    }

    async fn stop(&self, app_id: &str) -> Result<()> {
        self.driver
            .stop_container(&addon_container_name(AddonKind::Redis, app_id))
            .await
            .map_err(Self::driver_err)
    }

    async fn teardown(&self, app_id: &str) -> Result<()> {
        self.driver
            .remove_container(&addon_container_name(AddonKind::Redis, app_id))
            .await
            .map_err(Self::driver_err)
    }

    async fn deprovision(&self, app_id: &str) -> Result<()> {
        self.teardown(app_id).await?;
        self.credentials
            .revoke(app_id, AddonKind::Redis)
            .await
            .map_err(Self::store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::MemoryCredentialStore;
    use crate::driver::MockDriver;

    fn ctx() -> AddonContext {
        AddonContext {
            app_id: "a1".into(),
            location: "foo".into(),
            app_origin: "https://foo.box.test".into(),
            options: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_reprovision_replaces_container_and_password() {
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let addon = RedisAddon::new(driver.clone(), store.clone(), "redis:7-alpine")
            .with_retry(RetryPolicy::immediate(1));

        let first = addon.provision(&ctx()).await.unwrap();
        let second = addon.provision(&ctx()).await.unwrap();

        assert_eq!(driver.containers_named("redis-a1").await.len(), 1);
        assert_ne!(first, second);
        let current = store.get("a1", AddonKind::Redis).await.unwrap().unwrap();
        assert!(second.contains(&("REDIS_PASSWORD".to_string(), current.secret)));
    }

    #[tokio::test]
    async fn test_env_addresses_container_by_network_name() {
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let addon = RedisAddon::new(driver.clone(), store, "redis:7-alpine")
            .with_retry(RetryPolicy::immediate(1));

        let env: std::collections::BTreeMap<_, _> =
            addon.provision(&ctx()).await.unwrap().into_iter().collect();

        let container = &driver.containers_named("redis-a1").await[0];
        assert_eq!(env["REDIS_HOST"], container.spec.name);
        assert_eq!(container.spec.hostname.as_deref(), Some("redis-a1"));
        assert_eq!(
            env["REDIS_URL"],
            format!("redis://:{}@redis-a1:6379", env["REDIS_PASSWORD"])
        );
    }

    #[tokio::test]
    async fn test_deprovision_removes_container_and_credentials() {
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let addon = RedisAddon::new(driver.clone(), store.clone(), "redis:7-alpine");

        addon.provision(&ctx()).await.unwrap();
        addon.deprovision("a1").await.unwrap();

        assert!(driver.containers_named("redis-a1").await.is_empty());
        assert!(store.is_empty().await);
    }
}
