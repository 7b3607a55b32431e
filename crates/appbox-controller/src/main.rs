// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Appbox Controller - control plane of a single-host app box
//!
//! An HTTP server responsible for:
//! - App lifecycle (install, configure, start, stop, uninstall)
//! - Addon provisioning (redis, oauth, sendmail)
//! - Subdomain registration (nginx route, DNS, TLS)
//! - Health supervision of installed apps

use std::sync::Arc;
use tracing::{info, warn};

use appbox_controller::addons::{
    AddonCoordinator, OAuthAddon, RedisAddon, SendmailAddon, SqliteCredentialStore,
};
use appbox_controller::appstore::{AppStore, FreeAppStore, HttpAppStore};
use appbox_controller::auth::StaticAuthenticator;
use appbox_controller::config::Config;
use appbox_controller::driver::DockerDriver;
use appbox_controller::network::{FileCertificateStore, ManualDns, NginxProxy};
use appbox_controller::registry::SqliteAppRegistry;
use appbox_controller::runtime::BoxRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "appbox_controller=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        fqdn = %config.fqdn,
        http_addr = %config.http_addr,
        data_dir = %config.data_dir.display(),
        "Starting Appbox Controller"
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(&config.nginx_appconfig_dir).await?;
    tokio::fs::create_dir_all(&config.cert_dir).await?;

    // Connects and applies migrations
    let registry = SqliteAppRegistry::connect(&config.database_url).await?;
    info!("Registry database ready");

    let driver = DockerDriver::connect(&config.docker_network)?;
    driver.ensure_network().await?;
    info!(network = %config.docker_network, "Container network ready");
    let driver = Arc::new(driver);
    let credentials = Arc::new(SqliteCredentialStore::new(registry.pool().clone()));

    let addons = AddonCoordinator::new()
        .with_addon(Arc::new(RedisAddon::new(
            driver.clone(),
            credentials.clone(),
            &config.redis_image,
        )))
        .with_addon(Arc::new(OAuthAddon::new(
            credentials.clone(),
            config.admin_origin(),
        )))
        .with_addon(Arc::new(SendmailAddon::new(
            credentials,
            &config.mail_server,
            config.mail_port,
            &config.fqdn,
        )));

    let store: Arc<dyn AppStore> = match &config.appstore_origin {
        Some(origin) => Arc::new(HttpAppStore::new(
            origin,
            config.appstore_token.clone().unwrap_or_default(),
        )),
        None => {
            warn!("No app store configured, purchases are skipped");
            Arc::new(FreeAppStore)
        }
    };

    let auth = StaticAuthenticator::new(
        config.admin_token.as_deref(),
        config.admin_password.as_deref(),
    );
    if config.admin_token.is_none() {
        warn!("APPBOX_ADMIN_TOKEN is not set, every API request will be rejected");
    }

    let runtime = BoxRuntime::builder()
        .fqdn(&config.fqdn)
        .registry(Arc::new(registry))
        .driver(driver)
        .proxy(Arc::new(NginxProxy::new(
            config.nginx_appconfig_dir.clone(),
            config.cert_dir.clone(),
            config.nginx_reload_cmd.clone(),
        )))
        .dns(Arc::new(ManualDns::new(&config.fqdn)))
        .certificates(Arc::new(FileCertificateStore::new(config.cert_dir.clone())))
        .addons(addons)
        .app_store(store)
        .authenticator(Arc::new(auth))
        .admin_location(&config.admin_location)
        .bind_addr(config.http_addr)
        .health_poll_interval(config.health_poll_interval)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "Controller ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Appbox Controller shut down");

    Ok(())
}
