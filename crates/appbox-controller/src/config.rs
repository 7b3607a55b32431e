// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for appbox-controller.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Network created at startup when `APPBOX_DOCKER_NETWORK` is unset.
pub const DEFAULT_DOCKER_NETWORK: &str = "appbox";

/// Controller configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Box domain; apps are served at `<location>.<fqdn>`.
    pub fqdn: String,
    /// SQLite URL of the registry database.
    pub database_url: String,
    /// Control-plane HTTP address.
    pub http_addr: SocketAddr,
    /// Data directory (database, nginx configs, certificates by default).
    pub data_dir: PathBuf,
    /// Location reserved for the admin UI.
    pub admin_location: String,
    /// Directory the per-app nginx configs are written to.
    pub nginx_appconfig_dir: PathBuf,
    /// Command run after nginx configs change. Empty disables reloads.
    pub nginx_reload_cmd: Option<String>,
    /// Directory custom certificates are written to.
    pub cert_dir: PathBuf,
    /// App store origin; `None` means purchases always succeed.
    pub appstore_origin: Option<String>,
    /// Token presented to the app store.
    pub appstore_token: Option<String>,
    /// Bearer token granting admin access to the API. Unset rejects every request.
    pub admin_token: Option<String>,
    /// Password required to confirm uninstalls. Unset rejects every uninstall.
    pub admin_password: Option<String>,
    /// Image used for redis addon containers.
    pub redis_image: String,
    /// Mail relay handed to apps using the sendmail addon.
    pub mail_server: String,
    /// Port of the mail relay.
    pub mail_port: u16,
    /// Interval between health supervision passes.
    pub health_poll_interval: Duration,
    /// User-defined Docker network app and addon containers join.
    pub docker_network: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let fqdn =
            std::env::var("APPBOX_FQDN").map_err(|_| ConfigError::MissingEnvVar("APPBOX_FQDN"))?;

        let data_dir =
            PathBuf::from(std::env::var("APPBOX_DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let database_url = std::env::var("APPBOX_DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/appbox.db?mode=rwc", data_dir.to_string_lossy())
        });

        let port: u16 = std::env::var("APPBOX_HTTP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort("APPBOX_HTTP_PORT"))?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let admin_location =
            std::env::var("APPBOX_ADMIN_LOCATION").unwrap_or_else(|_| "my".to_string());

        let nginx_appconfig_dir = std::env::var("APPBOX_NGINX_APPCONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("nginx").join("applications"));

        let nginx_reload_cmd = std::env::var("APPBOX_NGINX_RELOAD_CMD")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());

        let cert_dir = std::env::var("APPBOX_CERT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("nginx").join("cert"));

        let appstore_origin = std::env::var("APPBOX_APPSTORE_ORIGIN")
            .ok()
            .map(|origin| origin.trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty());
        let appstore_token = std::env::var("APPBOX_APPSTORE_TOKEN").ok();

        let admin_token = std::env::var("APPBOX_ADMIN_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());
        let admin_password = std::env::var("APPBOX_ADMIN_PASSWORD")
            .ok()
            .filter(|password| !password.is_empty());

        let redis_image =
            std::env::var("APPBOX_REDIS_IMAGE").unwrap_or_else(|_| "redis:7-alpine".to_string());

        let mail_server = std::env::var("APPBOX_MAIL_SERVER").unwrap_or_else(|_| "mail".to_string());
        let mail_port: u16 = std::env::var("APPBOX_MAIL_PORT")
            .unwrap_or_else(|_| "2525".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort("APPBOX_MAIL_PORT"))?;

        let health_poll_secs: u64 = std::env::var("APPBOX_HEALTH_POLL_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidNumber("APPBOX_HEALTH_POLL_SECS"))?;

        let docker_network = std::env::var("APPBOX_DOCKER_NETWORK")
            .ok()
            .filter(|network| !network.is_empty())
            .unwrap_or_else(|| DEFAULT_DOCKER_NETWORK.to_string());

        Ok(Self {
            fqdn,
            database_url,
            http_addr,
            data_dir,
            admin_location,
            nginx_appconfig_dir,
            nginx_reload_cmd,
            cert_dir,
            appstore_origin,
            appstore_token,
            admin_token,
            admin_password,
            redis_image,
            mail_server,
            mail_port,
            health_poll_interval: Duration::from_secs(health_poll_secs.max(1)),
            docker_network,
        })
    }

    /// Origin of the admin UI, handed to apps as `WEBADMIN_ORIGIN`.
    pub fn admin_origin(&self) -> String {
        format!("https://{}.{}", self.admin_location, self.fqdn)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number in {0}")]
    InvalidPort(&'static str),
    /// A numeric setting could not be parsed.
    #[error("Invalid number in {0}")]
    InvalidNumber(&'static str),
}
