// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network registration: reverse-proxy route, DNS record and TLS material.
//!
//! `register` runs, in order:
//!
//! ```text
//! 1. write the proxy route      (skipped when the file is already current)
//! 2. upsert the DNS record      (skipped when the provider already has it)
//! 3. install or drop custom TLS material
//! 4. reload the proxy
//! ```
//!
//! A DNS failure after the route was written still fails the call; the route
//! stays in place and a repair run picks up at the DNS step because step 1
//! finds nothing to change. `unregister` runs the inverse and is best-effort.

mod certs;
mod dns;
pub mod mock;
mod nginx;

pub use certs::FileCertificateStore;
pub use dns::ManualDns;
pub use mock::{MemoryCertificateStore, MemoryDns, MemoryProxy};
pub use nginx::NginxProxy;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::model::TlsMaterial;
use crate::retry::RetryPolicy;

/// Network registration errors, tagged with the failing stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// Proxy route write, removal or reload failed.
    #[error("reverse proxy: {0}")]
    Proxy(String),

    /// DNS provider call failed.
    #[error("dns: {0}")]
    Dns(String),

    /// Certificate install or removal failed.
    #[error("certificate: {0}")]
    Certificate(String),
}

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// A proxy route for one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// App id; one route per app.
    pub app_id: String,
    /// Public host name, `<location>.<fqdn>`.
    pub vhost: String,
    /// Loopback port the app is published on.
    pub http_port: u16,
    /// Whether the app has its own certificate.
    pub custom_tls: bool,
}

/// Reverse-proxy configuration writer and reloader.
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Write the route. Returns whether anything changed.
    async fn write_route(&self, route: &Route) -> Result<bool>;

    /// Remove the route of an app (no-op when absent).
    async fn remove_route(&self, app_id: &str) -> Result<()>;

    /// Make the proxy pick up route changes.
    async fn reload(&self) -> Result<()>;
}

/// DNS provider client.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Current target of `name`, if any.
    async fn lookup(&self, name: &str) -> Result<Option<String>>;

    /// Point `name` at `target`.
    async fn upsert(&self, name: &str, target: &str) -> Result<()>;

    /// Remove `name` (no-op when absent).
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Storage of per-vhost TLS material.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Install cert and key for `vhost`, replacing any previous pair.
    async fn install(&self, vhost: &str, tls: &TlsMaterial) -> Result<()>;

    /// Remove the pair for `vhost` (no-op when absent).
    async fn remove(&self, vhost: &str) -> Result<()>;
}

/// Coordinates proxy, DNS and certificates for app subdomains.
#[derive(Clone)]
pub struct NetworkRegistrar {
    proxy: Arc<dyn ReverseProxy>,
    dns: Arc<dyn DnsProvider>,
    certs: Arc<dyn CertificateStore>,
    fqdn: String,
    retry: RetryPolicy,
}

impl NetworkRegistrar {
    /// Create a registrar for apps under `fqdn`.
    pub fn new(
        proxy: Arc<dyn ReverseProxy>,
        dns: Arc<dyn DnsProvider>,
        certs: Arc<dyn CertificateStore>,
        fqdn: impl Into<String>,
    ) -> Self {
        Self {
            proxy,
            dns,
            certs,
            fqdn: fqdn.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy for collaborator calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Public host name of a location.
    pub fn vhost(&self, location: &str) -> String {
        format!("{}.{}", location, self.fqdn)
    }

    /// Register `location` for an app.
    pub async fn register(
        &self,
        app_id: &str,
        location: &str,
        http_port: u16,
        tls: Option<&TlsMaterial>,
    ) -> Result<()> {
        let vhost = self.vhost(location);
        let route = Route {
            app_id: app_id.to_string(),
            vhost: vhost.clone(),
            http_port,
            custom_tls: tls.is_some(),
        };

        let changed = self
            .retry
            .run("write_route", || self.proxy.write_route(&route))
            .await?;
        if !changed {
            debug!(app_id = %app_id, vhost = %vhost, "Proxy route already current");
        }

        let current = self.retry.run("dns_lookup", || self.dns.lookup(&vhost)).await?;
        if current.as_deref() == Some(self.fqdn.as_str()) {
            debug!(app_id = %app_id, vhost = %vhost, "DNS record already present");
        } else {
            self.retry
                .run("dns_upsert", || self.dns.upsert(&vhost, &self.fqdn))
                .await?;
        }

        match tls {
            Some(tls) => {
                self.retry
                    .run("cert_install", || self.certs.install(&vhost, tls))
                    .await?
            }
            None => self.retry.run("cert_remove", || self.certs.remove(&vhost)).await?,
        }

        self.retry.run("proxy_reload", || self.proxy.reload()).await?;

        info!(app_id = %app_id, vhost = %vhost, http_port = http_port, "Subdomain registered");
        Ok(())
    }

    /// Unregister `location`. Every stage is attempted; the first error is returned.
    pub async fn unregister(&self, app_id: &str, location: &str) -> Result<()> {
        let vhost = self.vhost(location);
        let mut first_error = None;

        let proxy_result = match self
            .retry
            .run("remove_route", || self.proxy.remove_route(app_id))
            .await
        {
            Ok(()) => self.retry.run("proxy_reload", || self.proxy.reload()).await,
            Err(e) => Err(e),
        };
        let stages = [
            proxy_result,
            self.retry.run("dns_remove", || self.dns.remove(&vhost)).await,
            self.retry.run("cert_remove", || self.certs.remove(&vhost)).await,
        ];

        for result in stages {
            if let Err(e) = result {
                warn!(app_id = %app_id, vhost = %vhost, error = %e, "Network unregistration step failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(app_id = %app_id, vhost = %vhost, "Subdomain unregistered");
                Ok(())
            }
        }
    }
}
