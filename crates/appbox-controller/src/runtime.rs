// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for appbox-controller.
//!
//! [`BoxRuntime`] wires the collaborators into a lifecycle, scheduler, health
//! supervisor and HTTP server, so the controller can run inside an existing
//! tokio application or a test.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use appbox_controller::runtime::BoxRuntime;
//!
//! let runtime = BoxRuntime::builder()
//!     .fqdn("box.example.com")
//!     .registry(Arc::new(registry))
//!     .driver(Arc::new(DockerDriver::connect(None)?))
//!     .proxy(Arc::new(proxy))
//!     .dns(Arc::new(ManualDns::new("box.example.com")))
//!     .certificates(Arc::new(certs))
//!     .bind_addr("0.0.0.0:3000".parse()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ...
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::addons::AddonCoordinator;
use crate::apps::{AppService, ServiceSettings};
use crate::appstore::{AppStore, FreeAppStore};
use crate::auth::{Authenticator, StaticAuthenticator};
use crate::driver::ContainerDriver;
use crate::health::{HealthProbe, HealthSupervisor, HealthSupervisorConfig, HttpHealthProbe};
use crate::lifecycle::{Lifecycle, PlatformEnv};
use crate::network::{CertificateStore, DnsProvider, NetworkRegistrar, ReverseProxy};
use crate::registry::AppRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::TaskScheduler;
use crate::server;

/// Builder for creating a [`BoxRuntime`].
pub struct BoxRuntimeBuilder {
    fqdn: Option<String>,
    registry: Option<Arc<dyn AppRegistry>>,
    driver: Option<Arc<dyn ContainerDriver>>,
    proxy: Option<Arc<dyn ReverseProxy>>,
    dns: Option<Arc<dyn DnsProvider>>,
    certificates: Option<Arc<dyn CertificateStore>>,
    addons: AddonCoordinator,
    store: Arc<dyn AppStore>,
    auth: Arc<dyn Authenticator>,
    probe: Arc<dyn HealthProbe>,
    admin_location: String,
    bind_addr: SocketAddr,
    health_config: HealthSupervisorConfig,
    retry: RetryPolicy,
}

impl Default for BoxRuntimeBuilder {
    fn default() -> Self {
        Self {
            fqdn: None,
            registry: None,
            driver: None,
            proxy: None,
            dns: None,
            certificates: None,
            addons: AddonCoordinator::new(),
            store: Arc::new(FreeAppStore),
            auth: Arc::new(StaticAuthenticator::default()),
            probe: Arc::new(HttpHealthProbe::default()),
            admin_location: "my".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            health_config: HealthSupervisorConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl BoxRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Box domain (required).
    pub fn fqdn(mut self, fqdn: impl Into<String>) -> Self {
        self.fqdn = Some(fqdn.into());
        self
    }

    /// App registry (required).
    pub fn registry(mut self, registry: Arc<dyn AppRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Container runtime (required).
    pub fn driver(mut self, driver: Arc<dyn ContainerDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Reverse proxy writer (required).
    pub fn proxy(mut self, proxy: Arc<dyn ReverseProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// DNS provider (required).
    pub fn dns(mut self, dns: Arc<dyn DnsProvider>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Certificate store (required).
    pub fn certificates(mut self, certificates: Arc<dyn CertificateStore>) -> Self {
        self.certificates = Some(certificates);
        self
    }

    /// Addons apps may request.
    ///
    /// Default: none
    pub fn addons(mut self, addons: AddonCoordinator) -> Self {
        self.addons = addons;
        self
    }

    /// App store purchases go through.
    ///
    /// Default: [`FreeAppStore`]
    pub fn app_store(mut self, store: Arc<dyn AppStore>) -> Self {
        self.store = store;
        self
    }

    /// Caller authentication.
    ///
    /// Default: rejects every token
    pub fn authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// Application health probe.
    ///
    /// Default: [`HttpHealthProbe`] against the host loopback
    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Reserved admin location.
    ///
    /// Default: `my`
    pub fn admin_location(mut self, location: impl Into<String>) -> Self {
        self.admin_location = location.into();
        self
    }

    /// Address the HTTP API binds to. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:3000`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Health supervisor poll interval.
    ///
    /// Default: 10 seconds
    pub fn health_poll_interval(mut self, interval: Duration) -> Self {
        self.health_config.poll_interval = interval;
        self
    }

    /// Consecutive failed probes before an app is reported not responding.
    ///
    /// Default: 3
    pub fn health_failure_threshold(mut self, threshold: u32) -> Self {
        self.health_config.failure_threshold = threshold;
        self
    }

    /// Retry policy for external calls made by lifecycle tasks.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<BoxRuntimeConfig> {
        let fqdn = self
            .fqdn
            .ok_or_else(|| anyhow::anyhow!("fqdn is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("driver is required"))?;
        let proxy = self
            .proxy
            .ok_or_else(|| anyhow::anyhow!("proxy is required"))?;
        let dns = self.dns.ok_or_else(|| anyhow::anyhow!("dns is required"))?;
        let certificates = self
            .certificates
            .ok_or_else(|| anyhow::anyhow!("certificates is required"))?;

        let network = NetworkRegistrar::new(proxy, dns, certificates, fqdn.clone())
            .with_retry(self.retry.clone());
        let lifecycle = Lifecycle::new(
            registry.clone(),
            driver.clone(),
            Arc::new(self.addons),
            network,
            PlatformEnv::new(fqdn, &self.admin_location),
        )
        .with_retry(self.retry);

        Ok(BoxRuntimeConfig {
            registry,
            driver,
            lifecycle,
            store: self.store,
            auth: self.auth,
            probe: self.probe,
            admin_location: self.admin_location,
            bind_addr: self.bind_addr,
            health_config: self.health_config,
        })
    }
}

/// Configuration for a [`BoxRuntime`].
pub struct BoxRuntimeConfig {
    registry: Arc<dyn AppRegistry>,
    driver: Arc<dyn ContainerDriver>,
    lifecycle: Lifecycle,
    store: Arc<dyn AppStore>,
    auth: Arc<dyn Authenticator>,
    probe: Arc<dyn HealthProbe>,
    admin_location: String,
    bind_addr: SocketAddr,
    health_config: HealthSupervisorConfig,
}

impl BoxRuntimeConfig {
    /// Resume interrupted tasks, then spawn the health supervisor and HTTP server.
    pub async fn start(self) -> Result<BoxRuntime> {
        let scheduler = TaskScheduler::new(self.lifecycle);

        let resumed = scheduler.resume_pending().await?;
        if resumed > 0 {
            info!(count = resumed, "Resumed interrupted lifecycle tasks");
        }

        let supervisor = HealthSupervisor::new(
            self.registry,
            self.driver,
            self.probe,
            scheduler.clone(),
            self.health_config,
        );
        let health_shutdown = supervisor.shutdown_handle();
        let health_handle = tokio::spawn(async move {
            supervisor.run().await;
        });

        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;

        let service = AppService::new(
            scheduler.clone(),
            self.store,
            self.auth,
            ServiceSettings {
                admin_location: self.admin_location,
                control_port: bind_addr.port(),
            },
        );
        let server_shutdown = Arc::new(Notify::new());
        let server_handle = tokio::spawn(server::serve(
            listener,
            server::router(service.clone()),
            server_shutdown.clone(),
        ));

        info!(bind_addr = %bind_addr, "BoxRuntime started");

        Ok(BoxRuntime {
            server_handle,
            health_handle,
            server_shutdown,
            health_shutdown,
            scheduler,
            service,
            bind_addr,
        })
    }
}

/// A running controller.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BoxRuntime {
    server_handle: JoinHandle<std::io::Result<()>>,
    health_handle: JoinHandle<()>,
    server_shutdown: Arc<Notify>,
    health_shutdown: Arc<Notify>,
    scheduler: TaskScheduler,
    service: AppService,
    bind_addr: SocketAddr,
}

impl BoxRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BoxRuntimeBuilder {
        BoxRuntimeBuilder::new()
    }

    /// Address the HTTP API is bound to.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// App operations, for embedding without HTTP.
    pub fn service(&self) -> &AppService {
        &self.service
    }

    /// Task scheduler.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Stop serving, stop supervision, then cancel lifecycle tasks and wait
    /// for them to reach a step boundary.
    pub async fn shutdown(self) -> Result<()> {
        info!("BoxRuntime shutting down...");

        self.server_shutdown.notify_one();
        self.health_shutdown.notify_one();

        let server_result = match self.server_handle.await {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::anyhow!("server task panicked: {}", e)),
        };

        if let Err(e) = self.health_handle.await {
            error!("Health supervisor task panicked: {}", e);
        }

        self.scheduler.stop_pending_tasks();
        self.scheduler.wait_for_pending_tasks().await;

        match server_result {
            Ok(()) => {
                info!("BoxRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("BoxRuntime server error during shutdown: {}", e);
                Err(e)
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.health_handle.is_finished()
    }
}
