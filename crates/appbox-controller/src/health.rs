// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health supervisor for installed applications.
//!
//! Periodically inspects each installed app's container and, when it is
//! running, probes the manifest's health-check path. Observations only ever
//! touch `run_state`; apps owned by a lifecycle task are skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::driver::ContainerDriver;
use crate::model::{AppRecord, AppUpdate, InstallationState, RunState};
use crate::registry::{AppRegistry, RegistryError};
use crate::scheduler::TaskScheduler;

/// Health supervisor configuration.
#[derive(Debug, Clone)]
pub struct HealthSupervisorConfig {
    /// How often every installed app is checked.
    pub poll_interval: Duration,
    /// Consecutive failed probes before an app is `NotResponding`.
    pub failure_threshold: u32,
}

impl Default for HealthSupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

/// Application-level health check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Whether the app answers healthy on `http_port` at `path`.
    async fn probe(&self, http_port: u16, path: &str) -> bool;
}

/// Probes `http://<host>:<port><path>` and expects a 2xx answer.
#[derive(Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    host: String,
}

impl HttpHealthProbe {
    /// Probe apps published on the host loopback, each request bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, http_port: u16, path: &str) -> bool {
        let url = format!("http://{}:{}{}", self.host, http_port, path);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "Health probe failed");
                false
            }
        }
    }
}

/// Background worker keeping `run_state` in line with what the runtime reports.
pub struct HealthSupervisor {
    registry: Arc<dyn AppRegistry>,
    driver: Arc<dyn ContainerDriver>,
    probe: Arc<dyn HealthProbe>,
    scheduler: TaskScheduler,
    config: HealthSupervisorConfig,
    failures: Mutex<HashMap<String, u32>>,
    shutdown: Arc<Notify>,
}

impl HealthSupervisor {
    /// Create a supervisor.
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        driver: Arc<dyn ContainerDriver>,
        probe: Arc<dyn HealthProbe>,
        scheduler: TaskScheduler,
        config: HealthSupervisorConfig,
    ) -> Self {
        Self {
            registry,
            driver,
            probe,
            scheduler,
            config,
            failures: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the supervision loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            failure_threshold = self.config.failure_threshold,
            "Health supervisor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Health supervisor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.supervise_once().await {
                        error!(error = %e, "Health supervision pass failed");
                    }
                }
            }
        }

        info!("Health supervisor stopped");
    }

    /// Check every installed app once.
    pub async fn supervise_once(&self) -> Result<(), RegistryError> {
        let records = self.registry.list().await?;

        self.failures
            .lock()
            .await
            .retain(|app_id, _| records.iter().any(|r| &r.id == app_id));

        for record in records {
            if record.installation_state != InstallationState::Installed
                || self.scheduler.is_active(&record.id)
            {
                continue;
            }

            let Some(observed) = self.observe(&record).await else {
                continue;
            };

            // A task may have taken the app over while we were probing.
            if record.run_state != Some(observed) && !self.scheduler.is_active(&record.id) {
                info!(
                    app_id = %record.id,
                    from = ?record.run_state,
                    to = %observed.as_str(),
                    "Run state changed"
                );
                match self
                    .registry
                    .update(&record.id, AppUpdate::RunState(Some(observed)))
                    .await
                {
                    Ok(_) | Err(RegistryError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(())
    }

    /// Observed run state, or `None` when nothing conclusive was seen.
    async fn observe(&self, record: &AppRecord) -> Option<RunState> {
        let info = match self.driver.inspect_container(&record.container_name()).await {
            Ok(info) => info,
            Err(e) => {
                warn!(app_id = %record.id, error = %e, "Container inspection failed");
                return None;
            }
        };

        let Some(info) = info else {
            self.reset_failures(&record.id).await;
            return Some(RunState::Exited);
        };

        if !info.running {
            self.reset_failures(&record.id).await;
            return Some(match info.exit_code {
                _ if record.run_state == Some(RunState::Exited) => RunState::Exited,
                Some(code) if code != 0 => RunState::Error,
                _ => RunState::Exited,
            });
        }

        let Some(http_port) = record.http_port else {
            return None;
        };

        if self
            .probe
            .probe(http_port, &record.manifest.health_check_path)
            .await
        {
            self.reset_failures(&record.id).await;
            return Some(RunState::Running);
        }

        let mut failures = self.failures.lock().await;
        let count = failures.entry(record.id.clone()).or_default();
        *count += 1;
        debug!(app_id = %record.id, failures = *count, "Health probe failed");

        (*count >= self.config.failure_threshold).then_some(RunState::NotResponding)
    }

    async fn reset_failures(&self, app_id: &str) {
        self.failures.lock().await.remove(app_id);
    }
}
