// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-application lifecycle: ordered step lists interpreted per task kind.
//!
//! ```text
//! Install    DownloadManifest → DownloadImage → CreateVolume → CreateContainer → RegisterSubdomain
//! Configure  TeardownContainers → CreateContainer → RegisterSubdomain
//! Repair     RegisterSubdomain
//! Uninstall  UnregisterNetwork → RemoveContainer → RemoveAddons → RemoveVolume → RemoveImage → DeleteRecord
//! Start      StartApp
//! Stop       StopApp
//! ```
//!
//! Every step is idempotent, so an interrupted task is resumed by running its
//! list again from the top. The state a step enters is persisted before the
//! step runs, and cancellation is only observed between steps.

use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::addons::{AddonCoordinator, AddonError};
use crate::driver::{ContainerDriver, ContainerSpec, DriverError, PublishedPort};
use crate::model::{AppRecord, AppUpdate, InstallationState, RunState};
use crate::network::{NetworkError, NetworkRegistrar};
use crate::registry::{AppRegistry, RegistryError};
use crate::retry::RetryPolicy;

/// Cooperative cancellation flag checked between steps.
pub type CancelToken = Arc<AtomicBool>;

/// Mount path of the app data volume inside the container.
pub const DATA_MOUNT_PATH: &str = "/app/data";

/// A lifecycle operation for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Full provisioning from `PENDING_INSTALL`.
    Install,
    /// Replace the container in place; `previous_location` is unregistered first
    /// when the location changed.
    Configure {
        /// Location before the configure request.
        previous_location: String,
    },
    /// Network registration only, for `SUBDOMAIN_ERROR`.
    Repair,
    /// Best-effort teardown ending in record deletion.
    Uninstall,
    /// Start the app and its addons.
    Start,
    /// Stop the app and its addons.
    Stop,
}

impl TaskKind {
    /// Steps run for this kind, in order.
    pub fn steps(&self) -> &'static [Step] {
        match self {
            TaskKind::Install => &[
                Step::DownloadManifest,
                Step::DownloadImage,
                Step::CreateVolume,
                Step::CreateContainer,
                Step::RegisterSubdomain,
            ],
            TaskKind::Configure { .. } => &[
                Step::TeardownContainers,
                Step::CreateContainer,
                Step::RegisterSubdomain,
            ],
            TaskKind::Repair => &[Step::RegisterSubdomain],
            TaskKind::Uninstall => &[
                Step::UnregisterNetwork,
                Step::RemoveContainer,
                Step::RemoveAddons,
                Step::RemoveVolume,
                Step::RemoveImage,
                Step::DeleteRecord,
            ],
            TaskKind::Start => &[Step::StartApp],
            TaskKind::Stop => &[Step::StopApp],
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Install => "install",
            TaskKind::Configure { .. } => "configure",
            TaskKind::Repair => "repair",
            TaskKind::Uninstall => "uninstall",
            TaskKind::Start => "start",
            TaskKind::Stop => "stop",
        }
    }
}

/// One idempotent unit of lifecycle work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Validate the manifest and its addon requirements.
    DownloadManifest,
    /// Pull the app image.
    DownloadImage,
    /// Create the data volume.
    CreateVolume,
    /// Provision addons, replace any existing container, create and start a new one.
    CreateContainer,
    /// Proxy route, DNS record and TLS material.
    RegisterSubdomain,
    /// Remove the current containers, keeping the data volume.
    TeardownContainers,
    /// Remove proxy route, DNS record and TLS material.
    UnregisterNetwork,
    /// Stop and remove the app container.
    RemoveContainer,
    /// Remove addon containers and credentials.
    RemoveAddons,
    /// Remove the data volume.
    RemoveVolume,
    /// Remove the image unless another app uses it.
    RemoveImage,
    /// Delete the record.
    DeleteRecord,
    /// Start the container (creating it if missing), addons and route.
    StartApp,
    /// Unregister the route, stop the container and addons.
    StopApp,
}

impl Step {
    /// Installation state persisted before the step runs.
    pub fn entry_state(&self) -> Option<InstallationState> {
        match self {
            Step::DownloadManifest => Some(InstallationState::DownloadingManifest),
            Step::DownloadImage => Some(InstallationState::DownloadingImage),
            Step::CreateVolume => Some(InstallationState::CreatingVolume),
            Step::CreateContainer | Step::TeardownContainers => {
                Some(InstallationState::CreatingContainer)
            }
            Step::RegisterSubdomain => Some(InstallationState::RegisteringSubdomain),
            _ => None,
        }
    }

    /// State a failure of this step leaves an install-like task in.
    pub fn failure_state(&self) -> InstallationState {
        match self {
            Step::RegisterSubdomain => InstallationState::SubdomainError,
            _ => InstallationState::Error,
        }
    }
}

/// Failure of a single step, attributed to the collaborator that caused it.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Manifest rejected.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// Container runtime failure.
    #[error("{0}")]
    Driver(#[from] DriverError),

    /// Addon failure.
    #[error("{0}")]
    Addon(#[from] AddonError),

    /// Network registration failure.
    #[error("{0}")]
    Network(#[from] NetworkError),

    /// Registry failure.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// No free loopback port for the app.
    #[error("port allocation failed: {0}")]
    Port(#[from] std::io::Error),

    /// The record was deleted underneath the task.
    #[error("app record disappeared")]
    RecordGone,
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// All steps succeeded.
    Completed,
    /// Uninstall finished and the record is gone.
    Deleted,
    /// A step failed; the error was recorded on the app.
    Failed(String),
    /// Cancellation was observed between steps.
    Cancelled,
}

/// Platform values every app container receives.
#[derive(Debug, Clone)]
pub struct PlatformEnv {
    /// Box domain.
    pub fqdn: String,
    /// Admin UI origin.
    pub admin_origin: String,
    /// Control-plane API origin.
    pub api_origin: String,
}

impl PlatformEnv {
    /// Values for a box at `fqdn` with its admin UI at `admin_location`.
    pub fn new(fqdn: impl Into<String>, admin_location: &str) -> Self {
        let fqdn = fqdn.into();
        let admin_origin = format!("https://{}.{}", admin_location, fqdn);
        Self {
            api_origin: admin_origin.clone(),
            admin_origin,
            fqdn,
        }
    }

    /// Public domain of an app.
    pub fn app_domain(&self, location: &str) -> String {
        format!("{}.{}", location, self.fqdn)
    }

    /// Public origin of an app.
    pub fn app_origin(&self, location: &str) -> String {
        format!("https://{}", self.app_domain(location))
    }
}

/// Kernel picks tried before giving up on finding a port no app claims.
const PORT_ALLOCATION_ATTEMPTS: usize = 32;

/// Ask the kernel for a free loopback port that no app has claimed.
fn allocate_http_port(claimed: &BTreeSet<u16>) -> std::io::Result<u16> {
    for _ in 0..PORT_ALLOCATION_ATTEMPTS {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        if !claimed.contains(&port) {
            return Ok(port);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "no unclaimed loopback port",
    ))
}

/// Executes task step lists against the collaborators.
#[derive(Clone)]
pub struct Lifecycle {
    registry: Arc<dyn AppRegistry>,
    driver: Arc<dyn ContainerDriver>,
    addons: Arc<AddonCoordinator>,
    network: NetworkRegistrar,
    platform: PlatformEnv,
    retry: RetryPolicy,
}

impl Lifecycle {
    /// Create a lifecycle over the given collaborators.
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        driver: Arc<dyn ContainerDriver>,
        addons: Arc<AddonCoordinator>,
        network: NetworkRegistrar,
        platform: PlatformEnv,
    ) -> Self {
        Self {
            registry,
            driver,
            addons,
            network,
            platform,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy for runtime calls and teardown steps.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Registry the lifecycle persists to.
    pub fn registry(&self) -> &Arc<dyn AppRegistry> {
        &self.registry
    }

    /// Addons the lifecycle provisions.
    pub fn addons(&self) -> &Arc<AddonCoordinator> {
        &self.addons
    }

    /// Run `kind` for `app_id` until done, failed or cancelled.
    pub async fn run(&self, app_id: &str, kind: &TaskKind, cancel: &CancelToken) -> TaskOutcome {
        info!(app_id = %app_id, task = kind.name(), "Lifecycle task started");

        let outcome = match kind {
            TaskKind::Uninstall => self.run_uninstall(app_id, cancel).await,
            TaskKind::Start | TaskKind::Stop => self.run_narrow(app_id, kind).await,
            _ => self.run_provisioning(app_id, kind, cancel).await,
        };

        match &outcome {
            TaskOutcome::Failed(e) => {
                warn!(app_id = %app_id, task = kind.name(), error = %e, "Lifecycle task failed")
            }
            other => {
                info!(app_id = %app_id, task = kind.name(), outcome = ?other, "Lifecycle task finished")
            }
        }
        outcome
    }

    async fn load(&self, app_id: &str) -> Result<AppRecord, StepError> {
        self.registry
            .get(app_id)
            .await?
            .ok_or(StepError::RecordGone)
    }

    async fn run_provisioning(
        &self,
        app_id: &str,
        kind: &TaskKind,
        cancel: &CancelToken,
    ) -> TaskOutcome {
        for step in kind.steps() {
            if cancel.load(Ordering::SeqCst) {
                info!(app_id = %app_id, step = ?step, "Task cancelled before step");
                return TaskOutcome::Cancelled;
            }

            let result = self.enter_and_execute(app_id, kind, *step).await;
            if let Err(e) = result {
                let message = format!("{:?}: {}", step, e);
                if !matches!(e, StepError::RecordGone) {
                    self.persist(app_id, AppUpdate::failed(step.failure_state(), &message))
                        .await;
                }
                return TaskOutcome::Failed(message);
            }
        }

        match self
            .registry
            .update(app_id, AppUpdate::state(InstallationState::Installed))
            .await
        {
            Ok(_) => TaskOutcome::Completed,
            Err(e) => TaskOutcome::Failed(e.to_string()),
        }
    }

    async fn enter_and_execute(
        &self,
        app_id: &str,
        kind: &TaskKind,
        step: Step,
    ) -> Result<(), StepError> {
        let mut record = self.load(app_id).await?;

        if let Some(state) = step.entry_state()
            && record.installation_state != state
        {
            record = self.registry.update(app_id, AppUpdate::state(state)).await?;
        }

        debug!(app_id = %app_id, step = ?step, "Executing step");
        self.execute(step, &record, kind).await
    }

    async fn run_uninstall(&self, app_id: &str, cancel: &CancelToken) -> TaskOutcome {
        let record = match self.load(app_id).await {
            Ok(record) => record,
            Err(StepError::RecordGone) => return TaskOutcome::Deleted,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        let kind = TaskKind::Uninstall;
        for step in kind.steps() {
            if cancel.load(Ordering::SeqCst) {
                info!(app_id = %app_id, step = ?step, "Uninstall cancelled before step");
                return TaskOutcome::Cancelled;
            }

            let result = self
                .retry
                .run(&format!("uninstall {:?}", step), || {
                    self.execute(*step, &record, &kind)
                })
                .await;

            match result {
                Ok(()) => debug!(app_id = %app_id, step = ?step, "Teardown step done"),
                Err(e) if *step == Step::DeleteRecord => {
                    error!(app_id = %app_id, error = %e, "Failed to delete app record");
                    return TaskOutcome::Failed(e.to_string());
                }
                Err(e) => {
                    warn!(app_id = %app_id, step = ?step, error = %e, "Teardown step failed, continuing")
                }
            }
        }

        TaskOutcome::Deleted
    }

    async fn run_narrow(&self, app_id: &str, kind: &TaskKind) -> TaskOutcome {
        let record = match self.load(app_id).await {
            Ok(record) => record,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        let mut result = Ok(());
        for step in kind.steps() {
            result = self.execute(*step, &record, kind).await;
            if result.is_err() {
                break;
            }
        }

        match result {
            Ok(()) => TaskOutcome::Completed,
            Err(e) => {
                let message = e.to_string();
                if *kind == TaskKind::Start {
                    self.persist(app_id, AppUpdate::RunState(Some(RunState::Error)))
                        .await;
                }
                self.persist(app_id, AppUpdate::LastError(Some(message.clone())))
                    .await;
                TaskOutcome::Failed(message)
            }
        }
    }

    /// Best-effort write used on failure paths.
    async fn persist(&self, app_id: &str, update: AppUpdate) {
        if let Err(e) = self.registry.update(app_id, update).await {
            error!(app_id = %app_id, error = %e, "Failed to persist app state");
        }
    }

    async fn execute(&self, step: Step, record: &AppRecord, kind: &TaskKind) -> Result<(), StepError> {
        match step {
            Step::DownloadManifest => self.validate_manifest(record),
            Step::DownloadImage => {
                let image = &record.manifest.docker_image;
                self.retry
                    .run_if("pull_image", || self.driver.pull_image(image), DriverError::is_transient)
                    .await?;
                Ok(())
            }
            Step::CreateVolume => {
                let volume = record.volume_name();
                self.retry
                    .run_if(
                        "create_volume",
                        || self.driver.create_volume(&volume),
                        DriverError::is_transient,
                    )
                    .await?;
                Ok(())
            }
            Step::CreateContainer => self.create_container(record).await,
            Step::RegisterSubdomain => self.register_subdomain(record).await,
            Step::TeardownContainers => self.teardown_containers(record, kind).await,
            Step::UnregisterNetwork => {
                self.network.unregister(&record.id, &record.location).await?;
                Ok(())
            }
            Step::RemoveContainer => self.remove_app_container(record).await,
            Step::RemoveAddons => {
                self.addons
                    .deprovision(&record.id, &record.manifest.addon_kinds())
                    .await?;
                Ok(())
            }
            Step::RemoveVolume => {
                self.driver.remove_volume(&record.volume_name()).await?;
                Ok(())
            }
            Step::RemoveImage => self.remove_image_if_orphaned(record).await,
            Step::DeleteRecord => {
                self.registry.delete(&record.id).await?;
                Ok(())
            }
            Step::StartApp => self.start_app(record).await,
            Step::StopApp => self.stop_app(record).await,
        }
    }

    fn validate_manifest(&self, record: &AppRecord) -> Result<(), StepError> {
        record.manifest.validate().map_err(StepError::Manifest)?;

        let unsupported = self.addons.unsupported(record.manifest.addons.keys());
        if !unsupported.is_empty() {
            return Err(StepError::Manifest(format!(
                "unsupported addons: {:?}",
                unsupported
            )));
        }
        Ok(())
    }

    /// Stop and remove the current container, by recorded id and by name.
    async fn remove_app_container(&self, record: &AppRecord) -> Result<(), StepError> {
        let name = record.container_name();

        if let Some(id) = &record.container_id {
            self.driver.stop_container(id).await?;
            self.driver.remove_container(id).await?;
        }
        if let Some(existing) = self.driver.inspect_container(&name).await? {
            debug!(app_id = %record.id, container_id = %existing.id, "Removing existing container");
            self.driver.remove_container(&existing.id).await?;
        }
        Ok(())
    }

    fn container_env(&self, record: &AppRecord, addon_env: Vec<(String, String)>) -> Vec<String> {
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.insert("WEBADMIN_ORIGIN".into(), self.platform.admin_origin.clone());
        env.insert("API_ORIGIN".into(), self.platform.api_origin.clone());
        env.insert("APPBOX".into(), "1".into());
        env.insert("APP_ORIGIN".into(), self.platform.app_origin(&record.location));
        env.insert("APP_DOMAIN".into(), self.platform.app_domain(&record.location));
        for (name, port) in &record.port_bindings {
            env.insert(name.clone(), port.to_string());
        }
        env.extend(addon_env);

        env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    async fn create_container(&self, record: &AppRecord) -> Result<(), StepError> {
        let addon_env = self
            .addons
            .provision(
                &record.id,
                &record.location,
                &self.platform.app_origin(&record.location),
                &record.manifest.addons,
            )
            .await?;

        self.remove_app_container(record).await?;

        let http_port = match record.http_port {
            Some(port) => port,
            None => allocate_http_port(&self.claimed_ports().await?)?,
        };

        let mut ports = vec![PublishedPort::loopback(record.manifest.http_port, http_port)];
        for (name, host_port) in &record.port_bindings {
            if let Some(declared) = record.manifest.tcp_ports.get(name) {
                ports.push(PublishedPort::public(declared.container_port, *host_port));
            }
        }

        let spec = ContainerSpec {
            name: record.container_name(),
            image: record.manifest.docker_image.clone(),
            hostname: Some(record.location.clone()),
            env: self.container_env(record, addon_env),
            ports,
            volumes: [(record.volume_name(), DATA_MOUNT_PATH.to_string())].into(),
            cmd: None,
            labels: [("appbox.app_id".to_string(), record.id.clone())].into(),
        };

        let container_id = self
            .retry
            .run_if(
                "create_container",
                || self.driver.create_container(&spec),
                DriverError::is_transient,
            )
            .await?;

        self.registry
            .update(
                &record.id,
                AppUpdate::Container {
                    container_id: Some(container_id.clone()),
                    http_port: Some(http_port),
                },
            )
            .await?;

        self.retry
            .run_if(
                "start_container",
                || self.driver.start_container(&container_id),
                DriverError::is_transient,
            )
            .await?;

        info!(app_id = %record.id, container_id = %container_id, http_port = http_port, "App container running");
        Ok(())
    }

    /// Host ports recorded by any app, http ports and port bindings alike.
    async fn claimed_ports(&self) -> Result<BTreeSet<u16>, StepError> {
        Ok(self
            .registry
            .list()
            .await?
            .iter()
            .flat_map(|r| r.http_port.into_iter().chain(r.port_bindings.values().copied()))
            .collect())
    }

    async fn register_subdomain(&self, record: &AppRecord) -> Result<(), StepError> {
        let http_port = record.http_port.ok_or_else(|| {
            StepError::Network(NetworkError::Proxy("app has no published http port".into()))
        })?;

        self.network
            .register(&record.id, &record.location, http_port, record.tls.as_ref())
            .await?;
        Ok(())
    }

    async fn teardown_containers(&self, record: &AppRecord, kind: &TaskKind) -> Result<(), StepError> {
        if let TaskKind::Configure { previous_location } = kind
            && *previous_location != record.location
            && let Err(e) = self.network.unregister(&record.id, previous_location).await
        {
            warn!(app_id = %record.id, location = %previous_location, error = %e, "Failed to unregister previous location");
        }

        self.remove_app_container(record).await?;
        self.addons
            .teardown(&record.id, &record.manifest.addon_kinds())
            .await?;

        if record.container_id.is_some() || record.http_port.is_some() {
            self.registry
                .update(
                    &record.id,
                    AppUpdate::Container {
                        container_id: None,
                        http_port: None,
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn remove_image_if_orphaned(&self, record: &AppRecord) -> Result<(), StepError> {
        let image = &record.manifest.docker_image;
        let in_use = self
            .registry
            .list()
            .await?
            .iter()
            .any(|other| other.id != record.id && other.manifest.docker_image == *image);

        if in_use {
            debug!(app_id = %record.id, image = %image, "Image used by another app, keeping it");
            return Ok(());
        }

        match self.driver.remove_image(image).await {
            Ok(()) => Ok(()),
            Err(DriverError::Conflict(what)) => {
                info!(app_id = %record.id, image = %image, reason = %what, "Image in use, not removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn start_app(&self, record: &AppRecord) -> Result<(), StepError> {
        let existing = self.driver.inspect_container(&record.container_name()).await?;
        let recreate = match existing {
            Some(info) => match self
                .addons
                .start(&record.id, &record.manifest.addon_kinds())
                .await
            {
                Ok(()) => {
                    self.driver.start_container(&info.id).await?;
                    false
                }
                Err(e) if e.is_missing() => {
                    warn!(app_id = %record.id, error = %e, "Addon container missing, recreating");
                    true
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                info!(app_id = %record.id, "Container missing, recreating");
                true
            }
        };

        // Recreation reprovisions the addons as well.
        let record = if recreate {
            self.create_container(record).await?;
            self.load(&record.id).await?
        } else {
            record.clone()
        };

        self.register_subdomain(&record).await?;
        self.registry
            .update(&record.id, AppUpdate::RunState(None))
            .await?;
        self.registry
            .update(&record.id, AppUpdate::LastError(None))
            .await?;
        Ok(())
    }

    async fn stop_app(&self, record: &AppRecord) -> Result<(), StepError> {
        self.network.unregister(&record.id, &record.location).await?;

        if let Some(info) = self.driver.inspect_container(&record.container_name()).await? {
            self.driver.stop_container(&info.id).await?;
        }
        self.addons
            .stop(&record.id, &record.manifest.addon_kinds())
            .await?;

        self.registry
            .update(&record.id, AppUpdate::RunState(Some(RunState::Exited)))
            .await?;
        Ok(())
    }
}
