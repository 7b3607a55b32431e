// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container driver trait and types.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

/// Driver errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The referenced image, volume or container does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The resource is in use or already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The runtime did not answer in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Bound that was exceeded.
        after: Duration,
    },

    /// Error reported by the Docker daemon.
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Timeout { .. } | DriverError::Docker(_))
    }
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// A container port published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedPort {
    /// Port inside the container.
    pub container_port: u16,
    /// Port on the host.
    pub host_port: u16,
    /// Bind on every host interface instead of loopback only.
    pub public: bool,
}

impl PublishedPort {
    /// Port reachable only through the local reverse proxy.
    pub fn loopback(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
            public: false,
        }
    }

    /// Port exposed to clients outside the box.
    pub fn public(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
            public: true,
        }
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Deterministic container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Container hostname.
    pub hostname: Option<String>,
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Ports published on the host.
    pub ports: Vec<PublishedPort>,
    /// Volume name → mount path.
    pub volumes: BTreeMap<String, String>,
    /// Command override.
    pub cmd: Option<Vec<String>>,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

/// Observed state of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Runtime id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Whether the container is running.
    pub running: bool,
    /// Exit code of the last run, if it exited.
    pub exit_code: Option<i64>,
}

/// Container runtime operations used by the lifecycle, addons and supervisor.
///
/// Removal and stop operations treat an absent resource as success.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Pull an image (no-op when already present).
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Remove an image. Fails with [`DriverError::Conflict`] if a container uses it.
    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Create a named volume (no-op when it exists).
    async fn create_volume(&self, name: &str) -> Result<()>;

    /// Remove a named volume.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a container (no-op when running).
    async fn start_container(&self, name_or_id: &str) -> Result<()>;

    /// Stop a container (no-op when stopped or absent).
    async fn stop_container(&self, name_or_id: &str) -> Result<()>;

    /// Force-remove a container.
    async fn remove_container(&self, name_or_id: &str) -> Result<()>;

    /// Inspect a container by name or id.
    async fn inspect_container(&self, name_or_id: &str) -> Result<Option<ContainerInfo>>;
}
