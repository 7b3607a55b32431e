// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker-backed container driver.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use futures::StreamExt;
use tracing::{debug, info};

use super::traits::*;

/// Default bound for image pulls.
const PULL_TIMEOUT: Duration = Duration::from_secs(600);
/// Default bound for every other daemon call.
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period handed to `docker stop`.
const STOP_GRACE_SECS: i64 = 10;
const LOOPBACK_ADDR: &str = "127.0.0.1";
const ANY_ADDR: &str = "0.0.0.0";

/// Container driver talking to the local Docker daemon.
#[derive(Clone)]
pub struct DockerDriver {
    docker: Docker,
    network: String,
    pull_timeout: Duration,
    call_timeout: Duration,
}

impl DockerDriver {
    /// Connect using the platform defaults (unix socket or `DOCKER_HOST`).
    ///
    /// Every container is attached to `network`, a user-defined bridge on
    /// which apps reach their addon containers by name.
    pub fn connect(network: impl Into<String>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            network: network.into(),
            pull_timeout: PULL_TIMEOUT,
            call_timeout: CALL_TIMEOUT,
        })
    }

    /// Override the per-call timeouts.
    pub fn with_timeouts(mut self, pull_timeout: Duration, call_timeout: Duration) -> Self {
        self.pull_timeout = pull_timeout;
        self.call_timeout = call_timeout;
        self
    }

    /// Create the container network unless it already exists.
    pub async fn ensure_network(&self) -> Result<()> {
        let network = self.network.as_str();
        self.bounded("ensure_network", self.call_timeout, async {
            match self
                .docker
                .inspect_network(network, None::<InspectNetworkOptions<String>>)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if status_of(&err) == Some(404) => {}
                Err(err) => return Err(classify(err, network)),
            }

            let created = self
                .docker
                .create_network(CreateNetworkOptions {
                    name: network.to_string(),
                    driver: "bridge".to_string(),
                    ..Default::default()
                })
                .await;
            match created {
                Ok(_) => {
                    info!(network = %network, "Container network created");
                    Ok(())
                }
                // Lost a race with another creator.
                Err(err) if status_of(&err) == Some(409) => Ok(()),
                Err(err) => Err(classify(err, network)),
            }
        })
        .await
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        after: Duration,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(after, call)
            .await
            .map_err(|_| DriverError::Timeout { operation, after })?
    }
}

/// Creation body for `spec` attached to `network`.
///
/// The http port stays on loopback behind the reverse proxy; port bindings
/// are published on every interface.
fn container_config(spec: &ContainerSpec, network: &str) -> ContainerConfig<String> {
    let exposed_ports = spec
        .ports
        .iter()
        .map(|p| (format!("{}/tcp", p.container_port), HashMap::new()))
        .collect();

    let port_bindings = spec
        .ports
        .iter()
        .map(|p| {
            let host_ip = if p.public { ANY_ADDR } else { LOOPBACK_ADDR };
            (
                format!("{}/tcp", p.container_port),
                Some(vec![PortBinding {
                    host_ip: Some(host_ip.to_string()),
                    host_port: Some(p.host_port.to_string()),
                }]),
            )
        })
        .collect();

    let binds = spec
        .volumes
        .iter()
        .map(|(volume, path)| format!("{}:{}", volume, path))
        .collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        binds: Some(binds),
        network_mode: Some(network.to_string()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    ContainerConfig {
        image: Some(spec.image.clone()),
        hostname: spec.hostname.clone(),
        env: Some(spec.env.clone()),
        cmd: spec.cmd.clone(),
        exposed_ports: Some(exposed_ports),
        labels: Some(spec.labels.clone().into_iter().collect()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn status_of(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Map daemon status codes onto the driver taxonomy.
fn classify(err: BollardError, what: &str) -> DriverError {
    match status_of(&err) {
        Some(404) => DriverError::NotFound(what.to_string()),
        Some(409) => DriverError::Conflict(what.to_string()),
        _ => DriverError::Docker(err),
    }
}

/// Treat "absent" (and "already in the requested state") as success.
fn absent_ok(result: std::result::Result<(), BollardError>, what: &str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if matches!(status_of(&err), Some(304) | Some(404)) => {
            debug!(resource = %what, "Resource already absent or in requested state");
            Ok(())
        }
        Err(err) => Err(classify(err, what)),
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn pull_image(&self, image: &str) -> Result<()> {
        self.bounded("pull_image", self.pull_timeout, async {
            let mut stream = self.docker.create_image(
                Some(CreateImageOptions {
                    from_image: image.to_string(),
                    ..Default::default()
                }),
                None,
                None,
            );

            while let Some(progress) = stream.next().await {
                let progress = progress.map_err(|e| classify(e, image))?;
                if let Some(status) = progress.status {
                    debug!(image = %image, status = %status, "Pull progress");
                }
            }

            info!(image = %image, "Image pulled");
            Ok(())
        })
        .await
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.bounded("remove_image", self.call_timeout, async {
            let result = self
                .docker
                .remove_image(
                    image,
                    Some(RemoveImageOptions {
                        force: false,
                        noprune: false,
                    }),
                    None,
                )
                .await
                .map(|_| ());
            absent_ok(result, image)
        })
        .await
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.bounded("create_volume", self.call_timeout, async {
            self.docker
                .create_volume(CreateVolumeOptions {
                    name: name.to_string(),
                    ..Default::default()
                })
                .await
                .map_err(|e| classify(e, name))?;
            Ok(())
        })
        .await
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.bounded("remove_volume", self.call_timeout, async {
            let result = self
                .docker
                .remove_volume(name, Some(RemoveVolumeOptions { force: false }))
                .await;
            absent_ok(result, name)
        })
        .await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.bounded("create_container", self.call_timeout, async {
            let response = self
                .docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: spec.name.clone(),
                        platform: None,
                    }),
                    container_config(spec, &self.network),
                )
                .await
                .map_err(|e| classify(e, &spec.name))?;

            info!(container = %spec.name, container_id = %response.id, "Container created");
            Ok(response.id)
        })
        .await
    }

    async fn start_container(&self, name_or_id: &str) -> Result<()> {
        self.bounded("start_container", self.call_timeout, async {
            let result = self
                .docker
                .start_container(name_or_id, None::<StartContainerOptions<String>>)
                .await;
            match result {
                Err(err) if status_of(&err) == Some(304) => Ok(()),
                other => other.map_err(|e| classify(e, name_or_id)),
            }
        })
        .await
    }

    async fn stop_container(&self, name_or_id: &str) -> Result<()> {
        self.bounded("stop_container", self.call_timeout, async {
            let result = self
                .docker
                .stop_container(
                    name_or_id,
                    Some(StopContainerOptions {
                        t: STOP_GRACE_SECS,
                    }),
                )
                .await;
            absent_ok(result, name_or_id)
        })
        .await
    }

    async fn remove_container(&self, name_or_id: &str) -> Result<()> {
        self.bounded("remove_container", self.call_timeout, async {
            let result = self
                .docker
                .remove_container(
                    name_or_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            absent_ok(result, name_or_id)
        })
        .await
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<Option<ContainerInfo>> {
        self.bounded("inspect_container", self.call_timeout, async {
            let response = match self
                .docker
                .inspect_container(name_or_id, None::<InspectContainerOptions>)
                .await
            {
                Ok(response) => response,
                Err(err) if status_of(&err) == Some(404) => return Ok(None),
                Err(err) => return Err(classify(err, name_or_id)),
            };

            let state = response.state.unwrap_or_default();
            Ok(Some(ContainerInfo {
                id: response.id.unwrap_or_default(),
                name: response
                    .name
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| name_or_id.to_string()),
                running: state.running.unwrap_or(false),
                exit_code: state.exit_code,
            }))
        })
        .await
    }
}
