// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container driver for testing.
//!
//! Keeps images, volumes and containers in memory. Failures can be injected
//! per operation, and volumes carry a small file map so tests can check that
//! data survives container replacement.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;

/// A container known to the mock runtime.
#[derive(Debug, Clone)]
pub struct MockContainer {
    /// Runtime id.
    pub id: String,
    /// Spec it was created from.
    pub spec: ContainerSpec,
    /// Whether it is running.
    pub running: bool,
    /// Exit code once stopped or crashed.
    pub exit_code: Option<i64>,
}

#[derive(Default)]
struct MockState {
    images: BTreeSet<String>,
    volumes: BTreeMap<String, BTreeMap<String, String>>,
    containers: BTreeMap<String, MockContainer>,
    failures: HashMap<&'static str, usize>,
    calls: HashMap<&'static str, usize>,
    next_id: u64,
}

impl MockState {
    /// Count the call and consume an injected failure, if any.
    fn enter(&mut self, operation: &'static str) -> Result<()> {
        *self.calls.entry(operation).or_default() += 1;
        if let Some(remaining) = self.failures.get_mut(operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(DriverError::Other(format!("injected {} failure", operation)));
        }
        Ok(())
    }

    fn find(&self, name_or_id: &str) -> Option<&MockContainer> {
        self.containers
            .values()
            .find(|c| c.id == name_or_id || c.spec.name == name_or_id)
    }

    fn find_mut(&mut self, name_or_id: &str) -> Option<&mut MockContainer> {
        self.containers
            .values_mut()
            .find(|c| c.id == name_or_id || c.spec.name == name_or_id)
    }
}

/// In-memory container driver.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
    pull_delay: Option<Duration>,
}

impl MockDriver {
    /// Create an empty mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every image pull take `delay`, to keep tasks in flight.
    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = Some(delay);
        self
    }

    /// Fail the next `times` calls of `operation` (e.g. `"pull_image"`).
    pub async fn fail_operation(&self, operation: &'static str, times: usize) {
        self.state.lock().await.failures.insert(operation, times);
    }

    /// How many times `operation` was called.
    pub async fn call_count(&self, operation: &'static str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    /// Simulate the process inside a container exiting.
    pub async fn crash_container(&self, name_or_id: &str, exit_code: i64) {
        if let Some(container) = self.state.lock().await.find_mut(name_or_id) {
            container.running = false;
            container.exit_code = Some(exit_code);
        }
    }

    /// Remove a container behind the controller's back.
    pub async fn vanish_container(&self, name_or_id: &str) {
        let mut state = self.state.lock().await;
        let id = state.find(name_or_id).map(|c| c.id.clone());
        if let Some(id) = id {
            state.containers.remove(&id);
        }
    }

    /// Create a container directly, as if left over by an interrupted run.
    pub async fn seed_container(&self, spec: ContainerSpec, running: bool) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("mock-{:012}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                spec,
                running,
                exit_code: None,
            },
        );
        id
    }

    /// All containers currently known.
    pub async fn containers(&self) -> Vec<MockContainer> {
        self.state.lock().await.containers.values().cloned().collect()
    }

    /// Containers bearing `name`.
    pub async fn containers_named(&self, name: &str) -> Vec<MockContainer> {
        self.state
            .lock()
            .await
            .containers
            .values()
            .filter(|c| c.spec.name == name)
            .cloned()
            .collect()
    }

    /// Whether a volume exists.
    pub async fn has_volume(&self, name: &str) -> bool {
        self.state.lock().await.volumes.contains_key(name)
    }

    /// Whether an image is present.
    pub async fn has_image(&self, image: &str) -> bool {
        self.state.lock().await.images.contains(image)
    }

    /// Write a file into a volume.
    pub async fn write_volume_file(&self, volume: &str, path: &str, contents: &str) {
        if let Some(files) = self.state.lock().await.volumes.get_mut(volume) {
            files.insert(path.to_string(), contents.to_string());
        }
    }

    /// Read a file from a volume.
    pub async fn read_volume_file(&self, volume: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .volumes
            .get(volume)
            .and_then(|files| files.get(path).cloned())
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn pull_image(&self, image: &str) -> Result<()> {
        self.state.lock().await.enter("pull_image")?;
        if let Some(delay) = self.pull_delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().await.images.insert(image.to_string());
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("remove_image")?;
        if state.containers.values().any(|c| c.spec.image == image) {
            return Err(DriverError::Conflict(format!("image {} in use", image)));
        }
        state.images.remove(image);
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("create_volume")?;
        state.volumes.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("remove_volume")?;
        if state
            .containers
            .values()
            .any(|c| c.spec.volumes.contains_key(name))
        {
            return Err(DriverError::Conflict(format!("volume {} in use", name)));
        }
        state.volumes.remove(name);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().await;
        state.enter("create_container")?;

        if state.find(&spec.name).is_some() {
            return Err(DriverError::Conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        if !state.images.contains(&spec.image) {
            return Err(DriverError::NotFound(format!("image {}", spec.image)));
        }
        if let Some(volume) = spec.volumes.keys().find(|v| !state.volumes.contains_key(*v)) {
            return Err(DriverError::NotFound(format!("volume {}", volume)));
        }

        state.next_id += 1;
        let id = format!("mock-{:012}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name_or_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("start_container")?;
        let container = state
            .find_mut(name_or_id)
            .ok_or_else(|| DriverError::NotFound(name_or_id.to_string()))?;
        container.running = true;
        container.exit_code = None;
        Ok(())
    }

    async fn stop_container(&self, name_or_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("stop_container")?;
        if let Some(container) = state.find_mut(name_or_id)
            && container.running
        {
            container.running = false;
            container.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove_container(&self, name_or_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("remove_container")?;
        let id = state.find(name_or_id).map(|c| c.id.clone());
        if let Some(id) = id {
            state.containers.remove(&id);
        }
        Ok(())
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<Option<ContainerInfo>> {
        let mut state = self.state.lock().await;
        state.enter("inspect_container")?;
        Ok(state.find(name_or_id).map(|c| ContainerInfo {
            id: c.id.clone(),
            name: c.spec.name.clone(),
            running: c.running,
            exit_code: c.exit_code,
        }))
    }
}
