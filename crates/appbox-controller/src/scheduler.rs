// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task scheduler: one worker slot per application id.
//!
//! A request first [`reserve`](TaskScheduler::reserve)s the slot for its app,
//! then records its desired state, then [`launch`](TaskSlot::launch)es the
//! worker. A slot dropped without launching is released again, so a request
//! that fails validation after reserving never leaves the app locked.
//!
//! A second request for an id that already owns a slot is rejected with
//! [`ScheduleError::Conflict`]; nothing is queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::lifecycle::{CancelToken, Lifecycle, TaskKind, TaskOutcome};
use crate::model::{AppUpdate, InstallationState};
use crate::registry::RegistryError;

/// Scheduling errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Another task owns the app.
    #[error("a task is already active for app {0}")]
    Conflict(String),

    /// The scheduler is draining.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug)]
struct ActiveTask {
    kind: Option<TaskKind>,
    cancel: CancelToken,
}

struct Inner {
    active: Mutex<HashMap<String, ActiveTask>>,
    accepting: AtomicBool,
    active_count: watch::Sender<usize>,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveTask>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, app_id: &str) {
        let mut active = self.active();
        active.remove(app_id);
        self.active_count.send_replace(active.len());
    }
}

/// Serializes lifecycle tasks per app and runs tasks of different apps in parallel.
#[derive(Clone)]
pub struct TaskScheduler {
    lifecycle: Lifecycle,
    inner: Arc<Inner>,
}

impl TaskScheduler {
    /// Create a scheduler running tasks through `lifecycle`.
    pub fn new(lifecycle: Lifecycle) -> Self {
        let (active_count, _) = watch::channel(0);
        Self {
            lifecycle,
            inner: Arc::new(Inner {
                active: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                active_count,
            }),
        }
    }

    /// Lifecycle the workers run.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Take exclusive ownership of `app_id`.
    pub fn reserve(&self, app_id: &str) -> Result<TaskSlot, ScheduleError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(ScheduleError::ShuttingDown);
        }

        let mut active = self.inner.active();
        if active.contains_key(app_id) {
            return Err(ScheduleError::Conflict(app_id.to_string()));
        }
        active.insert(
            app_id.to_string(),
            ActiveTask {
                kind: None,
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
        self.inner.active_count.send_replace(active.len());

        Ok(TaskSlot {
            scheduler: self.clone(),
            app_id: app_id.to_string(),
            armed: true,
        })
    }

    /// Reserve and launch in one go.
    pub fn schedule(
        &self,
        app_id: &str,
        kind: TaskKind,
    ) -> Result<JoinHandle<TaskOutcome>, ScheduleError> {
        Ok(self.reserve(app_id)?.launch(kind))
    }

    /// Whether a task (or a reservation) owns `app_id`.
    pub fn is_active(&self, app_id: &str) -> bool {
        self.inner.active().contains_key(app_id)
    }

    /// Kind of the task running for `app_id`, if launched.
    pub fn active_task(&self, app_id: &str) -> Option<TaskKind> {
        self.inner
            .active()
            .get(app_id)
            .and_then(|task| task.kind.clone())
    }

    /// Number of owned slots.
    pub fn active_count(&self) -> usize {
        self.inner.active().len()
    }

    /// Stop accepting tasks and ask running workers to stop after their current step.
    pub fn stop_pending_tasks(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let active = self.inner.active();
        for (app_id, task) in active.iter() {
            info!(app_id = %app_id, task = ?task.kind, "Cancelling lifecycle task");
            task.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Wait until every slot is released.
    pub async fn wait_for_pending_tasks(&self) {
        let mut rx = self.inner.active_count.subscribe();
        if rx.wait_for(|count| *count == 0).await.is_err() {
            warn!("Task counter closed while waiting for pending tasks");
        }
    }

    /// Re-schedule work for every record left mid-lifecycle by a previous run.
    ///
    /// `PENDING_UNINSTALL` resumes uninstall; any install-chain state restarts
    /// install from `PENDING_INSTALL`. Returns how many tasks were launched.
    pub async fn resume_pending(&self) -> Result<usize, RegistryError> {
        let registry = self.lifecycle.registry().clone();
        let mut resumed = 0;

        for record in registry.list().await? {
            let state = record.installation_state;
            let kind = if state == InstallationState::PendingUninstall {
                TaskKind::Uninstall
            } else if state.is_install_in_progress() {
                TaskKind::Install
            } else {
                continue;
            };

            let slot = match self.reserve(&record.id) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(app_id = %record.id, error = %e, "Cannot resume task");
                    continue;
                }
            };

            if kind == TaskKind::Install && state != InstallationState::PendingInstall {
                registry
                    .update(&record.id, AppUpdate::state(InstallationState::PendingInstall))
                    .await?;
            }

            info!(app_id = %record.id, state = %state, task = kind.name(), "Resuming interrupted task");
            slot.launch(kind);
            resumed += 1;
        }

        Ok(resumed)
    }
}

/// Exclusive ownership of one app id, released on drop unless launched.
pub struct TaskSlot {
    scheduler: TaskScheduler,
    app_id: String,
    armed: bool,
}

impl TaskSlot {
    /// App this slot owns.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Spawn the worker; the slot is released when the worker finishes or panics.
    pub fn launch(mut self, kind: TaskKind) -> JoinHandle<TaskOutcome> {
        self.armed = false;

        let inner = self.scheduler.inner.clone();
        let cancel = {
            let mut active = inner.active();
            match active.get_mut(&self.app_id) {
                Some(task) => {
                    task.kind = Some(kind.clone());
                    task.cancel.clone()
                }
                None => Arc::new(AtomicBool::new(false)),
            }
        };

        let lifecycle = self.scheduler.lifecycle.clone();
        let app_id = std::mem::take(&mut self.app_id);

        tokio::spawn(async move {
            let _release = ReleaseOnDrop {
                inner,
                app_id: app_id.clone(),
            };
            let outcome = lifecycle.run(&app_id, &kind, &cancel).await;
            if let TaskOutcome::Failed(e) = &outcome {
                error!(app_id = %app_id, task = kind.name(), error = %e, "Lifecycle task ended in failure");
            }
            outcome
        })
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if self.armed {
            self.scheduler.inner.release(&self.app_id);
        }
    }
}

struct ReleaseOnDrop {
    inner: Arc<Inner>,
    app_id: String,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.inner.release(&self.app_id);
    }
}
