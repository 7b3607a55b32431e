// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sidecar (addon) provisioning.
//!
//! The [`AddonCoordinator`] fans a manifest's addon requirements out to the
//! registered [`Addon`] implementations. Each addon is handled on its own: a
//! failing addon never rolls back the ones already provisioned, the failure
//! is reported and the whole step is retried later from scratch.

mod credentials;
mod oauth;
mod redis;
mod sendmail;

pub use credentials::{
    CredentialStore, Credentials, MemoryCredentialStore, SqliteCredentialStore, generate_secret,
};
pub use oauth::OAuthAddon;
pub use redis::{RedisAddon, addon_container_name};
pub use sendmail::SendmailAddon;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::driver::DriverError;
use crate::model::AddonKind;

/// Addon errors.
#[derive(Debug, thiserror::Error)]
pub enum AddonError {
    /// No implementation registered for the kind.
    #[error("Unsupported addon: {0}")]
    Unsupported(AddonKind),

    /// Container runtime failure.
    #[error("{kind}: {source}")]
    Driver {
        /// Addon that failed.
        kind: AddonKind,
        /// Underlying error.
        #[source]
        source: DriverError,
    },

    /// Credential storage failure.
    #[error("{kind}: credential store: {source}")]
    Credentials {
        /// Addon that failed.
        kind: AddonKind,
        /// Underlying error.
        #[source]
        source: sqlx::Error,
    },

    /// One or more addons failed; the others were left as they are.
    #[error("addon failures: {}", format_failures(.0))]
    Partial(Vec<(AddonKind, AddonError)>),
}

impl AddonError {
    /// Whether a container the addon expected no longer exists.
    pub fn is_missing(&self) -> bool {
        match self {
            AddonError::Driver {
                source: DriverError::NotFound(_),
                ..
            } => true,
            AddonError::Partial(failures) => failures.iter().any(|(_, e)| e.is_missing()),
            _ => false,
        }
    }
}

fn format_failures(failures: &[(AddonKind, AddonError)]) -> String {
    failures
        .iter()
        .map(|(kind, e)| format!("{}: {}", kind, e))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for addon operations.
pub type Result<T> = std::result::Result<T, AddonError>;

/// What an addon knows about the app it serves.
#[derive(Debug, Clone)]
pub struct AddonContext {
    /// App id; addon resources are named from it.
    pub app_id: String,
    /// Current subdomain label.
    pub location: String,
    /// Public origin of the app.
    pub app_origin: String,
    /// Options from the manifest entry.
    pub options: serde_json::Value,
}

/// One sidecar implementation.
#[async_trait]
pub trait Addon: Send + Sync {
    /// Kind served.
    fn kind(&self) -> AddonKind;

    /// Create (or recreate) resources and fresh credentials; return env additions.
    async fn provision(&self, ctx: &AddonContext) -> Result<Vec<(String, String)>>;

    /// Start provisioned containers.
    async fn start(&self, app_id: &str) -> Result<()>;

    /// Stop containers, keeping them and their credentials.
    async fn stop(&self, app_id: &str) -> Result<()>;

    /// Remove containers, keeping credentials (used by reconfigure).
    async fn teardown(&self, app_id: &str) -> Result<()>;

    /// Remove containers and credentials.
    async fn deprovision(&self, app_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Start,
    Stop,
    Teardown,
    Deprovision,
}

/// Dispatches addon work for one app across the registered addons.
#[derive(Clone, Default)]
pub struct AddonCoordinator {
    addons: BTreeMap<AddonKind, Arc<dyn Addon>>,
}

impl AddonCoordinator {
    /// Create a coordinator with no addons.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an addon implementation.
    pub fn with_addon(mut self, addon: Arc<dyn Addon>) -> Self {
        self.addons.insert(addon.kind(), addon);
        self
    }

    /// Kinds from `requested` nobody serves.
    pub fn unsupported<'a>(&self, requested: impl IntoIterator<Item = &'a AddonKind>) -> Vec<AddonKind> {
        requested
            .into_iter()
            .filter(|kind| !self.addons.contains_key(kind))
            .copied()
            .collect()
    }

    fn addon(&self, kind: AddonKind) -> Result<&Arc<dyn Addon>> {
        self.addons.get(&kind).ok_or(AddonError::Unsupported(kind))
    }

    /// Provision every requested addon and merge their env additions.
    ///
    /// All addons are attempted even when one fails.
    pub async fn provision(
        &self,
        app_id: &str,
        location: &str,
        app_origin: &str,
        requested: &BTreeMap<AddonKind, serde_json::Value>,
    ) -> Result<Vec<(String, String)>> {
        let mut env = Vec::new();
        let mut failures = Vec::new();

        for (kind, options) in requested {
            let ctx = AddonContext {
                app_id: app_id.to_string(),
                location: location.to_string(),
                app_origin: app_origin.to_string(),
                options: options.clone(),
            };
            let outcome = match self.addon(*kind) {
                Ok(addon) => addon.provision(&ctx).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(additions) => {
                    info!(app_id = %app_id, addon = %kind, "Addon provisioned");
                    env.extend(additions);
                }
                Err(e) => {
                    warn!(app_id = %app_id, addon = %kind, error = %e, "Addon provisioning failed");
                    failures.push((*kind, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(env)
        } else {
            Err(AddonError::Partial(failures))
        }
    }

    /// Start the addon containers of an app.
    pub async fn start(&self, app_id: &str, kinds: &[AddonKind]) -> Result<()> {
        self.each(app_id, kinds, Action::Start).await
    }

    /// Stop the addon containers of an app.
    pub async fn stop(&self, app_id: &str, kinds: &[AddonKind]) -> Result<()> {
        self.each(app_id, kinds, Action::Stop).await
    }

    /// Remove the addon containers of an app, keeping credentials.
    pub async fn teardown(&self, app_id: &str, kinds: &[AddonKind]) -> Result<()> {
        self.each(app_id, kinds, Action::Teardown).await
    }

    /// Remove everything the addons created for an app.
    pub async fn deprovision(&self, app_id: &str, kinds: &[AddonKind]) -> Result<()> {
        self.each(app_id, kinds, Action::Deprovision).await
    }

    async fn each(&self, app_id: &str, kinds: &[AddonKind], action: Action) -> Result<()> {
        let mut failures = Vec::new();

        for kind in kinds {
            let outcome = match self.addon(*kind) {
                Ok(addon) => match action {
                    Action::Start => addon.start(app_id).await,
                    Action::Stop => addon.stop(app_id).await,
                    Action::Teardown => addon.teardown(app_id).await,
                    Action::Deprovision => addon.deprovision(app_id).await,
                },
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(app_id = %app_id, addon = %kind, action = ?action, error = %e, "Addon action failed");
                failures.push((*kind, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AddonError::Partial(failures))
        }
    }
}
