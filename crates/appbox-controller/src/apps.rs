// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request-level app operations.
//!
//! Every operation validates its input before anything is written, then
//! takes the app's scheduler slot, records the desired state and launches
//! the lifecycle task. Requests for an app whose slot is taken fail with a
//! conflict.

use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use tracing::info;
use uuid::Uuid;

use crate::addons::AddonCoordinator;
use crate::appstore::{AppStore, PurchaseError};
use crate::auth::{Authenticator, Caller};
use crate::error::{Error, Result};
use crate::lifecycle::TaskKind;
use crate::model::{
    AccessRestriction, AppRecord, AppUpdate, InstallationState, Manifest, PortBindings,
    Reconfiguration, TlsMaterial,
};
use crate::registry::{AppRegistry, RegistryError};
use crate::scheduler::TaskScheduler;

/// Locations apps can never take.
const RESERVED_LOCATIONS: &[&str] = &["api"];

/// Lowest host port an app may bind.
const MIN_HOST_PORT: u64 = 1024;

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Body of an install request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    /// Store id to purchase.
    pub app_store_id: Option<String>,
    /// Manifest to install.
    pub manifest: Option<Manifest>,
    /// Subdomain label.
    pub location: Option<String>,
    /// Manifest port name → host port.
    pub port_bindings: Option<serde_json::Value>,
    /// Must be present; `null` means unrestricted.
    #[serde(default, deserialize_with = "present")]
    pub access_restriction: Option<Option<AccessRestriction>>,
}

/// Body of a configure request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureRequest {
    /// New subdomain label.
    pub location: Option<String>,
    /// New port bindings.
    pub port_bindings: Option<serde_json::Value>,
    /// Must be present; `null` means unrestricted.
    #[serde(default, deserialize_with = "present")]
    pub access_restriction: Option<Option<AccessRestriction>>,
    /// PEM certificate; must come with `key`.
    pub cert: Option<serde_json::Value>,
    /// PEM key; must come with `cert`.
    pub key: Option<serde_json::Value>,
}

/// Body of an uninstall request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UninstallRequest {
    /// Caller's password.
    pub password: Option<String>,
}

/// Box-wide values request validation depends on.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Location of the admin UI, reserved.
    pub admin_location: String,
    /// Port of the control-plane API, never handed to apps.
    pub control_port: u16,
}

/// App operations exposed over the API.
#[derive(Clone)]
pub struct AppService {
    registry: Arc<dyn AppRegistry>,
    scheduler: TaskScheduler,
    addons: Arc<AddonCoordinator>,
    store: Arc<dyn AppStore>,
    auth: Arc<dyn Authenticator>,
    settings: ServiceSettings,
}

impl AppService {
    /// Create a service scheduling work on `scheduler`.
    pub fn new(
        scheduler: TaskScheduler,
        store: Arc<dyn AppStore>,
        auth: Arc<dyn Authenticator>,
        settings: ServiceSettings,
    ) -> Self {
        let lifecycle = scheduler.lifecycle();
        Self {
            registry: lifecycle.registry().clone(),
            addons: lifecycle.addons().clone(),
            scheduler,
            store,
            auth,
            settings,
        }
    }

    /// Authenticator used for callers and passwords.
    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.auth
    }

    /// Scheduler the service launches tasks on.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Record a new app and start installing it. Returns the new id.
    pub async fn install(&self, caller: &Caller, request: InstallRequest) -> Result<String> {
        require_admin(caller)?;

        let manifest = request
            .manifest
            .ok_or_else(|| Error::bad_request("manifest is required"))?;
        let app_store_id = request
            .app_store_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::bad_request("appStoreId is required"))?;
        manifest.validate().map_err(Error::BadRequest)?;

        let unsupported = self.addons.unsupported(manifest.addons.keys());
        if let Some(kind) = unsupported.first() {
            return Err(Error::bad_request(format!("Unsupported addon: {}", kind)));
        }

        let location = validate_location(&self.settings, request.location.as_deref())?;
        let port_bindings =
            validate_port_bindings(&self.settings, request.port_bindings.as_ref(), &manifest)?;
        let access_restriction =
            validate_access_restriction(request.access_restriction, &manifest)?;

        if self.registry.get_by_location(&location).await?.is_some() {
            return Err(Error::conflict(format!("{} is already in use", location)));
        }
        self.ensure_ports_unclaimed(&port_bindings, None).await?;

        let id = Uuid::new_v4().to_string();
        self.store
            .purchase(&app_store_id, &id)
            .await
            .map_err(|e| match e {
                PurchaseError::PaymentRequired(msg) => Error::PaymentRequired(msg),
                other => Error::Purchase(other),
            })?;

        let slot = self.scheduler.reserve(&id)?;

        let mut record = AppRecord::new_pending(&id, app_store_id, manifest, location);
        record.port_bindings = port_bindings;
        record.access_restriction = access_restriction;

        self.registry.add(&record).await.map_err(already_in_use)?;

        info!(app_id = %id, location = %record.location, image = %record.manifest.docker_image, "Install requested");
        slot.launch(TaskKind::Install);
        Ok(id)
    }

    /// One app, if the caller may see it.
    pub async fn get(&self, caller: &Caller, app_id: &str) -> Result<AppRecord> {
        let record = self.load(app_id).await?;
        if !caller.is_admin && !record.is_accessible_by(&caller.user_id, &caller.groups) {
            return Err(Error::forbidden("Not allowed to access this app"));
        }
        Ok(record)
    }

    /// Every app the caller may see.
    pub async fn list(&self, caller: &Caller) -> Result<Vec<AppRecord>> {
        let records = self.registry.list().await?;
        Ok(records
            .into_iter()
            .filter(|r| caller.is_admin || r.is_accessible_by(&caller.user_id, &caller.groups))
            .collect())
    }

    /// Replace location, port bindings, access restriction and TLS material,
    /// then recreate the container in place.
    pub async fn configure(
        &self,
        caller: &Caller,
        app_id: &str,
        request: ConfigureRequest,
    ) -> Result<()> {
        require_admin(caller)?;

        let location = validate_location(&self.settings, request.location.as_deref())?;
        let access_restriction = request
            .access_restriction
            .ok_or_else(|| Error::bad_request("accessRestriction is required"))?;
        let tls = TlsMaterial::from_pair(
            string_field("cert", request.cert)?,
            string_field("key", request.key)?,
        )
        .map_err(Error::BadRequest)?;

        let slot = self.scheduler.reserve(app_id)?;
        let record = self.load(app_id).await?;

        if !matches!(
            record.installation_state,
            InstallationState::Installed
                | InstallationState::Error
                | InstallationState::SubdomainError
        ) {
            return Err(Error::conflict(format!(
                "App cannot be configured in state {}",
                record.installation_state
            )));
        }

        let port_bindings = validate_port_bindings(
            &self.settings,
            request.port_bindings.as_ref(),
            &record.manifest,
        )?;
        let access_restriction =
            validate_access_restriction(Some(access_restriction), &record.manifest)?;

        if let Some(other) = self.registry.get_by_location(&location).await?
            && other.id != record.id
        {
            return Err(Error::conflict(format!("{} is already in use", location)));
        }
        self.ensure_ports_unclaimed(&port_bindings, Some(app_id)).await?;

        let fields = Reconfiguration {
            location,
            port_bindings,
            access_restriction,
            tls,
        };
        self.registry
            .update(
                app_id,
                AppUpdate::Reconfigure {
                    fields,
                    state: InstallationState::CreatingContainer,
                },
            )
            .await
            .map_err(already_in_use)?;

        info!(app_id = %app_id, "Configure requested");
        slot.launch(TaskKind::Configure {
            previous_location: record.location,
        });
        Ok(())
    }

    /// Reject bindings on a host port another app already publishes.
    async fn ensure_ports_unclaimed(&self, bindings: &PortBindings, app_id: Option<&str>) -> Result<()> {
        if bindings.is_empty() {
            return Ok(());
        }
        for other in self.registry.list().await? {
            if Some(other.id.as_str()) == app_id {
                continue;
            }
            let claimed = other
                .http_port
                .into_iter()
                .chain(other.port_bindings.values().copied());
            for port in claimed {
                if bindings.values().any(|p| *p == port) {
                    return Err(Error::conflict(format!("Port {} is already in use", port)));
                }
            }
        }
        Ok(())
    }

    /// Start an installed app.
    pub async fn start(&self, caller: &Caller, app_id: &str) -> Result<()> {
        self.run_narrow(caller, app_id, TaskKind::Start).await
    }

    /// Stop an installed app.
    pub async fn stop(&self, caller: &Caller, app_id: &str) -> Result<()> {
        self.run_narrow(caller, app_id, TaskKind::Stop).await
    }

    async fn run_narrow(&self, caller: &Caller, app_id: &str, kind: TaskKind) -> Result<()> {
        require_admin(caller)?;

        let slot = self.scheduler.reserve(app_id)?;
        let record = self.load(app_id).await?;
        if record.installation_state != InstallationState::Installed {
            return Err(Error::conflict(format!(
                "App is not installed (state {})",
                record.installation_state
            )));
        }

        info!(app_id = %app_id, task = kind.name(), "Task requested");
        slot.launch(kind);
        Ok(())
    }

    /// Tear the app down and delete its record.
    pub async fn uninstall(
        &self,
        caller: &Caller,
        app_id: &str,
        request: UninstallRequest,
    ) -> Result<()> {
        require_admin(caller)?;

        let password = request
            .password
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::bad_request("password is required"))?;
        if !self.auth.verify_password(caller, &password).await {
            return Err(Error::forbidden("Password incorrect"));
        }

        let slot = self.scheduler.reserve(app_id)?;
        self.load(app_id).await?;

        self.registry
            .update(app_id, AppUpdate::state(InstallationState::PendingUninstall))
            .await?;

        info!(app_id = %app_id, "Uninstall requested");
        slot.launch(TaskKind::Uninstall);
        Ok(())
    }

    /// Re-run a failed install, or only the network registration after a subdomain failure.
    pub async fn retry(&self, caller: &Caller, app_id: &str) -> Result<()> {
        require_admin(caller)?;

        let slot = self.scheduler.reserve(app_id)?;
        let record = self.load(app_id).await?;

        let kind = match record.installation_state {
            InstallationState::Error => {
                self.registry
                    .update(app_id, AppUpdate::state(InstallationState::PendingInstall))
                    .await?;
                TaskKind::Install
            }
            InstallationState::SubdomainError => TaskKind::Repair,
            other => {
                return Err(Error::conflict(format!("Nothing to retry in state {}", other)));
            }
        };

        info!(app_id = %app_id, task = kind.name(), "Retry requested");
        slot.launch(kind);
        Ok(())
    }

    async fn load(&self, app_id: &str) -> Result<AppRecord> {
        self.registry
            .get(app_id)
            .await?
            .ok_or_else(|| Error::NotFound(app_id.to_string()))
    }
}

fn validate_location(settings: &ServiceSettings, location: Option<&str>) -> Result<String> {
    let location = location
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::bad_request("location is required"))?;

    if location.len() > 63 {
        return Err(Error::bad_request("Hostname length cannot be greater than 63"));
    }
    let valid_chars = location
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || location.starts_with('-') || location.ends_with('-') {
        return Err(Error::bad_request(
            "Hostname can only contain alphanumerics and hyphen",
        ));
    }
    if location == settings.admin_location || RESERVED_LOCATIONS.contains(&location) {
        return Err(Error::bad_request(format!("{} is reserved", location)));
    }

    Ok(location.to_string())
}

fn validate_port_bindings(
    settings: &ServiceSettings,
    value: Option<&serde_json::Value>,
    manifest: &Manifest,
) -> Result<PortBindings> {
    let mut bindings = PortBindings::new();
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(bindings);
    };
    let object = value
        .as_object()
        .ok_or_else(|| Error::bad_request("portBindings must be an object"))?;

    for (name, port) in object {
        if !manifest.tcp_ports.contains_key(name) {
            return Err(Error::bad_request(format!("Invalid portBindings {}", name)));
        }
        let port = port
            .as_u64()
            .filter(|p| (MIN_HOST_PORT..=u16::MAX as u64).contains(p))
            .ok_or_else(|| Error::bad_request(format!("{} is not a valid port", port)))?;
        let port = port as u16;
        if port == settings.control_port {
            return Err(Error::bad_request(format!("{} is reserved", port)));
        }
        bindings.insert(name.clone(), port);
    }

    Ok(bindings)
}

fn require_admin(caller: &Caller) -> Result<()> {
    if caller.is_admin {
        Ok(())
    } else {
        Err(Error::forbidden("Admin rights required"))
    }
}

fn validate_access_restriction(
    value: Option<Option<AccessRestriction>>,
    manifest: &Manifest,
) -> Result<Option<AccessRestriction>> {
    let restriction = value.ok_or_else(|| Error::bad_request("accessRestriction is required"))?;

    if manifest.single_user {
        let single = restriction
            .as_ref()
            .is_some_and(|r| r.users.len() == 1 && r.groups.is_empty());
        if !single {
            return Err(Error::bad_request("accessRestriction must specify one user"));
        }
    }

    Ok(restriction)
}

/// A JSON field that must be a string when present.
fn string_field(name: &str, value: Option<serde_json::Value>) -> Result<Option<String>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(Error::bad_request(format!("{} must be a string", name))),
    }
}

fn already_in_use(err: RegistryError) -> Error {
    match err {
        RegistryError::AlreadyExists(what) => Error::conflict(format!("{} is already in use", what)),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::test_manifest;
    use crate::model::TcpPort;

    fn settings() -> ServiceSettings {
        ServiceSettings {
            admin_location: "my".into(),
            control_port: 3000,
        }
    }

    fn manifest_with_ssh() -> Manifest {
        let mut manifest = test_manifest();
        manifest.tcp_ports.insert(
            "SSH_PORT".into(),
            TcpPort {
                description: "ssh".into(),
                container_port: 22,
            },
        );
        manifest
    }

    #[test]
    fn test_location_rules() {
        let settings = settings();
        assert_eq!(validate_location(&settings, Some("foo-1")).unwrap(), "foo-1");

        for bad in ["my", "api", "", "Foo", "foo_bar", "-foo", "foo-"] {
            let err = validate_location(&settings, Some(bad)).unwrap_err();
            assert!(matches!(err, Error::BadRequest(_)), "{} accepted", bad);
        }
        assert!(validate_location(&settings, None).is_err());
        assert!(validate_location(&settings, Some(&"a".repeat(64))).is_err());
    }

    #[test]
    fn test_port_binding_rules() {
        let settings = settings();
        let manifest = manifest_with_ssh();

        let bindings = validate_port_bindings(
            &settings,
            Some(&serde_json::json!({ "SSH_PORT": 6000 })),
            &manifest,
        )
        .unwrap();
        assert_eq!(bindings.get("SSH_PORT"), Some(&6000));

        for bad in [
            serde_json::json!([6000]),
            serde_json::json!({ "SSH_PORT": 22 }),
            serde_json::json!({ "SSH_PORT": 3000 }),
            serde_json::json!({ "SSH_PORT": "6000" }),
            serde_json::json!({ "HTTP_PORT": 6000 }),
        ] {
            assert!(validate_port_bindings(&settings, Some(&bad), &manifest).is_err(), "{}", bad);
        }

        assert!(
            validate_port_bindings(&settings, Some(&serde_json::Value::Null), &manifest)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_single_user_requires_exactly_one_user() {
        let mut manifest = test_manifest();
        manifest.single_user = true;

        let two = AccessRestriction {
            users: ["u1".to_string(), "u2".to_string()].into(),
            groups: Default::default(),
        };
        assert!(validate_access_restriction(Some(Some(two)), &manifest).is_err());
        assert!(validate_access_restriction(Some(None), &manifest).is_err());

        let one = AccessRestriction {
            users: ["u1".to_string()].into(),
            groups: Default::default(),
        };
        assert!(validate_access_restriction(Some(Some(one)), &manifest).is_ok());
    }

    #[test]
    fn test_access_restriction_is_required_but_may_be_null() {
        let manifest = test_manifest();
        assert!(validate_access_restriction(None, &manifest).is_err());
        assert_eq!(validate_access_restriction(Some(None), &manifest).unwrap(), None);
    }

    #[test]
    fn test_string_fields() {
        assert_eq!(string_field("cert", None).unwrap(), None);
        assert_eq!(
            string_field("cert", Some(serde_json::json!("x"))).unwrap(),
            Some("x".to_string())
        );
        assert!(string_field("cert", Some(serde_json::json!(42))).is_err());
    }

    #[test]
    fn test_install_request_distinguishes_null_from_absent() {
        let absent: InstallRequest = serde_json::from_str(r#"{"location":"foo"}"#).unwrap();
        assert_eq!(absent.access_restriction, None);

        let null: InstallRequest =
            serde_json::from_str(r#"{"location":"foo","accessRestriction":null}"#).unwrap();
        assert_eq!(null.access_restriction, Some(None));
    }
}
