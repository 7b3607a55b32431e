// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for request-level app operations.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use appbox_controller::Error;
use appbox_controller::addons::AddonCoordinator;
use appbox_controller::apps::{AppService, ConfigureRequest, ServiceSettings, UninstallRequest};
use appbox_controller::appstore::{FreeAppStore, HttpAppStore};
use appbox_controller::auth::{Caller, StaticAuthenticator};
use appbox_controller::driver::MockDriver;
use appbox_controller::lifecycle::{Lifecycle, PlatformEnv};
use appbox_controller::model::{AccessRestriction, AddonKind, AppUpdate, InstallationState};
use appbox_controller::network::{MemoryCertificateStore, MemoryDns, MemoryProxy, NetworkRegistrar};
use appbox_controller::registry::{AppRegistry, MemoryAppRegistry};
use appbox_controller::scheduler::TaskScheduler;
use common::*;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn restriction(users: &[&str], groups: &[&str]) -> AccessRestriction {
    AccessRestriction {
        users: users.iter().map(|u| u.to_string()).collect::<BTreeSet<_>>(),
        groups: groups.iter().map(|g| g.to_string()).collect::<BTreeSet<_>>(),
    }
}

fn alice() -> Caller {
    Caller::user("alice", vec!["staff".to_string()])
}

#[tokio::test]
async fn test_install_rejects_invalid_requests_without_writing() {
    let tb = TestBox::new();

    let cases = [
        ("manifest missing", {
            let mut r = install_request("foo");
            r.manifest = None;
            r
        }),
        ("app store id missing", {
            let mut r = install_request("foo");
            r.app_store_id = None;
            r
        }),
        ("reserved admin location", install_request("my")),
        ("reserved api location", install_request("api")),
        ("uppercase location", install_request("Foo")),
        ("access restriction missing", {
            let mut r = install_request("foo");
            r.access_restriction = None;
            r
        }),
        ("undeclared port binding", {
            let mut r = install_request("foo");
            r.port_bindings = Some(json!({ "SSH_PORT": 2222 }));
            r
        }),
        ("privileged port", {
            let mut r = install_request("foo");
            r.manifest = Some(manifest_with_echo_port());
            r.port_bindings = Some(json!({ "ECHO_PORT": 80 }));
            r
        }),
        ("control port", {
            let mut r = install_request("foo");
            r.manifest = Some(manifest_with_echo_port());
            r.port_bindings = Some(json!({ "ECHO_PORT": CONTROL_PORT }));
            r
        }),
    ];

    for (name, request) in cases {
        let err = tb.service.install(&admin(), request).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)), "{name}: {err}");
    }

    assert!(tb.registry.list().await.unwrap().is_empty());
    assert_eq!(tb.scheduler.active_count(), 0);
}

#[tokio::test]
async fn test_single_user_app_needs_exactly_one_user() {
    let tb = TestBox::new();
    let mut manifest = manifest();
    manifest.single_user = true;

    let mut request = install_request("foo");
    request.manifest = Some(manifest.clone());
    request.access_restriction = Some(Some(restriction(&["alice", "bob"], &[])));
    let err = tb.service.install(&admin(), request).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));
    assert!(tb.registry.list().await.unwrap().is_empty());

    let mut request = install_request("foo");
    request.manifest = Some(manifest);
    request.access_restriction = Some(Some(restriction(&["alice"], &[])));
    let id = tb.service.install(&admin(), request).await.unwrap();
    tb.wait_for_state(&id, InstallationState::Installed).await;
}

#[tokio::test]
async fn test_install_rejects_unregistered_addon() {
    let registry = MemoryAppRegistry::new();
    let network = NetworkRegistrar::new(
        Arc::new(MemoryProxy::new()),
        Arc::new(MemoryDns::new()),
        Arc::new(MemoryCertificateStore::new()),
        FQDN,
    );
    let lifecycle = Lifecycle::new(
        Arc::new(registry.clone()),
        Arc::new(MockDriver::new()),
        Arc::new(AddonCoordinator::new()),
        network,
        PlatformEnv::new(FQDN, "my"),
    );
    let service = AppService::new(
        TaskScheduler::new(lifecycle),
        Arc::new(FreeAppStore),
        Arc::new(StaticAuthenticator::default()),
        ServiceSettings {
            admin_location: "my".to_string(),
            control_port: CONTROL_PORT,
        },
    );

    let mut manifest = manifest();
    manifest.addons.insert(AddonKind::Redis, json!({}));
    let mut request = install_request("foo");
    request.manifest = Some(manifest);

    let err = service.install(&admin(), request).await.unwrap_err();

    assert!(matches!(&err, Error::BadRequest(msg) if msg.contains("redis")), "{err}");
    assert!(registry.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_install_requires_admin() {
    let tb = TestBox::new();

    let err = tb
        .service
        .install(&alice(), install_request("foo"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Forbidden(_)));
}

#[tokio::test]
async fn test_location_in_use_conflicts() {
    let tb = TestBox::new();
    tb.install("foo").await;

    let err = tb
        .service
        .install(&admin(), install_request("foo"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(err.status_code().as_u16(), 409);
    assert_eq!(tb.registry.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_installs_same_location() {
    let tb = TestBox::new();
    let caller = admin();

    let (first, second) = tokio::join!(
        tb.service.install(&caller, install_request("foo")),
        tb.service.install(&caller, install_request("foo")),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(err, Error::Conflict(_)), "{err}");
    assert_eq!(tb.registry.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_payment_required_creates_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/apps/io.appbox.test/purchase"))
        .respond_with(ResponseTemplate::new(402))
        .expect(1)
        .mount(&server)
        .await;

    let tb = TestBox::new();
    let service = AppService::new(
        tb.scheduler.clone(),
        Arc::new(HttpAppStore::new(server.uri(), "store-token")),
        Arc::new(StaticAuthenticator::new(Some(ADMIN_TOKEN), None)),
        ServiceSettings {
            admin_location: "my".to_string(),
            control_port: CONTROL_PORT,
        },
    );

    let err = service
        .install(&admin(), install_request("foo"))
        .await
        .unwrap_err();

    assert_eq!(err.status_code().as_u16(), 402);
    assert!(tb.registry.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_and_list_respect_access_restriction() {
    let tb = TestBox::new();
    let open = tb.install("open").await;
    let mut request = install_request("hidden");
    request.access_restriction = Some(Some(restriction(&["bob"], &[])));
    let hidden = tb.service.install(&admin(), request).await.unwrap();
    let mut request = install_request("team");
    request.access_restriction = Some(Some(restriction(&[], &["staff"])));
    let team = tb.service.install(&admin(), request).await.unwrap();
    tb.wait_idle(&hidden).await;
    tb.wait_idle(&team).await;

    let visible: Vec<String> = tb
        .service
        .list(&alice())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(visible, vec![open.id.clone(), team.clone()]);
    assert_eq!(tb.service.list(&admin()).await.unwrap().len(), 3);

    let err = tb.service.get(&alice(), &hidden).await.unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));
    assert_eq!(tb.service.get(&admin(), &hidden).await.unwrap().id, hidden);
    let err = tb.service.get(&admin(), "nope").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_configure_rejects_half_tls_pair_without_state_change() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;

    let err = tb
        .service
        .configure(
            &admin(),
            &record.id,
            ConfigureRequest {
                location: Some("foo".to_string()),
                access_restriction: Some(None),
                cert: Some(json!(TEST_CERT)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BadRequest(_)));
    assert!(!tb.scheduler.is_active(&record.id));
    assert_eq!(tb.get(&record.id).await.unwrap(), record);
}

#[tokio::test]
async fn test_configure_rejects_taken_location() {
    let tb = TestBox::new();
    tb.install("foo").await;
    let other = tb.install("bar").await;

    let err = tb
        .service
        .configure(
            &admin(),
            &other.id,
            ConfigureRequest {
                location: Some("foo".to_string()),
                access_restriction: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(tb.get(&other.id).await.unwrap().location, "bar");
}

#[tokio::test]
async fn test_configure_unknown_app_is_not_found() {
    let tb = TestBox::new();

    let err = tb
        .service
        .configure(
            &admin(),
            "nope",
            ConfigureRequest {
                location: Some("foo".to_string()),
                access_restriction: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_uninstall_password_checks() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;

    let err = tb
        .service
        .uninstall(&admin(), &record.id, UninstallRequest { password: None })
        .await
        .unwrap_err();
    assert_eq!(err.status_code().as_u16(), 400);

    let err = tb
        .service
        .uninstall(
            &admin(),
            &record.id,
            UninstallRequest {
                password: Some("wrong".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code().as_u16(), 403);

    assert_eq!(
        tb.get(&record.id).await.unwrap().installation_state,
        InstallationState::Installed
    );
}

#[tokio::test]
async fn test_start_and_stop_require_installed() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;
    tb.registry
        .update(
            &record.id,
            AppUpdate::failed(InstallationState::Error, "CreateContainer: boom"),
        )
        .await
        .unwrap();

    let err = tb.service.start(&admin(), &record.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    let err = tb.service.stop(&admin(), &record.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert!(!tb.scheduler.is_active(&record.id));
}

#[tokio::test]
async fn test_retry_of_installed_app_conflicts() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;

    let err = tb.service.retry(&admin(), &record.id).await.unwrap_err();

    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn test_port_binding_on_another_apps_http_port_conflicts() {
    let tb = TestBox::new();
    let first = tb.install("foo").await;
    let taken = first.http_port.unwrap();

    let mut request = install_request("bar");
    request.manifest = Some(manifest_with_echo_port());
    request.port_bindings = Some(json!({ "ECHO_PORT": taken }));
    let err = tb.service.install(&admin(), request).await.unwrap_err();

    assert!(matches!(&err, Error::Conflict(msg) if msg.contains(&taken.to_string())), "{err}");
    assert_eq!(tb.registry.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_configure_port_binding_on_another_apps_http_port_conflicts() {
    let tb = TestBox::new();
    let first = tb.install("foo").await;
    let mut request = install_request("bar");
    request.manifest = Some(manifest_with_echo_port());
    let second = tb.service.install(&admin(), request).await.unwrap();
    let before = tb.wait_for_state(&second, InstallationState::Installed).await;

    let err = tb
        .service
        .configure(
            &admin(),
            &second,
            ConfigureRequest {
                location: Some("bar".to_string()),
                port_bindings: Some(json!({ "ECHO_PORT": first.http_port.unwrap() })),
                access_restriction: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict(_)), "{err}");
    assert_eq!(tb.get(&second).await.unwrap(), before);
}

#[tokio::test]
async fn test_configure_refuses_unfinished_install() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;
    tb.registry
        .update(&record.id, AppUpdate::state(InstallationState::CreatingVolume))
        .await
        .unwrap();

    let err = tb
        .service
        .configure(
            &admin(),
            &record.id,
            ConfigureRequest {
                location: Some("foo".to_string()),
                access_restriction: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict(_)), "{err}");
    assert!(!tb.scheduler.is_active(&record.id));
    assert_eq!(
        tb.get(&record.id).await.unwrap().installation_state,
        InstallationState::CreatingVolume
    );
}
