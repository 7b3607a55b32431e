// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for per-app task ownership, draining and restart recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use appbox_controller::Error;
use appbox_controller::apps::UninstallRequest;
use appbox_controller::driver::MockDriver;
use appbox_controller::lifecycle::TaskKind;
use appbox_controller::model::{AppRecord, AppUpdate, InstallationState};
use appbox_controller::registry::{AppRegistry, MemoryAppRegistry};
use appbox_controller::scheduler::ScheduleError;
use common::*;

fn slow_box() -> TestBox {
    TestBox::with_parts(
        Arc::new(MemoryAppRegistry::new()),
        MockDriver::new().with_pull_delay(Duration::from_millis(300)),
    )
}

#[tokio::test]
async fn test_requests_conflict_while_task_active() {
    let tb = slow_box();
    let id = tb
        .service
        .install(&admin(), install_request("foo"))
        .await
        .unwrap();
    assert_eq!(tb.scheduler.active_task(&id), Some(TaskKind::Install));

    let err = tb.service.start(&admin(), &id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{err}");
    let err = tb.service.retry(&admin(), &id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{err}");
    let err = tb
        .service
        .uninstall(
            &admin(),
            &id,
            UninstallRequest {
                password: Some(ADMIN_PASSWORD.to_string()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{err}");

    tb.wait_idle(&id).await;
    let record = tb.get(&id).await.unwrap();
    assert_eq!(record.installation_state, InstallationState::Installed);
}

#[tokio::test]
async fn test_concurrent_reserve_grants_one_slot() {
    let tb = TestBox::new();

    let results: Vec<_> = (0..8).map(|_| tb.scheduler.reserve("a1")).collect();

    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == ScheduleError::Conflict("a1".to_string()))
    );
}

#[tokio::test]
async fn test_different_apps_run_in_parallel() {
    let tb = slow_box();

    let first = tb
        .service
        .install(&admin(), install_request("foo"))
        .await
        .unwrap();
    let second = tb
        .service
        .install(&admin(), install_request("bar"))
        .await
        .unwrap();

    assert_eq!(tb.scheduler.active_count(), 2);
    tb.wait_idle(&first).await;
    tb.wait_idle(&second).await;
    assert_eq!(tb.scheduler.active_count(), 0);
}

#[tokio::test]
async fn test_draining_rejects_new_requests() {
    let tb = TestBox::new();
    tb.scheduler.stop_pending_tasks();

    let err = tb
        .service
        .install(&admin(), install_request("foo"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ShuttingDown));
    assert_eq!(err.status_code().as_u16(), 503);
    assert!(tb.registry.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_wait_for_pending_tasks_returns_after_cancel() {
    let tb = slow_box();
    let id = tb
        .service
        .install(&admin(), install_request("foo"))
        .await
        .unwrap();

    tb.scheduler.stop_pending_tasks();
    tokio::time::timeout(Duration::from_secs(5), tb.scheduler.wait_for_pending_tasks())
        .await
        .expect("tasks drained");

    assert!(!tb.scheduler.is_active(&id));
    let record = tb.get(&id).await.unwrap();
    assert_ne!(record.installation_state, InstallationState::Installed);
}

#[tokio::test]
async fn test_resume_pending_after_restart() {
    let registry = MemoryAppRegistry::new();
    let driver = MockDriver::new();

    let mut interrupted = AppRecord::new_pending("a1", "io.appbox.test", manifest(), "foo");
    interrupted.installation_state = InstallationState::CreatingVolume;
    registry.add(&interrupted).await.unwrap();

    let leaving = AppRecord::new_pending("a2", "io.appbox.test", manifest(), "bar");
    registry.add(&leaving).await.unwrap();
    registry
        .update("a2", AppUpdate::state(InstallationState::PendingUninstall))
        .await
        .unwrap();

    let failed = AppRecord::new_pending("a3", "io.appbox.test", manifest(), "baz");
    registry.add(&failed).await.unwrap();
    registry
        .update(
            "a3",
            AppUpdate::failed(InstallationState::Error, "DownloadImage: boom"),
        )
        .await
        .unwrap();

    let tb = TestBox::with_parts(Arc::new(registry), driver);
    let resumed = tb.scheduler.resume_pending().await.unwrap();
    assert_eq!(resumed, 2);

    tb.wait_idle("a1").await;
    tb.wait_idle("a2").await;

    let record = tb.get("a1").await.unwrap();
    assert_eq!(record.installation_state, InstallationState::Installed);
    assert!(tb.proxy.route("a1").await.is_some());
    assert!(tb.get("a2").await.is_none());
    let untouched = tb.get("a3").await.unwrap();
    assert_eq!(untouched.installation_state, InstallationState::Error);
    assert_eq!(untouched.last_error.as_deref(), Some("DownloadImage: boom"));
}
