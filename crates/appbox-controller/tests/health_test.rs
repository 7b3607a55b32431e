// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the health supervisor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use appbox_controller::driver::MockDriver;
use appbox_controller::health::{HealthSupervisor, HealthSupervisorConfig};
use appbox_controller::lifecycle::TaskKind;
use appbox_controller::model::{AppRecord, InstallationState, RunState};
use appbox_controller::registry::{AppRegistry, MemoryAppRegistry};
use common::*;

fn supervisor(tb: &TestBox, probe: &SwitchProbe, failure_threshold: u32) -> HealthSupervisor {
    HealthSupervisor::new(
        tb.registry.clone(),
        Arc::new(tb.driver.clone()),
        Arc::new(probe.clone()),
        tb.scheduler.clone(),
        HealthSupervisorConfig {
            poll_interval: Duration::from_millis(20),
            failure_threshold,
        },
    )
}

async fn run_state(tb: &TestBox, id: &str) -> Option<RunState> {
    tb.get(id).await.unwrap().run_state
}

#[tokio::test]
async fn test_healthy_app_is_running() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;
    let probe = SwitchProbe::healthy();

    supervisor(&tb, &probe, 3).supervise_once().await.unwrap();

    assert_eq!(run_state(&tb, &record.id).await, Some(RunState::Running));
}

#[tokio::test]
async fn test_not_responding_after_threshold() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;
    let probe = SwitchProbe::healthy();
    let supervisor = supervisor(&tb, &probe, 3);

    supervisor.supervise_once().await.unwrap();
    probe.set_healthy(false);

    supervisor.supervise_once().await.unwrap();
    supervisor.supervise_once().await.unwrap();
    assert_eq!(run_state(&tb, &record.id).await, Some(RunState::Running));

    supervisor.supervise_once().await.unwrap();
    assert_eq!(
        run_state(&tb, &record.id).await,
        Some(RunState::NotResponding)
    );

    probe.set_healthy(true);
    supervisor.supervise_once().await.unwrap();
    assert_eq!(run_state(&tb, &record.id).await, Some(RunState::Running));
}

#[tokio::test]
async fn test_crashed_container_is_error() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;
    tb.driver.crash_container(&record.container_name(), 137).await;

    supervisor(&tb, &SwitchProbe::healthy(), 3)
        .supervise_once()
        .await
        .unwrap();

    assert_eq!(run_state(&tb, &record.id).await, Some(RunState::Error));
    assert_eq!(
        tb.get(&record.id).await.unwrap().installation_state,
        InstallationState::Installed
    );
}

#[tokio::test]
async fn test_missing_container_is_exited() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;
    tb.driver.vanish_container(&record.container_name()).await;

    supervisor(&tb, &SwitchProbe::healthy(), 3)
        .supervise_once()
        .await
        .unwrap();

    assert_eq!(run_state(&tb, &record.id).await, Some(RunState::Exited));
}

#[tokio::test]
async fn test_stopped_app_stays_exited() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;
    tb.scheduler
        .schedule(&record.id, TaskKind::Stop)
        .unwrap()
        .await
        .unwrap();

    supervisor(&tb, &SwitchProbe::healthy(), 3)
        .supervise_once()
        .await
        .unwrap();

    assert_eq!(run_state(&tb, &record.id).await, Some(RunState::Exited));
}

#[tokio::test]
async fn test_skips_apps_with_active_tasks_and_unfinished_installs() {
    let tb = TestBox::with_parts(
        Arc::new(MemoryAppRegistry::new()),
        MockDriver::new().with_pull_delay(Duration::from_millis(300)),
    );
    let pending = AppRecord::new_pending("a1", "io.appbox.test", manifest(), "foo");
    tb.registry.add(&pending).await.unwrap();
    let handle = tb.scheduler.schedule("a1", TaskKind::Install).unwrap();

    supervisor(&tb, &SwitchProbe::healthy(), 3)
        .supervise_once()
        .await
        .unwrap();

    assert_eq!(run_state(&tb, "a1").await, None);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let tb = TestBox::new();
    let record = tb.install("foo").await;
    let supervisor = Arc::new(supervisor(&tb, &SwitchProbe::healthy(), 3));
    let shutdown = supervisor.shutdown_handle();

    let handle = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    };

    let (tb, id) = (&tb, record.id.as_str());
    wait_until(move || async move { run_state(tb, id).await == Some(RunState::Running) }).await;

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("supervisor stopped")
        .unwrap();
}
