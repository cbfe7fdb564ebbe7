//! Driver loop tests.
//!
//! Run a real `DataplaneDriver` on a paused tokio clock with recording
//! managers and appliers, and observe passes, health and status output.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mvirt_dataplane::capture::{CaptureKey, CaptureManager};
use mvirt_dataplane::cleanup::{Backoff, RetryPolicy};
use mvirt_dataplane::config::DataplaneConfig;
use mvirt_dataplane::driver::{DataplaneDriver, DriverError, DriverHandle, KUBE_IPVS_INTERFACE};
use mvirt_dataplane::event::{
    CaptureId, CaptureUpdate, ControlPlaneUpdate, IfaceState, IfaceStateUpdate, Update,
    WorkloadEndpoint, WorkloadEndpointId, WorkloadEndpointUpdate,
};
use mvirt_dataplane::manager::Capabilities;
use mvirt_dataplane::status::{ResourceStatus, StatusKey, StatusReport};
use mvirt_dataplane::test_util::{
    Journal, ManagerProbe, MockCaptureRegistry, RecordingManager, RecordingRouteTable,
};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Virtual time allowed for a condition to become true.
const WAIT: Duration = Duration::from_secs(60);

type Restarts = Arc<Mutex<Vec<String>>>;

fn test_config() -> DataplaneConfig {
    DataplaneConfig {
        throttle_refill_jitter_ms: 0,
        ..Default::default()
    }
}

fn new_driver(config: DataplaneConfig) -> (DataplaneDriver, DriverHandle, Restarts) {
    let restarts: Restarts = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&restarts);
    let (driver, handle) = DataplaneDriver::new(
        config,
        Box::new(move |reason: &str| recorded.lock().unwrap().push(reason.to_string())),
    );
    (driver, handle, restarts)
}

fn spawn(driver: DataplaneDriver) -> JoinHandle<Result<(), DriverError>> {
    tokio::spawn(driver.run())
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let res = timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(res.is_ok(), "timed out waiting for {}", what);
}

fn endpoint_update(id: &str, iface: &str) -> ControlPlaneUpdate {
    ControlPlaneUpdate::WorkloadEndpointUpdate(WorkloadEndpointUpdate {
        id: WorkloadEndpointId::new(id),
        endpoint: WorkloadEndpoint {
            iface_name: iface.to_string(),
        },
    })
}

#[tokio::test(start_paused = true)]
async fn test_no_pass_before_in_sync() {
    let (mut driver, mut handle, _) = new_driver(test_config());
    let probe = ManagerProbe::new();
    driver.register(Box::new(RecordingManager::new("m", probe.clone())));
    let task = spawn(driver);

    handle
        .control
        .send(endpoint_update("default/pod1", "cali1"))
        .await
        .unwrap();
    wait_for("update delivered", || probe.updates().len() == 1).await;
    sleep(Duration::from_secs(30)).await;
    assert_eq!(probe.pass_count(), 0);
    assert!(!handle.health.borrow().ready);

    handle.control.send(ControlPlaneUpdate::InSync).await.unwrap();
    wait_for("first pass", || probe.pass_count() == 1).await;
    wait_for("ready", || handle.health.borrow().ready).await;

    handle.stop();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_queued_updates_form_one_batch() {
    let (mut driver, handle, _) = new_driver(test_config());
    let probe = ManagerProbe::new();
    driver.register(Box::new(RecordingManager::new("m", probe.clone())));

    handle.control.try_send(ControlPlaneUpdate::InSync).unwrap();
    for i in 0..4 {
        handle
            .control
            .try_send(endpoint_update(&format!("default/pod{}", i), "cali1"))
            .unwrap();
    }
    let _task = spawn(driver);

    wait_for("first pass", || probe.pass_count() == 1).await;
    assert_eq!(probe.batch_ends(), vec![5]);
    // In emission order.
    assert_eq!(
        probe.updates()[0],
        Update::ControlPlane(ControlPlaneUpdate::InSync)
    );
}

#[tokio::test(start_paused = true)]
async fn test_ipvs_mismatch_requests_restart() {
    let (mut driver, handle, restarts) = new_driver(test_config());
    let probe = ManagerProbe::new();
    driver.register(Box::new(RecordingManager::new("m", probe.clone())));
    let _task = spawn(driver);

    // Absent while not configured: consistent.
    handle
        .iface_state
        .send(IfaceStateUpdate::new(KUBE_IPVS_INTERFACE, IfaceState::NotPresent, 0))
        .await
        .unwrap();
    handle
        .iface_state
        .send(IfaceStateUpdate::new("cali1", IfaceState::Up, 5))
        .await
        .unwrap();
    wait_for("cali1 delivered", || probe.updates().len() == 1).await;
    assert!(restarts.lock().unwrap().is_empty());

    // Appears while not configured: restart.
    handle
        .iface_state
        .send(IfaceStateUpdate::new(KUBE_IPVS_INTERFACE, IfaceState::Up, 9))
        .await
        .unwrap();
    wait_for("restart", || restarts.lock().unwrap().len() == 1).await;

    // The IPVS interface is never dispatched to managers.
    assert!(probe.updates().iter().all(|u| match u {
        Update::IfaceState(s) => s.name != KUBE_IPVS_INTERFACE,
        _ => true,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_ipvs_disappearing_when_configured_requests_restart() {
    let config = DataplaneConfig {
        kube_ipvs_support_enabled: true,
        ..test_config()
    };
    let (driver, handle, restarts) = new_driver(config);
    let _task = spawn(driver);

    handle
        .iface_state
        .send(IfaceStateUpdate::new(KUBE_IPVS_INTERFACE, IfaceState::Down, 9))
        .await
        .unwrap();
    sleep(Duration::from_secs(1)).await;
    assert!(restarts.lock().unwrap().is_empty());

    handle
        .iface_state
        .send(IfaceStateUpdate::new(KUBE_IPVS_INTERFACE, IfaceState::NotPresent, 9))
        .await
        .unwrap();
    wait_for("restart", || restarts.lock().unwrap().len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_iface_state_reaches_route_syncers() {
    let (mut driver, handle, _) = new_driver(test_config());
    let journal = Journal::new();
    let with_caps = Arc::new(RecordingRouteTable::new("main", journal.clone()));
    let without_caps = Arc::new(RecordingRouteTable::new("other", journal));
    driver.register_with(
        Box::new(
            RecordingManager::new("routes", ManagerProbe::new())
                .with_route_table(with_caps.clone()),
        ),
        Capabilities::default().route_tables(),
    );
    driver.register(Box::new(
        RecordingManager::new("plain", ManagerProbe::new())
            .with_route_table(without_caps.clone()),
    ));
    let _task = spawn(driver);

    handle
        .iface_state
        .send(IfaceStateUpdate::new("cali1", IfaceState::Up, 5))
        .await
        .unwrap();
    wait_for("iface event", || !with_caps.iface_events().is_empty()).await;

    assert_eq!(
        with_caps.iface_events(),
        vec![("cali1".to_string(), IfaceState::Up)]
    );
    assert!(without_caps.iface_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_throttle_paces_passes() {
    let config = DataplaneConfig {
        throttle_bucket_size: 1,
        ..test_config()
    };
    let (mut driver, handle, _) = new_driver(config);
    let probe = ManagerProbe::new();
    driver.register(Box::new(RecordingManager::new("m", probe.clone())));
    handle.control.try_send(ControlPlaneUpdate::InSync).unwrap();
    let _task = spawn(driver);

    wait_for("first pass", || probe.pass_count() == 1).await;
    handle
        .control
        .send(endpoint_update("default/pod1", "cali1"))
        .await
        .unwrap();
    wait_for("second pass", || probe.pass_count() == 2).await;

    let passes = probe.passes();
    assert!(passes[1] - passes[0] >= Duration::from_millis(90));
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_request_triggers_pass() {
    let (mut driver, handle, _) = new_driver(test_config());
    let probe = ManagerProbe::new();
    let table = Arc::new(RecordingRouteTable::new("main", Journal::new()));
    table.set_reschedule(Some(Duration::from_secs(5)));
    driver.register_with(
        Box::new(RecordingManager::new("m", probe.clone()).with_route_table(table.clone())),
        Capabilities::default().route_tables(),
    );
    handle.control.try_send(ControlPlaneUpdate::InSync).unwrap();
    let _task = spawn(driver);

    wait_for("rescheduled pass", || probe.pass_count() == 2).await;
    let passes = probe.passes();
    let gap = passes[1] - passes[0];
    assert!(gap >= Duration::from_secs(5), "gap {:?}", gap);
    assert!(gap < Duration::from_secs(6), "gap {:?}", gap);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_reschedule_is_ignored() {
    let (mut driver, handle, _) = new_driver(test_config());
    let probe = ManagerProbe::new();
    let table = Arc::new(RecordingRouteTable::new("main", Journal::new()));
    table.set_reschedule(Some(Duration::MAX));
    driver.register_with(
        Box::new(RecordingManager::new("m", probe.clone()).with_route_table(table.clone())),
        Capabilities::default().route_tables(),
    );
    handle.control.try_send(ControlPlaneUpdate::InSync).unwrap();
    let task = spawn(driver);

    wait_for("first pass", || probe.pass_count() == 1).await;
    sleep(Duration::from_secs(5)).await;
    assert!(!task.is_finished());
    assert_eq!(probe.pass_count(), 1);

    // The loop still reacts to new updates.
    handle.control.send(endpoint_update("default/pod1", "cali1")).await.unwrap();
    wait_for("second pass", || probe.pass_count() == 2).await;
    assert!(!task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_failing_passes_retry_and_degrade() {
    let config = DataplaneConfig {
        degraded_after_failures: 2,
        ..test_config()
    };
    let (mut driver, handle, _) = new_driver(config);
    let probe = ManagerProbe::new();
    probe.set_fail(true);
    driver.register(Box::new(RecordingManager::new("m", probe.clone())));
    handle.control.try_send(ControlPlaneUpdate::InSync).unwrap();
    let _task = spawn(driver);

    let health = handle.health.clone();
    wait_for("degraded", || health.borrow().degraded).await;
    assert!(probe.pass_count() >= 2);

    probe.set_fail(false);
    wait_for("recovered", || {
        let h = *health.borrow();
        h.ready && !h.degraded && h.consecutive_failures == 0
    })
    .await;

    // Converged: no more passes without new input.
    let settled = probe.pass_count();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(probe.pass_count(), settled);
}

#[tokio::test(start_paused = true)]
async fn test_startup_cleanup_failure_degrades_health() {
    let (mut driver, handle, _) = new_driver(test_config());
    driver.add_startup_cleanup(
        "purge",
        RetryPolicy {
            max_attempts: 2,
            backoff: Backoff::Fixed(Duration::from_millis(10)),
        },
        || async { Err::<(), _>("read-only filesystem") },
    );
    let _task = spawn(driver);

    let health = handle.health.clone();
    wait_for("degraded", || health.borrow().degraded).await;
    assert!(health.borrow().live);
}

#[tokio::test(start_paused = true)]
async fn test_capture_status_is_published() {
    let (mut driver, mut handle, _) = new_driver(test_config());
    let (registry, registry_handle) = MockCaptureRegistry::new();
    let mgr = CaptureManager::new(Box::new(registry), vec!["cali".to_string()])
        .with_status(driver.status_combiner());
    driver.register(Box::new(mgr));
    let _task = spawn(driver);

    handle
        .control
        .send(ControlPlaneUpdate::CaptureUpdate(CaptureUpdate {
            id: CaptureId::new("default", "pc1"),
            endpoint: WorkloadEndpointId::new("default/pod1"),
            specification: Default::default(),
        }))
        .await
        .unwrap();
    handle
        .control
        .send(endpoint_update("default/pod1", "cali123"))
        .await
        .unwrap();
    handle.control.send(ControlPlaneUpdate::InSync).await.unwrap();
    handle
        .iface_state
        .send(IfaceStateUpdate::new("cali123", IfaceState::Up, 5))
        .await
        .unwrap();

    let key = CaptureKey::new("default", "pc1", "default/pod1");
    let expected = StatusReport::Update {
        key: StatusKey::Capture(key.clone()),
        status: ResourceStatus::Up,
    };
    let res = timeout(WAIT, async {
        while let Some(report) = handle.status.recv().await {
            if report == expected {
                return;
            }
        }
    })
    .await;
    assert!(res.is_ok(), "no Up status published");
    assert!(registry_handle.active(&key).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_survive_stop() {
    let (mut driver, mut handle, _) = new_driver(test_config());
    let (registry, registry_handle) = MockCaptureRegistry::new();
    let mgr = CaptureManager::new(Box::new(registry), vec!["cali".to_string()])
        .with_status(driver.status_combiner());
    driver.register(Box::new(mgr));
    let task = spawn(driver);

    handle
        .control
        .send(ControlPlaneUpdate::CaptureUpdate(CaptureUpdate {
            id: CaptureId::new("default", "pc1"),
            endpoint: WorkloadEndpointId::new("default/pod1"),
            specification: Default::default(),
        }))
        .await
        .unwrap();
    handle
        .control
        .send(endpoint_update("default/pod1", "cali123"))
        .await
        .unwrap();
    handle.control.send(ControlPlaneUpdate::InSync).await.unwrap();
    handle
        .iface_state
        .send(IfaceStateUpdate::new("cali123", IfaceState::Up, 5))
        .await
        .unwrap();

    let key = CaptureKey::new("default", "pc1", "default/pod1");
    wait_for("capture started", || registry_handle.active(&key).is_some()).await;

    // Nobody reads status until the driver has finished.
    handle.stop();
    assert!(task.await.unwrap().is_ok());

    let mut reports = Vec::new();
    let res = timeout(WAIT, async {
        while let Some(report) = handle.status.recv().await {
            reports.push(report);
        }
    })
    .await;
    assert!(res.is_ok(), "status channel still open after the driver finished");
    assert!(reports.contains(&StatusReport::Update {
        key: StatusKey::Capture(key),
        status: ResourceStatus::Up,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_loop() {
    let (driver, mut handle, _) = new_driver(test_config());
    let task = spawn(driver);
    sleep(Duration::from_secs(1)).await;

    handle.stop();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_stops_loop() {
    for _ in 0..20 {
        let (driver, handle, _) = new_driver(test_config());
        let task = spawn(driver);
        sleep(Duration::from_millis(10)).await;

        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn test_closed_input_is_an_error() {
    let (driver, handle, _) = new_driver(test_config());
    let task = spawn(driver);

    drop(handle.control);
    let res = task.await.unwrap();
    assert!(matches!(res, Err(DriverError::InputClosed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_simulated_hang_expires() {
    let config = DataplaneConfig {
        debug_simulate_hang_after_ms: Some(1_000),
        ..test_config()
    };
    let (driver, _handle, _) = new_driver(config);
    let task = spawn(driver);

    let res = timeout(Duration::from_secs(2 * 3600), task).await;
    let res = res.expect("driver should end after the hang").unwrap();
    assert!(matches!(res, Err(DriverError::SimulatedHangExpired)));
}
