//! The dataplane driver loop.
//!
//! A single task owns every manager and the sync state. It waits on all
//! update queues and timers at once, feeds updates to the managers in
//! batches, and runs an apply pass whenever the dataplane is dirty and the
//! throttle allows it.

use std::future::{Future, pending};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until};
use tracing::{debug, error, info, warn};

use crate::applier::{FilterTable, IpSetsDataplane};
use crate::apply::{ApplyOrchestrator, ForceRefresh};
use crate::cleanup::{CleanupHandle, CleanupOutcome, RetryPolicy, spawn_cleanup};
use crate::config::DataplaneConfig;
use crate::domain::DomainInfoStore;
use crate::drain::drain_batch;
use crate::event::{
    ControlPlaneUpdate, IfaceAddrsUpdate, IfaceState, IfaceStateUpdate, Update,
};
use crate::health::{HealthReport, HealthReporter};
use crate::manager::{Capabilities, Manager, ManagerRegistry};
use crate::status::{StatusCombiner, StatusReport};
use crate::throttle::Throttle;
use crate::timer::{JitterTicker, RescheduleTimer, tick_optional};

/// kube-proxy's dummy interface, present only in IPVS mode.
pub const KUBE_IPVS_INTERFACE: &str = "kube-ipvs0";

const SIMULATED_HANG: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Simulated hang expired")]
    SimulatedHangExpired,

    #[error("{0} update channel closed")]
    InputClosed(&'static str),
}

/// Called when the process must restart to pick up a changed environment.
pub type RestartCallback = Box<dyn FnMut(&str) + Send>;

type StartupCleanup = Box<dyn FnOnce() -> CleanupHandle + Send>;

/// Dataplane sync flags. Only the driver task writes these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SyncState {
    needs_sync: bool,
    force_ip_sets_refresh: bool,
    force_route_refresh: bool,
    /// No pass runs before the control plane has sent a full snapshot.
    datastore_in_sync: bool,
    done_first_apply: bool,
}

/// Caller's side of a driver: update queues in, status and health out.
///
/// Dropping the handle stops the driver.
pub struct DriverHandle {
    pub control: mpsc::Sender<ControlPlaneUpdate>,
    pub iface_state: mpsc::Sender<IfaceStateUpdate>,
    pub iface_addrs: mpsc::Sender<IfaceAddrsUpdate>,
    pub status: mpsc::UnboundedReceiver<StatusReport>,
    pub health: watch::Receiver<HealthReport>,
    stop: Option<oneshot::Sender<()>>,
}

impl DriverHandle {
    /// Ask the driver loop to exit after the current iteration.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }
}

struct Inputs {
    control: mpsc::Receiver<ControlPlaneUpdate>,
    iface_state: mpsc::Receiver<IfaceStateUpdate>,
    iface_addrs: mpsc::Receiver<IfaceAddrsUpdate>,
    stop: oneshot::Receiver<()>,
}

pub struct DataplaneDriver {
    config: DataplaneConfig,
    managers: ManagerRegistry,
    orchestrator: ApplyOrchestrator,
    status: Arc<StatusCombiner>,
    health: HealthReporter,
    restart: RestartCallback,
    startup_cleanups: Vec<StartupCleanup>,
    state: SyncState,
    inputs: Inputs,
}

impl DataplaneDriver {
    pub fn new(config: DataplaneConfig, restart: RestartCallback) -> (Self, DriverHandle) {
        let capacity = config.msg_peek_limit.max(1);
        let (control_tx, control_rx) = mpsc::channel(capacity);
        let (iface_state_tx, iface_state_rx) = mpsc::channel(capacity);
        let (iface_addrs_tx, iface_addrs_rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (health, health_rx) = HealthReporter::new(config.degraded_after_failures);

        let status = Arc::new(StatusCombiner::new(status_tx));
        let mut orchestrator = ApplyOrchestrator::new();
        orchestrator.set_status_combiner(Arc::clone(&status));

        let driver = Self {
            config,
            managers: ManagerRegistry::new(),
            orchestrator,
            status,
            health,
            restart,
            startup_cleanups: Vec::new(),
            state: SyncState::default(),
            inputs: Inputs {
                control: control_rx,
                iface_state: iface_state_rx,
                iface_addrs: iface_addrs_rx,
                stop: stop_rx,
            },
        };
        let handle = DriverHandle {
            control: control_tx,
            iface_state: iface_state_tx,
            iface_addrs: iface_addrs_tx,
            status: status_rx,
            health: health_rx,
            stop: Some(stop_tx),
        };
        (driver, handle)
    }

    /// Combiner managers report per-resource status to.
    pub fn status_combiner(&self) -> Arc<StatusCombiner> {
        Arc::clone(&self.status)
    }

    pub fn register(&mut self, manager: Box<dyn Manager>) {
        self.managers.register(manager);
    }

    pub fn register_with(&mut self, manager: Box<dyn Manager>, caps: Capabilities) {
        self.managers.register_with(manager, caps);
    }

    pub fn add_ip_sets(&mut self, ip_sets: Arc<dyn IpSetsDataplane>) {
        self.orchestrator.add_ip_sets(ip_sets);
    }

    pub fn add_filter_table(&mut self, table: Arc<dyn FilterTable>) {
        self.orchestrator.add_filter_table(table);
    }

    pub fn set_domain_info_store(&mut self, store: Arc<dyn DomainInfoStore>) {
        self.orchestrator.set_domain_info_store(store);
    }

    /// Run `op` in the background once the loop starts. Giving up marks the
    /// driver degraded.
    pub fn add_startup_cleanup<F, Fut, E>(
        &mut self,
        name: impl Into<String>,
        policy: RetryPolicy,
        op: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        self.startup_cleanups
            .push(Box::new(move || spawn_cleanup(name, policy, op)));
    }

    /// Run until stopped. Only returns an error when the loop can't go on.
    pub async fn run(mut self) -> Result<(), DriverError> {
        info!(managers = self.managers.len(), "Starting dataplane driver");

        let limit = self.config.msg_peek_limit;
        let mut throttle = Throttle::new(self.config.throttle_bucket_size);
        // Allow the first pass right away.
        throttle.refill();
        let mut refill = JitterTicker::new(
            self.config.throttle_refill_interval(),
            self.config.throttle_refill_jitter(),
        );
        let mut ip_sets_refresh = JitterTicker::optional(self.config.ip_sets_refresh_interval());
        let mut route_refresh = JitterTicker::optional(self.config.route_refresh_interval());
        let mut retry = periodic(self.config.retry_interval());
        let mut health_tick = periodic(self.config.health_interval());
        let mut reschedule = RescheduleTimer::new();
        let hang_at = self
            .config
            .debug_simulate_hang_after()
            .map(|d| Instant::now() + d);
        let domain = self.orchestrator.domain_info_store();

        let mut cleanups = JoinSet::new();
        for start in mem::take(&mut self.startup_cleanups) {
            let handle = start();
            let name = handle.name().to_string();
            cleanups.spawn(async move { (name, handle.outcome().await) });
        }

        self.health.report();

        loop {
            tokio::select! {
                // Stop wins over the queues closing when the handle is dropped.
                biased;

                _ = &mut self.inputs.stop => {
                    info!("Stopping dataplane driver");
                    return Ok(());
                }
                msg = self.inputs.control.recv() => {
                    let first = msg.ok_or(DriverError::InputClosed("control plane"))?;
                    let batch = drain_batch(first, &mut self.inputs.control, limit);
                    self.on_control_batch(batch);
                }
                msg = self.inputs.iface_state.recv() => {
                    let first = msg.ok_or(DriverError::InputClosed("interface state"))?;
                    let batch = drain_batch(first, &mut self.inputs.iface_state, limit);
                    self.on_iface_state_batch(batch);
                }
                msg = self.inputs.iface_addrs.recv() => {
                    let first = msg.ok_or(DriverError::InputClosed("interface address"))?;
                    let batch = drain_batch(first, &mut self.inputs.iface_addrs, limit);
                    self.on_iface_addrs_batch(batch);
                }
                _ = domain.updates_ready() => {
                    if domain.handle_updates() {
                        debug!("Domain info changed");
                        self.state.needs_sync = true;
                    }
                }
                _ = tick_optional(&mut ip_sets_refresh) => {
                    debug!("IP sets refresh timer ticked");
                    self.state.force_ip_sets_refresh = true;
                    self.state.needs_sync = true;
                }
                _ = tick_optional(&mut route_refresh) => {
                    debug!("Route refresh timer ticked");
                    self.state.force_route_refresh = true;
                    self.state.needs_sync = true;
                }
                _ = reschedule.fired() => {
                    debug!("Reschedule kick received");
                    self.state.needs_sync = true;
                }
                _ = refill.tick() => {
                    throttle.refill();
                }
                _ = retry.tick() => {
                    // Wake-up only; a dirty dataplane is retried below.
                }
                _ = health_tick.tick() => {
                    self.health.report();
                }
                Some(res) = cleanups.join_next(), if !cleanups.is_empty() => {
                    self.on_cleanup_done(res);
                }
                _ = hang_deadline(hang_at) => {
                    warn!(duration = ?SIMULATED_HANG, "Simulating a hung dataplane loop");
                    sleep(SIMULATED_HANG).await;
                    return Err(DriverError::SimulatedHangExpired);
                }
            }

            if self.state.datastore_in_sync && self.state.needs_sync && throttle.admit() {
                self.apply(&mut reschedule).await;
            }
        }
    }

    fn on_control_batch(&mut self, batch: Vec<ControlPlaneUpdate>) {
        debug!(count = batch.len(), "Received control plane updates");
        for msg in batch {
            if msg == ControlPlaneUpdate::InSync && !self.state.datastore_in_sync {
                info!("Datastore in sync, enabling dataplane updates");
                self.state.datastore_in_sync = true;
            }
            self.managers.dispatch(&Update::ControlPlane(msg));
        }
        self.state.needs_sync = true;
    }

    fn on_iface_state_batch(&mut self, batch: Vec<IfaceStateUpdate>) {
        debug!(count = batch.len(), "Received interface state updates");
        let syncers = self.managers.route_table_syncers();
        for msg in batch {
            if msg.name == KUBE_IPVS_INTERFACE {
                self.check_ipvs(msg.state);
                continue;
            }
            let (name, state) = (msg.name.clone(), msg.state);
            self.managers.dispatch(&Update::IfaceState(msg));
            for syncer in &syncers {
                syncer.on_iface_state_changed(&name, state);
            }
        }
        self.state.needs_sync = true;
    }

    fn on_iface_addrs_batch(&mut self, batch: Vec<IfaceAddrsUpdate>) {
        debug!(count = batch.len(), "Received interface address updates");
        for msg in batch {
            self.managers.dispatch(&Update::IfaceAddrs(msg));
        }
        self.state.needs_sync = true;
    }

    fn check_ipvs(&mut self, state: IfaceState) {
        let present = state != IfaceState::NotPresent;
        if present != self.config.kube_ipvs_support_enabled {
            error!(
                present,
                configured = self.config.kube_ipvs_support_enabled,
                "kube-proxy IPVS mode changed, restart required"
            );
            (self.restart)("kube-proxy IPVS mode changed");
        }
    }

    fn on_cleanup_done(&mut self, res: Result<(String, CleanupOutcome), tokio::task::JoinError>) {
        match res {
            Ok((name, outcome)) if outcome.is_success() => {
                debug!(cleanup = %name, ?outcome, "Startup cleanup done");
            }
            Ok((name, outcome)) => {
                warn!(cleanup = %name, ?outcome, "Startup cleanup gave up");
                self.health.record_cleanup_failure();
                self.health.report();
            }
            Err(e) => {
                warn!(error = %e, "Startup cleanup task died");
                self.health.record_cleanup_failure();
                self.health.report();
            }
        }
    }

    async fn apply(&mut self, reschedule: &mut RescheduleTimer) {
        self.state.needs_sync = false;
        let refresh = ForceRefresh {
            ip_sets: mem::take(&mut self.state.force_ip_sets_refresh),
            routes: mem::take(&mut self.state.force_route_refresh),
        };

        let outcome = self.orchestrator.apply(&mut self.managers, refresh).await;
        if outcome.needs_retry {
            self.state.needs_sync = true;
        }
        match outcome.reschedule_after {
            Some(delay) => reschedule.arm(delay),
            None => reschedule.disarm(),
        }

        self.health.record_pass(outcome.needs_retry);
        if !self.state.done_first_apply {
            info!("Completed first update to dataplane");
            self.state.done_first_apply = true;
            self.health.mark_ready();
        }
        self.health.report();
    }
}

/// Interval whose first tick is one period from now.
fn periodic(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn hang_deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending::<()>().await,
    }
}
