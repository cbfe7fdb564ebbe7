//! One convergence pass over all managers and resource appliers.
//!
//! Ordering constraints between resource classes:
//!
//! - IP set members must be programmed before filter rules that reference
//!   the sets are committed.
//! - IP sets may only be deleted once no filter rule references them, i.e.
//!   after the filter tables were flushed.
//! - Routes and route rules are independent of both and flush alongside.
//!
//! Flushes within a stage run as separate tasks and are joined at explicit
//! barriers. A failure anywhere only marks the pass for retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

use crate::applier::{ApplierError, ApplyResult, FilterTable, IpSetsDataplane};
use crate::domain::{DomainInfoStore, NoDomainInfo};
use crate::manager::ManagerRegistry;
use crate::status::StatusCombiner;

/// Full resyncs requested for this pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForceRefresh {
    pub ip_sets: bool,
    pub routes: bool,
}

/// Result of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Something failed; the dataplane is still dirty.
    pub needs_retry: bool,
    /// Smallest retry delay requested by any applier.
    pub reschedule_after: Option<Duration>,
}

impl ApplyOutcome {
    fn record(&mut self, stage: &str, resource: &str, result: Result<ApplyResult, JoinError>) {
        let result = result.unwrap_or_else(|e| {
            warn!(stage, resource, error = %e, "Flush task died");
            Err(ApplierError::TaskFailed(resource.to_string()))
        });
        match result {
            Ok(None) => {}
            Ok(Some(delay)) if delay.is_zero() => {}
            Ok(Some(delay)) => {
                debug!(stage, resource, ?delay, "Resource asked to be flushed again");
                self.reschedule_after = Some(match self.reschedule_after {
                    Some(current) => current.min(delay),
                    None => delay,
                });
            }
            Err(e) => {
                warn!(stage, resource, error = %e, "Failed to apply dataplane updates, will retry");
                self.needs_retry = true;
            }
        }
    }
}

type FlushTask = (String, JoinHandle<ApplyResult>);

pub struct ApplyOrchestrator {
    ip_sets: Vec<Arc<dyn IpSetsDataplane>>,
    filter_tables: Vec<Arc<dyn FilterTable>>,
    domain_info: Arc<dyn DomainInfoStore>,
    status: Option<Arc<StatusCombiner>>,
}

impl Default for ApplyOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplyOrchestrator {
    pub fn new() -> Self {
        Self {
            ip_sets: Vec::new(),
            filter_tables: Vec::new(),
            domain_info: Arc::new(NoDomainInfo),
            status: None,
        }
    }

    pub fn add_ip_sets(&mut self, ip_sets: Arc<dyn IpSetsDataplane>) {
        self.ip_sets.push(ip_sets);
    }

    pub fn add_filter_table(&mut self, table: Arc<dyn FilterTable>) {
        self.filter_tables.push(table);
    }

    pub fn set_domain_info_store(&mut self, store: Arc<dyn DomainInfoStore>) {
        self.domain_info = store;
    }

    pub fn domain_info_store(&self) -> Arc<dyn DomainInfoStore> {
        Arc::clone(&self.domain_info)
    }

    pub fn set_status_combiner(&mut self, combiner: Arc<StatusCombiner>) {
        self.status = Some(combiner);
    }

    /// Run one pass. Never aborts early; every stage runs even if an
    /// earlier one failed.
    pub async fn apply(
        &self,
        managers: &mut ManagerRegistry,
        refresh: ForceRefresh,
    ) -> ApplyOutcome {
        let start = Instant::now();
        let mut outcome = ApplyOutcome::default();

        // Some managers feed others here, so this must finish before any
        // manager renders its deferred work.
        if managers.resolve_update_batches() > 0 {
            outcome.needs_retry = true;
        }
        if managers.complete_deferred_work() > 0 {
            outcome.needs_retry = true;
        }

        let route_tables = managers.route_table_syncers();
        let route_rules = managers.route_rules();
        if refresh.routes {
            debug!("Forcing route refresh");
            route_tables.iter().for_each(|r| r.queue_resync());
            route_rules.iter().for_each(|r| r.queue_resync());
        }
        if refresh.ip_sets {
            debug!("Forcing IP set refresh");
            self.ip_sets.iter().for_each(|s| s.queue_resync());
        }

        // IP set updates and routes start together.
        let ip_set_updates: Vec<FlushTask> = self
            .ip_sets
            .iter()
            .map(|s| {
                let s = Arc::clone(s);
                (s.name().to_string(), tokio::spawn(async move { s.apply_updates().await }))
            })
            .collect();
        let mut route_flushes: Vec<FlushTask> = route_tables
            .into_iter()
            .map(|r| (r.name().to_string(), tokio::spawn(async move { r.apply().await })))
            .collect();
        route_flushes.extend(
            route_rules
                .into_iter()
                .map(|r| (r.name().to_string(), tokio::spawn(async move { r.apply().await }))),
        );

        join_flushes("ip-set-updates", ip_set_updates, &mut outcome).await;

        // Sets are in place; filter rules may reference them now. Domain
        // updates keep flowing into the sets while the tables are written.
        let (stop_tx, stop_rx) = oneshot::channel();
        let domain_drain = tokio::spawn(drain_domain_updates(
            Arc::clone(&self.domain_info),
            self.ip_sets.clone(),
            stop_rx,
        ));

        let table_flushes: Vec<FlushTask> = self
            .filter_tables
            .iter()
            .map(|t| {
                let t = Arc::clone(t);
                (t.name().to_string(), tokio::spawn(async move { t.apply().await }))
            })
            .collect();
        join_flushes("filter-tables", table_flushes, &mut outcome).await;

        // The drain must be finished before deletions touch the same sets.
        let _ = stop_tx.send(());
        match domain_drain.await {
            Ok(true) => {}
            Ok(false) => outcome.needs_retry = true,
            Err(e) => {
                warn!(error = %e, "Domain info drain task died");
                outcome.needs_retry = true;
            }
        }

        let ip_set_deletions: Vec<FlushTask> = self
            .ip_sets
            .iter()
            .map(|s| {
                let s = Arc::clone(s);
                (s.name().to_string(), tokio::spawn(async move { s.apply_deletions().await }))
            })
            .collect();
        join_flushes("ip-set-deletions", ip_set_deletions, &mut outcome).await;

        join_flushes("routes", route_flushes, &mut outcome).await;

        if let Some(status) = &self.status {
            status.apply();
        }

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            needs_retry = outcome.needs_retry,
            "Finished applying updates to dataplane"
        );
        outcome
    }
}

async fn join_flushes(stage: &str, tasks: Vec<FlushTask>, outcome: &mut ApplyOutcome) {
    for (resource, handle) in tasks {
        outcome.record(stage, &resource, handle.await);
    }
}

/// Re-flush IP set updates whenever the domain store has news, until told
/// to stop. Returns false if any of those flushes failed.
async fn drain_domain_updates(
    store: Arc<dyn DomainInfoStore>,
    ip_sets: Vec<Arc<dyn IpSetsDataplane>>,
    mut stop: oneshot::Receiver<()>,
) -> bool {
    let mut ok = true;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = store.updates_ready() => {
                if !store.handle_updates() {
                    continue;
                }
                for s in &ip_sets {
                    if let Err(e) = s.apply_updates().await {
                        warn!(
                            family = s.name(),
                            error = %e,
                            "Failed to apply domain IP set updates"
                        );
                        ok = false;
                    }
                }
                store.updates_applied();
            }
        }
    }
    ok
}
