//! mvirt-dataplane: node-local network dataplane reconciliation.
//!
//! Converges IP sets, packet-filter tables, routes and packet captures on
//! this node toward the desired state described by a stream of updates.
//!
//! # Architecture
//!
//! ```text
//! control plane ──┐
//! iface state ────┼──> DataplaneDriver ──> Manager::on_update (state only)
//! iface addrs ────┘          │
//!                            └──> ApplyOrchestrator (throttled)
//!                                   ├─ resolve / deferred work (managers)
//!                                   ├─ IP sets ─> filter tables ─> IP set deletions
//!                                   ├─ routes, route rules (in parallel)
//!                                   └─ status combiner
//! ```

pub mod applier;
pub mod apply;
pub mod capture;
pub mod cleanup;
pub mod config;
pub mod domain;
pub mod drain;
pub mod driver;
pub mod dryrun;
pub mod event;
pub mod health;
pub mod hosts;
pub mod manager;
pub mod status;
pub mod throttle;
pub mod timer;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use applier::{
    ApplierError, ApplyResult, Chain, FilterTable, IpSetMetadata, IpSetType, IpSetsDataplane,
    RouteRules, RouteTableSyncer,
};
pub use apply::{ApplyOrchestrator, ApplyOutcome, ForceRefresh};
pub use capture::{ActiveCaptures, CaptureError, CaptureKey, CaptureManager, CaptureRegistry};
pub use cleanup::{Backoff, CleanupHandle, CleanupOutcome, RetryPolicy, spawn_cleanup};
pub use config::{ConfigError, DataplaneConfig};
pub use domain::{DomainInfoStore, NoDomainInfo};
pub use driver::{DataplaneDriver, DriverError, DriverHandle, KUBE_IPVS_INTERFACE};
pub use event::{ControlPlaneUpdate, IfaceAddrsUpdate, IfaceState, IfaceStateUpdate, Update};
pub use health::{HealthReport, HealthReporter};
pub use hosts::AllHostsIpSetManager;
pub use manager::{Capabilities, Manager, ManagerError, ManagerRegistry};
pub use status::{ResourceStatus, StatusCombiner, StatusKey, StatusReport};
pub use throttle::Throttle;
