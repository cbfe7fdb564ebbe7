//! Manager contract and the registry the driver owns.
//!
//! A manager owns one slice of desired dataplane state. It mutates that state
//! in [`Manager::on_update`] (no I/O, no blocking) and turns it into resource
//! applier calls in [`Manager::complete_deferred_work`], once per apply pass.
//!
//! Optional extensions are declared up front with [`Capabilities`] when the
//! manager is registered. The orchestrator never calls an extension the
//! manager did not register for.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::applier::{RouteRules, RouteTableSyncer};
use crate::capture::CaptureError;
use crate::event::Update;

/// Errors returned by managers. All of them mean "retry me next pass".
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Capture registry error: {0}")]
    Capture(#[from] CaptureError),

    #[error("{failed} operations failed, first: {first}")]
    Multiple {
        failed: usize,
        first: Box<ManagerError>,
    },

    #[error("{0}")]
    Other(String),
}

impl ManagerError {
    /// Fold a list of per-item failures into one error for the pass.
    pub fn collect(mut failures: Vec<ManagerError>) -> Result<(), ManagerError> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            failed => Err(ManagerError::Multiple {
                failed,
                first: Box::new(failures.remove(0)),
            }),
        }
    }
}

pub trait Manager: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Record an update. Called for every update, in order, between passes.
    fn on_update(&mut self, update: &Update);

    /// Batch-scoped resolution that may feed other managers. Only called when
    /// registered with [`Capabilities::resolves_batches`].
    fn resolve_update_batch(&mut self) -> Result<(), ManagerError> {
        Ok(())
    }

    /// Queue the changes for everything recorded since the last pass.
    fn complete_deferred_work(&mut self) -> Result<(), ManagerError>;

    /// Only called when registered with [`Capabilities::route_tables`].
    fn route_table_syncers(&self) -> Vec<Arc<dyn RouteTableSyncer>> {
        Vec::new()
    }

    /// Only called when registered with [`Capabilities::route_rules`].
    fn route_rules(&self) -> Vec<Arc<dyn RouteRules>> {
        Vec::new()
    }
}

/// Optional manager extensions, declared at registration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub resolves_batches: bool,
    pub route_tables: bool,
    pub route_rules: bool,
}

impl Capabilities {
    pub fn resolves_batches(mut self) -> Self {
        self.resolves_batches = true;
        self
    }

    pub fn route_tables(mut self) -> Self {
        self.route_tables = true;
        self
    }

    pub fn route_rules(mut self) -> Self {
        self.route_rules = true;
        self
    }
}

struct Registered {
    manager: Box<dyn Manager>,
    caps: Capabilities,
}

/// All managers, in registration order.
#[derive(Default)]
pub struct ManagerRegistry {
    managers: Vec<Registered>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager without optional extensions.
    pub fn register(&mut self, manager: Box<dyn Manager>) {
        self.register_with(manager, Capabilities::default());
    }

    pub fn register_with(&mut self, manager: Box<dyn Manager>, caps: Capabilities) {
        debug!(manager = manager.name(), ?caps, "Registering manager");
        self.managers.push(Registered { manager, caps });
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Deliver one update to every manager.
    pub fn dispatch(&mut self, update: &Update) {
        for entry in &mut self.managers {
            entry.manager.on_update(update);
        }
    }

    /// Route table syncers of every manager registered with `route_tables`.
    pub fn route_table_syncers(&self) -> Vec<Arc<dyn RouteTableSyncer>> {
        self.managers
            .iter()
            .filter(|e| e.caps.route_tables)
            .flat_map(|e| e.manager.route_table_syncers())
            .collect()
    }

    /// Route rule sets of every manager registered with `route_rules`.
    pub fn route_rules(&self) -> Vec<Arc<dyn RouteRules>> {
        self.managers
            .iter()
            .filter(|e| e.caps.route_rules)
            .flat_map(|e| e.manager.route_rules())
            .collect()
    }

    /// Run the resolve phase. Returns the number of managers that failed.
    pub fn resolve_update_batches(&mut self) -> usize {
        let mut failed = 0;
        for entry in self.managers.iter_mut().filter(|e| e.caps.resolves_batches) {
            if let Err(e) = entry.manager.resolve_update_batch() {
                debug!(
                    manager = entry.manager.name(),
                    error = %e,
                    "Couldn't resolve update batch for manager, will try again later"
                );
                failed += 1;
            }
        }
        failed
    }

    /// Run the deferred-work phase. One manager's failure never stops the
    /// others. Returns the number of managers that failed.
    pub fn complete_deferred_work(&mut self) -> usize {
        let mut failed = 0;
        for entry in &mut self.managers {
            if let Err(e) = entry.manager.complete_deferred_work() {
                debug!(
                    manager = entry.manager.name(),
                    error = %e,
                    "Couldn't complete deferred work for manager, will try again later"
                );
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ControlPlaneUpdate, IfaceState, IfaceStateUpdate};
    use std::sync::Mutex;

    /// Records every call into a shared log.
    struct Probe {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Manager for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn on_update(&mut self, update: &Update) {
            let kind = match update {
                Update::ControlPlane(u) => u.kind(),
                Update::IfaceState(_) => "iface_state",
                Update::IfaceAddrs(_) => "iface_addrs",
            };
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:update:{}", self.name, kind));
        }

        fn resolve_update_batch(&mut self) -> Result<(), ManagerError> {
            self.log.lock().unwrap().push(format!("{}:resolve", self.name));
            Ok(())
        }

        fn complete_deferred_work(&mut self) -> Result<(), ManagerError> {
            self.log.lock().unwrap().push(format!("{}:complete", self.name));
            if self.fail {
                return Err(ManagerError::Other("boom".to_string()));
            }
            Ok(())
        }
    }

    fn probe(name: &'static str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Box<dyn Manager> {
        Box::new(Probe {
            name,
            log: Arc::clone(log),
            fail,
        })
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ManagerRegistry::new();
        registry.register(probe("a", &log, false));
        registry.register(probe("b", &log, false));

        registry.dispatch(&Update::ControlPlane(ControlPlaneUpdate::InSync));
        registry.dispatch(&Update::IfaceState(IfaceStateUpdate::new(
            "eth0",
            IfaceState::Up,
            2,
        )));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:update:in_sync",
                "b:update:in_sync",
                "a:update:iface_state",
                "b:update:iface_state",
            ]
        );
    }

    #[test]
    fn test_resolve_only_for_registered_capability() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ManagerRegistry::new();
        registry.register(probe("plain", &log, false));
        registry.register_with(
            probe("resolver", &log, false),
            Capabilities::default().resolves_batches(),
        );

        assert_eq!(registry.resolve_update_batches(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["resolver:resolve"]);
    }

    #[test]
    fn test_deferred_work_failure_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ManagerRegistry::new();
        registry.register(probe("a", &log, true));
        registry.register(probe("b", &log, false));

        assert_eq!(registry.complete_deferred_work(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["a:complete", "b:complete"]);
    }

    #[test]
    fn test_collect_errors() {
        assert!(ManagerError::collect(Vec::new()).is_ok());

        let err = ManagerError::collect(vec![
            ManagerError::Other("first".to_string()),
            ManagerError::Other("second".to_string()),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "2 operations failed, first: first");
    }
}
