use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{CaptureKey, CaptureRegistry, Specification};
use crate::event::{
    CaptureParams, ControlPlaneUpdate, IfaceState, IfaceStateUpdate, Update, WorkloadEndpointId,
};
use crate::manager::{Manager, ManagerError};
use crate::status::{ResourceStatus, StatusCombiner, StatusKey};

const STATUS_REPORTER: &str = "capture";

#[derive(Debug, Default)]
struct CaptureState {
    /// Parameters from the last upsert; `None` once withdrawn.
    requested: Option<CaptureParams>,
    /// What the registry was last told to run for this key.
    started: Option<Specification>,
}

/// Starts and stops packet captures once their device is ready.
pub struct CaptureManager {
    registry: Box<dyn CaptureRegistry>,
    allowed_prefixes: Vec<String>,
    captures: HashMap<CaptureKey, CaptureState>,
    endpoint_devices: HashMap<WorkloadEndpointId, String>,
    /// Up devices with an allowed name.
    up_devices: HashSet<String>,
    dirty: BTreeSet<CaptureKey>,
    status: Option<Arc<StatusCombiner>>,
}

impl CaptureManager {
    pub fn new(registry: Box<dyn CaptureRegistry>, allowed_prefixes: Vec<String>) -> Self {
        Self {
            registry,
            allowed_prefixes,
            captures: HashMap::new(),
            endpoint_devices: HashMap::new(),
            up_devices: HashSet::new(),
            dirty: BTreeSet::new(),
            status: None,
        }
    }

    /// Report per-capture status to `combiner`.
    pub fn with_status(mut self, combiner: Arc<StatusCombiner>) -> Self {
        self.status = Some(combiner);
        self
    }

    fn is_allowed_device(&self, name: &str) -> bool {
        self.allowed_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    fn mark_endpoint_dirty(&mut self, endpoint: &WorkloadEndpointId) {
        for key in self.captures.keys() {
            if &key.workload_endpoint == endpoint {
                self.dirty.insert(key.clone());
            }
        }
    }

    fn mark_device_dirty(&mut self, device: &str) {
        for key in self.captures.keys() {
            let mapped = self.endpoint_devices.get(&key.workload_endpoint);
            if mapped.map(String::as_str) == Some(device) {
                self.dirty.insert(key.clone());
            }
        }
    }

    fn on_iface_state(&mut self, update: &IfaceStateUpdate) {
        if !self.is_allowed_device(&update.name) {
            return;
        }
        match update.state {
            IfaceState::Up => {
                self.up_devices.insert(update.name.clone());
            }
            IfaceState::Down | IfaceState::NotPresent => {
                self.up_devices.remove(&update.name);
            }
        }
        self.mark_device_dirty(&update.name);
    }

    /// Specification to run for `key` right now, if it is ready.
    fn desired(
        &self,
        key: &CaptureKey,
        requested: Option<&CaptureParams>,
    ) -> Option<Specification> {
        let params = requested?;
        let device = self.endpoint_devices.get(&key.workload_endpoint)?;
        if !self.up_devices.contains(device) {
            return None;
        }
        Some(Specification {
            device_name: device.clone(),
            bpf_filter: params.bpf_filter.clone(),
            start_time: params.start_time,
            end_time: params.end_time,
        })
    }

    fn start(&mut self, key: &CaptureKey, spec: Specification) -> Result<(), ManagerError> {
        match self.registry.contains(key) {
            Some(existing) if existing == spec => {
                debug!(capture = %key, "Packet capture already running");
            }
            Some(_) => {
                self.registry.remove(key);
                self.registry.add(key, spec.clone())?;
            }
            None => {
                info!(capture = %key, device = %spec.device_name, "Starting packet capture");
                self.registry.add(key, spec.clone())?;
            }
        }
        if let Some(state) = self.captures.get_mut(key) {
            state.started = Some(spec);
        }
        Ok(())
    }

    fn restart(&mut self, key: &CaptureKey, spec: Specification) -> Result<(), ManagerError> {
        info!(capture = %key, device = %spec.device_name, "Updating packet capture");
        if self.registry.contains(key).is_some() {
            self.registry.remove(key);
        }
        if let Some(state) = self.captures.get_mut(key) {
            state.started = None;
        }
        self.registry.add(key, spec.clone())?;
        if let Some(state) = self.captures.get_mut(key) {
            state.started = Some(spec);
        }
        Ok(())
    }

    fn stop(&mut self, key: &CaptureKey, withdrawn: bool) -> Result<(), ManagerError> {
        if withdrawn {
            info!(capture = %key, "Stopping packet capture and removing its files");
            self.registry.remove_and_clean(key)?;
        } else {
            info!(capture = %key, "Stopping packet capture, device is gone");
            self.registry.remove(key);
        }
        if let Some(state) = self.captures.get_mut(key) {
            state.started = None;
        }
        Ok(())
    }

    /// Bring the registry in line with the current state of `key`.
    fn reconcile(&mut self, key: &CaptureKey) -> Result<(), ManagerError> {
        let Some(state) = self.captures.get(key) else {
            return Ok(());
        };
        let requested = state.requested.clone();
        let started = state.started.clone();
        let desired = self.desired(key, requested.as_ref());

        match (started, desired) {
            (None, Some(d)) => self.start(key, d),
            (Some(s), Some(d)) if s == d => Ok(()),
            (Some(_), Some(d)) => self.restart(key, d),
            (Some(_), None) => self.stop(key, requested.is_none()),
            (None, None) => Ok(()),
        }
    }

    fn report_status(&self, key: &CaptureKey, failed: bool) {
        let Some(combiner) = &self.status else {
            return;
        };
        let status = match self.captures.get(key) {
            None => None,
            Some(_) if failed => Some(ResourceStatus::Error),
            Some(state) if state.started.is_some() => Some(ResourceStatus::Up),
            Some(_) => Some(ResourceStatus::Down),
        };
        combiner.report(STATUS_REPORTER, StatusKey::Capture(key.clone()), status);
    }
}

impl Manager for CaptureManager {
    fn name(&self) -> &str {
        "capture"
    }

    fn on_update(&mut self, update: &Update) {
        match update {
            Update::ControlPlane(ControlPlaneUpdate::CaptureUpdate(u)) => {
                let key = CaptureKey {
                    namespace: u.id.namespace.clone(),
                    capture_name: u.id.name.clone(),
                    workload_endpoint: u.endpoint.clone(),
                };
                debug!(capture = %key, "Capture update");
                self.captures.entry(key.clone()).or_default().requested =
                    Some(u.specification.clone());
                self.dirty.insert(key);
            }
            Update::ControlPlane(ControlPlaneUpdate::CaptureRemove(u)) => {
                let key = CaptureKey {
                    namespace: u.id.namespace.clone(),
                    capture_name: u.id.name.clone(),
                    workload_endpoint: u.endpoint.clone(),
                };
                debug!(capture = %key, "Capture removed");
                if let Some(state) = self.captures.get_mut(&key) {
                    state.requested = None;
                    self.dirty.insert(key);
                }
            }
            Update::ControlPlane(ControlPlaneUpdate::WorkloadEndpointUpdate(u)) => {
                self.endpoint_devices
                    .insert(u.id.clone(), u.endpoint.iface_name.clone());
                self.mark_endpoint_dirty(&u.id);
            }
            Update::ControlPlane(ControlPlaneUpdate::WorkloadEndpointRemove(u)) => {
                self.endpoint_devices.remove(&u.id);
                self.mark_endpoint_dirty(&u.id);
            }
            Update::IfaceState(u) => self.on_iface_state(u),
            Update::ControlPlane(_) | Update::IfaceAddrs(_) => {}
        }
    }

    fn complete_deferred_work(&mut self) -> Result<(), ManagerError> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut failures = Vec::new();

        for key in dirty {
            let result = self.reconcile(&key);
            let failed = result.is_err();
            if let Err(e) = result {
                warn!(capture = %key, error = %e, "Failed to reconcile packet capture");
                self.dirty.insert(key.clone());
                failures.push(e);
            } else if self
                .captures
                .get(&key)
                .is_some_and(|s| s.requested.is_none() && s.started.is_none())
            {
                self.captures.remove(&key);
            }
            self.report_status(&key, failed);
        }

        ManagerError::collect(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureError, Result};
    use crate::event::{
        CaptureId, CaptureRemove, CaptureUpdate, WorkloadEndpoint, WorkloadEndpointUpdate,
    };
    use tokio::sync::mpsc;

    /// Minimal in-memory registry; the call-recording mock lives in test_util.
    #[derive(Default)]
    struct MemRegistry {
        active: HashMap<CaptureKey, Specification>,
    }

    impl CaptureRegistry for MemRegistry {
        fn contains(&self, key: &CaptureKey) -> Option<Specification> {
            self.active.get(key).cloned()
        }

        fn add(&mut self, key: &CaptureKey, spec: Specification) -> Result<()> {
            if self.active.contains_key(key) {
                return Err(CaptureError::AlreadyActive(key.clone()));
            }
            self.active.insert(key.clone(), spec);
            Ok(())
        }

        fn remove(&mut self, key: &CaptureKey) -> Option<Specification> {
            self.active.remove(key)
        }

        fn remove_and_clean(&mut self, key: &CaptureKey) -> Result<Option<Specification>> {
            Ok(self.active.remove(key))
        }
    }

    fn capture_update() -> Update {
        ControlPlaneUpdate::CaptureUpdate(CaptureUpdate {
            id: CaptureId::new("default", "pc1"),
            endpoint: WorkloadEndpointId::new("default/pod1"),
            specification: CaptureParams::default(),
        })
        .into()
    }

    fn endpoint_update(iface: &str) -> Update {
        ControlPlaneUpdate::WorkloadEndpointUpdate(WorkloadEndpointUpdate {
            id: WorkloadEndpointId::new("default/pod1"),
            endpoint: WorkloadEndpoint {
                iface_name: iface.to_string(),
            },
        })
        .into()
    }

    fn iface(name: &str, state: IfaceState) -> Update {
        IfaceStateUpdate::new(name, state, 7).into()
    }

    #[test]
    fn test_status_follows_capture_lifecycle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let combiner = Arc::new(StatusCombiner::new(tx));
        let mut mgr =
            CaptureManager::new(Box::new(MemRegistry::default()), vec!["cali".to_string()])
                .with_status(Arc::clone(&combiner));
        let key = StatusKey::Capture(CaptureKey::new("default", "pc1", "default/pod1"));

        mgr.on_update(&capture_update());
        mgr.complete_deferred_work().unwrap();
        combiner.apply();
        assert_eq!(
            rx.try_recv().unwrap(),
            crate::status::StatusReport::Update {
                key: key.clone(),
                status: ResourceStatus::Down
            }
        );

        mgr.on_update(&endpoint_update("cali123"));
        mgr.on_update(&iface("cali123", IfaceState::Up));
        mgr.complete_deferred_work().unwrap();
        combiner.apply();
        assert_eq!(
            rx.try_recv().unwrap(),
            crate::status::StatusReport::Update {
                key: key.clone(),
                status: ResourceStatus::Up
            }
        );

        mgr.on_update(
            &ControlPlaneUpdate::CaptureRemove(CaptureRemove {
                id: CaptureId::new("default", "pc1"),
                endpoint: WorkloadEndpointId::new("default/pod1"),
            })
            .into(),
        );
        mgr.complete_deferred_work().unwrap();
        combiner.apply();
        assert_eq!(
            rx.try_recv().unwrap(),
            crate::status::StatusReport::Remove { key }
        );
        assert!(mgr.captures.is_empty());
    }

    #[test]
    fn test_disallowed_device_is_ignored() {
        let mut mgr =
            CaptureManager::new(Box::new(MemRegistry::default()), vec!["cali".to_string()]);
        mgr.on_update(&capture_update());
        mgr.on_update(&endpoint_update("eth0"));
        mgr.on_update(&iface("eth0", IfaceState::Up));
        mgr.complete_deferred_work().unwrap();

        assert!(mgr.up_devices.is_empty());
        let key = CaptureKey::new("default", "pc1", "default/pod1");
        assert!(mgr.captures[&key].started.is_none());
    }
}
