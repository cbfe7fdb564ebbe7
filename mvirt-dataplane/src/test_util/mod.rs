//! Test utilities for mvirt-dataplane integration tests.
//!
//! Provides recording fakes for every external contract the driver talks
//! to, plus event builders. All fakes append to a shared [`Journal`] so tests
//! can assert on the order of flushes across appliers.

pub mod appliers;
pub mod managers;
pub mod registry;

pub use appliers::{
    FakeDomainInfo, RecordingFilterTable, RecordingIpSets, RecordingRouteRules,
    RecordingRouteTable,
};
pub use managers::{ManagerProbe, RecordingManager};
pub use registry::{MockCaptureRegistry, RegistryCall, RegistryHandle};

use std::sync::{Arc, Mutex};

use crate::event::{
    CaptureId, CaptureParams, CaptureRemove, CaptureUpdate, ControlPlaneUpdate, IfaceState,
    IfaceStateUpdate, Update, WorkloadEndpoint, WorkloadEndpointId, WorkloadEndpointRemove,
    WorkloadEndpointUpdate,
};

/// Ordered log of flushes, shared by all fakes of one test.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub fn capture_upsert(namespace: &str, name: &str, endpoint: &str, filter: &str) -> Update {
    ControlPlaneUpdate::CaptureUpdate(CaptureUpdate {
        id: CaptureId::new(namespace, name),
        endpoint: WorkloadEndpointId::new(endpoint),
        specification: CaptureParams {
            bpf_filter: filter.to_string(),
            ..Default::default()
        },
    })
    .into()
}

pub fn capture_remove(namespace: &str, name: &str, endpoint: &str) -> Update {
    ControlPlaneUpdate::CaptureRemove(CaptureRemove {
        id: CaptureId::new(namespace, name),
        endpoint: WorkloadEndpointId::new(endpoint),
    })
    .into()
}

pub fn endpoint_upsert(endpoint: &str, iface: &str) -> Update {
    ControlPlaneUpdate::WorkloadEndpointUpdate(WorkloadEndpointUpdate {
        id: WorkloadEndpointId::new(endpoint),
        endpoint: WorkloadEndpoint {
            iface_name: iface.to_string(),
        },
    })
    .into()
}

pub fn endpoint_remove(endpoint: &str) -> Update {
    ControlPlaneUpdate::WorkloadEndpointRemove(WorkloadEndpointRemove {
        id: WorkloadEndpointId::new(endpoint),
    })
    .into()
}

pub fn iface_state(name: &str, state: IfaceState) -> Update {
    IfaceStateUpdate::new(name, state, 10).into()
}
