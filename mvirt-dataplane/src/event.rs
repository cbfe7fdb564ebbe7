//! Update events consumed by the dataplane driver and its managers.
//!
//! Events come from two places: the control plane (policy/endpoint/capture
//! resources) and the local interface monitor. Both are folded into the
//! closed [`Update`] enum so managers can match only the variants they care
//! about and ignore the rest.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a workload endpoint, e.g. `default/sample-pod`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadEndpointId(pub String);

impl WorkloadEndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadEndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a packet capture resource by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureId {
    pub namespace: String,
    pub name: String,
}

impl CaptureId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// User-facing capture parameters as received from the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureParams {
    /// BPF filter expression, empty for "capture everything".
    pub bpf_filter: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureUpdate {
    pub id: CaptureId,
    pub endpoint: WorkloadEndpointId,
    #[serde(default)]
    pub specification: CaptureParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRemove {
    pub id: CaptureId,
    pub endpoint: WorkloadEndpointId,
}

/// The part of a workload endpoint the dataplane cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEndpoint {
    /// Host-side interface backing the endpoint, e.g. `cali123`.
    pub iface_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEndpointUpdate {
    pub id: WorkloadEndpointId,
    pub endpoint: WorkloadEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadEndpointRemove {
    pub id: WorkloadEndpointId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetadataUpdate {
    pub hostname: String,
    pub ipv4_addr: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetadataRemove {
    pub hostname: String,
}

/// Messages from the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlPlaneUpdate {
    /// The control plane has sent a complete snapshot; the dataplane may now
    /// be programmed.
    InSync,
    CaptureUpdate(CaptureUpdate),
    CaptureRemove(CaptureRemove),
    WorkloadEndpointUpdate(WorkloadEndpointUpdate),
    WorkloadEndpointRemove(WorkloadEndpointRemove),
    HostMetadataUpdate(HostMetadataUpdate),
    HostMetadataRemove(HostMetadataRemove),
}

impl ControlPlaneUpdate {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlPlaneUpdate::InSync => "in_sync",
            ControlPlaneUpdate::CaptureUpdate(_) => "capture_update",
            ControlPlaneUpdate::CaptureRemove(_) => "capture_remove",
            ControlPlaneUpdate::WorkloadEndpointUpdate(_) => "workload_endpoint_update",
            ControlPlaneUpdate::WorkloadEndpointRemove(_) => "workload_endpoint_remove",
            ControlPlaneUpdate::HostMetadataUpdate(_) => "host_metadata_update",
            ControlPlaneUpdate::HostMetadataRemove(_) => "host_metadata_remove",
        }
    }
}

/// Operational state of a host interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfaceState {
    Up,
    Down,
    NotPresent,
}

impl IfaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IfaceState::Up => "up",
            IfaceState::Down => "down",
            IfaceState::NotPresent => "not_present",
        }
    }
}

impl fmt::Display for IfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceStateUpdate {
    pub name: String,
    pub state: IfaceState,
    #[serde(default)]
    pub index: u32,
}

impl IfaceStateUpdate {
    pub fn new(name: impl Into<String>, state: IfaceState, index: u32) -> Self {
        Self {
            name: name.into(),
            state,
            index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceAddrsUpdate {
    pub name: String,
    /// `None` when the interface no longer exists.
    pub addrs: Option<BTreeSet<IpAddr>>,
}

/// Any event delivered to managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "event", rename_all = "snake_case")]
pub enum Update {
    ControlPlane(ControlPlaneUpdate),
    IfaceState(IfaceStateUpdate),
    IfaceAddrs(IfaceAddrsUpdate),
}

impl From<ControlPlaneUpdate> for Update {
    fn from(u: ControlPlaneUpdate) -> Self {
        Update::ControlPlane(u)
    }
}

impl From<IfaceStateUpdate> for Update {
    fn from(u: IfaceStateUpdate) -> Self {
        Update::IfaceState(u)
    }
}

impl From<IfaceAddrsUpdate> for Update {
    fn from(u: IfaceAddrsUpdate) -> Self {
        Update::IfaceAddrs(u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_update_json() {
        let line = r#"{"source":"control_plane","event":{"kind":"capture_update","id":{"namespace":"default","name":"pc1"},"endpoint":"default/pod1","specification":{"bpf_filter":"tcp port 80"}}}"#;
        let update: Update = serde_json::from_str(line).unwrap();

        match update {
            Update::ControlPlane(ControlPlaneUpdate::CaptureUpdate(u)) => {
                assert_eq!(u.id, CaptureId::new("default", "pc1"));
                assert_eq!(u.endpoint.as_str(), "default/pod1");
                assert_eq!(u.specification.bpf_filter, "tcp port 80");
                assert!(u.specification.start_time.is_none());
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_in_sync_and_iface_json() {
        let in_sync: Update =
            serde_json::from_str(r#"{"source":"control_plane","event":{"kind":"in_sync"}}"#)
                .unwrap();
        assert_eq!(in_sync, Update::ControlPlane(ControlPlaneUpdate::InSync));

        let iface: Update = serde_json::from_str(
            r#"{"source":"iface_state","event":{"name":"cali123","state":"not_present"}}"#,
        )
        .unwrap();
        assert_eq!(
            iface,
            Update::IfaceState(IfaceStateUpdate::new("cali123", IfaceState::NotPresent, 0))
        );
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ControlPlaneUpdate::InSync.kind(), "in_sync");
        let remove = ControlPlaneUpdate::HostMetadataRemove(HostMetadataRemove {
            hostname: "node-1".to_string(),
        });
        assert_eq!(remove.kind(), "host_metadata_remove");
    }
}
