//! Packet capture admission.
//!
//! Capture requests arrive from the control plane before, after or
//! interleaved with the endpoint and interface events they depend on.
//! [`CaptureManager`] buffers them until the backing device is known and up,
//! and drives a [`CaptureRegistry`] with only the net transitions visible at
//! apply time.

mod manager;
mod registry;

pub use manager::CaptureManager;
pub use registry::{ActiveCaptures, purge_orphans};

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::WorkloadEndpointId;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture {0} is already active")]
    AlreadyActive(CaptureKey),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid name for a capture path component: {0:?}")]
    InvalidName(String),

    #[error("Failed to encode capture specification: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// One capture intent: a capture resource applied to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaptureKey {
    pub namespace: String,
    pub capture_name: String,
    pub workload_endpoint: WorkloadEndpointId,
}

impl CaptureKey {
    pub fn new(
        namespace: impl Into<String>,
        capture_name: impl Into<String>,
        workload_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            capture_name: capture_name.into(),
            workload_endpoint: WorkloadEndpointId::new(workload_endpoint),
        }
    }
}

impl fmt::Display for CaptureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.namespace, self.capture_name, self.workload_endpoint
        )
    }
}

/// Fully resolved capture parameters, as handed to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specification {
    pub device_name: String,
    pub bpf_filter: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Registry of running captures.
///
/// Implementations must refuse a second [`CaptureRegistry::add`] for a key
/// that is still active.
pub trait CaptureRegistry: Send {
    /// Specification of the active capture at `key`, if any.
    fn contains(&self, key: &CaptureKey) -> Option<Specification>;

    /// Start capturing.
    fn add(&mut self, key: &CaptureKey, spec: Specification) -> Result<()>;

    /// Stop capturing, keeping what was captured so far.
    fn remove(&mut self, key: &CaptureKey) -> Option<Specification>;

    /// Stop capturing and delete captured data.
    fn remove_and_clean(&mut self, key: &CaptureKey) -> Result<Option<Specification>>;
}
