//! Combines per-resource status from several reporters and publishes the
//! result once per apply pass.
//!
//! A resource can be reported on by more than one manager (for example an
//! IPv4 and an IPv6 flavour of the same manager). The published status is the
//! worst of the reports: `Error` beats `Down` beats `Up`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capture::CaptureKey;
use crate::event::WorkloadEndpointId;

/// Status of one resource. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Up,
    Down,
    Error,
}

/// Resource a status refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusKey {
    Capture(CaptureKey),
    WorkloadEndpoint { id: WorkloadEndpointId },
}

/// Message published on the driver's status channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusReport {
    Update {
        key: StatusKey,
        status: ResourceStatus,
    },
    Remove {
        key: StatusKey,
    },
}

#[derive(Default)]
struct Inner {
    /// Latest report per resource, per reporter.
    reports: HashMap<StatusKey, BTreeMap<String, ResourceStatus>>,
    /// What we last published per resource.
    published: HashMap<StatusKey, ResourceStatus>,
    dirty: HashSet<StatusKey>,
    receiver_gone: bool,
}

pub struct StatusCombiner {
    inner: Mutex<Inner>,
    tx: mpsc::UnboundedSender<StatusReport>,
}

impl StatusCombiner {
    pub fn new(tx: mpsc::UnboundedSender<StatusReport>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `reporter`'s view of `key`; `None` withdraws the report.
    pub fn report(&self, reporter: &str, key: StatusKey, status: Option<ResourceStatus>) {
        let mut inner = self.lock();
        match status {
            Some(status) => {
                inner
                    .reports
                    .entry(key.clone())
                    .or_default()
                    .insert(reporter.to_string(), status);
            }
            None => {
                if let Some(by_reporter) = inner.reports.get_mut(&key) {
                    by_reporter.remove(reporter);
                    if by_reporter.is_empty() {
                        inner.reports.remove(&key);
                    }
                }
            }
        }
        inner.dirty.insert(key);
    }

    /// Publish combined status for every resource that changed since the
    /// last call. Returns the number of messages sent.
    pub fn apply(&self) -> usize {
        let mut inner = self.lock();
        let dirty: Vec<StatusKey> = inner.dirty.drain().collect();
        let mut sent = 0;

        for key in dirty {
            let combined = inner
                .reports
                .get(&key)
                .and_then(|by_reporter| by_reporter.values().max().copied());
            let previous = inner.published.get(&key).copied();
            if combined == previous {
                continue;
            }

            let msg = match combined {
                Some(status) => {
                    inner.published.insert(key.clone(), status);
                    StatusReport::Update { key, status }
                }
                None => {
                    inner.published.remove(&key);
                    StatusReport::Remove { key }
                }
            };

            debug!(?msg, "Publishing status");
            if self.tx.send(msg).is_err() {
                if !inner.receiver_gone {
                    warn!("Status receiver dropped, discarding status updates");
                    inner.receiver_gone = true;
                }
            } else {
                sent += 1;
            }
        }
        sent
    }
}
