//! Resource applier contracts.
//!
//! A resource applier owns one class of OS state (IP sets, a filter table,
//! a routing table, policy routing rules). Managers queue changes into it via
//! the non-blocking `&self` methods; the apply orchestrator later flushes all
//! queued changes in one call. Appliers are shared as `Arc<dyn ...>` between
//! managers and the orchestrator and must therefore use interior mutability.
//!
//! Every flush returns `Ok(None)` when done, `Ok(Some(delay))` when it wants
//! to be flushed again after `delay` (e.g. a lock could not be taken), or an
//! error when the flush failed and should be retried on the next pass.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;

use crate::event::IfaceState;

/// Resource applier errors.
#[derive(Debug, Error)]
pub enum ApplierError {
    #[error("Failed to program {resource}: {message}")]
    Program { resource: String, message: String },

    #[error("Flush task for {0} did not complete")]
    TaskFailed(String),
}

impl ApplierError {
    pub fn program(resource: impl Into<String>, message: impl Into<String>) -> Self {
        ApplierError::Program {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// Result of one flush.
pub type ApplyResult = Result<Option<Duration>, ApplierError>;

/// Kind of members an IP set holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpSetType {
    HashIp,
    HashNet,
}

/// Metadata of an IP set, independent of its members.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpSetMetadata {
    pub id: String,
    pub set_type: IpSetType,
}

impl IpSetMetadata {
    pub fn new(id: impl Into<String>, set_type: IpSetType) -> Self {
        Self {
            id: id.into(),
            set_type,
        }
    }
}

/// IP set programmer for one address family.
#[async_trait]
pub trait IpSetsDataplane: Send + Sync {
    /// Name used in logs, e.g. `ipv4`.
    fn name(&self) -> &str;

    /// Queue creation of the set, or replacement of all its members.
    fn add_or_replace_ip_set(&self, meta: IpSetMetadata, members: BTreeSet<IpNet>);

    fn add_members(&self, set_id: &str, members: BTreeSet<IpNet>);

    fn remove_members(&self, set_id: &str, members: BTreeSet<IpNet>);

    /// Queue deletion of the set. Deletion is only flushed by
    /// [`IpSetsDataplane::apply_deletions`].
    fn remove_ip_set(&self, set_id: &str);

    /// Force a full comparison against the kernel on the next flush.
    fn queue_resync(&self);

    /// Flush created/updated sets and membership changes.
    async fn apply_updates(&self) -> ApplyResult;

    /// Flush deletions of sets that are no longer wanted.
    async fn apply_deletions(&self) -> ApplyResult;
}

/// A packet-filter chain as rendered by a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<String>,
}

impl Chain {
    pub fn new(name: impl Into<String>, rules: Vec<String>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

/// One packet-filter table (e.g. `filter`, `nat`).
#[async_trait]
pub trait FilterTable: Send + Sync {
    fn name(&self) -> &str;

    fn update_chain(&self, chain: Chain);

    fn remove_chain(&self, name: &str);

    fn queue_resync(&self);

    async fn apply(&self) -> ApplyResult;
}

/// One routing table kept in sync with the kernel.
#[async_trait]
pub trait RouteTableSyncer: Send + Sync {
    fn name(&self) -> &str;

    /// Interface state notification, delivered outside the apply pass so the
    /// syncer can react to interfaces coming and going.
    fn on_iface_state_changed(&self, iface: &str, state: IfaceState);

    fn queue_resync(&self);

    async fn apply(&self) -> ApplyResult;
}

/// A set of policy routing rules.
#[async_trait]
pub trait RouteRules: Send + Sync {
    fn name(&self) -> &str;

    fn queue_resync(&self);

    async fn apply(&self) -> ApplyResult;
}
