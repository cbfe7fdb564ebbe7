//! Recording resource appliers.
//!
//! Each flush appends `"{name}:{operation}"` to the journal when it
//! completes, e.g. `ipv4:updates`, `ipv4:deletions`, `filter:apply`.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::Notify;

use super::Journal;
use crate::applier::{
    ApplierError, ApplyResult, Chain, FilterTable, IpSetMetadata, IpSetsDataplane, RouteRules,
    RouteTableSyncer,
};
use crate::domain::DomainInfoStore;
use crate::event::IfaceState;

/// Knobs shared by all recording appliers.
#[derive(Debug, Default)]
struct Behaviour {
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
    reschedule: Mutex<Option<Duration>>,
    resyncs: AtomicUsize,
}

impl Behaviour {
    async fn flush(&self, journal: &Journal, entry: String) -> ApplyResult {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        journal.push(entry.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ApplierError::program(entry, "injected failure"));
        }
        Ok(*self.reschedule.lock().unwrap())
    }
}

macro_rules! behaviour_setters {
    () => {
        /// Make every flush fail until reset.
        pub fn set_fail(&self, fail: bool) {
            self.behaviour.fail.store(fail, Ordering::SeqCst);
        }

        /// Sleep this long inside every flush.
        pub fn set_delay(&self, delay: Option<Duration>) {
            *self.behaviour.delay.lock().unwrap() = delay;
        }

        /// Retry delay returned by every successful flush.
        pub fn set_reschedule(&self, after: Option<Duration>) {
            *self.behaviour.reschedule.lock().unwrap() = after;
        }

        pub fn resyncs(&self) -> usize {
            self.behaviour.resyncs.load(Ordering::SeqCst)
        }
    };
}

pub struct RecordingIpSets {
    name: String,
    journal: Journal,
    behaviour: Behaviour,
    queued: Mutex<Vec<String>>,
}

impl RecordingIpSets {
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
            behaviour: Behaviour::default(),
            queued: Mutex::new(Vec::new()),
        }
    }

    behaviour_setters!();

    /// Queued operations since creation, e.g. `replace:all-hosts-net`.
    pub fn queued(&self) -> Vec<String> {
        self.queued.lock().unwrap().clone()
    }

    fn queue(&self, op: String) {
        self.queued.lock().unwrap().push(op);
    }
}

#[async_trait]
impl IpSetsDataplane for RecordingIpSets {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_or_replace_ip_set(&self, meta: IpSetMetadata, _members: BTreeSet<IpNet>) {
        self.queue(format!("replace:{}", meta.id));
    }

    fn add_members(&self, set_id: &str, _members: BTreeSet<IpNet>) {
        self.queue(format!("add:{}", set_id));
    }

    fn remove_members(&self, set_id: &str, _members: BTreeSet<IpNet>) {
        self.queue(format!("remove-members:{}", set_id));
    }

    fn remove_ip_set(&self, set_id: &str) {
        self.queue(format!("delete:{}", set_id));
    }

    fn queue_resync(&self) {
        self.behaviour.resyncs.fetch_add(1, Ordering::SeqCst);
    }

    async fn apply_updates(&self) -> ApplyResult {
        self.behaviour
            .flush(&self.journal, format!("{}:updates", self.name))
            .await
    }

    async fn apply_deletions(&self) -> ApplyResult {
        self.behaviour
            .flush(&self.journal, format!("{}:deletions", self.name))
            .await
    }
}

pub struct RecordingFilterTable {
    name: String,
    journal: Journal,
    behaviour: Behaviour,
    chains: Mutex<Vec<String>>,
}

impl RecordingFilterTable {
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
            behaviour: Behaviour::default(),
            chains: Mutex::new(Vec::new()),
        }
    }

    behaviour_setters!();

    /// Names of chains currently queued as present.
    pub fn chains(&self) -> Vec<String> {
        self.chains.lock().unwrap().clone()
    }
}

#[async_trait]
impl FilterTable for RecordingFilterTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn update_chain(&self, chain: Chain) {
        let mut chains = self.chains.lock().unwrap();
        if !chains.contains(&chain.name) {
            chains.push(chain.name);
        }
    }

    fn remove_chain(&self, name: &str) {
        self.chains.lock().unwrap().retain(|c| c != name);
    }

    fn queue_resync(&self) {
        self.behaviour.resyncs.fetch_add(1, Ordering::SeqCst);
    }

    async fn apply(&self) -> ApplyResult {
        self.behaviour
            .flush(&self.journal, format!("{}:apply", self.name))
            .await
    }
}

pub struct RecordingRouteTable {
    name: String,
    journal: Journal,
    behaviour: Behaviour,
    iface_events: Mutex<Vec<(String, IfaceState)>>,
}

impl RecordingRouteTable {
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
            behaviour: Behaviour::default(),
            iface_events: Mutex::new(Vec::new()),
        }
    }

    behaviour_setters!();

    pub fn iface_events(&self) -> Vec<(String, IfaceState)> {
        self.iface_events.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouteTableSyncer for RecordingRouteTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_iface_state_changed(&self, iface: &str, state: IfaceState) {
        self.iface_events
            .lock()
            .unwrap()
            .push((iface.to_string(), state));
    }

    fn queue_resync(&self) {
        self.behaviour.resyncs.fetch_add(1, Ordering::SeqCst);
    }

    async fn apply(&self) -> ApplyResult {
        self.behaviour
            .flush(&self.journal, format!("{}:apply", self.name))
            .await
    }
}

pub struct RecordingRouteRules {
    name: String,
    journal: Journal,
    behaviour: Behaviour,
}

impl RecordingRouteRules {
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
            behaviour: Behaviour::default(),
        }
    }

    behaviour_setters!();
}

#[async_trait]
impl RouteRules for RecordingRouteRules {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_resync(&self) {
        self.behaviour.resyncs.fetch_add(1, Ordering::SeqCst);
    }

    async fn apply(&self) -> ApplyResult {
        self.behaviour
            .flush(&self.journal, format!("{}:apply", self.name))
            .await
    }
}

/// Domain info store driven by the test.
pub struct FakeDomainInfo {
    journal: Journal,
    notify: Notify,
    pending: AtomicUsize,
}

impl FakeDomainInfo {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            notify: Notify::new(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Simulate a new name → address mapping.
    pub fn push_update(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

#[async_trait]
impl DomainInfoStore for FakeDomainInfo {
    async fn updates_ready(&self) {
        self.notify.notified().await;
    }

    fn handle_updates(&self) -> bool {
        let pending = self.pending.swap(0, Ordering::SeqCst);
        if pending > 0 {
            self.journal.push("domain:handle");
        }
        pending > 0
    }

    fn updates_applied(&self) {
        self.journal.push("domain:applied");
    }
}
