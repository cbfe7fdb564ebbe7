//! Resource appliers that only log what they would program.
//!
//! Used by the daemon's dry-run mode and handy in tests: they keep the
//! desired and "programmed" views apart exactly like a real applier, so the
//! flush order is observable in the log.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::info;

use crate::applier::{ApplyResult, Chain, FilterTable, IpSetMetadata, IpSetsDataplane};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IpSet {
    meta: IpSetMetadata,
    members: BTreeSet<IpNet>,
}

#[derive(Default)]
struct IpSetsState {
    desired: BTreeMap<String, IpSet>,
    programmed: BTreeMap<String, IpSet>,
    dirty: BTreeSet<String>,
    resync: bool,
}

pub struct LoggingIpSets {
    name: String,
    state: Mutex<IpSetsState>,
}

impl LoggingIpSets {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(IpSetsState::default()),
        }
    }

    /// Members of a set as last flushed.
    pub fn programmed_members(&self, set_id: &str) -> Option<BTreeSet<IpNet>> {
        lock(&self.state)
            .programmed
            .get(set_id)
            .map(|s| s.members.clone())
    }

    fn take_resync(state: &mut IpSetsState) {
        if state.resync {
            let all: BTreeSet<String> = state
                .desired
                .keys()
                .chain(state.programmed.keys())
                .cloned()
                .collect();
            state.dirty.extend(all);
            state.resync = false;
        }
    }
}

#[async_trait]
impl IpSetsDataplane for LoggingIpSets {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_or_replace_ip_set(&self, meta: IpSetMetadata, members: BTreeSet<IpNet>) {
        let mut state = lock(&self.state);
        state.dirty.insert(meta.id.clone());
        state
            .desired
            .insert(meta.id.clone(), IpSet { meta, members });
    }

    fn add_members(&self, set_id: &str, members: BTreeSet<IpNet>) {
        let mut state = lock(&self.state);
        if let Some(set) = state.desired.get_mut(set_id) {
            set.members.extend(members);
            state.dirty.insert(set_id.to_string());
        }
    }

    fn remove_members(&self, set_id: &str, members: BTreeSet<IpNet>) {
        let mut state = lock(&self.state);
        if let Some(set) = state.desired.get_mut(set_id) {
            set.members.retain(|m| !members.contains(m));
            state.dirty.insert(set_id.to_string());
        }
    }

    fn remove_ip_set(&self, set_id: &str) {
        let mut state = lock(&self.state);
        state.desired.remove(set_id);
        state.dirty.insert(set_id.to_string());
    }

    fn queue_resync(&self) {
        lock(&self.state).resync = true;
    }

    async fn apply_updates(&self) -> ApplyResult {
        let mut state = lock(&self.state);
        Self::take_resync(&mut state);

        let ids: Vec<String> = state
            .dirty
            .iter()
            .filter(|id| state.desired.contains_key(*id))
            .cloned()
            .collect();
        for id in ids {
            state.dirty.remove(&id);
            let Some(set) = state.desired.get(&id).cloned() else {
                continue;
            };
            if state.programmed.get(&id) == Some(&set) {
                continue;
            }
            info!(
                family = %self.name,
                set = %id,
                members = set.members.len(),
                "Would program IP set"
            );
            state.programmed.insert(id, set);
        }
        Ok(None)
    }

    async fn apply_deletions(&self) -> ApplyResult {
        let mut state = lock(&self.state);
        Self::take_resync(&mut state);

        let ids: Vec<String> = state
            .dirty
            .iter()
            .filter(|id| !state.desired.contains_key(*id))
            .cloned()
            .collect();
        for id in ids {
            state.dirty.remove(&id);
            if state.programmed.remove(&id).is_some() {
                info!(family = %self.name, set = %id, "Would delete IP set");
            }
        }
        Ok(None)
    }
}

#[derive(Default)]
struct FilterState {
    desired: BTreeMap<String, Chain>,
    programmed: BTreeMap<String, Chain>,
}

pub struct LoggingFilterTable {
    name: String,
    state: Mutex<FilterState>,
}

impl LoggingFilterTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(FilterState::default()),
        }
    }

    /// Names of the chains as last flushed.
    pub fn programmed_chains(&self) -> Vec<String> {
        lock(&self.state).programmed.keys().cloned().collect()
    }
}

#[async_trait]
impl FilterTable for LoggingFilterTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn update_chain(&self, chain: Chain) {
        lock(&self.state).desired.insert(chain.name.clone(), chain);
    }

    fn remove_chain(&self, name: &str) {
        lock(&self.state).desired.remove(name);
    }

    fn queue_resync(&self) {
        // Nothing cached beyond `programmed`, which is what a resync would
        // re-read anyway.
    }

    async fn apply(&self) -> ApplyResult {
        let mut state = lock(&self.state);
        let state = &mut *state;

        for (name, chain) in &state.desired {
            if state.programmed.get(name) != Some(chain) {
                info!(
                    table = %self.name,
                    chain = %name,
                    rules = chain.rules.len(),
                    "Would program chain"
                );
            }
        }
        for name in state.programmed.keys() {
            if !state.desired.contains_key(name) {
                info!(table = %self.name, chain = %name, "Would delete chain");
            }
        }
        state.programmed = state.desired.clone();
        Ok(None)
    }
}
