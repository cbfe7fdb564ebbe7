//! Scriptable manager.

use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use super::Journal;
use crate::applier::{RouteRules, RouteTableSyncer};
use crate::event::Update;
use crate::manager::{Manager, ManagerError};

#[derive(Debug, Default)]
struct ProbeState {
    updates: Vec<Update>,
    /// Time of every `complete_deferred_work` call.
    passes: Vec<Instant>,
    /// Number of updates seen before each pass.
    batch_ends: Vec<usize>,
    fail: bool,
}

/// Test-side view of a [`RecordingManager`].
#[derive(Debug, Clone, Default)]
pub struct ManagerProbe(Arc<Mutex<ProbeState>>);

impl ManagerProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<Update> {
        self.0.lock().unwrap().updates.clone()
    }

    pub fn passes(&self) -> Vec<Instant> {
        self.0.lock().unwrap().passes.clone()
    }

    pub fn pass_count(&self) -> usize {
        self.0.lock().unwrap().passes.len()
    }

    /// Updates seen so far at each pass.
    pub fn batch_ends(&self) -> Vec<usize> {
        self.0.lock().unwrap().batch_ends.clone()
    }

    /// Make `complete_deferred_work` fail until reset.
    pub fn set_fail(&self, fail: bool) {
        self.0.lock().unwrap().fail = fail;
    }
}

pub struct RecordingManager {
    name: String,
    probe: ManagerProbe,
    journal: Option<Journal>,
    route_tables: Vec<Arc<dyn RouteTableSyncer>>,
    route_rules: Vec<Arc<dyn RouteRules>>,
}

impl RecordingManager {
    pub fn new(name: impl Into<String>, probe: ManagerProbe) -> Self {
        Self {
            name: name.into(),
            probe,
            journal: None,
            route_tables: Vec::new(),
            route_rules: Vec::new(),
        }
    }

    /// Also log `"{name}:resolve"` and `"{name}:complete"` to `journal`.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_route_table(mut self, table: Arc<dyn RouteTableSyncer>) -> Self {
        self.route_tables.push(table);
        self
    }

    pub fn with_route_rules(mut self, rules: Arc<dyn RouteRules>) -> Self {
        self.route_rules.push(rules);
        self
    }

    fn log(&self, what: &str) {
        if let Some(journal) = &self.journal {
            journal.push(format!("{}:{}", self.name, what));
        }
    }
}

impl Manager for RecordingManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_update(&mut self, update: &Update) {
        self.probe.0.lock().unwrap().updates.push(update.clone());
    }

    fn resolve_update_batch(&mut self) -> Result<(), ManagerError> {
        self.log("resolve");
        Ok(())
    }

    fn complete_deferred_work(&mut self) -> Result<(), ManagerError> {
        self.log("complete");
        let mut state = self.probe.0.lock().unwrap();
        state.passes.push(Instant::now());
        let seen = state.updates.len();
        state.batch_ends.push(seen);
        if state.fail {
            return Err(ManagerError::Other(format!("{} failed", self.name)));
        }
        Ok(())
    }

    fn route_table_syncers(&self) -> Vec<Arc<dyn RouteTableSyncer>> {
        self.route_tables.clone()
    }

    fn route_rules(&self) -> Vec<Arc<dyn RouteRules>> {
        self.route_rules.clone()
    }
}
