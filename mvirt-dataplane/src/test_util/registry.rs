//! Call-recording capture registry.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::capture::{CaptureError, CaptureKey, CaptureRegistry, Result, Specification};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Contains(CaptureKey),
    Add(CaptureKey, Specification),
    Remove(CaptureKey),
    RemoveAndClean(CaptureKey),
}

#[derive(Debug, Default)]
struct Shared {
    calls: Mutex<Vec<RegistryCall>>,
    active: Mutex<HashMap<CaptureKey, Specification>>,
    fail_add: AtomicBool,
    fail_clean: AtomicBool,
}

/// Registry handed to the manager under test.
pub struct MockCaptureRegistry(Arc<Shared>);

/// Test-side view of a [`MockCaptureRegistry`].
#[derive(Clone)]
pub struct RegistryHandle(Arc<Shared>);

impl MockCaptureRegistry {
    pub fn new() -> (Self, RegistryHandle) {
        let shared = Arc::new(Shared::default());
        (Self(Arc::clone(&shared)), RegistryHandle(shared))
    }

    fn record(&self, call: RegistryCall) {
        self.0.calls.lock().unwrap().push(call);
    }
}

impl RegistryHandle {
    /// Calls since the last `take_calls`.
    pub fn take_calls(&self) -> Vec<RegistryCall> {
        std::mem::take(&mut *self.0.calls.lock().unwrap())
    }

    pub fn active(&self, key: &CaptureKey) -> Option<Specification> {
        self.0.active.lock().unwrap().get(key).cloned()
    }

    /// Pretend a capture is already running, e.g. left over from before a
    /// restart.
    pub fn preload(&self, key: CaptureKey, spec: Specification) {
        self.0.active.lock().unwrap().insert(key, spec);
    }

    pub fn set_fail_add(&self, fail: bool) {
        self.0.fail_add.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_clean(&self, fail: bool) {
        self.0.fail_clean.store(fail, Ordering::SeqCst);
    }
}

fn injected(op: &str) -> CaptureError {
    CaptureError::Io {
        path: PathBuf::from("/mock"),
        source: io::Error::other(format!("injected {} failure", op)),
    }
}

impl CaptureRegistry for MockCaptureRegistry {
    fn contains(&self, key: &CaptureKey) -> Option<Specification> {
        self.record(RegistryCall::Contains(key.clone()));
        self.0.active.lock().unwrap().get(key).cloned()
    }

    fn add(&mut self, key: &CaptureKey, spec: Specification) -> Result<()> {
        self.record(RegistryCall::Add(key.clone(), spec.clone()));
        if self.0.fail_add.load(Ordering::SeqCst) {
            return Err(injected("add"));
        }
        let mut active = self.0.active.lock().unwrap();
        if active.contains_key(key) {
            return Err(CaptureError::AlreadyActive(key.clone()));
        }
        active.insert(key.clone(), spec);
        Ok(())
    }

    fn remove(&mut self, key: &CaptureKey) -> Option<Specification> {
        self.record(RegistryCall::Remove(key.clone()));
        self.0.active.lock().unwrap().remove(key)
    }

    fn remove_and_clean(&mut self, key: &CaptureKey) -> Result<Option<Specification>> {
        self.record(RegistryCall::RemoveAndClean(key.clone()));
        if self.0.fail_clean.load(Ordering::SeqCst) {
            return Err(injected("clean"));
        }
        Ok(self.0.active.lock().unwrap().remove(key))
    }
}
