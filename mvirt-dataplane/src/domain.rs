//! Domain name information feeding domain-based IP sets.
//!
//! The store learns name → address mappings outside of the control plane
//! (e.g. from snooped DNS responses). When it has news, IP sets have to be
//! re-flushed, both between passes and while a pass is busy programming
//! filter tables.

use std::future::pending;

use async_trait::async_trait;

#[async_trait]
pub trait DomainInfoStore: Send + Sync {
    /// Completes when the store has pending updates. Must be safe to drop
    /// before completion.
    async fn updates_ready(&self);

    /// Fold pending updates into the IP sets. Returns true when the dataplane
    /// needs a flush as a result.
    fn handle_updates(&self) -> bool;

    /// The IP set changes from the last [`DomainInfoStore::handle_updates`]
    /// have been programmed.
    fn updates_applied(&self);
}

/// Store used when no domain-based policy is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDomainInfo;

#[async_trait]
impl DomainInfoStore for NoDomainInfo {
    async fn updates_ready(&self) {
        pending::<()>().await
    }

    fn handle_updates(&self) -> bool {
        false
    }

    fn updates_applied(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_no_domain_info_never_ready() {
        let store = NoDomainInfo;
        let res = tokio::time::timeout(Duration::from_secs(3600), store.updates_ready()).await;
        assert!(res.is_err());
        assert!(!store.handle_updates());
    }
}
