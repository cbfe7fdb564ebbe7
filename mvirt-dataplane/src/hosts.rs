//! All-hosts IP set.
//!
//! Keeps an IP set of every known host address, plus a filter chain that
//! accepts traffic sourced from it. The chain references the set, so the set
//! has to exist before the chain is committed and may only be deleted after
//! the chain is gone. Both are queued in the same pass; the apply ordering
//! takes care of the rest.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use tracing::{debug, info};

use crate::applier::{Chain, FilterTable, IpSetMetadata, IpSetType, IpSetsDataplane};
use crate::event::{ControlPlaneUpdate, Update};
use crate::manager::{Manager, ManagerError};

pub const ALL_HOSTS_IP_SET: &str = "all-hosts-net";
pub const FROM_HOSTS_CHAIN: &str = "mvirt-from-hosts";

pub struct AllHostsIpSetManager {
    ip_sets: Arc<dyn IpSetsDataplane>,
    filter: Arc<dyn FilterTable>,
    hosts: HashMap<String, Ipv4Addr>,
    dirty: bool,
    programmed: bool,
}

impl AllHostsIpSetManager {
    pub fn new(ip_sets: Arc<dyn IpSetsDataplane>, filter: Arc<dyn FilterTable>) -> Self {
        Self {
            ip_sets,
            filter,
            hosts: HashMap::new(),
            dirty: false,
            programmed: false,
        }
    }

    fn members(&self) -> BTreeSet<IpNet> {
        self.hosts
            .values()
            .map(|addr| IpNet::V4(Ipv4Net::from(*addr)))
            .collect()
    }

    fn chain() -> Chain {
        Chain::new(
            FROM_HOSTS_CHAIN,
            vec![format!(
                "-m set --match-set {} src -j ACCEPT",
                ALL_HOSTS_IP_SET
            )],
        )
    }
}

impl Manager for AllHostsIpSetManager {
    fn name(&self) -> &str {
        "all-hosts"
    }

    fn on_update(&mut self, update: &Update) {
        match update {
            Update::ControlPlane(ControlPlaneUpdate::HostMetadataUpdate(u)) => {
                if self.hosts.insert(u.hostname.clone(), u.ipv4_addr) != Some(u.ipv4_addr) {
                    debug!(host = %u.hostname, addr = %u.ipv4_addr, "Host address changed");
                    self.dirty = true;
                }
            }
            Update::ControlPlane(ControlPlaneUpdate::HostMetadataRemove(u)) => {
                if self.hosts.remove(&u.hostname).is_some() {
                    debug!(host = %u.hostname, "Host removed");
                    self.dirty = true;
                }
            }
            _ => {}
        }
    }

    fn complete_deferred_work(&mut self) -> Result<(), ManagerError> {
        if !self.dirty {
            return Ok(());
        }

        let members = self.members();
        if !members.is_empty() {
            self.ip_sets.add_or_replace_ip_set(
                IpSetMetadata::new(ALL_HOSTS_IP_SET, IpSetType::HashNet),
                members,
            );
            if !self.programmed {
                info!(set = ALL_HOSTS_IP_SET, chain = FROM_HOSTS_CHAIN, "Creating all-hosts chain");
                self.filter.update_chain(Self::chain());
                self.programmed = true;
            }
        } else if self.programmed {
            info!(
                set = ALL_HOSTS_IP_SET,
                chain = FROM_HOSTS_CHAIN,
                "No hosts left, removing all-hosts chain"
            );
            self.filter.remove_chain(FROM_HOSTS_CHAIN);
            self.ip_sets.remove_ip_set(ALL_HOSTS_IP_SET);
            self.programmed = false;
        }

        self.dirty = false;
        Ok(())
    }
}
