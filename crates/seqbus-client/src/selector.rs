//! Relay selection.
//!
//! Relays serving an identical source set are peers in one relay group;
//! a registration binds to exactly one group at start time and never
//! migrates while running. Matching is order-independent: the sources
//! requested at registration resolve to the same group regardless of the
//! order they were listed in at relay-registration time.

use crate::error::{Error, Result};
use crate::relay::ServerInfo;
use std::collections::{BTreeSet, HashSet};

/// Relays serving one identical source set.
#[derive(Debug, Clone)]
pub struct RelayGroup {
    sources: BTreeSet<String>,
    relays: Vec<ServerInfo>,
}

impl RelayGroup {
    /// Canonical source set served by this group.
    pub fn sources(&self) -> &BTreeSet<String> {
        &self.sources
    }

    /// Peer relays, usable interchangeably for load balancing and
    /// failover.
    pub fn relays(&self) -> &[ServerInfo] {
        &self.relays
    }

    /// Pick a relay that has not been tried in the current round, if one
    /// remains.
    pub fn pick_untried(&self, tried: &HashSet<String>) -> Option<&ServerInfo> {
        self.relays.iter().find(|r| !tried.contains(&r.name))
    }
}

/// Groups known relays by identical served-source set and resolves
/// registrations to a group.
#[derive(Debug, Clone)]
pub struct RelaySelector {
    groups: Vec<RelayGroup>,
}

impl RelaySelector {
    /// Group the given relays.
    pub fn new(relays: Vec<ServerInfo>) -> Self {
        let mut groups: Vec<RelayGroup> = Vec::new();
        for relay in relays {
            let key: BTreeSet<String> = relay.sources.iter().cloned().collect();
            match groups.iter_mut().find(|g| g.sources == key) {
                Some(group) => group.relays.push(relay),
                None => groups.push(RelayGroup {
                    sources: key,
                    relays: vec![relay],
                }),
            }
        }
        Self { groups }
    }

    /// Resolve a registration's source list to its relay group.
    ///
    /// The match is exact set equality, independent of order. A source
    /// combination no relay group serves is a configuration error raised
    /// here, at registration time - never deferred to connect time.
    pub fn group_for<S: AsRef<str>>(&self, sources: &[S]) -> Result<&RelayGroup> {
        let requested: BTreeSet<String> =
            sources.iter().map(|s| s.as_ref().to_string()).collect();
        if requested.is_empty() {
            return Err(Error::Config("registration has no sources".to_string()));
        }
        self.groups
            .iter()
            .find(|g| g.sources == requested)
            .ok_or_else(|| {
                Error::Config(format!(
                    "no relay group serves sources {:?}; known groups: {:?}",
                    requested,
                    self.groups.iter().map(|g| &g.sources).collect::<Vec<_>>()
                ))
            })
    }

    /// All known groups.
    pub fn groups(&self) -> &[RelayGroup] {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relays() -> Vec<ServerInfo> {
        vec![
            ServerInfo::new("r1", "http://r1", vec!["S1".into(), "S2".into()]),
            ServerInfo::new("r2", "http://r2", vec!["S2".into(), "S1".into()]),
            ServerInfo::new("r3", "http://r3", vec!["S1".into(), "S3".into()]),
        ]
    }

    #[test]
    fn test_peers_grouped_by_source_set() {
        let sel = RelaySelector::new(relays());
        assert_eq!(sel.groups().len(), 2);
        // r1 and r2 serve the same set, listed in different orders.
        let group = sel.group_for(&["S1", "S2"]).unwrap();
        assert_eq!(group.relays().len(), 2);
    }

    #[test]
    fn test_order_independent_resolution() {
        let sel = RelaySelector::new(relays());
        let a = sel.group_for(&["S1", "S2"]).unwrap();
        let b = sel.group_for(&["S2", "S1"]).unwrap();
        assert_eq!(a.sources(), b.sources());
    }

    #[test]
    fn test_unserved_sources_rejected_immediately() {
        let sel = RelaySelector::new(relays());
        let err = sel.group_for(&["S10"]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        // Subset of a served set is still unserved: matching is exact.
        assert!(sel.group_for(&["S1"]).is_err());
        assert!(sel.group_for(&[] as &[&str]).is_err());
    }

    #[test]
    fn test_pick_untried_cycles_through_peers() {
        let sel = RelaySelector::new(relays());
        let group = sel.group_for(&["S1", "S2"]).unwrap();
        let mut tried = HashSet::new();

        let first = group.pick_untried(&tried).unwrap();
        tried.insert(first.name.clone());
        let second = group.pick_untried(&tried).unwrap();
        assert_ne!(first.name, second.name);
        tried.insert(second.name.clone());
        assert!(group.pick_untried(&tried).is_none());
    }
}
