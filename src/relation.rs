// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer Registry: typed view over the replication peer group.
//!
//! On the wire every unit publishes a flat string bag. At the boundary the
//! bag is parsed into [`PeerFacts`]; nothing past this module touches raw
//! keys.
//!
//! | Wire key | Field | Format |
//! |----------|-------|--------|
//! | `host` | `host` | address string |
//! | `port` | `port` | decimal |
//! | `allowed-units` | `allowed_units` | space-separated unit names |
//! | `following` | `following` | unit name, absent when not following |
//!
//! Parsing is lenient: a malformed value is logged and treated as absent,
//! because a peer running an older or broken agent must not stop this unit
//! from reconciling.

use crate::unit::UnitId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Raw relation bag as exchanged with the substrate.
pub type WireBag = BTreeMap<String, String>;

const KEY_HOST: &str = "host";
const KEY_PORT: &str = "port";
const KEY_ALLOWED_UNITS: &str = "allowed-units";
const KEY_FOLLOWING: &str = "following";

/// Facts a unit publishes to its peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerFacts {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Units this unit accepts replication connections from.
    pub allowed_units: BTreeSet<UnitId>,
    /// Upstream the unit is streaming from, published only once live.
    pub following: Option<UnitId>,
}

impl PeerFacts {
    /// Parse a wire bag.
    pub fn from_wire(bag: &WireBag) -> Self {
        let host = bag
            .get(KEY_HOST)
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(str::to_string);

        let port = bag.get(KEY_PORT).and_then(|raw| match raw.trim().parse::<u16>() {
            Ok(0) | Err(_) => {
                warn!(port = %raw, "Ignoring invalid published port");
                None
            }
            Ok(p) => Some(p),
        });

        let allowed_units = bag
            .get(KEY_ALLOWED_UNITS)
            .map(|raw| {
                raw.split_whitespace()
                    .filter_map(|name| UnitId::new(name).ok())
                    .collect()
            })
            .unwrap_or_default();

        let following = bag
            .get(KEY_FOLLOWING)
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .and_then(|f| UnitId::new(f).ok());

        Self {
            host,
            port,
            allowed_units,
            following,
        }
    }

    /// Render as a wire bag. Absent fields are omitted.
    pub fn to_wire(&self) -> WireBag {
        let mut bag = WireBag::new();
        if let Some(host) = &self.host {
            bag.insert(KEY_HOST.to_string(), host.clone());
        }
        if let Some(port) = self.port {
            bag.insert(KEY_PORT.to_string(), port.to_string());
        }
        if !self.allowed_units.is_empty() {
            let units: Vec<&str> = self.allowed_units.iter().map(UnitId::as_str).collect();
            bag.insert(KEY_ALLOWED_UNITS.to_string(), units.join(" "));
        }
        if let Some(following) = &self.following {
            bag.insert(KEY_FOLLOWING.to_string(), following.to_string());
        }
        bag
    }

    /// Whether this unit has authorized `unit` to replicate from it.
    ///
    /// Authorization also requires connection details: a unit that has not
    /// published a host cannot be replicated from.
    pub fn authorizes(&self, unit: &UnitId) -> bool {
        self.host.is_some() && self.allowed_units.contains(unit)
    }
}

/// Snapshot of the peer group taken at the start of a tick.
///
/// Peer bags are read-only for the rest of the tick. The local bag is the
/// only mutable one and is published by the coordinator when the tick ends.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    local: UnitId,
    local_facts: PeerFacts,
    peers: BTreeMap<UnitId, PeerFacts>,
}

impl PeerRegistry {
    pub fn new(local: UnitId, local_facts: PeerFacts, peers: BTreeMap<UnitId, PeerFacts>) -> Self {
        let mut peers = peers;
        // A substrate listing the local unit as its own peer is tolerated.
        peers.remove(&local);
        Self {
            local,
            local_facts,
            peers,
        }
    }

    /// Build from raw wire bags.
    pub fn from_wire(local: UnitId, local_bag: &WireBag, peer_bags: &BTreeMap<UnitId, WireBag>) -> Self {
        let peers = peer_bags
            .iter()
            .map(|(unit, bag)| (unit.clone(), PeerFacts::from_wire(bag)))
            .collect();
        Self::new(local, PeerFacts::from_wire(local_bag), peers)
    }

    pub fn local(&self) -> &UnitId {
        &self.local
    }

    pub fn local_facts(&self) -> &PeerFacts {
        &self.local_facts
    }

    /// The only bag a unit may write.
    pub fn local_facts_mut(&mut self) -> &mut PeerFacts {
        &mut self.local_facts
    }

    pub fn peer_facts(&self, unit: &UnitId) -> Option<&PeerFacts> {
        self.peers.get(unit)
    }

    /// Published facts for any unit, including the local one.
    pub fn facts(&self, unit: &UnitId) -> Option<&PeerFacts> {
        if *unit == self.local {
            Some(&self.local_facts)
        } else {
            self.peers.get(unit)
        }
    }

    /// All peers in unit order. Stable within a tick.
    pub fn all_peers(&self) -> impl Iterator<Item = (&UnitId, &PeerFacts)> {
        self.peers.iter()
    }

    pub fn peer_units(&self) -> impl Iterator<Item = &UnitId> {
        self.peers.keys()
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Whether `unit` is a current member of the peer group (not self).
    pub fn contains(&self, unit: &UnitId) -> bool {
        self.peers.contains_key(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    fn bag(pairs: &[(&str, &str)]) -> WireBag {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_full_bag() {
        let facts = PeerFacts::from_wire(&bag(&[
            ("host", "10.0.0.1"),
            ("port", "5432"),
            ("allowed-units", "postgresql/1 postgresql/2"),
            ("following", "postgresql/0"),
        ]));
        assert_eq!(facts.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(facts.port, Some(5432));
        assert_eq!(facts.allowed_units.len(), 2);
        assert_eq!(facts.following, Some(unit("postgresql/0")));
    }

    #[test]
    fn test_parse_is_lenient() {
        let facts = PeerFacts::from_wire(&bag(&[
            ("host", "  "),
            ("port", "not-a-port"),
            ("following", ""),
        ]));
        assert_eq!(facts, PeerFacts::default());
    }

    #[test]
    fn test_wire_roundtrip_orders_allowed_units() {
        let mut facts = PeerFacts {
            host: Some("10.0.0.2".into()),
            port: Some(5433),
            ..Default::default()
        };
        facts.allowed_units.insert(unit("postgresql/10"));
        facts.allowed_units.insert(unit("postgresql/2"));

        let wire = facts.to_wire();
        assert_eq!(wire["allowed-units"], "postgresql/2 postgresql/10");
        assert!(!wire.contains_key("following"));
        assert_eq!(PeerFacts::from_wire(&wire), facts);
    }

    #[test]
    fn test_authorization_needs_host() {
        let mut facts = PeerFacts::default();
        facts.allowed_units.insert(unit("postgresql/1"));
        assert!(!facts.authorizes(&unit("postgresql/1")));

        facts.host = Some("10.0.0.1".into());
        assert!(facts.authorizes(&unit("postgresql/1")));
        assert!(!facts.authorizes(&unit("postgresql/2")));
    }

    #[test]
    fn test_registry_excludes_self() {
        let mut peers = BTreeMap::new();
        peers.insert(unit("postgresql/0"), PeerFacts::default());
        peers.insert(unit("postgresql/1"), PeerFacts::default());

        let registry = PeerRegistry::new(unit("postgresql/0"), PeerFacts::default(), peers);
        assert_eq!(registry.peer_count(), 1);
        assert!(!registry.contains(&unit("postgresql/0")));
        assert!(registry.facts(&unit("postgresql/0")).is_some());
    }
}
