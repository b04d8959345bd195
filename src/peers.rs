//! Peer identity and the process-wide peer registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable printable identifier of a peer: a case-normalised `host:port`.
///
/// Two agents sharing a `PeerId` are considered the same logical node, so the
/// identifier must be derived the same way everywhere: lowercase the host,
/// keep the port as given.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Builds a peer id from a host and port, normalising the host's case.
    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host.to_ascii_lowercase(), port))
    }

    /// Parses a `host:port` string into a peer id.
    pub fn parse(raw: &str) -> Result<Self, PeerIdError> {
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| PeerIdError::MissingPort { raw: raw.to_string() })?;
        if host.is_empty() {
            return Err(PeerIdError::EmptyHost { raw: raw.to_string() });
        }
        let port: u16 = port
            .parse()
            .map_err(|_| PeerIdError::BadPort { raw: raw.to_string() })?;
        Ok(Self::from_host_port(host, port))
    }

    /// The textual form, `host:port`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host component.
    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.0)
    }

    /// The port component.
    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from parsing a peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdError {
    /// The identifier had no `:port` suffix.
    #[error("peer id {raw:?} is missing a :port suffix")]
    MissingPort { raw: String },

    /// The host part was empty.
    #[error("peer id {raw:?} has an empty host")]
    EmptyHost { raw: String },

    /// The port did not parse as a u16.
    #[error("peer id {raw:?} has an invalid port")]
    BadPort { raw: String },
}

/// Where a peer can be reached on the network.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteHost {
    pub hostname: String,
    pub port: u16,
}

impl RemoteHost {
    /// The `host:port` form used for socket address resolution.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// A known peer: its identity plus the address it was last reachable at.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub id: PeerId,
    pub host: RemoteHost,
}

impl PeerRecord {
    pub fn new(id: PeerId, host: RemoteHost) -> Self {
        Self { id, host }
    }
}

/// Ordered registry of every peer this node knows about, the local node
/// included. Iteration order is stable (sorted by id) so that tasks which
/// walk the fleet, like the clock exchange, visit peers the same way on
/// every node.
#[derive(Debug, Default)]
pub struct PeerList {
    peers: BTreeMap<PeerId, PeerRecord>,
}

impl PeerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a peer record.
    pub fn insert(&mut self, record: PeerRecord) {
        self.peers.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterates peers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Peers in id order, rotated so that iteration starts just after `pivot`.
    ///
    /// Used by round-based tasks to stagger which peer each node contacts
    /// first, spreading traffic across the fleet.
    pub fn rotated_after(&self, pivot: &PeerId) -> Vec<&PeerRecord> {
        let mut after: Vec<&PeerRecord> = Vec::new();
        let mut before: Vec<&PeerRecord> = Vec::new();
        for record in self.peers.values() {
            if record.id == *pivot {
                continue;
            }
            if record.id > *pivot {
                after.push(record);
            } else {
                before.push(record);
            }
        }
        after.extend(before);
        after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalises_case() {
        let id = PeerId::parse("Node-A.Example.ORG:1870").unwrap();
        assert_eq!(id.as_str(), "node-a.example.org:1870");
        assert_eq!(id.host(), "node-a.example.org");
        assert_eq!(id.port(), 1870);
    }

    #[test]
    fn parse_rejects_missing_port() {
        assert_eq!(
            PeerId::parse("nodea"),
            Err(PeerIdError::MissingPort { raw: "nodea".to_string() })
        );
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(matches!(
            PeerId::parse("nodea:70000"),
            Err(PeerIdError::BadPort { .. })
        ));
    }

    #[test]
    fn equal_ids_are_the_same_node() {
        let a = PeerId::parse("NODEA:1870").unwrap();
        let b = PeerId::from_host_port("nodea", 1870);
        assert_eq!(a, b);
    }

    #[test]
    fn rotation_starts_after_pivot() {
        let mut list = PeerList::new();
        for name in ["a:1", "b:1", "c:1", "d:1"] {
            let id = PeerId::parse(name).unwrap();
            list.insert(PeerRecord::new(
                id.clone(),
                RemoteHost { hostname: id.host().to_string(), port: 1 },
            ));
        }
        let pivot = PeerId::parse("b:1").unwrap();
        let order: Vec<&str> = list
            .rotated_after(&pivot)
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(order, vec!["c:1", "d:1", "a:1"]);
    }
}
