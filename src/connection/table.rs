//! The connection table: peer id to outbound channel.
//!
//! Channels are created lazily, the first time a module sends to a peer or
//! traffic arrives from one. The table also keeps the hostname map used to
//! resolve peers that have not spoken yet, and fans phase-change events out
//! to every channel so phase-bounded protocols can flush.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::Timings;
use crate::message::Message;
use crate::peers::{PeerId, RemoteHost};
use crate::transport::{Action, ProtocolConfig, TransportError};
use crate::wallclock;

use super::Connection;

/// What the table decided about an outbound message.
pub enum SendDisposition {
    /// Local destination: hand straight to the dispatcher, no wire traffic.
    SelfDeliver(Message),
    /// Remote destination: perform these engine actions against the peer.
    Wire(PeerId, Vec<Action>),
}

pub struct ConnectionTable {
    local_id: PeerId,
    hostnames: HashMap<PeerId, RemoteHost>,
    connections: HashMap<PeerId, Connection>,
    resend_interval: Duration,
    default_timeout: Duration,
}

impl ConnectionTable {
    pub fn new(local_id: PeerId, timings: &Timings) -> Self {
        Self {
            local_id,
            hostnames: HashMap::new(),
            connections: HashMap::new(),
            resend_interval: Duration::from_millis(timings.CSRC_RESEND_TIME),
            default_timeout: Duration::from_millis(timings.CSRC_DEFAULT_TIMEOUT),
        }
    }

    /// The local node's identity.
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Records where a peer can be reached before any traffic has flowed.
    pub fn put_hostname(&mut self, peer: PeerId, hostname: impl Into<String>, port: u16) {
        self.hostnames
            .insert(peer, RemoteHost { hostname: hostname.into(), port });
    }

    /// The channel for a peer, created and resolved on first use.
    pub fn get_or_create(
        &mut self,
        peer: &PeerId,
    ) -> Result<&mut Connection, TransportError> {
        if !self.connections.contains_key(peer) {
            info!("making fresh connection to {}", peer);
            let config = ProtocolConfig {
                local_id: self.local_id.clone(),
                peer_id: peer.clone(),
                resend_interval: self.resend_interval,
                default_timeout: self.default_timeout,
            };
            let mut connection = Connection::new(&config);
            let endpoint = self
                .hostnames
                .get(peer)
                .map(|host| host.endpoint())
                .unwrap_or_else(|| peer.as_str().to_string());
            connection.set_addr(resolve(&endpoint)?);
            self.connections.insert(peer.clone(), connection);
        }
        Ok(self
            .connections
            .get_mut(peer)
            .expect("connection inserted above"))
    }

    /// Sends a message towards `dest`.
    ///
    /// A message to our own peer id short-circuits: the source id and send
    /// timestamp are stamped exactly as the transport would, and the message
    /// goes straight back for dispatch without touching any engine or the
    /// socket.
    pub fn send(
        &mut self,
        dest: &PeerId,
        mut msg: Message,
        now: Instant,
    ) -> Result<SendDisposition, TransportError> {
        if *dest == self.local_id {
            msg.source_peer_id = Some(self.local_id.clone());
            msg.destination_peer_id = Some(self.local_id.clone());
            msg.send_timestamp = wallclock::unix_micros();
            debug!("self-send of {} delivered locally", msg.handler_key);
            return Ok(SendDisposition::SelfDeliver(msg));
        }
        let wall = wallclock::unix_micros();
        let connection = self.get_or_create(dest)?;
        let actions = connection.send(msg, now, wall);
        Ok(SendDisposition::Wire(dest.clone(), actions))
    }

    /// Routes an inbound message to its source's channel, registering the
    /// peer on first contact. The observed socket address supersedes any
    /// configured hostname.
    pub fn receive(
        &mut self,
        msg: Message,
        from_addr: SocketAddr,
        now: Instant,
    ) -> Vec<Action> {
        let source = match &msg.source_peer_id {
            Some(source) => source.clone(),
            None => {
                warn!("dropping datagram without source id ({})", msg.handler_key);
                return Vec::new();
            }
        };
        let wall = wallclock::unix_micros();
        self.hostnames.entry(source.clone()).or_insert_with(|| RemoteHost {
            hostname: source.host().to_string(),
            port: source.port(),
        });
        if !self.connections.contains_key(&source) {
            info!("registering first-seen peer {}", source);
            let config = ProtocolConfig {
                local_id: self.local_id.clone(),
                peer_id: source.clone(),
                resend_interval: self.resend_interval,
                default_timeout: self.default_timeout,
            };
            self.connections.insert(source.clone(), Connection::new(&config));
        }
        let connection = self
            .connections
            .get_mut(&source)
            .expect("connection inserted above");
        connection.set_addr(from_addr);
        connection.receive(msg, now, wall)
    }

    pub fn connection(&self, peer: &PeerId) -> Option<&Connection> {
        self.connections.get(peer)
    }

    pub fn connection_mut(&mut self, peer: &PeerId) -> Option<&mut Connection> {
        self.connections.get_mut(peer)
    }

    /// Earliest resend deadline across every channel.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.connections
            .values()
            .filter_map(|connection| connection.next_deadline())
            .min()
    }

    /// Fires due resend timers; returns actions per peer.
    pub fn on_timer(&mut self, now: Instant) -> Vec<(PeerId, Vec<Action>)> {
        let wall = wallclock::unix_micros();
        let mut out = Vec::new();
        for (peer, connection) in self.connections.iter_mut() {
            if connection.next_deadline().is_some_and(|d| d <= now) {
                let actions = connection.on_timer(now, wall);
                if !actions.is_empty() {
                    out.push((peer.clone(), actions));
                }
            }
        }
        out
    }

    /// Broadcasts a scheduler phase change to every channel.
    pub fn change_phase(&mut self, new_round: bool) {
        for connection in self.connections.values_mut() {
            connection.change_phase(new_round);
        }
    }

    /// Stops a single peer's channel, leaving it to resynchronise on next
    /// contact.
    pub fn stop(&mut self, peer: &PeerId) {
        if let Some(connection) = self.connections.get_mut(peer) {
            warn!("stopping connection to {}", peer);
            connection.stop();
        }
        self.connections.remove(peer);
    }

    /// Drains every channel on shutdown.
    pub fn stop_all(&mut self) {
        for connection in self.connections.values_mut() {
            connection.stop();
        }
        self.connections.clear();
        debug!("all connections closed");
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn resolve(endpoint: &str) -> Result<SocketAddr, TransportError> {
    endpoint
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve {
            endpoint: endpoint.to_string(),
            detail: e.to_string(),
        })?
        .next()
        .ok_or_else(|| TransportError::Resolve {
            endpoint: endpoint.to_string(),
            detail: "no addresses returned".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ProtocolKind;

    fn table() -> ConnectionTable {
        ConnectionTable::new(
            PeerId::parse("127.0.0.1:1870").unwrap(),
            &Timings::for_tests(),
        )
    }

    fn msg(key: &str, protocol: ProtocolKind) -> Message {
        Message::new(key, protocol)
    }

    #[test]
    fn self_send_never_touches_the_wire() {
        let mut table = table();
        let local = table.local_id().clone();
        let disposition = table
            .send(&local, msg("lb.draft", ProtocolKind::Src), Instant::now())
            .unwrap();
        match disposition {
            SendDisposition::SelfDeliver(delivered) => {
                assert_eq!(delivered.source_peer_id.as_ref(), Some(&local));
                assert!(delivered.send_timestamp > 0);
            }
            SendDisposition::Wire(..) => panic!("self-send must not reach a channel"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn remote_send_creates_the_channel_lazily() {
        let mut table = table();
        let peer = PeerId::parse("127.0.0.1:2870").unwrap();
        assert!(table.connection(&peer).is_none());
        let disposition = table
            .send(&peer, msg("gm.invite", ProtocolKind::Src), Instant::now())
            .unwrap();
        match disposition {
            SendDisposition::Wire(dest, actions) => {
                assert_eq!(dest, peer);
                assert!(!actions.is_empty());
            }
            SendDisposition::SelfDeliver(_) => panic!("remote send delivered locally"),
        }
        assert_eq!(table.len(), 1);
        assert!(table.connection(&peer).unwrap().addr().is_some());
    }

    #[test]
    fn hostname_map_overrides_the_peer_id() {
        let mut table = table();
        let peer = PeerId::parse("node-b.internal:2870").unwrap();
        table.put_hostname(peer.clone(), "127.0.0.1", 2871);
        table
            .send(&peer, msg("gm.invite", ProtocolKind::Src), Instant::now())
            .unwrap();
        let addr = table.connection(&peer).unwrap().addr().unwrap();
        assert_eq!(addr.port(), 2871);
    }

    #[test]
    fn unresolvable_peer_is_a_transport_error() {
        let mut table = table();
        let peer = PeerId::parse("definitely-not-a-real-host.invalid:2870").unwrap();
        let result = table.send(&peer, msg("gm.invite", ProtocolKind::Src), Instant::now());
        assert!(matches!(result, Err(TransportError::Resolve { .. })));
    }

    #[test]
    fn inbound_traffic_registers_first_seen_peers() {
        let mut table = table();
        let from: SocketAddr = "127.0.0.1:2870".parse().unwrap();
        let mut inbound = msg("suc.data", ProtocolKind::Suc);
        inbound.handler_key = "gm.invite".to_string();
        inbound.source_peer_id = Some(PeerId::parse("127.0.0.1:2870").unwrap());
        let actions = table.receive(inbound, from, Instant::now());
        // Best-effort traffic is delivered without any handshake.
        assert!(actions.iter().any(|a| matches!(a, Action::Deliver(_))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn missing_source_is_dropped() {
        let mut table = table();
        let from: SocketAddr = "127.0.0.1:2870".parse().unwrap();
        let inbound = msg("gm.invite", ProtocolKind::Suc);
        assert!(table.receive(inbound, from, Instant::now()).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn phase_change_reaches_the_sliding_window() {
        let mut table = table();
        let peer = PeerId::parse("127.0.0.1:2870").unwrap();
        let now = Instant::now();
        table
            .send(&peer, msg("sc.state", ProtocolKind::Srsw), now)
            .unwrap();
        table.change_phase(false);
        // After the flush the next sliding-window send opens with a SYN.
        match table.send(&peer, msg("sc.state", ProtocolKind::Srsw), now).unwrap() {
            SendDisposition::Wire(_, actions) => {
                let syn = actions.iter().any(|a| match a {
                    Action::Write(m) => m.is_syn(),
                    _ => false,
                });
                assert!(syn, "expected a fresh syn after the phase flush");
            }
            SendDisposition::SelfDeliver(_) => panic!("remote send delivered locally"),
        }
    }

    #[test]
    fn stop_all_drains_every_channel() {
        let mut table = table();
        let peer_a = PeerId::parse("127.0.0.1:2870").unwrap();
        let peer_b = PeerId::parse("127.0.0.1:2871").unwrap();
        let now = Instant::now();
        table.send(&peer_a, msg("gm.invite", ProtocolKind::Src), now).unwrap();
        table.send(&peer_b, msg("gm.invite", ProtocolKind::Src), now).unwrap();
        assert_eq!(table.len(), 2);
        table.stop_all();
        assert!(table.is_empty());
        assert!(table.next_deadline().is_none());
    }
}
