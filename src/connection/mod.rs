//! Per-peer channels and the table that owns them.

mod table;

pub use table::{ConnectionTable, SendDisposition};

use std::net::SocketAddr;
use std::time::Instant;

use log::trace;

use crate::message::{Message, ProtocolKind};
use crate::peers::PeerId;
use crate::transport::{Action, Protocol, ProtocolConfig, FULLY_RELIABLE};

/// One outbound channel to a peer, owning an engine per protocol selector.
/// Engines never see the socket; the connection collects their actions for
/// the event loop to perform.
pub struct Connection {
    peer_id: PeerId,
    addr: Option<SocketAddr>,
    reliability: u8,
    src: Protocol,
    suc: Protocol,
    srsw: Protocol,
}

impl Connection {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            peer_id: config.peer_id.clone(),
            addr: None,
            reliability: FULLY_RELIABLE,
            src: Protocol::new(ProtocolKind::Src, config),
            suc: Protocol::new(ProtocolKind::Suc, config),
            srsw: Protocol::new(ProtocolKind::Srsw, config),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn set_addr(&mut self, addr: SocketAddr) {
        self.addr = Some(addr);
    }

    /// Delivery probability percent used by fault-injection runs.
    pub fn reliability(&self) -> u8 {
        self.reliability
    }

    pub fn set_reliability(&mut self, reliability: u8) {
        self.reliability = reliability.min(FULLY_RELIABLE);
    }

    fn protocol_mut(&mut self, kind: ProtocolKind) -> &mut Protocol {
        match kind {
            ProtocolKind::Src => &mut self.src,
            ProtocolKind::Suc => &mut self.suc,
            ProtocolKind::Srsw => &mut self.srsw,
        }
    }

    fn protocols(&self) -> [&Protocol; 3] {
        [&self.src, &self.suc, &self.srsw]
    }

    fn protocols_mut(&mut self) -> [&mut Protocol; 3] {
        [&mut self.src, &mut self.suc, &mut self.srsw]
    }

    /// Queues an outbound message on the engine its selector names.
    pub fn send(&mut self, msg: Message, now: Instant, wall: u64) -> Vec<Action> {
        self.protocol_mut(msg.protocol_selector).send(msg, now, wall)
    }

    /// Routes an inbound message to the right engine operation.
    pub fn receive(&mut self, msg: Message, now: Instant, wall: u64) -> Vec<Action> {
        let engine = self.protocol_mut(msg.protocol_selector);
        if msg.is_ack() {
            engine.on_ack(&msg, now)
        } else if msg.is_syn() {
            engine.on_syn(&msg, wall)
        } else {
            engine.on_data(msg, now, wall)
        }
    }

    /// Fires every engine whose resend deadline has passed.
    pub fn on_timer(&mut self, now: Instant, wall: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        for engine in self.protocols_mut() {
            if engine.next_deadline().is_some_and(|d| d <= now) {
                actions.extend(engine.on_timer(now, wall));
            }
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.protocols()
            .into_iter()
            .filter_map(|engine| engine.next_deadline())
            .min()
    }

    pub fn change_phase(&mut self, new_round: bool) {
        trace!("phase change reaches channel to {}", self.peer_id);
        for engine in self.protocols_mut() {
            engine.change_phase(new_round);
        }
    }

    /// Asks the reliable channel to mark prior traffic stale for the peer.
    pub fn request_kill(&mut self) {
        self.src.request_kill();
    }

    pub fn stop(&mut self) {
        for engine in self.protocols_mut() {
            engine.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.protocols().into_iter().all(|engine| engine.is_stopped())
    }
}
