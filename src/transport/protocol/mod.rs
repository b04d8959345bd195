//! Per-peer delivery protocols.
//!
//! Each peer channel runs one engine per protocol selector. Engines are pure
//! state machines: they never touch the socket. Every operation takes the
//! current time explicitly and returns the [`Action`]s the caller must
//! perform, which keeps the delivery rules deterministic and testable
//! without a network.

mod src_engine;
mod srsw_engine;
mod suc_engine;

pub use src_engine::SrcEngine;
pub use srsw_engine::SrswEngine;
pub use suc_engine::SucEngine;

use std::time::{Duration, Instant};

use crate::message::{Message, ProtocolKind};
use crate::peers::PeerId;

/// What an engine wants done with a message.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Encode and transmit to the peer.
    Write(Message),
    /// Hand to the dispatcher as accepted inbound traffic.
    Deliver(Message),
}

/// Parameters shared by the engines of one peer channel.
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    pub local_id: PeerId,
    pub peer_id: PeerId,
    /// Interval between retransmissions of the unacknowledged window.
    pub resend_interval: Duration,
    /// Default lifetime stamped on reliable messages without an expiration.
    pub default_timeout: Duration,
}

/// A delivery protocol engine, keyed by its wire selector.
pub enum Protocol {
    Src(SrcEngine),
    Suc(SucEngine),
    Srsw(SrswEngine),
}

impl Protocol {
    pub fn new(kind: ProtocolKind, config: &ProtocolConfig) -> Self {
        match kind {
            ProtocolKind::Src => Protocol::Src(SrcEngine::new(config)),
            ProtocolKind::Suc => Protocol::Suc(SucEngine::new(config)),
            ProtocolKind::Srsw => Protocol::Srsw(SrswEngine::new(config)),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::Src(_) => ProtocolKind::Src,
            Protocol::Suc(_) => ProtocolKind::Suc,
            Protocol::Srsw(_) => ProtocolKind::Srsw,
        }
    }

    /// Queues an outbound message, stamping its header fields.
    pub fn send(&mut self, msg: Message, now: Instant, wall: u64) -> Vec<Action> {
        match self {
            Protocol::Src(engine) => engine.send(msg, now, wall),
            Protocol::Suc(engine) => engine.send(msg, wall),
            Protocol::Srsw(engine) => engine.send(msg, now, wall),
        }
    }

    /// Processes inbound application data.
    pub fn on_data(&mut self, msg: Message, now: Instant, wall: u64) -> Vec<Action> {
        match self {
            Protocol::Src(engine) => engine.on_data(msg, now, wall),
            Protocol::Suc(engine) => engine.on_data(msg, wall),
            Protocol::Srsw(engine) => engine.on_data(msg, wall),
        }
    }

    /// Processes an inbound acknowledgement.
    pub fn on_ack(&mut self, msg: &Message, now: Instant) -> Vec<Action> {
        match self {
            Protocol::Src(engine) => engine.on_ack(msg, now),
            Protocol::Suc(engine) => engine.on_ack(msg),
            Protocol::Srsw(engine) => engine.on_ack(msg, now),
        }
    }

    /// Processes an inbound synchronisation message.
    pub fn on_syn(&mut self, msg: &Message, wall: u64) -> Vec<Action> {
        match self {
            Protocol::Src(engine) => engine.on_syn(msg, wall),
            Protocol::Suc(engine) => engine.on_syn(msg),
            Protocol::Srsw(engine) => engine.on_syn(msg, wall),
        }
    }

    /// Fires the resend timer if it is due.
    pub fn on_timer(&mut self, now: Instant, wall: u64) -> Vec<Action> {
        match self {
            Protocol::Src(engine) => engine.on_timer(now, wall),
            Protocol::Suc(_) => Vec::new(),
            Protocol::Srsw(engine) => engine.on_timer(now),
        }
    }

    /// When the engine next needs `on_timer` called, if ever.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            Protocol::Src(engine) => engine.next_deadline(),
            Protocol::Suc(_) => None,
            Protocol::Srsw(engine) => engine.next_deadline(),
        }
    }

    /// Scheduler phase changed; `new_round` marks a full rotation.
    pub fn change_phase(&mut self, new_round: bool) {
        match self {
            Protocol::Src(_) | Protocol::Suc(_) => {}
            Protocol::Srsw(engine) => engine.change_phase(new_round),
        }
    }

    /// Asks the outbound side to mark prior traffic stale for the receiver.
    pub fn request_kill(&mut self) {
        if let Protocol::Src(engine) = self {
            engine.request_kill();
        }
    }

    /// Halts the engine, dropping any queued traffic.
    pub fn stop(&mut self) {
        match self {
            Protocol::Src(engine) => engine.stop(),
            Protocol::Suc(engine) => engine.stop(),
            Protocol::Srsw(engine) => engine.stop(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        match self {
            Protocol::Src(engine) => engine.is_stopped(),
            Protocol::Suc(engine) => engine.is_stopped(),
            Protocol::Srsw(engine) => engine.is_stopped(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ProtocolConfig {
    ProtocolConfig {
        local_id: PeerId::parse("local:1870").unwrap(),
        peer_id: PeerId::parse("remote:1870").unwrap(),
        resend_interval: Duration::from_millis(10),
        default_timeout: Duration::from_millis(2_000),
    }
}
