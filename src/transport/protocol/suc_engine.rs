//! The best-effort protocol: same framing as the reliable variants, but one
//! write per message and no delivery state. Sequence numbers are stamped so
//! receivers can observe ordering if they care; nothing is retransmitted.

use log::trace;

use crate::message::{Message, ProtocolKind};
use crate::peers::PeerId;
use crate::sequence::ring_next;

use super::{Action, ProtocolConfig};

pub struct SucEngine {
    local_id: PeerId,
    peer_id: PeerId,
    out_seq: u16,
    stopped: bool,
}

impl SucEngine {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            local_id: config.local_id.clone(),
            peer_id: config.peer_id.clone(),
            out_seq: 0,
            stopped: false,
        }
    }

    pub fn send(&mut self, mut msg: Message, wall: u64) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }
        msg.protocol_selector = ProtocolKind::Suc;
        msg.source_peer_id = Some(self.local_id.clone());
        msg.destination_peer_id = Some(self.peer_id.clone());
        msg.sequence_no = self.out_seq;
        msg.send_timestamp = wall;
        self.out_seq = ring_next(self.out_seq);
        vec![Action::Write(msg)]
    }

    pub fn on_data(&mut self, msg: Message, wall: u64) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }
        if msg.is_expired(wall) {
            trace!("dropping expired best-effort message from {}", self.peer_id);
            return Vec::new();
        }
        vec![Action::Deliver(msg)]
    }

    pub fn on_ack(&mut self, _msg: &Message) -> Vec<Action> {
        trace!("best-effort channel from {} ignoring ack", self.peer_id);
        Vec::new()
    }

    pub fn on_syn(&mut self, _msg: &Message) -> Vec<Action> {
        trace!("best-effort channel from {} ignoring syn", self.peer_id);
        Vec::new()
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
