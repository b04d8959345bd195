//! The sequenced reliable sliding-window protocol, bounded by the scheduler
//! phase. Up to `OUTSTANDING_WINDOW` messages ride the wire at once; the
//! rest wait in an overflow queue and are promoted as acknowledgements come
//! back. A phase change abandons everything in flight and resets the
//! sequence, so traffic never leaks across a phase boundary.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::message::{Message, ProtocolKind};
use crate::peers::PeerId;
use crate::sequence::{classify, ring_distance, ring_next, ring_prev, RingPosition, SEQUENCE_HALF};

use super::{Action, ProtocolConfig};

/// Messages allowed on the wire at once.
pub const OUTSTANDING_WINDOW: usize = 8;

struct WindowEntry {
    msg: Message,
    is_syn: bool,
}

pub struct SrswEngine {
    local_id: PeerId,
    peer_id: PeerId,
    resend_interval: Duration,

    out_seq: u16,
    in_seq: u16,
    out_sync: bool,
    in_sync: bool,
    out_epoch: u64,
    in_epoch: u64,
    in_epoch_time: u64,

    outstanding: VecDeque<WindowEntry>,
    overflow: VecDeque<Message>,

    resend_deadline: Option<Instant>,
    stopped: bool,
}

impl SrswEngine {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            local_id: config.local_id.clone(),
            peer_id: config.peer_id.clone(),
            resend_interval: config.resend_interval,
            out_seq: 0,
            in_seq: 0,
            out_sync: false,
            in_sync: false,
            out_epoch: 0,
            in_epoch: 0,
            in_epoch_time: 0,
            outstanding: VecDeque::new(),
            overflow: VecDeque::new(),
            resend_deadline: None,
            stopped: false,
        }
    }

    pub fn send(&mut self, mut msg: Message, now: Instant, wall: u64) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }
        let mut actions = Vec::new();

        if !self.out_sync && !self.syn_outstanding() {
            actions.push(self.make_syn(wall));
        }

        msg.protocol_selector = ProtocolKind::Srsw;
        msg.source_peer_id = Some(self.local_id.clone());
        msg.destination_peer_id = Some(self.peer_id.clone());
        msg.sequence_no = self.out_seq;
        msg.resync_epoch = self.out_epoch;
        msg.send_timestamp = wall;
        self.out_seq = ring_next(self.out_seq);

        if self.outstanding.len() < OUTSTANDING_WINDOW {
            if self.out_sync {
                actions.push(Action::Write(msg.clone()));
            }
            self.outstanding.push_back(WindowEntry { msg, is_syn: false });
        } else {
            self.overflow.push_back(msg);
        }
        self.arm_timer(now);
        actions
    }

    pub fn on_timer(&mut self, now: Instant) -> Vec<Action> {
        self.resend_deadline = None;
        if self.stopped || self.outstanding.is_empty() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if !self.out_sync {
            if let Some(syn) = self.outstanding.iter().find(|entry| entry.is_syn) {
                actions.push(Action::Write(syn.msg.clone()));
            }
        } else {
            for entry in &self.outstanding {
                actions.push(Action::Write(entry.msg.clone()));
            }
        }
        self.arm_timer(now);
        actions
    }

    /// Cumulative acknowledgement over the outstanding window; each popped
    /// slot is refilled from the overflow queue, which writes the promoted
    /// message for the first time.
    pub fn on_ack(&mut self, ack: &Message, _now: Instant) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }
        if ack.resync_epoch != self.out_epoch {
            trace!(
                "ignoring ack from stale epoch {} (current {})",
                ack.resync_epoch,
                self.out_epoch
            );
            return Vec::new();
        }
        let mut actions = Vec::new();
        while let Some(head) = self.outstanding.front() {
            if ring_distance(head.msg.sequence_no, ack.sequence_no) > SEQUENCE_HALF {
                break;
            }
            let entry = match self.outstanding.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            if entry.is_syn {
                self.out_sync = true;
            }
            if let Some(promoted) = self.overflow.pop_front() {
                actions.push(Action::Write(promoted.clone()));
                self.outstanding.push_back(WindowEntry { msg: promoted, is_syn: false });
            }
        }
        if self.outstanding.is_empty() {
            self.resend_deadline = None;
        }
        actions
    }

    pub fn on_syn(&mut self, syn: &Message, wall: u64) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }
        if self.in_sync && syn.resync_epoch == self.in_epoch {
            return vec![self.make_ack(syn, wall)];
        }
        let accept = !self.in_sync
            || syn.send_timestamp > self.in_epoch_time
            || (syn.send_timestamp == self.in_epoch_time
                && self.peer_id.as_str() > self.local_id.as_str());
        if !accept {
            debug!(
                "rejecting stale syn from {} (time {} <= {})",
                self.peer_id, syn.send_timestamp, self.in_epoch_time
            );
            return Vec::new();
        }
        self.in_seq = ring_next(syn.sequence_no);
        self.in_epoch = syn.resync_epoch;
        self.in_epoch_time = syn.send_timestamp;
        self.in_sync = true;
        vec![self.make_ack(syn, wall)]
    }

    pub fn on_data(&mut self, msg: Message, wall: u64) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }
        if !self.in_sync {
            trace!("dropping data from {} while unsynchronised", self.peer_id);
            return Vec::new();
        }
        if msg.resync_epoch != self.in_epoch {
            debug!(
                "dropping data from {} with epoch {} (current {})",
                self.peer_id, msg.resync_epoch, self.in_epoch
            );
            return Vec::new();
        }
        match classify(self.in_seq, msg.sequence_no) {
            RingPosition::Expected => {
                self.in_seq = ring_next(self.in_seq);
                let ack = self.make_ack(&msg, wall);
                vec![ack, Action::Deliver(msg)]
            }
            RingPosition::Backward => vec![self.make_ack(&msg, wall)],
            RingPosition::Forward => Vec::new(),
        }
    }

    /// Phase boundary: abandon in-flight and queued traffic, reset the
    /// sequence, and leave the outbound side to SYN afresh next phase.
    pub fn change_phase(&mut self, _new_round: bool) {
        self.outstanding.clear();
        self.overflow.clear();
        self.out_sync = false;
        self.out_seq = 0;
        self.resend_deadline = None;
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.outstanding.clear();
        self.overflow.clear();
        self.resend_deadline = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.resend_deadline
    }

    pub fn is_out_sync(&self) -> bool {
        self.out_sync
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    fn syn_outstanding(&self) -> bool {
        self.outstanding.iter().any(|entry| entry.is_syn)
    }

    fn make_syn(&mut self, wall: u64) -> Action {
        self.out_epoch = self.out_epoch.max(wall).max(self.out_epoch + 1);
        let anchor = match self.outstanding.front() {
            Some(head) => ring_prev(head.msg.sequence_no),
            None => ring_prev(self.out_seq),
        };
        for entry in &mut self.outstanding {
            entry.msg.resync_epoch = self.out_epoch;
        }
        let mut syn = Message::new(ProtocolKind::Srsw.syn_key(), ProtocolKind::Srsw);
        syn.source_peer_id = Some(self.local_id.clone());
        syn.destination_peer_id = Some(self.peer_id.clone());
        syn.sequence_no = anchor;
        syn.resync_epoch = self.out_epoch;
        syn.send_timestamp = wall;
        self.outstanding.push_front(WindowEntry { msg: syn.clone(), is_syn: true });
        Action::Write(syn)
    }

    fn make_ack(&mut self, acked: &Message, wall: u64) -> Action {
        let mut ack = Message::new(ProtocolKind::Srsw.ack_key(), ProtocolKind::Srsw);
        ack.source_peer_id = Some(self.local_id.clone());
        ack.destination_peer_id = Some(self.peer_id.clone());
        ack.sequence_no = acked.sequence_no;
        ack.resync_epoch = self.in_epoch;
        ack.send_timestamp = wall;
        Action::Write(ack)
    }

    fn arm_timer(&mut self, now: Instant) {
        if self.resend_deadline.is_none() {
            self.resend_deadline = Some(now + self.resend_interval);
        }
    }
}
