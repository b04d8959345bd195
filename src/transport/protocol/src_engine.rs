//! The sequenced reliable protocol.
//!
//! Delivers each distinct message at most once, in order within one resync
//! epoch. DATA, ACK, and SYN share the wire. The unacknowledged window is
//! rewritten in full on every resend interval; acknowledgements are
//! cumulative. A SYN opens a fresh epoch, numbered by the microsecond wall
//! clock so concurrent resyncs can be tie-broken by time and then by peer id.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::message::{Message, ProtocolKind};
use crate::peers::PeerId;
use crate::sequence::{classify, ring_distance, ring_next, ring_prev, RingPosition, SEQUENCE_HALF};

use super::{Action, ProtocolConfig};

struct WindowEntry {
    msg: Message,
    is_syn: bool,
}

pub struct SrcEngine {
    local_id: PeerId,
    peer_id: PeerId,
    resend_interval: Duration,
    default_timeout: Duration,

    out_seq: u16,
    in_seq: u16,
    out_sync: bool,
    in_sync: bool,
    out_epoch: u64,
    in_epoch: u64,
    /// Send time of the most recently accepted inbound SYN.
    in_epoch_time: u64,
    /// Send time of our most recent outbound SYN.
    out_epoch_time: u64,

    window: VecDeque<WindowEntry>,
    current_ack: Option<Message>,

    kill_counter: u64,
    send_kill: Option<u64>,
    last_kill_seen: Option<u64>,

    resend_deadline: Option<Instant>,
    stopped: bool,
}

impl SrcEngine {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            local_id: config.local_id.clone(),
            peer_id: config.peer_id.clone(),
            resend_interval: config.resend_interval,
            default_timeout: config.default_timeout,
            out_seq: 0,
            in_seq: 0,
            out_sync: false,
            in_sync: false,
            out_epoch: 0,
            in_epoch: 0,
            in_epoch_time: 0,
            out_epoch_time: 0,
            window: VecDeque::new(),
            current_ack: None,
            kill_counter: 0,
            send_kill: None,
            last_kill_seen: None,
            resend_deadline: None,
            stopped: false,
        }
    }

    /// Stamps and queues an outbound message. The message is written once
    /// immediately when the channel is synchronised; while a SYN is still
    /// outstanding only the SYN reaches the wire.
    pub fn send(&mut self, mut msg: Message, now: Instant, wall: u64) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }
        let mut actions = Vec::new();

        if !self.out_sync && !self.syn_outstanding() {
            actions.push(self.make_syn(wall));
        }

        msg.protocol_selector = ProtocolKind::Src;
        msg.source_peer_id = Some(self.local_id.clone());
        msg.destination_peer_id = Some(self.peer_id.clone());
        msg.sequence_no = self.out_seq;
        msg.resync_epoch = self.out_epoch;
        msg.send_timestamp = wall;
        if msg.expire_timestamp.is_none() {
            msg.expire_timestamp = Some(wall + self.default_timeout.as_micros() as u64);
        }
        self.out_seq = ring_next(self.out_seq);

        self.window.push_back(WindowEntry { msg, is_syn: false });
        if self.out_sync {
            self.attach_kill();
            let back = self.window.back().map(|entry| entry.msg.clone());
            if let Some(msg) = back {
                actions.push(Action::Write(msg));
            }
        }
        self.arm_timer(now);
        actions
    }

    /// Resend timer fired: flush expired heads, then rewrite the whole
    /// window (or just the SYN while unsynchronised) and re-arm.
    pub fn on_timer(&mut self, now: Instant, wall: u64) -> Vec<Action> {
        self.resend_deadline = None;
        if self.stopped {
            return Vec::new();
        }

        while let Some(head) = self.window.front() {
            if head.is_syn || !head.msg.is_expired(wall) {
                break;
            }
            debug!(
                "message to {} expired before delivery (seq {})",
                self.peer_id,
                head.msg.sequence_no
            );
            self.window.pop_front();
            self.kill_counter += 1;
            self.send_kill = Some(self.kill_counter);
        }

        if self.window.is_empty() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if !self.out_sync {
            if let Some(syn) = self.window.iter().find(|entry| entry.is_syn) {
                actions.push(Action::Write(syn.msg.clone()));
            }
        } else {
            self.attach_kill();
            for entry in &self.window {
                actions.push(Action::Write(entry.msg.clone()));
            }
        }
        self.arm_timer(now);
        actions
    }

    /// Cumulative acknowledgement: pops every window entry up to and
    /// including `sequence_no`. Acknowledging the outstanding SYN marks the
    /// outbound side synchronised. Replayed ACKs older than the window head
    /// change nothing.
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
        while let Some(head) = self.window.front() {
            if ring_distance(head.msg.sequence_no, ack.sequence_no) > SEQUENCE_HALF {
                break;
            }
            let entry = match self.window.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            if entry.is_syn {
                self.out_sync = true;
            }
        }
        if self.window.is_empty() {
            self.resend_deadline = None;
        }
        Vec::new()
    }

    /// Inbound synchronisation: accept when unsynchronised, when the SYN is
    /// newer than the one that opened the current epoch, or on the exact
    /// duplicate (to recover a lost SYN-ACK). Equal times from a concurrent
    /// resync are broken in favour of the lexicographically larger peer.
    pub fn on_syn(&mut self, syn: &Message, wall: u64) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }
        if self.in_sync && syn.resync_epoch == self.in_epoch {
            // Duplicate of the SYN we already accepted; its ACK was lost.
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
        self.last_kill_seen = None;
        vec![self.make_ack(syn, wall)]
    }

    /// Inbound data. Exact matches advance the window and are delivered;
    /// duplicates are re-acknowledged; gaps are dropped for the sender to
    /// retransmit. A changed kill hash forcibly desynchronises both
    /// directions and opens a fresh outbound epoch.
    pub fn on_data(&mut self, msg: Message, now: Instant, wall: u64) -> Vec<Action> {
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
        if let Some(kill) = msg.kill_hash {
            if self.last_kill_seen != Some(kill) {
                warn!("kill marker from {}; restarting session", self.peer_id);
                self.last_kill_seen = Some(kill);
                self.in_sync = false;
                self.out_sync = false;
                let syn = self.make_syn(wall);
                self.arm_timer(now);
                return vec![syn];
            }
        }
        match classify(self.in_seq, msg.sequence_no) {
            RingPosition::Expected => {
                self.in_seq = ring_next(self.in_seq);
                let ack = self.make_ack(&msg, wall);
                if msg.is_expired(wall) {
                    debug!(
                        "accepted but not delivering expired message {} from {}",
                        msg.handler_key, self.peer_id
                    );
                    vec![ack]
                } else {
                    vec![ack, Action::Deliver(msg)]
                }
            }
            RingPosition::Backward => {
                let ack = match &self.current_ack {
                    Some(prev) if prev.sequence_no == msg.sequence_no => {
                        Action::Write(prev.clone())
                    }
                    _ => self.make_ack(&msg, wall),
                };
                vec![ack]
            }
            RingPosition::Forward => {
                trace!(
                    "dropping out-of-order message from {} (seq {}, expecting {})",
                    self.peer_id,
                    msg.sequence_no,
                    self.in_seq
                );
                Vec::new()
            }
        }
    }

    /// Marks the next outbound DATA with a fresh kill hash, telling the
    /// receiver to treat everything before it as stale.
    pub fn request_kill(&mut self) {
        self.kill_counter += 1;
        self.send_kill = Some(self.kill_counter);
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.window.clear();
        self.resend_deadline = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.resend_deadline
    }

    pub fn is_in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn is_out_sync(&self) -> bool {
        self.out_sync
    }

    pub fn in_seq(&self) -> u16 {
        self.in_seq
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    fn syn_outstanding(&self) -> bool {
        self.window.iter().any(|entry| entry.is_syn)
    }

    /// Opens a new outbound epoch: stamps a SYN numbered just before the
    /// window head, restamps queued messages onto the new epoch, and queues
    /// the SYN at the front.
    fn make_syn(&mut self, wall: u64) -> Action {
        self.out_epoch = self.out_epoch.max(wall).max(self.out_epoch + 1);
        self.out_epoch_time = wall;
        let anchor = match self.window.front() {
            Some(head) => ring_prev(head.msg.sequence_no),
            None => ring_prev(self.out_seq),
        };
        for entry in &mut self.window {
            entry.msg.resync_epoch = self.out_epoch;
        }
        let mut syn = Message::new(ProtocolKind::Src.syn_key(), ProtocolKind::Src);
        syn.source_peer_id = Some(self.local_id.clone());
        syn.destination_peer_id = Some(self.peer_id.clone());
        syn.sequence_no = anchor;
        syn.resync_epoch = self.out_epoch;
        syn.send_timestamp = wall;
        self.window.push_front(WindowEntry { msg: syn.clone(), is_syn: true });
        Action::Write(syn)
    }

    fn make_ack(&mut self, acked: &Message, wall: u64) -> Action {
        let mut ack = Message::new(ProtocolKind::Src.ack_key(), ProtocolKind::Src);
        ack.source_peer_id = Some(self.local_id.clone());
        ack.destination_peer_id = Some(self.peer_id.clone());
        ack.sequence_no = acked.sequence_no;
        ack.resync_epoch = self.in_epoch;
        ack.send_timestamp = wall;
        ack.expire_timestamp = acked.expire_timestamp;
        self.current_ack = Some(ack.clone());
        Action::Write(ack)
    }

    fn attach_kill(&mut self) {
        if let Some(kill) = self.send_kill.take() {
            match self.window.iter_mut().find(|entry| !entry.is_syn) {
                Some(entry) => entry.msg.kill_hash = Some(kill),
                None => self.send_kill = Some(kill),
            }
        }
    }

    fn arm_timer(&mut self, now: Instant) {
        if self.resend_deadline.is_none() {
            self.resend_deadline = Some(now + self.resend_interval);
        }
    }
}
