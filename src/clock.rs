//! Pairwise clock synchronisation.
//!
//! Every exchange interval the node issues a numbered challenge to each
//! known peer; the peer answers with its own send time and a gossip table of
//! offsets it has learned. Matching a response against the outstanding
//! challenge yields (remote time, local time) samples, and a linear fit over
//! the recent samples estimates the pairwise offset without pretending we
//! can re-rate the local clock. The weighted blend of all pairwise offsets
//! is the node's skew, which the scheduler adds to the wall clock before
//! computing the canonical phase.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::message::{Message, PayloadTree, ProtocolKind};
use crate::peers::{PeerId, PeerList};

/// Samples kept per peer for the offset fit.
const MAX_REGRESSION_ENTRIES: usize = 200;

/// Confidence decay per missed exchange round.
const SYNCHRONIZER_LAMBDA: f64 = 0.99999;

/// Trust discount applied to gossiped offsets.
const GOSSIP_WEIGHT_PENALTY: f64 = 0.1;

pub struct ClockSynchronizer {
    local_id: PeerId,
    exchange_interval: Duration,
    next_exchange: Option<Instant>,
    k_counter: u32,

    /// Outstanding challenge per peer: the round counter and the local
    /// microsecond time the challenge left.
    queries: HashMap<PeerId, (u32, u64)>,
    /// Recent (remote micros, local micros) sample pairs per peer.
    responses: HashMap<PeerId, VecDeque<(i64, i64)>>,

    offsets: HashMap<PeerId, f64>,
    skews: HashMap<PeerId, f64>,
    weights: HashMap<PeerId, (f64, u32)>,

    my_offset_micros: i64,
    my_skew: f64,
}

impl ClockSynchronizer {
    pub fn new(local_id: PeerId, exchange_interval: Duration) -> Self {
        let mut sync = Self {
            local_id: local_id.clone(),
            exchange_interval,
            next_exchange: None,
            k_counter: 0,
            queries: HashMap::new(),
            responses: HashMap::new(),
            offsets: HashMap::new(),
            skews: HashMap::new(),
            weights: HashMap::new(),
            my_offset_micros: 0,
            my_skew: 0.0,
        };
        sync.reset_self_entry();
        sync
    }

    /// Arms the first exchange round.
    pub fn start(&mut self, now: Instant) {
        self.next_exchange = Some(now + self.exchange_interval);
    }

    pub fn stop(&mut self) {
        self.next_exchange = None;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_exchange
    }

    /// The estimated offset of this node from the fleet, in microseconds.
    pub fn skew_micros(&self) -> i64 {
        self.my_offset_micros
    }

    /// The skew in whole milliseconds, as the scheduler consumes it.
    pub fn skew_millis(&self) -> i64 {
        self.my_offset_micros / 1_000
    }

    /// Exchange round: issues one challenge per peer, starting just past our
    /// own id so the fleet staggers its traffic, then refreshes the blended
    /// offset estimate. Returns the challenges to transmit.
    pub fn on_timer(
        &mut self,
        now: Instant,
        wall_micros: u64,
        peers: &PeerList,
    ) -> Vec<(PeerId, Message)> {
        if self.next_exchange.is_none() {
            return Vec::new();
        }
        self.next_exchange = Some(now + self.exchange_interval);

        let mut out = Vec::new();
        for record in peers.rotated_after(&self.local_id) {
            out.push((record.id.clone(), self.challenge_message(wall_micros)));
            self.queries
                .insert(record.id.clone(), (self.k_counter, wall_micros));
        }
        self.k_counter = self.k_counter.wrapping_add(1);

        self.reset_self_entry();
        self.recompute_blend();
        out
    }

    /// Answers a peer's challenge, echoing its round counter and gossiping
    /// our offset table.
    pub fn on_challenge(&self, msg: &Message) -> Option<Message> {
        let k: u32 = msg.submessages.get_parsed("clk.query").ok()?;
        let mut response = Message::new("clk.exchange_response", ProtocolKind::Suc);
        response.submessages.put("clk.response", k);
        for (peer, offset) in &self.offsets {
            let mut entry = PayloadTree::new();
            entry.put("uuid", peer.as_str());
            entry.put("offset_micros", *offset as i64);
            entry.put("skew", self.skews.get(peer).copied().unwrap_or(0.0));
            entry.put("weight", self.weight_of(peer));
            response.submessages.add_child("clk.table", "entry", entry);
        }
        Some(response)
    }

    /// Folds a challenge response into the per-peer offset fit.
    pub fn on_response(&mut self, msg: &Message, from: &PeerId, wall_micros: u64) {
        let k: u32 = match msg.submessages.get_parsed("clk.response") {
            Ok(k) => k,
            Err(_) => return,
        };
        let challenge = match self.queries.get(from) {
            Some((expected, challenge)) if *expected == k => *challenge,
            _ => {
                trace!("discarding unmatched clock response from {}", from);
                return;
            }
        };
        self.queries.remove(from);

        let remote = msg.send_timestamp as i64;
        let list = self.responses.entry(from.clone()).or_default();
        list.push_back((remote, challenge as i64));
        list.push_back((remote, wall_micros as i64));
        while list.len() > MAX_REGRESSION_ENTRIES * 2 {
            list.pop_front();
            list.pop_front();
        }

        let (offset, skew) = fit_offset(list, wall_micros as i64);
        debug!("clock offset to {}: {:.1} us", from, offset);
        self.offsets.insert(from.clone(), offset);
        self.skews.insert(from.clone(), skew);
        self.weights.insert(from.clone(), (1.0, self.k_counter));

        self.import_gossip(msg, from);
    }

    /// Adopts better-known offsets from the peer's gossip table, chained
    /// through the peer's own offset.
    fn import_gossip(&mut self, msg: &Message, from: &PeerId) {
        let through = match self.offsets.get(from) {
            Some(offset) => *offset,
            None => return,
        };
        let through_skew = self.skews.get(from).copied().unwrap_or(0.0);
        for (key, entry) in msg.submessages.children_of("clk.table") {
            if key != "entry" {
                continue;
            }
            let neighbor = match entry.get("uuid").map(PeerId::parse) {
                Some(Ok(id)) => id,
                _ => continue,
            };
            if neighbor == *from || neighbor == self.local_id {
                continue;
            }
            let offset: i64 = match entry.get_parsed("offset_micros") {
                Ok(value) => value,
                Err(_) => continue,
            };
            let weight: f64 = entry.get_parsed("weight").unwrap_or(0.0) - GOSSIP_WEIGHT_PENALTY;
            let skew: f64 = entry.get_parsed("skew").unwrap_or(0.0);
            if self.weight_of(&neighbor) < weight {
                self.offsets.insert(neighbor.clone(), through + offset as f64);
                self.skews.insert(neighbor.clone(), through_skew + skew);
                self.weights.insert(neighbor, (weight, self.k_counter));
            }
        }
    }

    fn challenge_message(&self, wall_micros: u64) -> Message {
        let mut msg = Message::new("clk.exchange", ProtocolKind::Suc);
        msg.submessages.put("clk.query", self.k_counter);
        msg.submessages.put("clk.adjusted", wall_micros as i64 + self.my_offset_micros);
        msg.submessages.put("clk.offset_micros", self.my_offset_micros);
        msg.submessages.put("clk.skew", self.my_skew);
        msg
    }

    /// The weighted mean over every pairwise offset becomes this node's
    /// blended offset from the fleet.
    fn recompute_blend(&mut self) {
        let mut weighted = 0.0;
        let mut total = 0.0;
        let mut weighted_skew = 0.0;
        for (peer, offset) in &self.offsets {
            let weight = self.weight_of(peer);
            weighted += weight * offset;
            total += weight;
            weighted_skew += weight * self.skews.get(peer).copied().unwrap_or(0.0);
        }
        if total != 0.0 {
            self.my_offset_micros = (weighted / total) as i64;
            self.my_skew = weighted_skew / total;
            debug!("adjusting clock skew to {} us", self.my_offset_micros);
        }
    }

    fn weight_of(&self, peer: &PeerId) -> f64 {
        if *peer == self.local_id {
            return 1.0;
        }
        match self.weights.get(peer) {
            Some((weight, last_k)) => {
                let age = self.k_counter.wrapping_sub(*last_k);
                weight * SYNCHRONIZER_LAMBDA.powi(age as i32)
            }
            None => 0.0,
        }
    }

    fn reset_self_entry(&mut self) {
        self.offsets.insert(self.local_id.clone(), 0.0);
        self.skews.insert(self.local_id.clone(), 0.0);
        self.weights.insert(self.local_id.clone(), (1.0, self.k_counter));
    }
}

/// Least-squares fit of local time against remote time over the sample
/// list, anchored at `base` so the intercept reads directly as the offset.
/// The alternating challenge/arrival pairs cancel the symmetric network lag.
fn fit_offset(samples: &VecDeque<(i64, i64)>, base: i64) -> (f64, f64) {
    let n = samples.len() as f64;
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_lag = 0.0;
    let mut even = false;
    for (x, y) in samples {
        sum_x += (x - base) as f64;
        sum_y += (y - base) as f64;
        if even {
            sum_lag += (y - base) as f64;
        } else {
            sum_lag -= (y - base) as f64;
        }
        even = !even;
    }
    let lag = sum_lag / n;
    let xbar = sum_x / n;
    let ybar = sum_y / n;

    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (x, y) in samples {
        let dx = (x - base) as f64 - xbar;
        let dy = (y - base) as f64 - ybar;
        covariance += dx * dy;
        variance += dx * dx;
    }
    let slope = if variance != 0.0 { covariance / variance } else { 1.0 };
    let mut alpha = ybar - slope * xbar;
    if alpha <= 0.0 {
        alpha += lag;
    } else {
        alpha -= lag;
    }
    (-alpha, slope - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::{PeerRecord, RemoteHost};

    fn peer(raw: &str) -> PeerId {
        PeerId::parse(raw).unwrap()
    }

    fn fleet(ids: &[&str]) -> PeerList {
        let mut list = PeerList::new();
        for raw in ids {
            let id = peer(raw);
            list.insert(PeerRecord::new(
                id.clone(),
                RemoteHost { hostname: id.host().to_string(), port: id.port() },
            ));
        }
        list
    }

    fn respond(
        sync: &mut ClockSynchronizer,
        from: &PeerId,
        k: u32,
        remote_micros: u64,
        local_micros: u64,
    ) {
        let mut response = Message::new("clk.exchange_response", ProtocolKind::Suc);
        response.submessages.put("clk.response", k);
        response.send_timestamp = remote_micros;
        sync.on_response(&response, from, local_micros);
    }

    #[test]
    fn challenges_cover_every_other_peer() {
        let mut sync = ClockSynchronizer::new(peer("b:1"), Duration::from_secs(10));
        sync.start(Instant::now());
        let peers = fleet(&["a:1", "b:1", "c:1", "d:1"]);
        let out = sync.on_timer(Instant::now(), 1_000_000, &peers);
        let targets: Vec<&str> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(targets, vec!["c:1", "d:1", "a:1"]);
        for (_, msg) in &out {
            assert_eq!(msg.handler_key, "clk.exchange");
            assert_eq!(msg.submessages.get("clk.query"), Some("0"));
        }
    }

    #[test]
    fn response_echoes_the_round_counter() {
        let mut sync = ClockSynchronizer::new(peer("b:1"), Duration::from_secs(10));
        let mut challenge = Message::new("clk.exchange", ProtocolKind::Suc);
        challenge.submessages.put("clk.query", 41u32);
        let response = sync.on_challenge(&challenge).unwrap();
        assert_eq!(response.handler_key, "clk.exchange_response");
        assert_eq!(response.submessages.get("clk.response"), Some("41"));
        // The gossip table always carries at least the self entry.
        assert!(!response.submessages.children_of("clk.table").is_empty());
    }

    #[test]
    fn malformed_challenge_is_ignored() {
        let mut sync = ClockSynchronizer::new(peer("b:1"), Duration::from_secs(10));
        let challenge = Message::new("clk.exchange", ProtocolKind::Suc);
        assert!(sync.on_challenge(&challenge).is_none());
    }

    #[test]
    fn offset_converges_toward_a_fast_peer() {
        let mut sync = ClockSynchronizer::new(peer("a:1"), Duration::from_secs(10));
        sync.start(Instant::now());
        let peers = fleet(&["a:1", "b:1"]);
        let remote = peer("b:1");

        // The remote clock runs 500 ms ahead; responses arrive instantly.
        let mut local = 1_000_000u64;
        for round in 0u32..8 {
            sync.on_timer(Instant::now(), local, &peers);
            respond(&mut sync, &remote, round, local + 500_000, local);
            local += 1_000_000;
        }
        sync.on_timer(Instant::now(), local, &peers);

        // Blended between self (0) and the peer (+500 ms), the estimate must
        // land strictly inside and lean toward the remote reading.
        let skew = sync.skew_micros();
        assert!(skew > 100_000, "skew {} too small", skew);
        assert!(skew < 500_000, "skew {} too large", skew);
    }

    #[test]
    fn unmatched_response_changes_nothing() {
        let mut sync = ClockSynchronizer::new(peer("a:1"), Duration::from_secs(10));
        sync.start(Instant::now());
        let remote = peer("b:1");
        respond(&mut sync, &remote, 9, 5_000_000, 1_000_000);
        assert_eq!(sync.skew_micros(), 0);
    }

    #[test]
    fn gossip_adopts_better_known_neighbours() {
        let mut sync = ClockSynchronizer::new(peer("a:1"), Duration::from_secs(10));
        sync.start(Instant::now());
        let peers = fleet(&["a:1", "b:1"]);
        sync.on_timer(Instant::now(), 1_000_000, &peers);

        let remote = peer("b:1");
        let mut response = Message::new("clk.exchange_response", ProtocolKind::Suc);
        response.submessages.put("clk.response", 0u32);
        response.send_timestamp = 1_000_000;
        let mut entry = PayloadTree::new();
        entry.put("uuid", "c:1");
        entry.put("offset_micros", 250_000i64);
        entry.put("skew", 0.0);
        entry.put("weight", 0.9);
        response.submessages.add_child("clk.table", "entry", entry);
        sync.on_response(&response, &remote, 1_000_000);

        // The gossiped node is now part of the blend with a reduced weight.
        assert!(sync.weight_of(&peer("c:1")) > 0.7);
    }

    #[test]
    fn exchange_rearms_its_deadline() {
        let mut sync = ClockSynchronizer::new(peer("a:1"), Duration::from_secs(10));
        let now = Instant::now();
        sync.start(now);
        assert_eq!(sync.next_deadline(), Some(now + Duration::from_secs(10)));
        let later = now + Duration::from_secs(10);
        sync.on_timer(later, 1_000_000, &fleet(&["a:1"]));
        assert_eq!(sync.next_deadline(), Some(later + Duration::from_secs(10)));
        sync.stop();
        assert!(sync.next_deadline().is_none());
    }
}
