//! The message envelope and its wire codec.
//!
//! One encoded message travels per UDP datagram. The envelope carries the
//! routing and sequencing header; the application payload is a [`PayloadTree`]
//! of nested key/value groups. Unknown fields in a received datagram are
//! ignored so that mixed-version fleets keep interoperating.

mod error;
mod tree;

pub use error::MessageError;
pub use tree::PayloadTree;

use serde::{Deserialize, Serialize};

use crate::peers::PeerId;
use crate::sequence::SEQUENCE_MODULO;

/// Upper bound on one encoded message; everything must fit one datagram.
pub const MAX_DATAGRAM_BYTES: usize = 60_000;

/// Which delivery protocol a message travels on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// Sequenced reliable with resend and resync.
    #[serde(rename = "SRC")]
    Src,
    /// Best-effort, fire and forget.
    #[serde(rename = "SUC")]
    Suc,
    /// Sequenced reliable bounded by the scheduler phase.
    #[serde(rename = "SRSW")]
    Srsw,
}

impl ProtocolKind {
    /// The lowercase prefix used in control handler keys (`src.ack` etc).
    pub fn prefix(self) -> &'static str {
        match self {
            ProtocolKind::Src => "src",
            ProtocolKind::Suc => "suc",
            ProtocolKind::Srsw => "srsw",
        }
    }

    /// The handler key of this protocol's acknowledgements.
    pub fn ack_key(self) -> String {
        format!("{}.ack", self.prefix())
    }

    /// The handler key of this protocol's synchronisation messages.
    pub fn syn_key(self) -> String {
        format!("{}.syn", self.prefix())
    }
}

/// The envelope plus payload that modules exchange.
///
/// Sequencing fields (`sequence_no`, `resync_epoch`, `send_timestamp`) are
/// stamped by the transport on the way out; modules only choose the handler
/// key, the protocol, and the payload. The source id is likewise forged by
/// the transport so a module cannot impersonate another node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub source_peer_id: Option<PeerId>,
    #[serde(default)]
    pub destination_peer_id: Option<PeerId>,
    pub handler_key: String,
    pub protocol_selector: ProtocolKind,
    #[serde(default)]
    pub sequence_no: u16,
    /// Microsecond wall-clock of the SYN that opened the current outbound
    /// session; monotonically non-decreasing per channel.
    #[serde(default)]
    pub resync_epoch: u64,
    /// Microsecond wall-clock at transmit time.
    #[serde(default)]
    pub send_timestamp: u64,
    /// Optional wall-clock deadline; the transport stops retrying and the
    /// receiver drops the message once this passes.
    #[serde(default)]
    pub expire_timestamp: Option<u64>,
    /// One-shot session-restart marker; see the reliable protocol.
    #[serde(default)]
    pub kill_hash: Option<u64>,
    #[serde(default)]
    pub submessages: PayloadTree,
}

impl Message {
    /// A new application message for `handler_key`, travelling on `protocol`.
    pub fn new(handler_key: impl Into<String>, protocol: ProtocolKind) -> Self {
        Self {
            source_peer_id: None,
            destination_peer_id: None,
            handler_key: handler_key.into(),
            protocol_selector: protocol,
            sequence_no: 0,
            resync_epoch: 0,
            send_timestamp: 0,
            expire_timestamp: None,
            kill_hash: None,
            submessages: PayloadTree::new(),
        }
    }

    /// The module component of the handler key (`"sc"` in `"sc.marker"`).
    pub fn module(&self) -> &str {
        self.handler_key
            .split_once('.')
            .map(|(module, _)| module)
            .unwrap_or(&self.handler_key)
    }

    /// The kind component of the handler key (`"marker"` in `"sc.marker"`).
    pub fn kind(&self) -> &str {
        self.handler_key
            .split_once('.')
            .map(|(_, kind)| kind)
            .unwrap_or("")
    }

    /// Whether this is an acknowledgement for its protocol.
    pub fn is_ack(&self) -> bool {
        self.handler_key == self.protocol_selector.ack_key()
    }

    /// Whether this is a synchronisation message for its protocol.
    pub fn is_syn(&self) -> bool {
        self.handler_key == self.protocol_selector.syn_key()
    }

    /// Whether the expiration deadline has passed at `wall_micros`.
    pub fn is_expired(&self, wall_micros: u64) -> bool {
        match self.expire_timestamp {
            Some(deadline) => wall_micros >= deadline,
            None => false,
        }
    }

    /// Encodes into a single-datagram byte buffer.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| MessageError::Encode { detail: e.to_string() })?;
        if bytes.len() > MAX_DATAGRAM_BYTES {
            return Err(MessageError::TooLarge {
                bytes: bytes.len(),
                limit: MAX_DATAGRAM_BYTES,
            });
        }
        Ok(bytes)
    }

    /// Decodes a datagram, validating the header ranges. An unrecognised
    /// protocol selector is reported as such, distinct from malformed data.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| MessageError::Decode { detail: e.to_string() })?;
        if let Some(selector) = value.get("protocol_selector").and_then(|v| v.as_str()) {
            if !matches!(selector, "SRC" | "SUC" | "SRSW") {
                return Err(MessageError::UnknownProtocol {
                    selector: selector.to_string(),
                });
            }
        }
        let message: Message = serde_json::from_value(value)
            .map_err(|e| MessageError::Decode { detail: e.to_string() })?;
        if message.sequence_no >= SEQUENCE_MODULO {
            return Err(MessageError::SequenceOutOfRange {
                sequence: message.sequence_no,
            });
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut msg = Message::new("sc.marker", ProtocolKind::Src);
        msg.submessages.put("sc.marker.snapshot", "12");
        msg.sequence_no = 17;
        msg.resync_epoch = 1_700_000_000_000_000;
        msg
    }

    #[test]
    fn handler_key_splits() {
        let msg = sample();
        assert_eq!(msg.module(), "sc");
        assert_eq!(msg.kind(), "marker");
    }

    #[test]
    fn control_keys() {
        assert_eq!(ProtocolKind::Src.ack_key(), "src.ack");
        assert_eq!(ProtocolKind::Srsw.syn_key(), "srsw.syn");
        let mut ack = Message::new("src.ack", ProtocolKind::Src);
        assert!(ack.is_ack());
        ack.handler_key = "src.syn".to_string();
        assert!(ack.is_syn());
    }

    #[test]
    fn round_trip() {
        let msg = sample();
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn decode_rejects_out_of_ring_sequence() {
        let mut msg = sample();
        msg.sequence_no = SEQUENCE_MODULO;
        let bytes = serde_json::to_vec(&msg).unwrap();
        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::SequenceOutOfRange { sequence }) if sequence == SEQUENCE_MODULO
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Message::decode(b"not a datagram"),
            Err(MessageError::Decode { .. })
        ));
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let raw = br#"{
            "handler_key": "gm.invite",
            "protocol_selector": "SRC",
            "sequence_no": 3,
            "frobnication_level": 9
        }"#;
        let msg = Message::decode(raw).unwrap();
        assert_eq!(msg.handler_key, "gm.invite");
        assert_eq!(msg.sequence_no, 3);
    }

    #[test]
    fn decode_rejects_unknown_selector() {
        let raw = br#"{"handler_key": "gm.invite", "protocol_selector": "TCP"}"#;
        assert!(matches!(
            Message::decode(raw),
            Err(MessageError::UnknownProtocol { selector }) if selector == "TCP"
        ));
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let mut msg = sample();
        assert!(!msg.is_expired(u64::MAX));
        msg.expire_timestamp = Some(1_000);
        assert!(!msg.is_expired(999));
        assert!(msg.is_expired(1_000));
    }

    #[test]
    fn oversized_message_is_refused() {
        let mut msg = sample();
        let big = "x".repeat(MAX_DATAGRAM_BYTES);
        msg.submessages.put("lb.blob", big);
        assert!(matches!(
            msg.encode(),
            Err(MessageError::TooLarge { .. })
        ));
    }
}
