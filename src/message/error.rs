use thiserror::Error;

/// Errors that can occur while building, encoding, or decoding messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// The encoded message would not fit in a single datagram.
    #[error("encoded message is {bytes} bytes, exceeding the {limit}-byte datagram limit")]
    TooLarge { bytes: usize, limit: usize },

    /// The datagram could not be decoded into a message.
    #[error("failed to decode datagram: {detail}")]
    Decode { detail: String },

    /// The message could not be encoded.
    #[error("failed to encode message: {detail}")]
    Encode { detail: String },

    /// A sequence number outside the `[0, 1024)` ring was received.
    #[error("sequence number {sequence} is outside the sequence ring")]
    SequenceOutOfRange { sequence: u16 },

    /// An unknown protocol selector was received.
    #[error("unknown protocol selector {selector:?}")]
    UnknownProtocol { selector: String },

    /// A payload field expected by the reader was missing.
    #[error("payload field {path:?} is missing")]
    MissingField { path: String },

    /// A payload field was present but failed to parse.
    #[error("payload field {path:?} has unparseable value {value:?}")]
    BadField { path: String, value: String },
}
