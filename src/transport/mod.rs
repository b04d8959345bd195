//! Datagram transport: the shared socket and the per-peer delivery
//! protocols that run on top of it.

pub mod endpoint;
pub mod error;
pub mod protocol;

pub use endpoint::{Endpoint, SendOutcome, FULLY_RELIABLE};
pub use error::TransportError;
pub use protocol::{Action, Protocol, ProtocolConfig, SrcEngine, SrswEngine, SucEngine};
