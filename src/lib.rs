//! # grid-broker
//! Peer-to-peer coordination substrate for distributed grid control agents.
//!
//! One broker runs per node. It owns the node's single datagram socket,
//! provides reliable sequenced delivery over lossy unicast, time-slices a
//! cooperative scheduler across registered modules, and routes inbound
//! messages to module handlers. The application algorithms (group
//! management, state collection, load balancing) run on top of this
//! substrate as registered modules.

#![deny(trivial_numeric_casts, unused_import_braces)]

mod broker;
mod clock;
mod config;
mod connection;
mod dispatch;
mod message;
mod peers;
mod scheduler;
mod sequence;
mod transport;
mod wallclock;

pub use broker::{Broker, BrokerError, BrokerHandle};
pub use clock::ClockSynchronizer;
pub use config::{Config, ConfigError, Timings};
pub use connection::{Connection, ConnectionTable, SendDisposition};
pub use dispatch::{
    Dispatched, Dispatcher, Handler, PreHandleOutcome, PreHandler, ANY_KIND,
};
pub use message::{
    Message, MessageError, PayloadTree, ProtocolKind, MAX_DATAGRAM_BYTES,
};
pub use peers::{PeerId, PeerIdError, PeerList, PeerRecord, RemoteHost};
pub use scheduler::{
    ModuleId, PhaseChange, Scheduler, SchedulerError, Task, TimerHandle, TimerOutcome,
    ALIGNMENT_DURATION,
};
pub use sequence::{
    classify, ring_distance, ring_greater_than, ring_less_than, ring_next, ring_prev,
    RingPosition, SEQUENCE_HALF, SEQUENCE_MODULO,
};
pub use transport::{
    Action, Endpoint, Protocol, ProtocolConfig, SendOutcome, SrcEngine, SrswEngine,
    SucEngine, TransportError, FULLY_RELIABLE,
};
pub use wallclock::{unix_micros, unix_millis};
