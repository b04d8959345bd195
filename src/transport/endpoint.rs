//! The single datagram socket every channel shares.
//!
//! The endpoint performs no retransmission and keeps no per-peer state other
//! than what the caller passes in. For fault-injection runs, each send takes
//! the target's reliability percent and rolls a drop before the packet ever
//! reaches the wire, exactly as an unreliable network would.

use std::net::SocketAddr;

use log::{debug, info};
use rand::Rng;
use tokio::net::UdpSocket;

use crate::message::MAX_DATAGRAM_BYTES;

use super::error::TransportError;

/// Reliability percent that never drops; the default for real networks.
pub const FULLY_RELIABLE: u8 = 100;

/// What became of one outbound datagram.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// Handed to the operating system.
    Sent,
    /// Dropped before the wire, by the reliability roll or socket pressure.
    Dropped,
}

#[derive(Debug)]
pub struct Endpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl Endpoint {
    /// Binds the broker's one listening socket.
    pub async fn bind(address: &str, port: u16) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", address, port);
        let socket = UdpSocket::bind(&addr).await.map_err(|e| TransportError::Bind {
            addr: addr.clone(),
            detail: e.to_string(),
        })?;
        let local_addr = socket.local_addr().map_err(|e| TransportError::Bind {
            addr,
            detail: e.to_string(),
        })?;
        info!("listening for datagrams on {}", local_addr);
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends one datagram, subject to the target's reliability percent.
    ///
    /// A full send buffer counts as a dropped datagram, not an error; the
    /// reliable protocols recover it like any other loss. Hard socket errors
    /// surface as [`TransportError::Send`] so the owning connection can stop.
    pub fn send(
        &self,
        target: SocketAddr,
        bytes: &[u8],
        reliability: u8,
    ) -> Result<SendOutcome, TransportError> {
        if reliability < FULLY_RELIABLE
            && rand::thread_rng().gen_range(0..100u8) >= reliability
        {
            debug!("outgoing packet dropped ({}) -> {}", reliability, target);
            return Ok(SendOutcome::Dropped);
        }
        match self.socket.try_send_to(bytes, target) {
            Ok(_) => Ok(SendOutcome::Sent),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("socket backpressure, dropping packet -> {}", target);
                Ok(SendOutcome::Dropped)
            }
            Err(e) => Err(TransportError::Send {
                peer: target.to_string(),
                detail: e.to_string(),
            }),
        }
    }

    /// Waits for the next inbound datagram.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| TransportError::Recv { detail: e.to_string() })
    }

    /// A receive buffer sized for the largest legal datagram.
    pub fn recv_buffer() -> Vec<u8> {
        vec![0u8; MAX_DATAGRAM_BYTES]
    }
}
