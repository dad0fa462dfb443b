//! Client side of a QUIC-tunneled proxy protocol.
//!
//! A single authenticated QUIC session to a remote relay carries all user
//! traffic: TCP-like byte streams map onto QUIC bidirectional streams, UDP
//! flows map onto server-assigned sessions multiplexed over unreliable QUIC
//! datagrams (with fragmentation for payloads above the datagram size cap).
//!
//! The handshake negotiates a rate contract: the client announces its
//! send/receive targets, the server answers with the granted rates, and a
//! fixed-rate congestion controller enforces the granted send rate for the
//! lifetime of the connection.
//!
//! On permanent transport failure the client reconnects transparently:
//! once per dial attempt, never more.

mod client;
mod config;
mod congestion;
mod error;
mod frag;
mod protocol;
mod socket;
mod stream;
mod udp;

// Re-exports
pub use client::{Client, ReconnectNotify};
pub use config::{ClientConfig, TransportConfig};
pub use congestion::{Brutal, BrutalConfig, RateCell};
pub use error::{Error, Result};
pub use protocol::{
    parse_host_port, ClientHello, ClientRequest, CloseCode, ServerHello, ServerResponse,
    UdpMessage, CLOSE_AUTH, CLOSE_GENERIC, CLOSE_PROTOCOL,
};
pub use socket::{PacketConnFactory, UdpConnFactory};
pub use stream::ProxyStream;
pub use udp::UdpSession;

/// Protocol version byte sent at the head of the control stream.
pub const PROTOCOL_VERSION: u8 = 3;

/// Delivery queue depth per UDP session; overflow drops the newest message.
pub const UDP_SESSION_QUEUE_DEPTH: usize = 1024;
