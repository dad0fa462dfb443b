//! Packet-conn plumbing beneath the QUIC endpoint.

use std::net::{SocketAddr, UdpSocket};

use async_trait::async_trait;
use tokio::net::lookup_host;

use crate::error::{Error, Result};

/// Produces the datagram socket a session runs on, plus the resolved server
/// address. A fresh socket is requested for every (re)connect.
///
/// Obfuscating transports implement this to interpose their own socket; the
/// client never assumes a bare UDP path.
#[async_trait]
pub trait PacketConnFactory: Send + Sync {
    async fn open(&self, server_addr: &str) -> Result<(UdpSocket, SocketAddr)>;
}

/// Plain UDP: resolve the server, bind a wildcard socket of the same family.
#[derive(Debug, Default)]
pub struct UdpConnFactory;

#[async_trait]
impl PacketConnFactory for UdpConnFactory {
    async fn open(&self, server_addr: &str) -> Result<(UdpSocket, SocketAddr)> {
        let resolved = lookup_host(server_addr)
            .await?
            .next()
            .ok_or_else(|| Error::BadAddress(server_addr.to_string()))?;
        let bind_addr: SocketAddr = if resolved.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        Ok((socket, resolved))
    }
}
