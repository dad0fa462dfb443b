//! Wire protocol definitions.
//!
//! All frames use fixed-width integers in network byte order. `host` and
//! `message` strings carry an 8-bit length prefix, `auth` and datagram
//! payloads a 16-bit one. Each frame offers a pure `encode`/`decode` pair;
//! the frames read off a stream additionally provide an async `read_from`
//! generic over `AsyncRead` so the handshake can be exercised over an
//! in-memory duplex.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quinn::VarInt;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// QUIC application close code, shared with the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode {
    code: u32,
    reason: &'static str,
}

impl CloseCode {
    /// Send this close on a connection. Errors are unreportable past this
    /// point and ignored, matching `Connection::close` semantics.
    pub fn send(&self, conn: &quinn::Connection) {
        conn.close(VarInt::from_u32(self.code), self.reason.as_bytes());
    }

    pub fn code(&self) -> u32 {
        self.code
    }
}

/// Normal client shutdown.
pub const CLOSE_GENERIC: CloseCode = CloseCode { code: 0x0000, reason: "" };
/// Handshake or frame-level failure.
pub const CLOSE_PROTOCOL: CloseCode = CloseCode { code: 0x0001, reason: "protocol error" };
/// Server refused the credentials.
pub const CLOSE_AUTH: CloseCode = CloseCode { code: 0x0002, reason: "auth error" };

/// Split a `"host:port"` string. Accepts the bracketed IPv6 form.
pub fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::BadAddress(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::BadAddress(addr.to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || host.len() > u8::MAX as usize {
        return Err(Error::BadAddress(addr.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Inverse of [`parse_host_port`]; brackets IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn put_host(buf: &mut BytesMut, host: &str) -> Result<()> {
    if host.len() > u8::MAX as usize {
        return Err(Error::BadAddress(host.to_string()));
    }
    buf.put_u8(host.len() as u8);
    buf.put_slice(host.as_bytes());
    Ok(())
}

fn put_message(buf: &mut BytesMut, message: &str) -> Result<()> {
    if message.len() > u8::MAX as usize {
        return Err(Error::MalformedFrame);
    }
    buf.put_u8(message.len() as u8);
    buf.put_slice(message.as_bytes());
    Ok(())
}

fn get_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    if !cursor.has_remaining() {
        return Err(Error::MalformedFrame);
    }
    let len = cursor.get_u8() as usize;
    if cursor.remaining() < len {
        return Err(Error::MalformedFrame);
    }
    let mut raw = vec![0u8; len];
    cursor.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| Error::MalformedFrame)
}

/// First frame on the control stream, after the version byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Send rate the client intends to use, bits per second.
    pub send_bps: u64,
    /// Receive rate the client asks the server to use, bits per second.
    pub recv_bps: u64,
    /// Opaque credentials; the client never interprets them.
    pub auth: Bytes,
}

impl ClientHello {
    pub fn encode(&self) -> Result<Bytes> {
        if self.auth.len() > u16::MAX as usize {
            return Err(Error::MalformedFrame);
        }
        let mut buf = BytesMut::with_capacity(18 + self.auth.len());
        buf.put_u64(self.send_bps);
        buf.put_u64(self.recv_bps);
        buf.put_u16(self.auth.len() as u16);
        buf.put_slice(&self.auth);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        if cursor.remaining() < 18 {
            return Err(Error::MalformedFrame);
        }
        let send_bps = cursor.get_u64();
        let recv_bps = cursor.get_u64();
        let auth_len = cursor.get_u16() as usize;
        if cursor.remaining() < auth_len {
            return Err(Error::MalformedFrame);
        }
        let pos = cursor.position() as usize;
        let auth = Bytes::copy_from_slice(&data[pos..pos + auth_len]);
        Ok(Self {
            send_bps,
            recv_bps,
            auth,
        })
    }
}

/// Server reply on the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub ok: bool,
    /// Rate the server will send at, bits per second.
    pub send_bps: u64,
    /// Rate the server will receive at, which is the client's granted send rate.
    pub recv_bps: u64,
    pub message: String,
}

impl ServerHello {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(18 + self.message.len());
        buf.put_u8(self.ok as u8);
        buf.put_u64(self.send_bps);
        buf.put_u64(self.recv_bps);
        put_message(&mut buf, &self.message)?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        if cursor.remaining() < 18 {
            return Err(Error::MalformedFrame);
        }
        let ok = cursor.get_u8() != 0;
        let send_bps = cursor.get_u64();
        let recv_bps = cursor.get_u64();
        let message = get_string(&mut cursor)?;
        Ok(Self {
            ok,
            send_bps,
            recv_bps,
            message,
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut head = [0u8; 18];
        r.read_exact(&mut head).await?;
        let mut fixed = &head[..];
        let ok = fixed.get_u8() != 0;
        let send_bps = fixed.get_u64();
        let recv_bps = fixed.get_u64();
        let msg_len = fixed.get_u8() as usize;
        let mut raw = vec![0u8; msg_len];
        r.read_exact(&mut raw).await?;
        let message = String::from_utf8(raw).map_err(|_| Error::MalformedFrame)?;
        Ok(Self {
            ok,
            send_bps,
            recv_bps,
            message,
        })
    }
}

/// Per-dial request opening a TCP relay stream or a UDP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub udp: bool,
    /// Target host; unused (empty) for UDP session requests.
    pub host: String,
    pub port: u16,
}

impl ClientRequest {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(4 + self.host.len());
        buf.put_u8(self.udp as u8);
        put_host(&mut buf, &self.host)?;
        buf.put_u16(self.port);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        if !cursor.has_remaining() {
            return Err(Error::MalformedFrame);
        }
        let udp = cursor.get_u8() != 0;
        let host = get_string(&mut cursor)?;
        if cursor.remaining() < 2 {
            return Err(Error::MalformedFrame);
        }
        let port = cursor.get_u16();
        Ok(Self { udp, host, port })
    }
}

/// Server reply to a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    pub ok: bool,
    /// Session ID assigned by the server; meaningful only for UDP requests.
    pub session_id: u32,
    pub message: String,
}

impl ServerResponse {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(6 + self.message.len());
        buf.put_u8(self.ok as u8);
        buf.put_u32(self.session_id);
        put_message(&mut buf, &self.message)?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        if cursor.remaining() < 6 {
            return Err(Error::MalformedFrame);
        }
        let ok = cursor.get_u8() != 0;
        let session_id = cursor.get_u32();
        let message = get_string(&mut cursor)?;
        Ok(Self {
            ok,
            session_id,
            message,
        })
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut head = [0u8; 6];
        r.read_exact(&mut head).await?;
        let mut fixed = &head[..];
        let ok = fixed.get_u8() != 0;
        let session_id = fixed.get_u32();
        let msg_len = fixed.get_u8() as usize;
        let mut raw = vec![0u8; msg_len];
        r.read_exact(&mut raw).await?;
        let message = String::from_utf8(raw).map_err(|_| Error::MalformedFrame)?;
        Ok(Self {
            ok,
            session_id,
            message,
        })
    }
}

/// One UDP message, carried as a single QUIC datagram.
///
/// `msg_id` 0 is reserved for unfragmented messages. Fragments of the same
/// message share a nonzero `msg_id` and every fragment repeats the host and
/// port; the protocol does not compress them out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    pub session_id: u32,
    pub host: String,
    pub port: u16,
    pub msg_id: u16,
    pub frag_id: u8,
    pub frag_count: u8,
    pub data: Bytes,
}

impl UdpMessage {
    /// Wire bytes this message occupies beyond its payload.
    pub fn header_len(&self) -> usize {
        // session_id + host_len + host + port + msg_id + frag_id + frag_count + data_len
        13 + self.host.len()
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.data.len() > u16::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        let mut buf = BytesMut::with_capacity(self.header_len() + self.data.len());
        buf.put_u32(self.session_id);
        put_host(&mut buf, &self.host)?;
        buf.put_u16(self.port);
        buf.put_u16(self.msg_id);
        buf.put_u8(self.frag_id);
        buf.put_u8(self.frag_count);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        if cursor.remaining() < 5 {
            return Err(Error::MalformedFrame);
        }
        let session_id = cursor.get_u32();
        let host = get_string(&mut cursor)?;
        if cursor.remaining() < 8 {
            return Err(Error::MalformedFrame);
        }
        let port = cursor.get_u16();
        let msg_id = cursor.get_u16();
        let frag_id = cursor.get_u8();
        let frag_count = cursor.get_u8();
        let data_len = cursor.get_u16() as usize;
        if cursor.remaining() < data_len {
            return Err(Error::MalformedFrame);
        }
        let pos = cursor.position() as usize;
        let payload = Bytes::copy_from_slice(&data[pos..pos + data_len]);
        Ok(Self {
            session_id,
            host,
            port,
            msg_id,
            frag_id,
            frag_count,
            data: payload,
        })
    }
}
