//! Client lifecycle: connect, control handshake, reconnect gate, stream
//! dialers, and the datagram pump.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use quinn::{
    ClientConfig as QuinnClientConfig, Connection, Endpoint, RecvStream, SendStream, VarInt,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::congestion::{BrutalConfig, RateCell};
use crate::error::{Error, Result};
use crate::frag::Defragger;
use crate::protocol::{
    parse_host_port, ClientHello, ClientRequest, ServerHello, ServerResponse, UdpMessage,
    CLOSE_AUTH, CLOSE_GENERIC, CLOSE_PROTOCOL,
};
use crate::socket::{PacketConnFactory, UdpConnFactory};
use crate::stream::ProxyStream;
use crate::udp::{SessionMap, UdpSession};
use crate::PROTOCOL_VERSION;

/// Invoked with the error that forced a reconnect, before the attempt runs.
pub type ReconnectNotify = Box<dyn Fn(&Error) + Send + Sync>;

/// Tunnel client: one authenticated QUIC session multiplexing TCP-like
/// streams and UDP sessions, reconnecting once per dial on permanent
/// transport failure.
pub struct Client {
    config: ClientConfig,
    server_name: String,
    factory: Arc<dyn PacketConnFactory>,
    reconnect_notify: Option<ReconnectNotify>,
    state: Mutex<State>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Everything serialized by the reconnect gate. The mutex is held across
/// network I/O so a reconnect is atomic from the callers' viewpoint.
struct State {
    endpoint: Option<Endpoint>,
    conn: Option<Connection>,
    sessions: Arc<SessionMap>,
    closed: bool,
}

impl Client {
    /// Connect with the plain UDP factory and no reconnect notifier.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::connect_with(config, Arc::new(UdpConnFactory), None).await
    }

    /// Connect with a custom packet-conn factory (obfuscated transports)
    /// and an optional reconnect notifier.
    pub async fn connect_with(
        config: ClientConfig,
        factory: Arc<dyn PacketConnFactory>,
        reconnect_notify: Option<ReconnectNotify>,
    ) -> Result<Self> {
        let server_name = server_name_for(&config);
        let client = Self {
            config,
            server_name,
            factory,
            reconnect_notify,
            state: Mutex::new(State {
                endpoint: None,
                conn: None,
                sessions: Arc::new(SessionMap::default()),
                closed: false,
            }),
        };
        {
            let mut state = client.state.lock().await;
            client.establish(&mut state).await?;
        }
        Ok(client)
    }

    /// Open a TCP relay stream to `addr` (`"host:port"`).
    pub async fn dial_tcp(&self, addr: &str) -> Result<ProxyStream> {
        let (host, port) = parse_host_port(addr)?;
        let (conn, local_addr, mut send, mut recv) = self.open_stream_with_reconnect().await?;

        let request = ClientRequest {
            udp: false,
            host,
            port,
        };
        let response = match request_stream(&mut send, &mut recv, &request).await {
            Ok(response) => response,
            Err(err) => {
                send.finish().ok();
                return Err(err);
            }
        };
        if !response.ok {
            send.finish().ok();
            return Err(Error::Rejected(response.message));
        }

        debug!(addr, "TCP relay stream opened");
        Ok(ProxyStream::new(
            send,
            recv,
            local_addr,
            conn.remote_address(),
        ))
    }

    /// Open a UDP session. Datagrams to arbitrary destinations flow over
    /// the returned handle; the server assigns the session id.
    pub async fn dial_udp(&self) -> Result<UdpSession> {
        let (conn, _local_addr, mut send, mut recv) = self.open_stream_with_reconnect().await?;

        let request = ClientRequest {
            udp: true,
            host: String::new(),
            port: 0,
        };
        let response = match request_stream(&mut send, &mut recv, &request).await {
            Ok(response) => response,
            Err(err) => {
                send.finish().ok();
                return Err(err);
            }
        };
        if !response.ok {
            send.finish().ok();
            return Err(Error::Rejected(response.message));
        }
        let session_id = response.session_id;

        // Install the delivery queue in the map in effect right now. The
        // handle keeps this exact map so a close after a reconnect cannot
        // disturb the next epoch's sessions.
        let sessions = {
            let state = self.state.lock().await;
            if state.closed {
                send.finish().ok();
                return Err(Error::Closed);
            }
            state.sessions.clone()
        };
        let queue = sessions.insert(session_id);

        debug!(session_id, "UDP session established");
        Ok(UdpSession::new(conn, send, recv, session_id, queue, sessions))
    }

    /// Shut the client down. Subsequent dials fail with [`Error::Closed`];
    /// blocked UDP reads observe closure once the datagram pump winds down.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(conn) = state.conn.take() {
            CLOSE_GENERIC.send(&conn);
        }
        if let Some(endpoint) = state.endpoint.take() {
            endpoint.close(VarInt::from_u32(0), b"");
        }
        state.closed = true;
        info!("client closed");
        Ok(())
    }

    /// The reconnect gate. Opens a stream on the current connection; on a
    /// permanent transport error, notifies, reconnects once, and retries the
    /// open exactly once; whatever that attempt returns is final.
    ///
    /// The transport signals exhausted stream credit by making the open
    /// wait instead of failing, so the open is deadline-bounded and the
    /// elapsed deadline classified as the temporary, no-reconnect error.
    /// A missing connection (a previous reconnect attempt failed) takes the
    /// same notify-then-reconnect path as a dead one.
    async fn open_stream_with_reconnect(
        &self,
    ) -> Result<(Connection, SocketAddr, SendStream, RecvStream)> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }

        let err = match state.conn.clone() {
            Some(conn) => {
                match tokio::time::timeout(self.config.protocol_timeout, conn.open_bi()).await {
                    Ok(Ok((send, recv))) => {
                        let local_addr = local_addr(&state)?;
                        return Ok((conn, local_addr, send, recv));
                    }
                    Ok(Err(err)) => Error::from(err),
                    Err(_) => Error::StreamLimit,
                }
            }
            None => Error::NotConnected,
        };
        if err.is_temporary() {
            return Err(err);
        }
        warn!(error = %err, "transport failure, reconnecting");
        if let Some(notify) = &self.reconnect_notify {
            notify(&err);
        }

        self.establish(&mut state).await?;
        let conn = state.conn.clone().ok_or(Error::Closed)?;
        let (send, recv) =
            match tokio::time::timeout(self.config.protocol_timeout, conn.open_bi()).await {
                Ok(opened) => opened?,
                Err(_) => return Err(Error::StreamLimit),
            };
        let local_addr = local_addr(&state)?;
        Ok((conn, local_addr, send, recv))
    }

    /// One full (re)connect: tear down the previous epoch, get a fresh
    /// packet conn, dial QUIC, run the control handshake, and start the
    /// datagram pump. Every failure path releases the packet conn.
    async fn establish(&self, state: &mut State) -> Result<()> {
        if let Some(conn) = state.conn.take() {
            conn.close(VarInt::from_u32(0), b"");
        }
        if let Some(endpoint) = state.endpoint.take() {
            endpoint.close(VarInt::from_u32(0), b"");
        }

        let (socket, server_addr) = self.factory.open(&self.config.server_addr).await?;
        let runtime = quinn::default_runtime()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "no async runtime")))?;
        let endpoint = Endpoint::new(quinn::EndpointConfig::default(), None, socket, runtime)?;

        // The controller reads the rate cell live; the handshake below
        // stores the server-granted send rate into it.
        let rate = RateCell::new(self.config.send_bps);
        let quinn_config = self.build_quinn_config(&rate)?;

        let conn = match self.dial(&endpoint, quinn_config, server_addr).await {
            Ok(conn) => conn,
            Err(err) => {
                endpoint.close(VarInt::from_u32(0), b"");
                return Err(err);
            }
        };

        if let Err(err) = self.handshake(&conn, &rate).await {
            match &err {
                Error::AuthFailed(_) => CLOSE_AUTH.send(&conn),
                _ => CLOSE_PROTOCOL.send(&conn),
            }
            endpoint.close(VarInt::from_u32(0), b"");
            return Err(err);
        }

        let sessions = Arc::new(SessionMap::default());
        spawn_datagram_pump(conn.clone(), sessions.clone());
        state.sessions = sessions;
        state.endpoint = Some(endpoint);
        state.conn = Some(conn);
        info!(server = %self.config.server_addr, "connected");
        Ok(())
    }

    async fn dial(
        &self,
        endpoint: &Endpoint,
        config: QuinnClientConfig,
        server_addr: SocketAddr,
    ) -> Result<Connection> {
        let conn = endpoint
            .connect_with(config, server_addr, &self.server_name)?
            .await?;
        Ok(conn)
    }

    /// Version byte, client hello, server hello. Only the stream open is
    /// bounded by the protocol timeout; the exchange itself rides the
    /// connection's idle timeout.
    async fn handshake(&self, conn: &Connection, rate: &Arc<RateCell>) -> Result<()> {
        let opened = tokio::time::timeout(self.config.protocol_timeout, conn.open_bi())
            .await
            .map_err(|_| Error::HandshakeTimeout)?;
        let (mut send, mut recv) = opened?;

        let hello = ClientHello {
            send_bps: self.config.send_bps,
            recv_bps: self.config.recv_bps,
            auth: Bytes::copy_from_slice(&self.config.auth),
        };
        let reply = control_handshake(&mut send, &mut recv, &hello).await?;
        // The control stream has no further use; release its stream credit.
        send.finish().ok();
        if !reply.ok {
            return Err(Error::AuthFailed(reply.message));
        }

        // The server's receive rate is our permitted send rate.
        rate.set(reply.recv_bps);
        debug!(send_bps = reply.recv_bps, "rate contract established");
        Ok(())
    }

    fn build_quinn_config(&self, rate: &Arc<RateCell>) -> Result<QuinnClientConfig> {
        let tls = self.build_tls_config();
        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|err| Error::Config(format!("TLS configuration rejected: {}", err)))?;
        let mut client_config = QuinnClientConfig::new(Arc::new(quic_tls));

        let transport_cfg = &self.config.transport;
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(
            transport_cfg
                .idle_timeout
                .try_into()
                .map_err(|_| Error::Config("idle timeout out of range".to_string()))?,
        ));
        if let Some(interval) = transport_cfg.keep_alive_interval {
            transport.keep_alive_interval(Some(interval));
        }
        transport.max_concurrent_bidi_streams(transport_cfg.max_concurrent_bidi_streams.into());
        transport.max_concurrent_uni_streams(transport_cfg.max_concurrent_uni_streams.into());
        if transport_cfg.mtu_discovery_disabled() {
            transport.mtu_discovery_config(None);
        }
        transport.congestion_controller_factory(Arc::new(BrutalConfig::new(rate.clone())));

        client_config.transport_config(Arc::new(transport));
        Ok(client_config)
    }

    fn build_tls_config(&self) -> rustls::ClientConfig {
        let mut tls = if self.config.skip_cert_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_native_certs::load_native_certs().certs {
                roots.add(cert).ok();
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        tls.alpn_protocols = self
            .config
            .alpn
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();
        tls
    }
}

/// SNI from the host part of `server_addr` unless overridden. Factories
/// with their own addressing scheme may make the address unparseable; the
/// name is then empty and must come from `server_name`.
fn server_name_for(config: &ClientConfig) -> String {
    config.server_name.clone().unwrap_or_else(|| {
        parse_host_port(&config.server_addr)
            .map(|(host, _)| host)
            .unwrap_or_default()
    })
}

fn local_addr(state: &State) -> Result<SocketAddr> {
    let endpoint = state.endpoint.as_ref().ok_or(Error::Closed)?;
    Ok(endpoint.local_addr()?)
}

/// Control-stream exchange, generic over the transport for testability.
pub(crate) async fn control_handshake<W, R>(
    send: &mut W,
    recv: &mut R,
    hello: &ClientHello,
) -> Result<ServerHello>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    send.write_all(&[PROTOCOL_VERSION]).await?;
    send.write_all(&hello.encode()?).await?;
    send.flush().await?;
    ServerHello::read_from(recv).await
}

/// Request-stream exchange, generic over the transport for testability.
pub(crate) async fn request_stream<W, R>(
    send: &mut W,
    recv: &mut R,
    request: &ClientRequest,
) -> Result<ServerResponse>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    send.write_all(&request.encode()?).await?;
    send.flush().await?;
    ServerResponse::read_from(recv).await
}

/// One task per connection: receive datagrams, defragment, route to the
/// per-session queue. Exits on the first receive error and then drains the
/// session map it was started with, so readers of this epoch unblock.
fn spawn_datagram_pump(conn: Connection, sessions: Arc<SessionMap>) {
    tokio::spawn(async move {
        let mut defrag = Defragger::default();
        loop {
            let datagram = match conn.read_datagram().await {
                Ok(datagram) => datagram,
                Err(err) => {
                    debug!(error = %err, "datagram pump stopped");
                    break;
                }
            };
            let msg = match UdpMessage::decode(&datagram) {
                Ok(msg) => msg,
                Err(_) => continue, // malformed datagrams are dropped
            };
            if let Some(msg) = defrag.feed(msg) {
                sessions.deliver(msg);
            }
        }
        sessions.clear();
    });
}

/// Accept any server certificate. For deployments pinning trust elsewhere;
/// off by default.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn test_config() -> ClientConfig {
        ClientConfig::new("relay.example.com:443", b"token".to_vec(), 1_000, 2_000)
    }

    #[test]
    fn test_server_name_from_addr() {
        assert_eq!(server_name_for(&test_config()), "relay.example.com");
    }

    #[test]
    fn test_server_name_override() {
        let mut config = test_config();
        config.server_name = Some("camouflage.example.org".to_string());
        assert_eq!(server_name_for(&config), "camouflage.example.org");
    }

    #[test]
    fn test_server_name_unparseable_addr() {
        let mut config = test_config();
        config.server_addr = "opaque-transport-token".to_string();
        assert_eq!(server_name_for(&config), "");
    }

    #[tokio::test]
    async fn test_control_handshake_accepted() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let (mut client_recv, mut client_send) = tokio::io::split(client_side);
        let (mut server_recv, mut server_send) = tokio::io::split(server_side);

        let server = tokio::spawn(async move {
            let mut version = [0u8; 1];
            server_recv.read_exact(&mut version).await.unwrap();
            assert_eq!(version[0], PROTOCOL_VERSION);
            let hello = read_client_hello(&mut server_recv).await;
            assert_eq!(&hello.auth[..], b"token");
            let reply = ServerHello {
                ok: true,
                send_bps: 500,
                recv_bps: 800,
                message: String::new(),
            };
            server_send.write_all(&reply.encode().unwrap()).await.unwrap();
        });

        let hello = ClientHello {
            send_bps: 1_000,
            recv_bps: 2_000,
            auth: Bytes::from_static(b"token"),
        };
        let reply = control_handshake(&mut client_send, &mut client_recv, &hello)
            .await
            .unwrap();
        assert!(reply.ok);
        assert_eq!(reply.recv_bps, 800);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_control_handshake_auth_rejected() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let (mut client_recv, mut client_send) = tokio::io::split(client_side);
        let (mut server_recv, mut server_send) = tokio::io::split(server_side);

        let server = tokio::spawn(async move {
            let mut ignore = [0u8; 1];
            server_recv.read_exact(&mut ignore).await.unwrap();
            read_client_hello(&mut server_recv).await;
            let reply = ServerHello {
                ok: false,
                send_bps: 0,
                recv_bps: 0,
                message: "bad auth".to_string(),
            };
            server_send.write_all(&reply.encode().unwrap()).await.unwrap();
        });

        let hello = ClientHello {
            send_bps: 1_000,
            recv_bps: 2_000,
            auth: Bytes::from_static(b"wrong"),
        };
        let reply = control_handshake(&mut client_send, &mut client_recv, &hello)
            .await
            .unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.message, "bad auth");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_control_handshake_short_read() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let (mut client_recv, mut client_send) = tokio::io::split(client_side);
        drop(server_side); // server hangs up before replying

        let hello = ClientHello {
            send_bps: 1,
            recv_bps: 1,
            auth: Bytes::new(),
        };
        let result = control_handshake(&mut client_send, &mut client_recv, &hello).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_request_stream_rejection_message() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let (mut client_recv, mut client_send) = tokio::io::split(client_side);
        let (mut server_recv, mut server_send) = tokio::io::split(server_side);

        let server = tokio::spawn(async move {
            let mut raw = vec![0u8; 64];
            let n = server_recv.read(&mut raw).await.unwrap();
            let request = ClientRequest::decode(&raw[..n]).unwrap();
            assert!(!request.udp);
            assert_eq!(request.host, "example.com");
            let reply = ServerResponse {
                ok: false,
                session_id: 0,
                message: "forbidden".to_string(),
            };
            server_send.write_all(&reply.encode().unwrap()).await.unwrap();
        });

        let request = ClientRequest {
            udp: false,
            host: "example.com".to_string(),
            port: 80,
        };
        let response = request_stream(&mut client_send, &mut client_recv, &request)
            .await
            .unwrap();
        assert!(!response.ok);
        assert_eq!(response.message, "forbidden");
        server.await.unwrap();
    }

    /// Server-side decoder for the duplex fake server.
    async fn read_client_hello<R: AsyncRead + Unpin>(r: &mut R) -> ClientHello {
        let mut head = [0u8; 18];
        r.read_exact(&mut head).await.unwrap();
        let mut auth = vec![0u8; u16::from_be_bytes([head[16], head[17]]) as usize];
        r.read_exact(&mut auth).await.unwrap();
        ClientHello {
            send_bps: u64::from_be_bytes(head[..8].try_into().unwrap()),
            recv_bps: u64::from_be_bytes(head[8..16].try_into().unwrap()),
            auth: Bytes::from(auth),
        }
    }
}
