//! TCP-like byte stream handle over a QUIC stream pair.

use pin_project_lite::pin_project;
use quinn::{RecvStream, SendStream};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Result;

pin_project! {
    /// Bidirectional byte stream returned by [`Client::dial_tcp`].
    ///
    /// Byte ordering is inherited from the underlying QUIC stream. The local
    /// and remote addresses are those of the QUIC connection; no socket is
    /// dedicated to this flow, so callers must not rely on per-flow
    /// uniqueness.
    ///
    /// [`Client::dial_tcp`]: crate::Client::dial_tcp
    #[derive(Debug)]
    pub struct ProxyStream {
        #[pin]
        send: SendStream,
        #[pin]
        recv: RecvStream,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    }
}

impl ProxyStream {
    pub(crate) fn new(
        send: SendStream,
        recv: RecvStream,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            send,
            recv,
            local_addr,
            remote_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Half-close: signal the server that no more data will be written.
    pub fn finish(&mut self) -> Result<()> {
        self.send.finish()?;
        Ok(())
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().recv.poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().send, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}
