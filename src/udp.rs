//! UDP session multiplexing: per-session delivery queues and the
//! user-facing datagram handle.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use quinn::{Connection, RecvStream, SendDatagramError, SendStream};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::frag::fragment_message;
use crate::protocol::{join_host_port, parse_host_port, UdpMessage};
use crate::UDP_SESSION_QUEUE_DEPTH;

/// Session-id → delivery queue for one connection epoch.
///
/// Reconnecting replaces the whole map, so every handle captures the map it
/// was installed into: a close after a reconnect must not touch the next
/// epoch's sessions.
#[derive(Default)]
pub(crate) struct SessionMap {
    inner: RwLock<HashMap<u32, mpsc::Sender<UdpMessage>>>,
}

impl SessionMap {
    /// Install a delivery queue for `session_id`, returning its consumer end.
    pub(crate) fn insert(&self, session_id: u32) -> mpsc::Receiver<UdpMessage> {
        let (tx, rx) = mpsc::channel(UDP_SESSION_QUEUE_DEPTH);
        self.inner.write().insert(session_id, tx);
        rx
    }

    pub(crate) fn remove(&self, session_id: u32) {
        self.inner.write().remove(&session_id);
    }

    /// Non-blocking delivery. A full queue drops the message so the caller
    /// (the datagram pump) never stalls.
    pub(crate) fn deliver(&self, msg: UdpMessage) {
        let session_id = msg.session_id;
        let map = self.inner.read();
        if let Some(tx) = map.get(&session_id) {
            match tx.try_send(msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(session_id, "UDP session queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Drop every delivery sender, waking blocked readers with `Closed`.
    pub(crate) fn clear(&self) {
        self.inner.write().clear();
    }

    #[cfg(test)]
    fn contains(&self, session_id: u32) -> bool {
        self.inner.read().contains_key(&session_id)
    }
}

/// Close state shared by the user handle and the liveness task. Both run
/// the same idempotent close: remove the session from the map it was
/// installed into and finish the request stream's send half.
pub(crate) struct SessionGuard {
    sessions: Arc<SessionMap>,
    session_id: u32,
    send: Mutex<Option<SendStream>>,
}

impl SessionGuard {
    pub(crate) fn close(&self) -> Result<()> {
        self.sessions.remove(self.session_id);
        if let Some(mut send) = self.send.lock().take() {
            send.finish()?;
        }
        Ok(())
    }
}

/// UDP flow handle returned by [`Client::dial_udp`].
///
/// The request stream stays open underneath as a liveness channel: the
/// server closing it cancels the session.
///
/// [`Client::dial_udp`]: crate::Client::dial_udp
pub struct UdpSession {
    conn: Connection,
    guard: Arc<SessionGuard>,
    session_id: u32,
    queue: mpsc::Receiver<UdpMessage>,
}

impl UdpSession {
    pub(crate) fn new(
        conn: Connection,
        send: SendStream,
        mut recv: RecvStream,
        session_id: u32,
        queue: mpsc::Receiver<UdpMessage>,
        sessions: Arc<SessionMap>,
    ) -> Self {
        let guard = Arc::new(SessionGuard {
            sessions,
            session_id,
            send: Mutex::new(Some(send)),
        });

        // Liveness: the request stream carries no user data, but the server
        // cancels the session by closing it. Drain until it ends, then run
        // the full close so our send half is finished too.
        let hold = guard.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match recv.read(&mut buf).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
            let _ = hold.close();
        });

        Self {
            conn,
            guard,
            session_id,
            queue,
        }
    }

    /// Server-assigned identifier of this session.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Wait for the next datagram addressed to this session. Returns the
    /// payload and its source as `"host:port"`, or [`Error::Closed`] once
    /// the session is gone.
    pub async fn read_from(&mut self) -> Result<(Bytes, String)> {
        let msg = self.queue.recv().await.ok_or(Error::Closed)?;
        let addr = join_host_port(&msg.host, msg.port);
        Ok((msg.data, addr))
    }

    /// Send one datagram to `addr` (`"host:port"`). Payloads above the
    /// transport's datagram size cap are fragmented transparently.
    pub async fn write_to(&mut self, data: &[u8], addr: &str) -> Result<()> {
        let (host, port) = parse_host_port(addr)?;
        let msg = UdpMessage {
            session_id: self.session_id,
            host,
            port,
            msg_id: 0,
            frag_id: 0,
            frag_count: 1,
            data: Bytes::copy_from_slice(data),
        };

        // Unfragmented first; the transport says when it will not fit.
        match msg.encode() {
            Ok(buf) => match self.conn.send_datagram(buf) {
                Ok(()) => return Ok(()),
                Err(SendDatagramError::TooLarge) => {}
                Err(err) => return Err(err.into()),
            },
            Err(Error::FrameTooLarge) => {}
            Err(err) => return Err(err),
        }

        let max_size = self.conn.max_datagram_size().ok_or(Error::FrameTooLarge)?;
        let msg_id = rand::thread_rng().gen_range(1..=u16::MAX);
        for frag in fragment_message(&msg, msg_id, max_size)? {
            self.conn.send_datagram(frag.encode()?)?;
        }
        Ok(())
    }

    /// Remove the session from the map it was installed into and half-close
    /// the liveness stream. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        self.queue.close();
        self.guard.close()
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(session_id: u32, byte: u8) -> UdpMessage {
        UdpMessage {
            session_id,
            host: "1.2.3.4".to_string(),
            port: 53,
            msg_id: 0,
            frag_id: 0,
            frag_count: 1,
            data: Bytes::copy_from_slice(&[byte]),
        }
    }

    #[tokio::test]
    async fn test_deliver_routes_by_session() {
        let map = SessionMap::default();
        let mut rx_a = map.insert(1);
        let mut rx_b = map.insert(2);

        map.deliver(msg(1, 0xAA));
        map.deliver(msg(2, 0xBB));
        map.deliver(msg(3, 0xCC)); // unknown session, dropped

        assert_eq!(rx_a.recv().await.unwrap().data[0], 0xAA);
        assert_eq!(rx_b.recv().await.unwrap().data[0], 0xBB);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let map = SessionMap::default();
        let mut rx = map.insert(5);

        for i in 0..(UDP_SESSION_QUEUE_DEPTH + 10) {
            map.deliver(msg(5, i as u8));
        }
        // Exactly the queue depth made it through; the rest were dropped
        // and deliver never blocked.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, UDP_SESSION_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn test_captured_map_close_does_not_touch_new_epoch() {
        let old_map = Arc::new(SessionMap::default());
        let _old_rx = old_map.insert(9);

        // Reconnect: a fresh map takes over, the server reuses the id.
        let new_map = Arc::new(SessionMap::default());
        let mut new_rx = new_map.insert(9);

        // The pre-reconnect handle closes against the map it captured.
        old_map.remove(9);

        assert!(!old_map.contains(9));
        assert!(new_map.contains(9));
        new_map.deliver(msg(9, 0x42));
        assert_eq!(new_rx.recv().await.unwrap().data[0], 0x42);
    }

    #[tokio::test]
    async fn test_clear_wakes_blocked_reader() {
        let map = Arc::new(SessionMap::default());
        let mut rx = map.insert(3);

        let map2 = map.clone();
        let reader = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        map2.clear();

        assert!(reader.await.unwrap().is_none());
    }
}
