//! Fragmentation and reassembly of UDP messages.
//!
//! QUIC datagrams cap a single send at the path's datagram size; messages
//! above the cap are split into fragments sharing a nonzero `msg_id` and
//! reassembled on the far side. One assembly is in flight per session: a
//! fragment with a new `msg_id` discards whatever partial assembly the
//! session had.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::protocol::UdpMessage;

/// Split `msg` into fragments whose encoded size stays within `max_size`.
///
/// Every fragment repeats the session/host/port of the original and carries
/// the caller-chosen nonzero `msg_id`. Fails with [`Error::FrameTooLarge`]
/// when `max_size` cannot fit the per-fragment header plus one payload byte,
/// or when the payload needs more than 255 fragments.
pub fn fragment_message(msg: &UdpMessage, msg_id: u16, max_size: usize) -> Result<Vec<UdpMessage>> {
    debug_assert!(msg_id != 0);
    let budget = max_size
        .saturating_sub(msg.header_len())
        .min(u16::MAX as usize);
    if budget == 0 {
        return Err(Error::FrameTooLarge);
    }

    let chunks: Vec<&[u8]> = if msg.data.is_empty() {
        vec![&[][..]]
    } else {
        msg.data.chunks(budget).collect()
    };
    if chunks.len() > u8::MAX as usize {
        return Err(Error::FrameTooLarge);
    }

    let frag_count = chunks.len() as u8;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| UdpMessage {
            session_id: msg.session_id,
            host: msg.host.clone(),
            port: msg.port,
            msg_id,
            frag_id: i as u8,
            frag_count,
            data: Bytes::copy_from_slice(chunk),
        })
        .collect())
}

/// One partial reassembly, keyed by session in [`Defragger`].
struct Assembly {
    msg_id: u16,
    frag_count: u8,
    received: u8,
    host: String,
    port: u16,
    slots: Vec<Option<Bytes>>,
}

impl Assembly {
    fn new(msg: &UdpMessage) -> Self {
        Self {
            msg_id: msg.msg_id,
            frag_count: msg.frag_count,
            received: 0,
            host: msg.host.clone(),
            port: msg.port,
            slots: vec![None; msg.frag_count as usize],
        }
    }
}

/// Reassembles fragmented UDP messages, one in-flight assembly per session.
///
/// Owned by the datagram pump task; needs no locking.
#[derive(Default)]
pub(crate) struct Defragger {
    sessions: HashMap<u32, Assembly>,
}

impl Defragger {
    /// Feed one decoded message; returns a fully assembled message when the
    /// final fragment lands, or the message itself if it was never split.
    pub(crate) fn feed(&mut self, msg: UdpMessage) -> Option<UdpMessage> {
        if msg.frag_count <= 1 {
            return Some(msg);
        }

        let assembly = self
            .sessions
            .entry(msg.session_id)
            .and_modify(|a| {
                if a.msg_id != msg.msg_id {
                    *a = Assembly::new(&msg);
                }
            })
            .or_insert_with(|| Assembly::new(&msg));

        let idx = msg.frag_id as usize;
        if idx >= assembly.slots.len() || assembly.slots[idx].is_some() {
            return None;
        }
        assembly.slots[idx] = Some(msg.data);
        assembly.received += 1;
        if assembly.received < assembly.frag_count {
            return None;
        }

        let assembly = self.sessions.remove(&msg.session_id)?;
        let mut data = BytesMut::new();
        for slot in assembly.slots {
            data.extend_from_slice(&slot?);
        }
        Some(UdpMessage {
            session_id: msg.session_id,
            host: assembly.host,
            port: assembly.port,
            msg_id: assembly.msg_id,
            frag_id: 0,
            frag_count: 1,
            data: data.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn message(session_id: u32, data: &[u8]) -> UdpMessage {
        UdpMessage {
            session_id,
            host: "1.2.3.4".to_string(),
            port: 53,
            msg_id: 0,
            frag_id: 0,
            frag_count: 1,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn test_unfragmented_passthrough() {
        let mut defrag = Defragger::default();
        let msg = message(1, &[1, 2, 3]);
        assert_eq!(defrag.feed(msg.clone()), Some(msg));
    }

    #[test]
    fn test_fragment_sizes_and_ids() {
        let msg = message(9, &[0xAB; 1024]);
        let max_size = 100;
        let frags = fragment_message(&msg, 77, max_size).unwrap();

        let budget = max_size - msg.header_len();
        let expected = 1024_usize.div_ceil(budget);
        assert_eq!(frags.len(), expected);
        for (i, frag) in frags.iter().enumerate() {
            assert_eq!(frag.msg_id, 77);
            assert_eq!(frag.frag_id, i as u8);
            assert_eq!(frag.frag_count as usize, expected);
            assert_eq!(frag.session_id, 9);
            assert_eq!(frag.host, msg.host);
            assert_eq!(frag.port, msg.port);
            assert!(frag.encode().unwrap().len() <= max_size);
        }
        let total: usize = frags.iter().map(|f| f.data.len()).sum();
        assert_eq!(total, 1024);
    }

    #[test]
    fn test_fragment_budget_too_small() {
        let msg = message(1, &[0; 64]);
        assert!(matches!(
            fragment_message(&msg, 1, msg.header_len()),
            Err(Error::FrameTooLarge)
        ));
        assert!(matches!(
            fragment_message(&msg, 1, 4),
            Err(Error::FrameTooLarge)
        ));
    }

    #[test]
    fn test_fragment_count_overflow() {
        let msg = message(1, &[0; 4096]);
        // One payload byte per fragment would need 4096 fragments.
        let max_size = msg.header_len() + 1;
        assert!(matches!(
            fragment_message(&msg, 1, max_size),
            Err(Error::FrameTooLarge)
        ));
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let msg = message(3, &payload);
        let mut frags = fragment_message(&msg, 5, 120).unwrap();
        frags.reverse();

        let mut defrag = Defragger::default();
        let mut out = None;
        for frag in frags {
            out = defrag.feed(frag).or(out);
        }
        let out = out.expect("assembly must complete");
        assert_eq!(&out.data[..], &payload[..]);
        assert_eq!(out.session_id, 3);
        assert_eq!(out.host, "1.2.3.4");
        assert_eq!(out.port, 53);
    }

    #[test]
    fn test_new_msg_id_replaces_partial() {
        let msg = message(4, &[0x11; 400]);
        let old = fragment_message(&msg, 10, 120).unwrap();
        let new = fragment_message(&msg, 11, 120).unwrap();

        let mut defrag = Defragger::default();
        // Half of the old assembly arrives, then the new one in full.
        assert!(defrag.feed(old[0].clone()).is_none());
        let mut out = None;
        for frag in new {
            out = defrag.feed(frag).or(out);
        }
        let out = out.expect("new assembly must complete");
        assert_eq!(out.msg_id, 11);
        assert_eq!(&out.data[..], &[0x11; 400][..]);
        // The old assembly is gone; its remaining fragments are ignored.
        for frag in &old[1..] {
            assert!(defrag.feed(frag.clone()).is_none());
        }
    }

    #[test]
    fn test_session_isolation() {
        let a = fragment_message(&message(1, &[0xAA; 300]), 7, 120).unwrap();
        let b = fragment_message(&message(2, &[0xBB; 300]), 9, 120).unwrap();

        let mut defrag = Defragger::default();
        for frag in &a[..a.len() - 1] {
            assert!(defrag.feed(frag.clone()).is_none());
        }
        // Session 2 completing does not disturb session 1's partial state.
        let mut out_b = None;
        for frag in b {
            out_b = defrag.feed(frag).or(out_b);
        }
        assert_eq!(&out_b.unwrap().data[..], &[0xBB; 300][..]);

        let out_a = defrag.feed(a[a.len() - 1].clone()).unwrap();
        assert_eq!(&out_a.data[..], &[0xAA; 300][..]);
    }

    #[test]
    fn test_duplicate_and_out_of_range_fragments_ignored() {
        let frags = fragment_message(&message(6, &[0x42; 300]), 3, 120).unwrap();
        let mut defrag = Defragger::default();

        assert!(defrag.feed(frags[0].clone()).is_none());
        // Duplicate slot.
        assert!(defrag.feed(frags[0].clone()).is_none());
        // Out-of-range fragment id.
        let mut rogue = frags[1].clone();
        rogue.frag_id = rogue.frag_count + 5;
        assert!(defrag.feed(rogue).is_none());

        let mut out = None;
        for frag in &frags[1..] {
            out = defrag.feed(frag.clone()).or(out);
        }
        assert_eq!(&out.unwrap().data[..], &[0x42; 300][..]);
    }

    proptest! {
        #[test]
        fn prop_fragment_roundtrip(
            payload in proptest::collection::vec(any::<u8>(), 0..4096),
            extra in 20usize..1400,
        ) {
            let msg = message(1, &payload);
            let max_size = msg.header_len() + extra;
            let frags = fragment_message(&msg, 99, max_size).unwrap();
            prop_assert!(frags.iter().all(|f| f.encode().unwrap().len() <= max_size));

            let mut defrag = Defragger::default();
            let mut out = None;
            for frag in frags {
                out = defrag.feed(frag).or(out);
            }
            let out = out.unwrap();
            prop_assert_eq!(&out.data[..], &payload[..]);
        }
    }
}
