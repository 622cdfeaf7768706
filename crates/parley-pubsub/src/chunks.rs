//! Chunked framing for payload-bounded datagrams.
//!
//! A marshaled message longer than the broker's maximum datagram is split
//! into chunks:
//!
//! ```text
//! [ PREFIX (19) | nonce (16) | index (1) | total (1) | body ... ]
//! ```
//!
//! The nonce ties the chunks of one logical message together; `index` and
//! `total` are single bytes, so a message may occupy at most 255 chunks and
//! senders refuse anything larger. Chunks may arrive in any order; the
//! logical message is delivered exactly once, when the last slot fills.

use std::collections::{HashMap, VecDeque};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;

use parley_session::Error;

/// Marks a datagram as a chunk of a larger message.
pub const CHUNK_HEADER_PREFIX: &[u8] = b"@phnq/message/chunk";

/// Chunk nonce length in bytes.
pub const CHUNK_NONCE_LEN: usize = 16;

/// Full header length: prefix + nonce + index + total.
pub const CHUNK_HEADER_LEN: usize = CHUNK_HEADER_PREFIX.len() + CHUNK_NONCE_LEN + 2;

/// Hard ceiling on chunks per logical message (one index byte).
pub const MAX_CHUNKS: usize = 255;

/// Incomplete reassembly buffers kept before the oldest is evicted.
///
/// A peer that never completes a message must not be able to grow the
/// buffer map without bound.
pub const MAX_PENDING_MESSAGES: usize = 64;

/// Whether a datagram is a chunk rather than a whole marshaled message.
pub fn is_chunk(datagram: &[u8]) -> bool {
    datagram.starts_with(CHUNK_HEADER_PREFIX)
}

/// Split a marshaled message into chunk datagrams.
///
/// `max_payload` is the broker's datagram ceiling; each produced chunk is at
/// most that long. Fails when the ceiling cannot fit a header plus one body
/// byte, or when the message would need more than [`MAX_CHUNKS`] chunks.
pub fn split_into_chunks(marshaled: &[u8], max_payload: usize) -> Result<Vec<Vec<u8>>, Error> {
    if max_payload <= CHUNK_HEADER_LEN {
        return Err(Error::Transport(format!(
            "max payload {max_payload} cannot fit a chunk header ({CHUNK_HEADER_LEN} bytes)"
        )));
    }
    let body_cap = max_payload - CHUNK_HEADER_LEN;
    let num_chunks = marshaled.len().div_ceil(body_cap);
    if num_chunks > MAX_CHUNKS {
        return Err(Error::Transport(format!(
            "message of {} bytes needs {num_chunks} chunks; the frame allows at most {MAX_CHUNKS}",
            marshaled.len()
        )));
    }

    let mut nonce = [0u8; CHUNK_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut chunks = Vec::with_capacity(num_chunks);
    for (index, body) in marshaled.chunks(body_cap).enumerate() {
        let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + body.len());
        chunk.extend_from_slice(CHUNK_HEADER_PREFIX);
        chunk.extend_from_slice(&nonce);
        chunk.push(index as u8);
        chunk.push(num_chunks as u8);
        chunk.extend_from_slice(body);
        chunks.push(chunk);
    }
    Ok(chunks)
}

struct PartialMessage {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
}

/// Reassembles chunked messages, bounding memory held for stragglers.
pub struct ChunkAssembler {
    pending: HashMap<[u8; CHUNK_NONCE_LEN], PartialMessage>,
    arrival_order: VecDeque<[u8; CHUNK_NONCE_LEN]>,
    max_pending: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PENDING_MESSAGES)
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            arrival_order: VecDeque::new(),
            max_pending,
        }
    }

    /// Number of incomplete messages currently buffered.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Feed one chunk datagram.
    ///
    /// Returns the reassembled marshaled message once every slot for its
    /// nonce has filled; otherwise `None`. Chunks with an invalid header,
    /// index, or total are logged and dropped. Partial reassembly never
    /// leaks: slots are only concatenated when complete.
    pub fn accept(&mut self, datagram: &[u8]) -> Option<Vec<u8>> {
        if datagram.len() < CHUNK_HEADER_LEN || !is_chunk(datagram) {
            warn!(len = datagram.len(), "dropping malformed chunk datagram");
            return None;
        }

        let mut nonce = [0u8; CHUNK_NONCE_LEN];
        let nonce_start = CHUNK_HEADER_PREFIX.len();
        nonce.copy_from_slice(&datagram[nonce_start..nonce_start + CHUNK_NONCE_LEN]);
        let index = datagram[nonce_start + CHUNK_NONCE_LEN] as usize;
        let total = datagram[nonce_start + CHUNK_NONCE_LEN + 1] as usize;
        let body = &datagram[CHUNK_HEADER_LEN..];

        if total == 0 || index >= total {
            warn!(index, total, "dropping chunk with invalid index/total");
            return None;
        }

        if !self.pending.contains_key(&nonce) {
            self.evict_if_full();
            self.pending.insert(
                nonce,
                PartialMessage {
                    slots: vec![None; total],
                    filled: 0,
                },
            );
            self.arrival_order.push_back(nonce);
        }

        let partial = self.pending.get_mut(&nonce)?;
        if partial.slots.len() != total {
            warn!(
                expected = partial.slots.len(),
                got = total,
                "dropping chunk whose total disagrees with its siblings"
            );
            return None;
        }
        if partial.slots[index].is_some() {
            warn!(index, "dropping duplicate chunk");
            return None;
        }

        partial.slots[index] = Some(body.to_vec());
        partial.filled += 1;

        if partial.filled < total {
            return None;
        }

        let complete = self.pending.remove(&nonce)?;
        self.arrival_order.retain(|n| n != &nonce);
        let mut message = Vec::new();
        for slot in complete.slots {
            message.extend_from_slice(&slot?);
        }
        Some(message)
    }

    fn evict_if_full(&mut self) {
        while self.pending.len() >= self.max_pending {
            let Some(oldest) = self.arrival_order.pop_front() else {
                return;
            };
            if self.pending.remove(&oldest).is_some() {
                warn!("evicting oldest incomplete chunk buffer");
            }
        }
    }
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_length_matches_the_frame_layout() {
        assert_eq!(CHUNK_HEADER_LEN, 37);
    }

    #[test]
    fn round_trip_in_order() {
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let chunks = split_into_chunks(&payload, 1024).unwrap();
        assert_eq!(chunks.len(), payload.len().div_ceil(1024 - CHUNK_HEADER_LEN));

        let mut assembler = ChunkAssembler::new();
        let mut result = None;
        for chunk in &chunks {
            assert!(chunk.len() <= 1024);
            result = assembler.accept(chunk);
        }
        assert_eq!(result.unwrap(), payload);
        assert_eq!(assembler.pending_count(), 0);
    }

    #[test]
    fn round_trip_survives_any_delivery_order() {
        let payload: Vec<u8> = (0..5_000).map(|i| (i % 239) as u8).collect();
        let chunks = split_into_chunks(&payload, 256).unwrap();

        // A handful of deterministic shuffles: reversed, evens-then-odds,
        // and a large-stride interleave.
        let orders: Vec<Vec<usize>> = vec![
            (0..chunks.len()).rev().collect(),
            (0..chunks.len())
                .step_by(2)
                .chain((1..chunks.len()).step_by(2))
                .collect(),
            {
                let mut order: Vec<usize> = (0..chunks.len()).collect();
                order.sort_by_key(|i| (i * 7) % chunks.len());
                order
            },
        ];

        for order in orders {
            let mut assembler = ChunkAssembler::new();
            let mut result = None;
            for &i in &order {
                let out = assembler.accept(&chunks[i]);
                if out.is_some() {
                    result = out;
                }
            }
            assert_eq!(result.unwrap(), payload);
        }
    }

    #[test]
    fn interleaved_messages_reassemble_independently() {
        let first: Vec<u8> = vec![1; 500];
        let second: Vec<u8> = vec![2; 500];
        let chunks_a = split_into_chunks(&first, 128).unwrap();
        let chunks_b = split_into_chunks(&second, 128).unwrap();

        let mut assembler = ChunkAssembler::new();
        let mut done = Vec::new();
        for (a, b) in chunks_a.iter().zip(chunks_b.iter()) {
            if let Some(m) = assembler.accept(a) {
                done.push(m);
            }
            if let Some(m) = assembler.accept(b) {
                done.push(m);
            }
        }
        assert_eq!(done, vec![first, second]);
    }

    #[test]
    fn oversized_message_is_refused() {
        let payload = vec![0u8; 300 * (128 - CHUNK_HEADER_LEN)];
        let err = split_into_chunks(&payload, 128).unwrap_err();
        assert!(err.to_string().contains("255"));
    }

    #[test]
    fn tiny_max_payload_is_refused() {
        let err = split_into_chunks(b"hello", CHUNK_HEADER_LEN).unwrap_err();
        assert!(err.to_string().contains("header"));
    }

    #[test]
    fn exactly_255_chunks_is_allowed() {
        let body_cap = 128 - CHUNK_HEADER_LEN;
        let payload = vec![7u8; 255 * body_cap];
        let chunks = split_into_chunks(&payload, 128).unwrap();
        assert_eq!(chunks.len(), 255);
    }

    #[test]
    fn invalid_index_and_total_are_dropped() {
        let chunks = split_into_chunks(&[1, 2, 3], 128).unwrap();
        let mut assembler = ChunkAssembler::new();

        // index >= total
        let mut bad = chunks[0].clone();
        bad[CHUNK_HEADER_PREFIX.len() + CHUNK_NONCE_LEN] = 9;
        assert!(assembler.accept(&bad).is_none());

        // total == 0
        let mut bad = chunks[0].clone();
        bad[CHUNK_HEADER_PREFIX.len() + CHUNK_NONCE_LEN + 1] = 0;
        assert!(assembler.accept(&bad).is_none());

        // Truncated header
        assert!(assembler.accept(&chunks[0][..10]).is_none());

        // The valid chunk still goes through afterwards.
        assert_eq!(assembler.accept(&chunks[0]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_chunks_are_ignored() {
        let payload = vec![9u8; 200];
        let chunks = split_into_chunks(&payload, 128).unwrap();
        assert!(chunks.len() > 1);

        let mut assembler = ChunkAssembler::new();
        assert!(assembler.accept(&chunks[0]).is_none());
        assert!(assembler.accept(&chunks[0]).is_none());
        let mut result = None;
        for chunk in &chunks[1..] {
            result = assembler.accept(chunk);
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn stragglers_are_evicted_fifo() {
        let mut assembler = ChunkAssembler::with_capacity(2);

        // Three incomplete messages; the first should be evicted.
        let first = split_into_chunks(&vec![1u8; 400], 128).unwrap();
        let second = split_into_chunks(&vec![2u8; 400], 128).unwrap();
        let third = split_into_chunks(&vec![3u8; 400], 128).unwrap();

        assert!(assembler.accept(&first[0]).is_none());
        assert!(assembler.accept(&second[0]).is_none());
        assert!(assembler.accept(&third[0]).is_none());
        assert_eq!(assembler.pending_count(), 2);

        // Completing the evicted first message never succeeds.
        let mut result = None;
        for chunk in &first[1..] {
            result = assembler.accept(chunk);
        }
        assert!(result.is_none());
    }

    #[test]
    fn whole_messages_are_not_mistaken_for_chunks() {
        assert!(!is_chunk(br#"{"t":"request","c":1}"#));
        assert!(is_chunk(&split_into_chunks(&[0], 128).unwrap()[0]));
    }
}
