//! Splitting oversize messages into chunks and reassembling them.
//!
//! A logical message larger than the frame cap is split into chunk frames of
//! `(msg_id: u32, num_chunks: u8, seq_num: u8, payload_len: u16, payload)`.
//! The receiving side buffers chunks per message id and returns the
//! reassembled message once all pieces arrived. Partial messages expire
//! after five minutes; a background sweeper reclaims them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::wire::io;

/// Size of the chunk frame header: msg id, chunk count, sequence number and
/// the 16-bit payload length prefix.
pub const CHUNK_HEADER_SIZE: usize = 4 + 1 + 1 + 2;

const MAX_TTL: Duration = Duration::from_secs(5 * 60);
const GC_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ChopError {
    #[error("bad chunk frame header")]
    BadHeader,

    #[error("chunk payload longer than capacity")]
    ChunkTooLong,

    #[error("chunk sequence number out of range")]
    BadSeqNumber,

    #[error("non-final chunk shorter than capacity")]
    BadChunkSize,

    #[error("chunk count does not match the message in progress")]
    NumChunksMismatch,

    #[error("repeating sequence number")]
    RepeatedSeqNumber,
}

struct MsgChunk {
    msg_id: u32,
    num_chunks: u8,
    seq_num: u8,
    data: Vec<u8>,
}

impl MsgChunk {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + self.data.len());
        io::write_u32(&mut buf, self.msg_id);
        io::write_u8(&mut buf, self.num_chunks);
        io::write_u8(&mut buf, self.seq_num);
        io::write_bytes16(&mut buf, &self.data);
        buf
    }

    fn decode(frame: &[u8], capacity: usize) -> Result<MsgChunk, ChopError> {
        let mut r = frame;
        let msg_id = io::read_u32(&mut r).map_err(|_| ChopError::BadHeader)?;
        let num_chunks = io::read_u8(&mut r).map_err(|_| ChopError::BadHeader)?;
        let seq_num = io::read_u8(&mut r).map_err(|_| ChopError::BadHeader)?;
        let data = io::read_bytes16(&mut r).map_err(|_| ChopError::BadHeader)?;

        if seq_num >= num_chunks {
            return Err(ChopError::BadSeqNumber);
        }
        if data.len() > capacity {
            return Err(ChopError::ChunkTooLong);
        }
        if data.len() != capacity && seq_num != num_chunks - 1 {
            return Err(ChopError::BadChunkSize);
        }
        Ok(MsgChunk {
            msg_id,
            num_chunks,
            seq_num,
            data,
        })
    }
}

struct DataInProgress {
    buffer: Vec<Option<Vec<u8>>>,
    ttl: Instant,
    num_received: usize,
}

struct ChopperState {
    next_msg_id: u32,
    in_progress: HashMap<u32, DataInProgress>,
}

/// One chopper instance per link: message ids are scoped to the sender, so
/// reassembly state must not be shared between connections.
#[derive(Clone)]
pub struct Chopper {
    state: Arc<Mutex<ChopperState>>,
}

impl Default for Chopper {
    fn default() -> Self {
        Self::new()
    }
}

impl Chopper {
    pub fn new() -> Self {
        Chopper {
            state: Arc::new(Mutex::new(ChopperState {
                next_msg_id: 0,
                in_progress: HashMap::new(),
            })),
        }
    }

    fn next_msg_id(&self) -> u32 {
        let mut state = self.state.lock();
        state.next_msg_id = state.next_msg_id.wrapping_add(1);
        state.next_msg_id
    }

    /// Split `data` into chunk frames no longer than `max_frame` each.
    /// Returns `None` when the data already fits one frame. Panics when the
    /// data cannot be represented in 255 chunks: callers bound their
    /// payloads before chopping.
    pub fn chop_data(&self, data: &[u8], max_frame: usize) -> Option<Vec<Vec<u8>>> {
        if data.len() <= max_frame {
            return None;
        }
        assert!(max_frame > CHUNK_HEADER_SIZE, "frame cap below header size");
        let capacity = max_frame - CHUNK_HEADER_SIZE;
        assert!(data.len() <= capacity * 255, "too long data to chop");

        let num_chunks = data.len().div_ceil(capacity);
        assert!(num_chunks >= 2, "chop of data that fits one frame");

        let msg_id = self.next_msg_id();
        let mut ret = Vec::with_capacity(num_chunks);
        for (i, piece) in data.chunks(capacity).enumerate() {
            let frame = MsgChunk {
                msg_id,
                num_chunks: num_chunks as u8,
                seq_num: i as u8,
                data: piece.to_vec(),
            }
            .encode();
            assert!(frame.len() <= max_frame, "chunk frame exceeds cap");
            ret.push(frame);
        }
        Some(ret)
    }

    /// Feed one received chunk frame. Returns the reassembled message on the
    /// call that completes it, `None` while pieces are still missing.
    pub fn incoming_chunk(
        &self,
        frame: &[u8],
        max_frame: usize,
    ) -> Result<Option<Vec<u8>>, ChopError> {
        let capacity = max_frame - CHUNK_HEADER_SIZE;
        let chunk = MsgChunk::decode(frame, capacity)?;

        let mut state = self.state.lock();
        let dip = state
            .in_progress
            .entry(chunk.msg_id)
            .or_insert_with(|| DataInProgress {
                buffer: vec![None; chunk.num_chunks as usize],
                ttl: Instant::now() + MAX_TTL,
                num_received: 0,
            });

        if dip.buffer.len() != chunk.num_chunks as usize {
            return Err(ChopError::NumChunksMismatch);
        }
        let slot = &mut dip.buffer[chunk.seq_num as usize];
        if slot.is_some() {
            return Err(ChopError::RepeatedSeqNumber);
        }
        *slot = Some(chunk.data);
        dip.num_received += 1;

        if dip.num_received != dip.buffer.len() {
            return Ok(None);
        }

        let dip = state.in_progress.remove(&chunk.msg_id).unwrap();
        let mut ret = Vec::new();
        for piece in dip.buffer {
            ret.extend_from_slice(&piece.unwrap());
        }
        Ok(Some(ret))
    }

    /// Background garbage collector for expired partial messages.
    pub fn spawn_gc(&self, token: CancellationToken) -> JoinHandle<()> {
        let chopper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_PERIOD);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => chopper.sweep(Instant::now()),
                }
            }
        })
    }

    fn sweep(&self, now: Instant) {
        let mut state = self.state.lock();
        let before = state.in_progress.len();
        state.in_progress.retain(|_, dip| dip.ttl > now);
        let dropped = before - state.in_progress.len();
        if dropped > 0 {
            tracing::debug!("dropped {} expired partial message(s)", dropped);
        }
    }

    #[cfg(test)]
    fn in_progress_count(&self) -> usize {
        self.state.lock().in_progress.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::framing::MAX_MESSAGE_SIZE;
    use rand::RngCore;

    const MAX_CHUNK_SIZE: usize = MAX_MESSAGE_SIZE - 3;

    fn random_data(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn assert_frames_bounded(chunks: &[Vec<u8>], max_frame: usize) {
        for c in chunks {
            assert!(c.len() <= max_frame);
        }
    }

    #[test]
    fn test_short_data_not_chopped() {
        let c = Chopper::new();
        assert!(c.chop_data(&random_data(2000), MAX_CHUNK_SIZE).is_none());
        assert!(c
            .chop_data(&random_data(MAX_CHUNK_SIZE), MAX_CHUNK_SIZE)
            .is_none());
    }

    #[test]
    fn test_boundary_plus_one_chopped_in_two() {
        let c = Chopper::new();
        let data = random_data(MAX_CHUNK_SIZE + 1);
        let chunks = c.chop_data(&data, MAX_CHUNK_SIZE).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_frames_bounded(&chunks, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_exact_multiple_chopped() {
        let c = Chopper::new();
        let data = random_data(3 * MAX_CHUNK_SIZE);
        let chunks = c.chop_data(&data, MAX_CHUNK_SIZE).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_frames_bounded(&chunks, MAX_CHUNK_SIZE);

        let mut result = None;
        for piece in &chunks {
            let ret = c.incoming_chunk(piece, MAX_CHUNK_SIZE).unwrap();
            if let Some(full) = ret {
                assert!(result.is_none(), "reassembled more than once");
                result = Some(full);
            }
        }
        assert_eq!(result.unwrap(), data);
    }

    #[test]
    fn test_reassemble_in_reverse_order() {
        let c = Chopper::new();
        let data = random_data(1_000_000);
        let chunks = c.chop_data(&data, MAX_CHUNK_SIZE).unwrap();
        assert!(chunks.len() >= 2);
        assert_frames_bounded(&chunks, MAX_CHUNK_SIZE);

        let mut result = None;
        for piece in chunks.iter().rev() {
            let ret = c.incoming_chunk(piece, MAX_CHUNK_SIZE).unwrap();
            if let Some(full) = ret {
                assert!(result.is_none(), "reassembled more than once");
                result = Some(full);
            }
        }
        assert_eq!(result.unwrap(), data);
        assert_eq!(c.in_progress_count(), 0);
    }

    #[test]
    fn test_repeated_seq_number_rejected() {
        let c = Chopper::new();
        let data = random_data(3 * MAX_CHUNK_SIZE);
        let chunks = c.chop_data(&data, MAX_CHUNK_SIZE).unwrap();

        assert!(c.incoming_chunk(&chunks[0], MAX_CHUNK_SIZE).unwrap().is_none());
        assert!(matches!(
            c.incoming_chunk(&chunks[0], MAX_CHUNK_SIZE),
            Err(ChopError::RepeatedSeqNumber)
        ));
    }

    #[test]
    fn test_bad_seq_number_rejected() {
        let c = Chopper::new();
        let frame = MsgChunk {
            msg_id: 1,
            num_chunks: 2,
            seq_num: 2,
            data: vec![0u8; 10],
        }
        .encode();
        assert!(matches!(
            c.incoming_chunk(&frame, MAX_CHUNK_SIZE),
            Err(ChopError::BadSeqNumber)
        ));
    }

    #[test]
    fn test_short_middle_chunk_rejected() {
        let c = Chopper::new();
        let frame = MsgChunk {
            msg_id: 1,
            num_chunks: 3,
            seq_num: 0,
            data: vec![0u8; 10], // not the full capacity
        }
        .encode();
        assert!(matches!(
            c.incoming_chunk(&frame, MAX_CHUNK_SIZE),
            Err(ChopError::BadChunkSize)
        ));
    }

    #[test]
    fn test_sweep_expires_partial_messages() {
        let c = Chopper::new();
        let data = random_data(3 * MAX_CHUNK_SIZE);
        let chunks = c.chop_data(&data, MAX_CHUNK_SIZE).unwrap();
        assert!(c.incoming_chunk(&chunks[0], MAX_CHUNK_SIZE).unwrap().is_none());
        assert_eq!(c.in_progress_count(), 1);

        c.sweep(Instant::now());
        assert_eq!(c.in_progress_count(), 1);

        c.sweep(Instant::now() + MAX_TTL + Duration::from_secs(1));
        assert_eq!(c.in_progress_count(), 0);
    }

    #[test]
    #[should_panic(expected = "too long data to chop")]
    fn test_oversize_data_panics() {
        let c = Chopper::new();
        let max_frame = 100;
        let data = vec![0u8; (max_frame - CHUNK_HEADER_SIZE) * 255 + 1];
        let _ = c.chop_data(&data, max_frame);
    }
}
