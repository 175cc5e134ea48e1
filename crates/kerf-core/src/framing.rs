//! Transport framing: chunking and reassembly of application messages.
//!
//! A Noise transport message carries at most 65535 bytes including the
//! 16-byte authentication tag, so application messages are split into
//! [`TransportFrame`]s that each fit under that ceiling and reassembled
//! on the far side by chunk id.

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::{KerfError, KerfResult};
use std::collections::HashMap;

/// Maximum size of a single Noise transport message, tag included.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Size of the AES-GCM authentication tag appended by the cipher.
pub const NOISE_TAG_LEN: usize = 16;

/// Maximum Noise plaintext: 65535 - 16 (auth tag) = 65519 bytes.
pub const MAX_NOISE_PAYLOAD: usize = MAX_NOISE_MESSAGE_SIZE - NOISE_TAG_LEN;

/// Upper bound on the CBOR envelope around a frame payload: map header,
/// four field keys, worst-case integer encodings and the byte-string
/// length header. Measured worst case is 65 bytes; 96 leaves slack.
const FRAME_OVERHEAD: usize = 96;

/// Maximum payload carried by one frame.
pub const MAX_CHUNK_PAYLOAD: usize = MAX_NOISE_PAYLOAD - FRAME_OVERHEAD;

/// One fragment of an application message.
///
/// All frames of a message share a random `chunk_id`; `chunk_index`
/// runs over `[0, total_chunks)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransportFrame {
    pub chunk_id: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Split a message into one or more serialized frames.
///
/// Draws a fresh random 64-bit chunk id so that concurrent messages on
/// the same connection cannot collide in the receiver's assembler.
pub fn encode_frames(message: &[u8]) -> KerfResult<Vec<Vec<u8>>> {
    let chunk_id: u64 = rand::random();

    if message.len() <= MAX_CHUNK_PAYLOAD {
        let frame = TransportFrame {
            chunk_id,
            chunk_index: 0,
            total_chunks: 1,
            payload: message.to_vec(),
        };
        return Ok(vec![cbor_encode(&frame)?]);
    }

    let total_chunks = message.len().div_ceil(MAX_CHUNK_PAYLOAD);
    let mut frames = Vec::with_capacity(total_chunks);

    for (i, chunk) in message.chunks(MAX_CHUNK_PAYLOAD).enumerate() {
        let frame = TransportFrame {
            chunk_id,
            chunk_index: i as u32,
            total_chunks: total_chunks as u32,
            payload: chunk.to_vec(),
        };
        frames.push(cbor_encode(&frame)?);
    }

    Ok(frames)
}

/// Decode a single frame from its serialized bytes.
pub fn decode_frame(frame_bytes: &[u8]) -> KerfResult<TransportFrame> {
    cbor_decode(frame_bytes)
}

/// Tracks the chunks of a single message being reassembled.
#[derive(Debug)]
struct MessageAssembly {
    total_chunks: u32,
    chunks: HashMap<u32, Vec<u8>>,
}

impl MessageAssembly {
    fn new(total_chunks: u32) -> Self {
        Self {
            total_chunks,
            chunks: HashMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() as u32 == self.total_chunks
    }

    fn assemble(self) -> Vec<u8> {
        let total_len: usize = self.chunks.values().map(Vec::len).sum();
        let mut message = Vec::with_capacity(total_len);
        let mut chunks = self.chunks;
        for i in 0..self.total_chunks {
            // is_complete() guaranteed every index is present
            if let Some(chunk) = chunks.remove(&i) {
                message.extend(chunk);
            }
        }
        message
    }
}

/// Collects frames from interleaved messages and yields each message
/// once all of its chunks have arrived.
///
/// Assemblies are per-session state; drop the assembler when the
/// session ends.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    assemblies: HashMap<u64, MessageAssembly>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a decoded frame. Returns the complete message once all
    /// chunks are present, `None` otherwise.
    ///
    /// Rejects frames that contradict an in-progress assembly: a
    /// different `total_chunks` for the same id, an out-of-range index,
    /// or a repeated index with a different payload. An exact duplicate
    /// is dropped silently.
    pub fn process(&mut self, frame: TransportFrame) -> KerfResult<Option<Vec<u8>>> {
        if frame.total_chunks == 0 {
            return Err(KerfError::InconsistentFrame(format!(
                "frame {:#018x} declares zero chunks",
                frame.chunk_id
            )));
        }
        if frame.chunk_index >= frame.total_chunks {
            return Err(KerfError::InconsistentFrame(format!(
                "chunk index {} out of range (total {})",
                frame.chunk_index, frame.total_chunks
            )));
        }

        let assembly = self
            .assemblies
            .entry(frame.chunk_id)
            .or_insert_with(|| MessageAssembly::new(frame.total_chunks));

        if assembly.total_chunks != frame.total_chunks {
            let id = frame.chunk_id;
            self.assemblies.remove(&id);
            return Err(KerfError::InconsistentFrame(format!(
                "total chunks changed mid-message for {id:#018x}"
            )));
        }

        if let Some(existing) = assembly.chunks.get(&frame.chunk_index) {
            if *existing == frame.payload {
                // Retransmit of a chunk we already have.
                return Ok(None);
            }
            let id = frame.chunk_id;
            self.assemblies.remove(&id);
            return Err(KerfError::InconsistentFrame(format!(
                "conflicting payload for chunk {} of {id:#018x}",
                frame.chunk_index
            )));
        }

        assembly.chunks.insert(frame.chunk_index, frame.payload);

        if assembly.is_complete() {
            let assembly = self
                .assemblies
                .remove(&frame.chunk_id)
                .ok_or_else(|| KerfError::Other("assembly vanished".into()))?;
            return Ok(Some(assembly.assemble()));
        }

        Ok(None)
    }

    /// Number of messages currently being assembled.
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }
}
