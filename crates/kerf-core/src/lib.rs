//! kerf-core: Shared protocol library for the kerf gateway.
//!
//! Provides the CBOR wire types exchanged inside the encrypted tunnel
//! (transport frames and request/response envelopes), the frame
//! assembler that reassembles chunked messages, and HMAC-signed bearer
//! tokens used to authorize the websocket upgrade.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode};
pub use envelope::{RequestEnvelope, ResponseEnvelope, StreamChunk};
pub use error::{KerfError, KerfResult};
pub use framing::{FrameAssembler, TransportFrame, MAX_CHUNK_PAYLOAD, MAX_NOISE_MESSAGE_SIZE};
pub use token::{generate_token, verify_token, AuthClaims};
