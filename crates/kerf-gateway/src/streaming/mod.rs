//! Streaming uploads: per-request ordered write paths with bounded
//! buffering.
//!
//! A streaming request delivers its body as chunks spread over many
//! envelopes. Each in-flight upload has a [`StreamContext`] that orders
//! chunks by sequence number and writes them into a sink; the
//! per-connection [`StreamRegistry`] tracks active contexts and buffers
//! chunks that arrive before the handler installs one.

mod context;
mod registry;

pub use context::{ChunkSink, StreamContext};
pub use registry::StreamRegistry;

use thiserror::Error;

/// Errors raised on the upload write path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream {0} is already completed")]
    StreamClosed(u64),

    #[error("too many active streams")]
    TooManyActiveStreams,

    #[error("too many pending chunks for stream {0}")]
    TooManyPendingChunks(u64),

    #[error("too many out-of-order chunks for stream {0}")]
    TooManyOutOfOrder(u64),

    #[error("stream {id} exceeded maximum size of {max} bytes")]
    StreamTooLarge { id: u64, max: u64 },

    #[error("sink closed for stream {0}")]
    SinkClosed(u64),
}

/// Bounds applied by the registry and its contexts.
///
/// `max_pending_chunks` bounds buffering per id before a stream is
/// created; `max_out_of_order` bounds reordering after. The two limits
/// are independent.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    /// Streams with an installed sink, per connection.
    pub max_active_streams: usize,
    /// Distinct ids with buffered chunks awaiting stream creation.
    pub max_pending_streams: usize,
    /// Buffered chunks per id awaiting stream creation.
    pub max_pending_chunks: usize,
    /// Out-of-order chunks buffered inside one context.
    pub max_out_of_order: usize,
    /// Total bytes accepted by one stream.
    pub max_stream_bytes: u64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_active_streams: 10,
            max_pending_streams: 16,
            max_pending_chunks: 256,
            max_out_of_order: 64,
            max_stream_bytes: 50 * 1024 * 1024,
        }
    }
}
