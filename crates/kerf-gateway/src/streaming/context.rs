//! State of a single streaming upload.

use super::{StreamError, StreamLimits};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};

/// The write end of the pipe feeding an upstream request body. Dropping
/// every sender ends the body; a dropped receiver makes writes fail
/// fast instead of blocking on a full pipe.
pub type ChunkSink = mpsc::Sender<Bytes>;

#[derive(Debug)]
struct BufferedChunk {
    data: Bytes,
    is_final: bool,
}

#[derive(Debug)]
struct ContextInner {
    /// Present until the stream completes or is cancelled.
    sink: Option<ChunkSink>,
    next_expected_seq: u32,
    total_bytes: u64,
    pending: BTreeMap<u32, BufferedChunk>,
    completed: bool,
}

/// Receives the chunks of one upload and writes them to a sink in
/// sequence order. Out-of-order chunks are buffered up to a cap;
/// duplicates of already-written sequence numbers are ignored so
/// clients may retransmit safely.
#[derive(Debug)]
pub struct StreamContext {
    request_id: u64,
    limits: StreamLimits,
    inner: Mutex<ContextInner>,
    /// Mirrors `inner.completed` for lock-free reads.
    completed: AtomicBool,
}

impl StreamContext {
    pub fn new(request_id: u64, sink: ChunkSink, limits: StreamLimits) -> Self {
        Self {
            request_id,
            limits,
            inner: Mutex::new(ContextInner {
                sink: Some(sink),
                next_expected_seq: 0,
                total_bytes: 0,
                pending: BTreeMap::new(),
                completed: false,
            }),
            completed: AtomicBool::new(false),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// True once the stream has completed or been cancelled.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Write one chunk. Mutations are serialized by the inner lock.
    ///
    /// In-order chunks go straight to the sink and drain any contiguous
    /// buffered successors; a final chunk completes the stream and
    /// closes the sink.
    pub async fn write(&self, data: Bytes, seq: u32, is_final: bool) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;

        if inner.completed {
            return Err(StreamError::StreamClosed(self.request_id));
        }

        if seq > inner.next_expected_seq {
            if inner.pending.len() >= self.limits.max_out_of_order {
                return Err(StreamError::TooManyOutOfOrder(self.request_id));
            }
            inner.pending.insert(seq, BufferedChunk { data, is_final });
            return Ok(());
        }

        if seq < inner.next_expected_seq {
            // Duplicate of a chunk we already wrote.
            return Ok(());
        }

        let mut current = BufferedChunk { data, is_final };

        loop {
            inner.total_bytes += current.data.len() as u64;
            if inner.total_bytes > self.limits.max_stream_bytes {
                return Err(StreamError::StreamTooLarge {
                    id: self.request_id,
                    max: self.limits.max_stream_bytes,
                });
            }

            let sink = inner
                .sink
                .as_ref()
                .ok_or(StreamError::StreamClosed(self.request_id))?;
            sink.send(current.data)
                .await
                .map_err(|_| StreamError::SinkClosed(self.request_id))?;

            inner.next_expected_seq += 1;

            if current.is_final {
                inner.completed = true;
                inner.sink = None;
                inner.pending.clear();
                self.completed.store(true, Ordering::Release);
                return Ok(());
            }

            let next = inner.next_expected_seq;
            match inner.pending.remove(&next) {
                Some(chunk) => current = chunk,
                None => return Ok(()),
            }
        }
    }

    /// Mark the stream complete and close the sink without writing.
    pub async fn complete(&self) {
        let mut inner = self.inner.lock().await;
        if inner.completed {
            return;
        }
        inner.completed = true;
        inner.sink = None;
        inner.pending.clear();
        self.completed.store(true, Ordering::Release);
    }

    /// Cancel the stream: same terminal state as `complete`, named for
    /// the error paths.
    pub async fn cancel(&self) {
        self.complete().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (ChunkSink, mpsc::Receiver<Bytes>) {
        mpsc::channel(64)
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut collected = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            collected.extend_from_slice(&chunk);
        }
        collected
    }

    fn context(sink: ChunkSink) -> StreamContext {
        StreamContext::new(7, sink, StreamLimits::default())
    }

    #[tokio::test]
    async fn in_order_chunks_pass_through() {
        let (sink, mut rx) = collector();
        let ctx = context(sink);

        ctx.write(Bytes::from_static(b"ab"), 0, false).await.unwrap();
        ctx.write(Bytes::from_static(b"cd"), 1, true).await.unwrap();

        assert_eq!(drain(&mut rx), b"abcd");
        assert!(ctx.is_completed());
    }

    #[tokio::test]
    async fn out_of_order_chunks_are_reordered() {
        let (sink, mut rx) = collector();
        let ctx = context(sink);

        ctx.write(Bytes::from_static(b"C"), 2, true).await.unwrap();
        ctx.write(Bytes::from_static(b"A"), 0, false).await.unwrap();
        ctx.write(Bytes::from_static(b"B"), 1, false).await.unwrap();

        assert_eq!(drain(&mut rx), b"ABC");
        assert!(ctx.is_completed());
    }

    #[tokio::test]
    async fn duplicate_seq_ignored() {
        let (sink, mut rx) = collector();
        let ctx = context(sink);

        ctx.write(Bytes::from_static(b"x"), 0, false).await.unwrap();
        ctx.write(Bytes::from_static(b"y"), 0, false).await.unwrap();
        ctx.write(Bytes::from_static(b"z"), 1, true).await.unwrap();

        assert_eq!(drain(&mut rx), b"xz");
    }

    #[tokio::test]
    async fn write_after_completion_fails() {
        let (sink, _rx) = collector();
        let ctx = context(sink);

        ctx.write(Bytes::from_static(b"end"), 0, true).await.unwrap();
        let result = ctx.write(Bytes::from_static(b"late"), 1, false).await;
        assert_eq!(result, Err(StreamError::StreamClosed(7)));
    }

    #[tokio::test]
    async fn out_of_order_buffer_is_bounded() {
        let (sink, _rx) = collector();
        let limits = StreamLimits {
            max_out_of_order: 64,
            ..StreamLimits::default()
        };
        let ctx = StreamContext::new(7, sink, limits);

        // Sequence 0 never arrives, so every chunk buffers.
        for seq in 1..=64 {
            ctx.write(Bytes::from_static(b"q"), seq, false).await.unwrap();
        }
        let result = ctx.write(Bytes::from_static(b"q"), 65, false).await;
        assert_eq!(result, Err(StreamError::TooManyOutOfOrder(7)));
    }

    #[tokio::test]
    async fn byte_cap_is_exact() {
        let (sink, _rx) = collector();
        let limits = StreamLimits {
            max_stream_bytes: 16,
            ..StreamLimits::default()
        };
        let ctx = StreamContext::new(7, sink, limits);

        // Exactly at the cap: accepted.
        ctx.write(Bytes::from(vec![0u8; 16]), 0, false).await.unwrap();
        // One byte over: rejected.
        let result = ctx.write(Bytes::from_static(b"!"), 1, false).await;
        assert_eq!(
            result,
            Err(StreamError::StreamTooLarge { id: 7, max: 16 })
        );
    }

    #[test]
    fn default_byte_cap_is_fifty_mebibytes() {
        assert_eq!(StreamLimits::default().max_stream_bytes, 50 * 1024 * 1024);
    }

    #[tokio::test]
    async fn dropped_receiver_fails_writes_fast() {
        let (sink, rx) = collector();
        let ctx = context(sink);
        drop(rx);

        let result = ctx.write(Bytes::from_static(b"data"), 0, false).await;
        assert_eq!(result, Err(StreamError::SinkClosed(7)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_terminal() {
        let (sink, _rx) = collector();
        let ctx = context(sink);

        ctx.cancel().await;
        ctx.cancel().await;
        assert!(ctx.is_completed());
        assert_eq!(
            ctx.write(Bytes::from_static(b"late"), 0, false).await,
            Err(StreamError::StreamClosed(7))
        );
    }

    #[tokio::test]
    async fn final_out_of_order_chunk_completes_after_drain() {
        let (sink, mut rx) = collector();
        let ctx = context(sink);

        ctx.write(Bytes::from_static(b"2"), 2, true).await.unwrap();
        ctx.write(Bytes::from_static(b"1"), 1, false).await.unwrap();
        assert!(!ctx.is_completed());

        ctx.write(Bytes::from_static(b"0"), 0, false).await.unwrap();
        assert_eq!(drain(&mut rx), b"012");
        assert!(ctx.is_completed());
    }
}
