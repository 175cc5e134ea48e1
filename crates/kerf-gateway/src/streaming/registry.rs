//! Tracks the streaming uploads of a single connection.
//!
//! Chunks may arrive before the handler has created their stream; the
//! registry buffers those in insertion order and replays them when the
//! stream appears, closing the race between handler setup and the
//! first network bytes.

use super::context::{ChunkSink, StreamContext};
use super::{StreamError, StreamLimits};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug)]
struct PendingChunk {
    data: Bytes,
    seq: u32,
    is_final: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    streams: HashMap<u64, Arc<StreamContext>>,
    pending: HashMap<u64, VecDeque<PendingChunk>>,
    /// Ids of `pending` in insertion order, oldest first.
    pending_order: VecDeque<u64>,
}

/// Per-connection map from request id to its upload stream, plus the
/// bounded buffers for early chunks. Each connection owns one instance.
#[derive(Debug)]
pub struct StreamRegistry {
    limits: StreamLimits,
    inner: Mutex<RegistryInner>,
}

impl StreamRegistry {
    pub fn new(limits: StreamLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Create a stream for the given request id and replay any chunks
    /// that arrived before it existed, in their buffered order.
    pub async fn create_stream(
        &self,
        request_id: u64,
        sink: ChunkSink,
    ) -> Result<Arc<StreamContext>, StreamError> {
        let ctx = Arc::new(StreamContext::new(request_id, sink, self.limits));

        let pending = {
            let mut inner = self.inner.lock().await;
            if inner.streams.len() >= self.limits.max_active_streams {
                return Err(StreamError::TooManyActiveStreams);
            }
            inner.streams.insert(request_id, ctx.clone());
            inner.pending_order.retain(|id| *id != request_id);
            inner.pending.remove(&request_id)
        };

        if let Some(pending) = pending {
            for chunk in pending {
                ctx.write(chunk.data, chunk.seq, chunk.is_final).await?;
            }
            if ctx.is_completed() {
                self.inner.lock().await.streams.remove(&request_id);
            }
        }

        Ok(ctx)
    }

    /// Route a chunk to its stream, or buffer it if the stream does not
    /// exist yet.
    pub async fn handle_chunk(
        &self,
        request_id: u64,
        data: Bytes,
        seq: u32,
        is_final: bool,
    ) -> Result<(), StreamError> {
        let ctx = {
            let mut inner = self.inner.lock().await;

            match inner.streams.get(&request_id) {
                Some(ctx) => ctx.clone(),
                None => {
                    return Self::buffer_chunk(
                        &mut inner,
                        &self.limits,
                        request_id,
                        PendingChunk {
                            data,
                            seq,
                            is_final,
                        },
                    );
                }
            }
        };

        ctx.write(data, seq, is_final).await?;

        if ctx.is_completed() {
            self.inner.lock().await.streams.remove(&request_id);
        }

        Ok(())
    }

    fn buffer_chunk(
        inner: &mut RegistryInner,
        limits: &StreamLimits,
        request_id: u64,
        chunk: PendingChunk,
    ) -> Result<(), StreamError> {
        if !inner.pending.contains_key(&request_id) {
            inner.pending_order.push_back(request_id);
        }
        let queue = inner.pending.entry(request_id).or_default();

        if queue.len() >= limits.max_pending_chunks {
            inner.pending.remove(&request_id);
            inner.pending_order.retain(|id| *id != request_id);
            warn!(request_id, "too many pending chunks, dropping all");
            return Err(StreamError::TooManyPendingChunks(request_id));
        }

        queue.push_back(chunk);

        // Inserting a new id may push the map over the bound: evict the
        // least-recently-inserted id wholesale.
        if inner.pending.len() > limits.max_pending_streams {
            if let Some(evicted) = inner.pending_order.pop_front() {
                inner.pending.remove(&evicted);
                warn!(
                    request_id = evicted,
                    "evicting pending chunks (too many pending streams)"
                );
            }
        }

        Ok(())
    }

    /// Cancel one stream and drop any chunks buffered for it.
    pub async fn cancel_stream(&self, request_id: u64) {
        let ctx = {
            let mut inner = self.inner.lock().await;
            inner.pending.remove(&request_id);
            inner.pending_order.retain(|id| *id != request_id);
            inner.streams.remove(&request_id)
        };

        if let Some(ctx) = ctx {
            ctx.cancel().await;
        }
    }

    /// Cancel everything; called when the connection closes.
    pub async fn cancel_all(&self) {
        let contexts: Vec<Arc<StreamContext>> = {
            let mut inner = self.inner.lock().await;
            inner.pending.clear();
            inner.pending_order.clear();
            inner.streams.drain().map(|(_, ctx)| ctx).collect()
        };

        for ctx in contexts {
            if !ctx.is_completed() {
                ctx.cancel().await;
            }
        }
    }

    /// Number of streams with an installed sink.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.streams.len()
    }

    /// Number of ids with buffered chunks awaiting stream creation.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry() -> StreamRegistry {
        StreamRegistry::new(StreamLimits::default())
    }

    fn collector() -> (ChunkSink, mpsc::Receiver<Bytes>) {
        mpsc::channel(512)
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut collected = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            collected.extend_from_slice(&chunk);
        }
        collected
    }

    #[tokio::test]
    async fn create_then_write() {
        let registry = registry();
        let (sink, mut rx) = collector();

        let ctx = registry.create_stream(1, sink).await.unwrap();
        assert_eq!(ctx.request_id(), 1);

        registry
            .handle_chunk(1, Bytes::from_static(b"hello"), 0, false)
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), b"hello");
    }

    #[tokio::test]
    async fn pending_chunks_replay_in_registration_order() {
        let registry = registry();

        registry
            .handle_chunk(9, Bytes::from_static(b"A"), 0, false)
            .await
            .unwrap();
        registry
            .handle_chunk(9, Bytes::from_static(b"B"), 1, true)
            .await
            .unwrap();

        let (sink, mut rx) = collector();
        let ctx = registry.create_stream(9, sink).await.unwrap();

        assert_eq!(drain(&mut rx), b"AB");
        assert!(ctx.is_completed());
        // The replay completed the stream, so the id must not linger in
        // the active map.
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn pending_chunk_queue_is_bounded() {
        let registry = registry();

        for seq in 0..256 {
            registry
                .handle_chunk(1, Bytes::from_static(b"x"), seq, false)
                .await
                .unwrap();
        }

        let result = registry
            .handle_chunk(1, Bytes::from_static(b"overflow"), 256, true)
            .await;
        assert_eq!(result, Err(StreamError::TooManyPendingChunks(1)));

        // The whole queue was dropped with the failure.
        let (sink, mut rx) = collector();
        registry.create_stream(1, sink).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn seventeenth_pending_id_evicts_oldest() {
        let registry = registry();

        for id in 1..=16u64 {
            registry
                .handle_chunk(id, Bytes::from_static(b"data"), 0, false)
                .await
                .unwrap();
        }
        assert_eq!(registry.pending_count().await, 16);

        registry
            .handle_chunk(17, Bytes::from_static(b"data"), 0, false)
            .await
            .unwrap();
        assert_eq!(registry.pending_count().await, 16);

        // Id 1 was evicted: creating its stream replays nothing.
        let (sink, mut rx) = collector();
        registry.create_stream(1, sink).await.unwrap();
        assert!(drain(&mut rx).is_empty());

        // Id 17 still has its chunk.
        let (sink, mut rx) = collector();
        registry.create_stream(17, sink).await.unwrap();
        assert_eq!(drain(&mut rx), b"data");
    }

    #[tokio::test]
    async fn active_streams_are_bounded() {
        let registry = registry();

        for id in 1..=10u64 {
            let (sink, _rx) = collector();
            registry.create_stream(id, sink).await.unwrap();
        }

        let (sink, _rx) = collector();
        let result = registry.create_stream(11, sink).await;
        assert!(matches!(result, Err(StreamError::TooManyActiveStreams)));
    }

    #[tokio::test]
    async fn final_chunk_frees_the_active_slot() {
        let registry = registry();
        let (sink, _rx) = collector();
        registry.create_stream(1, sink).await.unwrap();

        registry
            .handle_chunk(1, Bytes::from_static(b"done"), 0, true)
            .await
            .unwrap();
        assert_eq!(registry.active_count().await, 0);

        // The id is reusable afterwards.
        let (sink, mut rx) = collector();
        registry.create_stream(1, sink).await.unwrap();
        registry
            .handle_chunk(1, Bytes::from_static(b"again"), 0, true)
            .await
            .unwrap();
        assert_eq!(drain(&mut rx), b"again");
    }

    #[tokio::test]
    async fn cancel_stream_is_terminal_for_its_context() {
        let registry = registry();
        let (sink, _rx) = collector();
        let ctx = registry.create_stream(1, sink).await.unwrap();

        registry.cancel_stream(1).await;
        assert!(ctx.is_completed());
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn cancel_unknown_stream_is_a_no_op() {
        registry().cancel_stream(999).await;
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_context_and_clears_pending() {
        let registry = registry();
        let (sink1, _rx1) = collector();
        let (sink2, _rx2) = collector();
        let ctx1 = registry.create_stream(1, sink1).await.unwrap();
        let ctx2 = registry.create_stream(2, sink2).await.unwrap();
        registry
            .handle_chunk(3, Bytes::from_static(b"pending"), 0, false)
            .await
            .unwrap();

        registry.cancel_all().await;

        assert!(ctx1.is_completed());
        assert!(ctx2.is_completed());
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(registry.pending_count().await, 0);

        let (sink, mut rx) = collector();
        registry.create_stream(3, sink).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn out_of_order_upload_collects_in_sequence() {
        let registry = registry();
        let (sink, mut rx) = collector();
        let ctx = registry.create_stream(7, sink).await.unwrap();

        registry
            .handle_chunk(7, Bytes::from_static(b"two"), 2, true)
            .await
            .unwrap();
        registry
            .handle_chunk(7, Bytes::from_static(b"zero"), 0, false)
            .await
            .unwrap();
        registry
            .handle_chunk(7, Bytes::from_static(b"one"), 1, false)
            .await
            .unwrap();

        assert_eq!(drain(&mut rx), b"zeroonetwo");
        assert!(ctx.is_completed());
    }
}
