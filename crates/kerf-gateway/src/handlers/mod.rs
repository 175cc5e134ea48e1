//! Upstream request handlers.

mod chat;
mod extract;
mod ping;

pub use chat::ChatCompletionsHandler;
pub use extract::DocumentExtractionHandler;
pub use ping::PingHandler;

use crate::router::{BodyStream, HandlerError};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Adapt a channel of body slices into a handler body stream. Handlers
/// that produce their output on a spawned task feed the sender and hand
/// the receiver to the dispatcher.
pub(crate) fn body_from_receiver(
    rx: mpsc::UnboundedReceiver<Result<Bytes, HandlerError>>,
) -> BodyStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}
