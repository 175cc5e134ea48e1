//! Routing and request dispatch.
//!
//! Every decoded application message is either a continuation chunk
//! (handed to the stream registry) or an initiating request (routed and
//! run on its own task so a slow handler never blocks newer requests on
//! the same connection). Handler outcomes are translated into response
//! envelopes and pushed onto the connection's serialized outbound
//! writer.

use crate::streaming::StreamRegistry;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use kerf_core::envelope::{self, RequestEnvelope, ResponseEnvelope, StreamChunk};
use kerf_core::{KerfError, KerfResult};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A routing key. Matching is exact on both fields; there are no path
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub verb: String,
    pub path: String,
}

impl Route {
    pub fn new(verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.verb, self.path)
    }
}

/// An initiating request as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub verb: String,
    pub path: String,
    pub body: Option<String>,
    /// First data slice of a streaming upload, when present. The
    /// handler should create a stream for its id and feed this chunk
    /// through the registry.
    pub chunk: Option<StreamChunk>,
}

/// A request error surfaced to the client: numeric status plus a short
/// message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub status: u16,
    pub message: String,
}

impl HandlerError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}

/// Body of a streaming response: each item becomes one envelope.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, HandlerError>> + Send>>;

/// What a handler produced.
pub enum HandlerResponse {
    /// One response envelope.
    Single { status: u16, body: String },
    /// A sequence of 200 envelopes sharing the request id, ended by an
    /// empty marker envelope.
    Streaming {
        headers: HashMap<String, String>,
        body: BodyStream,
    },
}

impl std::fmt::Debug for HandlerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single { status, body } => f
                .debug_struct("Single")
                .field("status", status)
                .field("body", body)
                .finish(),
            Self::Streaming { headers, .. } => f
                .debug_struct("Streaming")
                .field("headers", headers)
                .field("body", &"<stream>")
                .finish(),
        }
    }
}

pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HandlerResponse, HandlerError>> + Send + 'a>>;

/// The shape implemented by every upstream adapter. Handlers never
/// write to the socket; they return a response value or fail with a
/// status.
pub trait RequestHandler: Send + Sync {
    fn handle<'a>(&'a self, request: Request, registry: Arc<StreamRegistry>) -> HandlerFuture<'a>;
}

/// Immutable verb/path → handler mapping, installed at startup.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<Route, Arc<dyn RequestHandler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, route: Route, handler: Arc<dyn RequestHandler>) {
        self.routes.insert(route, handler);
    }

    pub fn get(&self, route: &Route) -> Option<&Arc<dyn RequestHandler>> {
        self.routes.get(route)
    }
}

/// An item bound for the connection's outbound writer.
#[derive(Debug)]
pub enum Outbound {
    Envelope(ResponseEnvelope),
    /// Close the websocket with the given code after flushing queued
    /// envelopes.
    Close { code: u16, reason: &'static str },
}

/// Handle for pushing response envelopes onto the outbound writer. The
/// writer never blocks the sender; backpressure lives in the Noise send
/// path.
#[derive(Clone)]
pub struct ResponseSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ResponseSender {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn send(&self, envelope: ResponseEnvelope) {
        // A closed channel means the connection is tearing down.
        let _ = self.tx.send(Outbound::Envelope(envelope));
    }

    pub fn error(&self, id: u64, status: u16, message: &str) {
        self.send(ResponseEnvelope::error(id, status, message));
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.tx.send(Outbound::Close { code, reason });
    }
}

/// Authorization snapshot captured from the upgrade-time token.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthSnapshot {
    pub subscribed: bool,
    pub token_expiry: Option<SystemTime>,
}

impl AuthSnapshot {
    /// Free-tier clients lose access when their token expires;
    /// subscribed clients bypass the check for the life of the
    /// connection.
    fn is_expired(&self) -> bool {
        if self.subscribed {
            return false;
        }
        match self.token_expiry {
            Some(expiry) => SystemTime::now() > expiry,
            None => false,
        }
    }
}

/// Classifies decoded application messages and runs handlers, one task
/// per initiating request.
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    registry: Arc<StreamRegistry>,
    responses: ResponseSender,
    auth: AuthSnapshot,
}

impl Dispatcher {
    pub fn new(
        routes: Arc<RouteTable>,
        registry: Arc<StreamRegistry>,
        responses: ResponseSender,
        auth: AuthSnapshot,
    ) -> Self {
        Self {
            routes,
            registry,
            responses,
            auth,
        }
    }

    /// Dispatch one decoded application message.
    ///
    /// Returns an error only for malformed envelopes, which are fatal
    /// for the whole session (a broken client, not a broken request).
    pub async fn dispatch(&self, message: &[u8], tasks: &mut JoinSet<()>) -> KerfResult<()> {
        let request = envelope::decode_request(message)?;

        if request.is_continuation() {
            self.handle_continuation(request).await;
            return Ok(());
        }

        let id = request.id;

        if self.auth.is_expired() {
            debug!(id, "request rejected: token expired");
            self.responses.error(id, 402, "Payment required");
            return Ok(());
        }

        // Shape validation guarantees verb and path on non-continuations.
        let (verb, path) = match (request.verb, request.path) {
            (Some(verb), Some(path)) => (verb, path),
            _ => return Err(KerfError::Protocol("request without verb or path".into())),
        };

        let route = Route::new(verb, path);
        let handler = match self.routes.get(&route) {
            Some(handler) => handler.clone(),
            None => {
                warn!(id, route = %route, "no handler found for route");
                self.responses.error(id, 404, "Route not found");
                return Ok(());
            }
        };

        let task_request = Request {
            id,
            verb: route.verb,
            path: route.path,
            body: request.body,
            chunk: request.chunk,
        };

        let registry = self.registry.clone();
        let responses = self.responses.clone();
        tasks.spawn(async move {
            run_handler(handler, task_request, registry, responses).await;
        });

        Ok(())
    }

    async fn handle_continuation(&self, request: RequestEnvelope) {
        let id = request.id;
        let Some(chunk) = request.chunk else {
            warn!(id, "stream continuation without chunk data");
            self.responses.error(id, 400, "Chunk data required");
            return;
        };

        let result = self
            .registry
            .handle_chunk(id, Bytes::from(chunk.data), chunk.seq, chunk.is_final)
            .await;

        if let Err(e) = result {
            warn!(id, error = %e, "stream chunk rejected");
            self.registry.cancel_stream(id).await;
            self.responses.error(id, 400, &e.to_string());
        }
    }
}

async fn run_handler(
    handler: Arc<dyn RequestHandler>,
    request: Request,
    registry: Arc<StreamRegistry>,
    responses: ResponseSender,
) {
    let id = request.id;

    match handler.handle(request, registry).await {
        Ok(HandlerResponse::Single { status, body }) => {
            responses.send(ResponseEnvelope::new(id, status, body.into_bytes()));
        }
        Ok(HandlerResponse::Streaming { headers, body }) => {
            write_streaming(&responses, id, headers, body).await;
        }
        Err(e) => {
            warn!(id, status = e.status, "error processing request: {}", e.message);
            responses.error(id, e.status, &e.message);
        }
    }
}

/// Adapt a handler's body stream into response envelopes: one envelope
/// per slice, headers on the first only, then the empty end-of-stream
/// marker. An error item replaces the marker with an error envelope.
async fn write_streaming(
    responses: &ResponseSender,
    id: u64,
    headers: HashMap<String, String>,
    mut body: BodyStream,
) {
    let mut first_headers = if headers.is_empty() {
        None
    } else {
        Some(headers)
    };
    let mut first = true;

    while let Some(item) = body.next().await {
        match item {
            Ok(bytes) => {
                let headers = if first { first_headers.take() } else { None };
                first = false;
                responses.send(ResponseEnvelope::stream_slice(id, bytes.to_vec(), headers));
            }
            Err(e) => {
                warn!(id, status = e.status, "error during streaming response: {}", e.message);
                responses.error(id, e.status, &e.message);
                return;
            }
        }
    }

    responses.send(ResponseEnvelope::end_of_stream(id));
}
