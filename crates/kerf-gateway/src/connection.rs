//! Connection lifecycle: upgrade auth, Noise handshake, established
//! loop, teardown.
//!
//! One task reads the socket, owning the frame opener and assembler;
//! handler tasks are spawned per request; a single writer task owns the
//! frame sealer and serializes the encode → encrypt → send path. On
//! close or failure every handler task is aborted and every stream in
//! the registry is cancelled.

use crate::noise::{
    self, FrameOpener, FrameSealer, HandshakeProgress, NoiseHandshake,
};
use crate::router::{AuthSnapshot, Dispatcher, Outbound, ResponseSender};
use crate::server::GatewayState;
use crate::streaming::StreamRegistry;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use kerf_core::framing::{self, FrameAssembler};
use kerf_core::{KerfError, KerfResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Close code for malformed protocol bytes (RFC 6455 "cannot accept").
pub const CLOSE_CANNOT_ACCEPT: u16 = 1003;

/// Close code for crypto or internal failure ("unexpected condition").
pub const CLOSE_UNEXPECTED_CONDITION: u16 = 1011;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Serve one accepted TCP connection to completion.
pub async fn serve(stream: TcpStream, remote_addr: SocketAddr, state: Arc<GatewayState>) {
    let mut auth_snapshot: Option<AuthSnapshot> = None;
    let secret = state.jwt_secret.clone();

    let callback = |request: &UpgradeRequest, response: UpgradeResponse| {
        match authorize(request.uri().query(), secret.as_bytes()) {
            Ok(snapshot) => {
                auth_snapshot = Some(snapshot);
                Ok(response)
            }
            Err(e) => {
                warn!(remote = %remote_addr, error = %e, "websocket upgrade rejected");
                let mut rejection = ErrorResponse::new(Some("Invalid token".into()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(remote = %remote_addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let Some(auth) = auth_snapshot else {
        // The callback ran, or the upgrade would have failed above.
        return;
    };

    if let Err(e) = run_session(ws, remote_addr, auth, state).await {
        warn!(remote = %remote_addr, error = %e, "session ended with error");
    }
}

/// Verify the `token` query parameter and build the session's
/// authorization snapshot. Invalid or missing tokens reject the
/// upgrade before any protocol bytes are exchanged.
pub fn authorize(query: Option<&str>, secret: &[u8]) -> KerfResult<AuthSnapshot> {
    let token = query
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("token=")))
        .ok_or_else(|| KerfError::Token("missing token".into()))?;

    let claims = kerf_core::verify_token(secret, token)?;
    Ok(AuthSnapshot {
        subscribed: claims.subscribed,
        token_expiry: Some(claims.expiry),
    })
}

async fn run_session(
    ws: WebSocketStream<TcpStream>,
    remote_addr: SocketAddr,
    auth: AuthSnapshot,
    state: Arc<GatewayState>,
) -> KerfResult<()> {
    info!(remote = %remote_addr, "websocket connection opened");

    let attestation = state.attestation.signed_attestation()?;
    let payload = serde_json::to_vec(&attestation)?;
    let mut handshake = Some(NoiseHandshake::responder(
        state.attestation.static_private_key(),
        payload,
    )?);

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Handshake phase: feed inbound messages to the driver until it
    // splits into the transport ciphers.
    let (sealer, opener) = loop {
        let Some(message) = ws_rx.next().await else {
            info!(remote = %remote_addr, "connection closed during handshake");
            return Ok(());
        };
        let message = message.map_err(|e| KerfError::Transport(e.to_string()))?;

        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => {
                info!(remote = %remote_addr, "connection closed during handshake");
                return Ok(());
            }
            _ => continue,
        };

        if data.len() > noise::MAX_HANDSHAKE_MESSAGE_SIZE {
            warn!(remote = %remote_addr, size = data.len(), "handshake message too large");
            close_now(&mut ws_tx, CLOSE_CANNOT_ACCEPT, "Handshake message too large").await;
            return Ok(());
        }

        let current = handshake
            .take()
            .ok_or_else(|| KerfError::Handshake("handshake state missing".into()))?;

        match current.advance(&data) {
            Ok(HandshakeProgress::InProgress {
                responses,
                handshake: next,
            }) => {
                send_all(&mut ws_tx, responses).await?;
                handshake = Some(next);
            }
            Ok(HandshakeProgress::Established {
                responses,
                sealer,
                opener,
            }) => {
                send_all(&mut ws_tx, responses).await?;
                break (sealer, opener);
            }
            Err(e) => {
                warn!(remote = %remote_addr, error = %e, "handshake failed");
                close_now(&mut ws_tx, CLOSE_UNEXPECTED_CONDITION, "Handshake failed").await;
                return Ok(());
            }
        }
    };

    info!(remote = %remote_addr, "noise session established");
    established(ws_tx, ws_rx, sealer, opener, auth, state, remote_addr).await;
    Ok(())
}

async fn send_all(ws_tx: &mut WsSink, messages: Vec<Vec<u8>>) -> KerfResult<()> {
    for message in messages {
        ws_tx
            .send(Message::Binary(message.into()))
            .await
            .map_err(|e| KerfError::Transport(e.to_string()))?;
    }
    Ok(())
}

async fn close_now(ws_tx: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "failed to close session");
    }
}

async fn established(
    ws_tx: WsSink,
    mut ws_rx: WsStream,
    sealer: impl FrameSealer + 'static,
    mut opener: impl FrameOpener,
    auth: AuthSnapshot,
    state: Arc<GatewayState>,
    remote_addr: SocketAddr,
) {
    let registry = Arc::new(StreamRegistry::new(state.limits));
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let responses = ResponseSender::new(out_tx);
    let dispatcher = Dispatcher::new(
        state.routes.clone(),
        registry.clone(),
        responses.clone(),
        auth,
    );
    let mut assembler = FrameAssembler::new();
    let mut tasks = JoinSet::new();

    let writer = tokio::spawn(outbound_writer(out_rx, Box::new(sealer), ws_tx));

    // Inbound loop: decrypt, reassemble, dispatch. Any fatal condition
    // breaks out with the close code to send.
    let close_directive = loop {
        let Some(message) = ws_rx.next().await else {
            break None;
        };
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(remote = %remote_addr, error = %e, "websocket receive failed");
                break None;
            }
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break None,
            _ => continue,
        };

        if data.len() > noise::MAX_NOISE_MESSAGE_SIZE {
            warn!(remote = %remote_addr, size = data.len(), "message too large");
            break Some((CLOSE_CANNOT_ACCEPT, "Message too large"));
        }

        let frame_bytes = match opener.open(&data) {
            Ok(frame_bytes) => frame_bytes,
            Err(e) => {
                warn!(remote = %remote_addr, error = %e, "decryption failed");
                break Some((CLOSE_UNEXPECTED_CONDITION, "Decryption failed"));
            }
        };

        let frame = match framing::decode_frame(&frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(remote = %remote_addr, error = %e, "failed to decode frame");
                break Some((CLOSE_UNEXPECTED_CONDITION, "Frame decode failed"));
            }
        };

        let complete = match assembler.process(frame) {
            Ok(complete) => complete,
            Err(e) => {
                warn!(remote = %remote_addr, error = %e, "frame assembly failed");
                break Some((CLOSE_UNEXPECTED_CONDITION, "Frame decode failed"));
            }
        };

        if let Some(application_message) = complete {
            if let Err(e) = dispatcher.dispatch(&application_message, &mut tasks).await {
                warn!(remote = %remote_addr, error = %e, "invalid request message");
                break Some((CLOSE_CANNOT_ACCEPT, "Invalid request message"));
            }
        }
    };

    // Teardown: abort in-flight handlers, cancel every stream, flush
    // queued responses and close the socket.
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    registry.cancel_all().await;

    if let Some((code, reason)) = close_directive {
        responses.close(code, reason);
    }
    drop(dispatcher);
    drop(responses);
    let _ = writer.await;

    info!(remote = %remote_addr, "websocket connection closed");
}

/// The single logical writer for the session: serializes every
/// envelope's encode → frame split → encrypt → socket write sequence.
async fn outbound_writer(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut sealer: Box<dyn FrameSealer>,
    mut ws_tx: WsSink,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Envelope(envelope) => {
                let data = match envelope.encode() {
                    Ok(data) => data,
                    Err(e) => {
                        error!(error = %e, "failed to encode response envelope");
                        close_now(&mut ws_tx, CLOSE_UNEXPECTED_CONDITION, "Internal error").await;
                        return;
                    }
                };

                let frames = match framing::encode_frames(&data) {
                    Ok(frames) => frames,
                    Err(e) => {
                        error!(error = %e, "failed to frame response");
                        close_now(&mut ws_tx, CLOSE_UNEXPECTED_CONDITION, "Internal error").await;
                        return;
                    }
                };

                for frame in frames {
                    let ciphertext = match sealer.seal(&frame) {
                        Ok(ciphertext) => ciphertext,
                        Err(e) => {
                            error!(error = %e, "outbound encryption failed");
                            close_now(&mut ws_tx, CLOSE_UNEXPECTED_CONDITION, "Internal error")
                                .await;
                            return;
                        }
                    };

                    if let Err(e) = ws_tx.send(Message::Binary(ciphertext.into())).await {
                        debug!(error = %e, "websocket send failed");
                        return;
                    }
                }
            }
            Outbound::Close { code, reason } => {
                close_now(&mut ws_tx, code, reason).await;
                return;
            }
        }
    }

    // All senders gone without an explicit close: clean teardown.
    let _ = ws_tx.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SECRET: &[u8] = b"connection-test-secret";

    fn token(subscribed: bool) -> String {
        kerf_core::generate_token(SECRET, "client", Duration::from_secs(900), subscribed).unwrap()
    }

    #[test]
    fn authorize_accepts_valid_token() {
        let query = format!("token={}", token(false));
        let snapshot = authorize(Some(&query), SECRET).unwrap();
        assert!(!snapshot.subscribed);
        assert!(snapshot.token_expiry.is_some());
    }

    #[test]
    fn authorize_reads_subscribed_claim() {
        let query = format!("token={}", token(true));
        assert!(authorize(Some(&query), SECRET).unwrap().subscribed);
    }

    #[test]
    fn authorize_finds_token_among_other_params() {
        let query = format!("version=2&token={}&client=web", token(false));
        assert!(authorize(Some(&query), SECRET).is_ok());
    }

    #[test]
    fn authorize_rejects_missing_token() {
        assert!(authorize(None, SECRET).is_err());
        assert!(authorize(Some("other=1"), SECRET).is_err());
    }

    #[test]
    fn authorize_rejects_bad_signature() {
        let query = format!("token={}", token(false));
        assert!(authorize(Some(&query), b"wrong-secret").is_err());
    }

    #[test]
    fn close_codes_match_the_protocol() {
        assert_eq!(CLOSE_CANNOT_ACCEPT, 1003);
        assert_eq!(CLOSE_UNEXPECTED_CONDITION, 1011);
    }
}
