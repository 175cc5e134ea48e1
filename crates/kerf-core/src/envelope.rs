//! Request and response envelopes carried inside the encrypted tunnel.
//!
//! Request interpretation:
//!   - verb + path + body (no chunk): single-message request
//!   - verb + path + body + chunk: streaming request begins, body holds
//!     metadata, chunk holds the first slice of data
//!   - id + chunk (no verb/path): continuation chunk for an in-flight
//!     upload

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::{KerfError, KerfResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A slice of a streaming request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Sequence number for ordering (0-indexed).
    pub seq: u32,
    /// True on the last chunk of the upload.
    pub is_final: bool,
}

/// A client request, one per application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<StreamChunk>,
}

impl RequestEnvelope {
    /// True if this is a continuation chunk (has chunk but no verb/path).
    pub fn is_continuation(&self) -> bool {
        self.verb.is_none() && self.path.is_none() && self.chunk.is_some()
    }

    /// Validate the envelope shape: verb and path must be present
    /// together, and an envelope without them must carry a chunk.
    fn validate(&self) -> KerfResult<()> {
        let has_verb = self.verb.as_deref().is_some_and(|v| !v.is_empty());
        let has_path = self.path.as_deref().is_some_and(|p| !p.is_empty());

        if has_verb != has_path {
            return Err(KerfError::Protocol(
                "request must have both verb and path, or neither".into(),
            ));
        }
        if !has_verb && self.chunk.is_none() {
            return Err(KerfError::Protocol(
                "request must have verb/path or chunk".into(),
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> KerfResult<Vec<u8>> {
        cbor_encode(self)
    }
}

/// Decode and shape-check a request envelope.
///
/// Empty verb/path strings are treated as absent, matching clients that
/// serialize defaults instead of omitting fields.
pub fn decode_request(data: &[u8]) -> KerfResult<RequestEnvelope> {
    let mut envelope: RequestEnvelope = cbor_decode(data)?;
    if envelope.verb.as_deref() == Some("") {
        envelope.verb = None;
    }
    if envelope.path.as_deref() == Some("") {
        envelope.path = None;
    }
    envelope.validate()?;
    Ok(envelope)
}

/// A gateway response. Streaming responses emit several envelopes with
/// the same id; `headers` is populated only on the first of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub status: u16,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl ResponseEnvelope {
    pub fn new(id: u64, status: u16, body: Vec<u8>) -> Self {
        Self {
            id,
            status,
            body,
            headers: None,
        }
    }

    /// An error envelope with a short message body.
    pub fn error(id: u64, status: u16, message: &str) -> Self {
        Self::new(id, status, message.as_bytes().to_vec())
    }

    /// One slice of a streaming response body.
    pub fn stream_slice(id: u64, body: Vec<u8>, headers: Option<HashMap<String, String>>) -> Self {
        Self {
            id,
            status: 200,
            body,
            headers,
        }
    }

    /// The zero-length envelope that terminates a streaming response.
    pub fn end_of_stream(id: u64) -> Self {
        Self::new(id, 200, Vec::new())
    }

    pub fn encode(&self) -> KerfResult<Vec<u8>> {
        cbor_encode(self)
    }

    pub fn decode(data: &[u8]) -> KerfResult<Self> {
        cbor_decode(data)
    }
}
