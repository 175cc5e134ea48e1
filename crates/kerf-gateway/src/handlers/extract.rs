//! Streaming document extraction.
//!
//! The request body is streamed chunk by chunk through the registry
//! into a multipart upload against the converter service, and the
//! converted document streams back to the client. The upload pipe is a
//! channel: the converter request owns the receive end, so a failed
//! request drops it and pending writes fail fast instead of blocking
//! on a full pipe.

use super::body_from_receiver;
use crate::router::{HandlerError, HandlerFuture, HandlerResponse, Request, RequestHandler};
use crate::streaming::StreamRegistry;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::multipart;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const UPLOAD_PIPE_DEPTH: usize = 32;

/// Options carried in the request body JSON.
#[derive(Debug, Deserialize)]
pub struct ExtractionOptions {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub total_length: Option<u64>,
    #[serde(default)]
    pub ocr: Option<bool>,
    #[serde(default)]
    pub table_structure: Option<bool>,
    #[serde(default)]
    pub include_images: Option<bool>,
    #[serde(default)]
    pub image_export_mode: Option<String>,
}

impl ExtractionOptions {
    fn content_type_or_default(&self) -> &str {
        self.content_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

/// Streams uploads to the document converter and relays the converted
/// output.
pub struct DocumentExtractionHandler {
    client: reqwest::Client,
    base_url: String,
    enabled: bool,
}

impl DocumentExtractionHandler {
    pub fn new(client: reqwest::Client, base_url: String, enabled: bool) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            enabled,
        }
    }

    fn parse_options(body: Option<&str>) -> Result<ExtractionOptions, HandlerError> {
        let body = body.ok_or_else(|| {
            HandlerError::bad_request("Request body with extraction options is required")
        })?;
        let options: ExtractionOptions = serde_json::from_str(body)
            .map_err(|e| HandlerError::bad_request(format!("Invalid request body: {e}")))?;
        if options.filename.trim().is_empty() {
            return Err(HandlerError::bad_request("filename is required"));
        }
        Ok(options)
    }

    fn build_form(
        &self,
        options: &ExtractionOptions,
        body: reqwest::Body,
    ) -> Result<multipart::Form, HandlerError> {
        let part = multipart::Part::stream(body)
            .file_name(options.filename.clone())
            .mime_str(options.content_type_or_default())
            .map_err(|_| HandlerError::bad_request("Invalid content type"))?;

        let mut form = multipart::Form::new()
            .part("files", part)
            .text("ocr_engine", "rapidocr");

        if let Some(ocr) = options.ocr {
            form = form.text("do_ocr", ocr.to_string());
        }
        if let Some(table_structure) = options.table_structure {
            form = form.text("do_table_structure", table_structure.to_string());
        }
        if let Some(include_images) = options.include_images {
            form = form.text("include_images", include_images.to_string());
        }
        if let Some(mode) = &options.image_export_mode {
            form = form.text("image_export_mode", mode.clone());
        }

        Ok(form)
    }
}

impl RequestHandler for DocumentExtractionHandler {
    fn handle<'a>(&'a self, request: Request, registry: Arc<StreamRegistry>) -> HandlerFuture<'a> {
        Box::pin(async move {
            if !self.enabled {
                return Err(HandlerError::new(503, "Document extraction is not enabled"));
            }

            let Some(first_chunk) = request.chunk else {
                return Err(HandlerError::bad_request(
                    "Streaming required for document extraction",
                ));
            };
            let options = Self::parse_options(request.body.as_deref())?;
            let request_id = request.id;

            // The upload pipe: the registry writes into the sender, the
            // converter request body drains the receiver.
            let (sink, upload_rx) = mpsc::channel::<Bytes>(UPLOAD_PIPE_DEPTH);
            registry.create_stream(request_id, sink).await.map_err(|e| {
                warn!(request_id, error = %e, "failed to create upload stream");
                HandlerError::internal("Document extraction failed")
            })?;

            let upload_body = reqwest::Body::wrap_stream(futures_util::stream::unfold(
                upload_rx,
                |mut rx| async move { rx.recv().await.map(|bytes| (Ok::<_, Infallible>(bytes), rx)) },
            ));
            let form = self.build_form(&options, upload_body)?;

            // Start the converter request before feeding chunks so the
            // pipe drains while the upload is still arriving. If the
            // request fails, its body (and the pipe's receive end) is
            // dropped, which unblocks any in-flight stream writes.
            let converter_request = self
                .client
                .post(format!("{}/v1/convert/file", self.base_url))
                .timeout(REQUEST_TIMEOUT)
                .multipart(form)
                .send();
            let send_task = tokio::spawn(converter_request);

            if let Err(e) = registry
                .handle_chunk(
                    request_id,
                    Bytes::from(first_chunk.data),
                    first_chunk.seq,
                    first_chunk.is_final,
                )
                .await
            {
                warn!(request_id, error = %e, "failed to write first chunk");
                registry.cancel_stream(request_id).await;
                send_task.abort();
                return Err(HandlerError::internal("Document extraction failed"));
            }

            let response = match send_task.await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!(request_id, error = %e, "document converter request failed");
                    registry.cancel_stream(request_id).await;
                    return Err(HandlerError::new(502, "Document extraction failed"));
                }
                Err(e) => {
                    warn!(request_id, error = %e, "document converter task failed");
                    registry.cancel_stream(request_id).await;
                    return Err(HandlerError::new(502, "Document extraction failed"));
                }
            };

            if !response.status().is_success() {
                warn!(request_id, status = %response.status(), "converter returned an error");
                registry.cancel_stream(request_id).await;
                return Err(HandlerError::new(
                    response.status().as_u16(),
                    "Document extraction failed",
                ));
            }

            let mut headers = HashMap::new();
            for name in ["Content-Length", "Content-Type"] {
                if let Some(value) = response.headers().get(name).and_then(|v| v.to_str().ok()) {
                    headers.insert(name.to_string(), value.to_string());
                }
            }

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                let mut body = response.bytes_stream();
                while let Some(item) = body.next().await {
                    match item {
                        Ok(bytes) => {
                            if tx.send(Ok(bytes)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(request_id, error = %e, "error relaying converted document");
                            let _ =
                                tx.send(Err(HandlerError::internal("Document extraction failed")));
                            break;
                        }
                    }
                }
                // Free the upload slot whether or not the client sent a
                // final chunk.
                registry.cancel_stream(request_id).await;
            });

            Ok(HandlerResponse::Streaming {
                headers,
                body: body_from_receiver(rx),
            })
        })
    }
}
