//! Gateway server: owns the shared state and the accept loop.

use crate::attestation::{AttestationProvider, StaticAttestationProvider};
use crate::config::GatewayConfig;
use crate::connection;
use crate::handlers::{ChatCompletionsHandler, DocumentExtractionHandler, PingHandler};
use crate::router::{Route, RouteTable};
use crate::streaming::StreamLimits;
use kerf_core::KerfResult;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// State shared by every connection: the route table installed at
/// startup, the attestation provider, the token secret, and the stream
/// bounds. Read-only after construction.
pub struct GatewayState {
    pub routes: Arc<RouteTable>,
    pub attestation: Arc<dyn AttestationProvider>,
    pub jwt_secret: String,
    pub limits: StreamLimits,
}

/// The gateway instance.
pub struct GatewayServer {
    port: u16,
    state: Arc<GatewayState>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> KerfResult<Self> {
        let attestation = Arc::new(StaticAttestationProvider::from_config(&config)?);
        let routes = Arc::new(build_routes(&config));

        Ok(Self {
            port: config.port,
            state: Arc::new(GatewayState {
                routes,
                attestation,
                jwt_secret: config.jwt_secret,
                limits: config.stream_limits,
            }),
        })
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(&self) -> KerfResult<()> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = TcpListener::bind(bind_addr).await?;
        info!(addr = %bind_addr, "websocket listener started");

        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let state = self.state.clone();
                    tokio::spawn(connection::serve(stream, remote_addr, state));
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    }
}

fn build_routes(config: &GatewayConfig) -> RouteTable {
    let mut routes = RouteTable::new();
    let client = reqwest::Client::new();

    routes.insert(Route::new("GET", "/ping"), Arc::new(PingHandler));

    for upstream in &config.chat_upstreams {
        info!(name = %upstream.name, url = %upstream.url, "installing chat upstream");
        routes.insert(
            Route::new("POST", format!("/v1/{}/chat/completions", upstream.name)),
            Arc::new(ChatCompletionsHandler::new(
                client.clone(),
                upstream.url.clone(),
                upstream.api_key.clone(),
            )),
        );
    }

    routes.insert(
        Route::new("POST", "/v1/document/extract"),
        Arc::new(DocumentExtractionHandler::new(
            client,
            config.docling_url.clone(),
            config.docling_enabled,
        )),
    );

    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GatewayConfig {
        GatewayConfig::load(None, None, Some("test-secret")).unwrap()
    }

    #[test]
    fn default_routes_installed() {
        let routes = build_routes(&test_config());
        assert!(routes.get(&Route::new("GET", "/ping")).is_some());
        assert!(routes.get(&Route::new("POST", "/v1/document/extract")).is_some());
        assert!(routes.get(&Route::new("GET", "/missing")).is_none());
    }

    #[test]
    fn chat_upstreams_become_routes() {
        let mut config = test_config();
        config.chat_upstreams = vec![
            crate::config::ChatUpstream {
                name: "vllm".into(),
                url: "http://10.0.0.2:8000/v1".into(),
                api_key: None,
            },
            crate::config::ChatUpstream {
                name: "together".into(),
                url: "https://api.together.xyz/v1".into(),
                api_key: Some("key".into()),
            },
        ];

        let routes = build_routes(&config);
        assert!(routes
            .get(&Route::new("POST", "/v1/vllm/chat/completions"))
            .is_some());
        assert!(routes
            .get(&Route::new("POST", "/v1/together/chat/completions"))
            .is_some());
    }
}
