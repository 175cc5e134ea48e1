//! Liveness probe over the tunnel.

use crate::router::{HandlerFuture, HandlerResponse, Request, RequestHandler};
use crate::streaming::StreamRegistry;
use std::sync::Arc;

pub struct PingHandler;

impl RequestHandler for PingHandler {
    fn handle<'a>(&'a self, _request: Request, _registry: Arc<StreamRegistry>) -> HandlerFuture<'a> {
        Box::pin(async {
            Ok(HandlerResponse::Single {
                status: 200,
                body: "PONG".into(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::StreamLimits;

    #[tokio::test]
    async fn ping_answers_pong() {
        let registry = Arc::new(StreamRegistry::new(StreamLimits::default()));
        let request = Request {
            id: 1,
            verb: "GET".into(),
            path: "/ping".into(),
            body: None,
            chunk: None,
        };

        let response = PingHandler.handle(request, registry).await.unwrap();
        match response {
            HandlerResponse::Single { status, body } => {
                assert_eq!(status, 200);
                assert_eq!(body, "PONG");
            }
            HandlerResponse::Streaming { .. } => panic!("ping must not stream"),
        }
    }
}
