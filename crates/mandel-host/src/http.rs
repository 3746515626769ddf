//! Client-facing handshake endpoint.
//!
//! ## Endpoints
//!
//! - `PUT /json_transport` - Client handshake for an assigned mandelbox
//! - `GET /health` - Health check
//!
//! Requests are handed to the event loop over a channel; the handler only
//! waits for the reply.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use mandel_core::{HandshakeRequest, JsonTransportRequest, JsonTransportResult};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    requests: mpsc::Sender<HandshakeRequest>,
}

impl AppState {
    /// Handlers forward handshakes to `requests`.
    pub fn new(requests: mpsc::Sender<HandshakeRequest>) -> Self {
        Self { requests }
    }
}

/// Body of every `/json_transport` response.
#[derive(Debug, Serialize)]
struct TransportResponse {
    result: Option<JsonTransportResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TransportResponse {
    fn ok(result: JsonTransportResult) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                result: Some(result),
                error: None,
            }),
        )
            .into_response()
    }

    fn error(message: impl Into<String>) -> Response {
        (
            StatusCode::NOT_ACCEPTABLE,
            Json(Self {
                result: None,
                error: Some(message.into()),
            }),
        )
            .into_response()
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/json_transport", put(json_transport_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn json_transport_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let body: JsonTransportRequest = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed handshake request");
            return TransportResponse::error(format!("malformed request: {e}"));
        }
    };
    let mandelbox_id = body.mandelbox_id;
    tracing::debug!(mandelbox_id = %mandelbox_id, "Handshake request received");

    let (request, reply) = HandshakeRequest::new(body);
    if state.requests.send(request).await.is_err() {
        return TransportResponse::error("host service is shutting down");
    }

    match reply.await {
        Ok(Ok(result)) => TransportResponse::ok(result),
        Ok(Err(e)) => {
            tracing::info!(mandelbox_id = %mandelbox_id, error = %e, "Handshake rejected");
            TransportResponse::error(e)
        }
        Err(_) => TransportResponse::error(format!(
            "mandelbox {mandelbox_id} went away before answering"
        )),
    }
}

async fn health_handler() -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "mandel-host"
    }))
}

/// Serve the router on `addr` until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Handshake server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use mandel_core::MandelboxId;
    use tower::ServiceExt;

    fn result() -> JsonTransportResult {
        JsonTransportResult {
            port_32261: 40001,
            port_32262: 40002,
            port_32263: 40003,
            port_32273: 40004,
            aes_key: "00112233445566778899aabbccddeeff".into(),
        }
    }

    /// Router whose "event loop" answers every request with `answer`.
    fn router_answering(answer: Option<Result<JsonTransportResult, String>>) -> Router {
        let (tx, mut rx) = mpsc::channel::<HandshakeRequest>(4);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match answer.clone() {
                    Some(reply) => request.respond(reply),
                    None => drop(request),
                }
            }
        });
        build_router(AppState::new(tx))
    }

    async fn put_json(router: Router, body: String) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/json_transport")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn request_body() -> String {
        format!(
            r#"{{"mandelbox_id":"{}","config_encryption_token":"tok","json_data":""}}"#,
            MandelboxId::new()
        )
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (status, json) = put_json(router_answering(Some(Ok(result()))), request_body()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"]["port_32262"], 40002);
        assert_eq!(json["result"]["aes_key"], "00112233445566778899aabbccddeeff");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let router = router_answering(Some(Err("duplicate handshake".into())));
        let (status, json) = put_json(router, request_body()).await;
        assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
        assert!(json["result"].is_null());
        assert_eq!(json["error"], "duplicate handshake");
    }

    #[tokio::test]
    async fn test_dropped_request() {
        let (status, json) = put_json(router_answering(None), request_body()).await;
        assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
        assert!(json["error"].as_str().unwrap().contains("went away"));
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let router = router_answering(Some(Ok(result())));
        let (status, json) = put_json(router, r#"{"mandelbox_id":"not-a-uuid"}"#.into()).await;
        assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
        assert!(json["error"].as_str().unwrap().starts_with("malformed request"));
    }

    #[tokio::test]
    async fn test_shutting_down() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (status, _) = put_json(build_router(AppState::new(tx)), request_body()).await;
        assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn test_health() {
        let response = router_answering(None)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
