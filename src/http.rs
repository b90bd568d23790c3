//! Internal HTTP surface: liveness state, Prometheus metrics and the
//! reserved (not yet implemented) API namespace.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pg2search::Metrics;

use crate::state::StateCell;

#[derive(Clone)]
struct AppState {
    state: Arc<StateCell>,
    metrics: Arc<Metrics>,
}

pub fn router(state: Arc<StateCell>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/state", get(state_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api", any(not_implemented))
        .route("/api/*rest", any(not_implemented))
        .with_state(AppState { state, metrics })
}

pub async fn serve(
    listener: TcpListener,
    state: Arc<StateCell>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "serving state and metrics");
    axum::serve(listener, router(state, metrics))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

async fn state_handler(State(app): State<AppState>) -> String {
    app.state.load().as_str().to_string()
}

async fn metrics_handler(State(app): State<AppState>) -> String {
    app.metrics.render()
}

async fn not_implemented() -> (StatusCode, &'static str) {
    (StatusCode::NOT_IMPLEMENTED, "not implemented")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;

    async fn request(router: Router, path: &str) -> (StatusCode, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let status: u16 = response
            .split_whitespace()
            .nth(1)
            .unwrap_or("0")
            .parse()
            .unwrap();
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default();
        (StatusCode::from_u16(status).unwrap(), body)
    }

    fn test_router() -> (Router, Arc<StateCell>) {
        let state = Arc::new(StateCell::new());
        let metrics = Arc::new(Metrics::new());
        (router(state.clone(), metrics), state)
    }

    #[tokio::test]
    async fn test_state_endpoint() {
        let (router, state) = test_router();
        state.store(Phase::StreamingWal);
        let (status, body) = request(router, "/state").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with("streaming wal"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (router, _) = test_router();
        let (status, body) = request(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("pg2search_uptime_seconds"));
    }

    #[tokio::test]
    async fn test_api_is_reserved() {
        let (router, _) = test_router();
        let (status, _) = request(router, "/api/anything").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }
}
