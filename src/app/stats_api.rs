//! Prometheus metrics HTTP endpoint.
//!
//! Plain HTTP, one route: `GET /metrics` in Prometheus text format.

use std::net::SocketAddr;

use axum::{http::header::CONTENT_TYPE, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::metrics::{init_metrics, REGISTRY};

/// Prometheus metrics endpoint
async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("failed to encode metrics: {}", e);
    }

    ([(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], buffer)
}

/// Build the API router (metrics only)
pub fn build_api_router() -> Router {
    Router::new().route("/metrics", get(get_metrics))
}

/// Start the metrics server; returns when the shutdown channel fires.
pub async fn start_api_server(addr: SocketAddr, mut shutdown_rx: broadcast::Receiver<()>) {
    init_metrics();

    let app = build_api_router();

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    info!("Prometheus metrics on http://{}/metrics", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("metrics server shutting down");
        })
        .await
        .unwrap_or_else(|e| {
            warn!("metrics server error: {}", e);
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        init_metrics();
        super::super::metrics::record_error("handshake_read");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);

        let server = tokio::spawn(async move {
            axum::serve(listener, build_api_router())
                .with_graceful_shutdown(async move {
                    let mut rx = rx;
                    let _ = rx.recv().await;
                })
                .await
                .unwrap();
        });

        // Raw HTTP/1.1 request, no client dependency needed.
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        conn.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("mirage_errors_total"));

        tx.send(()).unwrap();
        server.await.unwrap();
    }
}
