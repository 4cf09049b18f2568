//! HTTP server exposing the Prometheus `/metrics` endpoint.
//!
//! # Example
//!
//! ```rust,no_run
//! use hetero_deploy_observability::metrics_server::serve_metrics;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! serve_metrics(9090).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::metrics::DeployMetrics;
use axum::{extract::State, http::StatusCode, response::{IntoResponse, Response}, routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Start an HTTP server exposing `/metrics` on the given port. Runs
/// until the process is terminated.
pub async fn serve_metrics(port: u16) -> Result<()> {
    let (_, server_future) = serve_metrics_with_addr(port, Arc::new(crate::metrics::global().clone())).await?;
    server_future.await
}

/// Start an HTTP server bound to `port` (0 lets the OS pick) serving
/// the given metrics instance, returning the bound address and a
/// future that drives the server.
pub async fn serve_metrics_with_addr(
    port: u16,
    metrics: Arc<DeployMetrics>,
) -> Result<(std::net::SocketAddr, impl std::future::Future<Output = Result<()>>)> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::error::Error::Metrics(format!("failed to bind to {addr}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| crate::error::Error::Metrics(format!("failed to get local addr: {e}")))?;

    tracing::info!(addr = %local_addr, "metrics server listening");

    let server_future = async move {
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::Error::Metrics(format!("server error: {e}")))?;
        Ok(())
    };

    Ok((local_addr, server_future))
}

async fn metrics_handler(State(metrics): State<Arc<DeployMetrics>>) -> Response {
    match metrics.encode() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to export metrics: {e}")).into_response(),
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "OK").into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Duration};

    struct ServerGuard<T> {
        handle: JoinHandle<T>,
    }

    impl<T> Drop for ServerGuard<T> {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    async fn wait_for_server_ready(port: u16, max_retries: u32) -> bool {
        let client = reqwest::Client::builder().timeout(Duration::from_millis(500)).build().unwrap();
        for attempt in 0..max_retries {
            match client.get(format!("http://localhost:{port}/health")).send().await {
                Ok(resp) if resp.status().is_success() => return true,
                _ => {
                    let delay = Duration::from_millis(10 * (1 << attempt.min(4)));
                    tokio::time::sleep(delay).await;
                }
            }
        }
        false
    }

    #[tokio::test]
    async fn metrics_and_health_endpoints_respond() {
        let metrics = Arc::new(DeployMetrics::new().unwrap());
        metrics.set_queue_depth("root.out", 1);

        let (addr, server_future) = serve_metrics_with_addr(0, metrics).await.unwrap();
        let port = addr.port();
        let _guard = ServerGuard { handle: tokio::spawn(server_future) };

        assert!(wait_for_server_ready(port, 10).await, "server failed to start within timeout");

        let client = reqwest::Client::new();
        let metrics_resp = timeout(Duration::from_secs(2), client.get(format!("http://localhost:{port}/metrics")).send())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metrics_resp.status(), 200);
        let body = metrics_resp.text().await.unwrap();
        assert!(body.contains("hetero_deploy_queue_depth"));

        let health_resp = timeout(Duration::from_secs(2), client.get(format!("http://localhost:{port}/health")).send())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(health_resp.status(), 200);
    }
}
