//! Metrics HTTP server exposing the pipeline snapshot for the TUI dashboard
//! and any external monitoring tool.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;

use crate::metrics::{PipelineSnapshot, SharedMetrics};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<PipelineSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Runs the metrics HTTP server on `127.0.0.1:7878`.
pub async fn run_metrics_server(metrics: SharedMetrics) -> Result<(), ServerError> {
    let app = create_metrics_router(metrics);
    let addr = SocketAddr::from(([127, 0, 0, 1], 7878));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics server listening");
    axum::serve(listener, app).await.map_err(ServerError::BindError)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{new_shared_metrics, JobMetrics, SystemMetrics};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_metrics_returns_json() {
        let metrics = new_shared_metrics();
        {
            let mut snapshot = metrics.write().await;
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.integrity_queue_len = 3;
            snapshot.encode_queue_len = 2;
            snapshot.ok_count = 42;
            snapshot.failed_count = 2;
            snapshot.total_bytes_in = 107374182400;
            snapshot.system = SystemMetrics {
                cpu_usage_percent: 85.2,
                mem_usage_percent: 42.1,
                load_avg_1: 2.5,
                load_avg_5: 2.1,
                load_avg_15: 1.8,
            };
            snapshot.jobs.push(JobMetrics {
                id: "job-001".to_string(),
                input_path: "/media/video.mkv".to_string(),
                stage: "transcode:cpu".to_string(),
                progress_percent: 45.0,
                fps: 24.0,
                speed: 1.2,
                eta_seconds: Some(600),
                backend: "cpu".to_string(),
                size_in_bytes_before: 5368709120,
                size_in_bytes_after: 2147483648,
            });
        }

        let app = create_metrics_router(metrics.clone());

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let snapshot: PipelineSnapshot = serde_json::from_slice(&body).unwrap();

        assert_eq!(snapshot.timestamp_unix_ms, 1701388800000);
        assert_eq!(snapshot.integrity_queue_len, 3);
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].id, "job-001");
    }

    #[tokio::test]
    async fn test_get_metrics_empty_snapshot() {
        let metrics = new_shared_metrics();
        let app = create_metrics_router(metrics);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let snapshot: PipelineSnapshot = serde_json::from_slice(&body).unwrap();

        assert_eq!(snapshot.jobs.len(), 0);
        assert_eq!(snapshot.integrity_queue_len, 0);
    }
}
