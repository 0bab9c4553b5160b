//! HTTP publisher for the `stat/volumes` attribute and Prometheus metrics

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use dmp_target::{PrometheusExporter, TargetRegistry, VolumesAttribute};
use tokio::net::TcpListener;
use tracing::{debug, info};

pub struct StatState {
    attr: VolumesAttribute,
    exporter: PrometheusExporter,
    registry: Arc<TargetRegistry>,
}

impl StatState {
    pub fn new(registry: Arc<TargetRegistry>) -> Self {
        let stats = Arc::clone(registry.remapper().stats());
        Self {
            attr: VolumesAttribute::new(stats),
            exporter: PrometheusExporter::default(),
            registry,
        }
    }
}

pub fn router(state: Arc<StatState>) -> Router {
    let attr_route = format!("/{}", VolumesAttribute::path());
    Router::new()
        .route(
            &attr_route,
            get(volumes_show).put(volumes_store).post(volumes_store),
        )
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until the listener fails
pub async fn serve(addr: SocketAddr, state: Arc<StatState>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Stat server on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn volumes_show(State(state): State<Arc<StatState>>) -> String {
    state.attr.show()
}

async fn volumes_store(State(state): State<Arc<StatState>>, body: Bytes) -> StatusCode {
    let consumed = state.attr.store(&body);
    debug!(consumed, "discarded write to stat/volumes");
    StatusCode::OK
}

async fn metrics_handler(State(state): State<Arc<StatState>>) -> impl IntoResponse {
    let snapshot = state.registry.remapper().stats().snapshot();
    let body = state.exporter.export(&snapshot, state.registry.list().len());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmp_target::{Direction, IoDispatcher, IoStatistics, Remapper};

    fn state() -> Arc<StatState> {
        let dispatcher = Arc::new(IoDispatcher::new(1, 4).unwrap());
        let registry = TargetRegistry::new(Remapper::new(Arc::new(IoStatistics::new()), dispatcher));
        Arc::new(StatState::new(Arc::new(registry)))
    }

    #[tokio::test]
    async fn test_show_and_store() {
        let state = state();
        let stats = Arc::clone(state.registry.remapper().stats());
        stats.record(Direction::Read, 100);
        stats.record(Direction::Read, 300);

        let text = volumes_show(State(Arc::clone(&state))).await;
        assert_eq!(
            text,
            "read:\n\treqs: 2\n\tavg size: 200\n\
             write:\n\treqs: 0\n\tavg size: 0\n\
             total:\n\treqs: 2\n\tavg size: 200\n"
        );

        let status = volumes_store(State(Arc::clone(&state)), Bytes::from_static(b"reset\n")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats.report().read.ops, 2);
    }

    #[tokio::test]
    async fn test_metrics_over_http() {
        let state = state();
        state.registry.remapper().stats().record(Direction::Write, 4096);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(state)).await });

        let body = http_get(addr, "/metrics").await;
        assert!(body.contains("dmp_write_requests_total 1\n"));
        assert!(body.contains("dmp_volumes 0\n"));

        let body = http_get(addr, "/stat/volumes").await;
        assert!(body.contains("write:\n\treqs: 1\n\tavg size: 4096\n"));
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        response
    }
}
