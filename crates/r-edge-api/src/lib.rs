//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Networking API surface for external integrations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---

use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use r_edge_common::Mode;
use r_edge_reconciler::{StatusBoard, WorkloadStatus};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared API state exposed to handlers.
pub struct ApiState {
    mode: Mode,
    start: Instant,
    started_at: DateTime<Utc>,
    config_hash: RwLock<String>,
    board: StatusBoard,
}

impl ApiState {
    pub fn new(mode: Mode, config_hash: String, board: StatusBoard) -> Self {
        Self {
            mode,
            start: Instant::now(),
            started_at: Utc::now(),
            config_hash: RwLock::new(config_hash),
            board,
        }
    }

    /// Record the hash of the configuration now in effect.
    pub fn set_config_hash(&self, hash: String) {
        *self.config_hash.write() = hash;
    }

    fn status(&self) -> StatusResponse {
        StatusResponse {
            mode: self.mode,
            started_at: self.started_at.to_rfc3339(),
            uptime_seconds: self.start.elapsed().as_secs(),
            config_hash: self.config_hash.read().clone(),
            workload_count: self.board.len(),
        }
    }

    fn health(&self) -> HealthResponse {
        let failed: Vec<String> = self
            .board
            .snapshot()
            .into_iter()
            .filter(|status| status.startup_failed)
            .map(|status| status.name)
            .collect();
        HealthResponse {
            status: if failed.is_empty() { "ok" } else { "degraded" },
            failed_workloads: failed,
        }
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("mode", &self.mode)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Spawn the status API.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let router = Router::new()
        .route("/healthz", get(get_health))
        .route("/api/status", get(get_status))
        .route("/api/workloads", get(get_workloads))
        .route("/api/workloads/:name", get(get_workload))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to resolve API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    mode: Mode,
    started_at: String,
    uptime_seconds: u64,
    config_hash: String,
    workload_count: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    failed_workloads: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

/// 503 while any workload has exhausted its start budget.
async fn get_health(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.health();
    let code = if health.failed_workloads.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(state.status())
}

async fn get_workloads(State(state): State<Arc<ApiState>>) -> Json<Vec<WorkloadStatus>> {
    Json(state.board.snapshot())
}

async fn get_workload(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<WorkloadStatus>, ApiError> {
    state
        .board
        .get(&name)
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown workload `{name}`")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use r_edge_reconciler::{HostOptions, LifecycleStateKind, WorkloadFleet};
    use r_edge_sim::SimulatedBackend;
    use r_edge_workload::WorkloadDescriptor;
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use super::*;

    async fn get(addr: SocketAddr, path: &str) -> (u16, Value) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let code = response[9..12].parse().unwrap();
        let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
        (code, serde_json::from_str(body).unwrap())
    }

    #[tokio::test]
    async fn serves_workload_statuses_and_health() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.fail_starts_always("broken");
        let mut fleet = WorkloadFleet::new(backend, None, HostOptions::default());
        fleet
            .apply(vec![
                WorkloadDescriptor::builder("historian", "registry.local/historian")
                    .enabled(true)
                    .build(),
                WorkloadDescriptor::builder("broken", "registry.local/broken")
                    .enabled(true)
                    .max_retries(1)
                    .build(),
            ])
            .await
            .unwrap();
        for name in ["historian", "broken"] {
            let mut status = fleet.host(name).unwrap().watch_status();
            timeout(
                Duration::from_secs(5),
                status.wait_for(|status| {
                    status.state == LifecycleStateKind::Created || status.startup_failed
                }),
            )
            .await
            .unwrap()
            .unwrap();
        }

        let state = Arc::new(ApiState::new(Mode::Simulation, "abc123".into(), fleet.board()));
        let server = spawn_api_server(state, "127.0.0.1:0".parse().unwrap()).unwrap();

        let (code, workloads) = get(server.addr(), "/api/workloads").await;
        assert_eq!(code, 200);
        assert_eq!(workloads[0]["name"], "historian");
        assert_eq!(workloads[0]["state"], "created");
        assert_eq!(workloads[1]["state"], "disabled");
        assert_eq!(workloads[1]["startup_failed"], true);

        let (code, single) = get(server.addr(), "/api/workloads/historian").await;
        assert_eq!(code, 200);
        assert_eq!(single["image"], "registry.local/historian:latest");

        let (code, _) = get(server.addr(), "/api/workloads/missing").await;
        assert_eq!(code, 404);

        let (code, health) = get(server.addr(), "/healthz").await;
        assert_eq!(code, 503);
        assert_eq!(health["failed_workloads"][0], "broken");

        let (_, status) = get(server.addr(), "/api/status").await;
        assert_eq!(status["mode"], "simulation");
        assert_eq!(status["config_hash"], "abc123");
        assert_eq!(status["workload_count"], 2);

        server.shutdown().await.unwrap();
        fleet.shutdown().await;
    }
}
