//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Prometheus plumbing shared by the R-Edge crates.
//!
//! Every component registers on one [`SharedRegistry`]; the daemon exposes it
//! through [`MetricsExporter`] at `/metrics`.
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use prometheus;

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every family in `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

/// Bound but not yet serving `/metrics` listener.
#[derive(Debug)]
pub struct MetricsExporter {
    listener: StdTcpListener,
    addr: SocketAddr,
}

impl MetricsExporter {
    /// Bind `addr`; port `0` picks a free port, reported by [`MetricsExporter::addr`].
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = StdTcpListener::bind(addr)
            .with_context(|| format!("failed to bind metrics listener {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("failed to configure metrics listener as non-blocking")?;
        let addr = listener
            .local_addr()
            .context("failed to resolve metrics listener address")?;
        Ok(Self { listener, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start serving `registry` on the bound listener.
    pub fn serve(self, registry: SharedRegistry) -> Result<MetricsServer> {
        let listener = TcpListener::from_std(self.listener)
            .context("failed to hand metrics listener to tokio")?;
        let router = Router::new()
            .route("/metrics", get(scrape))
            .with_state(registry);
        let addr = self.addr;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task: JoinHandle<Result<()>> = tokio::spawn(async move {
            info!(address = %addr, "metrics exporter listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
                .context("metrics exporter stopped with an error")?;
            debug!(address = %addr, "metrics exporter stopped");
            Ok(())
        });

        Ok(MetricsServer {
            addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// Bind `addr` and serve `registry` at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    MetricsExporter::bind(addr)?.serve(registry)
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    match render(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!(error = %err, "metrics scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Handle to the running exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Result of one configuration reload check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A changed workload set was handed to the fleet.
    Applied,
    /// The file hash did not change.
    Unchanged,
    /// The file could not be read or its workloads did not parse.
    Rejected,
}

impl ReloadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadOutcome::Applied => "applied",
            ReloadOutcome::Unchanged => "unchanged",
            ReloadOutcome::Rejected => "rejected",
        }
    }
}

/// Process-level metrics of `r-edged`.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    config_reloads_total: IntCounterVec,
    config_applied_timestamp: Gauge,
    workloads: IntGaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::new(
            "r_edged_starts_total",
            "Times the R-Edge daemon has initialised",
        )?;
        let buckets = prometheus::exponential_buckets(0.0005, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_edged_config_load_seconds",
                "Time spent reading and validating the configuration file",
            )
            .buckets(buckets),
        )?;
        let config_reloads_total = IntCounterVec::new(
            Opts::new(
                "r_edged_config_reloads_total",
                "Configuration reload checks by outcome",
            ),
            &["outcome"],
        )?;
        let config_applied_timestamp = Gauge::new(
            "r_edged_config_applied_timestamp_seconds",
            "Unix time at which the active workload set was applied",
        )?;
        let workloads = IntGaugeVec::new(
            Opts::new(
                "r_edged_workloads",
                "Workloads in the active configuration by enablement",
            ),
            &["enabled"],
        )?;

        registry.register(Box::new(starts_total.clone()))?;
        registry.register(Box::new(config_load_seconds.clone()))?;
        registry.register(Box::new(config_reloads_total.clone()))?;
        registry.register(Box::new(config_applied_timestamp.clone()))?;
        registry.register(Box::new(workloads.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            config_reloads_total,
            config_applied_timestamp,
            workloads,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn record_reload(&self, outcome: ReloadOutcome) {
        self.config_reloads_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Publish the size of a newly applied workload set.
    pub fn record_workloads_applied(&self, enabled: usize, disabled: usize) {
        self.workloads.with_label_values(&["true"]).set(enabled as i64);
        self.workloads.with_label_values(&["false"]).set(disabled as i64);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        self.config_applied_timestamp.set(now);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn daemon_metrics_render_by_label() {
        let registry = new_registry();
        let metrics = DaemonMetrics::new(registry.clone()).unwrap();
        metrics.inc_start();
        metrics.record_reload(ReloadOutcome::Unchanged);
        metrics.record_reload(ReloadOutcome::Unchanged);
        metrics.record_workloads_applied(2, 1);

        let text = render(&registry).unwrap();
        assert!(text.contains("r_edged_starts_total 1"));
        assert!(text.contains(r#"r_edged_config_reloads_total{outcome="unchanged"} 2"#));
        assert!(text.contains(r#"r_edged_workloads{enabled="true"} 2"#));
        assert!(text.contains(r#"r_edged_workloads{enabled="false"} 1"#));
        assert!(!text.contains("r_edged_config_applied_timestamp_seconds 0\n"));
    }

    #[test]
    fn second_registration_on_same_registry_fails() {
        let registry = new_registry();
        DaemonMetrics::new(registry.clone()).unwrap();
        assert!(DaemonMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_registered_metrics() {
        let registry = new_registry();
        let metrics = DaemonMetrics::new(registry.clone()).unwrap();
        metrics.record_workloads_applied(3, 0);

        let exporter = MetricsExporter::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(exporter.addr().port(), 0);
        let server = exporter.serve(registry).unwrap();

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#"r_edged_workloads{enabled="true"} 3"#));

        server.shutdown().await.unwrap();
    }
}
