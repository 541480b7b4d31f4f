//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the R-Edge daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use r_edge_api::{spawn_api_server, ApiServer, ApiState};
use r_edge_common::{hash_app_config, init_tracing, AppConfig, Mode};
use r_edge_metrics::{new_registry, spawn_http_server, DaemonMetrics, ReloadOutcome};
use r_edge_reconciler::{HostOptions, ReconcilerMetrics, TrustValidator, WorkloadFleet};
use r_edge_sim::{AllowlistValidator, SimulatedBackend};
use r_edge_workload::{parse_workloads, WorkloadDescriptor};
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "R-Edge gateway workload daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override application mode")]
    mode: Option<CliMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Production,
    Simulation,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Production => Mode::Production,
            CliMode::Simulation => Mode::Simulation,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Reconcile configured workloads until terminated")]
    Run,
    #[command(about = "Parse every workload and print its descriptor summary")]
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/r-edge.toml"));
    candidates.push(PathBuf::from("configs/example.sim.toml"));

    let load_started = Instant::now();
    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded_config.config;
    let config_path = loaded_config.source;
    let load_duration = load_started.elapsed();
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => check(&config, &config_path),
        Commands::Run => {
            init_tracing("r-edged", &config.logging)?;
            run_daemon(config, config_path, load_duration).await
        }
    }
}

fn check(config: &AppConfig, config_path: &Path) -> Result<()> {
    let descriptors = parse_workloads(&config.workload_properties())
        .with_context(|| format!("invalid workload in {}", config_path.display()))?;
    println!(
        "{}: {} workload(s), mode {:?}",
        config_path.display(),
        descriptors.len(),
        config.mode
    );
    for descriptor in &descriptors {
        println!("{}", summarise(descriptor));
    }
    Ok(())
}

fn summarise(descriptor: &WorkloadDescriptor) -> String {
    let retry = descriptor.retry_policy();
    let budget = if retry.is_unlimited() {
        "unlimited".to_string()
    } else {
        retry.max_retries().to_string()
    };
    format!(
        "  {name}: {state} {image} ports={ports} network={network} retries={budget} every {interval:?}{anchor}",
        name = descriptor.name(),
        state = if descriptor.enabled() { "enabled" } else { "disabled" },
        image = descriptor.image_reference(),
        ports = descriptor.ports().len(),
        network = descriptor.network_mode(),
        interval = retry.retry_interval(),
        anchor = descriptor
            .trust_anchor()
            .map(|anchor| format!(" trust-anchor={anchor}"))
            .unwrap_or_default(),
    )
}

async fn run_daemon(config: AppConfig, config_path: PathBuf, load_duration: Duration) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    let reconciler_metrics = ReconcilerMetrics::new(registry.clone())?;

    let mut config_hash = hash_app_config(&config)?;
    info!(config_path = %config_path.display(), config_hash = %config_hash, mode = ?config.mode, "configuration loaded");

    if !config.mode.is_simulation() {
        bail!(
            "production mode needs a container runtime backend, which this build does not provide; \
             run with --mode simulation or set mode = \"simulation\""
        );
    }

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let backend = Arc::new(SimulatedBackend::from_config(&config.simulation));
    let validator: Option<Arc<dyn TrustValidator>> = if config.simulation.trust_anchors.is_empty() {
        None
    } else {
        Some(Arc::new(AllowlistValidator::from_config(
            &config.simulation.trust_anchors,
        )))
    };
    let mut fleet = WorkloadFleet::new(
        backend,
        validator,
        HostOptions {
            trust_policy: config.reconciler.trust_policy,
            metrics: Some(reconciler_metrics),
        },
    );

    let descriptors = parse_workloads(&config.workload_properties())
        .with_context(|| format!("invalid workload in {}", config_path.display()))?;
    let (enabled, disabled) = count_enabled(&descriptors);
    let changes = fleet.apply(descriptors).await?;
    daemon_metrics.record_workloads_applied(enabled, disabled);
    info!(workloads = changes.added.len(), "workloads handed to reconcilers");

    let api_state = Arc::new(ApiState::new(config.mode, config_hash.clone(), fleet.board()));
    let mut api_server: Option<ApiServer> = None;
    if config.api.enabled {
        match spawn_api_server(api_state.clone(), config.api.listen) {
            Ok(server) => {
                info!(address = %server.addr(), "api server listening");
                api_server = Some(server);
            }
            Err(err) => {
                warn!(error = %err, "failed to start api server");
            }
        }
    } else {
        info!("api server disabled by configuration");
    }

    let mut connect_tick = interval(config.reconciler.connect_interval);
    connect_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    connect_tick.tick().await;
    let mut reload_tick = interval(config.reconciler.reload_interval);
    reload_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    reload_tick.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!(mode = ?config.mode, "daemon running; waiting for termination signal");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("termination signal received; shutting down");
                break;
            }
            _ = connect_tick.tick() => fleet.connect_all(),
            _ = reload_tick.tick() => {
                let outcome =
                    reload_workloads(&config_path, &mut config_hash, &mut fleet, &api_state, &daemon_metrics)
                        .await;
                daemon_metrics.record_reload(outcome);
            }
        }
    }

    fleet.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    if let Some(server) = api_server {
        server.shutdown().await?;
    }

    Ok(())
}

/// Re-read the configuration file and hand a changed workload set to the fleet.
///
/// Failures are logged and leave the running workloads in place.
async fn reload_workloads(
    config_path: &Path,
    config_hash: &mut String,
    fleet: &mut WorkloadFleet,
    api_state: &ApiState,
    metrics: &DaemonMetrics,
) -> ReloadOutcome {
    let (next, hash) = match read_if_changed(config_path, config_hash) {
        Ok(None) => return ReloadOutcome::Unchanged,
        Ok(Some(changed)) => changed,
        Err(err) => {
            warn!(error = %err, "failed to reload configuration; keeping current workloads");
            return ReloadOutcome::Rejected;
        }
    };
    let descriptors = match parse_workloads(&next.workload_properties()) {
        Ok(descriptors) => descriptors,
        Err(err) => {
            warn!(error = %err, "reloaded configuration rejected; keeping current workloads");
            *config_hash = hash;
            return ReloadOutcome::Rejected;
        }
    };

    let (enabled, disabled) = count_enabled(&descriptors);
    match fleet.apply(descriptors).await {
        Ok(changes) => {
            info!(
                config_hash = %hash,
                added = changes.added.len(),
                retained = changes.retained.len(),
                removed = changes.removed.len(),
                "configuration reloaded; settings outside [workloads] apply after restart",
            );
            metrics.record_workloads_applied(enabled, disabled);
            api_state.set_config_hash(hash.clone());
            *config_hash = hash;
            ReloadOutcome::Applied
        }
        Err(err) => {
            // The hash is kept so the next reload tick tries again.
            warn!(error = %err, "failed to apply reloaded workloads");
            ReloadOutcome::Rejected
        }
    }
}

/// `(enabled, disabled)` workload counts.
fn count_enabled(descriptors: &[WorkloadDescriptor]) -> (usize, usize) {
    let enabled = descriptors.iter().filter(|d| d.enabled()).count();
    (enabled, descriptors.len() - enabled)
}

/// Re-read the configuration file; `None` when its hash is unchanged.
fn read_if_changed(path: &Path, current_hash: &str) -> Result<Option<(AppConfig, String)>> {
    let next = AppConfig::from_path(path)?;
    let hash = hash_app_config(&next)?;
    if hash == current_hash {
        Ok(None)
    } else {
        Ok(Some((next, hash)))
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
