//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the gateway runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "R_EDGE_LOG";
const FALLBACK_DIRECTIVE: &str = "info";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Console output format for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
    /// Single-line output for serial consoles.
    Compact,
}

/// Where the active filter directive came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterSource {
    Env(&'static str),
    Config,
    Fallback,
}

#[derive(Debug)]
struct ResolvedFilter {
    directive: String,
    source: FilterSource,
    rejected: Option<String>,
}

/// Pick the first usable directive: `R_EDGE_LOG`, `RUST_LOG`, `logging.level`, then `info`.
fn resolve_filter(
    edge_env: Option<String>,
    rust_env: Option<String>,
    configured: Option<&str>,
) -> ResolvedFilter {
    let candidates = [
        (edge_env, FilterSource::Env(LOG_ENV)),
        (rust_env, FilterSource::Env("RUST_LOG")),
        (configured.map(str::to_owned), FilterSource::Config),
    ];
    let mut rejected = None;
    for (directive, source) in candidates {
        let Some(directive) = directive.filter(|d| !d.trim().is_empty()) else {
            continue;
        };
        if EnvFilter::try_new(&directive).is_ok() {
            return ResolvedFilter {
                directive,
                source,
                rejected,
            };
        }
        rejected.get_or_insert(directive);
    }
    ResolvedFilter {
        directive: FALLBACK_DIRECTIVE.to_owned(),
        source: FilterSource::Fallback,
        rejected,
    }
}

/// Install the global subscriber for `service_name`.
///
/// Console output follows [`LoggingConfig::format`]. Unless `logging.file` is
/// disabled a daily rolling JSON file is written to `logging.directory` as well.
/// Calling this more than once keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let resolved = resolve_filter(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        config.level.as_deref(),
    );
    let filter = EnvFilter::try_new(&resolved.directive)
        .with_context(|| format!("invalid log directive `{}`", resolved.directive))?;

    let mut guards = Vec::with_capacity(2);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let console = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(stdout_writer);
    let console_layer = match config.format {
        LogFormat::StructuredJson => console.with_target(false).json().boxed(),
        LogFormat::Pretty => console.with_target(true).boxed(),
        LogFormat::Compact => console.with_target(false).compact().boxed(),
    };

    let file_layer = if config.file {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("unable to create log directory {}", config.directory.display())
        })?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let appender = daily(&config.directory, format!("{prefix}.log"));
        let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
        guards.push(file_guard);
        Some(
            fmt::layer()
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(file_writer)
                .boxed(),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return Ok(());
    }
    let _ = GUARDS.set(guards);

    if let Some(rejected) = &resolved.rejected {
        warn!(directive = %rejected, "ignoring invalid log directive");
    }
    info!(
        service = %service_name,
        filter = %resolved.directive,
        filter_source = ?resolved.source,
        format = ?config.format,
        log_dir = %config.directory.display(),
        log_file = config.file,
        "tracing initialised",
    );
    Ok(())
}
