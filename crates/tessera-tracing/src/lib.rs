//! Shared tracing setup for the tessera workspace.
//!
//! Binaries, integration tests and benches install their `tracing`
//! subscriber through [`init_global_tracing`] so that program build and
//! execute events look the same everywhere. The [`performance`] module and
//! the exported macros wrap the timing spans used around partitioning,
//! sub-program builds and per-call execution.

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Crates whose targets are raised to debug by the `performance` profile.
const WORKSPACE_TARGETS: &[&str] = &["tessera_core", "tessera_backends", "tessera_ir"];

/// How the shared subscriber should filter and format events.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Explicit filter directives (e.g. `tessera_core=debug,info`). When
    /// absent `RUST_LOG` is consulted, then [`TracingConfig::default_directive`].
    pub directives: Option<String>,
    /// Directive used when nothing else resolves to a valid filter.
    pub default_directive: String,
    /// Print event targets (module paths).
    pub include_targets: bool,
    /// ANSI colours. Off for CI logs.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Formatter output.
    pub output: TracingOutput,
    /// When false, [`performance::PerformanceSpan`] guards stay silent.
    pub enable_performance_tracing: bool,
    /// Spans shorter than this many microseconds are not reported.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, coloured output for local development.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    /// JSON output without colours for CI and log collectors.
    pub fn for_ci() -> Self {
        Self {
            ansi: false,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            ..Self::for_local()
        }
    }

    /// Debug-level workspace targets with span close events, for profiling
    /// build and execute stages.
    pub fn for_performance() -> Self {
        let directives = WORKSPACE_TARGETS
            .iter()
            .map(|target| format!("{target}=debug"))
            .collect::<Vec<_>>()
            .join(",");
        Self {
            directives: Some(directives),
            ansi: false,
            span_events: FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            ..Self::for_local()
        }
    }

    /// Build a configuration from `TESSERA_*` environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TESSERA_TRACING_PROFILE` - `local` (default), `ci` or `performance`
    /// - `TESSERA_TRACING_DIRECTIVES` - overrides filter directives
    /// - `TESSERA_TRACING_FORMAT` - `pretty`, `compact` or `json`
    /// - `TESSERA_PERF_TRACING` - `true`/`1`/`yes` enables performance spans
    /// - `TESSERA_PERF_THRESHOLD_US` - minimum span duration to report
    pub fn from_env() -> Self {
        let profile = env::var("TESSERA_TRACING_PROFILE")
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "performance" => Self::for_performance(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var("TESSERA_TRACING_DIRECTIVES") {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var("TESSERA_TRACING_FORMAT") {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if config.output == TracingOutput::Json {
                    config.ansi = false;
                }
            }
        }

        if let Ok(flag) = env::var("TESSERA_PERF_TRACING") {
            config.enable_performance_tracing = parse_flag(&flag);
        }

        if let Ok(threshold) = env::var("TESSERA_PERF_THRESHOLD_US") {
            if let Ok(threshold_us) = threshold.trim().parse::<u64>() {
                config.performance_threshold_us = Some(threshold_us);
            }
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Accepts the truthy spellings used by every `TESSERA_*` boolean variable.
pub fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

/// Failures while installing the shared subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    /// The directive string could not be parsed.
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),
    /// A global subscriber was already installed.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber from `config` without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.resolve_filter()?;
    Ok(Registry::default().with(format_layer(config)).with(filter))
}

fn format_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_span_events(config.span_events.clone());
    match config.output {
        TracingOutput::Compact => Box::new(layer.compact().with_ansi(config.ansi)),
        TracingOutput::Pretty => Box::new(layer.pretty().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(layer.json().with_ansi(false)),
    }
}

/// Install the configured subscriber process-wide and apply the
/// performance-span settings.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    performance::configure(config.enable_performance_tracing, config.performance_threshold_us);
    build_subscriber(config)?.try_init()?;
    Ok(())
}

/// Formatter output choices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "TESSERA_TRACING_PROFILE",
        "TESSERA_TRACING_DIRECTIVES",
        "TESSERA_TRACING_FORMAT",
        "TESSERA_PERF_TRACING",
        "TESSERA_PERF_THRESHOLD_US",
    ];

    fn reset_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn rejects_invalid_directive() {
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    fn builds_every_output_format() {
        for output in [TracingOutput::Compact, TracingOutput::Pretty, TracingOutput::Json] {
            let config = TracingConfig {
                directives: Some("info".to_string()),
                output,
                ..TracingConfig::default()
            };
            assert!(build_subscriber(&config).is_ok());
        }
    }

    #[test]
    #[serial]
    fn from_env_respects_profile_and_format() {
        reset_env();
        env::set_var("TESSERA_TRACING_PROFILE", "ci");
        env::set_var("TESSERA_TRACING_FORMAT", "compact");
        env::set_var("TESSERA_TRACING_DIRECTIVES", "tessera_core=trace");

        let config = TracingConfig::from_env();
        assert_eq!(config.directives.as_deref(), Some("tessera_core=trace"));
        assert!(!config.ansi);
        assert_eq!(config.output, TracingOutput::Compact);
        reset_env();
    }

    #[test]
    #[serial]
    fn from_env_reads_performance_settings() {
        reset_env();
        env::set_var("TESSERA_PERF_TRACING", "yes");
        env::set_var("TESSERA_PERF_THRESHOLD_US", "250");

        let config = TracingConfig::from_env();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.performance_threshold_us, Some(250));
        reset_env();
    }

    #[test]
    fn performance_preset_targets_workspace_crates() {
        let config = TracingConfig::for_performance();
        let directives = config.directives.unwrap_or_default();
        assert!(directives.contains("tessera_core=debug"));
        assert!(directives.contains("tessera_backends=debug"));
        assert_eq!(config.output, TracingOutput::Json);
        assert!(config.enable_performance_tracing);
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag("1"));
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("off"));
    }
}
