//! Structured logging bootstrap and in-process metrics counters.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level module [instance_id] message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// ```rust,no_run
/// # use durotask::runtime::observability::{ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     ..Default::default()
/// };
/// ```
///
/// All runtime logs carry `instance_id`; dispatcher logs add `execution_id`
/// and `worker_id`, activity logs add `activity_name` and `activity_id`.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level applied to the `durotask::*` targets (e.g. "info", "debug").
    /// `RUST_LOG` takes precedence when set.
    pub log_level: String,
    pub service_name: String,
    /// Install a global subscriber when the runtime starts.
    pub init_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            service_name: "durotask".to_string(),
            init_logging: true,
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!(
        "warn,durotask::orchestration={level},durotask::activity={level},durotask::runtime={level},durotask::client={level}"
    )
}

/// Install a global `tracing` subscriber. Fails if one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|e| format!("Failed to initialize JSON logging: {e}"))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .map_err(|e| format!("Failed to initialize pretty logging: {e}"))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()
                .map_err(|e| format!("Failed to initialize compact logging: {e}"))?;
        }
    }

    Ok(())
}

/// Snapshot of the runtime counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub orch_completions: u64,
    pub orch_failures: u64,
    pub orch_continued_as_new: u64,
    pub orch_terminations: u64,
    pub orch_stalls: u64,
    pub activity_success: u64,
    pub activity_app_errors: u64,
    pub activity_infra_errors: u64,
    pub hub_errors: u64,
}

/// Lock-free counters updated by the dispatchers.
#[derive(Debug, Default)]
pub struct MetricsProvider {
    orch_completions: AtomicU64,
    orch_failures: AtomicU64,
    orch_continued_as_new: AtomicU64,
    orch_terminations: AtomicU64,
    orch_stalls: AtomicU64,
    activity_success: AtomicU64,
    activity_app_errors: AtomicU64,
    activity_infra_errors: AtomicU64,
    hub_errors: AtomicU64,
}

impl MetricsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_orchestration_completion(&self) {
        self.orch_completions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_orchestration_failure(&self) {
        self.orch_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_continue_as_new(&self) {
        self.orch_continued_as_new.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_orchestration_termination(&self) {
        self.orch_terminations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_orchestration_stall(&self) {
        self.orch_stalls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_success(&self) {
        self.activity_success.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_app_error(&self) {
        self.activity_app_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Unregistered activities and activity panics.
    #[inline]
    pub fn record_activity_infra_error(&self) {
        self.activity_infra_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_hub_error(&self) {
        self.hub_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            orch_completions: self.orch_completions.load(Ordering::Relaxed),
            orch_failures: self.orch_failures.load(Ordering::Relaxed),
            orch_continued_as_new: self.orch_continued_as_new.load(Ordering::Relaxed),
            orch_terminations: self.orch_terminations.load(Ordering::Relaxed),
            orch_stalls: self.orch_stalls.load(Ordering::Relaxed),
            activity_success: self.activity_success.load(Ordering::Relaxed),
            activity_app_errors: self.activity_app_errors.load(Ordering::Relaxed),
            activity_infra_errors: self.activity_infra_errors.load(Ordering::Relaxed),
            hub_errors: self.hub_errors.load(Ordering::Relaxed),
        }
    }
}
