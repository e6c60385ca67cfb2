//! Worker runtime: dispatch loops that pull work from a [`TaskHub`], replay
//! orchestrations through the executor and run activities.

use crate::providers::{TaskHub, TaskHubError};
use crate::{ActivityContext, OrchestrationContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod dispatchers;
pub mod executor;
pub mod limits;
pub mod observability;
pub mod registry;
pub mod status;

pub use executor::OrchestrationExecutor;
pub use observability::{LogFormat, MetricsProvider, MetricsSnapshot, ObservabilityConfig};
pub use registry::{Registry, RegistryBuilder, RegistryError};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls when the hub has no work.
    /// Lower values = more responsive, higher CPU usage when idle.
    pub dispatcher_idle_sleep: Duration,
    /// Number of concurrent orchestration dispatchers.
    pub orchestration_concurrency: usize,
    /// Number of concurrent activity workers.
    pub worker_concurrency: usize,
    /// Attempts for a failing hub acknowledgement before giving up.
    pub ack_max_attempts: u32,
    pub observability: ObservabilityConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(10),
            orchestration_concurrency: 2,
            worker_concurrency: 2,
            ack_max_attempts: 5,
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Trait implemented by workflow handlers that can be invoked by the runtime.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F>(pub F);

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers that can be invoked by the runtime.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// In-process runtime that replays orchestrations and executes activities
/// against a task hub.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    hub: Arc<dyn TaskHub>,
    executor: OrchestrationExecutor,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    /// Cooperative cancellation for running activities.
    cancel_tx: watch::Sender<bool>,
    metrics: Arc<MetricsProvider>,
    runtime_id: String,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start(hub: Arc<dyn TaskHub>, registry: Registry) -> Arc<Self> {
        Self::start_with_options(hub, registry, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(hub: Arc<dyn TaskHub>, registry: Registry, options: RuntimeOptions) -> Arc<Self> {
        if options.observability.init_logging
            && let Err(e) = observability::init_logging(&options.observability)
        {
            // A subscriber is already installed (tests, multiple runtimes)
            debug!(target: "durotask::runtime", error = %e, "logging not initialized");
        }

        let (cancel_tx, _) = watch::channel(false);
        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            hub,
            executor: OrchestrationExecutor::new(registry),
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            cancel_tx,
            metrics: Arc::new(MetricsProvider::new()),
            runtime_id,
        });

        let mut joins = Vec::new();
        joins.extend(runtime.clone().start_orchestration_dispatcher());
        joins.extend(runtime.clone().start_work_dispatcher());
        runtime.joins.lock().await.extend(joins);

        info!(
            target: "durotask::runtime",
            runtime_id = %runtime.runtime_id,
            orchestration_concurrency = runtime.options.orchestration_concurrency,
            worker_concurrency = runtime.options.worker_concurrency,
            workflows = ?runtime.executor.registry().workflow_names(),
            activities = ?runtime.executor.registry().activity_names(),
            "runtime started"
        );
        runtime
    }

    pub fn registry(&self) -> &Registry {
        self.executor.registry()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the dispatchers. Running activities are signalled to cancel and
    /// given `timeout` (default 1s) to finish before their tasks are aborted.
    pub async fn shutdown(self: Arc<Self>, timeout: Option<Duration>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let _ = self.cancel_tx.send(true);

        let grace = timeout.unwrap_or(Duration::from_secs(1));
        let mut joins = self.joins.lock().await;
        let deadline = tokio::time::Instant::now() + grace;
        for j in joins.iter_mut() {
            if tokio::time::timeout_at(deadline, &mut *j).await.is_err() {
                j.abort();
            }
        }
        joins.clear();
        info!(target: "durotask::runtime", runtime_id = %self.runtime_id, "runtime stopped");
    }

    /// Run a hub operation, retrying retryable errors with exponential backoff.
    async fn execute_with_retry<T, F, R>(&self, operation_tag: &str, operation: F) -> Result<T, TaskHubError>
    where
        F: Fn() -> R,
        R: std::future::Future<Output = Result<T, TaskHubError>>,
    {
        let max_attempts = self.options.ack_max_attempts.max(1);
        let mut attempts: u32 = 0;
        loop {
            match operation().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempts + 1 < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts.min(16));
                    warn!(
                        target: "durotask::runtime",
                        attempts,
                        backoff_ms,
                        error = %e,
                        "{} failed; retrying",
                        operation_tag
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    self.metrics.record_hub_error();
                    warn!(target: "durotask::runtime", attempts, error = %e, "Failed to {}", operation_tag);
                    return Err(e);
                }
            }
        }
    }
}
