//! Deterministic, replay-driven durable workflow orchestration.
//!
//! Workflow functions receive an [`OrchestrationContext`] and issue durable
//! operations (activity calls, timers, child workflows, external-event waits).
//! Each operation returns a [`Task`] that resolves from recorded history, so
//! re-running the same function over the same history always makes the same
//! decisions. The crate provides:
//!
//! - Public data model: [`Event`], [`EventKind`], [`Action`], [`FailureDetails`]
//! - The orchestration and activity contexts
//! - A pure [`RetryPolicy`] evaluator
//! - A versioned function [`Registry`](runtime::registry::Registry)
//! - The replay executor and a worker [`Runtime`](runtime::Runtime)
//! - A [`Client`](client::Client) facade over a [`TaskHub`](providers::TaskHub)
//!
//! ```rust,no_run
//! use durotask::runtime::{Runtime, registry::Registry};
//! use durotask::providers::in_memory::InMemoryTaskHub;
//! use durotask::client::{Client, NewWorkflowOptions};
//! use durotask::{ActivityContext, CallActivityOptions, OrchestrationContext};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = Registry::builder();
//! builder.add_activity("Greet", |_ctx: ActivityContext, name: String| async move {
//!     Ok(format!("hello {name}"))
//! })?;
//! builder.add_workflow("Hello", |ctx: OrchestrationContext, input: String| async move {
//!     let greeting: String = ctx
//!         .call_activity("Greet", CallActivityOptions::default().raw_input(input))
//!         .get()
//!         .await?;
//!     Ok(greeting)
//! })?;
//!
//! let hub = Arc::new(InMemoryTaskHub::new());
//! let rt = Runtime::start(hub.clone(), builder.build()).await;
//! let client = Client::new(hub);
//! let id = client.schedule_workflow("Hello", NewWorkflowOptions::default().raw_input("world")).await?;
//! let md = client.wait_for_completion(&id, std::time::Duration::from_secs(5)).await?;
//! println!("{:?}", md.output);
//! rt.shutdown(None).await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

pub mod activity;
pub mod client;
pub mod context;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use crate::activity::ActivityContext;
pub use context::{
    CallActivityOptions, ChildWorkflowOptions, ContinueAsNewOptions, CreateTimerOptions, OrchestrationContext,
};
pub use crate::futures::{RawOutput, Task, TaskError, TaskOutput};
pub use retry::{RetryDecision, RetryPolicy};
pub use runtime::status::RuntimeStatus;

// Internal codec utilities for typed payloads (kept private; public API stays string-based)
//
// Typed values are always stored as JSON, strings included. Raw payloads
// (`raw_input`, `raw_payload`, activity results) are stored untouched and only
// read back through the raw `.await` path or as a fallback below.
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            serde_json::to_string(v).map_err(|e| e.to_string())
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            if s.is_empty() {
                // No payload: `()`/`Option` read it as null, `String` as ""
                return serde_json::from_value(Value::Null)
                    .or_else(|_| serde_json::from_value(Value::String(String::new())))
                    .map_err(|e| e.to_string());
            }
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                // Raw payloads that are not JSON read as a string value
                Err(json_err) => serde_json::from_value(Value::String(s.to_string())).map_err(|_| json_err.to_string()),
            }
        }
    }
}

/// W3C trace context carried across workflow, activity and child boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceContext {
    pub traceparent: String,
    pub tracestate: Option<String>,
}

impl TraceContext {
    pub fn new(traceparent: impl Into<String>) -> Self {
        Self {
            traceparent: traceparent.into(),
            tracestate: None,
        }
    }
}

/// Link from a child instance back to the parent task that created it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentInstance {
    pub instance_id: String,
    pub name: String,
    pub task_scheduled_id: u64,
}

/// Structured description of a failed task or orchestration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDetails {
    pub error_type: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub inner_failure: Option<Box<FailureDetails>>,
    /// Set by the producer when retrying can never help.
    pub is_non_retriable: bool,
}

impl FailureDetails {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
            inner_failure: None,
            is_non_retriable: false,
        }
    }

    pub fn non_retriable(mut self) -> Self {
        self.is_non_retriable = true;
        self
    }

    pub fn with_inner(mut self, inner: FailureDetails) -> Self {
        self.inner_failure = Some(Box::new(inner));
        self
    }

    pub fn display_message(&self) -> String {
        format!("{}: {}", self.error_type, self.message)
    }
}

impl std::fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Version information stamped onto the `OrchestratorStarted` event of a turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrchestrationVersion {
    /// Workflow version pinned on the first turn (versioned workflows only).
    pub name: Option<String>,
    /// Patches first observed during this turn.
    pub patches: Vec<String>,
}

/// Why an instance stopped making progress without failing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StalledReason {
    /// The pinned or requested workflow version is not registered in this worker.
    VersionNotAvailable,
    /// Replayed code diverged from recorded history.
    PatchMismatch,
}

impl std::fmt::Display for StalledReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StalledReason::VersionNotAvailable => f.write_str("VERSION_NOT_AVAILABLE"),
            StalledReason::PatchMismatch => f.write_str("PATCH_MISMATCH"),
        }
    }
}

/// Append-only history entry. Scheduling events carry the sequence number
/// assigned by the context when the operation was issued; completions point
/// back to it through `task_scheduled_id` / `timer_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Wall-clock time recorded by the task hub (milliseconds since epoch).
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    /// First event of every execution.
    ExecutionStarted {
        name: String,
        version: Option<String>,
        input: String,
        parent: Option<ParentInstance>,
        scheduled_start_ms: Option<u64>,
        trace_context: Option<TraceContext>,
    },
    /// Marks the beginning of a turn; its timestamp is the logical "now".
    OrchestratorStarted { version: Option<OrchestrationVersion> },
    TaskScheduled {
        task_id: u64,
        name: String,
        input: String,
        trace_context: Option<TraceContext>,
    },
    TaskCompleted { task_scheduled_id: u64, result: String },
    TaskFailed { task_scheduled_id: u64, details: FailureDetails },
    TimerCreated {
        timer_id: u64,
        fire_at_ms: u64,
        name: Option<String>,
    },
    TimerFired { timer_id: u64, fire_at_ms: u64 },
    SubOrchestrationCreated {
        task_id: u64,
        name: String,
        instance_id: String,
        input: String,
        version: Option<String>,
    },
    SubOrchestrationCompleted { task_scheduled_id: u64, result: String },
    SubOrchestrationFailed { task_scheduled_id: u64, details: FailureDetails },
    EventRaised { name: String, input: String },
    ExecutionSuspended { reason: String },
    ExecutionResumed { reason: String },
    ExecutionTerminated { output: String, recursive: bool },
    ExecutionCompleted { output: String },
    ExecutionFailed { details: FailureDetails },
    ExecutionContinuedAsNew { input: String },
    ExecutionStalled { reason: StalledReason, description: String },
}

impl Event {
    pub fn new(timestamp_ms: u64, kind: EventKind) -> Self {
        Self { timestamp_ms, kind }
    }

    /// Sequence number of a scheduling event, if this is one.
    pub fn scheduled_id(&self) -> Option<u64> {
        match &self.kind {
            EventKind::TaskScheduled { task_id, .. } | EventKind::SubOrchestrationCreated { task_id, .. } => {
                Some(*task_id)
            }
            EventKind::TimerCreated { timer_id, .. } => Some(*timer_id),
            _ => None,
        }
    }

    /// Sequence number this completion resolves, if this is a completion.
    pub fn completed_id(&self) -> Option<u64> {
        match &self.kind {
            EventKind::TaskCompleted { task_scheduled_id, .. }
            | EventKind::TaskFailed { task_scheduled_id, .. }
            | EventKind::SubOrchestrationCompleted { task_scheduled_id, .. }
            | EventKind::SubOrchestrationFailed { task_scheduled_id, .. } => Some(*task_scheduled_id),
            EventKind::TimerFired { timer_id, .. } => Some(*timer_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ExecutionCompleted { .. }
                | EventKind::ExecutionFailed { .. }
                | EventKind::ExecutionContinuedAsNew { .. }
                | EventKind::ExecutionTerminated { .. }
        )
    }
}

/// How an orchestration execution ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
}

/// Declarative decisions produced by an orchestration turn. The task hub is
/// responsible for materializing these into the corresponding `Event`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ScheduleTask {
        id: u64,
        name: String,
        input: String,
        trace_context: Option<TraceContext>,
    },
    CreateTimer {
        id: u64,
        fire_at_ms: u64,
        name: Option<String>,
    },
    CreateSubOrchestration {
        id: u64,
        name: String,
        instance_id: String,
        input: String,
        version: Option<String>,
        trace_context: Option<TraceContext>,
    },
    CompleteOrchestration {
        status: CompletionStatus,
        result: Option<String>,
        failure: Option<FailureDetails>,
        /// Unprocessed external events carried into the next execution (continue-as-new only).
        carryover_events: Vec<Event>,
    },
    StallOrchestration {
        reason: StalledReason,
        description: String,
    },
}

impl Action {
    /// Sequence number for scheduling actions.
    pub fn id(&self) -> Option<u64> {
        match self {
            Action::ScheduleTask { id, .. }
            | Action::CreateTimer { id, .. }
            | Action::CreateSubOrchestration { id, .. } => Some(*id),
            Action::CompleteOrchestration { .. } | Action::StallOrchestration { .. } => None,
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Action::ScheduleTask { .. } => "ScheduleTask",
            Action::CreateTimer { .. } => "CreateTimer",
            Action::CreateSubOrchestration { .. } => "CreateSubOrchestration",
            Action::CompleteOrchestration { .. } => "CompleteOrchestration",
            Action::StallOrchestration { .. } => "StallOrchestration",
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
