//! Task-hub interface.
//!
//! A task hub persists instance history and dispatches work: orchestration
//! work items (history plus newly arrived events) to the replay executor, and
//! activity work items to activity workers. The [`Client`](crate::client::Client)
//! talks to the same hub for lifecycle management.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Action, Event, FailureDetails, OrchestrationVersion, RuntimeStatus, TraceContext};

pub mod error;
pub mod in_memory;

pub use error::TaskHubError;

/// What to do when a new instance collides with a live one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReusePolicy {
    /// Reject with `DuplicateInstance`.
    #[default]
    Error,
    /// Keep the live instance and return its id.
    Ignore,
    /// Replace the live instance.
    TerminateExisting,
}

/// Request to create a new workflow instance.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub instance_id: String,
    pub name: String,
    pub version: Option<String>,
    pub input: String,
    pub start_at: Option<DateTime<Utc>>,
    pub trace_context: Option<TraceContext>,
    pub reuse_policy: ReusePolicy,
}

/// Client-side projection of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub instance_id: String,
    pub name: String,
    pub version: Option<String>,
    pub runtime_status: RuntimeStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Payload fields are `None` unless requested.
    pub input: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub failure_details: Option<FailureDetails>,
    pub execution_id: u64,
    pub parent_instance_id: Option<String>,
}

impl WorkflowMetadata {
    pub fn is_running(&self) -> bool {
        !self.runtime_status.is_terminal()
    }

    pub fn is_complete(&self) -> bool {
        self.runtime_status.is_terminal()
    }
}

/// Request to start a new instance from part of an existing one's history.
#[derive(Debug, Clone)]
pub struct RerunRequest {
    pub source_instance_id: String,
    /// Sequence number of the `TaskScheduled` event to rerun from.
    pub event_id: u64,
    pub new_instance_id: String,
    /// Replacement input for the rerun activity.
    pub input: Option<String>,
}

/// One page of instance ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceIdPage {
    pub instance_ids: Vec<String>,
    /// Pass back to fetch the next page; `None` on the last page.
    pub continuation_token: Option<String>,
}

/// Orchestration work handed to the replay executor.
#[derive(Debug, Clone)]
pub struct OrchestrationWorkItem {
    pub token: String,
    pub instance_id: String,
    pub execution_id: u64,
    pub old_events: Vec<Event>,
    pub new_events: Vec<Event>,
}

/// Result of one executor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorResponse {
    pub instance_id: String,
    pub actions: Vec<Action>,
    pub custom_status: Option<String>,
    /// Stamped onto this turn's `OrchestratorStarted` event.
    pub version: OrchestrationVersion,
}

impl OrchestratorResponse {
    pub fn is_final(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, Action::CompleteOrchestration { .. }))
    }
}

/// One activity attempt to execute.
#[derive(Debug, Clone)]
pub struct ActivityWorkItem {
    pub token: String,
    pub instance_id: String,
    pub execution_id: u64,
    pub task_id: u64,
    pub name: String,
    pub input: String,
    pub trace_context: Option<TraceContext>,
}

/// Outcome of an activity attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityResponse {
    pub instance_id: String,
    pub execution_id: u64,
    pub task_id: u64,
    pub outcome: Result<String, FailureDetails>,
}

/// Storage and dispatch backend.
///
/// Client-side methods manage instances; worker-side methods hand out work
/// items and accept their results. `fetch_*` methods return `Ok(None)` when
/// no work is available instead of blocking.
#[async_trait]
pub trait TaskHub: Send + Sync {
    // ----- client side -----

    /// Create an instance and return its id (the existing id under
    /// [`ReusePolicy::Ignore`]).
    async fn create_instance(&self, request: CreateInstanceRequest) -> Result<String, TaskHubError>;

    async fn fetch_metadata(&self, instance_id: &str, fetch_payloads: bool) -> Result<WorkflowMetadata, TaskHubError>;

    async fn raise_event(&self, instance_id: &str, name: &str, payload: Option<String>) -> Result<(), TaskHubError>;

    async fn terminate(&self, instance_id: &str, output: Option<String>, recursive: bool) -> Result<(), TaskHubError>;

    async fn suspend(&self, instance_id: &str, reason: &str) -> Result<(), TaskHubError>;

    async fn resume(&self, instance_id: &str, reason: &str) -> Result<(), TaskHubError>;

    /// Delete an instance's state. Returns the number of instances removed.
    async fn purge(&self, instance_id: &str, recursive: bool, force: bool) -> Result<usize, TaskHubError>;

    /// Start a new instance from a prefix of an existing history. Returns the new id.
    async fn rerun_from_event(&self, request: RerunRequest) -> Result<String, TaskHubError>;

    async fn list_instance_ids(
        &self,
        page_size: usize,
        continuation_token: Option<&str>,
    ) -> Result<InstanceIdPage, TaskHubError>;

    /// History of one execution; the latest when `execution_id` is `None`.
    async fn get_history(&self, instance_id: &str, execution_id: Option<u64>) -> Result<Vec<Event>, TaskHubError>;

    // ----- worker side -----

    async fn fetch_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, TaskHubError>;

    async fn complete_orchestration_work_item(
        &self,
        token: &str,
        response: OrchestratorResponse,
    ) -> Result<(), TaskHubError>;

    /// Return a work item's new events to the instance inbox for a later attempt.
    async fn abandon_orchestration_work_item(&self, token: &str) -> Result<(), TaskHubError>;

    async fn fetch_activity_work_item(&self) -> Result<Option<ActivityWorkItem>, TaskHubError>;

    async fn complete_activity_work_item(&self, token: &str, response: ActivityResponse) -> Result<(), TaskHubError>;

    /// Return a locked activity to the front of the queue so it runs again.
    async fn abandon_activity_work_item(&self, token: &str) -> Result<(), TaskHubError>;
}
