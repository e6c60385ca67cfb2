use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::_typed_codec::{Codec, Json};
use crate::providers::{
    CreateInstanceRequest, InstanceIdPage, RerunRequest, ReusePolicy, TaskHub, TaskHubError, WorkflowMetadata,
};
use crate::runtime::limits::DEFAULT_PAGE_SIZE;
use crate::{Event, TraceContext};

/// Client-facing error for lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("instance '{0}' not found")]
    InstanceNotFound(String),
    #[error("instance '{0}' already exists")]
    DuplicateInstance(String),
    #[error("timed out after {timeout:?} waiting for instance '{instance_id}'")]
    Timeout { instance_id: String, timeout: Duration },
    #[error("instance '{instance_id}' is in an invalid state: {message}")]
    InvalidState { instance_id: String, message: String },
    #[error("payload encoding failed: {0}")]
    Codec(String),
    #[error(transparent)]
    Hub(TaskHubError),
}

impl From<TaskHubError> for ClientError {
    fn from(e: TaskHubError) -> Self {
        match e {
            TaskHubError::InstanceNotFound(id) => ClientError::InstanceNotFound(id),
            TaskHubError::DuplicateInstance(id) => ClientError::DuplicateInstance(id),
            TaskHubError::InvalidState { instance_id, message } => ClientError::InvalidState { instance_id, message },
            other => ClientError::Hub(other),
        }
    }
}

/// Options for [`Client::schedule_workflow`].
#[derive(Debug, Clone, Default)]
pub struct NewWorkflowOptions {
    /// Random UUID v4 when unset.
    pub instance_id: Option<String>,
    input: String,
    encode_error: Option<String>,
    /// Delay the first turn until this time.
    pub start_time: Option<DateTime<Utc>>,
    /// Pin a version of a versioned workflow; latest when unset.
    pub version: Option<String>,
    pub trace_context: Option<TraceContext>,
    pub reuse_policy: ReusePolicy,
}

impl NewWorkflowOptions {
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Serialize `value` as the workflow input.
    pub fn input<T: Serialize>(mut self, value: &T) -> Self {
        match Json::encode(value) {
            Ok(s) => self.input = s,
            Err(e) => self.encode_error = Some(e),
        }
        self
    }

    pub fn raw_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    pub fn start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn trace_context(mut self, trace_context: TraceContext) -> Self {
        self.trace_context = Some(trace_context);
        self
    }

    pub fn reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }

    /// Return the existing id instead of failing when the instance is live.
    pub fn ignore_duplicate(self) -> Self {
        self.reuse_policy(ReusePolicy::Ignore)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Include input, output and custom status.
    pub fetch_payloads: bool,
}

impl FetchOptions {
    pub fn fetch_payloads(mut self) -> Self {
        self.fetch_payloads = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RaiseEventOptions {
    payload: Option<String>,
    encode_error: Option<String>,
}

impl RaiseEventOptions {
    pub fn payload<T: Serialize>(mut self, value: &T) -> Self {
        match Json::encode(value) {
            Ok(s) => self.payload = Some(s),
            Err(e) => self.encode_error = Some(e),
        }
        self
    }

    pub fn raw_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TerminateOptions {
    pub output: Option<String>,
    /// Also terminate child instances.
    pub recursive: bool,
}

impl TerminateOptions {
    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeOptions {
    /// Also purge child instances.
    pub recursive: bool,
    /// Allow purging an instance that has not finished.
    pub force: bool,
}

impl PurgeOptions {
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RerunOptions {
    /// Random UUID v4 when unset.
    pub new_instance_id: Option<String>,
    /// Replaces the input of the rerun activity when set.
    pub input: Option<String>,
}

impl RerunOptions {
    pub fn new_instance_id(mut self, id: impl Into<String>) -> Self {
        self.new_instance_id = Some(id.into());
        self
    }

    pub fn overwrite_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListInstanceIdsOptions {
    /// `DEFAULT_PAGE_SIZE` when zero.
    pub page_size: usize,
    pub continuation_token: Option<String>,
}

impl ListInstanceIdsOptions {
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn continuation_token(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryOptions {
    /// Latest execution when unset.
    pub execution_id: Option<u64>,
}

impl HistoryOptions {
    pub fn execution_id(mut self, execution_id: u64) -> Self {
        self.execution_id = Some(execution_id);
        self
    }
}

/// Control-plane client.
///
/// Talks to the runtime exclusively through the shared [`TaskHub`]; any
/// number of clients and runtimes may share one hub.
#[derive(Clone)]
pub struct Client {
    hub: Arc<dyn TaskHub>,
}

impl Client {
    /// Create a client bound to a task hub.
    pub fn new(hub: Arc<dyn TaskHub>) -> Self {
        Self { hub }
    }

    /// Start a new workflow instance and return its id.
    pub async fn schedule_workflow(
        &self,
        name: impl Into<String>,
        options: NewWorkflowOptions,
    ) -> Result<String, ClientError> {
        if let Some(e) = options.encode_error {
            return Err(ClientError::Codec(e));
        }
        let name = name.into();
        let instance_id = options
            .instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let id = self
            .hub
            .create_instance(CreateInstanceRequest {
                instance_id,
                name: name.clone(),
                version: options.version,
                input: options.input,
                start_at: options.start_time,
                trace_context: options.trace_context,
                reuse_policy: options.reuse_policy,
            })
            .await?;
        info!(target: "durotask::client", instance_id = %id, workflow = %name, "workflow scheduled");
        Ok(id)
    }

    pub async fn fetch_metadata(&self, instance_id: &str, options: FetchOptions) -> Result<WorkflowMetadata, ClientError> {
        Ok(self.hub.fetch_metadata(instance_id, options.fetch_payloads).await?)
    }

    /// Wait until the instance has run its first turn.
    pub async fn wait_for_start(&self, instance_id: &str, timeout: Duration) -> Result<WorkflowMetadata, ClientError> {
        self.wait_until(instance_id, timeout, |md| md.runtime_status != crate::RuntimeStatus::Pending)
            .await
    }

    /// Wait until the instance completes, fails or is terminated.
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowMetadata, ClientError> {
        self.wait_until(instance_id, timeout, WorkflowMetadata::is_complete).await
    }

    async fn wait_until(
        &self,
        instance_id: &str,
        timeout: Duration,
        done: impl Fn(&WorkflowMetadata) -> bool,
    ) -> Result<WorkflowMetadata, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let md = self.hub.fetch_metadata(instance_id, true).await?;
            if done(&md) {
                return Ok(md);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout {
                    instance_id: instance_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Deliver an external event to a running instance.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        name: impl Into<String>,
        options: RaiseEventOptions,
    ) -> Result<(), ClientError> {
        if let Some(e) = options.encode_error {
            return Err(ClientError::Codec(e));
        }
        let name = name.into();
        self.hub.raise_event(instance_id, &name, options.payload).await?;
        debug!(target: "durotask::client", instance_id = %instance_id, event_name = %name, "event raised");
        Ok(())
    }

    /// Request termination. A no-op for instances that already finished.
    pub async fn terminate_workflow(&self, instance_id: &str, options: TerminateOptions) -> Result<(), ClientError> {
        self.hub
            .terminate(instance_id, options.output, options.recursive)
            .await?;
        info!(target: "durotask::client", instance_id = %instance_id, recursive = options.recursive, "termination requested");
        Ok(())
    }

    pub async fn suspend_workflow(&self, instance_id: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        Ok(self.hub.suspend(instance_id, &reason.into()).await?)
    }

    pub async fn resume_workflow(&self, instance_id: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        Ok(self.hub.resume(instance_id, &reason.into()).await?)
    }

    /// Delete an instance's state. Returns the number of instances removed.
    pub async fn purge_workflow_state(&self, instance_id: &str, options: PurgeOptions) -> Result<usize, ClientError> {
        let removed = self
            .hub
            .purge(instance_id, options.recursive, options.force)
            .await?;
        info!(target: "durotask::client", instance_id = %instance_id, removed, "instance purged");
        Ok(removed)
    }

    /// Start a new instance from a finished one's history, re-running the
    /// activity scheduled with sequence number `event_id`.
    pub async fn rerun_workflow_from_event(
        &self,
        instance_id: &str,
        event_id: u64,
        options: RerunOptions,
    ) -> Result<String, ClientError> {
        let new_instance_id = options
            .new_instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(self
            .hub
            .rerun_from_event(RerunRequest {
                source_instance_id: instance_id.to_string(),
                event_id,
                new_instance_id,
                input: options.input,
            })
            .await?)
    }

    pub async fn list_instance_ids(&self, options: ListInstanceIdsOptions) -> Result<InstanceIdPage, ClientError> {
        let page_size = if options.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            options.page_size
        };
        Ok(self
            .hub
            .list_instance_ids(page_size, options.continuation_token.as_deref())
            .await?)
    }

    pub async fn get_instance_history(&self, instance_id: &str, options: HistoryOptions) -> Result<Vec<Event>, ClientError> {
        Ok(self.hub.get_history(instance_id, options.execution_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeStatus;
    use crate::providers::in_memory::InMemoryTaskHub;

    fn client() -> Client {
        Client::new(Arc::new(InMemoryTaskHub::new()))
    }

    #[test]
    fn hub_errors_map_to_client_errors() {
        assert_eq!(
            ClientError::from(TaskHubError::InstanceNotFound("a".into())),
            ClientError::InstanceNotFound("a".into())
        );
        assert!(matches!(
            ClientError::from(TaskHubError::retryable("op", "busy")),
            ClientError::Hub(_)
        ));
    }

    #[tokio::test]
    async fn schedule_generates_an_id_and_rejects_live_duplicates() {
        let c = client();
        let id = c
            .schedule_workflow("W", NewWorkflowOptions::default().input(&42))
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        let md = c.fetch_metadata(&id, FetchOptions::default().fetch_payloads()).await.unwrap();
        assert_eq!(md.runtime_status, RuntimeStatus::Pending);
        assert_eq!(md.input.as_deref(), Some("42"));

        let dup = c
            .schedule_workflow("W", NewWorkflowOptions::default().instance_id(id.clone()))
            .await;
        assert_eq!(dup, Err(ClientError::DuplicateInstance(id.clone())));
        let same = c
            .schedule_workflow("W", NewWorkflowOptions::default().instance_id(id.clone()).ignore_duplicate())
            .await
            .unwrap();
        assert_eq!(same, id);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_without_a_runtime_times_out() {
        let c = client();
        let id = c
            .schedule_workflow("W", NewWorkflowOptions::default().instance_id("w"))
            .await
            .unwrap();
        let err = c.wait_for_start(&id, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));
        assert_eq!(
            c.wait_for_completion("missing", Duration::from_millis(50)).await.unwrap_err(),
            ClientError::InstanceNotFound("missing".into())
        );
    }

    #[tokio::test]
    async fn raise_event_on_unknown_instance_is_not_found() {
        let c = client();
        let err = c
            .raise_event("nope", "e", RaiseEventOptions::default().raw_payload("x"))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::InstanceNotFound("nope".into()));
    }
}
