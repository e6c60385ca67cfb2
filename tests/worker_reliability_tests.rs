use async_trait::async_trait;
use durotask::client::{Client, NewWorkflowOptions};
use durotask::providers::in_memory::InMemoryTaskHub;
use durotask::providers::{
    ActivityResponse, ActivityWorkItem, CreateInstanceRequest, InstanceIdPage, OrchestrationWorkItem,
    OrchestratorResponse, RerunRequest, TaskHub, TaskHubError, WorkflowMetadata,
};
use durotask::runtime::{Registry, Runtime};
use durotask::{ActivityContext, CallActivityOptions, Event, OrchestrationContext, RuntimeStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

mod common;

// ============================================================================
// Hub whose activity acknowledgements fail a fixed number of times
// ============================================================================

struct FailingAckHub {
    inner: InMemoryTaskHub,
    ack_failures_left: AtomicU32,
    abandoned: AtomicU32,
}

impl FailingAckHub {
    fn new(ack_failures: u32) -> Self {
        Self {
            inner: InMemoryTaskHub::new(),
            ack_failures_left: AtomicU32::new(ack_failures),
            abandoned: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskHub for FailingAckHub {
    async fn create_instance(&self, request: CreateInstanceRequest) -> Result<String, TaskHubError> {
        self.inner.create_instance(request).await
    }

    async fn fetch_metadata(&self, instance_id: &str, fetch_payloads: bool) -> Result<WorkflowMetadata, TaskHubError> {
        self.inner.fetch_metadata(instance_id, fetch_payloads).await
    }

    async fn raise_event(&self, instance_id: &str, name: &str, payload: Option<String>) -> Result<(), TaskHubError> {
        self.inner.raise_event(instance_id, name, payload).await
    }

    async fn terminate(&self, instance_id: &str, output: Option<String>, recursive: bool) -> Result<(), TaskHubError> {
        self.inner.terminate(instance_id, output, recursive).await
    }

    async fn suspend(&self, instance_id: &str, reason: &str) -> Result<(), TaskHubError> {
        self.inner.suspend(instance_id, reason).await
    }

    async fn resume(&self, instance_id: &str, reason: &str) -> Result<(), TaskHubError> {
        self.inner.resume(instance_id, reason).await
    }

    async fn purge(&self, instance_id: &str, recursive: bool, force: bool) -> Result<usize, TaskHubError> {
        self.inner.purge(instance_id, recursive, force).await
    }

    async fn rerun_from_event(&self, request: RerunRequest) -> Result<String, TaskHubError> {
        self.inner.rerun_from_event(request).await
    }

    async fn list_instance_ids(
        &self,
        page_size: usize,
        continuation_token: Option<&str>,
    ) -> Result<InstanceIdPage, TaskHubError> {
        self.inner.list_instance_ids(page_size, continuation_token).await
    }

    async fn get_history(&self, instance_id: &str, execution_id: Option<u64>) -> Result<Vec<Event>, TaskHubError> {
        self.inner.get_history(instance_id, execution_id).await
    }

    async fn fetch_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, TaskHubError> {
        self.inner.fetch_orchestration_work_item().await
    }

    async fn complete_orchestration_work_item(
        &self,
        token: &str,
        response: OrchestratorResponse,
    ) -> Result<(), TaskHubError> {
        self.inner.complete_orchestration_work_item(token, response).await
    }

    async fn abandon_orchestration_work_item(&self, token: &str) -> Result<(), TaskHubError> {
        self.inner.abandon_orchestration_work_item(token).await
    }

    async fn fetch_activity_work_item(&self) -> Result<Option<ActivityWorkItem>, TaskHubError> {
        self.inner.fetch_activity_work_item().await
    }

    async fn complete_activity_work_item(&self, token: &str, response: ActivityResponse) -> Result<(), TaskHubError> {
        let failing = self
            .ack_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TaskHubError::permanent("complete_activity_work_item", "store unavailable"));
        }
        self.inner.complete_activity_work_item(token, response).await
    }

    async fn abandon_activity_work_item(&self, token: &str) -> Result<(), TaskHubError> {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
        self.inner.abandon_activity_work_item(token).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn activity_runs_again_when_its_result_cannot_be_stored() {
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    let mut b = Registry::builder();
    b.add_activity("Charge", move |_ctx: ActivityContext, input: String| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("charged:{input}"))
        }
    })
    .unwrap()
    .add_workflow("Billing", |ctx: OrchestrationContext, input: String| async move {
        ctx.call_activity("Charge", CallActivityOptions::default().raw_input(input))
            .await
            .map_err(String::from)
    })
    .unwrap();

    let hub = Arc::new(FailingAckHub::new(1));
    let rt = Runtime::start_with_options(hub.clone(), b.build(), common::fast_options()).await;
    let client = Client::new(hub.clone());

    let id = client
        .schedule_workflow("Billing", NewWorkflowOptions::default().raw_input("42"))
        .await
        .unwrap();
    let md = client.wait_for_completion(&id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(md.runtime_status, RuntimeStatus::Completed);
    assert_eq!(md.output.as_deref(), Some("charged:42"));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(hub.abandoned.load(Ordering::SeqCst), 1);
    assert_eq!(rt.metrics_snapshot().hub_errors, 1);
    rt.shutdown(Some(Duration::from_millis(200))).await;
}
