use durotask::client::{
    ClientError, FetchOptions, HistoryOptions, ListInstanceIdsOptions, NewWorkflowOptions, PurgeOptions,
    RaiseEventOptions, RerunOptions, TerminateOptions,
};
use durotask::runtime::Registry;
use durotask::{ActivityContext, CallActivityOptions, ChildWorkflowOptions, EventKind, OrchestrationContext, RuntimeStatus};
use std::time::Duration;

mod common;
use common::Harness;

const WAIT: Duration = Duration::from_secs(10);

fn registry() -> Registry {
    let mut b = Registry::builder();
    b.add_activity("Step", |_ctx: ActivityContext, input: String| async move { Ok(format!("{input}+s")) })
        .unwrap()
        .add_workflow("Pipeline", |ctx: OrchestrationContext, input: String| async move {
            let a: String = ctx
                .call_activity("Step", CallActivityOptions::default().raw_input(input))
                .get()
                .await?;
            let b: String = ctx
                .call_activity("Step", CallActivityOptions::default().raw_input(a))
                .get()
                .await?;
            Ok(b)
        })
        .unwrap()
        .add_workflow("Gate", |ctx: OrchestrationContext, _input: String| async move {
            ctx.set_custom_status("waiting for go");
            let v: String = ctx.wait_for_external_event("go", None).get().await?;
            ctx.set_custom_status("released");
            Ok(format!("passed:{v}"))
        })
        .unwrap()
        .add_workflow("GateParent", |ctx: OrchestrationContext, _input: String| async move {
            let r: String = ctx
                .call_child_workflow("Gate", ChildWorkflowOptions::default().instance_id("gate-child"))
                .get()
                .await?;
            Ok(r)
        })
        .unwrap();
    b.build()
}

// ============================================================================
// Suspend and resume
// ============================================================================

#[tokio::test]
async fn suspended_instance_defers_events_until_resumed() {
    let h = Harness::start(registry()).await;
    let id = h
        .client
        .schedule_workflow("Gate", NewWorkflowOptions::default().instance_id("gate"))
        .await
        .unwrap();
    h.client.wait_for_start(&id, WAIT).await.unwrap();

    h.client.suspend_workflow(&id, "maintenance").await.unwrap();
    // Suspending twice is fine
    h.client.suspend_workflow(&id, "again").await.unwrap();
    h.client
        .raise_event(&id, "go", RaiseEventOptions::default().raw_payload("1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let md = h.client.fetch_metadata(&id, FetchOptions::default()).await.unwrap();
    assert_eq!(md.runtime_status, RuntimeStatus::Suspended);

    h.client.resume_workflow(&id, "done").await.unwrap();
    let md = h.client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(md.runtime_status, RuntimeStatus::Completed);
    assert_eq!(md.output.as_deref(), Some("passed:1"));

    assert!(matches!(
        h.client.resume_workflow(&id, "late").await,
        Err(ClientError::InvalidState { .. })
    ));
    h.shutdown().await;
}

// ============================================================================
// Terminate
// ============================================================================

#[tokio::test]
async fn recursive_terminate_reaches_children() {
    let h = Harness::start(registry()).await;
    let id = h
        .client
        .schedule_workflow("GateParent", NewWorkflowOptions::default().instance_id("parent"))
        .await
        .unwrap();
    assert!(common::wait_for_status(&h.client, "gate-child", RuntimeStatus::Running, 5_000).await);
    let child = h.client.fetch_metadata("gate-child", FetchOptions::default()).await.unwrap();
    assert_eq!(child.parent_instance_id.as_deref(), Some("parent"));

    h.client
        .terminate_workflow(&id, TerminateOptions::default().output("stop").recursive())
        .await
        .unwrap();
    let parent = h.client.wait_for_completion(&id, WAIT).await.unwrap();
    let child = h.client.wait_for_completion("gate-child", WAIT).await.unwrap();
    assert_eq!(parent.runtime_status, RuntimeStatus::Terminated);
    assert_eq!(child.runtime_status, RuntimeStatus::Terminated);
    assert_eq!(child.output.as_deref(), Some("stop"));

    // Terminating a finished instance is a no-op
    h.client
        .terminate_workflow(&id, TerminateOptions::default())
        .await
        .unwrap();
    h.shutdown().await;
}

// ============================================================================
// Purge
// ============================================================================

#[tokio::test]
async fn purge_removes_finished_instances_and_their_children() {
    let h = Harness::start(registry()).await;
    let id = h
        .client
        .schedule_workflow("GateParent", NewWorkflowOptions::default().instance_id("tree"))
        .await
        .unwrap();
    assert!(common::wait_for_status(&h.client, "gate-child", RuntimeStatus::Running, 5_000).await);

    assert!(matches!(
        h.client.purge_workflow_state(&id, PurgeOptions::default()).await,
        Err(ClientError::InvalidState { .. })
    ));

    h.client
        .raise_event("gate-child", "go", RaiseEventOptions::default().raw_payload("ok"))
        .await
        .unwrap();
    let md = h.client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(md.output.as_deref(), Some("passed:ok"));

    let removed = h
        .client
        .purge_workflow_state(&id, PurgeOptions::default().recursive())
        .await
        .unwrap();
    assert_eq!(removed, 2);
    for gone in [id.as_str(), "gate-child"] {
        assert!(matches!(
            h.client.fetch_metadata(gone, FetchOptions::default()).await,
            Err(ClientError::InstanceNotFound(_))
        ));
    }
    h.shutdown().await;
}

#[tokio::test]
async fn forced_purge_removes_a_running_instance() {
    let h = Harness::start(registry()).await;
    let id = h
        .client
        .schedule_workflow("Gate", NewWorkflowOptions::default())
        .await
        .unwrap();
    h.client.wait_for_start(&id, WAIT).await.unwrap();
    let removed = h
        .client
        .purge_workflow_state(&id, PurgeOptions::default().force())
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(matches!(
        h.client.raise_event(&id, "go", RaiseEventOptions::default()).await,
        Err(ClientError::InstanceNotFound(_))
    ));
    h.shutdown().await;
}

// ============================================================================
// Rerun
// ============================================================================

#[tokio::test]
async fn rerun_from_second_activity_with_new_input() {
    let h = Harness::start(registry()).await;
    let id = h
        .client
        .schedule_workflow("Pipeline", NewWorkflowOptions::default().instance_id("pipe").raw_input("x"))
        .await
        .unwrap();
    let md = h.client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(md.output.as_deref(), Some("x+s+s"));

    let rerun = h
        .client
        .rerun_workflow_from_event(
            &id,
            1,
            RerunOptions::default().new_instance_id("pipe-rerun").overwrite_input("y"),
        )
        .await
        .unwrap();
    assert_eq!(rerun, "pipe-rerun");
    let md = h.client.wait_for_completion(&rerun, WAIT).await.unwrap();
    assert_eq!(md.runtime_status, RuntimeStatus::Completed);
    assert_eq!(md.output.as_deref(), Some("y+s"));

    // The first activity's outcome was copied, not re-run
    let hist = h.history(&rerun).await;
    let scheduled = hist
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskScheduled { .. }))
        .count();
    assert_eq!(scheduled, 2);
    h.shutdown().await;
}

#[tokio::test]
async fn rerun_requires_a_finished_source_and_a_known_event() {
    let h = Harness::start(registry()).await;
    let running = h
        .client
        .schedule_workflow("Gate", NewWorkflowOptions::default())
        .await
        .unwrap();
    h.client.wait_for_start(&running, WAIT).await.unwrap();
    assert!(matches!(
        h.client
            .rerun_workflow_from_event(&running, 0, RerunOptions::default())
            .await,
        Err(ClientError::InvalidState { .. })
    ));

    let done = h
        .client
        .schedule_workflow("Pipeline", NewWorkflowOptions::default().raw_input("x"))
        .await
        .unwrap();
    h.client.wait_for_completion(&done, WAIT).await.unwrap();
    assert!(matches!(
        h.client.rerun_workflow_from_event(&done, 99, RerunOptions::default()).await,
        Err(ClientError::InvalidState { .. })
    ));
    h.shutdown().await;
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn list_instance_ids_pages_through_every_instance() {
    let h = Harness::start(registry()).await;
    for n in 0..5 {
        h.client
            .schedule_workflow("Pipeline", NewWorkflowOptions::default().instance_id(format!("list-{n}")))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut options = ListInstanceIdsOptions::default().page_size(2);
    loop {
        let page = h.client.list_instance_ids(options.clone()).await.unwrap();
        assert!(page.instance_ids.len() <= 2);
        seen.extend(page.instance_ids);
        match page.continuation_token {
            Some(token) => options = ListInstanceIdsOptions::default().page_size(2).continuation_token(token),
            None => break,
        }
    }
    assert_eq!(seen, vec!["list-0", "list-1", "list-2", "list-3", "list-4"]);
    h.shutdown().await;
}

#[tokio::test]
async fn metadata_payloads_are_only_returned_on_request() {
    let h = Harness::start(registry()).await;
    let id = h
        .client
        .schedule_workflow("Gate", NewWorkflowOptions::default().raw_input("in"))
        .await
        .unwrap();
    h.client.wait_for_start(&id, WAIT).await.unwrap();

    let bare = h.client.fetch_metadata(&id, FetchOptions::default()).await.unwrap();
    assert!(bare.input.is_none());
    assert!(bare.custom_status.is_none());
    assert_eq!(bare.name, "Gate");

    let full = h
        .client
        .fetch_metadata(&id, FetchOptions::default().fetch_payloads())
        .await
        .unwrap();
    assert_eq!(full.input.as_deref(), Some("in"));
    assert_eq!(full.custom_status.as_deref(), Some("waiting for go"));

    h.client
        .raise_event(&id, "go", RaiseEventOptions::default().raw_payload("now"))
        .await
        .unwrap();
    let done = h.client.wait_for_completion(&id, WAIT).await.unwrap();
    assert_eq!(done.custom_status.as_deref(), Some("released"));
    h.shutdown().await;
}

#[tokio::test]
async fn history_is_available_per_execution() {
    let h = Harness::start(registry()).await;
    let id = h
        .client
        .schedule_workflow("Pipeline", NewWorkflowOptions::default().raw_input("h"))
        .await
        .unwrap();
    h.client.wait_for_completion(&id, WAIT).await.unwrap();

    let latest = h.client.get_instance_history(&id, HistoryOptions::default()).await.unwrap();
    let first = h
        .client
        .get_instance_history(&id, HistoryOptions::default().execution_id(1))
        .await
        .unwrap();
    assert_eq!(latest, first);
    assert!(matches!(first.first().map(|e| &e.kind), Some(EventKind::OrchestratorStarted { .. })));
    assert!(matches!(
        first.last().map(|e| &e.kind),
        Some(EventKind::ExecutionCompleted { output }) if output == "h+s+s"
    ));
    assert!(matches!(
        h.client
            .get_instance_history(&id, HistoryOptions::default().execution_id(7))
            .await,
        Err(ClientError::InvalidState { .. })
    ));
    h.shutdown().await;
}

// ============================================================================
// Duplicates
// ============================================================================

#[tokio::test]
async fn duplicate_live_instance_ids_follow_the_reuse_policy() {
    let h = Harness::start(registry()).await;
    let opts = || NewWorkflowOptions::default().instance_id("dup");
    h.client.schedule_workflow("Gate", opts()).await.unwrap();
    assert_eq!(
        h.client.schedule_workflow("Gate", opts()).await,
        Err(ClientError::DuplicateInstance("dup".into()))
    );
    assert_eq!(
        h.client.schedule_workflow("Gate", opts().ignore_duplicate()).await.unwrap(),
        "dup"
    );

    // Once finished the id can be reused
    h.client
        .terminate_workflow("dup", TerminateOptions::default())
        .await
        .unwrap();
    h.client.wait_for_completion("dup", WAIT).await.unwrap();
    h.client
        .schedule_workflow("Pipeline", opts().raw_input("again"))
        .await
        .unwrap();
    let md = h.client.wait_for_completion("dup", WAIT).await.unwrap();
    assert_eq!(md.output.as_deref(), Some("again+s+s"));
    h.shutdown().await;
}
