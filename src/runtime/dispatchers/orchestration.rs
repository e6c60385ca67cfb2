//! Orchestration dispatcher: fetches work items, runs one replay pass per
//! item and hands the resulting actions back to the hub.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::{OrchestrationWorkItem, OrchestratorResponse};
use crate::runtime::Runtime;
use crate::{Action, CompletionStatus};

impl Runtime {
    /// Start N concurrent orchestration dispatchers.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.options.orchestration_concurrency.max(1))
            .map(|idx| {
                let rt = self.clone();
                let worker_id = format!("orch-{idx}-{}", rt.runtime_id);
                tokio::spawn(async move { rt.orchestration_loop(worker_id).await })
            })
            .collect()
    }

    async fn orchestration_loop(self: Arc<Self>, worker_id: String) {
        debug!(target: "durotask::runtime", worker_id = %worker_id, "orchestration dispatcher started");
        while !self.shutdown_flag.load(Ordering::Relaxed) {
            match self.hub.fetch_orchestration_work_item().await {
                Ok(Some(item)) => self.process_orchestration_item(item, &worker_id).await,
                Ok(None) => tokio::time::sleep(self.options.dispatcher_idle_sleep).await,
                Err(e) => {
                    warn!(target: "durotask::runtime", worker_id = %worker_id, error = %e, "fetch_orchestration_work_item failed");
                    self.metrics.record_hub_error();
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                }
            }
        }
        debug!(target: "durotask::runtime", worker_id = %worker_id, "orchestration dispatcher exiting");
    }

    async fn process_orchestration_item(&self, item: OrchestrationWorkItem, worker_id: &str) {
        debug!(
            target: "durotask::runtime",
            instance_id = %item.instance_id,
            execution_id = %item.execution_id,
            worker_id = %worker_id,
            new_events = item.new_events.len(),
            "Orchestration turn started"
        );
        let response = self
            .executor
            .execute(&item.instance_id, &item.old_events, &item.new_events);
        self.record_turn_metrics(&response);

        let token = item.token.as_str();
        let ack = self
            .execute_with_retry("complete_orchestration_work_item", || {
                self.hub.complete_orchestration_work_item(token, response.clone())
            })
            .await;
        match ack {
            Ok(()) => debug!(
                target: "durotask::runtime",
                instance_id = %item.instance_id,
                execution_id = %item.execution_id,
                worker_id = %worker_id,
                actions = response.actions.len(),
                "Orchestration turn completed"
            ),
            Err(_) => {
                if let Err(e) = self.hub.abandon_orchestration_work_item(token).await {
                    warn!(
                        target: "durotask::runtime",
                        instance_id = %item.instance_id,
                        error = %e,
                        "abandon_orchestration_work_item failed"
                    );
                }
            }
        }
    }

    fn record_turn_metrics(&self, response: &OrchestratorResponse) {
        for action in &response.actions {
            match action {
                Action::CompleteOrchestration { status, .. } => match status {
                    CompletionStatus::Completed => self.metrics.record_orchestration_completion(),
                    CompletionStatus::Failed => self.metrics.record_orchestration_failure(),
                    CompletionStatus::Terminated => self.metrics.record_orchestration_termination(),
                    CompletionStatus::ContinuedAsNew => self.metrics.record_continue_as_new(),
                },
                Action::StallOrchestration { .. } => self.metrics.record_orchestration_stall(),
                _ => {}
            }
        }
    }
}
