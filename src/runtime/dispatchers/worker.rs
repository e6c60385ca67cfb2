//! Worker (activity) dispatcher implementation for Runtime
//!
//! Each worker fetches one activity work item at a time, runs the registered
//! handler on its own task (so panics are contained) and reports the outcome.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::{ActivityResponse, ActivityWorkItem};
use crate::runtime::Runtime;
use crate::{ActivityContext, FailureDetails};

fn join_error_message(e: tokio::task::JoinError) -> String {
    if !e.is_panic() {
        return "activity task was cancelled".to_string();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "activity panicked".to_string()
    }
}

impl Runtime {
    /// Start N concurrent activity workers.
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.options.worker_concurrency.max(1))
            .map(|idx| {
                let rt = self.clone();
                // Unique worker ID: work-{index}-{runtime_id}
                let worker_id = format!("work-{idx}-{}", rt.runtime_id);
                tokio::spawn(async move { rt.worker_loop(worker_id).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String) {
        while !self.shutdown_flag.load(Ordering::Relaxed) {
            match self.hub.fetch_activity_work_item().await {
                Ok(Some(item)) => self.execute_activity(item, &worker_id).await,
                Ok(None) => tokio::time::sleep(self.options.dispatcher_idle_sleep).await,
                Err(e) => {
                    warn!(target: "durotask::runtime", worker_id = %worker_id, error = %e, "fetch_activity_work_item failed");
                    self.metrics.record_hub_error();
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                }
            }
        }
    }

    async fn execute_activity(&self, item: ActivityWorkItem, worker_id: &str) {
        debug!(
            target: "durotask::runtime",
            instance_id = %item.instance_id,
            execution_id = %item.execution_id,
            activity_name = %item.name,
            activity_id = %item.task_id,
            worker_id = %worker_id,
            "Activity started"
        );
        let start_time = Instant::now();

        let outcome = match self.registry().activity(&item.name) {
            Ok(handler) => {
                let ctx = ActivityContext::new(
                    item.instance_id.clone(),
                    item.execution_id,
                    item.task_id,
                    item.name.clone(),
                    item.trace_context.clone(),
                    self.cancel_tx.subscribe(),
                );
                let input = item.input.clone();
                match tokio::spawn(async move { handler.invoke(ctx, input).await }).await {
                    Ok(Ok(result)) => {
                        self.metrics.record_activity_success();
                        Ok(result)
                    }
                    Ok(Err(message)) => {
                        self.metrics.record_activity_app_error();
                        Err(FailureDetails::new("ActivityError", message))
                    }
                    Err(e) => {
                        self.metrics.record_activity_infra_error();
                        Err(FailureDetails::new("ActivityPanicked", join_error_message(e)))
                    }
                }
            }
            Err(e) => {
                self.metrics.record_activity_infra_error();
                Err(FailureDetails::new("ActivityNotRegistered", e.to_string()).non_retriable())
            }
        };

        let duration_ms = start_time.elapsed().as_millis() as u64;
        match &outcome {
            Ok(result) => debug!(
                target: "durotask::runtime",
                instance_id = %item.instance_id,
                execution_id = %item.execution_id,
                activity_name = %item.name,
                activity_id = %item.task_id,
                worker_id = %worker_id,
                outcome = "success",
                duration_ms = %duration_ms,
                result_size = %result.len(),
                "Activity completed"
            ),
            Err(details) => warn!(
                target: "durotask::runtime",
                instance_id = %item.instance_id,
                execution_id = %item.execution_id,
                activity_name = %item.name,
                activity_id = %item.task_id,
                worker_id = %worker_id,
                outcome = %details.error_type,
                duration_ms = %duration_ms,
                error = %details.message,
                "Activity failed"
            ),
        }

        let response = ActivityResponse {
            instance_id: item.instance_id.clone(),
            execution_id: item.execution_id,
            task_id: item.task_id,
            outcome,
        };
        let token = item.token.as_str();
        let acked = self
            .execute_with_retry("complete_activity_work_item", || {
                self.hub.complete_activity_work_item(token, response.clone())
            })
            .await;
        // An unacknowledged result goes back to the queue and the activity runs again
        if acked.is_err()
            && let Err(e) = self.hub.abandon_activity_work_item(token).await
        {
            warn!(
                target: "durotask::runtime",
                instance_id = %item.instance_id,
                activity_id = %item.task_id,
                worker_id = %worker_id,
                error = %e,
                "abandon_activity_work_item failed"
            );
        }
    }
}
