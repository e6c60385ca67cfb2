use std::sync::Arc;
use tokio::sync::watch;

use crate::TraceContext;

/// Context handed to activity functions for one attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    task_id: u64,
    name: String,
    trace_context: Option<TraceContext>,
    cancel: watch::Receiver<bool>,
    // Keeps a detached context's channel open
    _cancel_owner: Option<Arc<watch::Sender<bool>>>,
}

impl ActivityContext {
    pub(crate) fn new(
        instance_id: String,
        execution_id: u64,
        task_id: u64,
        name: String,
        trace_context: Option<TraceContext>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            instance_id,
            execution_id,
            task_id,
            name,
            trace_context,
            cancel,
            _cancel_owner: None,
        }
    }

    /// Context with no worker behind it, for calling activity functions directly.
    /// Nothing ever cancels it: `is_cancelled()` stays false and `cancelled()`
    /// never resolves.
    pub fn detached(instance_id: impl Into<String>, name: impl Into<String>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            _cancel_owner: Some(Arc::new(tx)),
            ..Self::new(instance_id.into(), 1, 0, name.into(), None, rx)
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    /// Sequence number of the scheduling event for this attempt.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace_context(&self) -> Option<&TraceContext> {
        self.trace_context.as_ref()
    }

    /// True once the worker asked running activities to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        // A dropped sender means the worker is gone, which counts as cancellation
        let _ = rx.wait_for(|c| *c).await;
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "durotask::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            activity_name = %self.name,
            activity_id = %self.task_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "durotask::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            activity_name = %self.name,
            activity_id = %self.task_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "durotask::activity",
            instance_id = %self.instance_id,
            execution_id = %self.execution_id,
            activity_name = %self.name,
            activity_id = %self.task_id,
            "{}",
            message.into()
        );
    }
}
