use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::{FailureDetails, OrchestrationContext};

/// Failure outcome of a [`Task`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The activity or child workflow failed (after exhausting any retry policy).
    #[error("task failed: {0}")]
    Failed(FailureDetails),
    /// The task was canceled, e.g. an external-event wait whose timeout elapsed.
    #[error("task canceled")]
    Canceled,
    /// A payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Decode(String),
}

impl TaskError {
    pub fn failure_details(&self) -> Option<&FailureDetails> {
        match self {
            TaskError::Failed(details) => Some(details),
            _ => None,
        }
    }
}

impl From<TaskError> for String {
    fn from(e: TaskError) -> Self {
        e.to_string()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum TaskState {
    Pending,
    Completed(String),
    Failed(TaskError),
}

/// Handle to one durable operation issued by a workflow.
///
/// The operation is recorded when the task is created, whether or not it is
/// ever awaited. Tasks are cheap to clone; every clone observes the same slot,
/// so awaiting a resolved task again returns the same outcome immediately.
#[derive(Clone)]
pub struct Task {
    pub(crate) id: usize,
    pub(crate) ctx: OrchestrationContext,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}

impl Task {
    /// Stable index of this task within the current replay pass.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Peek at the task without suspending.
    pub fn is_complete(&self) -> bool {
        !matches!(self.ctx.task_state(self.id), TaskState::Pending)
    }

    /// Wait for the task and decode its payload into `T`.
    ///
    /// Payloads are read as JSON; a raw payload that is not JSON reads as a
    /// string. Tasks without a payload (timers) decode as `()` or `""`.
    /// Awaiting the task directly yields the payload untouched.
    pub fn get<T: DeserializeOwned>(&self) -> TaskOutput<T> {
        TaskOutput {
            task: self.clone(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn poll_raw(&self, cx: &Context<'_>) -> Poll<Result<String, TaskError>> {
        let state = self.ctx.task_state(self.id);
        if matches!(state, TaskState::Pending) {
            self.ctx.register_waker(self.id, cx.waker());
        }
        match state {
            TaskState::Pending => Poll::Pending,
            TaskState::Completed(payload) => Poll::Ready(Ok(payload)),
            TaskState::Failed(e) => Poll::Ready(Err(e)),
        }
    }
}

/// Future returned by [`Task::get`].
pub struct TaskOutput<T> {
    task: Task,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Future for TaskOutput<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.task.poll_raw(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(payload)) => Poll::Ready(Json::decode::<T>(&payload).map_err(TaskError::Decode)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        }
    }
}

/// Future behind `task.await`: yields the payload exactly as recorded.
pub struct RawOutput {
    task: Task,
}

impl Future for RawOutput {
    type Output = Result<String, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.task.poll_raw(cx)
    }
}

impl IntoFuture for Task {
    type Output = Result<String, TaskError>;
    type IntoFuture = RawOutput;

    fn into_future(self) -> Self::IntoFuture {
        RawOutput { task: self }
    }
}

impl IntoFuture for &Task {
    type Output = Result<String, TaskError>;
    type IntoFuture = RawOutput;

    fn into_future(self) -> Self::IntoFuture {
        self.clone().into_future()
    }
}

/// Resolves once every task has completed, or with the first failure in
/// resolution order.
pub struct WhenAll {
    pub(crate) tasks: Vec<Task>,
}

impl Future for WhenAll {
    type Output = Result<Vec<String>, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut first_failure: Option<(u64, TaskError)> = None;
        let mut all_done = true;
        let mut outputs = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            match task.poll_raw(cx) {
                Poll::Pending => all_done = false,
                Poll::Ready(Ok(payload)) => outputs.push(payload),
                Poll::Ready(Err(e)) => {
                    let order = task.ctx.resolved_at(task.id).unwrap_or(u64::MAX);
                    if first_failure.as_ref().is_none_or(|(o, _)| order < *o) {
                        first_failure = Some((order, e));
                    }
                }
            }
        }
        if let Some((_, e)) = first_failure {
            return Poll::Ready(Err(e));
        }
        if all_done { Poll::Ready(Ok(outputs)) } else { Poll::Pending }
    }
}

/// Resolves with the index (into the input list) of the first task to
/// resolve, by history order. The losing tasks keep running.
pub struct WhenAny {
    pub(crate) tasks: Vec<Task>,
}

impl Future for WhenAny {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let first = self
            .tasks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.ctx.resolved_at(t.id).map(|order| (order, i)))
            .min();
        match first {
            Some((_, i)) => Poll::Ready(i),
            None => {
                for t in &self.tasks {
                    t.ctx.register_waker(t.id, cx.waker());
                }
                Poll::Pending
            }
        }
    }
}
