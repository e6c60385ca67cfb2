//! Replay executor: drives a registered workflow over (old events, new events)
//! and turns the outcome into actions for the task hub.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::task::{Context, Poll};

use tracing::{debug, error, warn};

use super::limits::{MAX_CARRY_FORWARD_EVENTS, MAX_CUSTOM_STATUS_BYTES};
use super::registry::{Registry, RegistryError};
use crate::context::{ContinueAsNew, ExecutionInfo, ReplayError};
use crate::providers::OrchestratorResponse;
use crate::{Action, CompletionStatus, Event, EventKind, FailureDetails, OrchestrationContext, OrchestrationVersion};

type WorkflowFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// How a replay pass ended.
#[derive(Debug)]
enum Outcome {
    Running,
    Returned(Result<String, String>),
    Panicked(String),
    Terminated(String),
    Stalled(ReplayError),
}

/// Stateless executor; one call per orchestration work item.
#[derive(Clone)]
pub struct OrchestrationExecutor {
    registry: Registry,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "workflow panicked".to_string()
    }
}

/// Poll once with a no-op waker. Tasks resolve from history, not from wakeups,
/// so a single poll runs the workflow as far as it can go.
fn poll_workflow(fut: &mut WorkflowFuture<'_>) -> Option<Outcome> {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    match catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
        Ok(Poll::Ready(result)) => Some(Outcome::Returned(result)),
        Ok(Poll::Pending) => None,
        Err(payload) => Some(Outcome::Panicked(panic_message(payload))),
    }
}

fn fail(instance_id: &str, details: FailureDetails) -> OrchestratorResponse {
    OrchestratorResponse {
        instance_id: instance_id.to_string(),
        actions: vec![Action::CompleteOrchestration {
            status: CompletionStatus::Failed,
            result: None,
            failure: Some(details),
            carryover_events: Vec::new(),
        }],
        ..Default::default()
    }
}

fn stall(instance_id: &str, e: &ReplayError) -> OrchestratorResponse {
    error!(
        target: "durotask::orchestration",
        instance_id = %instance_id,
        reason = %e.reason,
        description = %e.description,
        "orchestration stalled"
    );
    OrchestratorResponse {
        instance_id: instance_id.to_string(),
        actions: vec![Action::StallOrchestration {
            reason: e.reason,
            description: e.description.clone(),
        }],
        ..Default::default()
    }
}

impl OrchestrationExecutor {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one replay pass. Never fails: problems become failure or stall actions.
    pub fn execute(&self, instance_id: &str, old_events: &[Event], new_events: &[Event]) -> OrchestratorResponse {
        if old_events.iter().any(Event::is_terminal) {
            debug!(target: "durotask::orchestration", instance_id = %instance_id, "execution already finished");
            return OrchestratorResponse {
                instance_id: instance_id.to_string(),
                ..Default::default()
            };
        }

        if let Some(output) = new_events.iter().find_map(|e| match &e.kind {
            EventKind::ExecutionTerminated { output, .. } => Some(output.clone()),
            _ => None,
        }) {
            return self.finish(instance_id, None, Outcome::Terminated(output), None, Vec::new());
        }

        let Some((name, requested_version, input, parent, trace_context)) =
            old_events.iter().chain(new_events).find_map(|e| match &e.kind {
                EventKind::ExecutionStarted {
                    name,
                    version,
                    input,
                    parent,
                    trace_context,
                    ..
                } => Some((
                    name.clone(),
                    version.clone(),
                    input.clone(),
                    parent.clone(),
                    trace_context.clone(),
                )),
                _ => None,
            })
        else {
            return fail(
                instance_id,
                FailureDetails::new("InvalidHistory", "history has no ExecutionStarted event").non_retriable(),
            );
        };

        // The version chosen on the first turn stays pinned for the execution
        let pinned_version = old_events.iter().find_map(|e| match &e.kind {
            EventKind::OrchestratorStarted {
                version: Some(OrchestrationVersion { name: Some(v), .. }),
            } => Some(v.clone()),
            _ => None,
        });
        let wanted_version = pinned_version.or(requested_version);

        let resolved = match self.registry.resolve_workflow(&name, wanted_version.as_deref()) {
            Ok(r) => r,
            Err(RegistryError::UnsupportedVersion { .. }) => {
                return stall(
                    instance_id,
                    &ReplayError::version_unavailable(format!(
                        "workflow '{name}' version {} is not registered in this worker",
                        wanted_version.as_deref().unwrap_or("latest")
                    )),
                );
            }
            Err(e) => {
                warn!(target: "durotask::orchestration", instance_id = %instance_id, workflow = %name, "workflow not registered");
                return fail(
                    instance_id,
                    FailureDetails::new("WorkflowNotRegistered", e.to_string()).non_retriable(),
                );
            }
        };

        let recorded_patches: HashSet<String> = old_events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::OrchestratorStarted { version: Some(v) } => Some(v.patches.clone()),
                _ => None,
            })
            .flatten()
            .collect();

        let start_time_ms = old_events
            .iter()
            .chain(new_events)
            .find(|e| matches!(e.kind, EventKind::OrchestratorStarted { .. }))
            .map_or(0, |e| e.timestamp_ms);

        let ctx = OrchestrationContext::new(ExecutionInfo {
            instance_id: instance_id.to_string(),
            name: name.clone(),
            input: input.clone(),
            version: resolved.version.clone(),
            parent,
            trace_context,
            start_time_ms,
            recorded_patches,
        });

        debug!(
            target: "durotask::orchestration",
            instance_id = %instance_id,
            workflow = %name,
            version = ?resolved.version,
            old_events = old_events.len(),
            new_events = new_events.len(),
            "replaying orchestration"
        );

        let handler = resolved.handler.clone();
        let mut queue: VecDeque<(&Event, bool)> = old_events
            .iter()
            .map(|e| (e, true))
            .chain(new_events.iter().map(|e| (e, false)))
            .collect();
        let mut deferred: Vec<(&Event, bool)> = Vec::new();
        let mut suspended = false;
        let mut patches_verified = false;
        let mut fut: Option<WorkflowFuture<'_>> = None;
        let mut outcome = Outcome::Running;

        while let Some((event, replaying)) = queue.pop_front() {
            if !replaying && !patches_verified {
                patches_verified = true;
                if let Err(e) = ctx.verify_patches() {
                    outcome = Outcome::Stalled(e);
                    break;
                }
            }
            ctx.set_replaying(replaying);
            match &event.kind {
                EventKind::ExecutionStarted { .. } => {
                    if fut.is_none() {
                        fut = Some(handler.invoke(ctx.clone(), input.clone()));
                    }
                }
                EventKind::ExecutionSuspended { .. } => {
                    suspended = true;
                    continue;
                }
                EventKind::ExecutionResumed { .. } => {
                    suspended = false;
                    for item in deferred.drain(..).rev() {
                        queue.push_front(item);
                    }
                    continue;
                }
                EventKind::ExecutionTerminated { output, .. } => {
                    outcome = Outcome::Terminated(output.clone());
                    break;
                }
                _ if suspended => {
                    deferred.push((event, replaying));
                    continue;
                }
                _ => {
                    if let Err(e) = ctx.apply_event(event) {
                        outcome = Outcome::Stalled(e);
                        break;
                    }
                }
            }
            if let Some(f) = fut.as_mut()
                && let Some(done) = poll_workflow(f)
            {
                outcome = done;
                break;
            }
        }

        if matches!(outcome, Outcome::Running)
            && !patches_verified
            && let Err(e) = ctx.verify_patches()
        {
            outcome = Outcome::Stalled(e);
        }

        // External events delivered after the workflow returned were never applied
        let unapplied: Vec<Event> = queue
            .iter()
            .filter(|(e, replaying)| !replaying && matches!(e.kind, EventKind::EventRaised { .. }))
            .map(|(e, _)| (*e).clone())
            .collect();

        // Release the workflow future (and its borrow of the handler) first
        drop(fut);
        self.finish(instance_id, Some(&ctx), outcome, resolved.version, unapplied)
    }

    fn finish(
        &self,
        instance_id: &str,
        ctx: Option<&OrchestrationContext>,
        outcome: Outcome,
        version: Option<String>,
        unapplied: Vec<Event>,
    ) -> OrchestratorResponse {
        let mut response = OrchestratorResponse {
            instance_id: instance_id.to_string(),
            ..Default::default()
        };
        if let Outcome::Stalled(e) = &outcome {
            return stall(instance_id, e);
        }
        if let Outcome::Terminated(output) = outcome {
            debug!(target: "durotask::orchestration", instance_id = %instance_id, "orchestration terminated");
            response.actions.push(Action::CompleteOrchestration {
                status: CompletionStatus::Terminated,
                result: Some(output),
                failure: None,
                carryover_events: Vec::new(),
            });
            return response;
        }
        let Some(ctx) = ctx else {
            return response;
        };

        response.custom_status = ctx.custom_status();
        response.version = OrchestrationVersion {
            name: version,
            patches: ctx.new_patches(),
        };
        if let Some(status) = &response.custom_status
            && status.len() > MAX_CUSTOM_STATUS_BYTES
        {
            let size = status.len();
            response.custom_status = None;
            response.actions = fail(
                instance_id,
                FailureDetails::new(
                    "CustomStatusTooLarge",
                    format!("custom status is {size} bytes; the limit is {MAX_CUSTOM_STATUS_BYTES}"),
                )
                .non_retriable(),
            )
            .actions;
            return response;
        }

        response.actions = ctx.take_pending_actions();
        let completion = match outcome {
            Outcome::Running | Outcome::Stalled(_) | Outcome::Terminated(_) => None,
            Outcome::Returned(Ok(result)) => match ctx.continue_as_new_request() {
                Some(ContinueAsNew { encode_error: Some(e), .. }) => Some(Action::CompleteOrchestration {
                    status: CompletionStatus::Failed,
                    result: None,
                    failure: Some(
                        FailureDetails::new("ContinueAsNewInputError", format!("could not encode input: {e}"))
                            .non_retriable(),
                    ),
                    carryover_events: Vec::new(),
                }),
                Some(can) => {
                    let mut carryover = if can.keep_unprocessed_events {
                        let mut events = ctx.unprocessed_events();
                        events.extend(unapplied);
                        events
                    } else {
                        Vec::new()
                    };
                    if carryover.len() > MAX_CARRY_FORWARD_EVENTS {
                        let dropped = carryover.len() - MAX_CARRY_FORWARD_EVENTS;
                        warn!(
                            target: "durotask::orchestration",
                            instance_id = %instance_id,
                            dropped,
                            "too many unprocessed events for continue-as-new; dropping the oldest"
                        );
                        carryover.drain(..dropped);
                    }
                    Some(Action::CompleteOrchestration {
                        status: CompletionStatus::ContinuedAsNew,
                        result: Some(can.input),
                        failure: None,
                        carryover_events: carryover,
                    })
                }
                None => Some(Action::CompleteOrchestration {
                    status: CompletionStatus::Completed,
                    result: Some(result),
                    failure: None,
                    carryover_events: Vec::new(),
                }),
            },
            Outcome::Returned(Err(message)) => Some(Action::CompleteOrchestration {
                status: CompletionStatus::Failed,
                result: None,
                failure: Some(FailureDetails::new("WorkflowError", message)),
                carryover_events: Vec::new(),
            }),
            Outcome::Panicked(message) => Some(Action::CompleteOrchestration {
                status: CompletionStatus::Failed,
                result: None,
                failure: Some(FailureDetails::new("WorkflowPanicked", message).non_retriable()),
                carryover_events: Vec::new(),
            }),
        };
        if let Some(action) = completion {
            debug!(
                target: "durotask::orchestration",
                instance_id = %instance_id,
                action = action.kind_name(),
                "orchestration finished"
            );
            response.actions.push(action);
        }
        response
    }
}
