//! In-process task hub backed by a single mutex-guarded state map.
//!
//! Every instance owns an inbox of events that have arrived since its last
//! turn. Fetching an orchestration work item locks the instance and drains the
//! inbox; completing it appends the turn to history and materializes the
//! returned actions (activity queue, durable timers, child instances, the next
//! execution for continue-as-new). Work that belongs to a replaced, purged or
//! finished execution is dropped when it comes back.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ActivityResponse, ActivityWorkItem, CreateInstanceRequest, InstanceIdPage, OrchestrationWorkItem,
    OrchestratorResponse, RerunRequest, ReusePolicy, TaskHub, TaskHubError, WorkflowMetadata,
};
use crate::runtime::limits::DEFAULT_PAGE_SIZE;
use crate::{
    Action, CompletionStatus, Event, EventKind, FailureDetails, OrchestrationVersion, ParentInstance, RuntimeStatus,
    TraceContext, now_ms,
};

struct InstanceState {
    /// Distinguishes an instance from earlier ones that used the same id.
    generation: u64,
    name: String,
    requested_version: Option<String>,
    input: String,
    trace_context: Option<TraceContext>,
    created_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    status: RuntimeStatus,
    output: Option<String>,
    failure: Option<FailureDetails>,
    custom_status: Option<String>,
    /// Histories by execution; execution ids start at 1.
    executions: Vec<Vec<Event>>,
    inbox: VecDeque<Event>,
    locked: bool,
    start_at_ms: Option<u64>,
    parent: Option<ParentInstance>,
    parent_execution_id: Option<u64>,
    children: Vec<String>,
}

impl InstanceState {
    fn execution_id(&self) -> u64 {
        self.executions.len() as u64
    }

    fn history(&self) -> &[Event] {
        self.executions.last().map(Vec::as_slice).unwrap_or_default()
    }

    fn history_mut(&mut self) -> &mut Vec<Event> {
        if self.executions.is_empty() {
            self.executions.push(Vec::new());
        }
        let last = self.executions.len() - 1;
        &mut self.executions[last]
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn has_pending_termination(&self) -> bool {
        self.inbox
            .iter()
            .any(|e| matches!(e.kind, EventKind::ExecutionTerminated { .. }))
    }

    fn is_runnable(&self, now: u64) -> bool {
        if self.locked || self.inbox.is_empty() || self.is_terminal() {
            return false;
        }
        if self.has_pending_termination() {
            return true;
        }
        self.status != RuntimeStatus::Stalled && self.start_at_ms.is_none_or(|t| t <= now)
    }

    /// Version pinned by the first turn of the current execution, else the requested one.
    fn version(&self) -> Option<String> {
        self.history()
            .iter()
            .find_map(|e| match &e.kind {
                EventKind::OrchestratorStarted {
                    version: Some(OrchestrationVersion { name: Some(v), .. }),
                } => Some(v.clone()),
                _ => None,
            })
            .or_else(|| self.requested_version.clone())
    }

    fn metadata(&self, instance_id: &str, fetch_payloads: bool) -> WorkflowMetadata {
        WorkflowMetadata {
            instance_id: instance_id.to_string(),
            name: self.name.clone(),
            version: self.version(),
            runtime_status: self.status,
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            input: fetch_payloads.then(|| self.input.clone()),
            output: if fetch_payloads { self.output.clone() } else { None },
            custom_status: if fetch_payloads { self.custom_status.clone() } else { None },
            failure_details: self.failure.clone(),
            execution_id: self.execution_id(),
            parent_instance_id: self.parent.as_ref().map(|p| p.instance_id.clone()),
        }
    }
}

/// Orchestration work item handed out and not yet acknowledged.
struct LockedTurn {
    instance_id: String,
    generation: u64,
    execution_id: u64,
    new_events: Vec<Event>,
}

struct PendingTimer {
    instance_id: String,
    generation: u64,
    execution_id: u64,
    timer_id: u64,
    fire_at_ms: u64,
}

struct QueuedActivity {
    generation: u64,
    item: ActivityWorkItem,
}

/// How a child execution ended, as reported to its parent.
enum ChildOutcome {
    Completed(String),
    Failed(FailureDetails),
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<String, InstanceState>,
    timers: Vec<PendingTimer>,
    activities: VecDeque<QueuedActivity>,
    locked_orchestrations: HashMap<String, LockedTurn>,
    locked_activities: HashMap<String, QueuedActivity>,
    next_generation: u64,
    next_token: u64,
}

impl Inner {
    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}:{}", self.next_token)
    }

    /// Instance whose current execution is still the one identified by
    /// `(generation, execution_id)` and has not finished.
    fn live_execution(&mut self, instance_id: &str, generation: u64, execution_id: u64) -> Option<&mut InstanceState> {
        self.instances
            .get_mut(instance_id)
            .filter(|i| i.generation == generation && i.execution_id() == execution_id && !i.is_terminal())
    }

    fn append(&mut self, instance_id: &str, event: Event) {
        if let Some(inst) = self.instances.get_mut(instance_id) {
            inst.history_mut().push(event);
        }
    }

    /// Remove an instance together with its queued timers and activities.
    fn discard(&mut self, instance_id: &str) -> bool {
        self.timers.retain(|t| t.instance_id != instance_id);
        self.activities.retain(|a| a.item.instance_id != instance_id);
        self.instances.remove(instance_id).is_some()
    }

    fn create(&mut self, request: CreateInstanceRequest, parent: Option<(ParentInstance, u64)>, now: u64) {
        self.discard(&request.instance_id);
        self.next_generation += 1;
        let start_at_ms = request.start_at.map(|t| t.timestamp_millis().max(0) as u64);
        let (parent, parent_execution_id) = match parent {
            Some((p, exec)) => (Some(p), Some(exec)),
            None => (None, None),
        };
        let started = Event::new(
            now,
            EventKind::ExecutionStarted {
                name: request.name.clone(),
                version: request.version.clone(),
                input: request.input.clone(),
                parent: parent.clone(),
                scheduled_start_ms: start_at_ms,
                trace_context: request.trace_context.clone(),
            },
        );
        let created_at = Utc::now();
        debug!(
            target: "durotask::runtime",
            instance_id = %request.instance_id,
            workflow = %request.name,
            "instance created"
        );
        self.instances.insert(
            request.instance_id,
            InstanceState {
                generation: self.next_generation,
                name: request.name,
                requested_version: request.version,
                input: request.input,
                trace_context: request.trace_context,
                created_at,
                last_updated_at: created_at,
                status: RuntimeStatus::Pending,
                output: None,
                failure: None,
                custom_status: None,
                executions: vec![Vec::new()],
                inbox: VecDeque::from([started]),
                locked: false,
                start_at_ms,
                parent,
                parent_execution_id,
                children: Vec::new(),
            },
        );
    }

    fn fire_due_timers(&mut self, now: u64) {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.timers)
            .into_iter()
            .partition(|t| t.fire_at_ms <= now);
        self.timers = pending;
        for t in due {
            if let Some(inst) = self.live_execution(&t.instance_id, t.generation, t.execution_id) {
                inst.inbox.push_back(Event::new(
                    now,
                    EventKind::TimerFired {
                        timer_id: t.timer_id,
                        fire_at_ms: t.fire_at_ms,
                    },
                ));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_child(
        &mut self,
        parent_id: &str,
        execution_id: u64,
        task_id: u64,
        name: String,
        child_id: String,
        input: String,
        version: Option<String>,
        trace_context: Option<TraceContext>,
        now: u64,
    ) {
        if self.instances.get(&child_id).is_some_and(|c| !c.is_terminal()) {
            if let Some(parent) = self.instances.get_mut(parent_id) {
                parent.inbox.push_back(Event::new(
                    now,
                    EventKind::SubOrchestrationFailed {
                        task_scheduled_id: task_id,
                        details: FailureDetails::new(
                            "DuplicateInstance",
                            format!("instance '{child_id}' already exists"),
                        )
                        .non_retriable(),
                    },
                ));
            }
            return;
        }
        let Some(parent) = self.instances.get_mut(parent_id) else {
            return;
        };
        parent.children.push(child_id.clone());
        let link = ParentInstance {
            instance_id: parent_id.to_string(),
            name: parent.name.clone(),
            task_scheduled_id: task_id,
        };
        let request = CreateInstanceRequest {
            instance_id: child_id,
            name,
            version,
            input,
            start_at: None,
            trace_context,
            reuse_policy: ReusePolicy::Error,
        };
        self.create(request, Some((link, execution_id)), now);
    }

    fn notify_parent(&mut self, parent: Option<(ParentInstance, u64)>, outcome: ChildOutcome, now: u64) {
        let Some((link, execution_id)) = parent else {
            return;
        };
        let Some(inst) = self.instances.get_mut(&link.instance_id) else {
            return;
        };
        if inst.is_terminal() || inst.execution_id() != execution_id {
            return;
        }
        let kind = match outcome {
            ChildOutcome::Completed(result) => EventKind::SubOrchestrationCompleted {
                task_scheduled_id: link.task_scheduled_id,
                result,
            },
            ChildOutcome::Failed(details) => EventKind::SubOrchestrationFailed {
                task_scheduled_id: link.task_scheduled_id,
                details,
            },
        };
        inst.inbox.push_back(Event::new(now, kind));
    }

    fn apply_action(&mut self, instance_id: &str, generation: u64, execution_id: u64, action: Action, now: u64) {
        match action {
            Action::ScheduleTask {
                id,
                name,
                input,
                trace_context,
            } => {
                self.append(
                    instance_id,
                    Event::new(
                        now,
                        EventKind::TaskScheduled {
                            task_id: id,
                            name: name.clone(),
                            input: input.clone(),
                            trace_context: trace_context.clone(),
                        },
                    ),
                );
                self.activities.push_back(QueuedActivity {
                    generation,
                    item: ActivityWorkItem {
                        token: String::new(),
                        instance_id: instance_id.to_string(),
                        execution_id,
                        task_id: id,
                        name,
                        input,
                        trace_context,
                    },
                });
            }
            Action::CreateTimer { id, fire_at_ms, name } => {
                self.append(
                    instance_id,
                    Event::new(
                        now,
                        EventKind::TimerCreated {
                            timer_id: id,
                            fire_at_ms,
                            name,
                        },
                    ),
                );
                self.timers.push(PendingTimer {
                    instance_id: instance_id.to_string(),
                    generation,
                    execution_id,
                    timer_id: id,
                    fire_at_ms,
                });
            }
            Action::CreateSubOrchestration {
                id,
                name,
                instance_id: child_id,
                input,
                version,
                trace_context,
            } => {
                self.append(
                    instance_id,
                    Event::new(
                        now,
                        EventKind::SubOrchestrationCreated {
                            task_id: id,
                            name: name.clone(),
                            instance_id: child_id.clone(),
                            input: input.clone(),
                            version: version.clone(),
                        },
                    ),
                );
                self.spawn_child(
                    instance_id,
                    execution_id,
                    id,
                    name,
                    child_id,
                    input,
                    version,
                    trace_context,
                    now,
                );
            }
            Action::CompleteOrchestration {
                status,
                result,
                failure,
                carryover_events,
            } => self.complete_execution(instance_id, execution_id, status, result, failure, carryover_events, now),
            Action::StallOrchestration { reason, description } => {
                if let Some(inst) = self.instances.get_mut(instance_id) {
                    inst.history_mut().push(Event::new(
                        now,
                        EventKind::ExecutionStalled {
                            reason,
                            description: description.clone(),
                        },
                    ));
                    inst.status = RuntimeStatus::Stalled;
                    inst.failure = Some(FailureDetails::new(reason.to_string(), description));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete_execution(
        &mut self,
        instance_id: &str,
        execution_id: u64,
        status: CompletionStatus,
        result: Option<String>,
        failure: Option<FailureDetails>,
        carryover_events: Vec<Event>,
        now: u64,
    ) {
        let Some(inst) = self.instances.get_mut(instance_id) else {
            return;
        };
        let parent = inst.parent.clone().zip(inst.parent_execution_id);
        let outcome = match status {
            CompletionStatus::Completed => {
                let output = result.unwrap_or_default();
                inst.history_mut().push(Event::new(
                    now,
                    EventKind::ExecutionCompleted { output: output.clone() },
                ));
                inst.status = RuntimeStatus::Completed;
                inst.output = Some(output.clone());
                Some(ChildOutcome::Completed(output))
            }
            CompletionStatus::Failed => {
                let details = failure.unwrap_or_else(|| FailureDetails::new("WorkflowError", "orchestration failed"));
                inst.history_mut().push(Event::new(
                    now,
                    EventKind::ExecutionFailed {
                        details: details.clone(),
                    },
                ));
                inst.status = RuntimeStatus::Failed;
                inst.failure = Some(details.clone());
                Some(ChildOutcome::Failed(details))
            }
            CompletionStatus::Terminated => {
                let output = result.unwrap_or_default();
                if !inst
                    .history()
                    .iter()
                    .any(|e| matches!(e.kind, EventKind::ExecutionTerminated { .. }))
                {
                    inst.history_mut().push(Event::new(
                        now,
                        EventKind::ExecutionTerminated {
                            output: output.clone(),
                            recursive: false,
                        },
                    ));
                }
                inst.status = RuntimeStatus::Terminated;
                inst.output = Some(output);
                Some(ChildOutcome::Failed(
                    FailureDetails::new("WorkflowTerminated", format!("instance '{instance_id}' was terminated"))
                        .non_retriable(),
                ))
            }
            CompletionStatus::ContinuedAsNew => {
                let input = result.unwrap_or_default();
                inst.history_mut().push(Event::new(
                    now,
                    EventKind::ExecutionContinuedAsNew { input: input.clone() },
                ));
                let started = Event::new(
                    now,
                    EventKind::ExecutionStarted {
                        name: inst.name.clone(),
                        version: inst.requested_version.clone(),
                        input: input.clone(),
                        parent: inst.parent.clone(),
                        scheduled_start_ms: None,
                        trace_context: inst.trace_context.clone(),
                    },
                );
                // Completions addressed to the old execution are stale
                let still_relevant: Vec<Event> = inst
                    .inbox
                    .drain(..)
                    .filter(|e| {
                        matches!(
                            e.kind,
                            EventKind::EventRaised { .. }
                                | EventKind::ExecutionSuspended { .. }
                                | EventKind::ExecutionResumed { .. }
                                | EventKind::ExecutionTerminated { .. }
                        )
                    })
                    .collect();
                inst.inbox = std::iter::once(started)
                    .chain(carryover_events)
                    .chain(still_relevant)
                    .collect();
                inst.executions.push(Vec::new());
                inst.input = input;
                inst.status = RuntimeStatus::ContinuedAsNew;
                debug!(
                    target: "durotask::runtime",
                    instance_id = %instance_id,
                    execution_id = inst.execution_id(),
                    "continued as new"
                );
                None
            }
        };
        self.timers
            .retain(|t| !(t.instance_id == instance_id && t.execution_id == execution_id));
        if let Some(outcome) = outcome {
            self.notify_parent(parent, outcome, now);
        }
    }

    fn terminate(&mut self, instance_id: &str, output: &str, recursive: bool, now: u64) -> Result<(), TaskHubError> {
        let inst = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| TaskHubError::InstanceNotFound(instance_id.to_string()))?;
        if inst.is_terminal() {
            return Ok(());
        }
        inst.inbox.push_back(Event::new(
            now,
            EventKind::ExecutionTerminated {
                output: output.to_string(),
                recursive,
            },
        ));
        if recursive {
            for child in inst.children.clone() {
                if let Err(e) = self.terminate(&child, output, true, now) {
                    debug!(target: "durotask::runtime", instance_id = %child, error = %e, "child not terminated");
                }
            }
        }
        Ok(())
    }
}

/// Task hub that keeps all state in process memory.
#[derive(Default)]
pub struct InMemoryTaskHub {
    inner: Mutex<Inner>,
}

impl InMemoryTaskHub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskHub for InMemoryTaskHub {
    async fn create_instance(&self, request: CreateInstanceRequest) -> Result<String, TaskHubError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.instances.get(&request.instance_id)
            && !existing.is_terminal()
        {
            match request.reuse_policy {
                ReusePolicy::Error => return Err(TaskHubError::DuplicateInstance(request.instance_id)),
                ReusePolicy::Ignore => return Ok(request.instance_id),
                ReusePolicy::TerminateExisting => {}
            }
        }
        let instance_id = request.instance_id.clone();
        inner.create(request, None, now_ms());
        Ok(instance_id)
    }

    async fn fetch_metadata(&self, instance_id: &str, fetch_payloads: bool) -> Result<WorkflowMetadata, TaskHubError> {
        let inner = self.inner.lock().await;
        inner
            .instances
            .get(instance_id)
            .map(|i| i.metadata(instance_id, fetch_payloads))
            .ok_or_else(|| TaskHubError::InstanceNotFound(instance_id.to_string()))
    }

    async fn raise_event(&self, instance_id: &str, name: &str, payload: Option<String>) -> Result<(), TaskHubError> {
        let mut inner = self.inner.lock().await;
        let inst = inner
            .instances
            .get_mut(instance_id)
            .filter(|i| !i.is_terminal())
            .ok_or_else(|| TaskHubError::InstanceNotFound(instance_id.to_string()))?;
        inst.inbox.push_back(Event::new(
            now_ms(),
            EventKind::EventRaised {
                name: name.to_string(),
                input: payload.unwrap_or_default(),
            },
        ));
        Ok(())
    }

    async fn terminate(&self, instance_id: &str, output: Option<String>, recursive: bool) -> Result<(), TaskHubError> {
        let mut inner = self.inner.lock().await;
        inner.terminate(instance_id, output.as_deref().unwrap_or_default(), recursive, now_ms())
    }

    async fn suspend(&self, instance_id: &str, reason: &str) -> Result<(), TaskHubError> {
        let mut inner = self.inner.lock().await;
        let inst = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| TaskHubError::InstanceNotFound(instance_id.to_string()))?;
        match inst.status {
            RuntimeStatus::Suspended => return Ok(()),
            RuntimeStatus::Stalled => {
                return Err(TaskHubError::invalid_state(
                    instance_id,
                    "stalled instances can only be terminated or purged",
                ));
            }
            s if s.is_terminal() => {
                return Err(TaskHubError::invalid_state(instance_id, format!("instance is {s}")));
            }
            _ => {}
        }
        inst.inbox.push_back(Event::new(
            now_ms(),
            EventKind::ExecutionSuspended {
                reason: reason.to_string(),
            },
        ));
        inst.status = RuntimeStatus::Suspended;
        inst.last_updated_at = Utc::now();
        Ok(())
    }

    async fn resume(&self, instance_id: &str, reason: &str) -> Result<(), TaskHubError> {
        let mut inner = self.inner.lock().await;
        let inst = inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| TaskHubError::InstanceNotFound(instance_id.to_string()))?;
        if inst.status != RuntimeStatus::Suspended {
            return Err(TaskHubError::invalid_state(
                instance_id,
                format!("instance is {}, not SUSPENDED", inst.status),
            ));
        }
        inst.inbox.push_back(Event::new(
            now_ms(),
            EventKind::ExecutionResumed {
                reason: reason.to_string(),
            },
        ));
        inst.status = RuntimeStatus::Running;
        inst.last_updated_at = Utc::now();
        Ok(())
    }

    async fn purge(&self, instance_id: &str, recursive: bool, force: bool) -> Result<usize, TaskHubError> {
        let mut inner = self.inner.lock().await;
        let inst = inner
            .instances
            .get(instance_id)
            .ok_or_else(|| TaskHubError::InstanceNotFound(instance_id.to_string()))?;
        if !inst.is_terminal() && !force {
            return Err(TaskHubError::invalid_state(
                instance_id,
                format!("instance is {}; purging it requires force", inst.status),
            ));
        }
        let mut pending = vec![instance_id.to_string()];
        let mut removed = 0;
        while let Some(id) = pending.pop() {
            if recursive && let Some(inst) = inner.instances.get(&id) {
                pending.extend(inst.children.iter().cloned());
            }
            if inner.discard(&id) {
                removed += 1;
            }
        }
        debug!(target: "durotask::runtime", instance_id = %instance_id, removed, "instance purged");
        Ok(removed)
    }

    async fn rerun_from_event(&self, request: RerunRequest) -> Result<String, TaskHubError> {
        let mut inner = self.inner.lock().await;
        let source_id = request.source_instance_id.as_str();
        let source = inner
            .instances
            .get(source_id)
            .ok_or_else(|| TaskHubError::InstanceNotFound(source_id.to_string()))?;
        if !source.is_terminal() {
            return Err(TaskHubError::invalid_state(
                source_id,
                "only finished instances can be rerun",
            ));
        }
        if inner
            .instances
            .get(&request.new_instance_id)
            .is_some_and(|i| !i.is_terminal())
        {
            return Err(TaskHubError::DuplicateInstance(request.new_instance_id));
        }

        let history = source.history();
        let position = history
            .iter()
            .position(|e| matches!(&e.kind, EventKind::TaskScheduled { task_id, .. } if *task_id == request.event_id))
            .ok_or_else(|| {
                TaskHubError::invalid_state(
                    source_id,
                    format!("no TaskScheduled event with id {}", request.event_id),
                )
            })?;
        let mut copied = history[..=position].to_vec();
        if let Some(input) = request.input
            && let Some(Event {
                kind: EventKind::TaskScheduled { input: scheduled, .. },
                ..
            }) = copied.last_mut()
        {
            *scheduled = input;
        }
        for event in copied.iter_mut() {
            if let EventKind::ExecutionStarted { parent, .. } = &mut event.kind {
                *parent = None;
            }
        }

        let now = now_ms();
        let name = source.name.clone();
        let version = source.version();
        let input = source.input.clone();
        let trace_context = source.trace_context.clone();
        let new_id = request.new_instance_id;
        inner.create(
            CreateInstanceRequest {
                instance_id: new_id.clone(),
                name,
                version,
                input,
                start_at: None,
                trace_context,
                reuse_policy: ReusePolicy::Error,
            },
            None,
            now,
        );
        let Some(inst) = inner.instances.get_mut(&new_id) else {
            return Err(TaskHubError::permanent("rerun_from_event", "instance vanished during rerun"));
        };
        inst.inbox.clear();
        inst.executions = vec![copied.clone()];
        inst.status = RuntimeStatus::Running;
        let generation = inst.generation;

        // Re-dispatch every scheduled operation that has no recorded outcome
        let completed: HashSet<u64> = copied.iter().filter_map(Event::completed_id).collect();
        for event in copied {
            if event.scheduled_id().is_none_or(|id| completed.contains(&id)) {
                continue;
            }
            match event.kind {
                EventKind::TaskScheduled {
                    task_id,
                    name,
                    input,
                    trace_context,
                } => inner.activities.push_back(QueuedActivity {
                    generation,
                    item: ActivityWorkItem {
                        token: String::new(),
                        instance_id: new_id.clone(),
                        execution_id: 1,
                        task_id,
                        name,
                        input,
                        trace_context,
                    },
                }),
                EventKind::TimerCreated {
                    timer_id, fire_at_ms, ..
                } => inner.timers.push(PendingTimer {
                    instance_id: new_id.clone(),
                    generation,
                    execution_id: 1,
                    timer_id,
                    fire_at_ms,
                }),
                EventKind::SubOrchestrationCreated {
                    task_id,
                    name,
                    instance_id,
                    input,
                    version,
                } => inner.spawn_child(&new_id, 1, task_id, name, instance_id, input, version, None, now),
                _ => {}
            }
        }
        debug!(
            target: "durotask::runtime",
            instance_id = %new_id,
            source_instance_id = %source_id,
            event_id = request.event_id,
            "instance rerun"
        );
        Ok(new_id)
    }

    async fn list_instance_ids(
        &self,
        page_size: usize,
        continuation_token: Option<&str>,
    ) -> Result<InstanceIdPage, TaskHubError> {
        let inner = self.inner.lock().await;
        let page_size = if page_size == 0 { DEFAULT_PAGE_SIZE } else { page_size };
        let start = match continuation_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Unbounded,
        };
        let mut ids = inner
            .instances
            .range::<String, _>((start, Bound::Unbounded))
            .map(|(id, _)| id.clone());
        let instance_ids: Vec<String> = ids.by_ref().take(page_size).collect();
        let continuation_token = if ids.next().is_some() {
            instance_ids.last().cloned()
        } else {
            None
        };
        Ok(InstanceIdPage {
            instance_ids,
            continuation_token,
        })
    }

    async fn get_history(&self, instance_id: &str, execution_id: Option<u64>) -> Result<Vec<Event>, TaskHubError> {
        let inner = self.inner.lock().await;
        let inst = inner
            .instances
            .get(instance_id)
            .ok_or_else(|| TaskHubError::InstanceNotFound(instance_id.to_string()))?;
        match execution_id {
            None => Ok(inst.history().to_vec()),
            Some(id) => id
                .checked_sub(1)
                .and_then(|idx| inst.executions.get(idx as usize))
                .cloned()
                .ok_or_else(|| TaskHubError::invalid_state(instance_id, format!("execution {id} does not exist"))),
        }
    }

    async fn fetch_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, TaskHubError> {
        let mut inner = self.inner.lock().await;
        let now = now_ms();
        inner.fire_due_timers(now);

        let Some(instance_id) = inner
            .instances
            .iter()
            .find(|(_, i)| i.is_runnable(now))
            .map(|(id, _)| id.clone())
        else {
            return Ok(None);
        };
        let token = inner.token("orch");
        let Some(inst) = inner.instances.get_mut(&instance_id) else {
            return Ok(None);
        };
        inst.locked = true;
        inst.start_at_ms = None;
        let mut new_events = vec![Event::new(now, EventKind::OrchestratorStarted { version: None })];
        new_events.extend(inst.inbox.drain(..));
        let item = OrchestrationWorkItem {
            token: token.clone(),
            instance_id: instance_id.clone(),
            execution_id: inst.execution_id(),
            old_events: inst.history().to_vec(),
            new_events: new_events.clone(),
        };
        let locked = LockedTurn {
            instance_id,
            generation: inst.generation,
            execution_id: inst.execution_id(),
            new_events,
        };
        inner.locked_orchestrations.insert(token, locked);
        Ok(Some(item))
    }

    async fn complete_orchestration_work_item(
        &self,
        token: &str,
        response: OrchestratorResponse,
    ) -> Result<(), TaskHubError> {
        let mut inner = self.inner.lock().await;
        let turn = inner
            .locked_orchestrations
            .remove(token)
            .ok_or_else(|| TaskHubError::InvalidToken(token.to_string()))?;
        let now = now_ms();
        let Some(inst) = inner
            .instances
            .get_mut(&turn.instance_id)
            .filter(|i| i.generation == turn.generation)
        else {
            // Purged or replaced while the turn was running
            return Ok(());
        };
        inst.locked = false;
        if inst.execution_id() != turn.execution_id || inst.is_terminal() {
            return Ok(());
        }

        let mut new_events = turn.new_events;
        if (response.version.name.is_some() || !response.version.patches.is_empty())
            && let Some(Event {
                kind: EventKind::OrchestratorStarted { version },
                ..
            }) = new_events.first_mut()
        {
            *version = Some(response.version.clone());
        }
        inst.history_mut().extend(new_events);
        inst.custom_status = response.custom_status;
        inst.last_updated_at = Utc::now();
        if matches!(inst.status, RuntimeStatus::Pending | RuntimeStatus::ContinuedAsNew) {
            inst.status = RuntimeStatus::Running;
        }

        for action in response.actions {
            inner.apply_action(&turn.instance_id, turn.generation, turn.execution_id, action, now);
        }
        Ok(())
    }

    async fn abandon_orchestration_work_item(&self, token: &str) -> Result<(), TaskHubError> {
        let mut inner = self.inner.lock().await;
        let turn = inner
            .locked_orchestrations
            .remove(token)
            .ok_or_else(|| TaskHubError::InvalidToken(token.to_string()))?;
        if let Some(inst) = inner
            .instances
            .get_mut(&turn.instance_id)
            .filter(|i| i.generation == turn.generation)
        {
            inst.locked = false;
            if inst.execution_id() == turn.execution_id {
                // Skip the turn's OrchestratorStarted; the next fetch stamps a fresh one
                for event in turn.new_events.into_iter().skip(1).rev() {
                    inst.inbox.push_front(event);
                }
            }
        }
        Ok(())
    }

    async fn fetch_activity_work_item(&self) -> Result<Option<ActivityWorkItem>, TaskHubError> {
        let mut inner = self.inner.lock().await;
        while let Some(queued) = inner.activities.pop_front() {
            let item = &queued.item;
            if inner
                .live_execution(&item.instance_id, queued.generation, item.execution_id)
                .is_none()
            {
                continue;
            }
            let token = inner.token("act");
            let mut item = queued.item.clone();
            item.token = token.clone();
            inner.locked_activities.insert(token, queued);
            return Ok(Some(item));
        }
        Ok(None)
    }

    async fn complete_activity_work_item(&self, token: &str, response: ActivityResponse) -> Result<(), TaskHubError> {
        let mut inner = self.inner.lock().await;
        let queued = inner
            .locked_activities
            .remove(token)
            .ok_or_else(|| TaskHubError::InvalidToken(token.to_string()))?;
        let now = now_ms();
        let Some(inst) = inner.live_execution(&queued.item.instance_id, queued.generation, queued.item.execution_id)
        else {
            debug!(
                target: "durotask::runtime",
                instance_id = %queued.item.instance_id,
                task_id = queued.item.task_id,
                "dropping activity result for a finished execution"
            );
            return Ok(());
        };
        let kind = match response.outcome {
            Ok(result) => EventKind::TaskCompleted {
                task_scheduled_id: queued.item.task_id,
                result,
            },
            Err(details) => EventKind::TaskFailed {
                task_scheduled_id: queued.item.task_id,
                details,
            },
        };
        inst.inbox.push_back(Event::new(now, kind));
        Ok(())
    }

    async fn abandon_activity_work_item(&self, token: &str) -> Result<(), TaskHubError> {
        let mut inner = self.inner.lock().await;
        let queued = inner
            .locked_activities
            .remove(token)
            .ok_or_else(|| TaskHubError::InvalidToken(token.to_string()))?;
        if inner
            .live_execution(&queued.item.instance_id, queued.generation, queued.item.execution_id)
            .is_some()
        {
            inner.activities.push_front(queued);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            instance_id: id.to_string(),
            name: "W".to_string(),
            version: None,
            input: "in".to_string(),
            start_at: None,
            trace_context: None,
            reuse_policy: ReusePolicy::Error,
        }
    }

    fn response(actions: Vec<Action>) -> OrchestratorResponse {
        OrchestratorResponse {
            actions,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_turn_carries_started_events_and_locks_the_instance() {
        let hub = InMemoryTaskHub::new();
        hub.create_instance(request("a")).await.unwrap();

        let item = hub.fetch_orchestration_work_item().await.unwrap().unwrap();
        assert_eq!(item.execution_id, 1);
        assert!(item.old_events.is_empty());
        assert!(matches!(item.new_events[0].kind, EventKind::OrchestratorStarted { .. }));
        assert!(matches!(item.new_events[1].kind, EventKind::ExecutionStarted { .. }));

        hub.raise_event("a", "go", None).await.unwrap();
        assert!(hub.fetch_orchestration_work_item().await.unwrap().is_none());

        hub.complete_orchestration_work_item(&item.token, response(vec![])).await.unwrap();
        let md = hub.fetch_metadata("a", false).await.unwrap();
        assert_eq!(md.runtime_status, RuntimeStatus::Running);
        assert!(hub.fetch_orchestration_work_item().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_instance_follows_reuse_policy() {
        let hub = InMemoryTaskHub::new();
        hub.create_instance(request("a")).await.unwrap();
        assert_eq!(
            hub.create_instance(request("a")).await,
            Err(TaskHubError::DuplicateInstance("a".into()))
        );
        let mut ignore = request("a");
        ignore.reuse_policy = ReusePolicy::Ignore;
        assert_eq!(hub.create_instance(ignore).await.unwrap(), "a");
    }

    #[tokio::test]
    async fn activity_results_flow_back_into_the_inbox() {
        let hub = InMemoryTaskHub::new();
        hub.create_instance(request("a")).await.unwrap();
        let item = hub.fetch_orchestration_work_item().await.unwrap().unwrap();
        hub.complete_orchestration_work_item(
            &item.token,
            response(vec![Action::ScheduleTask {
                id: 0,
                name: "Act".into(),
                input: "x".into(),
                trace_context: None,
            }]),
        )
        .await
        .unwrap();

        let work = hub.fetch_activity_work_item().await.unwrap().unwrap();
        assert_eq!(work.name, "Act");
        assert_eq!(work.task_id, 0);
        hub.complete_activity_work_item(
            &work.token,
            ActivityResponse {
                instance_id: "a".into(),
                execution_id: 1,
                task_id: 0,
                outcome: Ok("done".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            hub.complete_activity_work_item(
                &work.token,
                ActivityResponse {
                    instance_id: "a".into(),
                    execution_id: 1,
                    task_id: 0,
                    outcome: Ok("again".into()),
                },
            )
            .await,
            Err(TaskHubError::InvalidToken(work.token.clone()))
        );

        let next = hub.fetch_orchestration_work_item().await.unwrap().unwrap();
        assert!(matches!(
            &next.new_events[1].kind,
            EventKind::TaskCompleted { task_scheduled_id: 0, result } if result == "done"
        ));
        assert!(matches!(next.old_events.last().unwrap().kind, EventKind::TaskScheduled { .. }));
    }

    #[tokio::test]
    async fn abandoned_turn_returns_events_to_the_inbox() {
        let hub = InMemoryTaskHub::new();
        hub.create_instance(request("a")).await.unwrap();
        let item = hub.fetch_orchestration_work_item().await.unwrap().unwrap();
        hub.abandon_orchestration_work_item(&item.token).await.unwrap();
        let again = hub.fetch_orchestration_work_item().await.unwrap().unwrap();
        assert_eq!(again.new_events.len(), 2);
        assert!(matches!(again.new_events[1].kind, EventKind::ExecutionStarted { .. }));
    }

    #[tokio::test]
    async fn abandoned_activity_is_redelivered_with_a_new_token() {
        let hub = InMemoryTaskHub::new();
        hub.create_instance(request("a")).await.unwrap();
        let item = hub.fetch_orchestration_work_item().await.unwrap().unwrap();
        hub.complete_orchestration_work_item(
            &item.token,
            response(vec![Action::ScheduleTask {
                id: 0,
                name: "Act".into(),
                input: "x".into(),
                trace_context: None,
            }]),
        )
        .await
        .unwrap();

        let first = hub.fetch_activity_work_item().await.unwrap().unwrap();
        assert!(hub.fetch_activity_work_item().await.unwrap().is_none());
        hub.abandon_activity_work_item(&first.token).await.unwrap();
        assert_eq!(
            hub.abandon_activity_work_item(&first.token).await,
            Err(TaskHubError::InvalidToken(first.token.clone()))
        );

        let second = hub.fetch_activity_work_item().await.unwrap().unwrap();
        assert_ne!(second.token, first.token);
        assert_eq!((second.name.as_str(), second.task_id, second.input.as_str()), ("Act", 0, "x"));
    }

    #[tokio::test]
    async fn list_instance_ids_pages_in_id_order() {
        let hub = InMemoryTaskHub::new();
        for id in ["c", "a", "b"] {
            hub.create_instance(request(id)).await.unwrap();
        }
        let first = hub.list_instance_ids(2, None).await.unwrap();
        assert_eq!(first.instance_ids, vec!["a", "b"]);
        let token = first.continuation_token.unwrap();
        let second = hub.list_instance_ids(2, Some(&token)).await.unwrap();
        assert_eq!(second.instance_ids, vec!["c"]);
        assert!(second.continuation_token.is_none());
    }

    #[tokio::test]
    async fn purge_of_a_running_instance_requires_force() {
        let hub = InMemoryTaskHub::new();
        hub.create_instance(request("a")).await.unwrap();
        assert!(matches!(
            hub.purge("a", false, false).await,
            Err(TaskHubError::InvalidState { .. })
        ));
        assert_eq!(hub.purge("a", false, true).await.unwrap(), 1);
        assert!(matches!(
            hub.fetch_metadata("a", false).await,
            Err(TaskHubError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resume_requires_a_suspended_instance() {
        let hub = InMemoryTaskHub::new();
        hub.create_instance(request("a")).await.unwrap();
        assert!(matches!(
            hub.resume("a", "r").await,
            Err(TaskHubError::InvalidState { .. })
        ));
        hub.suspend("a", "s").await.unwrap();
        assert_eq!(
            hub.fetch_metadata("a", false).await.unwrap().runtime_status,
            RuntimeStatus::Suspended
        );
        hub.resume("a", "r").await.unwrap();
    }

    #[tokio::test]
    async fn continue_as_new_seeds_the_next_execution() {
        let hub = InMemoryTaskHub::new();
        hub.create_instance(request("a")).await.unwrap();
        let item = hub.fetch_orchestration_work_item().await.unwrap().unwrap();
        let carried = Event::new(
            1,
            EventKind::EventRaised {
                name: "e".into(),
                input: "1".into(),
            },
        );
        hub.complete_orchestration_work_item(
            &item.token,
            response(vec![Action::CompleteOrchestration {
                status: CompletionStatus::ContinuedAsNew,
                result: Some("next".into()),
                failure: None,
                carryover_events: vec![carried.clone()],
            }]),
        )
        .await
        .unwrap();

        let md = hub.fetch_metadata("a", true).await.unwrap();
        assert_eq!(md.runtime_status, RuntimeStatus::ContinuedAsNew);
        assert_eq!(md.execution_id, 2);
        let first = hub.get_history("a", Some(1)).await.unwrap();
        assert!(matches!(first.last().unwrap().kind, EventKind::ExecutionContinuedAsNew { .. }));

        let next = hub.fetch_orchestration_work_item().await.unwrap().unwrap();
        assert_eq!(next.execution_id, 2);
        assert!(matches!(
            &next.new_events[1].kind,
            EventKind::ExecutionStarted { input, .. } if input == "next"
        ));
        assert_eq!(next.new_events[2], carried);
    }
}
