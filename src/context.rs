//! Orchestration context: the deterministic surface workflow code talks to.
//!
//! Every operation a workflow issues takes the next sequence number of the
//! replay pass and becomes a pending [`Action`]. While history is applied the
//! scheduling events consume those actions (by sequence number) and the
//! completion events resolve the matching [`Task`] slots. Anything still
//! pending after the last event is a new decision for the task hub.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Waker;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::futures::{TaskState, WhenAll, WhenAny};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::{Action, Event, EventKind, FailureDetails, ParentInstance, StalledReason, Task, TaskError, TraceContext};

/// Determinism violation or missing code detected while replaying history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {description}")]
pub struct ReplayError {
    pub reason: StalledReason,
    pub description: String,
}

impl ReplayError {
    pub fn mismatch(description: impl Into<String>) -> Self {
        Self {
            reason: StalledReason::PatchMismatch,
            description: description.into(),
        }
    }

    pub fn version_unavailable(description: impl Into<String>) -> Self {
        Self {
            reason: StalledReason::VersionNotAvailable,
            description: description.into(),
        }
    }
}

/// Encoded payload plus any error raised while encoding it.
#[derive(Debug, Clone, Default)]
struct Payload {
    value: String,
    encode_error: Option<String>,
}

impl Payload {
    fn encode<T: Serialize>(value: &T) -> Self {
        match Json::encode(value) {
            Ok(value) => Self {
                value,
                encode_error: None,
            },
            Err(e) => Self {
                value: String::new(),
                encode_error: Some(e),
            },
        }
    }

    fn raw(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            encode_error: None,
        }
    }
}

/// Options for [`OrchestrationContext::call_activity`].
#[derive(Debug, Clone, Default)]
pub struct CallActivityOptions {
    input: Payload,
    pub retry_policy: Option<RetryPolicy>,
}

impl CallActivityOptions {
    /// JSON-encode `value` as the activity input. Use `raw_input` to pass text untouched.
    pub fn input<T: Serialize>(mut self, value: &T) -> Self {
        self.input = Payload::encode(value);
        self
    }

    pub fn raw_input(mut self, input: impl Into<String>) -> Self {
        self.input = Payload::raw(input);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Options for [`OrchestrationContext::call_child_workflow`].
#[derive(Debug, Clone, Default)]
pub struct ChildWorkflowOptions {
    input: Payload,
    /// Defaults to `"{parent_id}:{seq:04x}"`.
    pub instance_id: Option<String>,
    pub version: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
}

impl ChildWorkflowOptions {
    pub fn input<T: Serialize>(mut self, value: &T) -> Self {
        self.input = Payload::encode(value);
        self
    }

    pub fn raw_input(mut self, input: impl Into<String>) -> Self {
        self.input = Payload::raw(input);
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Options for [`OrchestrationContext::create_timer`].
#[derive(Debug, Clone, Default)]
pub struct CreateTimerOptions {
    pub name: Option<String>,
}

impl CreateTimerOptions {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Options for [`OrchestrationContext::continue_as_new`].
#[derive(Debug, Clone, Default)]
pub struct ContinueAsNewOptions {
    /// Carry external events nobody waited for into the next execution.
    pub keep_unprocessed_events: bool,
}

impl ContinueAsNewOptions {
    pub fn keep_unprocessed_events(mut self) -> Self {
        self.keep_unprocessed_events = true;
        self
    }
}

#[derive(Debug, Clone)]
struct TaskSlot {
    state: TaskState,
    resolved_at: Option<u64>,
    wakers: Vec<Waker>,
}

#[derive(Debug, Clone)]
enum CallTarget {
    Activity {
        name: String,
    },
    Child {
        name: String,
        instance_id: Option<String>,
        version: Option<String>,
    },
}

/// Everything needed to (re)issue an activity or child-workflow attempt.
#[derive(Debug, Clone)]
struct CallState {
    target: CallTarget,
    input: String,
    policy: Option<RetryPolicy>,
    attempt: u32,
    first_attempt_ms: u64,
}

/// What a sequence number stands for.
#[derive(Debug, Clone)]
enum Correlation {
    Activity { task: usize },
    Child { task: usize },
    Timer { task: usize },
    RetryTimer { task: usize },
    EventTimeout { task: usize, name: String },
}

impl Correlation {
    fn describe(&self) -> &'static str {
        match self {
            Correlation::Activity { .. } => "activity",
            Correlation::Child { .. } => "child workflow",
            Correlation::Timer { .. } | Correlation::RetryTimer { .. } | Correlation::EventTimeout { .. } => {
                "timer"
            }
        }
    }
}

/// Pending continue-as-new request.
#[derive(Debug, Clone)]
pub(crate) struct ContinueAsNew {
    pub(crate) input: String,
    pub(crate) keep_unprocessed_events: bool,
    /// Set when the typed input failed to encode; the execution fails instead.
    pub(crate) encode_error: Option<String>,
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    instance_id: String,
    name: String,
    input: String,
    version: Option<String>,
    parent: Option<ParentInstance>,
    trace_context: Option<TraceContext>,
    current_time_ms: u64,
    is_replaying: bool,
    sequence: u64,
    tasks: Vec<TaskSlot>,
    resolution_counter: u64,
    calls: HashMap<usize, CallState>,
    correlations: HashMap<u64, Correlation>,
    pending_actions: BTreeMap<u64, Action>,
    pending_events: HashMap<String, VecDeque<usize>>,
    buffered_events: HashMap<String, VecDeque<Event>>,
    buffered_order: u64,
    buffered_positions: HashMap<String, VecDeque<u64>>,
    custom_status: Option<String>,
    continue_as_new: Option<ContinueAsNew>,
    recorded_patches: HashSet<String>,
    patch_cache: HashMap<String, bool>,
    new_patches: Vec<String>,
    replay_error: Option<ReplayError>,
    woken: Vec<Waker>,
}

/// Deterministic handle passed to workflow functions.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("OrchestrationContext")
            .field("instance_id", &inner.instance_id)
            .field("name", &inner.name)
            .field("is_replaying", &inner.is_replaying)
            .finish()
    }
}

/// Identity of the execution a context is created for.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutionInfo {
    pub(crate) instance_id: String,
    pub(crate) name: String,
    pub(crate) input: String,
    pub(crate) version: Option<String>,
    pub(crate) parent: Option<ParentInstance>,
    pub(crate) trace_context: Option<TraceContext>,
    pub(crate) start_time_ms: u64,
    pub(crate) recorded_patches: HashSet<String>,
}

impl OrchestrationContext {
    pub(crate) fn new(info: ExecutionInfo) -> Self {
        let inner = CtxInner {
            instance_id: info.instance_id,
            name: info.name,
            input: info.input,
            version: info.version,
            parent: info.parent,
            trace_context: info.trace_context,
            current_time_ms: info.start_time_ms,
            is_replaying: false,
            sequence: 0,
            tasks: Vec::new(),
            resolution_counter: 0,
            calls: HashMap::new(),
            correlations: HashMap::new(),
            pending_actions: BTreeMap::new(),
            pending_events: HashMap::new(),
            buffered_events: HashMap::new(),
            buffered_order: 0,
            buffered_positions: HashMap::new(),
            custom_status: None,
            continue_as_new: None,
            recorded_patches: info.recorded_patches,
            patch_cache: HashMap::new(),
            new_patches: Vec::new(),
            replay_error: None,
            woken: Vec::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // A panicking workflow poisons the lock; the state is still consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ----- identity and clock -----

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Version this execution is pinned to, for versioned workflows.
    pub fn version(&self) -> Option<String> {
        self.lock().version.clone()
    }

    pub fn parent(&self) -> Option<ParentInstance> {
        self.lock().parent.clone()
    }

    pub fn trace_context(&self) -> Option<TraceContext> {
        self.lock().trace_context.clone()
    }

    /// True while the context is re-applying recorded history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying
    }

    /// Logical time: the timestamp of the turn currently being applied.
    pub fn current_time_utc(&self) -> DateTime<Utc> {
        let ms = self.lock().current_time_ms;
        Utc.timestamp_millis_opt(ms as i64).single().unwrap_or_default()
    }

    pub fn current_time_ms(&self) -> u64 {
        self.lock().current_time_ms
    }

    /// Decode the workflow input. An empty input decodes as `null`.
    pub fn get_input<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        let input = self.lock().input.clone();
        Json::decode(&input).map_err(TaskError::Decode)
    }

    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.lock().custom_status = Some(status.into());
    }

    pub fn clear_custom_status(&self) {
        self.lock().custom_status = None;
    }

    // ----- durable operations -----

    /// Schedule an activity. Failed attempts are retried according to the
    /// attached policy before the task resolves with the final failure.
    pub fn call_activity(&self, name: impl AsRef<str>, options: CallActivityOptions) -> Task {
        let mut inner = self.lock();
        let task = inner.new_task();
        if let Some(e) = options.input.encode_error {
            inner.resolve(task, TaskState::Failed(TaskError::Decode(e)));
        } else {
            let call = CallState {
                target: CallTarget::Activity {
                    name: name.as_ref().to_string(),
                },
                input: options.input.value,
                policy: options.retry_policy,
                attempt: 0,
                first_attempt_ms: inner.current_time_ms,
            };
            inner.calls.insert(task, call);
            inner.issue_attempt(task);
        }
        self.task(task)
    }

    /// Start a child workflow and wait for its result.
    pub fn call_child_workflow(&self, name: impl AsRef<str>, options: ChildWorkflowOptions) -> Task {
        let mut inner = self.lock();
        let task = inner.new_task();
        if let Some(e) = options.input.encode_error {
            inner.resolve(task, TaskState::Failed(TaskError::Decode(e)));
        } else {
            let call = CallState {
                target: CallTarget::Child {
                    name: name.as_ref().to_string(),
                    instance_id: options.instance_id,
                    version: options.version,
                },
                input: options.input.value,
                policy: options.retry_policy,
                attempt: 0,
                first_attempt_ms: inner.current_time_ms,
            };
            inner.calls.insert(task, call);
            inner.issue_attempt(task);
        }
        self.task(task)
    }

    /// Durable timer firing `delay` after the current logical time.
    pub fn create_timer(&self, delay: Duration, options: CreateTimerOptions) -> Task {
        let mut inner = self.lock();
        let task = inner.new_task();
        let fire_at_ms = inner.current_time_ms.saturating_add(delay.as_millis() as u64);
        let seq = inner.next_sequence();
        inner.correlations.insert(seq, Correlation::Timer { task });
        inner.pending_actions.insert(
            seq,
            Action::CreateTimer {
                id: seq,
                fire_at_ms,
                name: options.name,
            },
        );
        self.task(task)
    }

    /// Wait for an external event. Names are case-insensitive; each raised
    /// event completes exactly one waiter in FIFO order.
    ///
    /// `timeout`: `None` waits forever, `Some(Duration::ZERO)` cancels at once
    /// unless the event is already buffered, `Some(d)` schedules a durable timer.
    pub fn wait_for_external_event(&self, name: impl AsRef<str>, timeout: Option<Duration>) -> Task {
        let key = name.as_ref().to_lowercase();
        let mut inner = self.lock();
        let task = inner.new_task();

        if let Some(event) = inner.take_buffered_event(&key) {
            if let EventKind::EventRaised { input, .. } = event.kind {
                inner.resolve(task, TaskState::Completed(input));
            }
            return self.task(task);
        }

        match timeout {
            Some(d) if d.is_zero() => {
                inner.resolve(task, TaskState::Failed(TaskError::Canceled));
            }
            Some(d) => {
                inner.pending_events.entry(key.clone()).or_default().push_back(task);
                let fire_at_ms = inner.current_time_ms.saturating_add(d.as_millis() as u64);
                let seq = inner.next_sequence();
                inner
                    .correlations
                    .insert(seq, Correlation::EventTimeout { task, name: key.clone() });
                inner.pending_actions.insert(
                    seq,
                    Action::CreateTimer {
                        id: seq,
                        fire_at_ms,
                        name: Some(key),
                    },
                );
            }
            None => {
                inner.pending_events.entry(key).or_default().push_back(task);
            }
        }
        self.task(task)
    }

    /// Finish this execution and start a new one with `input` once the
    /// workflow function returns.
    ///
    /// If `input` cannot be encoded the execution fails with a
    /// non-retriable `ContinueAsNewInputError` instead.
    pub fn continue_as_new<T: Serialize>(&self, input: &T, options: ContinueAsNewOptions) {
        self.request_continue_as_new(Payload::encode(input), options);
    }

    /// Like [`continue_as_new`](Self::continue_as_new) with a pre-encoded input.
    pub fn continue_as_new_raw(&self, input: impl Into<String>, options: ContinueAsNewOptions) {
        self.request_continue_as_new(Payload::raw(input), options);
    }

    fn request_continue_as_new(&self, input: Payload, options: ContinueAsNewOptions) {
        self.lock().continue_as_new = Some(ContinueAsNew {
            input: input.value,
            keep_unprocessed_events: options.keep_unprocessed_events,
            encode_error: input.encode_error,
        });
    }

    /// Branch safely between old and new code paths.
    ///
    /// True when history recorded the patch; false when replaying a history
    /// that never recorded it; otherwise true and the patch is recorded.
    pub fn is_patched(&self, patch: &str) -> bool {
        let mut inner = self.lock();
        if let Some(v) = inner.patch_cache.get(patch) {
            return *v;
        }
        let v = if inner.recorded_patches.contains(patch) {
            true
        } else if inner.is_replaying {
            false
        } else {
            inner.new_patches.push(patch.to_string());
            true
        };
        inner.patch_cache.insert(patch.to_string(), v);
        v
    }

    pub fn when_all(&self, tasks: impl IntoIterator<Item = Task>) -> WhenAll {
        WhenAll {
            tasks: tasks.into_iter().collect(),
        }
    }

    pub fn when_any(&self, tasks: impl IntoIterator<Item = Task>) -> WhenAny {
        WhenAny {
            tasks: tasks.into_iter().collect(),
        }
    }

    fn task(&self, id: usize) -> Task {
        Task { id, ctx: self.clone() }
    }

    // ----- executor interface -----

    pub(crate) fn task_state(&self, id: usize) -> TaskState {
        self.lock()
            .tasks
            .get(id)
            .map_or(TaskState::Pending, |slot| slot.state.clone())
    }

    /// Register interest in a pending task so combinators that track wakeups
    /// (e.g. `FuturesUnordered`) re-poll it once it resolves.
    pub(crate) fn register_waker(&self, id: usize, waker: &Waker) {
        if let Some(slot) = self.lock().tasks.get_mut(id)
            && !slot.wakers.iter().any(|w| w.will_wake(waker))
        {
            slot.wakers.push(waker.clone());
        }
    }

    pub(crate) fn resolved_at(&self, id: usize) -> Option<u64> {
        self.lock().tasks.get(id).and_then(|slot| slot.resolved_at)
    }

    pub(crate) fn set_replaying(&self, replaying: bool) {
        self.lock().is_replaying = replaying;
    }

    pub(crate) fn apply_event(&self, event: &Event) -> Result<(), ReplayError> {
        let (result, woken) = {
            let mut inner = self.lock();
            let result = inner.apply_event(event);
            if let Err(e) = &result
                && inner.replay_error.is_none()
            {
                inner.replay_error = Some(e.clone());
            }
            (result, std::mem::take(&mut inner.woken))
        };
        woken.into_iter().for_each(Waker::wake);
        result
    }

    pub(crate) fn replay_error(&self) -> Option<ReplayError> {
        self.lock().replay_error.clone()
    }

    /// Every patch recorded in history must have been asked for by the time
    /// recorded history is exhausted.
    pub(crate) fn verify_patches(&self) -> Result<(), ReplayError> {
        let inner = self.lock();
        let mut missing: Vec<&String> = inner
            .recorded_patches
            .iter()
            .filter(|p| !inner.patch_cache.contains_key(*p))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(ReplayError::mismatch(format!(
            "history recorded patch '{}' but the workflow no longer checks it",
            missing[0]
        )))
    }

    pub(crate) fn take_pending_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().pending_actions).into_values().collect()
    }

    pub(crate) fn custom_status(&self) -> Option<String> {
        self.lock().custom_status.clone()
    }

    pub(crate) fn continue_as_new_request(&self) -> Option<ContinueAsNew> {
        self.lock().continue_as_new.clone()
    }

    pub(crate) fn new_patches(&self) -> Vec<String> {
        self.lock().new_patches.clone()
    }

    /// External events that no waiter consumed, in arrival order.
    pub(crate) fn unprocessed_events(&self) -> Vec<Event> {
        let inner = self.lock();
        let mut all: Vec<(u64, Event)> = Vec::new();
        for (name, events) in &inner.buffered_events {
            if let Some(positions) = inner.buffered_positions.get(name) {
                all.extend(positions.iter().copied().zip(events.iter().cloned()));
            }
        }
        all.sort_by_key(|(pos, _)| *pos);
        all.into_iter().map(|(_, e)| e).collect()
    }
}

impl CtxInner {
    fn new_task(&mut self) -> usize {
        self.tasks.push(TaskSlot {
            state: TaskState::Pending,
            resolved_at: None,
            wakers: Vec::new(),
        });
        self.tasks.len() - 1
    }

    fn next_sequence(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }

    /// Resolve a slot. A task resolves at most once; later outcomes are ignored.
    fn resolve(&mut self, task: usize, state: TaskState) {
        let Some(slot) = self.tasks.get_mut(task) else {
            return;
        };
        if !matches!(slot.state, TaskState::Pending) {
            return;
        }
        slot.state = state;
        slot.resolved_at = Some(self.resolution_counter);
        self.woken.append(&mut slot.wakers);
        self.resolution_counter += 1;
    }

    fn is_pending(&self, task: usize) -> bool {
        self.tasks
            .get(task)
            .is_some_and(|slot| matches!(slot.state, TaskState::Pending))
    }

    fn issue_attempt(&mut self, task: usize) {
        let Some(call) = self.calls.get_mut(&task) else {
            return;
        };
        call.attempt += 1;
        let call = call.clone();
        let seq = self.next_sequence();
        let action = match call.target {
            CallTarget::Activity { name } => {
                self.correlations.insert(seq, Correlation::Activity { task });
                Action::ScheduleTask {
                    id: seq,
                    name,
                    input: call.input,
                    trace_context: self.trace_context.clone(),
                }
            }
            CallTarget::Child {
                name,
                instance_id,
                version,
            } => {
                self.correlations.insert(seq, Correlation::Child { task });
                let instance_id = instance_id.unwrap_or_else(|| format!("{}:{seq:04x}", self.instance_id));
                Action::CreateSubOrchestration {
                    id: seq,
                    name,
                    instance_id,
                    input: call.input,
                    version,
                    trace_context: self.trace_context.clone(),
                }
            }
        };
        self.pending_actions.insert(seq, action);
    }

    fn on_attempt_failed(&mut self, task: usize, details: FailureDetails) {
        let Some(call) = self.calls.get(&task) else {
            self.resolve(task, TaskState::Failed(TaskError::Failed(details)));
            return;
        };
        let decision = match &call.policy {
            None => RetryDecision::Stop,
            Some(policy) => {
                let elapsed = Duration::from_millis(self.current_time_ms.saturating_sub(call.first_attempt_ms));
                policy.evaluate(call.attempt, elapsed, &details)
            }
        };
        match decision {
            RetryDecision::Stop => self.resolve(task, TaskState::Failed(TaskError::Failed(details))),
            RetryDecision::RetryNow => self.issue_attempt(task),
            RetryDecision::RetryAfter(delay) => {
                let fire_at_ms = self.current_time_ms.saturating_add(delay.as_millis() as u64);
                let seq = self.next_sequence();
                self.correlations.insert(seq, Correlation::RetryTimer { task });
                self.pending_actions.insert(
                    seq,
                    Action::CreateTimer {
                        id: seq,
                        fire_at_ms,
                        name: None,
                    },
                );
            }
        }
    }

    fn buffer_event(&mut self, key: String, event: Event) {
        let pos = self.buffered_order;
        self.buffered_order += 1;
        self.buffered_positions.entry(key.clone()).or_default().push_back(pos);
        self.buffered_events.entry(key).or_default().push_back(event);
    }

    fn take_buffered_event(&mut self, key: &str) -> Option<Event> {
        let event = self.buffered_events.get_mut(key)?.pop_front()?;
        if let Some(positions) = self.buffered_positions.get_mut(key) {
            positions.pop_front();
        }
        Some(event)
    }

    /// Remove the pending action a scheduling event refers to, checking that
    /// the code issued the same kind of operation with the same name.
    fn match_scheduled(&mut self, seq: u64, recorded: &str, recorded_name: Option<&str>) -> Result<(), ReplayError> {
        let Some(action) = self.pending_actions.remove(&seq) else {
            return Err(ReplayError::mismatch(format!(
                "history has {recorded} with sequence {seq} but the workflow did not issue it"
            )));
        };
        let (expected, issued_name) = match &action {
            Action::ScheduleTask { name, .. } => ("TaskScheduled", Some(name.as_str())),
            Action::CreateTimer { .. } => ("TimerCreated", None),
            Action::CreateSubOrchestration { name, .. } => ("SubOrchestrationCreated", Some(name.as_str())),
            other => (other.kind_name(), None),
        };
        if expected != recorded || issued_name != recorded_name {
            return Err(ReplayError::mismatch(format!(
                "sequence {seq}: history has {recorded}({}) but the workflow issued {expected}({})",
                recorded_name.unwrap_or(""),
                issued_name.unwrap_or("")
            )));
        }
        Ok(())
    }

    /// Look up what a completion refers to. Unknown sequence numbers in
    /// recorded history are a determinism violation; in newly delivered events
    /// they are stale deliveries (e.g. from a previous execution) and dropped.
    fn correlation(&self, seq: u64, event: &str) -> Result<Option<Correlation>, ReplayError> {
        match self.correlations.get(&seq) {
            Some(c) => Ok(Some(c.clone())),
            None if self.is_replaying => Err(ReplayError::mismatch(format!(
                "{event} references sequence {seq} which the workflow never issued"
            ))),
            None => {
                tracing::warn!(
                    target: "durotask::orchestration",
                    instance_id = %self.instance_id,
                    sequence = seq,
                    event = %event,
                    "dropping completion for unknown sequence number"
                );
                Ok(None)
            }
        }
    }

    fn apply_event(&mut self, event: &Event) -> Result<(), ReplayError> {
        match &event.kind {
            EventKind::OrchestratorStarted { .. } => {
                self.current_time_ms = event.timestamp_ms;
            }
            EventKind::TaskScheduled { task_id, name, .. } => {
                self.match_scheduled(*task_id, "TaskScheduled", Some(name))?;
            }
            EventKind::TimerCreated { timer_id, .. } => {
                self.match_scheduled(*timer_id, "TimerCreated", None)?;
            }
            EventKind::SubOrchestrationCreated { task_id, name, .. } => {
                self.match_scheduled(*task_id, "SubOrchestrationCreated", Some(name))?;
            }
            EventKind::TaskCompleted {
                task_scheduled_id,
                result,
            } => match self.correlation(*task_scheduled_id, "TaskCompleted")? {
                None => {}
                Some(Correlation::Activity { task }) => self.resolve(task, TaskState::Completed(result.clone())),
                Some(other) => return Err(kind_mismatch(*task_scheduled_id, "TaskCompleted", &other)),
            },
            EventKind::TaskFailed {
                task_scheduled_id,
                details,
            } => match self.correlation(*task_scheduled_id, "TaskFailed")? {
                None => {}
                Some(Correlation::Activity { task }) => self.on_attempt_failed(task, details.clone()),
                Some(other) => return Err(kind_mismatch(*task_scheduled_id, "TaskFailed", &other)),
            },
            EventKind::SubOrchestrationCompleted {
                task_scheduled_id,
                result,
            } => match self.correlation(*task_scheduled_id, "SubOrchestrationCompleted")? {
                None => {}
                Some(Correlation::Child { task }) => self.resolve(task, TaskState::Completed(result.clone())),
                Some(other) => return Err(kind_mismatch(*task_scheduled_id, "SubOrchestrationCompleted", &other)),
            },
            EventKind::SubOrchestrationFailed {
                task_scheduled_id,
                details,
            } => match self.correlation(*task_scheduled_id, "SubOrchestrationFailed")? {
                None => {}
                Some(Correlation::Child { task }) => self.on_attempt_failed(task, details.clone()),
                Some(other) => return Err(kind_mismatch(*task_scheduled_id, "SubOrchestrationFailed", &other)),
            },
            EventKind::TimerFired { timer_id, .. } => match self.correlation(*timer_id, "TimerFired")? {
                None => {}
                Some(Correlation::Timer { task }) => self.resolve(task, TaskState::Completed(String::new())),
                Some(Correlation::RetryTimer { task }) => self.issue_attempt(task),
                Some(Correlation::EventTimeout { task, name }) => {
                    if self.is_pending(task) {
                        if let Some(waiters) = self.pending_events.get_mut(&name) {
                            waiters.retain(|t| *t != task);
                        }
                        self.resolve(task, TaskState::Failed(TaskError::Canceled));
                    }
                }
                Some(other) => return Err(kind_mismatch(*timer_id, "TimerFired", &other)),
            },
            EventKind::EventRaised { name, input } => {
                let key = name.to_lowercase();
                let waiter = self.pending_events.get_mut(&key).and_then(|q| q.pop_front());
                match waiter {
                    Some(task) => self.resolve(task, TaskState::Completed(input.clone())),
                    None => self.buffer_event(key, event.clone()),
                }
            }
            // Lifecycle events are interpreted by the executor
            EventKind::ExecutionStarted { .. }
            | EventKind::ExecutionSuspended { .. }
            | EventKind::ExecutionResumed { .. }
            | EventKind::ExecutionTerminated { .. }
            | EventKind::ExecutionCompleted { .. }
            | EventKind::ExecutionFailed { .. }
            | EventKind::ExecutionContinuedAsNew { .. }
            | EventKind::ExecutionStalled { .. } => {}
        }
        Ok(())
    }
}

fn kind_mismatch(seq: u64, event: &str, correlation: &Correlation) -> ReplayError {
    ReplayError::mismatch(format!(
        "{event} for sequence {seq} but the workflow issued a {} there",
        correlation.describe()
    ))
}
