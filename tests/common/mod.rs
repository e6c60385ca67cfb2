#![allow(dead_code)]

use durotask::client::Client;
use durotask::providers::TaskHub;
use durotask::providers::in_memory::InMemoryTaskHub;
use durotask::runtime::{ObservabilityConfig, OrchestrationExecutor, Registry, Runtime, RuntimeOptions};
use durotask::{Action, Event, EventKind, FailureDetails, OrchestrationVersion, RuntimeStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Runtime harness
// ============================================================================

pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(1),
        observability: ObservabilityConfig {
            init_logging: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct Harness {
    pub hub: Arc<InMemoryTaskHub>,
    pub rt: Arc<Runtime>,
    pub client: Client,
}

impl Harness {
    pub async fn start(registry: Registry) -> Self {
        Self::start_on(Arc::new(InMemoryTaskHub::new()), registry).await
    }

    /// Start a runtime against an existing hub (e.g. after a redeploy).
    pub async fn start_on(hub: Arc<InMemoryTaskHub>, registry: Registry) -> Self {
        let rt = Runtime::start_with_options(hub.clone(), registry, fast_options()).await;
        let client = Client::new(hub.clone());
        Self { hub, rt, client }
    }

    pub async fn shutdown(self) {
        self.rt.shutdown(Some(Duration::from_millis(200))).await;
    }

    pub async fn history(&self, instance: &str) -> Vec<Event> {
        self.hub.get_history(instance, None).await.unwrap_or_default()
    }
}

pub async fn wait_for_history<F>(hub: &Arc<InMemoryTaskHub>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = hub.get_history(instance, None).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(client: &Client, instance: &str, status: RuntimeStatus, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(md) = client.fetch_metadata(instance, Default::default()).await
            && md.runtime_status == status
        {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Hand-built histories for executor-level tests
// ============================================================================

pub const INSTANCE: &str = "inst-1";

pub fn executor(registry: Registry) -> OrchestrationExecutor {
    OrchestrationExecutor::new(registry)
}

pub fn turn_started(ts: u64) -> Event {
    Event::new(ts, EventKind::OrchestratorStarted { version: None })
}

pub fn turn_started_with(ts: u64, version: Option<&str>, patches: &[&str]) -> Event {
    Event::new(
        ts,
        EventKind::OrchestratorStarted {
            version: Some(OrchestrationVersion {
                name: version.map(str::to_string),
                patches: patches.iter().map(|p| p.to_string()).collect(),
            }),
        },
    )
}

pub fn started(ts: u64, name: &str, input: &str) -> Event {
    Event::new(
        ts,
        EventKind::ExecutionStarted {
            name: name.to_string(),
            version: None,
            input: input.to_string(),
            parent: None,
            scheduled_start_ms: None,
            trace_context: None,
        },
    )
}

pub fn scheduled(ts: u64, id: u64, name: &str, input: &str) -> Event {
    Event::new(
        ts,
        EventKind::TaskScheduled {
            task_id: id,
            name: name.to_string(),
            input: input.to_string(),
            trace_context: None,
        },
    )
}

pub fn completed(ts: u64, id: u64, result: &str) -> Event {
    Event::new(
        ts,
        EventKind::TaskCompleted {
            task_scheduled_id: id,
            result: result.to_string(),
        },
    )
}

pub fn task_failed(ts: u64, id: u64, message: &str) -> Event {
    Event::new(
        ts,
        EventKind::TaskFailed {
            task_scheduled_id: id,
            details: FailureDetails::new("ActivityError", message),
        },
    )
}

pub fn timer_fired(ts: u64, id: u64, fire_at_ms: u64) -> Event {
    Event::new(
        ts,
        EventKind::TimerFired {
            timer_id: id,
            fire_at_ms,
        },
    )
}

pub fn raised(ts: u64, name: &str, input: &str) -> Event {
    Event::new(
        ts,
        EventKind::EventRaised {
            name: name.to_string(),
            input: input.to_string(),
        },
    )
}

/// Append a turn to `history` the way a task hub would: the new events
/// (with the turn's version stamped on its `OrchestratorStarted`) followed by
/// one scheduling event per scheduling action.
pub fn commit(history: &mut Vec<Event>, mut new_events: Vec<Event>, response: &durotask::providers::OrchestratorResponse) {
    let ts = new_events.first().map_or(0, |e| e.timestamp_ms);
    if (response.version.name.is_some() || !response.version.patches.is_empty())
        && let Some(Event {
            kind: EventKind::OrchestratorStarted { version },
            ..
        }) = new_events.first_mut()
    {
        *version = Some(response.version.clone());
    }
    history.extend(new_events);
    for action in &response.actions {
        let kind = match action.clone() {
            Action::ScheduleTask {
                id,
                name,
                input,
                trace_context,
            } => EventKind::TaskScheduled {
                task_id: id,
                name,
                input,
                trace_context,
            },
            Action::CreateTimer { id, fire_at_ms, name } => EventKind::TimerCreated {
                timer_id: id,
                fire_at_ms,
                name,
            },
            Action::CreateSubOrchestration {
                id,
                name,
                instance_id,
                input,
                version,
                ..
            } => EventKind::SubOrchestrationCreated {
                task_id: id,
                name,
                instance_id,
                input,
                version,
            },
            Action::CompleteOrchestration { .. } | Action::StallOrchestration { .. } => continue,
        };
        history.push(Event::new(ts, kind));
    }
}
