//! Completion tokens for asynchronously issued device commands.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::errors::{PipelineError, PipelineResult};

/// Lifecycle of one enqueued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    /// Waiting for dependencies or for a free compute unit.
    Queued,
    Running,
    Complete,
    /// The command itself reported an error.
    Failed(String),
    /// The command never ran because one of its dependencies did not complete.
    Skipped(String),
}

impl EventStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, EventStatus::Queued | EventStatus::Running)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EventStatus::Failed(_) | EventStatus::Skipped(_))
    }
}

/// Timing information recorded for a completed command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventProfile {
    /// Time between enqueue and the start of execution.
    pub queued: Duration,
    /// Time spent executing on the device.
    pub execution: Duration,
}

struct EventState {
    status: EventStatus,
    queued_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

struct EventInner {
    id: u64,
    queue_id: u64,
    label: String,
    state: Mutex<EventState>,
    resolved: Condvar,
}

/// Handle to the in-flight state of one enqueued command.
///
/// Cloning is cheap and every clone observes the same command. Dropping all
/// clones has no effect on the command itself, which still runs to completion.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn new(id: u64, queue_id: u64, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                id,
                queue_id,
                label: label.into(),
                state: Mutex::new(EventState {
                    status: EventStatus::Queued,
                    queued_at: Instant::now(),
                    started_at: None,
                    finished_at: None,
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Identity of the queue that issued this token.
    pub(crate) fn queue_id(&self) -> u64 {
        self.inner.queue_id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn status(&self) -> EventStatus {
        self.lock_state().status.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.lock_state().status.is_resolved()
    }

    /// Blocks until the command has resolved, reporting its failure if any.
    pub fn wait(&self) -> PipelineResult<()> {
        let mut state = self.lock_state();
        while !state.status.is_resolved() {
            state = self
                .inner
                .resolved
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &state.status {
            EventStatus::Failed(reason) => Err(PipelineError::CommandFailed {
                label: self.inner.label.clone(),
                reason: reason.clone(),
            }),
            EventStatus::Skipped(reason) => Err(PipelineError::DependencyFailed {
                label: self.inner.label.clone(),
                reason: reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Queue and execution time, available once the command completed.
    pub fn profile(&self) -> Option<EventProfile> {
        let state = self.lock_state();
        if state.status != EventStatus::Complete {
            return None;
        }
        let started = state.started_at?;
        let finished = state.finished_at?;
        Some(EventProfile {
            queued: started.duration_since(state.queued_at),
            execution: finished.duration_since(started),
        })
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.lock_state();
        state.status = EventStatus::Running;
        state.started_at = Some(Instant::now());
    }

    pub(crate) fn mark_complete(&self) {
        self.resolve(EventStatus::Complete);
    }

    pub(crate) fn mark_failed(&self, reason: String) {
        self.resolve(EventStatus::Failed(reason));
    }

    pub(crate) fn mark_skipped(&self, reason: String) {
        self.resolve(EventStatus::Skipped(reason));
    }

    /// Human-readable failure cause for dependents, `None` unless this event errored.
    pub(crate) fn failure_reason(&self) -> Option<String> {
        match &self.lock_state().status {
            EventStatus::Failed(reason) => Some(format!("'{}' failed: {reason}", self.label())),
            EventStatus::Skipped(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    fn resolve(&self, status: EventStatus) {
        let mut state = self.lock_state();
        state.status = status;
        state.finished_at = Some(Instant::now());
        drop(state);
        self.inner.resolved.notify_all();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EventState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .finish()
    }
}

/// Builds the dependency list for one command, dropping duplicate tokens.
pub(crate) fn dependency_list<'a>(events: impl IntoIterator<Item = &'a Event>) -> Vec<Event> {
    let mut deps: Vec<Event> = Vec::new();
    for event in events {
        if !deps.iter().any(|known| Arc::ptr_eq(&known.inner, &event.inner)) {
            deps.push(event.clone());
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_event_is_queued() {
        let event = Event::new(1, 0, "marker");
        assert_eq!(event.status(), EventStatus::Queued);
        assert!(!event.is_resolved());
        assert!(event.profile().is_none());
    }

    #[test]
    fn test_wait_returns_after_completion_on_another_thread() {
        let event = Event::new(7, 0, "marker");
        let worker = event.clone();
        let handle = thread::spawn(move || {
            worker.mark_running();
            thread::sleep(Duration::from_millis(10));
            worker.mark_complete();
        });
        event.wait().expect("event should complete");
        handle.join().expect("worker thread panicked");

        let profile = event.profile().expect("completed event has a profile");
        assert!(profile.execution >= Duration::from_millis(10));
    }

    #[test]
    fn test_failed_event_reports_command_failure() {
        let event = Event::new(3, 0, "matmul_kernel");
        event.mark_failed("boom".to_string());
        match event.wait() {
            Err(PipelineError::CommandFailed { label, reason }) => {
                assert_eq!(label, "matmul_kernel");
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(event.failure_reason().is_some());
    }

    #[test]
    fn test_skipped_event_reports_dependency_failure() {
        let event = Event::new(4, 0, "bias_relu6_kernel");
        event.mark_skipped("upstream".to_string());
        assert!(matches!(
            event.wait(),
            Err(PipelineError::DependencyFailed { .. })
        ));
    }

    #[test]
    fn test_dependency_list_deduplicates() {
        let a = Event::new(1, 0, "a");
        let b = Event::new(2, 0, "b");
        let deps = dependency_list([&a, &b, &a.clone()]);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].id(), 1);
        assert_eq!(deps[1].id(), 2);
    }
}
