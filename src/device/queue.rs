//! Out-of-order command queue with explicit dependency tokens.
//!
//! Commands are admitted to the ready list only when every token they were
//! given has resolved; the compute units then take ready commands in any
//! order. There is no implicit FIFO ordering between independent commands.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::device::event::Event;
use crate::errors::{PipelineError, PipelineResult};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Device-side work item. The error string becomes the token's failure reason.
pub(crate) type Work = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

struct Command {
    event: Event,
    deps: Vec<Event>,
    work: Work,
}

#[derive(Default)]
struct QueueState {
    waiting: Vec<Command>,
    ready: VecDeque<Command>,
    outstanding: usize,
    first_failure: Option<PipelineError>,
    shutdown: bool,
}

enum Readiness {
    Ready,
    Blocked,
    Broken(String),
}

impl QueueState {
    fn readiness(deps: &[Event]) -> Readiness {
        let mut blocked = false;
        for dep in deps {
            if let Some(reason) = dep.failure_reason() {
                return Readiness::Broken(reason);
            }
            if !dep.is_resolved() {
                blocked = true;
            }
        }
        if blocked {
            Readiness::Blocked
        } else {
            Readiness::Ready
        }
    }

    fn admit(&mut self, command: Command) {
        match Self::readiness(&command.deps) {
            Readiness::Ready => self.ready.push_back(command),
            Readiness::Blocked => self.waiting.push(command),
            Readiness::Broken(reason) => self.skip(command, reason),
        }
    }

    fn skip(&mut self, command: Command, reason: String) {
        warn!(
            "Skipping '{}' (event {}): {}",
            command.event.label(),
            command.event.id(),
            reason
        );
        command.event.mark_skipped(reason.clone());
        self.outstanding -= 1;
        self.record_failure(PipelineError::DependencyFailed {
            label: command.event.label().to_string(),
            reason,
        });
    }

    fn record_failure(&mut self, error: PipelineError) {
        if self.first_failure.is_none() {
            self.first_failure = Some(error);
        }
    }

    /// Re-examines waiting commands after a token resolved. Skipping a command
    /// resolves its token too, so this repeats until nothing changes.
    fn promote(&mut self) {
        loop {
            let mut changed = false;
            let waiting = std::mem::take(&mut self.waiting);
            for command in waiting {
                match Self::readiness(&command.deps) {
                    Readiness::Ready => {
                        self.ready.push_back(command);
                        changed = true;
                    }
                    Readiness::Blocked => self.waiting.push(command),
                    Readiness::Broken(reason) => {
                        self.skip(command, reason);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }
}

struct QueueShared {
    state: Mutex<QueueState>,
    work_available: Condvar,
    idle: Condvar,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Asynchronous out-of-order queue served by a fixed pool of compute units.
pub struct CommandQueue {
    id: u64,
    shared: Arc<QueueShared>,
    workers: Vec<JoinHandle<()>>,
    next_event_id: AtomicU64,
}

impl CommandQueue {
    pub fn new(compute_units: usize) -> PipelineResult<Self> {
        if compute_units == 0 {
            return Err(PipelineError::Config {
                message: "a command queue needs at least one compute unit".to_string(),
            });
        }

        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            work_available: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(compute_units);
        for unit in 0..compute_units {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("compute-unit-{unit}"))
                .spawn(move || run_compute_unit(&shared))?;
            workers.push(handle);
        }

        Ok(Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            shared,
            workers,
            next_event_id: AtomicU64::new(1),
        })
    }

    pub fn compute_units(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues `work` to run once every token in `deps` has completed.
    ///
    /// Returns immediately. If any dependency fails, `work` is dropped without
    /// running and the returned token resolves as skipped. Tokens issued by
    /// another queue are rejected: this queue is never told when they resolve.
    pub(crate) fn enqueue(
        &self,
        label: &str,
        deps: Vec<Event>,
        work: Work,
    ) -> PipelineResult<Event> {
        if let Some(foreign) = deps.iter().find(|dep| dep.queue_id() != self.id) {
            return Err(PipelineError::ForeignEvent {
                label: label.to_string(),
                event: foreign.label().to_string(),
            });
        }

        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let event = Event::new(id, self.id, label);
        debug!(
            "Enqueue '{}' as event {} with {} dependencies",
            label,
            id,
            deps.len()
        );

        let mut state = self.shared.lock();
        state.outstanding += 1;
        state.admit(Command {
            event: event.clone(),
            deps,
            work,
        });
        let has_ready = !state.ready.is_empty();
        let is_idle = state.outstanding == 0;
        drop(state);

        if has_ready {
            self.shared.work_available.notify_one();
        }
        if is_idle {
            self.shared.idle.notify_all();
        }
        Ok(event)
    }

    /// Blocks until every command enqueued so far has resolved.
    ///
    /// Reports the first failure observed since the previous drain.
    pub fn drain(&self) -> PipelineResult<()> {
        let mut state = self.shared.lock();
        while state.outstanding > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match state.first_failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
        }
        self.shared.work_available.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Compute unit thread panicked during shutdown");
            }
        }
    }
}

fn run_compute_unit(shared: &QueueShared) {
    loop {
        let command = {
            let mut state = shared.lock();
            loop {
                if let Some(command) = state.ready.pop_front() {
                    break command;
                }
                if state.shutdown && state.outstanding == 0 {
                    return;
                }
                state = shared
                    .work_available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let Command { event, work, .. } = command;
        event.mark_running();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(result) => result,
            Err(_) => Err("command panicked".to_string()),
        };

        // Resolve under the queue lock so the failure is recorded before any
        // dependent can observe it.
        let mut state = shared.lock();
        match outcome {
            Ok(()) => {
                debug!("Event {} ('{}') complete", event.id(), event.label());
                event.mark_complete();
            }
            Err(reason) => {
                warn!(
                    "Event {} ('{}') failed: {}",
                    event.id(),
                    event.label(),
                    reason
                );
                event.mark_failed(reason.clone());
                state.record_failure(PipelineError::CommandFailed {
                    label: event.label().to_string(),
                    reason,
                });
            }
        }
        state.outstanding -= 1;
        state.promote();
        let has_ready = !state.ready.is_empty();
        let is_idle = state.outstanding == 0;
        let shutting_down = state.shutdown;
        drop(state);

        if has_ready {
            shared.work_available.notify_all();
        }
        if is_idle {
            shared.idle.notify_all();
            if shutting_down {
                shared.work_available.notify_all();
            }
        }
    }
}
