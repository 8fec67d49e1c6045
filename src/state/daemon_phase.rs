use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Phases of the polling daemon loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPhase {
    /// Blocked on the wake hub, the poll timer, or shutdown.
    Idle,
    /// Running the due-query and dispatching the batch.
    Polling,
    /// Shutdown requested; the in-flight batch is finishing.
    Draining,
    /// Loop exited. Terminal.
    Stopped,
}

/// What pulled the daemon out of [`DaemonPhase::Idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WakeSource {
    /// First cycle after the process started.
    Startup,
    /// A near-term hint arrived on the wake hub.
    Hint,
    /// The poll interval elapsed, or a full batch asked for a follow-up cycle.
    Timer,
}

/// Events fed to [`DaemonStateMachine::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonEvent {
    /// Start a cycle.
    Wake(WakeSource),
    /// The current cycle is done.
    PollFinished,
    /// Stop accepting wakes.
    Shutdown,
    /// Nothing is in flight anymore.
    Drained,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the daemon was in when the invalid event was received.
    pub from: DaemonPhase,
    /// The event that cannot be applied from this phase.
    pub event: DaemonEvent,
}

/// Validated phase tracker owned by the daemon task.
#[derive(Debug, Clone)]
pub struct DaemonStateMachine {
    phase: DaemonPhase,
    cycles: u64,
    last_wake: Option<WakeSource>,
}

impl Default for DaemonStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonStateMachine {
    /// Machine starting in `Idle`.
    pub fn new() -> Self {
        Self {
            phase: DaemonPhase::Idle,
            cycles: 0,
            last_wake: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> DaemonPhase {
        self.phase
    }

    /// Number of cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// What woke the last cycle.
    pub fn last_wake(&self) -> Option<WakeSource> {
        self.last_wake
    }

    /// Move to the next phase, returning it.
    pub fn apply(&mut self, event: DaemonEvent) -> Result<DaemonPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            (DaemonPhase::Idle, DaemonEvent::Wake(source)) => {
                self.cycles += 1;
                self.last_wake = Some(source);
                DaemonPhase::Polling
            }
            (DaemonPhase::Polling, DaemonEvent::PollFinished) => DaemonPhase::Idle,
            (DaemonPhase::Idle | DaemonPhase::Polling, DaemonEvent::Shutdown) => {
                DaemonPhase::Draining
            }
            (DaemonPhase::Draining, DaemonEvent::PollFinished) => DaemonPhase::Draining,
            (DaemonPhase::Draining, DaemonEvent::Drained) => DaemonPhase::Stopped,
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        self.phase = next;
        Ok(next)
    }
}
