use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use futures_util::future::AbortHandle;

/// Lifecycle state of one in-flight task.
///
/// Transition table:
///
/// - `Running` → `Processing` | `Canceled` (transitioning to `Running` is a
///   successful no-op check)
/// - `Processing` → `Canceled` | `Completed` | `Running` (the last one only
///   when a failed attempt is being retried)
/// - `Canceled`, `Completed`: terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Running = 0,
    Processing = 1,
    Canceled = 2,
    Completed = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Processing,
            2 => Self::Canceled,
            _ => Self::Completed,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Completed)
    }
}

/// Outcome of a [`TaskStateBox::transition`] attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// True if the box is now in the requested state, whether or not a
    /// transition actually happened.
    pub reached: bool,
    /// The state the box was in before.
    pub from: TaskState,
}

fn transition_allowed(from: TaskState, to: TaskState) -> bool {
    match from {
        TaskState::Running => matches!(to, TaskState::Processing | TaskState::Canceled),
        TaskState::Processing => true,
        TaskState::Canceled | TaskState::Completed => false,
    }
}

/// Atomic state box coordinating the lifecycle of one in-flight task.
///
/// Safe under concurrent access from the transport completion context, the
/// user-facing cancel context, and the retry path. State changes use a
/// compare-and-swap loop; the abort handle for the current transport
/// operation is kept alongside so `cancel` can tear down in-flight I/O
/// exactly when the transition to `Canceled` actually happened.
#[derive(Debug)]
pub struct TaskStateBox {
    state: AtomicU8,
    transport_handle: Mutex<AbortHandle>,
    tracking_network_activity: AtomicBool,
}

impl TaskStateBox {
    /// Creates a box in the `Running` state owning the abort handle for the
    /// first transport attempt.
    pub fn new(transport_handle: AbortHandle) -> Self {
        Self {
            state: AtomicU8::new(TaskState::Running as u8),
            transport_handle: Mutex::new(transport_handle),
            tracking_network_activity: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transitions to `to` if the table allows it. Same-state transitions
    /// are successful no-ops (including canceling an already-canceled task).
    pub fn transition(&self, to: TaskState) -> Transition {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = TaskState::from_u8(current);
            if from == to {
                return Transition { reached: true, from };
            }
            if !transition_allowed(from, to) {
                return Transition {
                    reached: false,
                    from,
                };
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Transition { reached: true, from },
                Err(actual) => current = actual,
            }
        }
    }

    /// Retry reset: swaps `Processing` back to `Running` and installs the
    /// abort handle for the next transport attempt. Returns false if a
    /// concurrent cancellation won the race (or the box was not in
    /// `Processing`), in which case the new handle is discarded.
    pub fn reset_to_running(&self, transport_handle: AbortHandle) -> bool {
        let mut guard = lock_unpoisoned(&self.transport_handle);
        let transition = self.transition(TaskState::Running);
        if transition.reached && transition.from == TaskState::Processing {
            *guard = transport_handle;
            true
        } else {
            false
        }
    }

    /// Cancels the task. Aborts the in-flight transport operation only if
    /// the transition to `Canceled` actually happened; canceling an already
    /// canceled task is a successful no-op. Returns true if the task is now
    /// canceled.
    pub fn cancel(&self) -> bool {
        let transition = self.transition(TaskState::Canceled);
        if transition.reached && transition.from != TaskState::Canceled {
            lock_unpoisoned(&self.transport_handle).abort();
        }
        transition.reached
    }

    /// Sets the network-activity tracking flag, returning the previous
    /// value. The dispatcher uses this to keep the shared activity counter
    /// balanced across retries.
    pub(crate) fn set_tracking_network_activity(&self) -> bool {
        self.tracking_network_activity.swap(true, Ordering::AcqRel)
    }

    /// Clears the network-activity tracking flag, returning the previous
    /// value.
    pub(crate) fn clear_tracking_network_activity(&self) -> bool {
        self.tracking_network_activity.swap(false, Ordering::AcqRel)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
