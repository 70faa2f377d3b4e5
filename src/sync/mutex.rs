//! Mutual exclusion lock

use crate::critical::{self, CsCell};
use crate::error::{OsError, OsResult};
use crate::port;
use crate::types::{Deadline, OsTick, NO_WAIT};

struct MutexState {
    owner: Option<port::TaskId>,
    waiters: port::WaitList,
}

/// Ownership-tracking mutex
///
/// The lock remembers which task holds it: unlocking from any other task
/// fails, as does re-locking from the holder. Contending tasks are granted
/// the lock highest priority first.
pub struct Mutex {
    state: CsCell<MutexState>,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            state: CsCell::new(MutexState {
                owner: None,
                waiters: port::WaitList::new(),
            }),
        }
    }

    /// Acquire the lock, blocking up to `timeout` ticks
    ///
    /// Re-locking from the current holder fails immediately with
    /// [`OsError::Busy`] instead of deadlocking.
    pub fn lock(&self, timeout: OsTick) -> OsResult<()> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }

        let me = port::current_task_id();
        let deadline = Deadline::after(port::tick_now(), timeout);
        loop {
            enum Step {
                Done,
                Wait(port::WaitToken),
            }

            let step = critical::with(|cs| {
                let s = self.state.get(cs);
                match s.owner {
                    None => {
                        s.owner = Some(me);
                        Ok(Step::Done)
                    }
                    Some(owner) if owner == me => Err(OsError::Busy),
                    Some(_) => {
                        if timeout == NO_WAIT {
                            return Err(OsError::Busy);
                        }
                        // With a single execution context nobody can ever
                        // release the lock while we wait
                        if !port::HAS_TASKS {
                            return Err(OsError::Busy);
                        }
                        let remaining = deadline.remaining(port::tick_now());
                        if remaining == 0 {
                            return Err(OsError::Timeout);
                        }
                        Ok(Step::Wait(s.waiters.enqueue_current(cs, remaining)))
                    }
                }
            })?;

            match step {
                Step::Done => return Ok(()),
                Step::Wait(token) => {
                    let _ = port::wait_current(token);
                }
            }
        }
    }

    /// Acquire without blocking; true when the lock was taken
    pub fn try_lock(&self) -> bool {
        self.lock(NO_WAIT).is_ok()
    }

    /// Release the lock
    ///
    /// Only the holding task may unlock; anything else gets
    /// [`OsError::Error`] and the lock is untouched.
    pub fn unlock(&self) -> OsResult<()> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }

        let me = port::current_task_id();
        let woken = critical::with(|cs| {
            let s = self.state.get(cs);
            if s.owner != Some(me) {
                return Err(OsError::Error);
            }
            s.owner = None;
            Ok(s.waiters.wake_one(cs))
        })?;

        if woken {
            port::reschedule();
        }
        Ok(())
    }

    /// Whether some task currently holds the lock
    pub fn is_locked(&self) -> bool {
        critical::with(|cs| self.state.get(cs).owner.is_some())
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
