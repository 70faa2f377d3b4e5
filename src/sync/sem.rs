//! Counting semaphore

use crate::critical::{self, CsCell};
use crate::error::{OsError, OsResult};
use crate::port;
use crate::types::{Deadline, OsSemCtr, OsTick, NO_WAIT};

struct SemState {
    count: OsSemCtr,
    max: OsSemCtr,
    waiters: port::WaitList,
}

/// Counting semaphore with a hard upper bound
///
/// `new` is const so semaphores can live in statics:
///
/// ```ignore
/// static READY: Semaphore = Semaphore::new(0, 1);
/// ```
pub struct Semaphore {
    state: CsCell<SemState>,
}

impl Semaphore {
    /// Create a semaphore with `initial` tokens and a ceiling of `max`
    ///
    /// A `max` of zero is rejected by every operation with
    /// [`OsError::InvalidParam`].
    pub const fn new(initial: OsSemCtr, max: OsSemCtr) -> Self {
        Semaphore {
            state: CsCell::new(SemState {
                count: if initial > max { max } else { initial },
                max,
                waiters: port::WaitList::new(),
            }),
        }
    }

    /// Take one token, blocking up to `timeout` ticks
    ///
    /// `NO_WAIT` tries once and fails with [`OsError::Busy`];
    /// `WAIT_FOREVER` blocks indefinitely.
    pub fn take(&self, timeout: OsTick) -> OsResult<()> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }

        let deadline = Deadline::after(port::tick_now(), timeout);
        loop {
            enum Step {
                Done,
                Wait(port::WaitToken),
            }

            let step = critical::with(|cs| {
                let s = self.state.get(cs);
                if s.max == 0 {
                    return Err(OsError::InvalidParam);
                }
                if s.count > 0 {
                    s.count -= 1;
                    return Ok(Step::Done);
                }
                if timeout == NO_WAIT {
                    return Err(OsError::Busy);
                }
                let remaining = deadline.remaining(port::tick_now());
                if remaining == 0 {
                    return Err(OsError::Timeout);
                }
                Ok(Step::Wait(s.waiters.enqueue_current(cs, remaining)))
            })?;

            match step {
                Step::Done => return Ok(()),
                Step::Wait(token) => {
                    // Woken or timed out; either way the predicate decides
                    let _ = port::wait_current(token);
                }
            }
        }
    }

    /// Take without blocking; true when a token was obtained
    pub fn try_take(&self) -> bool {
        self.take(NO_WAIT).is_ok()
    }

    /// Return one token, waking the highest-priority waiter
    ///
    /// The count saturates at the ceiling; surplus gives are absorbed.
    pub fn give(&self) -> OsResult<()> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }
        let woken = self.give_inner()?;
        if woken {
            port::reschedule();
        }
        Ok(())
    }

    /// ISR-safe give; never blocks
    ///
    /// When a waiter was woken this requests a dispatch pass, so on the
    /// preemptive backend the switch is pended before the interrupt
    /// returns to the interrupted task.
    pub fn give_from_isr(&self) -> OsResult<()> {
        if self.give_inner()? {
            port::reschedule();
        }
        Ok(())
    }

    fn give_inner(&self) -> OsResult<bool> {
        critical::with(|cs| {
            let s = self.state.get(cs);
            if s.max == 0 {
                return Err(OsError::InvalidParam);
            }
            if s.count < s.max {
                s.count += 1;
            }
            Ok(s.waiters.wake_one(cs))
        })
    }

    /// Current token count
    pub fn count(&self) -> OsSemCtr {
        critical::with(|cs| self.state.get(cs).count)
    }
}
