//! Core type definitions
//!
//! Strong typing for ticks, priorities and the timeout convention shared by
//! every blocking operation.

/// Task priority (0 = highest priority)
pub type OsPrio = u8;

/// Tick counter / relative duration type
pub type OsTick = u32;

/// Semaphore counter type
pub type OsSemCtr = u32;

/// Timeout value meaning "try once, never block"
pub const NO_WAIT: OsTick = 0;

/// Timeout sentinel meaning "wait forever"
pub const WAIT_FOREVER: OsTick = OsTick::MAX;

/// Observable task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TaskState {
    /// Ready to run
    Ready = 0,
    /// Currently executing
    Running,
    /// Sleeping in a delay
    Delayed,
    /// Blocked on a mutex, semaphore or queue
    Pended,
    /// Suspended by `suspend`
    Suspended,
    /// Deleted; the control block is about to be released
    Deleted,
}

/// Why a blocked task resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Woken by a post/give/send; the caller re-checks its predicate
    Woken,
    /// The deadline elapsed first
    Timeout,
}

/// Absolute deadline derived from a relative timeout
///
/// Tracks the remaining budget across wake/re-check iterations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: OsTick,
    timeout: OsTick,
}

impl Deadline {
    pub(crate) fn after(now: OsTick, timeout: OsTick) -> Self {
        Deadline { start: now, timeout }
    }

    /// Ticks left before expiry; `WAIT_FOREVER` never shrinks
    pub(crate) fn remaining(&self, now: OsTick) -> OsTick {
        if self.timeout == WAIT_FOREVER {
            return WAIT_FOREVER;
        }
        self.timeout.saturating_sub(now.wrapping_sub(self.start))
    }
}
