//! Cooperative bare-metal backend
//!
//! One execution context and no context switching: the single registered
//! task runs to completion inside `os_start`, and blocking operations
//! spin on the tick counter. The application's periodic interrupt calls
//! `os_tick`, which advances time and runs due timer callbacks in that
//! caller's context. Anything that would require a second task to make
//! progress fails fast with `Busy` instead of deadlocking.

use core::ptr::NonNull;

use portable_atomic::{AtomicBool, Ordering};

use crate::config::{CFG_PRIO_MAX, CFG_STK_SIZE_MIN};
use crate::critical::{self, CriticalSection, CsCell};
use crate::error::{OsError, OsResult};
use crate::task::TaskFn;
use crate::types::{Deadline, OsPrio, OsTick, TaskState, WaitOutcome};

pub(crate) const HAS_TASKS: bool = false;

pub(crate) type TaskId = usize;

#[inline]
pub(crate) fn current_task_id() -> TaskId {
    0
}

// ============ Tick source ============

static TICK: portable_atomic::AtomicU32 = portable_atomic::AtomicU32::new(0);

/// Ticks elapsed since the first `os_tick`
pub fn tick_now() -> OsTick {
    TICK.load(Ordering::Relaxed)
}

pub(crate) fn init() -> OsResult<()> {
    Ok(())
}

/// Advance time and fire due timers; call this from the periodic
/// interrupt or the main loop
pub(crate) fn tick() {
    let now = TICK.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    crate::timer::service(now);
}

pub(crate) fn reschedule() {}

pub(crate) fn yield_now() {}

// ============ Task control ============

pub(crate) struct TaskCtl {
    name: &'static str,
    prio: OsPrio,
    state: TaskState,
    entry: Option<TaskFn>,
    arg: *mut (),
}

static TASK: CsCell<TaskCtl> = CsCell::new(TaskCtl {
    name: "",
    prio: 0,
    state: TaskState::Ready,
    entry: None,
    arg: core::ptr::null_mut(),
});

static REGISTERED: AtomicBool = AtomicBool::new(false);

pub(crate) fn current_task_prio() -> OsPrio {
    critical::with(|cs| TASK.get(cs).prio)
}

/// Register the single main task; a second registration fails
pub(crate) fn task_create(
    name: &'static str,
    entry: TaskFn,
    arg: *mut (),
    prio: OsPrio,
    stack_words: usize,
) -> OsResult<NonNull<TaskCtl>> {
    if prio as usize >= CFG_PRIO_MAX || stack_words < CFG_STK_SIZE_MIN {
        return Err(OsError::InvalidParam);
    }
    if REGISTERED.swap(true, Ordering::AcqRel) {
        return Err(OsError::Error);
    }

    critical::with(|cs| {
        let t = TASK.get(cs);
        t.name = name;
        t.prio = prio;
        t.state = TaskState::Ready;
        t.entry = Some(entry);
        t.arg = arg;
    });

    // Static storage; the pointer is always valid
    Ok(unsafe { NonNull::new_unchecked(TASK.as_ptr()) })
}

pub(crate) unsafe fn task_release(_ctl: NonNull<TaskCtl>) {}

pub(crate) unsafe fn task_delete(_ctl: Option<NonNull<TaskCtl>>) -> OsResult<()> {
    Err(OsError::Error)
}

pub(crate) unsafe fn task_suspend(_ctl: NonNull<TaskCtl>) -> OsResult<()> {
    Err(OsError::Error)
}

pub(crate) unsafe fn task_resume(_ctl: NonNull<TaskCtl>) -> OsResult<()> {
    Err(OsError::Error)
}

pub(crate) unsafe fn task_set_prio(ctl: NonNull<TaskCtl>, prio: OsPrio) -> OsResult<()> {
    if prio as usize >= CFG_PRIO_MAX {
        return Err(OsError::InvalidParam);
    }
    critical::with(|_cs| unsafe { (*ctl.as_ptr()).prio = prio });
    Ok(())
}

pub(crate) unsafe fn task_prio(ctl: NonNull<TaskCtl>) -> OsPrio {
    critical::with(|_cs| unsafe { ctl.as_ref().prio })
}

pub(crate) unsafe fn task_state(ctl: NonNull<TaskCtl>) -> TaskState {
    critical::with(|_cs| unsafe { ctl.as_ref().state })
}

pub(crate) unsafe fn task_name(ctl: NonNull<TaskCtl>) -> &'static str {
    critical::with(|_cs| unsafe { ctl.as_ref().name })
}

/// Busy-wait until `ticks` have elapsed
pub(crate) fn task_delay(ticks: OsTick) -> OsResult<()> {
    let deadline = Deadline::after(tick_now(), ticks);
    while deadline.remaining(tick_now()) > 0 {
        core::hint::spin_loop();
    }
    Ok(())
}

/// Run the registered task to completion
pub(crate) fn start() -> OsResult<()> {
    let (entry, arg) = critical::with(|cs| {
        let t = TASK.get(cs);
        t.state = TaskState::Running;
        (t.entry, t.arg)
    });

    let Some(entry) = entry else {
        return Err(OsError::Error);
    };

    entry(arg);

    critical::with(|cs| TASK.get(cs).state = TaskState::Deleted);
    Ok(())
}

// ============ Wait handling ============

/// Single-context wait bookkeeping: at most one waiter exists, so the
/// list degenerates to a signaled flag set by ISR-side wakes
pub(crate) struct WaitList {
    waiting: bool,
    signaled: bool,
}

pub(crate) struct WaitToken {
    deadline: Deadline,
    list: *mut WaitList,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        WaitList {
            waiting: false,
            signaled: false,
        }
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.waiting
    }

    pub(crate) fn enqueue_current(&mut self, _cs: &CriticalSection, timeout: OsTick) -> WaitToken {
        self.waiting = true;
        self.signaled = false;
        WaitToken {
            deadline: Deadline::after(tick_now(), timeout),
            list: self as *mut WaitList,
        }
    }

    pub(crate) fn wake_one(&mut self, _cs: &CriticalSection) -> bool {
        if self.waiting && !self.signaled {
            self.signaled = true;
            true
        } else {
            false
        }
    }
}

/// Spin until signaled or the deadline passes; ticks keep advancing from
/// the interrupt side
pub(crate) fn wait_current(token: WaitToken) -> WaitOutcome {
    loop {
        let outcome = critical::with(|_cs| {
            let list = unsafe { &mut *token.list };
            if list.signaled {
                list.signaled = false;
                list.waiting = false;
                return Some(WaitOutcome::Woken);
            }
            if token.deadline.remaining(tick_now()) == 0 {
                list.waiting = false;
                return Some(WaitOutcome::Timeout);
            }
            None
        });
        if let Some(outcome) = outcome {
            return outcome;
        }
        core::hint::spin_loop();
    }
}
