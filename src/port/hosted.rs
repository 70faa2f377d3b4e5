//! Host-thread backend
//!
//! Every task is a real OS thread; blocking is implemented with the thread
//! parker. Used for off-target development and testing: semantics match the
//! embedded backends at every suspension point, which is where suspend,
//! resume and delete take effect (a host thread cannot be stopped at an
//! arbitrary instruction).

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use portable_atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::config::{CFG_PRIO_DEFAULT, CFG_PRIO_MAX, CFG_STK_SIZE_MIN, CFG_TICK_RATE_HZ};
use crate::critical::{self, CriticalSection};
use crate::error::{OsError, OsResult};
use crate::mem;
use crate::task::TaskFn;
use crate::types::{OsPrio, OsTick, TaskState, WaitOutcome, WAIT_FOREVER};

pub(crate) const HAS_TASKS: bool = true;

/// Identity used for mutex ownership checks
pub(crate) type TaskId = thread::ThreadId;

#[inline]
pub(crate) fn current_task_id() -> TaskId {
    thread::current().id()
}

// ============ Tick source ============

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Ticks elapsed since `os_init`
pub fn tick_now() -> OsTick {
    let epoch = EPOCH.get_or_init(Instant::now);
    (epoch.elapsed().as_millis() as u64 * CFG_TICK_RATE_HZ as u64 / 1000) as OsTick
}

fn ticks_to_duration(ticks: OsTick) -> Duration {
    Duration::from_millis(ticks as u64 * 1000 / CFG_TICK_RATE_HZ as u64)
}

pub(crate) fn init() -> OsResult<()> {
    EPOCH.get_or_init(Instant::now);

    // Timer dispatch context: one service thread polling at tick granularity
    thread::Builder::new()
        .name("osal-timer".into())
        .spawn(|| loop {
            thread::sleep(ticks_to_duration(1));
            crate::timer::service(tick_now());
        })
        .map_err(|_| OsError::Error)?;

    Ok(())
}

pub(crate) fn start() -> OsResult<()> {
    // Host threads schedule themselves; nothing to hand control to
    Ok(())
}

pub(crate) fn tick() {}

pub(crate) fn reschedule() {}

pub(crate) fn yield_now() {
    checkpoint();
    thread::yield_now();
}

// ============ Task control ============

pub(crate) struct TaskCtl {
    name: &'static str,
    prio: AtomicU8,
    state: AtomicU8,
    suspend_ctr: AtomicU8,
    deleted: AtomicBool,
    /// Handle + running thread each hold one reference
    refs: AtomicUsize,
    thread: OnceLock<Thread>,
}

std::thread_local! {
    static CURRENT: Cell<*mut TaskCtl> = const { Cell::new(std::ptr::null_mut()) };
}

/// Panic payload used to unwind a deleted task off its stack
struct TaskExit;

impl TaskCtl {
    fn store_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn load_state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Delayed,
            3 => TaskState::Pended,
            4 => TaskState::Suspended,
            _ => TaskState::Deleted,
        }
    }
}

#[inline]
fn current_ctl() -> *mut TaskCtl {
    CURRENT.with(|c| c.get())
}

pub(crate) fn current_task_prio() -> OsPrio {
    let ctl = current_ctl();
    if ctl.is_null() {
        CFG_PRIO_DEFAULT
    } else {
        unsafe { (*ctl).prio.load(Ordering::Relaxed) }
    }
}

/// Honor pending suspend/delete requests
///
/// Called at every suspension point. Deletion unwinds the task off its
/// stack via a dedicated panic payload caught in the entry trampoline.
fn checkpoint() {
    let ctl = current_ctl();
    if ctl.is_null() {
        return;
    }
    let ctl = unsafe { &*ctl };

    loop {
        if ctl.deleted.load(Ordering::Acquire) {
            std::panic::panic_any(TaskExit);
        }
        if ctl.suspend_ctr.load(Ordering::Acquire) == 0 {
            break;
        }
        ctl.store_state(TaskState::Suspended);
        thread::park();
    }
    ctl.store_state(TaskState::Running);
}

pub(crate) fn task_create(
    name: &'static str,
    entry: TaskFn,
    arg: *mut (),
    prio: OsPrio,
    stack_words: usize,
) -> OsResult<NonNull<TaskCtl>> {
    if prio as usize >= CFG_PRIO_MAX {
        return Err(OsError::InvalidParam);
    }
    if stack_words < CFG_STK_SIZE_MIN {
        return Err(OsError::InvalidParam);
    }

    let raw = mem::alloc(core::mem::size_of::<TaskCtl>()) as *mut TaskCtl;
    let Some(ctl) = NonNull::new(raw) else {
        return Err(OsError::NoMemory);
    };
    unsafe {
        ctl.as_ptr().write(TaskCtl {
            name,
            prio: AtomicU8::new(prio),
            state: AtomicU8::new(TaskState::Ready as u8),
            suspend_ctr: AtomicU8::new(0),
            deleted: AtomicBool::new(false),
            refs: AtomicUsize::new(2),
            thread: OnceLock::new(),
        });
    }

    let ctl_addr = ctl.as_ptr() as usize;
    let arg_addr = arg as usize;
    let spawned = thread::Builder::new()
        .name(name.into())
        // Words are 32-bit on every embedded target this mirrors; keep a
        // floor the host is comfortable with
        .stack_size((stack_words * 4).max(64 * 1024))
        .spawn(move || {
            let ctl = ctl_addr as *mut TaskCtl;
            CURRENT.with(|c| c.set(ctl));
            unsafe { (*ctl).store_state(TaskState::Running) };

            let result = catch_unwind(AssertUnwindSafe(|| entry(arg_addr as *mut ())));
            if let Err(payload) = result {
                if payload.downcast_ref::<TaskExit>().is_none() {
                    crate::error!("task panicked");
                }
            }

            unsafe {
                (*ctl).store_state(TaskState::Deleted);
                task_release(NonNull::new_unchecked(ctl));
            }
        });

    match spawned {
        Ok(handle) => {
            let _ = unsafe { ctl.as_ref() }.thread.set(handle.thread().clone());
            Ok(ctl)
        }
        Err(_) => {
            unsafe { task_release(ctl) };
            unsafe { task_release(ctl) };
            Err(OsError::NoMemory)
        }
    }
}

/// Drop one reference; the control block is freed when the last goes
pub(crate) unsafe fn task_release(ctl: NonNull<TaskCtl>) {
    if unsafe { ctl.as_ref() }.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        unsafe {
            core::ptr::drop_in_place(ctl.as_ptr());
            mem::free(ctl.as_ptr() as *mut u8);
        }
    }
}

pub(crate) unsafe fn task_delete(ctl: Option<NonNull<TaskCtl>>) -> OsResult<()> {
    match ctl {
        None => {
            let cur = current_ctl();
            if cur.is_null() {
                return Err(OsError::Error);
            }
            unsafe { (*cur).deleted.store(true, Ordering::Release) };
            checkpoint();
            unreachable!("checkpoint unwinds a deleted task");
        }
        Some(ctl) => {
            let ctl = unsafe { ctl.as_ref() };
            ctl.deleted.store(true, Ordering::Release);
            if let Some(t) = ctl.thread.get() {
                t.unpark();
            }
            Ok(())
        }
    }
}

pub(crate) unsafe fn task_suspend(ctl: NonNull<TaskCtl>) -> OsResult<()> {
    let target = unsafe { ctl.as_ref() };
    if target.load_state() == TaskState::Deleted {
        return Err(OsError::Error);
    }
    target.suspend_ctr.fetch_add(1, Ordering::AcqRel);
    if std::ptr::eq(ctl.as_ptr(), current_ctl()) {
        checkpoint();
    }
    Ok(())
}

pub(crate) unsafe fn task_resume(ctl: NonNull<TaskCtl>) -> OsResult<()> {
    let target = unsafe { ctl.as_ref() };
    let prev = target.suspend_ctr.load(Ordering::Acquire);
    if prev == 0 {
        return Err(OsError::Error);
    }
    target.suspend_ctr.store(prev - 1, Ordering::Release);
    if prev == 1 {
        if let Some(t) = target.thread.get() {
            t.unpark();
        }
    }
    Ok(())
}

pub(crate) unsafe fn task_set_prio(ctl: NonNull<TaskCtl>, prio: OsPrio) -> OsResult<()> {
    if prio as usize >= CFG_PRIO_MAX {
        return Err(OsError::InvalidParam);
    }
    unsafe { ctl.as_ref() }.prio.store(prio, Ordering::Relaxed);
    Ok(())
}

pub(crate) unsafe fn task_prio(ctl: NonNull<TaskCtl>) -> OsPrio {
    unsafe { ctl.as_ref() }.prio.load(Ordering::Relaxed)
}

pub(crate) unsafe fn task_state(ctl: NonNull<TaskCtl>) -> TaskState {
    unsafe { ctl.as_ref() }.load_state()
}

pub(crate) unsafe fn task_name(ctl: NonNull<TaskCtl>) -> &'static str {
    unsafe { ctl.as_ref() }.name
}

pub(crate) fn task_delay(ticks: OsTick) -> OsResult<()> {
    checkpoint();
    if ticks == 0 {
        return Ok(());
    }

    let ctl = current_ctl();
    if !ctl.is_null() {
        unsafe { (*ctl).store_state(TaskState::Delayed) };
    }
    thread::sleep(ticks_to_duration(ticks));
    checkpoint();
    Ok(())
}

// ============ Wait lists ============

struct Waiter {
    thread: Thread,
    prio: OsPrio,
    woken: AtomicBool,
}

/// Priority-ordered waiter queue; FIFO among equal priorities
pub(crate) struct WaitList {
    waiters: Vec<Arc<Waiter>>,
}

pub(crate) struct WaitToken {
    waiter: Arc<Waiter>,
    list: *mut WaitList,
    timeout: OsTick,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        WaitList {
            waiters: Vec::new(),
        }
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Register the calling task; call inside a critical section, then
    /// block with [`wait_current`] outside it
    pub(crate) fn enqueue_current(&mut self, _cs: &CriticalSection, timeout: OsTick) -> WaitToken {
        let prio = current_task_prio();
        let waiter = Arc::new(Waiter {
            thread: thread::current(),
            prio,
            woken: AtomicBool::new(false),
        });

        let at = self
            .waiters
            .iter()
            .position(|w| w.prio > prio)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(at, waiter.clone());

        WaitToken {
            waiter,
            list: self as *mut WaitList,
            timeout,
        }
    }

    /// Wake the head waiter; returns false when nobody waits
    pub(crate) fn wake_one(&mut self, _cs: &CriticalSection) -> bool {
        if self.waiters.is_empty() {
            return false;
        }
        let waiter = self.waiters.remove(0);
        waiter.woken.store(true, Ordering::Release);
        waiter.thread.unpark();
        true
    }

    fn unlink(&mut self, waiter: &Arc<Waiter>) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(at) => {
                self.waiters.remove(at);
                true
            }
            None => false,
        }
    }
}

/// Block until woken or the token's timeout elapses
pub(crate) fn wait_current(token: WaitToken) -> WaitOutcome {
    let ctl = current_ctl();
    if !ctl.is_null() {
        unsafe { (*ctl).store_state(TaskState::Pended) };
    }

    let deadline = if token.timeout == WAIT_FOREVER {
        None
    } else {
        Some(Instant::now() + ticks_to_duration(token.timeout))
    };

    let outcome = loop {
        if token.waiter.woken.load(Ordering::Acquire) {
            break WaitOutcome::Woken;
        }
        // A deleted task must leave the wait queue before it unwinds
        if !ctl.is_null() && unsafe { (*ctl).deleted.load(Ordering::Acquire) } {
            critical::with(|_cs| unsafe { (*token.list).unlink(&token.waiter) });
            checkpoint();
        }

        match deadline {
            None => thread::park(),
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    // Raced with a concurrent wake: the entry being gone
                    // means the wake won
                    let timed_out =
                        critical::with(|_cs| unsafe { (*token.list).unlink(&token.waiter) });
                    break if timed_out {
                        WaitOutcome::Timeout
                    } else {
                        WaitOutcome::Woken
                    };
                }
                thread::park_timeout(d - now);
            }
        }
    };

    checkpoint();
    if !ctl.is_null() {
        unsafe { (*ctl).store_state(TaskState::Running) };
    }
    outcome
}
