//! Preemptive backend for ARM Cortex-M
//!
//! Priority-based preemptive scheduler with round-robin time slicing among
//! equal priorities. Context switches happen in the PendSV exception; the
//! SysTick interrupt drives delays, pend timeouts and the timer service
//! task. Control blocks and stacks come from the kernel heap; an idle task
//! reclaims both after a task dies.

mod arch;
mod rdy;
mod tcb;

use core::ptr::NonNull;

use crate::config::{
    CFG_IDLE_TASK_STACK, CFG_PRIO_IDLE, CFG_PRIO_MAX, CFG_STK_SIZE_MIN, CFG_TICK_WHEEL_SIZE,
    CFG_TIMER_TASK_PRIO, CFG_TIMER_TASK_STACK, CFG_TIME_QUANTA_DEFAULT,
};
use crate::critical::{self, CriticalSection, CsCell};
use crate::error::{OsError, OsResult};
use crate::kernel;
use crate::mem;
use crate::task::TaskFn;
use crate::types::{OsPrio, OsTick, TaskState, WaitOutcome, WAIT_FOREVER};

use portable_atomic::{AtomicU32, Ordering};
use rdy::{PrioBitmap, ReadyList};
use tcb::StkElement;

pub(crate) use tcb::Tcb;

pub(crate) const HAS_TASKS: bool = true;

pub(crate) type TaskCtl = Tcb;

/// Identity used for mutex ownership checks; the TCB address
pub(crate) type TaskId = usize;

#[inline]
pub(crate) fn current_task_id() -> TaskId {
    unsafe { (*cpu()).tcb_cur as usize }
}

// ============ Kernel tick ============

static TICK: AtomicU32 = AtomicU32::new(0);

/// Ticks elapsed since `os_start`
pub fn tick_now() -> OsTick {
    TICK.load(Ordering::Relaxed)
}

// ============ CPU switch state ============

/// Shared with the PendSV handler; `tcb_cur` must be the first field
#[repr(C)]
pub(crate) struct CpuState {
    pub(crate) tcb_cur: *mut Tcb,
    pub(crate) tcb_high_rdy: *mut Tcb,
}

#[no_mangle]
#[used]
static mut CPU_STATE: CpuState = CpuState {
    tcb_cur: core::ptr::null_mut(),
    tcb_high_rdy: core::ptr::null_mut(),
};

#[inline(always)]
fn cpu() -> *mut CpuState {
    &raw mut CPU_STATE
}

// ============ Scheduler state ============

struct SchedState {
    prio_tbl: PrioBitmap,
    rdy: [ReadyList; CFG_PRIO_MAX],
    wheel: [Option<NonNull<Tcb>>; CFG_TICK_WHEEL_SIZE],
    reap_head: *mut Tcb,
}

static SCHED: CsCell<SchedState> = CsCell::new(SchedState {
    prio_tbl: PrioBitmap::new(),
    rdy: [const { ReadyList::new() }; CFG_PRIO_MAX],
    wheel: [None; CFG_TICK_WHEEL_SIZE],
    reap_head: core::ptr::null_mut(),
});

impl SchedState {
    fn rdy_insert(&mut self, tcb: NonNull<Tcb>) {
        let prio = unsafe { tcb.as_ref() }.prio;
        self.rdy[prio as usize].insert_tail(tcb);
        self.prio_tbl.set(prio);
    }

    fn rdy_remove(&mut self, tcb: NonNull<Tcb>) {
        let prio = unsafe { tcb.as_ref() }.prio;
        let list = &mut self.rdy[prio as usize];
        list.remove(tcb);
        if list.is_empty() {
            self.prio_tbl.clear(prio);
        }
    }

    fn wheel_insert(&mut self, tcb: NonNull<Tcb>, expiry: OsTick) {
        let slot = (expiry as usize) % CFG_TICK_WHEEL_SIZE;
        let t = unsafe { &mut *tcb.as_ptr() };

        t.tick_expiry = expiry;
        t.tick_slot = slot as u8;
        t.tick_next = self.wheel[slot];
        t.tick_prev = None;
        t.in_wheel = true;

        if let Some(mut old_head) = self.wheel[slot] {
            unsafe { old_head.as_mut().tick_prev = Some(tcb) };
        }
        self.wheel[slot] = Some(tcb);
    }

    fn wheel_remove(&mut self, tcb: NonNull<Tcb>) {
        let t = unsafe { &mut *tcb.as_ptr() };
        if !t.in_wheel {
            return;
        }
        let slot = t.tick_slot as usize;

        match t.tick_prev {
            Some(mut prev) => unsafe { prev.as_mut().tick_next = t.tick_next },
            None => self.wheel[slot] = t.tick_next,
        }
        if let Some(mut next) = t.tick_next {
            unsafe { next.as_mut().tick_prev = t.tick_prev };
        }

        t.tick_next = None;
        t.tick_prev = None;
        t.in_wheel = false;
    }

    /// Make a task runnable again after a wake, delay expiry or resume
    fn make_ready(&mut self, tcb: NonNull<Tcb>) {
        let t = unsafe { &mut *tcb.as_ptr() };
        if t.suspend_ctr > 0 {
            t.state = TaskState::Suspended;
        } else {
            t.state = TaskState::Ready;
            self.rdy_insert(tcb);
        }
    }
}

// ============ Scheduling ============

/// Hand the CPU to the highest-priority ready task if it is not already
/// running; safe from task and ISR context alike
pub(crate) fn reschedule() {
    if !kernel::is_running() {
        return;
    }
    critical::with(|cs| {
        let s = SCHED.get(cs);
        let prio = s.prio_tbl.highest();
        if let Some(head) = s.rdy[prio as usize].head() {
            let c = unsafe { &mut *cpu() };
            if c.tcb_cur != head.as_ptr() {
                c.tcb_high_rdy = head.as_ptr();
                arch::trigger_ctx_switch();
            }
        }
    });
}

pub(crate) fn yield_now() {
    critical::with(|cs| {
        let s = SCHED.get(cs);
        if let Some(cur) = NonNull::new(unsafe { (*cpu()).tcb_cur }) {
            let prio = unsafe { cur.as_ref() }.prio;
            s.rdy[prio as usize].rotate();
        }
    });
    reschedule();
}

// ============ Tick handling ============

/// One tick's worth of work: delay expiry, pend timeouts, time slicing
pub(crate) fn tick() {
    if !kernel::is_running() {
        return;
    }
    let now = TICK.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

    critical::with(|cs| {
        let s = SCHED.get(cs);
        process_wheel(s, now);
        round_robin(s);
    });

    reschedule();
}

/// Walk this tick's wheel slot and ready every task whose deadline passed
fn process_wheel(s: &mut SchedState, now: OsTick) {
    let slot = (now as usize) % CFG_TICK_WHEEL_SIZE;
    let mut current = s.wheel[slot];

    while let Some(tcb) = current {
        let t = unsafe { &mut *tcb.as_ptr() };
        current = t.tick_next;

        if now.wrapping_sub(t.tick_expiry) as i32 >= 0 {
            s.wheel_remove(tcb);
            match t.state {
                TaskState::Delayed => s.make_ready(tcb),
                TaskState::Pended => {
                    // Timed out: leave the wait queue before running again
                    if let Some(wl) = unsafe { t.wait_list.as_mut() } {
                        wl.remove(tcb);
                    }
                    t.wait_list = core::ptr::null_mut();
                    t.wait_outcome = WaitOutcome::Timeout;
                    s.make_ready(tcb);
                }
                _ => {}
            }
        }
    }
}

/// Rotate the current task's ready list when its time slice runs out
fn round_robin(s: &mut SchedState) {
    let Some(cur) = NonNull::new(unsafe { (*cpu()).tcb_cur }) else {
        return;
    };
    let t = unsafe { &mut *cur.as_ptr() };

    if t.quanta_ctr > 0 {
        t.quanta_ctr -= 1;
    }
    if t.quanta_ctr == 0 {
        t.quanta_ctr = t.quanta;
        s.rdy[t.prio as usize].rotate();
    }
}

// ============ Wait lists ============

/// Priority-ordered queue of pended tasks; FIFO among equal priorities
pub(crate) struct WaitList {
    head: Option<NonNull<Tcb>>,
    tail: Option<NonNull<Tcb>>,
}

pub(crate) struct WaitToken {
    tcb: Option<NonNull<Tcb>>,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        WaitList {
            head: None,
            tail: None,
        }
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.head.is_some()
    }

    /// Take the calling task off the ready list and queue it here; the
    /// caller blocks with [`wait_current`] after leaving the critical
    /// section
    pub(crate) fn enqueue_current(&mut self, cs: &CriticalSection, timeout: OsTick) -> WaitToken {
        let Some(cur) = NonNull::new(unsafe { (*cpu()).tcb_cur }) else {
            // Not inside a task; nothing can block
            return WaitToken { tcb: None };
        };

        let s = SCHED.get(cs);
        s.rdy_remove(cur);

        let t = unsafe { &mut *cur.as_ptr() };
        t.state = TaskState::Pended;
        t.wait_outcome = WaitOutcome::Timeout;
        t.wait_list = self as *mut WaitList;
        self.insert_by_prio(cur);

        if timeout != WAIT_FOREVER {
            s.wheel_insert(cur, tick_now().wrapping_add(timeout));
        }

        WaitToken { tcb: Some(cur) }
    }

    /// Ready the head waiter; returns false when nobody waits
    pub(crate) fn wake_one(&mut self, cs: &CriticalSection) -> bool {
        let Some(tcb) = self.head else {
            return false;
        };
        self.remove(tcb);

        let s = SCHED.get(cs);
        let t = unsafe { &mut *tcb.as_ptr() };
        t.wait_list = core::ptr::null_mut();
        t.wait_outcome = WaitOutcome::Woken;
        s.wheel_remove(tcb);
        s.make_ready(tcb);
        true
    }

    fn insert_by_prio(&mut self, tcb: NonNull<Tcb>) {
        let prio = unsafe { tcb.as_ref() }.prio;

        let mut prev: Option<NonNull<Tcb>> = None;
        let mut current = self.head;
        while let Some(cur) = current {
            let cur_ref = unsafe { cur.as_ref() };
            if prio < cur_ref.prio {
                break;
            }
            prev = current;
            current = cur_ref.pend_next;
        }

        let t = unsafe { &mut *tcb.as_ptr() };
        t.pend_prev = prev;
        t.pend_next = current;

        match prev {
            Some(p) => unsafe { (*p.as_ptr()).pend_next = Some(tcb) },
            None => self.head = Some(tcb),
        }
        match current {
            Some(c) => unsafe { (*c.as_ptr()).pend_prev = Some(tcb) },
            None => self.tail = Some(tcb),
        }
    }

    pub(crate) fn remove(&mut self, tcb: NonNull<Tcb>) {
        let t = unsafe { &mut *tcb.as_ptr() };

        match t.pend_prev {
            Some(prev) => unsafe { (*prev.as_ptr()).pend_next = t.pend_next },
            None => self.head = t.pend_next,
        }
        match t.pend_next {
            Some(next) => unsafe { (*next.as_ptr()).pend_prev = t.pend_prev },
            None => self.tail = t.pend_prev,
        }

        t.pend_prev = None;
        t.pend_next = None;
    }
}

unsafe impl Send for WaitList {}
unsafe impl Sync for WaitList {}

/// Switch away until woken or timed out; returns why the task resumed
pub(crate) fn wait_current(token: WaitToken) -> WaitOutcome {
    let Some(tcb) = token.tcb else {
        return WaitOutcome::Timeout;
    };
    reschedule();
    // Running again: the waker or the tick handler recorded the outcome
    critical::with(|_cs| unsafe { tcb.as_ref().wait_outcome })
}

// ============ Task operations ============

pub(crate) fn task_create(
    name: &'static str,
    entry: TaskFn,
    arg: *mut (),
    prio: OsPrio,
    stack_words: usize,
) -> OsResult<NonNull<Tcb>> {
    if prio as usize >= CFG_PRIO_MAX {
        return Err(OsError::InvalidParam);
    }
    if stack_words < CFG_STK_SIZE_MIN {
        return Err(OsError::InvalidParam);
    }

    let raw = mem::alloc(core::mem::size_of::<Tcb>()) as *mut Tcb;
    let Some(tcb) = NonNull::new(raw) else {
        return Err(OsError::NoMemory);
    };
    let stk_base = mem::alloc(stack_words * core::mem::size_of::<StkElement>()) as *mut StkElement;
    if stk_base.is_null() {
        mem::free(tcb.as_ptr() as *mut u8);
        return Err(OsError::NoMemory);
    }

    unsafe {
        tcb.as_ptr().write(Tcb::new());
        let t = &mut *tcb.as_ptr();
        t.name = name;
        t.prio = prio;
        t.quanta = CFG_TIME_QUANTA_DEFAULT;
        t.quanta_ctr = CFG_TIME_QUANTA_DEFAULT;
        t.stk_base = stk_base;
        t.stk_size = stack_words;
        t.stk_ptr = arch::stack_init(entry, arg, stk_base, stack_words);
    }

    critical::with(|cs| SCHED.get(cs).rdy_insert(tcb));
    if kernel::is_running() {
        reschedule();
    }
    Ok(tcb)
}

/// Drop one reference; the control block is freed when the last goes
pub(crate) unsafe fn task_release(tcb: NonNull<Tcb>) {
    let free = critical::with(|_cs| {
        let t = unsafe { &mut *tcb.as_ptr() };
        t.refs -= 1;
        t.refs == 0
    });
    if free {
        mem::free(tcb.as_ptr() as *mut u8);
    }
}

pub(crate) unsafe fn task_delete(ctl: Option<NonNull<Tcb>>) -> OsResult<()> {
    let cur = NonNull::new(unsafe { (*cpu()).tcb_cur });
    let Some(target) = ctl.or(cur) else {
        return Err(OsError::Error);
    };
    let is_current = Some(target) == cur;

    critical::with(|cs| {
        let s = SCHED.get(cs);
        let t = unsafe { &mut *target.as_ptr() };

        if t.prio == CFG_PRIO_IDLE || t.state == TaskState::Deleted {
            return Err(OsError::Error);
        }

        match t.state {
            TaskState::Ready | TaskState::Running => s.rdy_remove(target),
            TaskState::Delayed => s.wheel_remove(target),
            TaskState::Pended => {
                if let Some(wl) = unsafe { t.wait_list.as_mut() } {
                    wl.remove(target);
                }
                t.wait_list = core::ptr::null_mut();
                s.wheel_remove(target);
            }
            TaskState::Suspended | TaskState::Deleted => {}
        }

        t.state = TaskState::Deleted;
        t.reap_next = s.reap_head;
        s.reap_head = target.as_ptr();
        Ok(())
    })?;

    if is_current {
        // Switch away for good; the idle task reclaims the stack
        reschedule();
        loop {
            arch::wait_for_interrupt();
        }
    }
    Ok(())
}

pub(crate) unsafe fn task_suspend(ctl: NonNull<Tcb>) -> OsResult<()> {
    let is_current = ctl.as_ptr() == unsafe { (*cpu()).tcb_cur };

    critical::with(|cs| {
        let s = SCHED.get(cs);
        let t = unsafe { &mut *ctl.as_ptr() };

        if t.prio == CFG_PRIO_IDLE || t.state == TaskState::Deleted {
            return Err(OsError::Error);
        }

        t.suspend_ctr = t.suspend_ctr.saturating_add(1);
        if t.state == TaskState::Ready {
            s.rdy_remove(ctl);
            t.state = TaskState::Suspended;
        }
        // Delayed and pended tasks keep their place; the suspend count
        // gates them when their wait ends
        Ok(())
    })?;

    if is_current {
        reschedule();
    }
    Ok(())
}

pub(crate) unsafe fn task_resume(ctl: NonNull<Tcb>) -> OsResult<()> {
    critical::with(|cs| {
        let s = SCHED.get(cs);
        let t = unsafe { &mut *ctl.as_ptr() };

        if t.suspend_ctr == 0 {
            return Err(OsError::Error);
        }
        t.suspend_ctr -= 1;

        if t.suspend_ctr == 0 && t.state == TaskState::Suspended {
            t.state = TaskState::Ready;
            s.rdy_insert(ctl);
        }
        Ok(())
    })?;

    reschedule();
    Ok(())
}

pub(crate) unsafe fn task_set_prio(ctl: NonNull<Tcb>, prio: OsPrio) -> OsResult<()> {
    if prio as usize >= CFG_PRIO_MAX {
        return Err(OsError::InvalidParam);
    }

    critical::with(|cs| {
        let s = SCHED.get(cs);
        let t = unsafe { &mut *ctl.as_ptr() };

        match t.state {
            TaskState::Ready => {
                s.rdy_remove(ctl);
                t.prio = prio;
                s.rdy_insert(ctl);
            }
            // A waiter's queue position is its priority; keep it sorted
            TaskState::Pended => match unsafe { t.wait_list.as_mut() } {
                Some(wl) => {
                    wl.remove(ctl);
                    t.prio = prio;
                    wl.insert_by_prio(ctl);
                }
                None => t.prio = prio,
            },
            _ => t.prio = prio,
        }
    });

    reschedule();
    Ok(())
}

pub(crate) unsafe fn task_prio(ctl: NonNull<Tcb>) -> OsPrio {
    critical::with(|_cs| unsafe { ctl.as_ref().prio })
}

pub(crate) unsafe fn task_state(ctl: NonNull<Tcb>) -> TaskState {
    critical::with(|_cs| {
        let state = unsafe { ctl.as_ref().state };
        if state == TaskState::Ready && ctl.as_ptr() == unsafe { (*cpu()).tcb_cur } {
            TaskState::Running
        } else {
            state
        }
    })
}

pub(crate) unsafe fn task_name(ctl: NonNull<Tcb>) -> &'static str {
    critical::with(|_cs| unsafe { ctl.as_ref().name })
}

pub(crate) fn task_delay(ticks: OsTick) -> OsResult<()> {
    if ticks == 0 {
        yield_now();
        return Ok(());
    }

    critical::with(|cs| {
        let Some(cur) = NonNull::new(unsafe { (*cpu()).tcb_cur }) else {
            return Err(OsError::Error);
        };
        let s = SCHED.get(cs);
        s.rdy_remove(cur);
        unsafe { (*cur.as_ptr()).state = TaskState::Delayed };
        s.wheel_insert(cur, tick_now().wrapping_add(ticks));
        Ok(())
    })?;

    reschedule();
    Ok(())
}

/// Landing pad for a task entry that returns; terminates the task
pub(crate) extern "C" fn task_exit() -> ! {
    let _ = unsafe { task_delete(None) };
    loop {
        arch::wait_for_interrupt();
    }
}

// ============ Kernel tasks and startup ============

fn idle_entry(_arg: *mut ()) {
    loop {
        reap();
        arch::wait_for_interrupt();
    }
}

/// Release the stacks and task references of dead tasks
fn reap() {
    loop {
        let dead = critical::with(|cs| {
            let s = SCHED.get(cs);
            let t = s.reap_head;
            if !t.is_null() {
                s.reap_head = unsafe { (*t).reap_next };
            }
            t
        });
        let Some(dead) = NonNull::new(dead) else {
            return;
        };
        unsafe {
            mem::free((*dead.as_ptr()).stk_base as *mut u8);
            task_release(dead);
        }
    }
}

fn timer_entry(_arg: *mut ()) {
    loop {
        let _ = task_delay(1);
        crate::timer::service(tick_now());
    }
}

pub(crate) fn init() -> OsResult<()> {
    task_create(
        "osal-idle",
        idle_entry,
        core::ptr::null_mut(),
        CFG_PRIO_IDLE,
        CFG_IDLE_TASK_STACK,
    )?;
    task_create(
        "osal-timer",
        timer_entry,
        core::ptr::null_mut(),
        CFG_TIMER_TASK_PRIO,
        CFG_TIMER_TASK_STACK,
    )?;
    Ok(())
}

/// Launch the first task; on hardware this never returns
pub(crate) fn start() -> OsResult<()> {
    critical::with(|cs| {
        let s = SCHED.get(cs);
        let prio = s.prio_tbl.highest();
        match s.rdy[prio as usize].head() {
            Some(head) => {
                unsafe { (*cpu()).tcb_high_rdy = head.as_ptr() };
                Ok(())
            }
            None => Err(OsError::Error),
        }
    })?;

    arch::start_first_task();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_change_resorts_a_pended_task() {
        let mut wl = WaitList::new();
        let wl_ptr = &mut wl as *mut WaitList;

        let mut a = Tcb::new();
        a.prio = 5;
        a.state = TaskState::Pended;
        a.wait_list = wl_ptr;
        let mut b = Tcb::new();
        b.prio = 10;
        b.state = TaskState::Pended;
        b.wait_list = wl_ptr;

        let na = NonNull::from(&mut a);
        let nb = NonNull::from(&mut b);
        unsafe {
            (*wl_ptr).insert_by_prio(na);
            (*wl_ptr).insert_by_prio(nb);
        }
        assert_eq!(unsafe { (*wl_ptr).head }, Some(na));

        // Raising b above a must move it to the head of the queue
        unsafe { task_set_prio(nb, 1).unwrap() };
        assert_eq!(unsafe { (*wl_ptr).head }, Some(nb));
        assert_eq!(unsafe { nb.as_ref() }.pend_next, Some(na));

        // Dropping a below its peers sends it to the tail
        unsafe { task_set_prio(na, 20).unwrap() };
        assert_eq!(unsafe { (*wl_ptr).head }, Some(nb));

        unsafe {
            (*wl_ptr).remove(na);
            (*wl_ptr).remove(nb);
        }
    }
}
