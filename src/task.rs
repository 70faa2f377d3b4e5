//! Task management
//!
//! Thin, backend-independent task handles. The heavy lifting (control
//! blocks, stacks, scheduling) lives in the active port; this module only
//! enforces the shared contract and keeps the handle's reference alive.

use core::ptr::NonNull;

use crate::critical;
use crate::error::{OsError, OsResult};
use crate::port;
use crate::types::{OsPrio, OsTick, TaskState};

/// Task entry point; returning from it terminates the task
pub type TaskFn = fn(*mut ());

/// Handle to a task
///
/// The handle and the running task each keep the control block alive;
/// dropping the handle does not stop the task.
#[derive(Debug)]
pub struct Task {
    ctl: NonNull<port::TaskCtl>,
}

// Control-block access is funneled through the port's synchronization
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// Create and start a task
    ///
    /// `arg` is passed to `entry` verbatim; whatever it points to must stay
    /// valid until the task exits. Priority 0 is highest; `stack_words`
    /// below the configured minimum is rejected.
    pub fn create(
        name: &'static str,
        entry: TaskFn,
        arg: *mut (),
        prio: OsPrio,
        stack_words: usize,
    ) -> OsResult<Task> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }
        let ctl = port::task_create(name, entry, arg, prio, stack_words)?;
        crate::debug!("task created: {}", name);
        Ok(Task { ctl })
    }

    /// Terminate the task
    ///
    /// Takes effect at the task's next suspension point (delay, pend,
    /// suspend or yield); a task mid-computation finishes its current
    /// stretch first.
    pub fn delete(self) -> OsResult<()> {
        unsafe { port::task_delete(Some(self.ctl)) }
    }

    /// Terminate the calling task; does not return on success
    pub fn delete_current() -> OsResult<()> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }
        unsafe { port::task_delete(None) }
    }

    /// Pause the task until a matching [`resume`](Task::resume)
    ///
    /// Suspends nest: each suspend needs its own resume.
    pub fn suspend(&self) -> OsResult<()> {
        unsafe { port::task_suspend(self.ctl) }
    }

    /// Undo one suspend
    pub fn resume(&self) -> OsResult<()> {
        unsafe { port::task_resume(self.ctl) }
    }

    pub fn prio(&self) -> OsPrio {
        unsafe { port::task_prio(self.ctl) }
    }

    pub fn set_prio(&self, prio: OsPrio) -> OsResult<()> {
        unsafe { port::task_set_prio(self.ctl, prio) }
    }

    pub fn name(&self) -> &'static str {
        unsafe { port::task_name(self.ctl) }
    }

    pub fn state(&self) -> TaskState {
        unsafe { port::task_state(self.ctl) }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        unsafe { port::task_release(self.ctl) };
    }
}

/// Put the calling task to sleep for `ticks`
///
/// A zero delay yields without sleeping.
pub fn delay(ticks: OsTick) -> OsResult<()> {
    if critical::is_isr_context() {
        return Err(OsError::Error);
    }
    port::task_delay(ticks)
}

/// Offer the processor to another ready task of the same priority
pub fn yield_now() {
    port::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CFG_PRIO_DEFAULT;
    use core::ptr;
    use portable_atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    static RAN: AtomicU32 = AtomicU32::new(0);

    fn entry(_arg: *mut ()) {
        RAN.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn task_runs_and_exits_on_return() {
        let _ = crate::mem::init();
        let t = Task::create("worker", entry, ptr::null_mut(), CFG_PRIO_DEFAULT, 256).unwrap();

        let mut waited = 0;
        while t.state() != TaskState::Deleted && waited < 200 {
            std::thread::sleep(Duration::from_millis(10));
            waited += 1;
        }
        assert_eq!(RAN.load(Ordering::SeqCst), 1);
        assert_eq!(t.state(), TaskState::Deleted);
        assert_eq!(t.name(), "worker");
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let _ = crate::mem::init();
        assert_eq!(
            Task::create("p", entry, ptr::null_mut(), 255, 256).unwrap_err(),
            OsError::InvalidParam
        );
        assert_eq!(
            Task::create("s", entry, ptr::null_mut(), CFG_PRIO_DEFAULT, 1).unwrap_err(),
            OsError::InvalidParam
        );
    }

    #[test]
    fn suspend_and_resume_gate_progress() {
        let _ = crate::mem::init();

        static STEPS: AtomicU32 = AtomicU32::new(0);
        fn stepper(_arg: *mut ()) {
            loop {
                STEPS.fetch_add(1, Ordering::SeqCst);
                if delay(5).is_err() {
                    return;
                }
            }
        }

        let t = Task::create("stepper", stepper, ptr::null_mut(), CFG_PRIO_DEFAULT, 256).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(STEPS.load(Ordering::SeqCst) > 0);

        t.suspend().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let frozen = STEPS.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(STEPS.load(Ordering::SeqCst), frozen);

        t.resume().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(STEPS.load(Ordering::SeqCst) > frozen);

        t.delete().unwrap();
    }

    #[test]
    fn resume_without_suspend_fails() {
        let _ = crate::mem::init();

        fn idle(_arg: *mut ()) {
            let _ = delay(1000);
        }
        let t = Task::create("idle", idle, ptr::null_mut(), CFG_PRIO_DEFAULT, 256).unwrap();
        assert_eq!(t.resume(), Err(OsError::Error));
        t.delete().unwrap();
    }
}
