//! Software timers
//!
//! One-shot and periodic timers driven by the kernel tick. Callbacks run
//! in the backend's timer dispatch context with interrupts enabled, never
//! inside the tick interrupt itself: a dedicated service task on the
//! preemptive backend, a service thread on the hosted one, and the main
//! loop's tick hook on bare metal.

use core::ptr::{self, NonNull};

use crate::critical::{self, CsCell};
use crate::error::{OsError, OsResult};
use crate::mem;
use crate::port;
use crate::types::OsTick;

/// Timer callback; the argument is the pointer given at creation
pub type TimerFn = fn(*mut ());

/// Expiry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerMode {
    /// Fire once, then go dormant
    OneShot,
    /// Re-arm from the scheduled expiry after every fire
    Periodic,
}

struct TimerCtl {
    period: OsTick,
    mode: TimerMode,
    callback: TimerFn,
    arg: *mut (),
    expiry: OsTick,
    active: bool,
    /// Set while the dispatcher handles an expiry; a restart from inside
    /// the callback clears it
    expired: bool,
    /// The dispatcher holds a popped timer outside the critical section
    servicing: bool,
    /// Deleted mid-callback; the dispatcher frees it afterwards
    doomed: bool,
    next: *mut TimerCtl,
}

struct TimerList {
    head: *mut TimerCtl,
}

impl TimerList {
    fn link(&mut self, ctl: *mut TimerCtl) {
        unsafe {
            (*ctl).next = self.head;
        }
        self.head = ctl;
    }

    /// Remove `ctl` if present; absence is not an error
    fn unlink(&mut self, ctl: *mut TimerCtl) {
        let mut cur = &mut self.head;
        while !(*cur).is_null() {
            if *cur == ctl {
                *cur = unsafe { (*ctl).next };
                unsafe { (*ctl).next = ptr::null_mut() };
                return;
            }
            cur = unsafe { &mut (**cur).next };
        }
    }

    /// Pop some timer whose expiry has passed
    fn pop_due(&mut self, now: OsTick) -> *mut TimerCtl {
        let mut cur = &mut self.head;
        while !(*cur).is_null() {
            let ctl = *cur;
            if due(now, unsafe { (*ctl).expiry }) {
                *cur = unsafe { (*ctl).next };
                unsafe { (*ctl).next = ptr::null_mut() };
                return ctl;
            }
            cur = unsafe { &mut (**cur).next };
        }
        ptr::null_mut()
    }
}

/// Wrapping tick comparison; sound as long as no timer spans half the
/// counter range
#[inline]
fn due(now: OsTick, expiry: OsTick) -> bool {
    now.wrapping_sub(expiry) as i32 >= 0
}

static ACTIVE: CsCell<TimerList> = CsCell::new(TimerList {
    head: ptr::null_mut(),
});

/// Handle to a software timer
///
/// Dropping the handle deletes the timer; a callback already in flight
/// runs to completion first.
pub struct Timer {
    ctl: NonNull<TimerCtl>,
}

// All TimerCtl access goes through the critical section
unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

impl Timer {
    /// Create a dormant timer
    ///
    /// `arg` is handed to `callback` verbatim on every expiry; whatever it
    /// points to must outlive the timer.
    pub fn create(
        period: OsTick,
        mode: TimerMode,
        callback: TimerFn,
        arg: *mut (),
    ) -> OsResult<Timer> {
        if period == 0 {
            return Err(OsError::InvalidParam);
        }

        let raw = mem::alloc(core::mem::size_of::<TimerCtl>()) as *mut TimerCtl;
        let Some(ctl) = NonNull::new(raw) else {
            return Err(OsError::NoMemory);
        };
        unsafe {
            ctl.as_ptr().write(TimerCtl {
                period,
                mode,
                callback,
                arg,
                expiry: 0,
                active: false,
                expired: false,
                servicing: false,
                doomed: false,
                next: ptr::null_mut(),
            });
        }
        Ok(Timer { ctl })
    }

    /// Arm the timer for one full period from now
    ///
    /// Starting a running timer restarts its countdown.
    pub fn start(&self) -> OsResult<()> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }
        self.arm(port::tick_now());
        Ok(())
    }

    /// Restart the countdown from a full period
    pub fn reset(&self) -> OsResult<()> {
        self.start()
    }

    /// Disarm the timer; a pending expiry is cancelled
    pub fn stop(&self) -> OsResult<()> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }
        self.disarm();
        Ok(())
    }

    /// ISR-safe start/restart
    pub fn start_from_isr(&self) -> OsResult<()> {
        self.arm(port::tick_now());
        Ok(())
    }

    /// ISR-safe stop
    pub fn stop_from_isr(&self) -> OsResult<()> {
        self.disarm();
        Ok(())
    }

    /// ISR-safe restart from a full period
    pub fn reset_from_isr(&self) -> OsResult<()> {
        self.start_from_isr()
    }

    /// Change the period
    ///
    /// Takes effect at the next arm or periodic re-arm; a countdown
    /// already in flight keeps its old expiry.
    pub fn set_period(&self, period: OsTick) -> OsResult<()> {
        if period == 0 {
            return Err(OsError::InvalidParam);
        }
        critical::with(|_cs| unsafe { (*self.ctl.as_ptr()).period = period });
        Ok(())
    }

    /// Whether the timer is counting down or firing
    ///
    /// A one-shot timer reports active for the duration of its callback
    /// and inactive once the callback returns.
    pub fn is_active(&self) -> bool {
        critical::with(|_cs| unsafe { (*self.ctl.as_ptr()).active })
    }

    fn arm(&self, now: OsTick) {
        critical::with(|cs| {
            let list = ACTIVE.get(cs);
            let ctl = self.ctl.as_ptr();
            unsafe {
                list.unlink(ctl);
                (*ctl).expiry = now.wrapping_add((*ctl).period);
                (*ctl).active = true;
                (*ctl).expired = false;
                list.link(ctl);
            }
        });
    }

    fn disarm(&self) {
        critical::with(|cs| {
            let list = ACTIVE.get(cs);
            let ctl = self.ctl.as_ptr();
            unsafe {
                list.unlink(ctl);
                (*ctl).active = false;
                (*ctl).expired = false;
            }
        });
    }

    /// Delete the timer, releasing its control block
    pub fn delete(self) {
        // Drop does the work
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let free_now = critical::with(|cs| {
            let list = ACTIVE.get(cs);
            let ctl = self.ctl.as_ptr();
            unsafe {
                list.unlink(ctl);
                (*ctl).active = false;
                if (*ctl).servicing {
                    (*ctl).doomed = true;
                    false
                } else {
                    true
                }
            }
        });
        if free_now {
            mem::free(self.ctl.as_ptr() as *mut u8);
        }
    }
}

/// Fire every timer due at `now`
///
/// Called by the backend's dispatch context. Callbacks run here with
/// interrupts enabled; list surgery stays inside critical sections.
pub(crate) fn service(now: OsTick) {
    loop {
        let popped = critical::with(|cs| {
            let list = ACTIVE.get(cs);
            let ctl = list.pop_due(now);
            if ctl.is_null() {
                return None;
            }
            unsafe {
                (*ctl).expired = true;
                (*ctl).servicing = true;
                Some((ctl, (*ctl).callback, (*ctl).arg))
            }
        });

        let Some((ctl, callback, arg)) = popped else {
            return;
        };

        callback(arg);

        let free_now = critical::with(|cs| {
            let list = ACTIVE.get(cs);
            unsafe {
                (*ctl).servicing = false;
                if (*ctl).doomed {
                    return true;
                }
                // A start, stop or delete from the callback already
                // settled the timer's fate
                if (*ctl).expired {
                    (*ctl).expired = false;
                    match (*ctl).mode {
                        TimerMode::OneShot => (*ctl).active = false,
                        TimerMode::Periodic => {
                            // Re-arm from the scheduled expiry so periods
                            // do not drift; skip ahead if service lagged
                            let mut next = (*ctl).expiry.wrapping_add((*ctl).period);
                            while due(now, next) {
                                next = next.wrapping_add((*ctl).period);
                            }
                            (*ctl).expiry = next;
                            list.link(ctl);
                        }
                    }
                }
            }
            false
        });
        if free_now {
            mem::free(ctl as *mut u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_atomic::{AtomicU32, Ordering};

    // Timers share one global active list; keep these tests exclusive
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    static FIRED: AtomicU32 = AtomicU32::new(0);

    fn bump(_arg: *mut ()) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn one_shot_fires_once_then_goes_dormant() {
        let _guard = LOCK.lock().unwrap();
        let _ = crate::mem::init();
        FIRED.store(0, Ordering::SeqCst);

        let t = Timer::create(50, TimerMode::OneShot, bump, ptr::null_mut()).unwrap();
        assert!(!t.is_active());
        let now = port::tick_now();
        t.start().unwrap();
        assert!(t.is_active());

        service(now.wrapping_add(10));
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        service(now.wrapping_add(80));
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert!(!t.is_active());

        // Dormant timers never fire again
        service(now.wrapping_add(500));
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_fires_every_period() {
        let _guard = LOCK.lock().unwrap();
        let _ = crate::mem::init();

        static COUNT: AtomicU32 = AtomicU32::new(0);
        fn tick(_arg: *mut ()) {
            COUNT.fetch_add(1, Ordering::SeqCst);
        }

        let t = Timer::create(100, TimerMode::Periodic, tick, ptr::null_mut()).unwrap();
        let now = port::tick_now();
        t.start().unwrap();

        for k in 1..=3 {
            service(now.wrapping_add(100 * k + 50));
            assert_eq!(COUNT.load(Ordering::SeqCst), k);
        }
        assert!(t.is_active());

        t.stop().unwrap();
        service(now.wrapping_add(1000));
        assert_eq!(COUNT.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_period_is_rejected() {
        let _guard = LOCK.lock().unwrap();
        let _ = crate::mem::init();
        assert!(Timer::create(0, TimerMode::OneShot, bump, ptr::null_mut()).is_err());
        let t = Timer::create(10, TimerMode::OneShot, bump, ptr::null_mut()).unwrap();
        assert_eq!(t.set_period(0), Err(OsError::InvalidParam));
    }
}
