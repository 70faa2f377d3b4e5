//! Task control block for the preemptive backend

use core::ptr::NonNull;

use crate::types::{OsPrio, OsTick, TaskState, WaitOutcome};

use super::WaitList;

/// Stack element; the context switch works in 32-bit words
pub(crate) type StkElement = u32;

/// Task control block
///
/// `stk_ptr` must stay the first field: the PendSV handler loads and
/// stores it at offset 0.
#[repr(C)]
pub(crate) struct Tcb {
    /// Saved process stack pointer
    pub(crate) stk_ptr: *mut StkElement,

    pub(crate) stk_base: *mut StkElement,
    pub(crate) stk_size: usize,

    pub(crate) name: &'static str,
    pub(crate) prio: OsPrio,
    pub(crate) state: TaskState,
    pub(crate) suspend_ctr: u8,
    /// Handle + running task each hold one reference
    pub(crate) refs: u8,

    // Ready list links
    pub(crate) next: Option<NonNull<Tcb>>,
    pub(crate) prev: Option<NonNull<Tcb>>,

    // Wait queue links
    pub(crate) pend_next: Option<NonNull<Tcb>>,
    pub(crate) pend_prev: Option<NonNull<Tcb>>,
    /// Queue this task pends on; lets the tick handler unlink a waiter
    /// whose timeout fired
    pub(crate) wait_list: *mut WaitList,
    pub(crate) wait_outcome: WaitOutcome,

    // Tick wheel links
    pub(crate) tick_next: Option<NonNull<Tcb>>,
    pub(crate) tick_prev: Option<NonNull<Tcb>>,
    pub(crate) tick_expiry: OsTick,
    pub(crate) tick_slot: u8,
    pub(crate) in_wheel: bool,

    // Round-robin budget
    pub(crate) quanta: OsTick,
    pub(crate) quanta_ctr: OsTick,

    /// Chain of dead tasks awaiting cleanup by the idle task
    pub(crate) reap_next: *mut Tcb,
}

impl Tcb {
    pub(crate) const fn new() -> Self {
        Tcb {
            stk_ptr: core::ptr::null_mut(),
            stk_base: core::ptr::null_mut(),
            stk_size: 0,

            name: "",
            prio: 0,
            state: TaskState::Ready,
            suspend_ctr: 0,
            refs: 2,

            next: None,
            prev: None,

            pend_next: None,
            pend_prev: None,
            wait_list: core::ptr::null_mut(),
            wait_outcome: WaitOutcome::Timeout,

            tick_next: None,
            tick_prev: None,
            tick_expiry: 0,
            tick_slot: 0,
            in_wheel: false,

            quanta: 0,
            quanta_ctr: 0,

            reap_next: core::ptr::null_mut(),
        }
    }
}

unsafe impl Send for Tcb {}
unsafe impl Sync for Tcb {}
