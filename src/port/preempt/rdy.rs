//! Ready queues: a per-priority task list plus a bitmap for O(1)
//! highest-ready lookup
//!
//! A set bit means at least one ready task at that priority. Bit 0 of
//! word 0 is priority 0 (highest), so leading-zero counting finds the
//! best priority in one instruction.

use core::ptr::NonNull;

use crate::config::CFG_PRIO_MAX;
use crate::types::OsPrio;

use super::tcb::Tcb;

const BITMAP_WORDS: usize = CFG_PRIO_MAX.div_ceil(32);

pub(crate) struct PrioBitmap {
    bitmap: [u32; BITMAP_WORDS],
}

impl PrioBitmap {
    pub(crate) const fn new() -> Self {
        PrioBitmap {
            bitmap: [0; BITMAP_WORDS],
        }
    }

    #[inline]
    pub(crate) fn set(&mut self, prio: OsPrio) {
        debug_assert!((prio as usize) < CFG_PRIO_MAX);
        self.bitmap[(prio / 32) as usize] |= 1 << (31 - prio % 32);
    }

    #[inline]
    pub(crate) fn clear(&mut self, prio: OsPrio) {
        debug_assert!((prio as usize) < CFG_PRIO_MAX);
        self.bitmap[(prio / 32) as usize] &= !(1 << (31 - prio % 32));
    }

    /// Highest set priority, or the lowest priority when empty
    #[inline]
    pub(crate) fn highest(&self) -> OsPrio {
        let mut prio: OsPrio = 0;
        for &word in self.bitmap.iter() {
            if word != 0 {
                return prio + word.leading_zeros() as OsPrio;
            }
            prio += 32;
        }
        (CFG_PRIO_MAX - 1) as OsPrio
    }
}

/// Doubly-linked list of ready tasks at one priority
///
/// Insertion at the tail, scheduling from the head; same-priority tasks
/// round-robin by rotating the list.
pub(crate) struct ReadyList {
    head: Option<NonNull<Tcb>>,
    tail: Option<NonNull<Tcb>>,
}

impl ReadyList {
    pub(crate) const fn new() -> Self {
        ReadyList {
            head: None,
            tail: None,
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<NonNull<Tcb>> {
        self.head
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// More than one task queued at this priority
    #[inline]
    pub(crate) fn has_peers(&self) -> bool {
        self.head != self.tail
    }

    pub(crate) fn insert_tail(&mut self, tcb: NonNull<Tcb>) {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };
        tcb_ref.next = None;
        tcb_ref.prev = self.tail;

        match self.tail {
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(tcb) },
            None => self.head = Some(tcb),
        }
        self.tail = Some(tcb);
    }

    pub(crate) fn remove(&mut self, tcb: NonNull<Tcb>) {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };

        match tcb_ref.prev {
            Some(prev) => unsafe { (*prev.as_ptr()).next = tcb_ref.next },
            None => self.head = tcb_ref.next,
        }
        match tcb_ref.next {
            Some(next) => unsafe { (*next.as_ptr()).prev = tcb_ref.prev },
            None => self.tail = tcb_ref.prev,
        }

        tcb_ref.prev = None;
        tcb_ref.next = None;
    }

    /// Move the head to the tail; used by the time-slice rotation
    pub(crate) fn rotate(&mut self) {
        if let Some(head) = self.head {
            if self.has_peers() {
                self.remove(head);
                self.insert_tail(head);
            }
        }
    }
}

unsafe impl Send for ReadyList {}
unsafe impl Sync for ReadyList {}
