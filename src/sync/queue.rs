//! Message queue
//!
//! Fixed-capacity ring of fixed-size items, copied in and out by value.
//! Senders block while the ring is full, receivers while it is empty;
//! `send_front` jumps the line for urgent messages.

use core::ptr;

use crate::critical::{self, CsCell};
use crate::error::{OsError, OsResult};
use crate::mem;
use crate::port;
use crate::types::{Deadline, OsTick, NO_WAIT};

struct QueueState {
    buf: *mut u8,
    item_size: usize,
    capacity: usize,
    /// Slot index of the oldest message
    head: usize,
    count: usize,
    tx_waiters: port::WaitList,
    rx_waiters: port::WaitList,
}

impl QueueState {
    #[inline]
    fn slot(&self, index: usize) -> *mut u8 {
        unsafe { self.buf.add((index % self.capacity) * self.item_size) }
    }
}

/// FIFO message queue
pub struct Queue {
    state: CsCell<QueueState>,
}

impl Queue {
    /// Create a queue of `capacity` messages of `item_size` bytes each
    ///
    /// The backing ring is taken from the kernel heap and returned when the
    /// queue is dropped.
    pub fn create(capacity: usize, item_size: usize) -> OsResult<Queue> {
        if capacity == 0 || item_size == 0 {
            return Err(OsError::InvalidParam);
        }
        let bytes = capacity
            .checked_mul(item_size)
            .ok_or(OsError::InvalidParam)?;
        let buf = mem::alloc(bytes);
        if buf.is_null() {
            return Err(OsError::NoMemory);
        }

        Ok(Queue {
            state: CsCell::new(QueueState {
                buf,
                item_size,
                capacity,
                head: 0,
                count: 0,
                tx_waiters: port::WaitList::new(),
                rx_waiters: port::WaitList::new(),
            }),
        })
    }

    /// Append a message at the tail, blocking up to `timeout` while full
    pub fn send(&self, item: &[u8], timeout: OsTick) -> OsResult<()> {
        self.send_at(item, timeout, false)
    }

    /// Insert a message at the head so it is received next
    pub fn send_front(&self, item: &[u8], timeout: OsTick) -> OsResult<()> {
        self.send_at(item, timeout, true)
    }

    fn send_at(&self, item: &[u8], timeout: OsTick, front: bool) -> OsResult<()> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }

        let deadline = Deadline::after(port::tick_now(), timeout);
        loop {
            enum Step {
                Done(bool),
                Wait(port::WaitToken),
            }

            let step = critical::with(|cs| {
                let s = self.state.get(cs);
                if item.len() != s.item_size {
                    return Err(OsError::InvalidParam);
                }
                if s.count < s.capacity {
                    write_item(s, item, front);
                    return Ok(Step::Done(s.rx_waiters.wake_one(cs)));
                }
                if timeout == NO_WAIT {
                    return Err(OsError::Full);
                }
                let remaining = deadline.remaining(port::tick_now());
                if remaining == 0 {
                    return Err(OsError::Timeout);
                }
                Ok(Step::Wait(s.tx_waiters.enqueue_current(cs, remaining)))
            })?;

            match step {
                Step::Done(woken) => {
                    if woken {
                        port::reschedule();
                    }
                    return Ok(());
                }
                Step::Wait(token) => {
                    let _ = port::wait_current(token);
                }
            }
        }
    }

    /// Remove the oldest message into `out`, blocking up to `timeout`
    /// while empty
    pub fn receive(&self, out: &mut [u8], timeout: OsTick) -> OsResult<()> {
        if critical::is_isr_context() {
            return Err(OsError::Error);
        }

        let deadline = Deadline::after(port::tick_now(), timeout);
        loop {
            enum Step {
                Done(bool),
                Wait(port::WaitToken),
            }

            let step = critical::with(|cs| {
                let s = self.state.get(cs);
                if out.len() != s.item_size {
                    return Err(OsError::InvalidParam);
                }
                if s.count > 0 {
                    read_item(s, out);
                    return Ok(Step::Done(s.tx_waiters.wake_one(cs)));
                }
                if timeout == NO_WAIT {
                    return Err(OsError::Empty);
                }
                let remaining = deadline.remaining(port::tick_now());
                if remaining == 0 {
                    return Err(OsError::Timeout);
                }
                Ok(Step::Wait(s.rx_waiters.enqueue_current(cs, remaining)))
            })?;

            match step {
                Step::Done(woken) => {
                    if woken {
                        port::reschedule();
                    }
                    return Ok(());
                }
                Step::Wait(token) => {
                    let _ = port::wait_current(token);
                }
            }
        }
    }

    /// ISR-safe send; fails with [`OsError::Full`] instead of blocking
    ///
    /// A woken receiver pends a dispatch pass for the interrupt's exit.
    pub fn send_from_isr(&self, item: &[u8]) -> OsResult<()> {
        let woken = critical::with(|cs| {
            let s = self.state.get(cs);
            if item.len() != s.item_size {
                return Err(OsError::InvalidParam);
            }
            if s.count == s.capacity {
                return Err(OsError::Full);
            }
            write_item(s, item, false);
            Ok(s.rx_waiters.wake_one(cs))
        })?;
        if woken {
            port::reschedule();
        }
        Ok(())
    }

    /// ISR-safe receive; fails with [`OsError::Empty`] instead of blocking
    ///
    /// A woken sender pends a dispatch pass for the interrupt's exit.
    pub fn receive_from_isr(&self, out: &mut [u8]) -> OsResult<()> {
        let woken = critical::with(|cs| {
            let s = self.state.get(cs);
            if out.len() != s.item_size {
                return Err(OsError::InvalidParam);
            }
            if s.count == 0 {
                return Err(OsError::Empty);
            }
            read_item(s, out);
            Ok(s.tx_waiters.wake_one(cs))
        })?;
        if woken {
            port::reschedule();
        }
        Ok(())
    }

    /// Copy the oldest message into `out` without removing it
    pub fn peek(&self, out: &mut [u8]) -> OsResult<()> {
        critical::with(|cs| {
            let s = self.state.get(cs);
            if out.len() != s.item_size {
                return Err(OsError::InvalidParam);
            }
            if s.count == 0 {
                return Err(OsError::Empty);
            }
            unsafe { ptr::copy_nonoverlapping(s.slot(s.head), out.as_mut_ptr(), s.item_size) };
            Ok(())
        })
    }

    /// Discard all queued messages and release every blocked sender
    pub fn flush(&self) {
        let woke = critical::with(|cs| {
            let s = self.state.get(cs);
            s.head = 0;
            s.count = 0;
            let mut woke = false;
            while s.tx_waiters.wake_one(cs) {
                woke = true;
            }
            woke
        });
        if woke {
            port::reschedule();
        }
    }

    /// Number of messages currently queued
    pub fn len(&self) -> usize {
        critical::with(|cs| self.state.get(cs).count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        critical::with(|cs| {
            let s = self.state.get(cs);
            s.count == s.capacity
        })
    }

    /// Maximum number of messages the queue can hold
    pub fn capacity(&self) -> usize {
        critical::with(|cs| self.state.get(cs).capacity)
    }
}

fn write_item(s: &mut QueueState, item: &[u8], front: bool) {
    let dst = if front {
        s.head = (s.head + s.capacity - 1) % s.capacity;
        s.slot(s.head)
    } else {
        s.slot(s.head + s.count)
    };
    unsafe { ptr::copy_nonoverlapping(item.as_ptr(), dst, s.item_size) };
    s.count += 1;
}

fn read_item(s: &mut QueueState, out: &mut [u8]) {
    unsafe { ptr::copy_nonoverlapping(s.slot(s.head), out.as_mut_ptr(), s.item_size) };
    s.head = (s.head + 1) % s.capacity;
    s.count -= 1;
}

impl Drop for Queue {
    fn drop(&mut self) {
        let buf = critical::with(|cs| {
            let s = self.state.get(cs);
            let buf = s.buf;
            s.buf = ptr::null_mut();
            buf
        });
        mem::free(buf);
    }
}
