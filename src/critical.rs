//! Critical section handling
//!
//! Safe critical section primitives protecting all shared kernel state.
//! Nesting is handled by the `critical-section` restore state: only the
//! outermost exit re-enables interrupts. This primitive cannot fail; it is
//! the substrate the other components use to fail safely.

use core::cell::UnsafeCell;
use core::marker::PhantomData;

use critical_section::RestoreState;

/// RAII guard for critical sections
///
/// Creating the guard masks interrupts and captures the prior mask state;
/// dropping it restores exactly that state.
pub struct CriticalSection {
    restore: RestoreState,
    // Restore must happen on the acquiring context
    _not_send: PhantomData<*mut ()>,
}

impl CriticalSection {
    /// Enter a critical section, saving the prior interrupt-mask state
    #[inline(always)]
    pub fn enter() -> Self {
        let restore = unsafe { critical_section::acquire() };
        CriticalSection {
            restore,
            _not_send: PhantomData,
        }
    }
}

impl Drop for CriticalSection {
    #[inline(always)]
    fn drop(&mut self) {
        unsafe { critical_section::release(self.restore) };
    }
}

/// Execute a closure with interrupts disabled
///
/// The closure receives a reference to the guard, which unlocks
/// [`CsCell`]-protected data.
#[inline]
pub fn with<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let cs = CriticalSection::enter();
    f(&cs)
}

/// A cell that can only be accessed within a critical section
pub struct CsCell<T>(UnsafeCell<T>);

unsafe impl<T> Sync for CsCell<T> {}
unsafe impl<T> Send for CsCell<T> {}

impl<T> CsCell<T> {
    /// Create a new CsCell
    #[inline(always)]
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Get a mutable reference to the inner value
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub fn get(&self, _cs: &CriticalSection) -> &mut T {
        unsafe { &mut *self.0.get() }
    }

    /// Get a mutable reference without requiring a CriticalSection guard
    ///
    /// # Safety
    /// The caller must guarantee exclusive access for the lifetime of the
    /// returned reference.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub unsafe fn get_unchecked(&self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }

    /// Get a raw pointer to the inner value
    #[inline(always)]
    pub const fn as_ptr(&self) -> *mut T {
        self.0.get()
    }
}

// ============ ISR context detection ============

/// Check if currently executing in an ISR context
#[inline]
pub fn is_isr_context() -> bool {
    #[cfg(all(target_arch = "arm", not(feature = "hosted")))]
    {
        let ipsr: u32;
        unsafe {
            core::arch::asm!(
                "mrs {}, IPSR",
                out(reg) ipsr,
                options(nomem, nostack, preserves_flags)
            );
        }
        ipsr != 0 || crate::kernel::isr_nesting() > 0
    }

    #[cfg(feature = "hosted")]
    {
        ISR_CONTEXT.with(|c| c.get())
    }

    #[cfg(all(not(target_arch = "arm"), not(feature = "hosted")))]
    {
        crate::kernel::isr_nesting() > 0
    }
}

#[cfg(feature = "hosted")]
std::thread_local! {
    static ISR_CONTEXT: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Mark the calling thread as being in ISR context (hosted backend only)
///
/// Lets host-side tests exercise the `*_from_isr` contract.
#[cfg(feature = "hosted")]
pub fn enter_isr_for_test() {
    ISR_CONTEXT.with(|c| c.set(true));
}

/// Clear the simulated ISR context (hosted backend only)
#[cfg(feature = "hosted")]
pub fn exit_isr_for_test() {
    ISR_CONTEXT.with(|c| c.set(false));
}
