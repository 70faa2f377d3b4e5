//! Thread-safe heap
//!
//! A process-wide singleton allocator over a statically reserved region.
//! Every mutating call runs inside one critical section, so tasks and ISRs
//! observe a consistent heap; the minimum-free watermark is updated in that
//! same section and can never miss a dip.
//!
//! Policy corners: `alloc(0)` returns null without error, `free(null)` is a
//! no-op, `realloc(null, n)` behaves as `alloc(n)`, `realloc(p, 0)` frees
//! `p` and returns null. Allocation failure returns null, never aborts.

mod heap;

use core::cell::UnsafeCell;
use core::ptr;

use portable_atomic::{AtomicBool, Ordering};

use crate::config::CFG_HEAP_SIZE;
use crate::critical::{self, CsCell};
use crate::error::{OsError, OsResult};

use heap::{Heap, ALIGN};

/// Live heap statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemStats {
    /// Managed region size in bytes
    pub total: usize,
    /// Bytes currently free
    pub free: usize,
    /// Lowest free value ever observed since init
    pub min_free: usize,
}

#[repr(align(8))]
struct HeapRegion(UnsafeCell<[u8; CFG_HEAP_SIZE]>);

unsafe impl Sync for HeapRegion {}

static REGION: HeapRegion = HeapRegion(UnsafeCell::new([0; CFG_HEAP_SIZE]));

static HEAP: CsCell<Heap> = CsCell::new(Heap::new());
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize the allocator over the static region, once
pub(crate) fn init() -> OsResult<()> {
    critical::with(|cs| {
        if INITIALIZED.load(Ordering::Acquire) {
            return Err(OsError::AlreadyInit);
        }
        unsafe {
            HEAP.get(cs).init(REGION.0.get() as *mut u8, CFG_HEAP_SIZE);
        }
        INITIALIZED.store(true, Ordering::Release);
        Ok(())
    })
}

#[inline]
fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Allocate `size` bytes
///
/// Returns null when `size` is zero, the allocator is uninitialized, or no
/// free block can satisfy the request.
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 || !is_initialized() {
        return ptr::null_mut();
    }
    critical::with(|cs| HEAP.get(cs).alloc(size, ALIGN))
}

/// Allocate `size` bytes at a multiple of `align`
///
/// `align` must be a power of two; anything else returns null.
pub fn alloc_aligned(align: usize, size: usize) -> *mut u8 {
    if size == 0 || align == 0 || !align.is_power_of_two() || !is_initialized() {
        return ptr::null_mut();
    }
    let align = align.max(ALIGN);
    critical::with(|cs| HEAP.get(cs).alloc(size, align))
}

/// Allocate `count * size` zero-filled bytes
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    let Some(bytes) = count.checked_mul(size) else {
        return ptr::null_mut();
    };
    let p = alloc(bytes);
    if !p.is_null() {
        unsafe { ptr::write_bytes(p, 0, bytes) };
    }
    p
}

/// Resize an allocation, preserving its contents
pub fn realloc(old: *mut u8, size: usize) -> *mut u8 {
    if old.is_null() {
        return alloc(size);
    }
    if size == 0 {
        free(old);
        return ptr::null_mut();
    }
    if !is_initialized() {
        return ptr::null_mut();
    }

    critical::with(|cs| {
        let heap = HEAP.get(cs);
        let usable = heap.usable_size(old);
        if size <= usable {
            return old;
        }
        let new = heap.alloc(size, ALIGN);
        if !new.is_null() {
            unsafe { ptr::copy_nonoverlapping(old, new, usable) };
            heap.free(old);
        }
        new
    })
}

/// Release an allocation; `free(null)` is a safe no-op
pub fn free(ptr_in: *mut u8) {
    if ptr_in.is_null() || !is_initialized() {
        return;
    }
    critical::with(|cs| HEAP.get(cs).free(ptr_in));
}

/// Current heap statistics
pub fn stats() -> MemStats {
    if !is_initialized() {
        return MemStats {
            total: 0,
            free: 0,
            min_free: 0,
        };
    }
    critical::with(|cs| {
        let heap = HEAP.get(cs);
        MemStats {
            total: heap.total(),
            free: heap.free_bytes(),
            min_free: heap.min_free(),
        }
    })
}

/// `GlobalAlloc` adapter over the OSAL heap
///
/// Lets applications route `alloc::boxed::Box` and friends through the same
/// region: `#[global_allocator] static A: osal::mem::OsAllocator = ...;`
pub struct OsAllocator;

unsafe impl core::alloc::GlobalAlloc for OsAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        alloc_aligned(layout.align(), layout.size())
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, _layout: core::alloc::Layout) {
        free(ptr_in)
    }
}
