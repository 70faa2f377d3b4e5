//! First-fit free-list heap
//!
//! Blocks carry a header with the block size; the free list is kept in
//! address order so neighbouring free blocks coalesce on release. Every
//! allocation is preceded by a back-offset word, so `free` recovers the
//! header regardless of alignment padding between header and payload.
//!
//! The structure itself is not synchronized; [`crate::mem`] wraps it in a
//! `CsCell` and performs every mutation inside one critical section.

use core::ptr;

/// Base alignment of every allocation
pub(crate) const ALIGN: usize = 8;

const WORD: usize = core::mem::size_of::<usize>();
const ALLOC_BIT: usize = 1 << (usize::BITS - 1);

#[repr(C)]
struct BlockHdr {
    next_free: *mut BlockHdr,
    /// Block size in bytes including this header; ALLOC_BIT marks in-use
    size: usize,
}

/// Header size rounded up to the base alignment
const HDR: usize = (core::mem::size_of::<BlockHdr>() + ALIGN - 1) & !(ALIGN - 1);

/// Smallest block worth splitting off
const MIN_BLOCK: usize = HDR + 2 * ALIGN;

#[inline(always)]
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

pub(crate) struct Heap {
    /// Address-ordered singly linked free list
    free_list: *mut BlockHdr,
    region_start: usize,
    region_end: usize,
    total: usize,
    free_bytes: usize,
    min_free: usize,
}

unsafe impl Send for Heap {}

impl Heap {
    pub(crate) const fn new() -> Self {
        Heap {
            free_list: ptr::null_mut(),
            region_start: 0,
            region_end: 0,
            total: 0,
            free_bytes: 0,
            min_free: 0,
        }
    }

    /// Take ownership of `[start, start + len)` as the heap region
    ///
    /// # Safety
    /// The region must be valid for reads and writes for the lifetime of the
    /// heap and not aliased by anything else.
    pub(crate) unsafe fn init(&mut self, start: *mut u8, len: usize) {
        let lo = align_up(start as usize, ALIGN);
        let hi = (start as usize + len) & !(ALIGN - 1);
        debug_assert!(hi > lo + MIN_BLOCK);

        let first = lo as *mut BlockHdr;
        unsafe {
            (*first).next_free = ptr::null_mut();
            (*first).size = hi - lo;
        }

        self.free_list = first;
        self.region_start = lo;
        self.region_end = hi;
        self.total = hi - lo;
        self.free_bytes = hi - lo;
        self.min_free = hi - lo;
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub(crate) fn min_free(&self) -> usize {
        self.min_free
    }

    /// Allocate `size` bytes whose address is a multiple of `align`
    ///
    /// `align` must be a power of two not below [`ALIGN`]. Returns null when
    /// no free block can satisfy the request.
    pub(crate) fn alloc(&mut self, size: usize, align: usize) -> *mut u8 {
        // The size guard also keeps all arithmetic below overflow-free:
        // `size` fits the region, and addresses only grow by header-and
        // -padding amounts bounded by the region end
        if size == 0 || size > self.total {
            return ptr::null_mut();
        }
        debug_assert!(align.is_power_of_two() && align >= ALIGN);

        let mut prev: *mut BlockHdr = ptr::null_mut();
        let mut cur = self.free_list;

        while !cur.is_null() {
            let base = cur as usize;
            let block_size = unsafe { (*cur).size };

            // Blocks are address-ordered, so an overflowing round-up here
            // overflows for every later block as well
            let Some(user) = (base + HDR + WORD).checked_add(align - 1) else {
                return ptr::null_mut();
            };
            let user = user & !(align - 1);
            if user - base >= block_size {
                prev = cur;
                cur = unsafe { (*cur).next_free };
                continue;
            }
            let needed = align_up(user + size - base, ALIGN);

            if needed <= block_size {
                let next = unsafe { (*cur).next_free };
                let remainder = block_size - needed;

                let consumed = if remainder >= MIN_BLOCK {
                    // Split the tail off as a new free block
                    let tail = (base + needed) as *mut BlockHdr;
                    unsafe {
                        (*tail).next_free = next;
                        (*tail).size = remainder;
                    }
                    self.unlink(prev, tail);
                    needed
                } else {
                    self.unlink(prev, next);
                    block_size
                };

                unsafe {
                    (*cur).next_free = ptr::null_mut();
                    (*cur).size = consumed | ALLOC_BIT;
                    // Back-offset from the end of the header to the word
                    // that precedes the payload
                    *((user - WORD) as *mut usize) = user - WORD - (base + HDR);
                }

                self.free_bytes -= consumed;
                if self.free_bytes < self.min_free {
                    self.min_free = self.free_bytes;
                }
                return user as *mut u8;
            }

            prev = cur;
            cur = unsafe { (*cur).next_free };
        }

        ptr::null_mut()
    }

    /// Release a block previously returned by [`Heap::alloc`]
    ///
    /// Freeing null is a safe no-op.
    pub(crate) fn free(&mut self, ptr_in: *mut u8) {
        if ptr_in.is_null() {
            return;
        }

        let hdr = self.hdr_of(ptr_in);
        let base = hdr as usize;
        debug_assert!(base >= self.region_start && base < self.region_end);

        let size = unsafe { (*hdr).size };
        debug_assert!(size & ALLOC_BIT != 0, "double free or corrupted block");
        let size = size & !ALLOC_BIT;

        self.free_bytes += size;

        // Find the address-ordered insertion point
        let mut prev: *mut BlockHdr = ptr::null_mut();
        let mut next = self.free_list;
        while !next.is_null() && (next as usize) < base {
            prev = next;
            next = unsafe { (*next).next_free };
        }

        let mut start = base;
        let mut total = size;

        // Coalesce with the preceding free block
        if !prev.is_null() && prev as usize + unsafe { (*prev).size } == base {
            start = prev as usize;
            total += unsafe { (*prev).size };
            prev = self.prev_of(prev);
        }
        // Coalesce with the following free block
        if !next.is_null() && start + total == next as usize {
            total += unsafe { (*next).size };
            next = unsafe { (*next).next_free };
        }

        let merged = start as *mut BlockHdr;
        unsafe {
            (*merged).size = total;
            (*merged).next_free = next;
        }
        self.unlink(prev, merged);
    }

    /// Payload capacity of an allocated block
    pub(crate) fn usable_size(&self, ptr_in: *mut u8) -> usize {
        let hdr = self.hdr_of(ptr_in);
        let size = unsafe { (*hdr).size } & !ALLOC_BIT;
        hdr as usize + size - ptr_in as usize
    }

    /// Recover the block header from a payload pointer
    fn hdr_of(&self, ptr_in: *mut u8) -> *mut BlockHdr {
        let user = ptr_in as usize;
        let back_off = unsafe { *((user - WORD) as *const usize) };
        (user - WORD - back_off - HDR) as *mut BlockHdr
    }

    /// Point `prev` (or the list head) at `block`
    fn unlink(&mut self, prev: *mut BlockHdr, block: *mut BlockHdr) {
        if prev.is_null() {
            self.free_list = block;
        } else {
            unsafe { (*prev).next_free = block };
        }
    }

    /// Free-list predecessor of `block`, null if it is the head
    fn prev_of(&self, block: *mut BlockHdr) -> *mut BlockHdr {
        let mut prev: *mut BlockHdr = ptr::null_mut();
        let mut cur = self.free_list;
        while !cur.is_null() && cur != block {
            prev = cur;
            cur = unsafe { (*cur).next_free };
        }
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Region([u8; 4096]);

    fn heap_with_region(region: &mut Region) -> Heap {
        let mut heap = Heap::new();
        unsafe { heap.init(region.0.as_mut_ptr(), region.0.len()) };
        heap
    }

    #[test]
    fn alloc_free_roundtrip_restores_free_bytes() {
        let mut region = Region([0; 4096]);
        let mut heap = heap_with_region(&mut region);
        let before = heap.free_bytes();

        let p = heap.alloc(100, ALIGN);
        assert!(!p.is_null());
        assert!(heap.free_bytes() < before);

        heap.free(p);
        assert_eq!(heap.free_bytes(), before);
    }

    #[test]
    fn payload_is_writable_and_stable() {
        let mut region = Region([0; 4096]);
        let mut heap = heap_with_region(&mut region);

        let p = heap.alloc(100, ALIGN);
        assert!(!p.is_null());
        for i in 0..100u8 {
            unsafe { *p.add(i as usize) = i };
        }
        for i in 0..100u8 {
            assert_eq!(unsafe { *p.add(i as usize) }, i);
        }
        heap.free(p);
    }

    #[test]
    fn aligned_alloc_returns_aligned_pointer() {
        let mut region = Region([0; 4096]);
        let mut heap = heap_with_region(&mut region);
        let before = heap.free_bytes();

        for align in [8usize, 16, 32, 64, 128] {
            let p = heap.alloc(100, align);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "align {}", align);
            heap.free(p);
        }
        assert_eq!(heap.free_bytes(), before);
    }

    #[test]
    fn coalescing_allows_reuse_of_whole_region() {
        let mut region = Region([0; 4096]);
        let mut heap = heap_with_region(&mut region);

        let a = heap.alloc(256, ALIGN);
        let b = heap.alloc(256, ALIGN);
        let c = heap.alloc(256, ALIGN);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        // Free out of order so both directions of merging run
        heap.free(b);
        heap.free(a);
        heap.free(c);

        // After full coalescing one large block must satisfy this
        let big = heap.alloc(3000, ALIGN);
        assert!(!big.is_null());
        heap.free(big);
    }

    #[test]
    fn watermark_is_monotonic_and_bounded_by_free() {
        let mut region = Region([0; 4096]);
        let mut heap = heap_with_region(&mut region);

        let mut lowest = heap.min_free();
        let mut ptrs = [core::ptr::null_mut::<u8>(); 8];
        for p in ptrs.iter_mut() {
            *p = heap.alloc(128, ALIGN);
            assert!(!p.is_null());
            assert!(heap.min_free() <= lowest);
            assert!(heap.min_free() <= heap.free_bytes());
            lowest = heap.min_free();
        }
        for p in ptrs {
            heap.free(p);
            // Frees never raise the watermark
            assert_eq!(heap.min_free(), lowest);
            assert!(heap.min_free() <= heap.free_bytes());
        }
    }

    #[test]
    fn oversized_and_overflowing_requests_return_null() {
        let mut region = Region([0; 4096]);
        let mut heap = heap_with_region(&mut region);

        assert!(heap.alloc(usize::MAX, ALIGN).is_null());
        assert!(heap.alloc(usize::MAX - 7, ALIGN).is_null());
        assert!(heap.alloc(heap.total() + 1, ALIGN).is_null());
        assert!(heap.alloc(16, 1usize << (usize::BITS - 2)).is_null());

        // Heap must still be usable afterwards
        let p = heap.alloc(64, ALIGN);
        assert!(!p.is_null());
        heap.free(p);
    }

    #[test]
    fn exhaustion_returns_null_not_panic() {
        let mut region = Region([0; 4096]);
        let mut heap = heap_with_region(&mut region);

        assert!(heap.alloc(100_000, ALIGN).is_null());
        // Heap must still be usable afterwards
        let p = heap.alloc(64, ALIGN);
        assert!(!p.is_null());
        heap.free(p);
    }

    #[test]
    fn usable_size_covers_request() {
        let mut region = Region([0; 4096]);
        let mut heap = heap_with_region(&mut region);

        let p = heap.alloc(100, ALIGN);
        assert!(heap.usable_size(p) >= 100);
        heap.free(p);
    }
}
