//! Kernel heap allocator.
//! First-fit over the virtual range `[KHEAP_BEGIN, KHEAP_END)`. Every
//! chunk is prefixed by a packed 4-byte header `{size:31, used:1}` where
//! `size` includes the header itself; chunks tile the region contiguously
//! from the base up to the heap top, which grows 4 MiB at a time by
//! mapping fresh frames through the kernel page directory.
//!
//! The allocator also backs Rust's `alloc` crate via `GlobalAlloc`, so
//! `Box`/`Vec`/`BTreeMap` all land in this heap. Mutators disable
//! interrupts for their duration; the structure itself is single-threaded.

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use crate::interrupts::without_interrupts;
use crate::memory::frame::frame_map;
use crate::memory::paging::{kernel_page_directory, PageFlags};
use crate::memory::{page_addr, KHEAP_BEGIN, KHEAP_END, PAGE_SIZE_4M};

/// Size of a chunk header; also the default (and minimum) alignment.
pub const HEADER_SIZE: usize = 4;

const USED_BIT: u32 = 1 << 31;
const SIZE_MASK: u32 = !USED_BIT;

/// Packed chunk header. Bit 31 is the used flag; bits 0..31 hold the
/// total chunk size including this header. The stored size is not
/// necessarily the requested size (it may be rounded up).
#[repr(C)]
struct ChunkHeader(u32);

impl ChunkHeader {
    fn size(&self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    fn used(&self) -> bool {
        self.0 & USED_BIT != 0
    }

    fn set(&mut self, size: usize, used: bool) {
        debug_assert!(size as u32 & USED_BIT == 0, "chunk size overflows 31 bits");
        self.0 = size as u32 | if used { USED_BIT } else { 0 };
    }

    fn set_used(&mut self, used: bool) {
        if used {
            self.0 |= USED_BIT;
        } else {
            self.0 &= !USED_BIT;
        }
    }

    /// Header of the chunk owning the user pointer `ptr`.
    unsafe fn from_pointer(ptr: *mut u8) -> *mut Self {
        ptr.sub(HEADER_SIZE).cast()
    }

    /// Address one past this chunk (the next header, or the heap top).
    unsafe fn next(this: *mut Self, offset: usize) -> *mut Self {
        this.cast::<u8>().add(offset).cast()
    }
}

const _: () = assert!(core::mem::size_of::<ChunkHeader>() == HEADER_SIZE);

/// Grow callback: extend the mapped heap past `heap_top` by at least
/// `increment` bytes, returning the new top. `None` means the virtual or
/// physical space is exhausted.
type SbrkFn = fn(increment: usize, heap_top: usize) -> Option<usize>;

/// The first-fit allocator state.
pub struct Allocator {
    heap_start: usize,
    heap_end: usize,
    heap_top: usize,
    heap_used: usize,
    sbrk: Option<SbrkFn>,
}

impl Allocator {
    const fn empty() -> Self {
        Self {
            heap_start: 0,
            heap_end: 0,
            heap_top: 0,
            heap_used: 0,
            sbrk: None,
        }
    }

    /// Initialize over `[heap_start, heap_end)` with a grow callback.
    /// Requests the first mapping immediately and formats it as a single
    /// free chunk.
    fn init(&mut self, heap_start: usize, heap_end: usize, sbrk: SbrkFn) {
        assert!(heap_end > heap_start, "degenerate heap range");

        self.heap_start = heap_start;
        self.heap_end = heap_end;
        self.heap_used = 0;
        self.sbrk = Some(sbrk);

        let top = sbrk(1, heap_start).unwrap_or_else(|| panic!("no memory for the initial heap"));
        assert!(top > heap_start, "sbrk did not grow the heap");
        self.heap_top = top;

        // SAFETY:
        // The range [heap_start, top) was just mapped by sbrk.
        unsafe {
            (*(heap_start as *mut ChunkHeader)).set(top - heap_start, false);
        }
    }

    fn grow(&mut self, needed: usize) {
        let sbrk = self.sbrk.unwrap_or_else(|| panic!("heap not initialized"));
        let old_top = self.heap_top;
        let new_top = sbrk(needed, old_top).unwrap_or_else(|| panic!("kernel heap exhausted"));
        self.heap_top = new_top;

        // SAFETY:
        // [old_top, new_top) was just mapped; formatting it as one free
        // chunk keeps the heap contiguous.
        unsafe {
            (*(old_top as *mut ChunkHeader)).set(new_top - old_top, false);
        }
    }

    /// Whether the free chunk at `chunk` can serve `realsize` bytes at
    /// `alignment`. On success `adjust` holds the byte count by which the
    /// chunk must be split in front to align its payload.
    ///
    /// A chunk is usable if it is free, large enough, and either its
    /// payload is naturally aligned with a leftover of zero or at least a
    /// header, or it can be split into a free unaligned head of at least
    /// a header and an aligned remainder.
    unsafe fn can_use_chunk(
        chunk: *mut ChunkHeader,
        realsize: usize,
        alignment: usize,
        adjust: &mut usize,
    ) -> bool {
        let size = (*chunk).size();
        if (*chunk).used() || size < realsize {
            return false;
        }

        let payload = chunk as usize + HEADER_SIZE;
        *adjust = payload.next_multiple_of(alignment) - payload;
        if *adjust == 0 {
            let leftover = size - realsize;
            return leftover == 0 || leftover >= HEADER_SIZE;
        }

        // The unaligned head must itself be able to carry a header, and
        // the remainder must still fit the request.
        *adjust >= HEADER_SIZE && size >= realsize + *adjust
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two).
    /// Returns null for a zero-size request.
    unsafe fn malloc(&mut self, size: usize, alignment: usize) -> *mut u8 {
        assert!(
            alignment.is_power_of_two(),
            "alignment must be a power of two"
        );
        if size == 0 {
            return core::ptr::null_mut();
        }

        // Chunk sizes are kept a multiple of the header size so every
        // header stays word-aligned no matter the request sizes.
        let realsize = (HEADER_SIZE + size).next_multiple_of(HEADER_SIZE);
        let mut chunk = self.heap_start as *mut ChunkHeader;
        let mut adjust = 0;

        while !Self::can_use_chunk(chunk, realsize, alignment, &mut adjust) {
            assert!((*chunk).size() != 0, "corrupted chunk with zero size");

            chunk = ChunkHeader::next(chunk, (*chunk).size());
            assert!(
                chunk as usize <= self.heap_top,
                "walked past the heap top; chunk chain corrupted"
            );
            if chunk as usize == self.heap_top {
                // Reached the end of the mapped heap; extend and retry
                // from the freshly formatted chunk.
                self.grow(realsize);
            }
        }

        if adjust != 0 {
            // Split a free unaligned head off the front so the payload of
            // the remainder lands on the requested alignment.
            let aligned = ChunkHeader::next(chunk, adjust);
            (*aligned).set((*chunk).size() - adjust, false);
            (*chunk).set(adjust, false);
            chunk = aligned;
        }

        if (*chunk).size() == realsize {
            (*chunk).set_used(true);
        } else {
            // Split off a free trailing chunk.
            let rest = ChunkHeader::next(chunk, realsize);
            (*rest).set((*chunk).size() - realsize, false);
            debug_assert!((*rest).size() >= HEADER_SIZE, "split produced a runt chunk");
            (*chunk).set(realsize, true);
        }

        self.heap_used += realsize;
        let ptr = chunk.cast::<u8>().add(HEADER_SIZE);
        debug_assert!(ptr as usize % alignment == 0, "returning unaligned pointer");
        ptr
    }

    /// Release the chunk owning `ptr` and coalesce every immediately
    /// following free chunk into it.
    unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        assert!(
            self.heap_start < ptr as usize && (ptr as usize) < self.heap_top,
            "free of a pointer outside the heap"
        );

        let chunk = ChunkHeader::from_pointer(ptr);
        (*chunk).set_used(false);

        assert!(
            self.heap_used >= (*chunk).size(),
            "freeing more memory than was recorded"
        );
        self.heap_used -= (*chunk).size();

        loop {
            let next = ChunkHeader::next(chunk, (*chunk).size());
            if next as usize >= self.heap_top || (*next).used() {
                break;
            }
            (*chunk).set((*chunk).size() + (*next).size(), false);
        }
    }

    /// Resize the allocation at `ptr` to `size` bytes.
    ///
    /// Same stored size: `ptr` is returned unchanged. A shrink that
    /// leaves room for a trailing chunk of at least a header splits in
    /// place. Everything else allocates, copies, frees. A `size` of zero
    /// returns null without freeing `ptr`.
    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        assert!(
            self.heap_start <= ptr as usize && (ptr as usize) < self.heap_end,
            "realloc of a pointer outside the heap"
        );

        if size == 0 {
            return core::ptr::null_mut();
        }

        let chunk = ChunkHeader::from_pointer(ptr);
        assert!((*chunk).used(), "realloc of a freed pointer");

        let realsize = (HEADER_SIZE + size).next_multiple_of(HEADER_SIZE);
        if (*chunk).size() == realsize {
            return ptr;
        }

        if (*chunk).size() > realsize && (*chunk).size() - realsize >= HEADER_SIZE {
            // Shrink in place, splitting off a free tail.
            let tail = ChunkHeader::next(chunk, realsize);
            (*tail).set((*chunk).size() - realsize, false);
            self.heap_used -= (*tail).size();
            (*chunk).set(realsize, true);
            return ptr;
        }

        let old_payload = (*chunk).size() - HEADER_SIZE;
        let new_ptr = self.malloc(size, HEADER_SIZE);
        core::ptr::copy_nonoverlapping(ptr, new_ptr, old_payload.min(size));
        self.free(ptr);
        new_ptr
    }

    /// Allocate `count * size` zero-filled bytes.
    unsafe fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = count
            .checked_mul(size)
            .unwrap_or_else(|| panic!("calloc size overflow"));
        let ptr = self.malloc(total, HEADER_SIZE);
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, total);
        }
        ptr
    }

    /// Total bytes currently allocated, headers included.
    fn used(&self) -> usize {
        self.heap_used
    }
}

/// Interrupt-gated wrapper around the allocator, also serving as the
/// crate's global allocator.
pub struct LockedAllocator(Mutex<Allocator>);

#[global_allocator]
static ALLOCATOR: LockedAllocator = LockedAllocator(Mutex::new(Allocator::empty()));

// SAFETY:
// The inner allocator hands out non-overlapping chunks inside the mapped
// heap and is serialized by the interrupt-gated mutex.
unsafe impl GlobalAlloc for LockedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        without_interrupts(|| {
            self.0
                .lock()
                .malloc(layout.size(), layout.align().max(HEADER_SIZE))
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        without_interrupts(|| self.0.lock().free(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= HEADER_SIZE {
            return without_interrupts(|| self.0.lock().realloc(ptr, new_size));
        }

        // The in-place path cannot preserve over-aligned payloads; fall
        // back to allocate + copy + free.
        let new_ptr = without_interrupts(|| self.0.lock().malloc(new_size, layout.align()));
        if !new_ptr.is_null() {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            without_interrupts(|| self.0.lock().free(ptr));
        }
        new_ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= HEADER_SIZE {
            return without_interrupts(|| self.0.lock().calloc(1, layout.size()));
        }
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }
}

/// Map more frames for the heap, at least `increment` bytes past
/// `heap_top`, in whole 4 MiB steps.
fn ksbrk(increment: usize, heap_top: usize) -> Option<usize> {
    let pages = increment.div_ceil(PAGE_SIZE_4M).max(1);
    if heap_top + pages * PAGE_SIZE_4M > KHEAP_END as usize {
        // No virtual space left for the kernel heap.
        return None;
    }

    let mut top = heap_top;
    for _ in 0..pages {
        // Frame 0 is skipped: multiboot data lives there during boot.
        let frame = frame_map().lock().next_free(1).ok()?;
        kernel_page_directory()
            .add_page(top as u32, page_addr(frame), PageFlags::empty(), false)
            .ok()?;
        top += PAGE_SIZE_4M;
    }

    Some(top)
}

/// Bring up the kernel heap over `[KHEAP_BEGIN, KHEAP_END)`.
pub fn init_heap() {
    without_interrupts(|| {
        ALLOCATOR
            .0
            .lock()
            .init(KHEAP_BEGIN as usize, KHEAP_END as usize, ksbrk);
    });
}

/// Allocate `size` bytes with the default 4-byte alignment.
#[must_use]
pub fn kmalloc(size: usize) -> *mut u8 {
    kmalloc_aligned(size, HEADER_SIZE)
}

/// Allocate `size` bytes aligned to `alignment` (a power of two).
#[must_use]
pub fn kmalloc_aligned(size: usize, alignment: usize) -> *mut u8 {
    // SAFETY:
    // The allocator only touches memory it mapped itself.
    without_interrupts(|| unsafe { ALLOCATOR.0.lock().malloc(size, alignment) })
}

/// Free an allocation returned by one of the `kmalloc` flavors.
///
/// # Safety
/// `ptr` must be null or a live allocation from this heap.
pub unsafe fn kfree(ptr: *mut u8) {
    without_interrupts(|| ALLOCATOR.0.lock().free(ptr));
}

/// Resize an allocation. See [`Allocator::realloc`] for the contract.
///
/// # Safety
/// `ptr` must be a live allocation from this heap.
#[must_use]
pub unsafe fn krealloc(ptr: *mut u8, size: usize) -> *mut u8 {
    without_interrupts(|| ALLOCATOR.0.lock().realloc(ptr, size))
}

/// Allocate `count * size` zeroed bytes.
#[must_use]
pub fn kcalloc(count: usize, size: usize) -> *mut u8 {
    // SAFETY:
    // The allocator only touches memory it mapped itself.
    without_interrupts(|| unsafe { ALLOCATOR.0.lock().calloc(count, size) })
}

/// Bytes currently allocated (headers included). Zero on a clean
/// shutdown.
#[must_use]
pub fn heap_used() -> usize {
    without_interrupts(|| ALLOCATOR.0.lock().used())
}

#[cfg(test)]
mod tests {
    use super::{ChunkHeader, HEADER_SIZE};

    #[test_case]
    fn test_chunk_header_packs_size_and_used_bit() {
        let mut header = ChunkHeader(0);
        header.set(1234, true);
        assert!(header.used(), "Used bit should be set.");
        assert_eq!(header.size(), 1234, "Size should round-trip.");

        header.set_used(false);
        assert!(!header.used(), "Used bit should be cleared.");
        assert_eq!(header.size(), 1234, "Size must survive the flag flip.");
    }

    #[test_case]
    fn test_header_size_is_minimum_chunk_size() {
        assert_eq!(HEADER_SIZE, core::mem::size_of::<ChunkHeader>());
    }
}
