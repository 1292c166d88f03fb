//! Tests for the first-fit kernel heap.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::panic::PanicInfo;

use opal_os::allocator::{heap_used, kcalloc, kfree, kmalloc, kmalloc_aligned, krealloc};
use opal_os::multiboot::BootInfo;

#[no_mangle]
pub extern "C" fn kmain(magic: u32, info: *const BootInfo) -> ! {
    // SAFETY:
    // The boot stub forwards the multiboot handoff registers.
    let boot_info = unsafe { BootInfo::read(magic, info) };
    opal_os::init(&boot_info);

    test_main();
    opal_os::hlt_loop()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    opal_os::test_panic_handler(info)
}

/// Total chunk size of a live allocation, read from its header.
fn chunk_size(ptr: *mut u8) -> usize {
    // SAFETY:
    // The header sits in the four bytes before every payload returned by
    // the allocator.
    let header = unsafe { ptr.sub(4).cast::<u32>().read() };
    (header & 0x7FFF_FFFF) as usize
}

/// Split and coalesce: three small allocations, freed out of order,
/// return the accounting to its starting point and merge back together.
#[test_case]
fn test_when_freeing_out_of_order_then_chunks_coalesce() {
    let base = heap_used();

    let p1 = kmalloc(8);
    let p2 = kmalloc(8);
    let p3 = kmalloc(8);
    assert!(!p1.is_null() && !p2.is_null() && !p3.is_null());

    // A quiet heap hands out the tail, so the three chunks are adjacent.
    assert_eq!(p2 as usize, p1 as usize + 12, "Chunks should be adjacent.");
    assert_eq!(p3 as usize, p2 as usize + 12, "Chunks should be adjacent.");
    assert_eq!(
        heap_used() - base,
        3 * (8 + 4),
        "Each allocation accounts for payload plus header.",
    );

    // SAFETY: freeing live allocations from just above.
    unsafe {
        kfree(p2);
        kfree(p1);
        kfree(p3);
    }
    assert_eq!(heap_used(), base, "Balanced frees must restore heap_used.");

    // Freeing p1 after p2 merged the two; forward coalescing cannot see
    // past the then-still-live p3.
    assert!(
        chunk_size(p1) >= 24,
        "p1 and p2 should have merged into one free chunk.",
    );

    // Same dance freeing back-to-front: the first chunk swallows all
    // three allocations (and the heap tail behind them).
    let q1 = kmalloc(8);
    let q2 = kmalloc(8);
    let q3 = kmalloc(8);
    // SAFETY: freeing live allocations from just above.
    unsafe {
        kfree(q3);
        kfree(q2);
        kfree(q1);
    }
    assert_eq!(heap_used(), base);
    assert!(
        chunk_size(q1) >= 36,
        "Freeing back-to-front should merge all three chunks.",
    );
}

/// Aligned allocation splits an unaligned head off and still returns an
/// exactly accounted chunk.
#[test_case]
fn test_when_requesting_page_alignment_then_pointer_is_aligned() {
    let base = heap_used();

    let p = kmalloc_aligned(32, 4096);
    assert!(!p.is_null());
    assert_eq!(p as usize % 4096, 0, "Pointer must honor the alignment.");
    assert_eq!(
        heap_used() - base,
        32 + 4,
        "Only the returned chunk is accounted; the split head stays free.",
    );

    // SAFETY: freeing the live allocation from just above.
    unsafe {
        kfree(p);
    }
    assert_eq!(heap_used(), base);
}

/// Every power-of-two alignment yields a correctly aligned pointer.
#[test_case]
fn test_when_varying_alignment_then_all_pointers_are_aligned() {
    for shift in 2..=12 {
        let alignment = 1_usize << shift;
        let p = kmalloc_aligned(24, alignment);
        assert!(!p.is_null());
        assert_eq!(
            p as usize % alignment,
            0,
            "Pointer must be aligned to the requested power of two.",
        );
        // SAFETY: freeing the live allocation from just above.
        unsafe {
            kfree(p);
        }
    }
}

/// Round-trip: a written pattern reads back unchanged.
#[test_case]
fn test_when_writing_pattern_then_it_reads_back() {
    let len = 513;
    let p = kmalloc(len);
    assert!(!p.is_null());

    // SAFETY:
    // The allocation is `len` bytes; all writes and reads stay inside.
    unsafe {
        for i in 0..len {
            p.add(i).write((i % 251) as u8);
        }
        for i in 0..len {
            assert_eq!(p.add(i).read(), (i % 251) as u8, "Pattern mismatch.");
        }
        kfree(p);
    }
}

/// Balanced malloc/free sequences restore `heap_used` exactly.
#[test_case]
fn test_when_sequence_is_balanced_then_heap_used_is_restored() {
    let base = heap_used();

    let mut live = [core::ptr::null_mut::<u8>(); 16];
    for (i, slot) in live.iter_mut().enumerate() {
        *slot = kmalloc(8 + i * 11);
    }
    // Free even slots first, then odd ones.
    // SAFETY: every pointer was allocated above and freed exactly once.
    unsafe {
        for i in (0..16).step_by(2) {
            kfree(live[i]);
        }
        for i in (1..16).step_by(2) {
            kfree(live[i]);
        }
    }

    assert_eq!(heap_used(), base, "Balanced sequences must net to zero.");
}

/// `realloc` contract: same size is identity, shrink splits in place,
/// growth moves the data, size zero does not free.
#[test_case]
fn test_realloc_contract() {
    let p = kmalloc(64);
    // SAFETY:
    // All pointers below come from this allocator and stay live exactly
    // until their kfree.
    unsafe {
        for i in 0..64 {
            p.add(i).write(i as u8);
        }

        let same = krealloc(p, 64);
        assert_eq!(same, p, "Equal stored size must return the same pointer.");

        let shrunk = krealloc(p, 16);
        assert_eq!(shrunk, p, "A splittable shrink stays in place.");

        let grown = krealloc(p, 200);
        assert!(!grown.is_null());
        for i in 0..16 {
            assert_eq!(grown.add(i).read(), i as u8, "Data must survive a move.");
        }

        let nulled = krealloc(grown, 0);
        assert!(nulled.is_null(), "Size zero returns null...");
        // ...and does not free: the allocation is still live and must be
        // released explicitly.
        kfree(grown);
    }
}

/// `calloc` zero-fills.
#[test_case]
fn test_when_callocating_then_memory_is_zeroed() {
    let p = kcalloc(3, 40);
    assert!(!p.is_null());
    // SAFETY: the allocation is 120 bytes.
    unsafe {
        for i in 0..120 {
            assert_eq!(p.add(i).read(), 0, "calloc must zero-fill.");
        }
        kfree(p);
    }
}

/// The global allocator routes `alloc` containers into this heap.
#[test_case]
fn test_when_creating_boxes_then_memory_is_allocated() {
    let heap_value_1 = Box::new(41);
    let heap_value_2 = Box::new(42);

    assert_eq!(*heap_value_1, 41);
    assert_eq!(*heap_value_2, 42);
}

#[test_case]
fn test_when_creating_large_vec_then_memory_is_allocated() {
    let mut vec = Vec::new();
    for i in 0..1000_u64 {
        vec.push(i);
    }
    assert_eq!(vec.iter().sum::<u64>(), (0..1000).sum());
}

#[test_case]
fn test_when_many_boxes_are_allocated_then_memory_is_reused() {
    let base = heap_used();
    for i in 0..10_000_usize {
        let x = Box::new(i);
        assert_eq!(*x, i);
    }
    assert_eq!(heap_used(), base, "Dropped boxes must return their memory.");
}
