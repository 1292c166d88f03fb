//! Tests for the frame map and page-directory machinery.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use core::panic::PanicInfo;

use opal_os::interrupts::without_interrupts;
use opal_os::memory::frame::frame_map;
use opal_os::memory::paging::{
    kernel_page_directory, switch_page_directory, PageDirectory, PageFlags, PagingError,
};
use opal_os::memory::{page_addr, page_index, KERNEL_START, KHEAP_END, PAGE_SIZE_4M, USER_START};
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

/// A user-range page no test maps permanently.
const SCRATCH_VADDR: u32 = 0xA000_0000;

fn next_free_frame() -> usize {
    without_interrupts(|| {
        frame_map()
            .lock()
            .next_free(1)
            .expect("A free frame should exist.")
    })
}

fn refs_of(frame: usize) -> u16 {
    without_interrupts(|| frame_map().lock().refs(frame))
}

/// Mapping, translation, and unmapping round-trip (with the error cases
/// along the way).
#[test_case]
fn test_when_adding_page_then_translation_holds_until_removal() {
    let pd = kernel_page_directory()
        .clone_into_region()
        .expect("Cloning the kernel directory should succeed.");

    let frame = next_free_frame();
    let paddr = page_addr(frame);

    assert_eq!(
        pd.add_page(SCRATCH_VADDR + 1, paddr, PageFlags::empty(), false),
        Err(PagingError::Unaligned),
        "Unaligned virtual addresses must be rejected.",
    );
    assert_eq!(
        pd.get_physical(SCRATCH_VADDR),
        Err(PagingError::NotMapped),
        "Translation of an absent page must fail.",
    );

    pd.add_page(SCRATCH_VADDR, paddr, PageFlags::empty(), false)
        .expect("Mapping a fresh page should succeed.");
    assert_eq!(pd.get_physical(SCRATCH_VADDR), Ok(paddr));
    assert!(pd.is_virtual_mapped(SCRATCH_VADDR));

    assert_eq!(
        pd.add_page(SCRATCH_VADDR, paddr, PageFlags::empty(), true),
        Err(PagingError::AlreadyMapped),
        "Double-mapping a virtual page must be rejected.",
    );
    assert_eq!(
        pd.add_page(SCRATCH_VADDR + PAGE_SIZE_4M as u32, paddr, PageFlags::empty(), false),
        Err(PagingError::DoublePhysical),
        "Reusing a mapped frame without allow_reuse must be rejected.",
    );

    pd.remove_page(SCRATCH_VADDR)
        .expect("Unmapping a present page should succeed.");
    assert!(!pd.is_virtual_mapped(SCRATCH_VADDR));
    assert_eq!(pd.remove_page(SCRATCH_VADDR), Err(PagingError::NotMapped));
    assert!(
        PageDirectory::is_physical_free(frame),
        "The frame must be free again after the unmap.",
    );

    pd.reclaim();
}

/// Clones are distinct directories that observe identical kernel-range
/// entries and do not leak private mappings to each other.
#[test_case]
fn test_when_cloning_then_address_spaces_are_isolated() {
    let frame = next_free_frame();
    let paddr = page_addr(frame);
    assert!(PageDirectory::is_physical_free(frame));

    let pd1 = kernel_page_directory()
        .clone_into_region()
        .expect("First clone should succeed.");
    let pd2 = kernel_page_directory()
        .clone_into_region()
        .expect("Second clone should succeed.");

    let kernel_base = kernel_page_directory().physical_base();
    assert_ne!(pd1.physical_base(), pd2.physical_base());
    assert_ne!(pd1.physical_base(), kernel_base);
    assert_ne!(pd2.physical_base(), kernel_base);

    // Kernel-range entries are identical across all three.
    for vaddr in [KERNEL_START, opal_os::memory::PAGE_DIR_REGION_START, opal_os::memory::KHEAP_BEGIN] {
        assert_eq!(
            pd1.get_physical(vaddr),
            kernel_page_directory().get_physical(vaddr),
            "Clones must observe the kernel mappings.",
        );
        assert_eq!(pd1.get_physical(vaddr), pd2.get_physical(vaddr));
    }

    // A private mapping in pd1 stays invisible to pd2, but the write
    // through it lands in the chosen frame.
    pd1.add_page(SCRATCH_VADDR, paddr, PageFlags::empty(), false)
        .expect("Mapping in the clone should succeed.");
    assert!(!PageDirectory::is_physical_free(frame));
    assert!(!pd2.is_virtual_mapped(SCRATCH_VADDR), "pd2 must not see it.");
    assert!(
        !kernel_page_directory().is_virtual_mapped(SCRATCH_VADDR),
        "The kernel directory must not see it either.",
    );

    without_interrupts(|| {
        switch_page_directory(pd1);
        // SAFETY:
        // SCRATCH_VADDR is mapped in the active directory.
        unsafe {
            let ptr = SCRATCH_VADDR as *mut u32;
            ptr.write_volatile(0xC0FF_EE00);
            assert_eq!(ptr.read_volatile(), 0xC0FF_EE00, "Write must stick.");
        }
        switch_page_directory(kernel_page_directory());
    });

    pd1.reclaim();
    pd2.reclaim();
    assert!(
        PageDirectory::is_physical_free(frame),
        "Reclaim must release the private frame.",
    );
}

/// Cloning takes one extra reference per present entry; reclaiming gives
/// every one of them back.
#[test_case]
fn test_when_cloning_then_refcounts_rise_and_fall() {
    let kernel_frame = page_index(KERNEL_START);
    let heap_frame = page_index(opal_os::memory::KHEAP_BEGIN);

    let kernel_refs_before = refs_of(kernel_frame);
    let heap_refs_before = refs_of(heap_frame);

    let pd = kernel_page_directory()
        .clone_into_region()
        .expect("Cloning should succeed.");

    assert_eq!(
        refs_of(kernel_frame),
        kernel_refs_before + 1,
        "A clone adds exactly one reference to each mapped frame.",
    );
    assert_eq!(refs_of(heap_frame), heap_refs_before + 1);

    pd.reclaim();

    assert_eq!(
        refs_of(kernel_frame),
        kernel_refs_before,
        "Reclaim removes exactly the references the clone added.",
    );
    assert_eq!(refs_of(heap_frame), heap_refs_before);
}

/// A kernel-range mapping added after a clone exists propagates into it;
/// so does its removal.
#[test_case]
fn test_when_kernel_range_changes_then_all_directories_observe_it() {
    let pd = kernel_page_directory()
        .clone_into_region()
        .expect("Cloning should succeed.");

    // The last heap page is far above the live heap top, so it is free
    // to use as a kernel-range probe.
    let probe = KHEAP_END - PAGE_SIZE_4M as u32;
    assert!(!kernel_page_directory().is_virtual_mapped(probe));

    let frame = next_free_frame();
    kernel_page_directory()
        .add_page(probe, page_addr(frame), PageFlags::empty(), false)
        .expect("Mapping a kernel-range page should succeed.");

    assert!(
        pd.is_virtual_mapped(probe),
        "The clone must observe a kernel-range addition.",
    );
    assert_eq!(
        pd.get_physical(probe),
        kernel_page_directory().get_physical(probe),
        "Both directories must agree on the mapping.",
    );
    assert_eq!(
        refs_of(frame),
        2,
        "One reference per directory holding the mapping.",
    );

    kernel_page_directory()
        .remove_page(probe)
        .expect("Unmapping the kernel-range page should succeed.");
    assert!(
        !pd.is_virtual_mapped(probe),
        "The clone must observe a kernel-range removal.",
    );
    assert!(PageDirectory::is_physical_free(frame));

    pd.reclaim();
}

/// The user-range scan returns the lowest unmapped slot.
#[test_case]
fn test_when_scanning_user_range_then_first_free_slot_is_returned() {
    let pd = kernel_page_directory()
        .clone_into_region()
        .expect("Cloning should succeed.");

    assert_eq!(
        pd.next_free_virtual_user(),
        Some(USER_START),
        "A fresh clone has its whole user range free.",
    );

    let frame = next_free_frame();
    pd.add_page(USER_START, page_addr(frame), PageFlags::USER, false)
        .expect("Mapping the first user page should succeed.");
    assert_eq!(
        pd.next_free_virtual_user(),
        Some(USER_START + PAGE_SIZE_4M as u32),
        "The scan must skip the now-mapped first slot.",
    );

    pd.reclaim();
}

/// Tests must hand every frame back.
#[test_case]
fn test_paging_tests_leak_no_frames() {
    let free = without_interrupts(|| frame_map().lock().free_frames());
    let pd = kernel_page_directory()
        .clone_into_region()
        .expect("Cloning should succeed.");
    pd.reclaim();
    assert_eq!(
        without_interrupts(|| frame_map().lock().free_frames()),
        free,
        "A clone/reclaim pair must not change the free-frame count.",
    );
}
