//! Kernel binary: boot orchestration.
//! `kmain` receives the multiboot handoff from the boot stub, brings the
//! subsystems up in order, copies the initrd out of low memory, launches
//! its entry program as the first user task, joins it, and powers the
//! machine off once the heap is verified empty.

#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![no_std]
#![no_main]

extern crate alloc;

use alloc::vec::Vec;
use core::panic::PanicInfo;

use opal_os::memory::frame::frame_map;
use opal_os::memory::paging::{IdentityMapping, PageFlags};
use opal_os::memory::PAGE_SIZE_4M;
use opal_os::multiboot::BootInfo;
use opal_os::task::{self, UserArg};
use opal_os::{allocator, interrupts, vfs};

extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

/// Name of the initrd file launched as the first user task.
const ENTRY_PROGRAM: &str = "init";

////////////////////////
//     Entry point    //
////////////////////////

/// Kernel entry, called by the multiboot stub with the loader's
/// `eax`/`ebx`.
#[no_mangle]
pub extern "C" fn kmain(magic: u32, info: *const BootInfo) -> ! {
    // Everything the kernel needs from low memory is copied out before
    // paging makes the first page unreachable.
    //
    // SAFETY:
    // The boot stub forwards the registers the bootloader set up.
    let boot_info = unsafe { BootInfo::read(magic, info) };
    let module = boot_info.first_module();

    opal_os::init(&boot_info);
    boot_info.log_summary();

    // SAFETY:
    // The linker script provides both symbols; only their addresses are
    // taken.
    let (kernel_start, kernel_end) = unsafe {
        (
            core::ptr::addr_of!(__kernel_start) as usize,
            core::ptr::addr_of!(__kernel_end) as usize,
        )
    };
    log::info!("kernel image: {kernel_start:#x}..{kernel_end:#x}");
    assert!(
        kernel_end - kernel_start <= PAGE_SIZE_4M,
        "the kernel image must fit in its single 4 MiB page"
    );

    #[cfg(test)]
    test_main();

    let free_before = interrupts::without_interrupts(|| frame_map().lock().free_frames());
    log::info!("free frames: {free_before}");

    match module {
        Some(module) => {
            let initrd = copy_initrd(&module);
            log::info!("initrd size: {} bytes", initrd.len());

            run_entry_program(&initrd);
            drop(initrd);
        }
        None => {
            log::warn!(
                "no initial ramdisk found; pass one to QEMU with \
                 `-initrd initrd.ovfs` or leave the kernel idle"
            );
        }
    }

    ////////////////////////
    //      Teardown      //
    ////////////////////////

    task::destroy_scheduler();

    let leaked = allocator::heap_used();
    log::info!("kernel heap still in use: {leaked} B");
    assert_eq!(leaked, 0, "the kernel heap was not cleared");

    log::info!("reached end of kernel");
    opal_os::shutdown()
}

/// Copy the multiboot module out of low memory.
///
/// The bootloader leaves the module bytes wherever it pleases; once
/// paging is on, the pages holding them are only reachable under
/// temporary identity mappings (pages already identity-mapped, like the
/// kernel image, need none).
fn copy_initrd(module: &opal_os::multiboot::ModuleInfo) -> Vec<u8> {
    let (start, end) = module.range();
    assert!(end > start, "degenerate initrd module");

    let mut mappings: Vec<IdentityMapping> = Vec::new();
    let first_page = start & opal_os::memory::PAGE_MASK_4M;
    let last_page = (end - 1) & opal_os::memory::PAGE_MASK_4M;
    let mut page = first_page;
    loop {
        let already_mapped = opal_os::interrupts::without_interrupts(|| {
            opal_os::memory::paging::kernel_page_directory().is_virtual_mapped(page)
        });
        if !already_mapped {
            mappings.push(
                IdentityMapping::reusing(page, PageFlags::empty())
                    .unwrap_or_else(|err| panic!("identity-mapping low memory failed: {err:?}")),
            );
        }
        if page == last_page {
            break;
        }
        page += PAGE_SIZE_4M as u32;
    }

    // SAFETY:
    // Every page overlapping the module range is mapped for the duration
    // of the copy by the guards above.
    let bytes = unsafe {
        core::slice::from_raw_parts(start as *const u8, module.size()).to_vec()
    };
    drop(mappings);
    bytes
}

/// Parse the initrd, pull out the entry program, and run it as the first
/// user task with the whole archive in its handoff page.
fn run_entry_program(initrd: &[u8]) {
    let root = vfs::parse_initrd(initrd)
        .unwrap_or_else(|err| panic!("initrd archive is invalid: {err:?}"));

    let Some(entry) = root.get_file(ENTRY_PROGRAM) else {
        panic!("initrd has no `{ENTRY_PROGRAM}` entry program");
    };

    log::info!(
        "jumping to user space via `{ENTRY_PROGRAM}` ({} bytes)",
        entry.contents().len()
    );

    let handle = task::spawn_user(
        entry.contents().as_ptr(),
        entry.contents().len(),
        UserArg::Payload(initrd),
    );
    handle.join();
    // Dropping the handle reaps the task.
}

////////////////////////
//    Panic handler   //
////////////////////////

/// This function is called on panic.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupts::disable_interrupts();
    log::error!("KERNEL PANIC: {info}");
    opal_os::hlt_loop()
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    opal_os::test_panic_handler(info)
}
