//! Test that should panic.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]

use core::panic::PanicInfo;

use opal_os::multiboot::BootInfo;
use opal_os::{exit_qemu, serial_println, QemuExitCode};

/// Entry point for the test.
#[no_mangle]
pub extern "C" fn kmain(magic: u32, info: *const BootInfo) -> ! {
    // SAFETY:
    // The boot stub forwards the multiboot handoff registers.
    let boot_info = unsafe { BootInfo::read(magic, info) };
    opal_os::init(&boot_info);

    test_main();
    opal_os::hlt_loop()
}

/// Test runner for this test file.
pub fn test_runner(tests: &[&dyn Fn()]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test();
        serial_println!("[test did not panic]");
        exit_qemu(QemuExitCode::Failure);
    }
    exit_qemu(QemuExitCode::Success);
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);
    opal_os::hlt_loop()
}

/// Freeing a pointer the heap never handed out trips the allocator's
/// accounting assertion.
/// # Panics
/// Always; that is the point.
#[test_case]
fn should_fail() {
    serial_println!("should_panic::should_fail...\t");
    let bogus = [0_u8; 16];
    // SAFETY:
    // Deliberately invalid: the pointer is a stack array, not a heap
    // allocation. The allocator must catch it and panic.
    unsafe {
        opal_os::allocator::kfree(bogus.as_ptr().cast_mut().add(8));
    }
}
