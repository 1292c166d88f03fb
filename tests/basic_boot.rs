//! Simple boot test for the kernel.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use opal_os::multiboot::BootInfo;
use opal_os::{println, serial_println};

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

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    opal_os::test_panic_handler(info)
}

/// Test that we can print a line.
#[test_case]
fn test_println() {
    println!("test_println output");
}

/// Test that the serial line works.
#[test_case]
fn test_serial_println() {
    serial_println!("test_serial_println output");
}

/// Test that the logger is wired up.
#[test_case]
fn test_log_macros() {
    log::info!("logging from a test");
}

/// The timer must be ticking after init.
#[test_case]
fn test_timer_ticks_advance() {
    let start = opal_os::pit::ticks();
    while opal_os::pit::ticks() == start {
        core::hint::spin_loop();
    }
}
