//! Tests for tasks, scheduling, join/exit, and fault delivery.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use opal_os::interrupts::{
    interrupt_handler, register_interrupt_handler, unregister_interrupt_handler, Registers,
    PAGE_FAULT_VECTOR,
};
use opal_os::multiboot::BootInfo;
use opal_os::task::{self, spawn_kernel, TaskState};

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

/// Increment the `u32` behind `arg` one hundred times.
extern "C" fn count_100(arg: *mut u8) {
    let counter = arg.cast::<u32>();
    assert_eq!(counter as usize % 4, 0, "Received misaligned pointer.");
    for _ in 0..100 {
        // SAFETY:
        // The parent keeps the counter alive across the join; volatile
        // forces one real increment per iteration.
        unsafe {
            counter.write_volatile(counter.read_volatile() + 1);
        }
    }
}

/// Increment the `u32` behind `arg` two hundred times.
extern "C" fn count_200(arg: *mut u8) {
    let counter = arg.cast::<u32>();
    assert_eq!(counter as usize % 4, 0, "Received misaligned pointer.");
    for _ in 0..200 {
        // SAFETY: see count_100.
        unsafe {
            counter.write_volatile(counter.read_volatile() + 1);
        }
    }
}

/// The main task's id is 0 and unit tests run inside it.
#[test_case]
fn test_main_task_ids() {
    assert_eq!(task::main_task_id(), 0);
    assert_eq!(task::current_task_id(), 0);
}

/// Two kernel tasks and the main task make progress concurrently and
/// every increment lands.
#[test_case]
fn test_when_three_tasks_count_then_all_totals_match() {
    let mut v1: u32 = 0;
    let mut v2: u32 = 0;
    let mut local: u32 = 0;

    let t1 = spawn_kernel(count_100, core::ptr::addr_of_mut!(v1).cast());
    let t2 = spawn_kernel(count_200, core::ptr::addr_of_mut!(v2).cast());

    let local_ptr = core::ptr::addr_of_mut!(local);
    for _ in 0..300 {
        // SAFETY: volatile to keep the loop honest under optimization.
        unsafe {
            local_ptr.write_volatile(local_ptr.read_volatile() + 1);
        }
    }

    t1.join();
    t2.join();

    assert_eq!(v1, 100, "First task must have run to completion.");
    assert_eq!(v2, 200, "Second task must have run to completion.");
    assert_eq!(local, 300, "The main task counts alongside.");
    drop(t1);
    drop(t2);
}

/// Dropping the handles joins implicitly.
#[test_case]
fn test_when_handles_drop_then_tasks_are_joined() {
    let mut v1: u32 = 0;
    let mut v2: u32 = 0;

    {
        let _t1 = spawn_kernel(count_100, core::ptr::addr_of_mut!(v1).cast());
        let _t2 = spawn_kernel(count_200, core::ptr::addr_of_mut!(v2).cast());
    }

    assert_eq!(v1, 100, "Drop must join the first task.");
    assert_eq!(v2, 200, "Drop must join the second task.");
}

/// `exit_this_task` ends the task mid-function; the statements after it
/// never run, the task leaves the queue, and its state is terminal.
#[test_case]
fn test_when_task_exits_early_then_rest_is_skipped() {
    extern "C" fn bump_and_exit(arg: *mut u8) {
        let value = arg.cast::<u32>();
        // SAFETY: the parent keeps the value alive across the join.
        unsafe {
            value.write_volatile(value.read_volatile() + 1);
        }
        task::exit_this_task();
        // Unreachable: the exit above never returns.
        #[allow(unreachable_code)]
        // SAFETY: see above; never executed.
        unsafe {
            value.write_volatile(value.read_volatile() + 1);
        }
    }

    let mut x: u32 = 10;
    let handle = spawn_kernel(bump_and_exit, core::ptr::addr_of_mut!(x).cast());
    handle.join();

    assert_eq!(x, 11, "Only the increment before the exit may run.");
    assert_eq!(
        task::task_state(handle.id()),
        Some(TaskState::Completed),
        "Completed is terminal.",
    );
    assert!(
        !task::is_queued(handle.id()),
        "An exited task must leave the ready queue.",
    );
}

/// A join on an already-completed task returns immediately.
#[test_case]
fn test_when_task_already_completed_then_join_is_immediate() {
    let mut v: u32 = 0;
    let handle = spawn_kernel(count_100, core::ptr::addr_of_mut!(v).cast());
    handle.join();
    assert_eq!(v, 100);

    // Second join: the state is already Completed.
    handle.join();
    assert_eq!(task::task_state(handle.id()), Some(TaskState::Completed));
}

static RECORDED_VECTOR: AtomicU32 = AtomicU32::new(0);
static PRE_FAULT: AtomicBool = AtomicBool::new(false);
static POST_FAULT: AtomicBool = AtomicBool::new(false);

fn recording_fault_handler(regs: &mut Registers) {
    RECORDED_VECTOR.store(regs.int_no, Ordering::SeqCst);
    // Returning would re-run the faulting instruction forever; end the
    // task instead.
    task::exit_this_task();
}

extern "C" fn faulting_task(_arg: *mut u8) {
    PRE_FAULT.store(true, Ordering::SeqCst);
    // SAFETY:
    // Deliberately dereferences an unmapped user-range address to raise
    // a page fault; the test handler ends the task.
    unsafe {
        let _ = (0xA000_0000 as *const u32).read_volatile();
    }
    POST_FAULT.store(true, Ordering::SeqCst);
}

/// A page fault in a task is delivered to the registered handler with
/// vector 14, and the faulting task never continues past the access.
#[test_case]
fn test_when_task_faults_then_handler_sees_vector_14() {
    let old_handler = interrupt_handler(PAGE_FAULT_VECTOR);
    register_interrupt_handler(PAGE_FAULT_VECTOR, recording_fault_handler);

    RECORDED_VECTOR.store(0, Ordering::SeqCst);
    PRE_FAULT.store(false, Ordering::SeqCst);
    POST_FAULT.store(false, Ordering::SeqCst);

    let handle = spawn_kernel(faulting_task, core::ptr::null_mut());
    handle.join();
    drop(handle);

    assert_eq!(
        RECORDED_VECTOR.load(Ordering::SeqCst),
        u32::from(PAGE_FAULT_VECTOR),
        "The handler must see the page-fault vector.",
    );
    assert!(
        PRE_FAULT.load(Ordering::SeqCst),
        "The task must reach the access.",
    );
    assert!(
        !POST_FAULT.load(Ordering::SeqCst),
        "The task must not survive the fault.",
    );

    match old_handler {
        Some(handler) => register_interrupt_handler(PAGE_FAULT_VECTOR, handler),
        None => unregister_interrupt_handler(PAGE_FAULT_VECTOR),
    }
}
