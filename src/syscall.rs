//! Syscall gateway.
//! Vector `0x80` is installed with DPL 3; a user task loads the syscall
//! number into `eax` and up to five arguments into `ebx`, `ecx`, `edx`,
//! `esi`, `edi`. The dispatcher forwards the arguments to the table
//! entry selected by `eax` and stores the `i32` result back into the
//! saved `eax`, which becomes the user's return value.
//!
//! Numbering is a contract with user space:
//!
//! | # | syscall             |
//! |---|---------------------|
//! | 0 | `debug_write`       |
//! | 1 | `exit_user_task`    |
//! | 2 | `debug_read`        |
//! | 3 | `create_user_task`  |
//! | 4 | `destroy_user_task` |
//! | 5 | `copy_from_task`    |
//! | 6 | `get_parent_task`   |
//! | 7 | `get_parent_task_id`|
//! | 8 | `map_page`          |

use crate::interrupts::{
    disable_interrupts, enable_interrupts, register_interrupt_handler, Registers, SYSCALL_VECTOR,
};
use crate::memory::frame::frame_map;
use crate::memory::paging::PageFlags;
use crate::memory::{is_page_aligned, page_addr};
use crate::{print, serial, task};

/// Longest NUL-terminated string `debug_write` accepts.
const MAX_DEBUG_WRITE: usize = 4096;

type SyscallFn = fn(u32, u32, u32, u32, u32) -> i32;

/// The enumerated syscall table. Index == syscall number.
static SYSCALL_TABLE: [SyscallFn; 9] = [
    sys_debug_write,
    sys_exit_user_task,
    sys_debug_read,
    sys_create_user_task,
    sys_destroy_user_task,
    sys_copy_from_task,
    sys_get_parent_task,
    sys_get_parent_task_id,
    sys_map_page,
];

fn syscall_handler(regs: &mut Registers) {
    assert!(
        task::current_task_is_user(),
        "syscalls must come from a user task"
    );

    let number = regs.eax as usize;
    assert!(number < SYSCALL_TABLE.len(), "invalid syscall number");

    let result = SYSCALL_TABLE[number](regs.ebx, regs.ecx, regs.edx, regs.esi, regs.edi);
    regs.eax = result as u32;
}

/// Install the gateway on vector `0x80`.
pub fn init() {
    register_interrupt_handler(SYSCALL_VECTOR, syscall_handler);
}

/// Syscall 0: print the NUL-terminated string at the caller-space
/// pointer `arg1`.
fn sys_debug_write(arg1: u32, _arg2: u32, _arg3: u32, _arg4: u32, _arg5: u32) -> i32 {
    // The handler runs under the caller's CR3, so the user pointer is
    // directly readable; cap the scan to keep a missing NUL bounded.
    let base = arg1 as *const u8;
    for offset in 0..MAX_DEBUG_WRITE {
        // SAFETY:
        // Reads stay inside the caller's mapped pages or fault in the
        // caller's context, which the page-fault handler reports.
        let byte = unsafe { base.add(offset).read() };
        if byte == 0 {
            break;
        }
        let c = char::from(byte);
        print!("{c}");
        crate::serial_print!("{c}");
    }
    0
}

/// Syscall 1: exit the current task. Never returns to the caller.
fn sys_exit_user_task(_arg1: u32, _arg2: u32, _arg3: u32, _arg4: u32, _arg5: u32) -> i32 {
    task::exit_this_task();
}

/// Syscall 2: non-blocking read of one byte from the serial input into
/// the caller-space pointer `arg1`. Returns 1 if a byte was delivered.
fn sys_debug_read(arg1: u32, _arg2: u32, _arg3: u32, _arg4: u32, _arg5: u32) -> i32 {
    match serial::try_read() {
        Some(byte) => {
            // SAFETY:
            // The destination is a caller-space pointer, writable under
            // the caller's CR3 or faulting in its context.
            unsafe {
                (arg1 as *mut u8).write(byte);
            }
            1
        }
        None => 0,
    }
}

/// Syscall 3: create a user task from `codesize` bytes at `entry`
/// (caller-space), passing `arg`; the opaque handle is written to the
/// caller-space pointer `handle_out`.
fn sys_create_user_task(entry: u32, codesize: u32, arg: u32, handle_out: u32, _arg5: u32) -> i32 {
    let handle = task::spawn_user(
        entry as *const u8,
        codesize as usize,
        task::UserArg::Value(arg),
    );

    // Ownership moves to the caller; it must destroy the task through
    // syscall 4.
    let id = handle.into_raw();
    // SAFETY:
    // Caller-space pointer, see sys_debug_read.
    unsafe {
        (handle_out as *mut u32).write(id);
    }
    0
}

/// Syscall 4: join the task behind `handle`, then free it.
fn sys_destroy_user_task(handle: u32, _arg2: u32, _arg3: u32, _arg4: u32, _arg5: u32) -> i32 {
    assert!(task::is_user_task(handle), "handle is not a user task");

    // The join needs the scheduler running, so interrupts are enabled
    // for its duration; the switch logic resumes this task in kernel
    // space afterwards.
    enable_interrupts();
    task::join_task(handle);
    disable_interrupts();

    task::destroy_task(handle);
    0
}

/// Syscall 5: copy `len` bytes from `src` in the task behind `handle`
/// into `dst` in the caller.
fn sys_copy_from_task(handle: u32, dst: u32, src: u32, len: u32, _arg5: u32) -> i32 {
    assert!(task::is_user_task(handle), "handle is not a user task");
    task::copy_from_task(handle, dst as *mut u8, src, len as usize);
    0
}

/// Syscall 6: write the caller's parent handle to the caller-space
/// pointer `handle_out`. Returns -1 for an orphan.
fn sys_get_parent_task(handle_out: u32, _arg2: u32, _arg3: u32, _arg4: u32, _arg5: u32) -> i32 {
    let Some(parent) = task::current_parent() else {
        return -1;
    };
    // SAFETY:
    // Caller-space pointer, see sys_debug_read.
    unsafe {
        (handle_out as *mut u32).write(parent);
    }
    0
}

/// Syscall 7: write the caller's parent task id to the caller-space
/// pointer `id_out`. Returns -1 for an orphan.
fn sys_get_parent_task_id(id_out: u32, _arg2: u32, _arg3: u32, _arg4: u32, _arg5: u32) -> i32 {
    let Some(parent) = task::current_parent() else {
        return -1;
    };
    // SAFETY:
    // Caller-space pointer, see sys_debug_read.
    unsafe {
        (id_out as *mut u32).write(parent);
    }
    0
}

/// Syscall 8: map one 4 MiB page at `vaddr` in the caller's directory to
/// a fresh frame with user flags.
///
/// Returns 0 on success, -1 for an unaligned address, -2 if the page is
/// already mapped, -3 when physical memory is exhausted.
fn sys_map_page(vaddr: u32, _arg2: u32, _arg3: u32, _arg4: u32, _arg5: u32) -> i32 {
    if !is_page_aligned(vaddr) {
        return -1;
    }

    task::with_current_page_directory(|pd| {
        if pd.is_virtual_mapped(vaddr) {
            return -2;
        }

        // Frame 0 is skipped: multiboot data lives there.
        let Ok(frame) = frame_map().lock().next_free(1) else {
            return -3;
        };

        match pd.add_page(vaddr, page_addr(frame), PageFlags::USER, false) {
            Ok(()) => 0,
            Err(_) => -3,
        }
    })
}

/// User-side syscall stubs.
///
/// Everything here is `#[inline(always)]` so that a test program built
/// from a single function stays self-contained when its bytes are copied
/// into a user page: the resulting machine code must not call back into
/// the kernel image.
pub mod user {
    use core::arch::asm;

    /// Raise `int 0x80` with up to five arguments.
    ///
    /// `ebx` and `esi` are reserved by LLVM on x86, so those arguments take
    /// a detour through scratch registers.
    ///
    /// # Safety
    /// The number and arguments must form a valid request under the
    /// syscall ABI; pointers must be caller-space.
    #[inline(always)]
    unsafe fn syscall5(number: u32, arg1: u32, arg2: u32, arg3: u32, arg4: u32, arg5: u32) -> i32 {
        let result: i32;
        asm!(
            "xchg ebx, {arg1}",
            "xchg esi, {arg4}",
            "int 0x80",
            "mov ebx, {arg1}",
            "mov esi, {arg4}",
            arg1 = inout(reg) arg1 => _,
            arg4 = inout(reg) arg4 => _,
            inout("eax") number => result,
            in("ecx") arg2,
            in("edx") arg3,
            in("edi") arg5,
            options(nostack),
        );
        result
    }

    /// Print a NUL-terminated string through the kernel log.
    #[inline(always)]
    pub fn sys_debug_write(s: *const u8) -> i32 {
        // SAFETY: forwards a caller-space pointer to syscall 0.
        unsafe { syscall5(0, s as u32, 0, 0, 0, 0) }
    }

    /// Exit the current user task. Never returns.
    #[inline(always)]
    pub fn sys_exit_task() -> ! {
        // SAFETY: syscall 1 never returns to the caller.
        unsafe {
            syscall5(1, 0, 0, 0, 0, 0);
            core::hint::unreachable_unchecked()
        }
    }

    /// Non-blocking one-byte read; true when a byte was stored in `c`.
    #[inline(always)]
    pub fn sys_debug_read(c: *mut u8) -> bool {
        // SAFETY: forwards a caller-space pointer to syscall 2.
        unsafe { syscall5(2, c as u32, 0, 0, 0, 0) != 0 }
    }

    /// Create a child user task from `codesize` bytes at `entry`.
    #[inline(always)]
    pub fn sys_create_task(entry: *const u8, codesize: u32, arg: u32) -> u32 {
        let mut handle: u32 = 0;
        // SAFETY: forwards caller-space pointers to syscall 3.
        unsafe {
            syscall5(
                3,
                entry as u32,
                codesize,
                arg,
                core::ptr::addr_of_mut!(handle) as u32,
                0,
            );
        }
        handle
    }

    /// Join and free a child created by [`sys_create_task`].
    #[inline(always)]
    pub fn sys_destroy_task(handle: u32) {
        // SAFETY: syscall 4 with a handle from sys_create_task.
        unsafe {
            syscall5(4, handle, 0, 0, 0, 0);
        }
    }

    /// Copy `len` bytes from `src` in the task behind `handle` to `dst`.
    #[inline(always)]
    pub fn sys_copy_from_task(handle: u32, dst: *mut u8, src: u32, len: u32) -> i32 {
        // SAFETY: forwards caller-space pointers to syscall 5.
        unsafe { syscall5(5, handle, dst as u32, src, len, 0) }
    }

    /// Handle of the caller's parent task.
    #[inline(always)]
    pub fn sys_get_parent_task() -> u32 {
        let mut handle: u32 = 0;
        // SAFETY: forwards a caller-space pointer to syscall 6.
        unsafe {
            syscall5(6, core::ptr::addr_of_mut!(handle) as u32, 0, 0, 0, 0);
        }
        handle
    }

    /// Id of the caller's parent task.
    #[inline(always)]
    pub fn sys_get_parent_task_id() -> u32 {
        let mut id: u32 = 0;
        // SAFETY: forwards a caller-space pointer to syscall 7.
        unsafe {
            syscall5(7, core::ptr::addr_of_mut!(id) as u32, 0, 0, 0, 0);
        }
        id
    }

    /// Map a fresh 4 MiB page at `vaddr`; 0, -1, -2 or -3 per the
    /// `map_page` contract.
    #[inline(always)]
    pub fn sys_map_page(vaddr: u32) -> i32 {
        // SAFETY: syscall 8 takes a plain address.
        unsafe { syscall5(8, vaddr, 0, 0, 0, 0) }
    }
}

#[cfg(test)]
mod tests {
    use super::SYSCALL_TABLE;

    #[test_case]
    fn test_syscall_table_has_the_contracted_size() {
        assert_eq!(
            SYSCALL_TABLE.len(),
            9,
            "The syscall numbering is a contract with user space."
        );
    }
}
