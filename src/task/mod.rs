//! Tasks and the round-robin scheduler.
//!
//! Every task owns a saved register frame, a kernel stack, an `esp0`
//! stack iff it runs in ring 3, and a reference to the page directory
//! backing its address space (kernel tasks share the kernel directory;
//! user tasks own a clone). Tasks live in a single registry keyed by a
//! monotonic id; parent/child links are ids, never pointers.
//!
//! Scheduling is preemptive round-robin with a quantum of one timer
//! tick. The timer handler is the only automatic preemption point; a
//! task can also leave voluntarily through [`exit_this_task`]. The ready
//! queue holds every non-completed task exactly once and is rotated
//! head-to-tail on each tick that sees at least two entries.

pub mod switch;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::gdt::{
    self, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};
use crate::interrupts::{
    disable_interrupts, interrupts_enabled, without_interrupts, Registers, TIMER_VECTOR,
};
use crate::memory::frame::frame_map;
use crate::memory::paging::{
    kernel_page_directory, switch_page_directory, PageDirectory, PageFlags,
};
use crate::memory::{
    page_addr, PAGE_MASK_4M, TMP_SHARED_TASK_MEM_START, USER_SHARED_SPACE_END,
    USER_SHARED_SPACE_START, USER_START,
};

use switch::{
    switch_first_kernel_task_run, switch_first_user_task_run, switch_kernel_task_run,
    switch_user_task_run, TaskRegisters,
};

/// Kernel (and esp0) stack size per task.
pub const KERNEL_STACK_SIZE: usize = 8192;

const STACK_WORDS: usize = KERNEL_STACK_SIZE / 4;

/// EFLAGS value for a fresh task: IF set, reserved bit 1 set.
const INITIAL_EFLAGS: u32 = 0x202;

/// Stable identifier of a task. Handed to user space as an opaque handle.
pub type TaskId = u32;

/// Entry point signature for kernel tasks.
pub type TaskEntry = extern "C" fn(arg: *mut u8);

/// Lifecycle state of a task. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// On the ready queue, waiting to be selected.
    Ready = 0,
    /// Currently executing.
    Running = 1,
    /// Finished; waiting to be joined and destroyed.
    Completed = 2,
}

/// Which page directory backs a task.
enum TaskPd {
    /// The shared kernel directory (kernel tasks).
    Kernel,
    /// An owned clone in the PD-region (user tasks), reclaimed on
    /// destruction.
    Owned(*mut PageDirectory),
}

/// One schedulable task.
pub struct Task {
    id: TaskId,
    state: AtomicU8,
    /// Fixed at creation. The saved `ds` cannot stand in for this: a
    /// user task preempted inside the kernel saves kernel selectors.
    user: bool,
    first_run: bool,
    /// Set when this user task was preempted while executing kernel code
    /// (e.g. a syscall that re-enabled interrupts); it must then be
    /// resumed in the kernel, not through an `iret` to ring 3.
    user_in_kernel_space: bool,
    regs: TaskRegisters,
    /// Kernel stack; `None` only for the main kernel task, whose state is
    /// captured on its first preemption.
    stack: Option<Box<[u32]>>,
    /// Ring-0 stack loaded into the TSS; present iff this is a user task.
    esp0_stack: Option<Box<[u32]>>,
    pd: TaskPd,
    parent: Option<TaskId>,
    children: Vec<TaskId>,
}

// SAFETY: the only non-Send field is the raw `TaskPd::Owned` pointer, which
// is exclusive to this task and only ever touched under the scheduler's
// `Mutex` on a single CPU.
unsafe impl Send for Task {}

impl Task {
    /// Stable id of this task.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::SeqCst) {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            _ => TaskState::Completed,
        }
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Whether this task runs in ring 3 (and therefore owns an esp0
    /// stack and a cloned page directory).
    #[must_use]
    pub fn is_user_task(&self) -> bool {
        self.user
    }

    /// The page directory backing this task's address space.
    ///
    /// The `'static` lifetime is honest only under the single-CPU,
    /// interrupts-disabled discipline every caller follows.
    fn page_directory(&self) -> &'static mut PageDirectory {
        match self.pd {
            TaskPd::Kernel => kernel_page_directory(),
            // SAFETY:
            // Owned directories live in the PD-region until the task is
            // destroyed, and the task is alive here.
            TaskPd::Owned(pd) => unsafe { &mut *pd },
        }
    }

    /// Raw pointer to the backing directory, for identity comparisons
    /// before any mutable reference is materialized.
    fn pd_ptr(&self) -> *mut PageDirectory {
        match self.pd {
            TaskPd::Kernel => core::ptr::from_mut(kernel_page_directory()),
            TaskPd::Owned(pd) => pd,
        }
    }

    fn esp0_top(&self) -> u32 {
        let Some(stack) = self.esp0_stack.as_ref() else {
            panic!("kernel tasks have no esp0 stack");
        };
        stack.as_ptr() as u32 + (stack.len() * 4) as u32
    }
}

/// The scheduler singleton: task registry, ready queue, current task.
struct Scheduler {
    tasks: BTreeMap<TaskId, Box<Task>>,
    queue: VecDeque<TaskId>,
    current: TaskId,
    main: TaskId,
    next_id: TaskId,
}

static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

/// Create the main kernel task and the ready queue.
///
/// The main task gets no stack allocation; its registers are captured on
/// its first preemption.
pub fn init_scheduler() {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        assert!(guard.is_none(), "the scheduler is initialized exactly once");

        let mut regs = TaskRegisters::zeroed();
        regs.ds = KERNEL_DATA_SELECTOR;
        regs.es = KERNEL_DATA_SELECTOR;
        regs.fs = KERNEL_DATA_SELECTOR;
        regs.gs = KERNEL_DATA_SELECTOR;
        regs.cs = KERNEL_CODE_SELECTOR;

        let main = Task {
            id: 0,
            state: AtomicU8::new(TaskState::Running as u8),
            user: false,
            first_run: false,
            user_in_kernel_space: false,
            regs,
            stack: None,
            esp0_stack: None,
            pd: TaskPd::Kernel,
            parent: None,
            children: Vec::new(),
        };

        let mut tasks = BTreeMap::new();
        tasks.insert(0, Box::new(main));
        let mut queue = VecDeque::new();
        queue.push_back(0);

        *guard = Some(Scheduler {
            tasks,
            queue,
            current: 0,
            main: 0,
            next_id: 1,
        });
    });
}

/// Tear the scheduler down. Only the main task may remain; everything
/// else must have been joined and destroyed.
pub fn destroy_scheduler() {
    without_interrupts(|| {
        let Some(sched) = SCHEDULER.lock().take() else {
            panic!("destroying a scheduler that was never initialized");
        };
        assert_eq!(
            sched.queue.len(),
            1,
            "only the main task may remain at shutdown"
        );
        assert_eq!(sched.queue[0], sched.main, "a non-main task outlived shutdown");

        let main = sched
            .tasks
            .get(&sched.main)
            .unwrap_or_else(|| panic!("main task missing from the registry"));
        assert!(
            main.children.is_empty(),
            "the main task still has undestroyed children"
        );
        assert_eq!(sched.tasks.len(), 1, "orphan tasks left in the registry");
        // Dropping `sched` frees the registry, the queue, and the main
        // task while interrupts are still disabled.
    });
}

/// Owned reference to a spawned task.
///
/// Dropping the handle joins the task and then destroys it, so a scope
/// exit is enough to reap a child.
#[must_use]
pub struct JoinHandle {
    id: TaskId,
}

impl JoinHandle {
    /// Id of the task this handle owns.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Busy-wait until the task completes. Requires interrupts enabled,
    /// otherwise no other task could run and make progress.
    pub fn join(&self) {
        join_task(self.id);
    }

    /// Give up ownership, returning the raw id. The caller becomes
    /// responsible for joining and destroying the task.
    #[must_use]
    pub fn into_raw(self) -> TaskId {
        let id = self.id;
        core::mem::forget(self);
        id
    }

    /// Re-assume ownership of a task id returned by [`Self::into_raw`].
    ///
    /// # Safety
    /// `id` must identify a live task that no other handle owns.
    #[must_use]
    pub const unsafe fn from_raw(id: TaskId) -> Self {
        Self { id }
    }
}

impl Drop for JoinHandle {
    fn drop(&mut self) {
        join_task(self.id);
        destroy_task(self.id);
    }
}

/// Spawn a kernel task running `entry(arg)` in the kernel address space.
///
/// The task is placed on the ready queue immediately; it starts running
/// on a subsequent timer tick. When `entry` returns the task exits
/// through [`exit_this_task`].
pub fn spawn_kernel(entry: TaskEntry, arg: *mut u8) -> JoinHandle {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(sched) = guard.as_mut() else {
            panic!("spawning a task before the scheduler is initialized");
        };

        let id = sched.next_id;
        sched.next_id += 1;

        let mut stack = vec![0_u32; STACK_WORDS].into_boxed_slice();

        // Seed the first-run frame: iret pops eip/cs/eflags and lands in
        // `entry` with the exit hook as its return address and `arg` as
        // its single cdecl argument.
        stack[STACK_WORDS - 1] = arg as u32;
        stack[STACK_WORDS - 2] = exit_this_task as *const () as u32;
        stack[STACK_WORDS - 3] = INITIAL_EFLAGS;
        stack[STACK_WORDS - 4] = u32::from(KERNEL_CODE_SELECTOR);
        stack[STACK_WORDS - 5] = entry as *const () as u32;

        let mut regs = TaskRegisters::zeroed();
        regs.esp = core::ptr::addr_of!(stack[STACK_WORDS - 5]) as u32;
        regs.ds = KERNEL_DATA_SELECTOR;
        regs.es = KERNEL_DATA_SELECTOR;
        regs.fs = KERNEL_DATA_SELECTOR;
        regs.gs = KERNEL_DATA_SELECTOR;
        regs.cs = KERNEL_CODE_SELECTOR;

        let parent = sched.current;
        let task = Task {
            id,
            state: AtomicU8::new(TaskState::Ready as u8),
            user: false,
            first_run: true,
            user_in_kernel_space: false,
            regs,
            stack: Some(stack),
            esp0_stack: None,
            pd: TaskPd::Kernel,
            parent: Some(parent),
            children: Vec::new(),
        };

        register_task(sched, task, parent);
        JoinHandle { id }
    })
}

/// Initial argument of a user task.
pub enum UserArg<'a> {
    /// A plain value delivered as the entry argument.
    Value(u32),
    /// Bytes copied into the shared handoff page as `[len:u32][bytes...]`;
    /// the entry argument becomes the page's base address.
    Payload(&'a [u8]),
}

/// Spawn a user task in a fresh address space.
///
/// `codesize` bytes starting at `entry` (read through the creator's
/// address space) are copied to [`USER_START`] in the new task, which
/// begins executing there in ring 3. The initial user stack lives at the
/// top of the shared handoff page.
pub fn spawn_user(entry: *const u8, codesize: usize, arg: UserArg<'_>) -> JoinHandle {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(sched) = guard.as_mut() else {
            panic!("spawning a task before the scheduler is initialized");
        };

        let id = sched.next_id;
        sched.next_id += 1;
        let parent = sched.current;

        let pd = kernel_page_directory()
            .clone_into_region()
            .unwrap_or_else(|err| panic!("cloning the kernel page directory failed: {err:?}"));
        let current_pd = task_in(sched, parent).page_directory();

        // Shared handoff page: initial argument at the bottom, initial
        // ring-3 stack at the top.
        let shared_frame = frame_map()
            .lock()
            .next_free(1)
            .unwrap_or_else(|err| panic!("no frame for the shared page: {err:?}"));
        assert!(
            !pd.is_virtual_mapped(USER_SHARED_SPACE_START),
            "a fresh clone must not map the shared handoff page yet"
        );
        pd.add_page(
            USER_SHARED_SPACE_START,
            page_addr(shared_frame),
            PageFlags::USER,
            false,
        )
        .unwrap_or_else(|err| panic!("mapping the shared page failed: {err:?}"));

        let arg_value = match arg {
            UserArg::Value(value) => value,
            UserArg::Payload(bytes) => {
                let len = bytes.len() as u32;
                assert!(
                    bytes.len() + 4 + 64 <= (USER_SHARED_SPACE_END - USER_SHARED_SPACE_START) as usize,
                    "payload does not fit in the shared handoff page"
                );
                copy_to_pd(current_pd, pd, USER_SHARED_SPACE_START, &len.to_le_bytes());
                copy_to_pd(current_pd, pd, USER_SHARED_SPACE_START + 4, bytes);
                USER_SHARED_SPACE_START
            }
        };

        // Initial ring-3 stack: a null return address and the cdecl
        // argument. The entry program must leave through `exit_user_task`.
        let user_esp = USER_SHARED_SPACE_END - 8;
        copy_to_pd(current_pd, pd, user_esp, &0_u32.to_le_bytes());
        copy_to_pd(current_pd, pd, user_esp + 4, &arg_value.to_le_bytes());

        // First-run iret frame, placed on the task's kernel stack (the
        // kernel heap is mapped identically everywhere, so the frame is
        // reachable after the CR3 switch).
        let mut stack = vec![0_u32; STACK_WORDS].into_boxed_slice();
        stack[STACK_WORDS - 1] = u32::from(USER_DATA_SELECTOR);
        stack[STACK_WORDS - 2] = user_esp;
        stack[STACK_WORDS - 3] = INITIAL_EFLAGS;
        stack[STACK_WORDS - 4] = u32::from(USER_CODE_SELECTOR);
        stack[STACK_WORDS - 5] = USER_START;

        let mut regs = TaskRegisters::zeroed();
        regs.esp = core::ptr::addr_of!(stack[STACK_WORDS - 5]) as u32;
        regs.ds = USER_DATA_SELECTOR;
        regs.es = USER_DATA_SELECTOR;
        regs.fs = USER_DATA_SELECTOR;
        regs.gs = USER_DATA_SELECTOR;
        regs.cs = USER_CODE_SELECTOR;

        // Code page: a fresh frame at USER_START, filled with the entry
        // bytes read through the creator's address space.
        let code_frame = frame_map()
            .lock()
            .next_free(1)
            .unwrap_or_else(|err| panic!("no frame for the user code page: {err:?}"));
        pd.add_page(USER_START, page_addr(code_frame), PageFlags::USER, false)
            .unwrap_or_else(|err| panic!("mapping the user code page failed: {err:?}"));
        debug_assert_eq!(pd.get_physical(USER_START), Ok(page_addr(code_frame)));
        copy_bytes_to_pd(current_pd, pd, USER_START, entry, codesize);

        let task = Task {
            id,
            state: AtomicU8::new(TaskState::Ready as u8),
            user: true,
            first_run: true,
            user_in_kernel_space: false,
            regs,
            stack: Some(stack),
            esp0_stack: Some(vec![0_u32; STACK_WORDS].into_boxed_slice()),
            pd: TaskPd::Owned(core::ptr::from_mut(pd)),
            parent: Some(parent),
            children: Vec::new(),
        };

        register_task(sched, task, parent);
        JoinHandle { id }
    })
}

fn register_task(sched: &mut Scheduler, task: Task, parent: TaskId) {
    let id = task.id;
    task_in(sched, parent).children.push(id);
    sched.tasks.insert(id, Box::new(task));
    sched.queue.push_front(id);
}

fn task_in(sched: &mut Scheduler, id: TaskId) -> &mut Task {
    let Some(task) = sched.tasks.get_mut(&id) else {
        panic!("task {id} is not in the registry");
    };
    task
}

/// Pick the next task and switch to it.
///
/// `regs` is the interrupted frame when called from the timer IRQ, or
/// `None` when the current task is exiting. With fewer than two ready
/// tasks this is a no-op. Otherwise the queue rotates head-to-tail, the
/// current task's state is saved (or its queue entry removed on exit),
/// and one of the four trampolines resumes the head task. In that case
/// this function does not return to the caller; control continues inside
/// the next task.
pub fn schedule(regs: Option<&Registers>) {
    let mut guard = SCHEDULER.lock();
    let Some(sched) = guard.as_mut() else {
        return;
    };
    if sched.queue.len() < 2 {
        return;
    }
    assert!(
        !interrupts_enabled(),
        "the scheduler must run with interrupts disabled"
    );

    // Rotate: the head becomes the next task and moves to the tail.
    let Some(next_id) = sched.queue.pop_front() else {
        return;
    };
    sched.queue.push_back(next_id);

    let current_id = sched.current;

    if let Some(regs) = regs {
        save_current(task_in(sched, current_id), regs);
    } else {
        // Task exit: drop the exiting task from the queue instead of
        // saving its state.
        assert_ne!(
            current_id, sched.main,
            "the main kernel task must never exit"
        );
        assert_ne!(next_id, current_id, "an exiting task cannot be resumed");
        let Some(position) = sched.queue.iter().position(|&id| id == current_id) else {
            panic!("exiting task {current_id} is not on the ready queue");
        };
        let removed = sched.queue.remove(position);
        debug_assert_eq!(removed, Some(current_id));
    }

    sched.current = next_id;
    let next = task_in(sched, next_id);
    let mut jump_to_user = next.is_user_task();
    if next.user_in_kernel_space {
        // The switch away from this task happened while it was executing
        // kernel code, so resume it there instead of iret-ing to ring 3.
        jump_to_user = false;
    }

    if next.is_user_task() {
        gdt::set_kernel_stack(next.esp0_top());
        if next.first_run {
            // The prepared frame must send the task to the user entry.
            // SAFETY: regs.esp points into the task's kernel stack.
            let first_word = unsafe { (next.regs.esp as *const u32).read() };
            debug_assert_eq!(first_word, USER_START, "corrupt first-run frame");
        }
    }

    switch_page_directory(next.page_directory());

    let first_run = next.first_run;
    next.first_run = false;
    next.set_state(TaskState::Running);
    debug_assert!(
        first_run || next.regs.eip != 0,
        "resuming a task that was never switched from"
    );

    let regs_ptr: *const TaskRegisters = core::ptr::addr_of!(next.regs);

    // The trampoline never returns, so the lock must be released first
    // or the next scheduler invocation would deadlock.
    drop(guard);

    // SAFETY:
    // `regs_ptr` points into the registry Box of a task that stays alive
    // at least until it is scheduled away from; the four routines only
    // load the saved state and iret.
    unsafe {
        match (first_run, jump_to_user) {
            (true, false) => switch_first_kernel_task_run(regs_ptr),
            (true, true) => switch_first_user_task_run(regs_ptr),
            (false, true) => switch_user_task_run(regs_ptr),
            (false, false) => switch_kernel_task_run(regs_ptr),
        }
    }
}

/// Save the interrupted state of `current` from the timer IRQ frame.
fn save_current(current: &mut Task, regs: &Registers) {
    // The frame the stub pushed sits at regs.esp:
    //   esp[0] int_no, esp[1] err_code, esp[2] eip, esp[3] cs,
    //   esp[4] eflags, and for ring-3 interrupts esp[5] useresp,
    //   esp[6] ss.
    let frame = regs.esp as *const u32;

    // SAFETY:
    // The frame lives on the stack the CPU interrupted to; its layout is
    // fixed by the stub contract above.
    let interrupted_cs = unsafe {
        debug_assert_eq!(
            frame.read(),
            u32::from(TIMER_VECTOR),
            "state is only saved from the timer interrupt"
        );
        debug_assert_eq!(frame.add(1).read(), 0, "the timer pushes no error code");
        frame.add(3).read()
    };

    let adjusted_esp;
    let mut user_in_kernel_space = false;

    if current.is_user_task() {
        if interrupted_cs == u32::from(USER_CODE_SELECTOR) {
            // Interrupted in ring 3: resume on the saved user stack.
            // SAFETY: a ring-3 interrupt pushes useresp and ss.
            unsafe {
                debug_assert_eq!(
                    frame.add(6).read() & 0xFFFF,
                    u32::from(USER_DATA_SELECTOR),
                    "ring-3 interrupt with a non-user stack segment"
                );
            }
            adjusted_esp = regs.useresp;
        } else {
            // A user task preempted inside the kernel (interrupts were
            // re-enabled during a syscall). Resume it in kernel space,
            // discarding the interrupt payload like for a kernel task.
            assert_eq!(
                interrupted_cs,
                u32::from(KERNEL_CODE_SELECTOR),
                "unexpected code segment at preemption"
            );
            adjusted_esp = regs.esp + 20;
            user_in_kernel_space = true;
        }
    } else {
        assert_eq!(
            interrupted_cs,
            u32::from(KERNEL_CODE_SELECTOR),
            "kernel task interrupted outside kernel code"
        );
        // Discard the five words pushed by the stub and the CPU.
        adjusted_esp = regs.esp + 20;
    }

    current.user_in_kernel_space = user_in_kernel_space;

    current.regs.esp = adjusted_esp;
    current.regs.ebp = regs.ebp;
    current.regs.eax = regs.eax;
    current.regs.ebx = regs.ebx;
    current.regs.ecx = regs.ecx;
    current.regs.edx = regs.edx;
    current.regs.esi = regs.esi;
    current.regs.edi = regs.edi;
    current.regs.eip = regs.eip;
    current.regs.eflags = regs.eflags;
    current.regs.cs = regs.cs as u16;
    current.regs.ds = regs.ds as u16;
    current.regs.es = regs.ds as u16;
    current.regs.fs = regs.ds as u16;
    current.regs.gs = regs.ds as u16;

    if current.state() == TaskState::Running {
        current.set_state(TaskState::Ready);
    }
}

/// Mark the current task completed and switch away for good.
///
/// Never returns; the task's resources are freed later by whoever joins
/// and destroys it.
pub extern "C" fn exit_this_task() -> ! {
    disable_interrupts();

    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(sched) = guard.as_mut() else {
            panic!("exiting a task before the scheduler is initialized");
        };
        let current = sched.current;
        task_in(sched, current).set_state(TaskState::Completed);
    });

    schedule(None);
    unreachable!("the scheduler should have switched away from an exited task");
}

/// Busy-wait until the task reaches `Completed`.
///
/// Requires interrupts enabled (the waited-on task must be able to run)
/// and must not target the calling task.
pub fn join_task(id: TaskId) {
    assert!(
        interrupts_enabled(),
        "join requires interrupts enabled to let other tasks run"
    );
    assert_ne!(current_task_id(), id, "a task cannot join itself");

    loop {
        let completed = without_interrupts(|| {
            let guard = SCHEDULER.lock();
            let Some(sched) = guard.as_ref() else {
                return true;
            };
            sched
                .tasks
                .get(&id)
                .is_none_or(|task| task.state() == TaskState::Completed)
        });
        if completed {
            return;
        }
        core::hint::spin_loop();
    }
}

/// Remove a completed task from the registry and free its resources.
///
/// The task must be `Completed` with no remaining children.
pub fn destroy_task(id: TaskId) {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(sched) = guard.as_mut() else {
            return;
        };
        let Some(task) = sched.tasks.remove(&id) else {
            panic!("destroying unknown task {id}");
        };

        assert_eq!(
            task.state(),
            TaskState::Completed,
            "tasks are destroyed only after completing"
        );
        assert!(
            task.children.is_empty(),
            "task destroyed while it still has children"
        );
        debug_assert!(
            !sched.queue.contains(&id),
            "completed task still on the ready queue"
        );

        if let Some(parent_id) = task.parent {
            if let Some(parent) = sched.tasks.get_mut(&parent_id) {
                let Some(position) = parent.children.iter().position(|&child| child == id) else {
                    panic!("task {id} missing from its parent's child list");
                };
                parent.children.remove(position);
            }
        }

        if let TaskPd::Owned(pd) = task.pd {
            // SAFETY:
            // The directory was allocated by clone_into_region for this
            // task and nothing else references it anymore.
            unsafe {
                (*pd).reclaim();
            }
        }
        // The stack boxes drop here, with interrupts still disabled.
    });
}

/// Id of the currently running task.
#[must_use]
pub fn current_task_id() -> TaskId {
    without_interrupts(|| {
        let guard = SCHEDULER.lock();
        let Some(sched) = guard.as_ref() else {
            panic!("no scheduler, no current task");
        };
        sched.current
    })
}

/// Id of the main kernel task.
#[must_use]
pub fn main_task_id() -> TaskId {
    without_interrupts(|| {
        let guard = SCHEDULER.lock();
        let Some(sched) = guard.as_ref() else {
            panic!("no scheduler, no main task");
        };
        sched.main
    })
}

/// Whether the currently running task is a user task.
#[must_use]
pub fn current_task_is_user() -> bool {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(sched) = guard.as_mut() else {
            return false;
        };
        let current = sched.current;
        task_in(sched, current).is_user_task()
    })
}

/// Parent id of the currently running task, if it has one.
#[must_use]
pub fn current_parent() -> Option<TaskId> {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let sched = guard.as_mut()?;
        let current = sched.current;
        task_in(sched, current).parent
    })
}

/// Whether `id` names a live task.
#[must_use]
pub fn task_exists(id: TaskId) -> bool {
    without_interrupts(|| {
        SCHEDULER
            .lock()
            .as_ref()
            .is_some_and(|sched| sched.tasks.contains_key(&id))
    })
}

/// Whether `id` names a live user task.
#[must_use]
pub fn is_user_task(id: TaskId) -> bool {
    without_interrupts(|| {
        SCHEDULER
            .lock()
            .as_ref()
            .and_then(|sched| sched.tasks.get(&id))
            .is_some_and(|task| task.is_user_task())
    })
}

/// Whether the ready queue currently holds `id`.
#[must_use]
pub fn is_queued(id: TaskId) -> bool {
    without_interrupts(|| {
        SCHEDULER
            .lock()
            .as_ref()
            .is_some_and(|sched| sched.queue.contains(&id))
    })
}

/// State of the task `id`, if it is still registered.
#[must_use]
pub fn task_state(id: TaskId) -> Option<TaskState> {
    without_interrupts(|| {
        SCHEDULER
            .lock()
            .as_ref()
            .and_then(|sched| sched.tasks.get(&id))
            .map(|task| task.state())
    })
}

/// Run `f` on the current task's page directory.
pub fn with_current_page_directory<R>(f: impl FnOnce(&mut PageDirectory) -> R) -> R {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(sched) = guard.as_mut() else {
            panic!("no scheduler, no current page directory");
        };
        let current = sched.current;
        f(task_in(sched, current).page_directory())
    })
}

////////////////////////
//  Cross-task copy   //
////////////////////////

/// Copy `len` bytes from the current address space into task `id` at
/// virtual address `dst`.
pub fn copy_to_task(id: TaskId, dst: u32, src: *const u8, len: usize) {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(sched) = guard.as_mut() else {
            panic!("cross-task copy without a scheduler");
        };
        let current = sched.current;
        let current_ptr = task_in(sched, current).pd_ptr();
        let target_ptr = task_in(sched, id).pd_ptr();

        if current_ptr == target_ptr {
            // SAFETY: same address space, plain copy.
            unsafe {
                core::ptr::copy_nonoverlapping(src, dst as *mut u8, len);
            }
            return;
        }

        // SAFETY:
        // Distinct directories, both alive while their tasks are.
        let (current_pd, target_pd) = unsafe { (&mut *current_ptr, &mut *target_ptr) };
        copy_bytes_to_pd(current_pd, target_pd, dst, src, len);
    });
}

/// Copy `len` bytes out of task `id` at virtual address `src` into the
/// current address space at `dst`.
pub fn copy_from_task(id: TaskId, dst: *mut u8, src: u32, len: usize) {
    without_interrupts(|| {
        let mut guard = SCHEDULER.lock();
        let Some(sched) = guard.as_mut() else {
            panic!("cross-task copy without a scheduler");
        };
        let current = sched.current;
        let current_ptr = task_in(sched, current).pd_ptr();
        let target_ptr = task_in(sched, id).pd_ptr();

        if current_ptr == target_ptr {
            // SAFETY: same address space, plain copy.
            unsafe {
                core::ptr::copy_nonoverlapping(src as *const u8, dst, len);
            }
            return;
        }

        // SAFETY:
        // Distinct directories, both alive while their tasks are.
        let (current_pd, target_pd) = unsafe { (&mut *current_ptr, &mut *target_ptr) };

        let (window, offset) = map_copy_window(current_pd, target_pd, src, len);
        // SAFETY:
        // The window maps the target frame into the current address
        // space; `offset` keeps the copy inside the mapped page.
        unsafe {
            core::ptr::copy_nonoverlapping((window + offset) as *const u8, dst, len);
        }
        unmap_copy_window(current_pd);
    });
}

/// Map the frame backing `vaddr` in `target_pd` at the fixed copy window
/// of `current_pd`. Returns the window base and the in-page offset.
fn map_copy_window(
    current_pd: &mut PageDirectory,
    target_pd: &mut PageDirectory,
    vaddr: u32,
    len: usize,
) -> (u32, u32) {
    let page = vaddr & PAGE_MASK_4M;
    let offset = vaddr - page;
    assert!(
        offset as usize + len <= crate::memory::PAGE_SIZE_4M,
        "cross-task copies must not cross a page boundary"
    );

    let paddr = target_pd
        .get_physical(page)
        .unwrap_or_else(|err| panic!("cross-task copy of an unmapped page: {err:?}"));

    // The frame already has a primary mapping in the owner directory,
    // hence allow_reuse.
    current_pd
        .add_page(TMP_SHARED_TASK_MEM_START, paddr, PageFlags::empty(), true)
        .unwrap_or_else(|err| panic!("mapping the copy window failed: {err:?}"));

    (TMP_SHARED_TASK_MEM_START, offset)
}

fn unmap_copy_window(current_pd: &mut PageDirectory) {
    current_pd
        .remove_page(TMP_SHARED_TASK_MEM_START)
        .unwrap_or_else(|err| panic!("unmapping the copy window failed: {err:?}"));
}

/// Copy bytes from the current address space to `dst` in `target_pd`
/// through the copy window.
fn copy_bytes_to_pd(
    current_pd: &mut PageDirectory,
    target_pd: &mut PageDirectory,
    dst: u32,
    src: *const u8,
    len: usize,
) {
    debug_assert!(
        !core::ptr::eq(current_pd, target_pd),
        "same-space copies take the direct path"
    );

    let (window, offset) = map_copy_window(current_pd, target_pd, dst, len);
    // SAFETY:
    // The window maps the destination frame into the current address
    // space; `offset` keeps the copy inside the mapped page.
    unsafe {
        core::ptr::copy_nonoverlapping(src, (window + offset) as *mut u8, len);
    }
    unmap_copy_window(current_pd);
}

/// Byte-slice convenience wrapper over [`copy_bytes_to_pd`].
fn copy_to_pd(current_pd: &mut PageDirectory, target_pd: &mut PageDirectory, dst: u32, bytes: &[u8]) {
    copy_bytes_to_pd(current_pd, target_pd, dst, bytes.as_ptr(), bytes.len());
}

#[cfg(test)]
mod tests {
    use super::{current_task_id, main_task_id};

    #[test_case]
    fn test_main_task_has_id_zero() {
        assert_eq!(main_task_id(), 0, "The main kernel task gets the first id.");
        assert_eq!(
            current_task_id(),
            0,
            "Unit tests run inside the main kernel task."
        );
    }
}
