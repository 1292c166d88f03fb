//! Interrupt handling.
//! Owns the IDT, the PIC remap, the per-vector assembly stubs, and a
//! 256-slot table of Rust handlers. CPU exceptions funnel through
//! [`isr_dispatch`]; hardware IRQs through [`irq_dispatch`], which also
//! acknowledges the PIC. A vector without a registered handler gets a
//! register dump and a panic.

use core::arch::{asm, global_asm};
use core::cell::UnsafeCell;
use core::mem::size_of;

use spin::Mutex;

use crate::gdt::{DescriptorPointer, KERNEL_CODE_SELECTOR};
use crate::{serial_print, serial_println};

/// First vector of the remapped PIC range.
pub const IRQ_BASE: u8 = 32;

/// Timer interrupt vector (IRQ 0 after the remap).
pub const TIMER_VECTOR: u8 = IRQ_BASE;

/// Breakpoint exception vector.
pub const BREAKPOINT_VECTOR: u8 = 3;

/// General protection fault vector.
pub const GENERAL_PROTECTION_FAULT_VECTOR: u8 = 13;

/// Page fault exception vector.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Software interrupt vector for syscalls, reachable from ring 3.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// The register frame the assembly stubs push before entering Rust.
///
/// Layout contract with `isr_common`/`irq_common` below: `ds` is pushed
/// last, the CPU-pushed part (`eip` onward) sits on top, and `useresp`/
/// `ss` are only meaningful when the interrupt came from ring 3.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Registers {
    /// Data segment selector at interrupt time.
    pub ds: u32,
    /// Pushed by `pusha`.
    pub edi: u32,
    /// Pushed by `pusha`.
    pub esi: u32,
    /// Pushed by `pusha`.
    pub ebp: u32,
    /// Stack pointer at the time of `pusha`; points at the `int_no` slot.
    pub esp: u32,
    /// Pushed by `pusha`.
    pub ebx: u32,
    /// Pushed by `pusha`.
    pub edx: u32,
    /// Pushed by `pusha`.
    pub ecx: u32,
    /// Pushed by `pusha`.
    pub eax: u32,
    /// Vector number pushed by the stub.
    pub int_no: u32,
    /// Error code pushed by the CPU, or 0 from the stub.
    pub err_code: u32,
    /// Pushed by the CPU.
    pub eip: u32,
    /// Pushed by the CPU.
    pub cs: u32,
    /// Pushed by the CPU.
    pub eflags: u32,
    /// Only pushed on a ring-3 → ring-0 transition.
    pub useresp: u32,
    /// Only pushed on a ring-3 → ring-0 transition.
    pub ss: u32,
}

const _: () = assert!(size_of::<Registers>() == 64, "Registers layout drifted");

/// A registered interrupt handler.
pub type InterruptHandler = fn(&mut Registers);

static HANDLERS: Mutex<[Option<InterruptHandler>; 256]> = Mutex::new([None; 256]);

/// Register `handler` for `vector`, replacing any previous handler.
pub fn register_interrupt_handler(vector: u8, handler: InterruptHandler) {
    without_interrupts(|| {
        HANDLERS.lock()[vector as usize] = Some(handler);
    });
}

/// Remove the handler for `vector`.
pub fn unregister_interrupt_handler(vector: u8) {
    without_interrupts(|| {
        HANDLERS.lock()[vector as usize] = None;
    });
}

/// Look up the handler currently registered for `vector`.
#[must_use]
pub fn interrupt_handler(vector: u8) -> Option<InterruptHandler> {
    without_interrupts(|| HANDLERS.lock()[vector as usize])
}

////////////////////////
//  Interrupt gating  //
////////////////////////

/// Whether the IF flag is currently set.
#[must_use]
pub fn interrupts_enabled() -> bool {
    let eflags: u32;
    // SAFETY:
    // pushfd/pop only inspects the flags register.
    unsafe {
        asm!("pushfd", "pop {}", out(reg) eflags, options(preserves_flags));
    }
    eflags & 0x200 != 0
}

/// Set IF.
pub fn enable_interrupts() {
    // SAFETY:
    // `sti` only sets the interrupt flag.
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

/// Clear IF.
pub fn disable_interrupts() {
    // SAFETY:
    // `cli` only clears the interrupt flag.
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// Run `f` with interrupts disabled, restoring IF afterwards only if it
/// was set on entry. This is the gate every process-wide mutation goes
/// through on this single-CPU kernel.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let were_enabled = interrupts_enabled();
    if were_enabled {
        disable_interrupts();
    }

    let result = f();

    if were_enabled {
        enable_interrupts();
    }
    result
}

////////////////////////
//     IDT + PIC      //
////////////////////////

/// One 8-byte interrupt gate.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    base_low: u16,
    selector: u16,
    always0: u8,
    flags: u8,
    base_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            base_low: 0,
            selector: 0,
            always0: 0,
            flags: 0,
            base_high: 0,
        }
    }

    fn new(handler: u32, selector: u16, flags: u8) -> Self {
        Self {
            base_low: (handler & 0xFFFF) as u16,
            selector,
            always0: 0,
            flags,
            base_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

/// Present 32-bit interrupt gate, DPL 0.
const GATE_FLAGS: u8 = 0x8E;

/// DPL 3 modifier so `int 0x80` is reachable from user mode.
const GATE_DPL_USER: u8 = 0x60;

struct IdtCell(UnsafeCell<[IdtEntry; 256]>);

// SAFETY:
// The IDT is written once during early boot and read only by the CPU.
unsafe impl Sync for IdtCell {}

static IDT: IdtCell = IdtCell(UnsafeCell::new([IdtEntry::missing(); 256]));

const PIC_MASTER_CMD: u16 = 0x20;
const PIC_MASTER_DATA: u16 = 0x21;
const PIC_SLAVE_CMD: u16 = 0xA0;
const PIC_SLAVE_DATA: u16 = 0xA1;

/// PIC end-of-interrupt command.
const PIC_EOI: u8 = 0x20;

/// Remap the two PICs so IRQs 0-15 land on vectors 32-47 instead of
/// overlapping the CPU exceptions.
fn remap_pics() {
    // SAFETY:
    // This is the standard 8259 initialization sequence: ICW1 (init),
    // ICW2 (vector offsets 0x20/0x28), ICW3 (wiring), ICW4 (8086 mode),
    // then unmask everything.
    unsafe {
        crate::io::outb(PIC_MASTER_CMD, 0x11);
        crate::io::outb(PIC_SLAVE_CMD, 0x11);
        crate::io::outb(PIC_MASTER_DATA, 0x20);
        crate::io::outb(PIC_SLAVE_DATA, 0x28);
        crate::io::outb(PIC_MASTER_DATA, 0x04);
        crate::io::outb(PIC_SLAVE_DATA, 0x02);
        crate::io::outb(PIC_MASTER_DATA, 0x01);
        crate::io::outb(PIC_SLAVE_DATA, 0x01);
        crate::io::outb(PIC_MASTER_DATA, 0x00);
        crate::io::outb(PIC_SLAVE_DATA, 0x00);
    }
}

/// Build the IDT (exceptions, IRQs, syscall gate) and load it.
pub fn init() {
    remap_pics();

    let exception_stubs: [unsafe extern "C" fn(); 32] = [
        isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12, isr13,
        isr14, isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24, isr25, isr26,
        isr27, isr28, isr29, isr30, isr31,
    ];
    let irq_stubs: [unsafe extern "C" fn(); 16] = [
        irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13,
        irq14, irq15,
    ];

    // SAFETY:
    // Runs once during early boot before interrupts are enabled.
    let idt = unsafe { &mut *IDT.0.get() };

    for (vector, stub) in exception_stubs.iter().enumerate() {
        idt[vector] = IdtEntry::new(*stub as u32, KERNEL_CODE_SELECTOR, GATE_FLAGS);
    }
    for (index, stub) in irq_stubs.iter().enumerate() {
        idt[IRQ_BASE as usize + index] =
            IdtEntry::new(*stub as u32, KERNEL_CODE_SELECTOR, GATE_FLAGS);
    }

    // The syscall gate carries DPL 3 so user code may raise it.
    idt[SYSCALL_VECTOR as usize] = IdtEntry::new(
        isr128 as u32,
        KERNEL_CODE_SELECTOR,
        GATE_FLAGS | GATE_DPL_USER,
    );

    let pointer = DescriptorPointer {
        limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: idt.as_ptr() as u32,
    };

    // SAFETY:
    // The table is fully built and lives for the kernel lifetime.
    unsafe {
        asm!(
            "lidt ({})",
            in(reg) core::ptr::addr_of!(pointer),
            options(att_syntax, nostack)
        );
    }
}

////////////////////////
//      Dispatch      //
////////////////////////

/// Common entry for CPU exceptions (and the syscall gate).
///
/// Called from `isr_common` with a pointer to the pushed register frame.
#[no_mangle]
extern "C" fn isr_dispatch(regs: &mut Registers) {
    let Some(handler) = HANDLERS.lock()[regs.int_no as usize] else {
        dump_registers(regs);
        panic!("unhandled interrupt {}", regs.int_no);
    };
    handler(regs);
}

/// Common entry for hardware IRQs.
///
/// Sends the PIC EOI before running the handler; the timer handler never
/// returns here when it decides to switch tasks, and the EOI must already
/// have been sent by then or no further IRQs would fire.
#[no_mangle]
extern "C" fn irq_dispatch(regs: &mut Registers) {
    // SAFETY:
    // Writing EOI to the PIC command ports acknowledges the in-service
    // interrupt; the slave is only involved for vectors 40 and above.
    unsafe {
        if regs.int_no >= 40 {
            crate::io::outb(PIC_SLAVE_CMD, PIC_EOI);
        }
        crate::io::outb(PIC_MASTER_CMD, PIC_EOI);
    }

    let Some(handler) = HANDLERS.lock()[regs.int_no as usize] else {
        dump_registers(regs);
        panic!("unhandled IRQ {}", regs.int_no);
    };
    handler(regs);
}

/// Print a classified register and stack dump for a faulting frame.
pub fn dump_registers(regs: &Registers) {
    if regs.int_no == u32::from(GENERAL_PROTECTION_FAULT_VECTOR) {
        serial_println!("General protection fault");
        let err = regs.err_code;
        if err != 0 {
            if err & 1 != 0 {
                serial_println!("Exception originated externally to the processor");
            }
            let table = (err >> 1) & 0x3;
            match table {
                0 => serial_print!("Occurred within GDT segment "),
                2 => serial_print!("Occurred within LDT segment "),
                _ => serial_print!("Occurred within IDT segment "),
            }
            serial_println!("{:#x}", (err >> 3) & 0x1FFF);
        }
    }

    serial_println!("received interrupt: {:#x}", regs.int_no);
    serial_println!(
        "ds:  {:#010x} edi: {:#010x} esi: {:#010x}",
        regs.ds,
        regs.edi,
        regs.esi
    );
    serial_println!(
        "ebp: {:#010x} esp: {:#010x} ebx: {:#010x}",
        regs.ebp,
        regs.esp,
        regs.ebx
    );
    serial_println!(
        "edx: {:#010x} ecx: {:#010x} eax: {:#010x}",
        regs.edx,
        regs.ecx,
        regs.eax
    );
    serial_println!("error code: {:#x}", regs.err_code);
    serial_println!("eip: {:#010x}", regs.eip);
    serial_println!("cs: {:#x}", regs.cs);
    serial_println!("eflags: {:#010x}", regs.eflags);
    serial_println!("useresp: {:#010x}", regs.useresp);
    serial_println!("ss: {:#x}", regs.ss);

    serial_println!("Stack dump:");
    let esp = regs.esp as *const u32;
    for row in 0..4 {
        // SAFETY:
        // This is a best-effort diagnostic on a panic path; the words just
        // above the saved esp are the interrupt frame itself.
        unsafe {
            let ptr = esp.add(row * 4);
            serial_println!(
                "{:#010x}: {:#010x} {:#010x} {:#010x} {:#010x}",
                ptr as u32,
                ptr.read_volatile(),
                ptr.add(1).read_volatile(),
                ptr.add(2).read_volatile(),
                ptr.add(3).read_volatile(),
            );
        }
    }
}

////////////////////////
//    Entry stubs     //
////////////////////////

// Every vector gets a tiny stub that normalizes the stack to the
// `Registers` layout (vectors without a CPU error code push a zero) and
// jumps to the shared save/dispatch/restore sequence.

global_asm!(
    r#"
.global isr_common
isr_common:
    pusha
    xorl %eax, %eax
    movw %ds, %ax
    pushl %eax
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %fs
    movw %ax, %gs
    pushl %esp
    call isr_dispatch
    addl $4, %esp
    popl %eax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %fs
    movw %ax, %gs
    popa
    addl $8, %esp
    iret

.global irq_common
irq_common:
    pusha
    xorl %eax, %eax
    movw %ds, %ax
    pushl %eax
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %fs
    movw %ax, %gs
    pushl %esp
    call irq_dispatch
    addl $4, %esp
    popl %eax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %fs
    movw %ax, %gs
    popa
    addl $8, %esp
    iret
"#,
    options(att_syntax)
);

macro_rules! isr_stub {
    ($name:ident, $vector:literal) => {
        global_asm!(
            concat!(
                ".global ",
                stringify!($name),
                "\n",
                stringify!($name),
                ":\n",
                "    pushl $0\n",
                "    pushl $",
                $vector,
                "\n",
                "    jmp isr_common\n"
            ),
            options(att_syntax)
        );
    };
}

// Vectors where the CPU pushes an error code itself.
macro_rules! isr_stub_err {
    ($name:ident, $vector:literal) => {
        global_asm!(
            concat!(
                ".global ",
                stringify!($name),
                "\n",
                stringify!($name),
                ":\n",
                "    pushl $",
                $vector,
                "\n",
                "    jmp isr_common\n"
            ),
            options(att_syntax)
        );
    };
}

macro_rules! irq_stub {
    ($name:ident, $vector:literal) => {
        global_asm!(
            concat!(
                ".global ",
                stringify!($name),
                "\n",
                stringify!($name),
                ":\n",
                "    pushl $0\n",
                "    pushl $",
                $vector,
                "\n",
                "    jmp irq_common\n"
            ),
            options(att_syntax)
        );
    };
}

isr_stub!(isr0, 0);
isr_stub!(isr1, 1);
isr_stub!(isr2, 2);
isr_stub!(isr3, 3);
isr_stub!(isr4, 4);
isr_stub!(isr5, 5);
isr_stub!(isr6, 6);
isr_stub!(isr7, 7);
isr_stub_err!(isr8, 8);
isr_stub!(isr9, 9);
isr_stub_err!(isr10, 10);
isr_stub_err!(isr11, 11);
isr_stub_err!(isr12, 12);
isr_stub_err!(isr13, 13);
isr_stub_err!(isr14, 14);
isr_stub!(isr15, 15);
isr_stub!(isr16, 16);
isr_stub_err!(isr17, 17);
isr_stub!(isr18, 18);
isr_stub!(isr19, 19);
isr_stub!(isr20, 20);
isr_stub!(isr21, 21);
isr_stub!(isr22, 22);
isr_stub!(isr23, 23);
isr_stub!(isr24, 24);
isr_stub!(isr25, 25);
isr_stub!(isr26, 26);
isr_stub!(isr27, 27);
isr_stub!(isr28, 28);
isr_stub!(isr29, 29);
isr_stub!(isr30, 30);
isr_stub!(isr31, 31);
isr_stub!(isr128, 128);

irq_stub!(irq0, 32);
irq_stub!(irq1, 33);
irq_stub!(irq2, 34);
irq_stub!(irq3, 35);
irq_stub!(irq4, 36);
irq_stub!(irq5, 37);
irq_stub!(irq6, 38);
irq_stub!(irq7, 39);
irq_stub!(irq8, 40);
irq_stub!(irq9, 41);
irq_stub!(irq10, 42);
irq_stub!(irq11, 43);
irq_stub!(irq12, 44);
irq_stub!(irq13, 45);
irq_stub!(irq14, 46);
irq_stub!(irq15, 47);

extern "C" {
    fn isr0();
    fn isr1();
    fn isr2();
    fn isr3();
    fn isr4();
    fn isr5();
    fn isr6();
    fn isr7();
    fn isr8();
    fn isr9();
    fn isr10();
    fn isr11();
    fn isr12();
    fn isr13();
    fn isr14();
    fn isr15();
    fn isr16();
    fn isr17();
    fn isr18();
    fn isr19();
    fn isr20();
    fn isr21();
    fn isr22();
    fn isr23();
    fn isr24();
    fn isr25();
    fn isr26();
    fn isr27();
    fn isr28();
    fn isr29();
    fn isr30();
    fn isr31();
    fn isr128();
    fn irq0();
    fn irq1();
    fn irq2();
    fn irq3();
    fn irq4();
    fn irq5();
    fn irq6();
    fn irq7();
    fn irq8();
    fn irq9();
    fn irq10();
    fn irq11();
    fn irq12();
    fn irq13();
    fn irq14();
    fn irq15();
}

#[cfg(test)]
mod tests {
    use super::{
        interrupt_handler, register_interrupt_handler, unregister_interrupt_handler, Registers,
        BREAKPOINT_VECTOR,
    };

    use core::sync::atomic::{AtomicU32, Ordering};

    static RECORDED_VECTOR: AtomicU32 = AtomicU32::new(0);

    fn recording_handler(regs: &mut Registers) {
        RECORDED_VECTOR.store(regs.int_no, Ordering::SeqCst);
    }

    #[test_case]
    fn test_when_breakpoint_fires_then_registered_handler_runs() {
        RECORDED_VECTOR.store(0, Ordering::SeqCst);
        let old = interrupt_handler(BREAKPOINT_VECTOR);
        register_interrupt_handler(BREAKPOINT_VECTOR, recording_handler);

        // SAFETY:
        // int3 raises vector 3, which the handler above records.
        unsafe {
            core::arch::asm!("int3");
        }

        assert_eq!(
            RECORDED_VECTOR.load(Ordering::SeqCst),
            u32::from(BREAKPOINT_VECTOR),
            "The breakpoint handler should record vector 3.",
        );

        match old {
            Some(handler) => register_interrupt_handler(BREAKPOINT_VECTOR, handler),
            None => unregister_interrupt_handler(BREAKPOINT_VECTOR),
        }
    }

    #[test_case]
    fn test_when_unregistering_then_lookup_returns_none() {
        register_interrupt_handler(100, recording_handler);
        assert!(
            interrupt_handler(100).is_some(),
            "Handler should be registered."
        );

        unregister_interrupt_handler(100);
        assert!(
            interrupt_handler(100).is_none(),
            "Handler should be gone after unregistering."
        );
    }
}
