//! Programmable interval timer.
//! Channel 0 in square-wave mode drives the scheduler: every tick is the
//! kernel's only preemption point.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::interrupts::{enable_interrupts, register_interrupt_handler, Registers, TIMER_VECTOR};
use crate::{io, task};

/// Scheduler tick rate.
pub const TIMER_HZ: u32 = 50;

/// Input clock of the PIT in Hz.
const PIT_INPUT_HZ: u32 = 1_193_180;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Number of timer ticks since boot.
#[must_use]
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

fn timer_handler(regs: &mut Registers) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    task::schedule(Some(regs));
}

/// Program the PIT for `frequency` Hz, install the scheduler tick
/// handler, and enable interrupts.
pub fn init(frequency: u32) {
    register_interrupt_handler(TIMER_VECTOR, timer_handler);

    // The divisor must fit in 16 bits, which holds for any frequency
    // above ~18 Hz.
    let divisor = PIT_INPUT_HZ / frequency;

    // SAFETY:
    // Standard PIT programming: command byte 0x36 selects channel 0,
    // lobyte/hibyte access, mode 3; the divisor follows in two writes.
    unsafe {
        io::outb(PIT_COMMAND, 0x36);
        io::outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        io::outb(PIT_CHANNEL0, ((divisor >> 8) & 0xFF) as u8);
    }

    enable_interrupts();
}
