//! COM1 serial driver.
//! The logger and the test harness write here; the `debug_read` syscall
//! polls here. The 16550 is programmed directly because the usual UART
//! crates target 64-bit kernels.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::{interrupts, io};

/// Line status bit: a byte is waiting in the receive buffer.
const LSR_DATA_READY: u8 = 0x01;

/// Line status bit: the transmit holding register is empty.
const LSR_TRANSMIT_EMPTY: u8 = 0x20;

/// A 16550 UART addressed by its base I/O port.
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    /// Create an uninitialized serial port at `base`.
    ///
    /// # Safety
    /// `base` must be the base port of a real UART.
    #[must_use]
    pub const unsafe fn new(base: u16) -> Self {
        Self { base }
    }

    /// Program the UART: 38400 baud, 8 data bits, no parity, one stop bit,
    /// FIFOs enabled.
    pub fn init(&mut self) {
        // SAFETY:
        // The port numbers are offsets from a valid UART base; the sequence
        // is the standard 16550 initialization.
        unsafe {
            io::outb(self.base + 1, 0x00); // Disable all interrupts
            io::outb(self.base + 3, 0x80); // Enable DLAB (set baud rate divisor)
            io::outb(self.base, 0x03); //     Set divisor to 3 (lo byte) 38400 baud
            io::outb(self.base + 1, 0x00); //                   (hi byte)
            io::outb(self.base + 3, 0x03); // 8 bits, no parity, one stop bit
            io::outb(self.base + 2, 0xC7); // Enable FIFO, clear them, 14-byte threshold
            io::outb(self.base + 4, 0x0B); // IRQs enabled, RTS/DSR set
        }
    }

    fn is_transmit_empty(&self) -> bool {
        // SAFETY:
        // Reading the line status register has no side effects.
        unsafe { io::inb(self.base + 5) & LSR_TRANSMIT_EMPTY != 0 }
    }

    fn received(&self) -> bool {
        // SAFETY:
        // Reading the line status register has no side effects.
        unsafe { io::inb(self.base + 5) & LSR_DATA_READY != 0 }
    }

    /// Write one byte, spinning until the transmitter is ready.
    pub fn put(&mut self, byte: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }

        // SAFETY:
        // The transmit holding register is empty, so the write is accepted.
        unsafe {
            io::outb(self.base, byte);
        }
    }

    /// Write one byte if the transmitter is ready; never blocks.
    pub fn try_write(&mut self, byte: u8) -> bool {
        if !self.is_transmit_empty() {
            return false;
        }

        // SAFETY:
        // The transmit holding register is empty, so the write is accepted.
        unsafe {
            io::outb(self.base, byte);
        }
        true
    }

    /// Read one byte if one is waiting; never blocks.
    pub fn try_read(&mut self) -> Option<u8> {
        if !self.received() {
            return None;
        }

        // SAFETY:
        // The data-ready bit is set, so the receive buffer holds a byte.
        Some(unsafe { io::inb(self.base) })
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put(byte);
        }
        Ok(())
    }
}

lazy_static! {
    /// The first serial port, initialized on first use.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY:
        // 0x3F8 is the standard COM1 base port.
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Non-blocking read of one byte from COM1.
///
/// This is the input path of the `debug_read` syscall.
pub fn try_read() -> Option<u8> {
    interrupts::without_interrupts(|| SERIAL1.lock().try_read())
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;

    // Printing must not be interrupted by a handler that also prints, or
    // the spinlock deadlocks on a single CPU.
    interrupts::without_interrupts(|| {
        #[expect(
            clippy::expect_used,
            reason = "Serial port should be correctly initialized."
        )]
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("Failed to print on serial port.");
    });
}

/// Print to host machine through serial port interface.
#[macro_export]
macro_rules! serial_print {
    ($($args:tt)*) => {
        $crate::serial::_print(format_args!($($args)*))
    };
}

/// Print to host machine through serial port interface a line.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*));
}
