//! VGA text-mode terminal.
//! A safe writer over the memory-mapped text buffer at `0xb8000`, exposed
//! through the `print!`/`println!` macros. The rest of the kernel treats
//! the terminal as a dumb byte sink.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use volatile::Volatile;

use crate::interrupts;

/// Number of text rows.
pub const BUFFER_HEIGHT: usize = 25;

/// Number of text columns.
pub const BUFFER_WIDTH: usize = 80;

/// VGA text-mode color palette.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// Foreground/background color pair packed into one attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    /// Combine a foreground and a background color.
    #[must_use]
    pub const fn new(foreground: Color, background: Color) -> Self {
        Self((background as u8) << 4 | (foreground as u8))
    }
}

/// One character cell: ASCII byte plus attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

/// The memory-mapped text buffer.
#[repr(transparent)]
pub struct Buffer {
    chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

/// Writes characters to the last row and scrolls up on overflow.
pub struct Writer {
    column_position: usize,
    color_code: ColorCode,
    buffer: &'static mut Buffer,
}

impl Writer {
    /// Write a byte to the current cursor position.
    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            character => {
                if self.column_position >= BUFFER_WIDTH {
                    self.new_line();
                }

                let row = BUFFER_HEIGHT - 1;
                let col = self.column_position;

                let color_code = self.color_code;
                self.buffer.chars[row][col].write(ScreenChar {
                    ascii_character: character,
                    color_code,
                });
                self.column_position += 1;
            }
        }
    }

    /// Write a string, replacing non-printable bytes with `■`.
    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                // printable ASCII byte or newline
                0x20..=0x7e | b'\n' => self.write_byte(byte),
                // not part of printable ASCII range
                _ => self.write_byte(0xfe),
            }
        }
    }

    /// Read back the character at `(row, col)`. Used by tests.
    #[must_use]
    pub fn char_at(&self, row: usize, col: usize) -> (u8, ColorCode) {
        let c = self.buffer.chars[row][col].read();
        (c.ascii_character, c.color_code)
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let character = self.buffer.chars[row][col].read();
                self.buffer.chars[row - 1][col].write(character);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.column_position = 0;
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            self.buffer.chars[row][col].write(blank);
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    /// Global instance of the VGA buffer writer.
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        column_position: 0,
        color_code: ColorCode::new(Color::LightGray, Color::Black),

        // SAFETY:
        // The VGA text buffer is always mapped at 0xb8000 in text mode and
        // nothing else aliases it.
        buffer: unsafe { &mut *(0xb8000 as *mut Buffer) },
    });
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // Keep the writer lock interrupt-free so a printing handler cannot
    // deadlock against a task holding it.
    interrupts::without_interrupts(|| {
        #[expect(
            clippy::expect_used,
            reason = "Writing to the VGA buffer cannot fail."
        )]
        WRITER.lock().write_fmt(args).expect("VGA write failed.");
    });
}

/// Print to the VGA text buffer.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::vga_buffer::_print(format_args!($($arg)*)));
}

/// Print to the VGA text buffer, with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[cfg(test)]
mod tests {
    use core::fmt::Write;

    use super::{BUFFER_HEIGHT, WRITER};
    use crate::interrupts;

    #[test_case]
    fn test_when_printing_many_lines_should_not_panic() {
        for _ in 0..200 {
            println!("test many print output.");
        }
    }

    /// Test that a printed line lands in the buffer row above the cursor.
    #[test_case]
    fn test_when_printing_a_line_should_appear_in_vga_buffer() {
        let line = "Some line that fits on a single line";

        interrupts::without_interrupts(|| {
            let mut writer = WRITER.lock();

            writeln!(writer, "\n{line}").expect("Failed to write line to vga buffer.");
            for (i, c) in line.chars().enumerate() {
                let (byte, _) = writer.char_at(BUFFER_HEIGHT - 2, i);
                assert_eq!(char::from(byte), c, "Character mismatch at position {i}.");
            }
        });
    }
}
