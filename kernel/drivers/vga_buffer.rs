//! VGA text-mode console (80x25, buffer at physical 0xB8000).
//!
//! The writer is the output device behind the `print!`/`println!` macros and
//! the klog sink. Panic and trap dumps write through here as well, so the
//! implementation avoids allocation entirely.

use core::fmt;

/// Standard VGA text colors.
#[allow(dead_code)]
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
    LightGrey = 7,
    DarkGrey = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// Foreground/background pair packed into one attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
    const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode((background as u8) << 4 | (foreground as u8))
    }
}

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;
const VGA_BUFFER_ADDR: usize = 0xB8000;

pub struct Writer {
    column: usize,
    row: usize,
    color: ColorCode,
}

impl Writer {
    const fn new() -> Writer {
        Writer {
            column: 0,
            row: 0,
            color: ColorCode::new(Color::LightGrey, Color::Black),
        }
    }

    #[cfg(target_arch = "x86")]
    fn cell_ptr(&self, row: usize, col: usize) -> *mut u16 {
        (VGA_BUFFER_ADDR + (row * BUFFER_WIDTH + col) * 2) as *mut u16
    }

    #[cfg(target_arch = "x86")]
    fn put_at(&self, row: usize, col: usize, byte: u8) {
        let value = (self.color.0 as u16) << 8 | byte as u16;
        unsafe { core::ptr::write_volatile(self.cell_ptr(row, col), value) };
    }

    pub fn set_color(&mut self, foreground: Color, background: Color) {
        self.color = ColorCode::new(foreground, background);
    }

    #[cfg(target_arch = "x86")]
    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            b'\x08' => {
                if self.column > 0 {
                    self.column -= 1;
                    self.put_at(self.row, self.column, b' ');
                }
            }
            byte => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }
                self.put_at(self.row, self.column, byte);
                self.column += 1;
            }
        }
    }

    #[cfg(not(target_arch = "x86"))]
    pub fn write_byte(&mut self, _byte: u8) {}

    #[cfg(target_arch = "x86")]
    fn new_line(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
            return;
        }
        // Scroll everything up one row and blank the last line.
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let value = unsafe { core::ptr::read_volatile(self.cell_ptr(row, col)) };
                unsafe { core::ptr::write_volatile(self.cell_ptr(row - 1, col), value) };
            }
        }
        for col in 0..BUFFER_WIDTH {
            self.put_at(BUFFER_HEIGHT - 1, col, b' ');
        }
    }

    #[cfg(target_arch = "x86")]
    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                self.put_at(row, col, b' ');
            }
        }
        self.row = 0;
        self.column = 0;
    }

    #[cfg(not(target_arch = "x86"))]
    pub fn clear(&mut self) {}
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' | b'\x08' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
        Ok(())
    }
}

lazy_static::lazy_static! {
    pub static ref WRITER: spin::Mutex<Writer> = spin::Mutex::new(Writer::new());
}

/// Write raw bytes to the console. Used by the syscall layer for fd 1/2.
pub fn write_bytes(bytes: &[u8]) {
    let mut writer = WRITER.lock();
    for &byte in bytes {
        writer.write_byte(byte);
    }
}

pub fn putc(byte: u8) {
    WRITER.lock().write_byte(byte);
}

pub fn puts(s: &str) {
    use core::fmt::Write;
    let _ = WRITER.lock().write_str(s);
}

pub fn clear() {
    WRITER.lock().clear();
}

pub fn set_color(foreground: Color, background: Color) {
    WRITER.lock().set_color(foreground, background);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = WRITER.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::vga_buffer::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
