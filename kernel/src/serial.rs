//! COM1 serial port: the kernel's diagnostics sink and console device.
//!
//! Output backs the logger and the `write`/`debug_print` syscalls. Input
//! arrives from the external serial driver through [`push_input`] (called
//! in interrupt context, so it must not block or allocate) and is drained
//! by the `read` syscall.
//!
//! On hosted builds the UART is replaced by a stub sink; port I/O is not
//! available outside ring 0.

use crate::spinlock::TicketLock;
use core::fmt;

#[cfg(target_os = "none")]
mod sink {
    use core::fmt;
    use spin::Mutex;
    use uart_16550::SerialPort;

    const COM1_PORT: u16 = 0x3F8;

    static SERIAL1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1_PORT) });

    pub fn init() {
        SERIAL1.lock().init();
    }

    pub fn write_fmt(args: fmt::Arguments) {
        use fmt::Write;
        crate::arch::without_interrupts(|| {
            // Diagnostics must never deadlock against an interrupt that
            // was logging; skip the line instead.
            if let Some(mut port) = SERIAL1.try_lock() {
                let _ = port.write_fmt(args);
            }
        });
    }

    pub fn write_byte(byte: u8) {
        crate::arch::without_interrupts(|| {
            if let Some(mut port) = SERIAL1.try_lock() {
                port.send(byte);
            }
        });
    }
}

#[cfg(not(target_os = "none"))]
mod sink {
    use core::fmt;

    pub fn init() {}

    pub fn write_fmt(args: fmt::Arguments) {
        #[cfg(test)]
        std::eprint!("{}", args);
        #[cfg(not(test))]
        let _ = args;
    }

    pub fn write_byte(byte: u8) {
        #[cfg(test)]
        std::eprint!("{}", byte as char);
        #[cfg(not(test))]
        let _ = byte;
    }
}

/// Initialize the output side. Input stays with the external driver.
pub fn init() {
    sink::init();
}

pub fn write_byte(byte: u8) {
    sink::write_byte(byte);
}

pub fn write_str(s: &str) {
    for &b in s.as_bytes() {
        sink::write_byte(b);
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    sink::write_fmt(args);
}

/// Print to the serial port.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

/// Print to the serial port, with a trailing newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(concat!($fmt, "\n"), $($arg)*));
}

const INPUT_RING_SIZE: usize = 256;

/// Fixed-size console input ring. Bytes are dropped when full; the
/// producer runs in interrupt context and cannot wait.
struct InputRing {
    buf: [u8; INPUT_RING_SIZE],
    head: usize,
    len: usize,
}

impl InputRing {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_RING_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.len == INPUT_RING_SIZE {
            return false;
        }
        let tail = (self.head + self.len) % INPUT_RING_SIZE;
        self.buf[tail] = byte;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % INPUT_RING_SIZE;
        self.len -= 1;
        Some(byte)
    }
}

static INPUT: TicketLock<InputRing> = TicketLock::new(InputRing::new());

/// Entry point for the external serial driver: queue one received byte.
///
/// Interrupt-safe; drops the byte if the ring is full.
pub fn push_input(byte: u8) {
    let dropped = !INPUT.lock_irqsave().push(byte);
    if dropped {
        log::warn!("serial: input ring full, dropping byte");
    }
}

/// Drain up to `buf.len()` buffered input bytes; returns the count.
pub fn read_input(buf: &mut [u8]) -> usize {
    let mut ring = INPUT.lock_irqsave();
    let mut n = 0;
    while n < buf.len() {
        match ring.pop() {
            Some(b) => {
                buf[n] = b;
                n += 1;
            }
            None => break,
        }
    }
    n
}
