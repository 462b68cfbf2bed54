//! Serial console
//!
//! COM1 byte I/O is an external collaborator; this module is the whole
//! interface the kernel has to it. On the host test target the writer
//! discards output so the logging path stays linkable.

use core::fmt;

use spin::Mutex;

/// COM1 base port
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const COM1: u16 = 0x3F8;

pub struct SerialPort {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    inner: uart_16550::SerialPort,
}

impl SerialPort {
    const fn new() -> Self {
        Self {
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            // SAFETY: COM1 is the standard primary UART base port; nothing
            // else in the kernel drives these ports.
            inner: unsafe { uart_16550::SerialPort::new(COM1) },
        }
    }

    pub fn init(&mut self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        self.inner.init();
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            use core::fmt::Write;
            self.inner.write_str(s)
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            let _ = s;
            Ok(())
        }
    }
}

/// Global serial console, shared by print macros and the logger.
pub static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new());

/// Initialize COM1. Called once from the early-hw boot phase.
pub fn init() {
    SERIAL.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    crate::sync::without_interrupts(|| {
        let _ = SERIAL.lock().write_fmt(args);
    });
}
