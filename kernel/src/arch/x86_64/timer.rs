//! PIT tick source
//!
//! Channel 0 programmed as a rate generator at ~100 Hz drives preemption
//! and sleep bookkeeping. The tick counter is the kernel's only clock.

use core::sync::atomic::{AtomicU64, Ordering};

use log::debug;

/// PIT input clock in Hz.
const PIT_INPUT_HZ: u32 = 1_193_182;

/// Default tick rate.
pub const DEFAULT_HZ: u32 = 100;

/// Milliseconds per tick at the default rate.
pub const MS_PER_TICK: u64 = 1000 / DEFAULT_HZ as u64;

/// Ticks observed since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program PIT channel 0 as a rate generator at `hz`.
pub fn init(hz: u32) {
    let hz = hz.clamp(19, PIT_INPUT_HZ);
    let divisor = (PIT_INPUT_HZ / hz) as u16;
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        let mut command: Port<u8> = Port::new(0x43);
        let mut channel0: Port<u8> = Port::new(0x40);
        // SAFETY: standard PIT programming sequence; channel 0, lobyte/
        // hibyte access, mode 2 (rate generator).
        unsafe {
            command.write(0x34u8);
            channel0.write((divisor & 0xFF) as u8);
            channel0.write((divisor >> 8) as u8);
        }
    }
    debug!("timer: PIT at {} Hz (divisor {})", hz, divisor);
}

/// Record one tick. Called from the timer IRQ handler only.
pub fn record_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Uptime in milliseconds at the default tick rate.
pub fn uptime_ms() -> u64 {
    ticks() * MS_PER_TICK
}

/// Convert a millisecond delay to ticks, rounding up.
pub fn ms_to_ticks(ms: u64) -> u64 {
    ms.div_ceil(MS_PER_TICK)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_tick_accounting() {
        let before = ticks();
        record_tick();
        record_tick();
        assert!(ticks() >= before + 2);
    }

    #[test]
    fn test_ms_conversion() {
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(15), 2);
        assert_eq!(ms_to_ticks(0), 0);
    }
}
