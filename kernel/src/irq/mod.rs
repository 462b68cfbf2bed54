//! IRQ dispatch
//!
//! Hardware interrupt vectors 32..48 land here from the trap dispatcher.
//! A fixed handler table maps each line to at most one handler; after the
//! handler runs and the controller is acknowledged, the post-IRQ hook
//! gives the scheduler its one safe chance to act on a deferred
//! reschedule. Handlers themselves must never call `schedule()`.

use core::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use spin::Mutex;

use crate::arch::x86_64::{apic, idt::TrapFrame};
use crate::error::{KernelError, KernelResult};
use crate::sched;

/// Number of IRQ lines.
pub const IRQ_LINES: usize = 16;

pub type IrqHandler = fn(&mut TrapFrame);

static HANDLERS: Mutex<[Option<IrqHandler>; IRQ_LINES]> = Mutex::new([None; IRQ_LINES]);

static DISPATCH_COUNT: AtomicU64 = AtomicU64::new(0);
static SPURIOUS_COUNT: AtomicU64 = AtomicU64::new(0);

/// Register a handler for an IRQ line. One handler per line.
pub fn install_handler(line: u8, handler: IrqHandler) -> KernelResult<()> {
    if line as usize >= IRQ_LINES {
        return Err(KernelError::InvalidArgument { name: "irq line" });
    }
    let mut handlers = HANDLERS.lock();
    if handlers[line as usize].is_some() {
        return Err(KernelError::InvalidState {
            expected: "free irq line",
            actual: "handled irq line",
        });
    }
    handlers[line as usize] = Some(handler);
    Ok(())
}

/// Remove the handler for an IRQ line.
pub fn uninstall_handler(line: u8) {
    if (line as usize) < IRQ_LINES {
        HANDLERS.lock()[line as usize] = None;
    }
}

/// Dispatch an IRQ frame: handler, end-of-interrupt, then the deferred
/// reschedule drain. Called from the trap dispatcher only.
pub fn irq_dispatch(frame: &mut TrapFrame) {
    let line = (frame.vector as u8).wrapping_sub(crate::arch::x86_64::idt::IRQ_BASE_VECTOR);
    DISPATCH_COUNT.fetch_add(1, Ordering::Relaxed);

    let handler = if (line as usize) < IRQ_LINES {
        HANDLERS.lock()[line as usize]
    } else {
        None
    };
    match handler {
        Some(handler) => handler(frame),
        None => {
            SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
            warn!("irq: spurious interrupt on line {}", line);
        }
    }

    apic::send_eoi();

    // The only safe point to act on preemption requested during the
    // handler.
    sched::on_irq_exit();
}

pub fn dispatch_count() -> u64 {
    DISPATCH_COUNT.load(Ordering::Relaxed)
}

pub fn spurious_count() -> u64 {
    SPURIOUS_COUNT.load(Ordering::Relaxed)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_install_rules() {
        fn nop(_f: &mut TrapFrame) {}
        uninstall_handler(9);
        install_handler(9, nop).expect("free line must accept a handler");
        assert!(
            install_handler(9, nop).is_err(),
            "second handler on one line must be refused"
        );
        uninstall_handler(9);
        install_handler(9, nop).expect("line must be free again");
        uninstall_handler(9);
        assert!(install_handler(200, nop).is_err());
    }
}
