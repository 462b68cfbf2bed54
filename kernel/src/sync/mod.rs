//! Synchronization primitives
//!
//! The kernel runs on a single hardware thread, so the only source of
//! concurrency is interrupts. [`IrqMutex`] is the one lock that has to be
//! IRQ-safe: it disables interrupts for the lifetime of the guard and
//! restores the previous interrupt state on drop. Everything else uses a
//! plain [`spin::Mutex`] with the interrupts-off-at-entry discipline.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

/// A spinlock whose guard holds interrupts disabled.
///
/// Acquiring saves the current interrupt-enable state, disables interrupts,
/// then takes the inner spinlock. Dropping the guard releases the lock and
/// restores the saved state. Used for state that interrupt handlers touch
/// (scheduler, ready queue, tick accounting).
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

/// Guard for [`IrqMutex`]; restores interrupt state on drop.
pub struct IrqMutexGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    were_enabled: bool,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock with interrupts disabled.
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let were_enabled = interrupts_enabled();
        disable_interrupts();
        IrqMutexGuard {
            guard: Some(self.inner.lock()),
            were_enabled,
        }
    }

    /// Try to acquire without blocking. Interrupt state is only touched on
    /// success.
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let were_enabled = interrupts_enabled();
        disable_interrupts();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqMutexGuard {
                guard: Some(guard),
                were_enabled,
            }),
            None => {
                if were_enabled {
                    enable_interrupts();
                }
                None
            }
        }
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard dropped")
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard dropped")
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the spinlock before re-enabling interrupts so an IRQ
        // handler taking the same lock cannot deadlock against us.
        self.guard.take();
        if self.were_enabled {
            enable_interrupts();
        }
    }
}

/// Whether interrupts are currently enabled on this CPU.
///
/// On the host test target this is a constant `false`: there is no interrupt
/// flag to manage and `cli`/`sti` would fault in user space.
#[inline]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        false
    }
}

#[inline]
pub fn disable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::interrupts::disable();
}

#[inline]
pub fn enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::interrupts::enable();
}

/// Run `f` with interrupts disabled, restoring the previous state after.
pub fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
    let were_enabled = interrupts_enabled();
    disable_interrupts();
    let result = f();
    if were_enabled {
        enable_interrupts();
    }
    result
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_irq_mutex_basic() {
        let m = IrqMutex::new(41);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 42);
    }

    #[test]
    fn test_try_lock_contention() {
        let m = IrqMutex::new(0u32);
        let g = m.lock();
        assert!(m.try_lock().is_none(), "lock is held, try_lock must fail");
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn test_without_interrupts_passthrough() {
        let v = without_interrupts(|| 7);
        assert_eq!(v, 7);
    }
}
