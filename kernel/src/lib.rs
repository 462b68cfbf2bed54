//! SlopOS kernel library
//!
//! The kernel core as a `no_std` library: boot orchestration, the
//! physical and virtual memory subsystems, tasks and scheduling, the
//! interrupt core, the syscall surface and the small services behind it.
//! The bare-metal binary in `main.rs` is a thin entry shim.
//!
//! On the host target (x86_64-unknown-linux-gnu) the crate links `std`
//! purely to run the unit-test harness; kernel code itself only uses
//! `core` and `alloc`.

#![no_std]

extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

// On bare metal the size-classed kernel heap backs `alloc`; host test
// builds use the system allocator so the harness can allocate freely.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod error;
pub mod fs;
pub mod irq;
pub mod log_service;
pub mod mm;
pub mod panic;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod userspace;
pub mod video;
pub mod wheel;

/// Bare-metal panic handler: report everything we know, then halt.
#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    sync::disable_interrupts();
    panic::report(info);
    arch::halt_loop();
}
