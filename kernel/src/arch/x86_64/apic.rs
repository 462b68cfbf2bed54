//! Local APIC and IOAPIC windows
//!
//! The interrupt controllers are external collaborators; this module is
//! the complete register surface the kernel uses: the LAPIC base (for the
//! MMIO reservation and EOI) and the IOAPIC redirection entries (routing
//! and per-line masking). No legacy PIC support.

use log::{debug, warn};

use crate::mm::phys_to_virt;

/// IA32_APIC_BASE MSR.
const IA32_APIC_BASE_MSR: u32 = 0x1B;

/// Architectural default LAPIC window, used when the MSR is unavailable.
pub const LAPIC_DEFAULT_BASE: u64 = 0xFEE0_0000;

/// IOAPIC register window.
pub const IOAPIC_BASE: u64 = 0xFEC0_0000;

/// The PIT output is wired to IOAPIC input 2 on the standard ISA bridge.
pub const PIT_GSI: u8 = 2;

// LAPIC register offsets
const LAPIC_EOI: u64 = 0xB0;
const LAPIC_SVR: u64 = 0xF0;

// IOAPIC indirect access registers
const IOAPIC_IOREGSEL: u64 = 0x00;
const IOAPIC_IOWIN: u64 = 0x10;

/// Physical base of the Local APIC MMIO window, from the APIC-base MSR.
pub fn lapic_base() -> u64 {
    #[cfg(target_os = "none")]
    {
        let msr = x86_64::registers::model_specific::Msr::new(IA32_APIC_BASE_MSR);
        // SAFETY: IA32_APIC_BASE is architectural on every x86_64 CPU.
        let raw = unsafe { msr.read() };
        raw & 0xF_FFFF_F000
    }
    #[cfg(not(target_os = "none"))]
    {
        LAPIC_DEFAULT_BASE
    }
}

fn lapic_reg(offset: u64) -> Option<*mut u32> {
    phys_to_virt(lapic_base() + offset).map(|va| va as *mut u32)
}

/// Software-enable the Local APIC (spurious vector 0xFF).
pub fn init() {
    let Some(svr) = lapic_reg(LAPIC_SVR) else {
        warn!("apic: HHDM not ready, LAPIC left untouched");
        return;
    };
    // SAFETY: the LAPIC window is a per-CPU MMIO region reserved in the
    // canonical map; volatile access only.
    unsafe {
        let val = core::ptr::read_volatile(svr);
        core::ptr::write_volatile(svr, val | 0x100 | 0xFF);
    }
    debug!("apic: LAPIC enabled at {:#x}", lapic_base());
}

/// Signal end-of-interrupt for the in-service vector.
pub fn send_eoi() {
    if let Some(eoi) = lapic_reg(LAPIC_EOI) {
        // SAFETY: EOI is write-only MMIO; any value acknowledges.
        unsafe { core::ptr::write_volatile(eoi, 0) };
    }
}

fn ioapic_read(reg: u32) -> Option<u32> {
    let sel = phys_to_virt(IOAPIC_BASE + IOAPIC_IOREGSEL)? as *mut u32;
    let win = phys_to_virt(IOAPIC_BASE + IOAPIC_IOWIN)? as *mut u32;
    // SAFETY: indexed IOAPIC access; the window is device MMIO reserved in
    // the canonical map.
    unsafe {
        core::ptr::write_volatile(sel, reg);
        Some(core::ptr::read_volatile(win))
    }
}

fn ioapic_write(reg: u32, value: u32) {
    let (Some(sel), Some(win)) = (
        phys_to_virt(IOAPIC_BASE + IOAPIC_IOREGSEL),
        phys_to_virt(IOAPIC_BASE + IOAPIC_IOWIN),
    ) else {
        return;
    };
    // SAFETY: as in ioapic_read.
    unsafe {
        core::ptr::write_volatile(sel as *mut u32, reg);
        core::ptr::write_volatile(win as *mut u32, value);
    }
}

/// Route an IOAPIC input to the given vector, edge-triggered, active
/// high, fixed delivery to the boot CPU, unmasked.
pub fn route_irq(gsi: u8, vector: u8) {
    let low = 0x10 + 2 * gsi as u32;
    let high = low + 1;
    ioapic_write(high, 0); // destination APIC id 0
    ioapic_write(low, vector as u32);
    debug!("apic: routed GSI {} -> vector {}", gsi, vector);
}

/// Mask an IOAPIC input at the line.
pub fn mask_irq_line(gsi: u8) {
    let low = 0x10 + 2 * gsi as u32;
    if let Some(val) = ioapic_read(low) {
        ioapic_write(low, val | (1 << 16));
    }
}

/// Unmask an IOAPIC input.
pub fn unmask_irq_line(gsi: u8) {
    let low = 0x10 + 2 * gsi as u32;
    if let Some(val) = ioapic_read(low) {
        ioapic_write(low, val & !(1 << 16));
    }
}
