// Global Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Selector values fixed by the kernel ABI. The descriptor order below
/// produces exactly these; `selectors()` is asserted against them once at
/// init.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_DATA_SELECTOR: u16 = 0x1B;
pub const USER_CODE_SELECTOR: u16 = 0x23;
pub const TSS_SELECTOR: u16 = 0x28;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // RSP0: stack used on Ring 3 -> Ring 0 transitions until the
        // scheduler starts pointing it at per-task kernel stacks.
        // Must be 16-byte aligned for the x86_64 ABI (movaps et al.).
        tss.privilege_stack_table[0] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            #[allow(dead_code)] // Alignment wrapper -- field accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut BOOT_RSP0_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const BOOT_RSP0_STACK;
            let stack_start = VirtAddr::from_ptr(stack_ptr);
            stack_start + STACK_SIZE as u64
        };

        // Dedicated double-fault stack (16-byte aligned).
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            #[allow(dead_code)] // Alignment wrapper -- field accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const DOUBLE_FAULT_STACK;
            let stack_start = VirtAddr::from_ptr(stack_ptr);
            stack_start + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        // Order is load-bearing: user data before user code keeps the TSS
        // at 0x28, and the trap return path hard-codes 0x1B/0x23.
        let code_selector = gdt.append(Descriptor::kernel_code_segment());    // 0x08
        let data_selector = gdt.append(Descriptor::kernel_data_segment());    // 0x10
        let user_data_selector = gdt.append(Descriptor::user_data_segment()); // 0x18 + RPL 3 = 0x1B
        let user_code_selector = gdt.append(Descriptor::user_code_segment()); // 0x20 + RPL 3 = 0x23
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));         // 0x28 (2 slots)
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                user_data_selector,
                user_code_selector,
                tss_selector,
            },
        )
    };
}

/// GDT segment selectors for kernel and user mode.
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
}

pub fn init() {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::{
            segmentation::{Segment, CS, DS, ES, SS},
            tables::load_tss,
        };

        GDT.0.load();
        // SAFETY: the selectors come from the GDT just loaded, so they
        // reference valid descriptors; reloading segment registers after
        // lgdt is required for the new table to take effect.
        unsafe {
            CS::set_reg(GDT.1.code_selector);
            DS::set_reg(GDT.1.data_selector);
            ES::set_reg(GDT.1.data_selector);
            SS::set_reg(GDT.1.data_selector);
            load_tss(GDT.1.tss_selector);
        }
    }
    assert_eq!(GDT.1.code_selector.0, KERNEL_CODE_SELECTOR);
    assert_eq!(GDT.1.data_selector.0, KERNEL_DATA_SELECTOR);
    assert_eq!(GDT.1.user_data_selector.0, USER_DATA_SELECTOR);
    assert_eq!(GDT.1.user_code_selector.0, USER_CODE_SELECTOR);
    assert_eq!(GDT.1.tss_selector.0, TSS_SELECTOR);
}

/// Returns the GDT selectors. Valid once `init()` has run.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Update the kernel stack pointer in the TSS (RSP0).
///
/// Called by the scheduler before every switch that ends in Ring 3, so the
/// next trap from that task lands on its own kernel stack. Must run with
/// interrupts disabled; a stale RSP0 at IRET time is a triple-fault risk.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: the TSS is a static; only the scheduler writes this slot and
    // it does so with interrupts disabled on the single CPU.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Read the current kernel stack pointer from the TSS (RSP0).
pub fn get_kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_selector_layout_matches_abi() {
        // On the host nothing is loaded; init() only asserts the layout.
        init();
        let s = selectors();
        assert_eq!(s.user_code_selector.0 & 0x3, 3, "user code RPL");
        assert_eq!(s.user_data_selector.0 & 0x3, 3, "user data RPL");
    }

    #[test]
    fn test_rsp0_round_trip() {
        set_kernel_stack(0xFFFF_9000_0000_1000);
        assert_eq!(get_kernel_stack(), 0xFFFF_9000_0000_1000);
    }
}
