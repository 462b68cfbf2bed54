//! Interrupt descriptor table and trap dispatch
//!
//! All populated vectors route through per-vector naked stubs that push
//! the vector, a (possibly synthetic) error code and the full GPR set, so
//! the common dispatcher sees a complete [`TrapFrame`]. The x86-interrupt
//! ABI cannot expose GPRs, and both the syscall path (context capture into
//! the TCB) and the fault paths (register dumps, user-context
//! preservation) need them.
//!
//! Dispatch precedence: syscall vector, then IRQs, then exceptions. The
//! critical exceptions (NMI, double fault, machine check) always take the
//! panic path; everything else honors a test-mode override table. Faults
//! arriving from CPL 3 terminate the offending task instead of panicking.

use core::arch::naked_asm;
use core::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;
use log::error;
use spin::Mutex;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::VirtAddr;

use crate::sched;
use crate::sched::task::FaultReason;

/// Trap gate for syscalls, DPL 3.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// First IRQ vector.
pub const IRQ_BASE_VECTOR: u8 = 32;

/// Number of IRQ lines handled (vectors 32..48).
pub const IRQ_COUNT: u8 = 16;

pub const EXCEPTION_NMI: u8 = 2;
pub const EXCEPTION_INVALID_OPCODE: u8 = 6;
pub const EXCEPTION_DEVICE_NOT_AVAILABLE: u8 = 7;
pub const EXCEPTION_DOUBLE_FAULT: u8 = 8;
pub const EXCEPTION_GENERAL_PROTECTION: u8 = 13;
pub const EXCEPTION_PAGE_FAULT: u8 = 14;
pub const EXCEPTION_MACHINE_CHECK: u8 = 18;

/// Full register image pushed by the trap stubs, matching their push
/// order exactly.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    // Pushed by the CPU on interrupt entry.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Whether the interrupted code was running in ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

/// Exception dispatch mode. In `Test`, non-critical exceptions consult the
/// override table before falling back to the default handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionMode {
    Normal,
    Test,
}

pub type ExceptionHandler = fn(&mut TrapFrame);

static TEST_MODE: AtomicBool = AtomicBool::new(false);
static OVERRIDE_HANDLERS: Mutex<[Option<ExceptionHandler>; 32]> = Mutex::new([None; 32]);

/// Registered guard pages. A page fault whose CR2 lands in one is a stack
/// overflow, reported distinctly.
const MAX_GUARD_PAGES: usize = 8;
static GUARD_PAGES: Mutex<[u64; MAX_GUARD_PAGES]> = Mutex::new([0; MAX_GUARD_PAGES]);

// ---------------------------------------------------------------------------
// Trap stubs
// ---------------------------------------------------------------------------

/// Common tail of every stub: spill the GPRs, hand the frame to the
/// dispatcher on an ABI-aligned stack, restore and return.
#[unsafe(naked)]
unsafe extern "C" fn trap_common() {
    naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "cld",
        "mov rdi, rsp",
        "mov rbp, rsp",
        "and rsp, -16",
        "call {dispatch}",
        "mov rsp, rbp",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        dispatch = sym trap_dispatch,
    );
}

/// Stub for vectors where the CPU pushes no error code: synthesize a zero
/// so every frame has the same shape.
macro_rules! trap_stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            );
        }
    };
}

/// Stub for vectors where the CPU pushed a real error code; only the
/// vector needs slotting underneath it.
macro_rules! trap_stub_err {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            );
        }
    };
}

trap_stub!(isr_0, 0);
trap_stub!(isr_1, 1);
trap_stub!(isr_2, 2);
trap_stub!(isr_3, 3);
trap_stub!(isr_4, 4);
trap_stub!(isr_5, 5);
trap_stub!(isr_6, 6);
trap_stub!(isr_7, 7);
trap_stub_err!(isr_8, 8);
trap_stub!(isr_9, 9);
trap_stub_err!(isr_10, 10);
trap_stub_err!(isr_11, 11);
trap_stub_err!(isr_12, 12);
trap_stub_err!(isr_13, 13);
trap_stub_err!(isr_14, 14);
trap_stub!(isr_16, 16);
trap_stub_err!(isr_17, 17);
trap_stub!(isr_18, 18);
trap_stub!(isr_19, 19);

trap_stub!(isr_32, 32);
trap_stub!(isr_33, 33);
trap_stub!(isr_34, 34);
trap_stub!(isr_35, 35);
trap_stub!(isr_36, 36);
trap_stub!(isr_37, 37);
trap_stub!(isr_38, 38);
trap_stub!(isr_39, 39);
trap_stub!(isr_40, 40);
trap_stub!(isr_41, 41);
trap_stub!(isr_42, 42);
trap_stub!(isr_43, 43);
trap_stub!(isr_44, 44);
trap_stub!(isr_45, 45);
trap_stub!(isr_46, 46);
trap_stub!(isr_47, 47);
trap_stub!(isr_128, 0x80);

// ---------------------------------------------------------------------------
// Table construction
// ---------------------------------------------------------------------------

fn stub_addr(f: unsafe extern "C" fn()) -> VirtAddr {
    VirtAddr::new(f as usize as u64)
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        // SAFETY: every address handed to set_handler_addr is a naked stub
        // that preserves the full frame and returns via iretq.
        unsafe {
            idt.divide_error.set_handler_addr(stub_addr(isr_0));
            idt.debug.set_handler_addr(stub_addr(isr_1));
            idt.non_maskable_interrupt.set_handler_addr(stub_addr(isr_2));
            idt.breakpoint.set_handler_addr(stub_addr(isr_3));
            idt.overflow.set_handler_addr(stub_addr(isr_4));
            idt.bound_range_exceeded.set_handler_addr(stub_addr(isr_5));
            idt.invalid_opcode.set_handler_addr(stub_addr(isr_6));
            idt.device_not_available.set_handler_addr(stub_addr(isr_7));
            idt.double_fault
                .set_handler_addr(stub_addr(isr_8))
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
            idt[9].set_handler_addr(stub_addr(isr_9));
            idt.invalid_tss.set_handler_addr(stub_addr(isr_10));
            idt.segment_not_present.set_handler_addr(stub_addr(isr_11));
            idt.stack_segment_fault.set_handler_addr(stub_addr(isr_12));
            idt.general_protection_fault
                .set_handler_addr(stub_addr(isr_13));
            idt.page_fault.set_handler_addr(stub_addr(isr_14));
            idt.x87_floating_point.set_handler_addr(stub_addr(isr_16));
            idt.alignment_check.set_handler_addr(stub_addr(isr_17));
            idt.machine_check.set_handler_addr(stub_addr(isr_18));
            idt.simd_floating_point.set_handler_addr(stub_addr(isr_19));

            let irq_stubs: [unsafe extern "C" fn(); IRQ_COUNT as usize] = [
                isr_32, isr_33, isr_34, isr_35, isr_36, isr_37, isr_38, isr_39, isr_40, isr_41,
                isr_42, isr_43, isr_44, isr_45, isr_46, isr_47,
            ];
            for (i, stub) in irq_stubs.iter().enumerate() {
                idt[IRQ_BASE_VECTOR + i as u8].set_handler_addr(stub_addr(*stub));
            }

            // Syscall: trap gate (interrupts stay enabled) reachable from
            // ring 3.
            idt[SYSCALL_VECTOR]
                .set_handler_addr(stub_addr(isr_128))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3)
                .disable_interrupts(false);
        }
        idt
    };
}

/// Install and load the IDT. Interrupts are enabled by the caller once the
/// controllers are programmed.
pub fn init() {
    #[cfg(target_os = "none")]
    IDT.load();
    #[cfg(not(target_os = "none"))]
    lazy_static::initialize(&IDT);
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Central trap dispatcher. Runs on the interrupted context's kernel
/// stack with the frame fully spilled.
extern "C" fn trap_dispatch(frame: *mut TrapFrame) {
    // SAFETY: the stub passes a pointer to the frame it just pushed.
    let frame = unsafe { &mut *frame };
    let vector = (frame.vector & 0xFF) as u8;
    let from_user = frame.from_user();

    // Any entry from ring 3 captures the user context into the TCB first:
    // if dispatch ends in a context switch, this copy is what resumes.
    if from_user {
        sched::capture_user_context(frame);
    }

    if vector == SYSCALL_VECTOR {
        crate::syscall::syscall_handle(frame);
    } else if (IRQ_BASE_VECTOR..IRQ_BASE_VECTOR + IRQ_COUNT).contains(&vector) {
        crate::irq::irq_dispatch(frame);
    } else if vector < 32 {
        handle_exception(frame, vector);
    } else {
        error!("trap: unhandled vector {}", vector);
        dump_trap_frame(frame);
        panic!("unhandled interrupt vector {}", vector);
    }

    // Returning through the stub's iretq resumes the pushed frame, so the
    // TCB copy is no longer the live context.
    if from_user {
        sched::discard_captured_context(frame);
    }
}

fn handle_exception(frame: &mut TrapFrame, vector: u8) {
    if vector == EXCEPTION_PAGE_FAULT {
        let cr2 = read_cr2();
        if guard_page_hit(cr2) {
            dump_trap_frame(frame);
            panic!("exception stack overflow (guard page at {:#x})", cr2);
        }
    }

    let critical = matches!(
        vector,
        EXCEPTION_NMI | EXCEPTION_DOUBLE_FAULT | EXCEPTION_MACHINE_CHECK
    );
    if !critical && TEST_MODE.load(Ordering::Relaxed) {
        let override_handler = OVERRIDE_HANDLERS.lock()[vector as usize];
        if let Some(handler) = override_handler {
            handler(frame);
            return;
        }
    }

    match vector {
        EXCEPTION_INVALID_OPCODE if frame.from_user() => {
            terminate_user_task(frame, FaultReason::UserUd, "invalid opcode in user mode")
        }
        EXCEPTION_DEVICE_NOT_AVAILABLE if frame.from_user() => terminate_user_task(
            frame,
            FaultReason::UserDeviceNa,
            "device not available in user mode",
        ),
        EXCEPTION_GENERAL_PROTECTION if frame.from_user() => terminate_user_task(
            frame,
            FaultReason::UserGp,
            "general protection from user mode",
        ),
        EXCEPTION_PAGE_FAULT if frame.from_user() => {
            terminate_user_task(frame, FaultReason::UserPage, "user page fault")
        }
        _ => exception_panic(frame, vector),
    }
}

/// Kernel-mode (or critical) exception: dump everything and die.
fn exception_panic(frame: &mut TrapFrame, vector: u8) -> ! {
    let name = exception_name(vector);
    error!("FATAL: {} (vector {})", name, vector);
    if vector == EXCEPTION_PAGE_FAULT {
        let cr2 = read_cr2();
        let err = frame.error_code;
        error!(
            "page fault at {:#x} ({}, {}, {})",
            cr2,
            if err & 1 != 0 { "present" } else { "not present" },
            if err & 2 != 0 { "write" } else { "read" },
            if err & 4 != 0 { "user" } else { "supervisor" },
        );
    }
    dump_trap_frame(frame);
    crate::panic::panic_with_frame(name, frame);
}

/// Fault from CPL 3: log, record the reason, terminate the task and hand
/// the CPU to someone else. Never returns to the faulting context.
fn terminate_user_task(frame: &mut TrapFrame, reason: FaultReason, detail: &'static str) {
    let cr2 = read_cr2();
    error!(
        "terminating user task: {} | vec={} err={:#x} cr2={:#x} rip={:#x} rsp={:#x}",
        detail, frame.vector, frame.error_code, cr2, frame.rip, frame.rsp
    );
    dump_trap_frame(frame);
    sched::terminate_current_from_fault(reason);
    // Resuming the faulting instruction would fault forever; switch now.
    sched::schedule();
    crate::arch::halt_loop();
}

// ---------------------------------------------------------------------------
// Policy knobs
// ---------------------------------------------------------------------------

/// Switch dispatch mode. Leaving test mode drops every override.
pub fn exception_set_mode(mode: ExceptionMode) {
    match mode {
        ExceptionMode::Test => TEST_MODE.store(true, Ordering::Relaxed),
        ExceptionMode::Normal => {
            TEST_MODE.store(false, Ordering::Relaxed);
            *OVERRIDE_HANDLERS.lock() = [None; 32];
        }
    }
}

/// Install a test override for a non-critical exception vector. Refused
/// for the critical set and non-exception vectors.
pub fn install_test_handler(vector: u8, handler: ExceptionHandler) {
    if vector >= 32 {
        error!("idt: ignoring override for non-exception vector {}", vector);
        return;
    }
    if matches!(
        vector,
        EXCEPTION_NMI | EXCEPTION_DOUBLE_FAULT | EXCEPTION_MACHINE_CHECK
    ) {
        error!("idt: refusing to override critical exception {}", vector);
        return;
    }
    OVERRIDE_HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Register a guard page so overflows into it panic distinctly.
pub fn register_guard_page(virt: u64) {
    let mut pages = GUARD_PAGES.lock();
    for slot in pages.iter_mut() {
        if *slot == 0 {
            *slot = virt & !0xFFF;
            return;
        }
    }
    panic!("idt: guard page table full");
}

fn guard_page_hit(addr: u64) -> bool {
    let page = addr & !0xFFF;
    if page == 0 {
        return false;
    }
    GUARD_PAGES.lock().iter().any(|&g| g == page)
}

fn read_cr2() -> u64 {
    #[cfg(target_os = "none")]
    {
        x86_64::registers::control::Cr2::read_raw()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

pub fn exception_name(vector: u8) -> &'static str {
    match vector {
        0 => "divide error",
        1 => "debug",
        2 => "non-maskable interrupt",
        3 => "breakpoint",
        4 => "overflow",
        5 => "bound range exceeded",
        6 => "invalid opcode",
        7 => "device not available",
        8 => "double fault",
        9 => "coprocessor segment overrun",
        10 => "invalid TSS",
        11 => "segment not present",
        12 => "stack segment fault",
        13 => "general protection fault",
        14 => "page fault",
        16 => "x87 floating point",
        17 => "alignment check",
        18 => "machine check",
        19 => "SIMD floating point",
        _ => "unknown exception",
    }
}

/// Serial dump of a trap frame, bypassing the log-level filter.
pub fn dump_trap_frame(frame: &TrapFrame) {
    println!("---- trap frame ----");
    println!(
        "vec={} err={:#06x} rip={:#018x} cs={:#06x}",
        frame.vector, frame.error_code, frame.rip, frame.cs
    );
    println!(
        "rflags={:#010x} rsp={:#018x} ss={:#06x}",
        frame.rflags, frame.rsp, frame.ss
    );
    println!(
        "rax={:#018x} rbx={:#018x} rcx={:#018x}",
        frame.rax, frame.rbx, frame.rcx
    );
    println!(
        "rdx={:#018x} rsi={:#018x} rdi={:#018x}",
        frame.rdx, frame.rsi, frame.rdi
    );
    println!(
        "rbp={:#018x} r8 ={:#018x} r9 ={:#018x}",
        frame.rbp, frame.r8, frame.r9
    );
    println!(
        "r10={:#018x} r11={:#018x} r12={:#018x}",
        frame.r10, frame.r11, frame.r12
    );
    println!(
        "r13={:#018x} r14={:#018x} r15={:#018x}",
        frame.r13, frame.r14, frame.r15
    );
    println!("--------------------");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn frame_with_cs(cs: u64) -> TrapFrame {
        TrapFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            vector: 14,
            error_code: 0,
            rip: 0x40_0000,
            cs,
            rflags: 0x202,
            rsp: 0x7FFF_F000,
            ss: 0x1B,
        }
    }

    #[test]
    fn test_from_user_detection() {
        assert!(frame_with_cs(0x23).from_user());
        assert!(frame_with_cs(0x1B).from_user());
        assert!(!frame_with_cs(0x08).from_user());
    }

    #[test]
    fn test_guard_page_registry() {
        register_guard_page(0xFFFF_9000_0000_1234);
        assert!(guard_page_hit(0xFFFF_9000_0000_1FFF));
        assert!(!guard_page_hit(0xFFFF_9000_0000_2000));
    }

    #[test]
    fn test_override_install_rules() {
        exception_set_mode(ExceptionMode::Test);
        fn nop(_f: &mut TrapFrame) {}
        install_test_handler(EXCEPTION_DOUBLE_FAULT, nop);
        assert!(
            OVERRIDE_HANDLERS.lock()[EXCEPTION_DOUBLE_FAULT as usize].is_none(),
            "critical vectors must refuse overrides"
        );
        install_test_handler(EXCEPTION_INVALID_OPCODE, nop);
        assert!(OVERRIDE_HANDLERS.lock()[EXCEPTION_INVALID_OPCODE as usize].is_some());
        exception_set_mode(ExceptionMode::Normal);
        assert!(OVERRIDE_HANDLERS.lock()[EXCEPTION_INVALID_OPCODE as usize].is_none());
    }

    #[test]
    fn test_exception_names() {
        assert_eq!(exception_name(14), "page fault");
        assert_eq!(exception_name(13), "general protection fault");
        assert_eq!(exception_name(42), "unknown exception");
    }
}
