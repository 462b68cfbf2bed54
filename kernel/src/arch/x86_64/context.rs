//! x86_64 task contexts and context switching
//!
//! A [`TaskContext`] holds the complete register image of a suspended
//! task: all GPRs, RIP/RSP/RFLAGS, segment selectors and CR3. Four asm
//! routines move the CPU between contexts:
//!
//! - [`context_switch`]: save the running kernel context, resume another
//!   kernel context (plain `ret`-style switch).
//! - [`context_load`]: resume a kernel context without saving anything
//!   (first dispatch, or when the outgoing context is already captured).
//! - [`context_enter_user`]: restore a ring-3 context via `iretq` so the
//!   CPU performs the privilege transition.
//! - [`context_save_and_enter_user`]: save the running kernel context,
//!   then `iretq` into a ring-3 context.
//!
//! Layout offsets are fixed by the asm below; the `const` assertions keep
//! the struct honest.

use core::arch::naked_asm;

use super::gdt;

/// Complete register image of a suspended task.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TaskContext {
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
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    // Segment selectors, widened to u64 to keep the asm offsets regular.
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub cr3: u64,
}

const _: () = {
    assert!(core::mem::offset_of!(TaskContext, rdi) == 0x40);
    assert!(core::mem::offset_of!(TaskContext, rax) == 0x70);
    assert!(core::mem::offset_of!(TaskContext, rsp) == 0x78);
    assert!(core::mem::offset_of!(TaskContext, rip) == 0x80);
    assert!(core::mem::offset_of!(TaskContext, rflags) == 0x88);
    assert!(core::mem::offset_of!(TaskContext, cs) == 0x90);
    assert!(core::mem::offset_of!(TaskContext, ss) == 0x98);
    assert!(core::mem::offset_of!(TaskContext, ds) == 0xA0);
    assert!(core::mem::offset_of!(TaskContext, es) == 0xA8);
    assert!(core::mem::offset_of!(TaskContext, cr3) == 0xC0);
};

/// RFLAGS for fresh tasks: IF set, reserved bit 1 set.
const INITIAL_RFLAGS: u64 = 0x202;

impl TaskContext {
    pub const fn zeroed() -> Self {
        Self {
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
            rsp: 0,
            rip: 0,
            rflags: INITIAL_RFLAGS,
            cs: 0,
            ss: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            cr3: 0,
        }
    }

    /// Initial ring-0 context: entry at `entry`, stack just below
    /// `stack_top` (16 bytes of slack for the entry wrapper's frame).
    pub fn new_kernel(entry: u64, stack_top: u64, cr3: u64) -> Self {
        let mut ctx = Self::zeroed();
        ctx.rip = entry;
        ctx.rsp = stack_top - 16;
        ctx.cs = gdt::KERNEL_CODE_SELECTOR as u64;
        ctx.ss = gdt::KERNEL_DATA_SELECTOR as u64;
        ctx.ds = gdt::KERNEL_DATA_SELECTOR as u64;
        ctx.es = gdt::KERNEL_DATA_SELECTOR as u64;
        ctx.cr3 = cr3;
        ctx
    }

    /// Initial ring-3 context.
    pub fn new_user(entry: u64, user_stack_top: u64, cr3: u64) -> Self {
        let mut ctx = Self::zeroed();
        ctx.rip = entry;
        ctx.rsp = user_stack_top - 16;
        ctx.cs = gdt::USER_CODE_SELECTOR as u64;
        ctx.ss = gdt::USER_DATA_SELECTOR as u64;
        ctx.ds = gdt::USER_DATA_SELECTOR as u64;
        ctx.es = gdt::USER_DATA_SELECTOR as u64;
        ctx.cr3 = cr3;
        ctx
    }

    /// First argument for the task entry (System V: RDI).
    pub fn set_arg(&mut self, arg: u64) {
        self.rdi = arg;
    }

    /// Whether this context resumes in ring 3.
    pub fn is_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

/// Save the running kernel context into `current`, resume `next`.
///
/// When `current` is later resumed, it observes this call returning
/// normally with all registers intact.
///
/// # Safety
///
/// Both pointers must reference valid contexts; `next` must be a ring-0
/// context whose stack and CR3 are live. Interrupt state is carried in the
/// saved RFLAGS.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(current: *mut TaskContext, next: *const TaskContext) {
    naked_asm!(
        // Save all GPRs before any of them is used as scratch.
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x40], rdi",
        "mov [rdi + 0x48], rsi",
        "mov [rdi + 0x50], rbp",
        "mov [rdi + 0x58], rbx",
        "mov [rdi + 0x60], rdx",
        "mov [rdi + 0x68], rcx",
        "mov [rdi + 0x70], rax",
        // Resume point: the return address becomes RIP, the stack pointer
        // past it becomes RSP.
        "mov rax, [rsp]",
        "mov [rdi + 0x80], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x78], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x88], rax",
        "mov rax, cr3",
        "mov [rdi + 0xC0], rax",
        // Load the next kernel context. CR3 of zero means "keep the
        // current directory".
        "mov rax, [rsi + 0xC0]",
        "test rax, rax",
        "jz 2f",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 2f",
        "mov cr3, rax",
        "2:",
        "mov rsp, [rsi + 0x78]",
        "push qword ptr [rsi + 0x80]",
        "push qword ptr [rsi + 0x88]",
        "popfq",
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r11, [rsi + 0x20]",
        "mov r10, [rsi + 0x28]",
        "mov r9,  [rsi + 0x30]",
        "mov r8,  [rsi + 0x38]",
        "mov rdi, [rsi + 0x40]",
        "mov rbp, [rsi + 0x50]",
        "mov rbx, [rsi + 0x58]",
        "mov rdx, [rsi + 0x60]",
        "mov rcx, [rsi + 0x68]",
        "mov rax, [rsi + 0x70]",
        "mov rsi, [rsi + 0x48]",
        "ret",
    );
}

/// Resume a ring-0 context, discarding the current one.
///
/// # Safety
///
/// `ctx` must be a valid ring-0 context with a live stack and CR3. The
/// current stack is abandoned.
#[unsafe(naked)]
pub unsafe extern "C" fn context_load(ctx: *const TaskContext) -> ! {
    naked_asm!(
        "mov rax, [rdi + 0xC0]",
        "test rax, rax",
        "jz 2f",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 2f",
        "mov cr3, rax",
        "2:",
        "mov rsp, [rdi + 0x78]",
        "push qword ptr [rdi + 0x80]",
        "push qword ptr [rdi + 0x88]",
        "popfq",
        "mov r15, [rdi + 0x00]",
        "mov r14, [rdi + 0x08]",
        "mov r13, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r11, [rdi + 0x20]",
        "mov r10, [rdi + 0x28]",
        "mov r9,  [rdi + 0x30]",
        "mov r8,  [rdi + 0x38]",
        "mov rsi, [rdi + 0x48]",
        "mov rbp, [rdi + 0x50]",
        "mov rbx, [rdi + 0x58]",
        "mov rdx, [rdi + 0x60]",
        "mov rcx, [rdi + 0x68]",
        "mov rax, [rdi + 0x70]",
        "mov rdi, [rdi + 0x40]",
        "ret",
    );
}

/// Restore a ring-3 context via `iretq`, discarding the current one.
///
/// The iretq frame (SS, RSP, RFLAGS, CS, RIP) is built on the running
/// kernel stack from the saved context, DS/ES are reloaded from it, and
/// the CPU drops to user mode. TSS.RSP0 must already point at the task's
/// kernel stack or the next trap lands on a stale one.
///
/// # Safety
///
/// `ctx` must be a valid ring-3 context whose CR3 maps the target code,
/// stack and the kernel high half.
#[unsafe(naked)]
pub unsafe extern "C" fn context_enter_user(ctx: *const TaskContext) -> ! {
    naked_asm!(
        "mov rax, [rdi + 0xC0]",
        "test rax, rax",
        "jz 2f",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 2f",
        "mov cr3, rax",
        "2:",
        "mov rax, [rdi + 0xA0]",
        "mov ds, ax",
        "mov rax, [rdi + 0xA8]",
        "mov es, ax",
        "push qword ptr [rdi + 0x98]",
        "push qword ptr [rdi + 0x78]",
        "push qword ptr [rdi + 0x88]",
        "push qword ptr [rdi + 0x90]",
        "push qword ptr [rdi + 0x80]",
        "mov r15, [rdi + 0x00]",
        "mov r14, [rdi + 0x08]",
        "mov r13, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r11, [rdi + 0x20]",
        "mov r10, [rdi + 0x28]",
        "mov r9,  [rdi + 0x30]",
        "mov r8,  [rdi + 0x38]",
        "mov rsi, [rdi + 0x48]",
        "mov rbp, [rdi + 0x50]",
        "mov rbx, [rdi + 0x58]",
        "mov rdx, [rdi + 0x60]",
        "mov rcx, [rdi + 0x68]",
        "mov rax, [rdi + 0x70]",
        "mov rdi, [rdi + 0x40]",
        "iretq",
    );
}

/// Save the running kernel context into `current`, then `iretq` into the
/// ring-3 context `next`.
///
/// # Safety
///
/// Combines the contracts of [`context_switch`] and
/// [`context_enter_user`].
#[unsafe(naked)]
pub unsafe extern "C" fn context_save_and_enter_user(
    current: *mut TaskContext,
    next: *const TaskContext,
) {
    naked_asm!(
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x40], rdi",
        "mov [rdi + 0x48], rsi",
        "mov [rdi + 0x50], rbp",
        "mov [rdi + 0x58], rbx",
        "mov [rdi + 0x60], rdx",
        "mov [rdi + 0x68], rcx",
        "mov [rdi + 0x70], rax",
        "mov rax, [rsp]",
        "mov [rdi + 0x80], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x78], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x88], rax",
        "mov rax, cr3",
        "mov [rdi + 0xC0], rax",
        "mov rdi, rsi",
        "jmp {enter_user}",
        enter_user = sym context_enter_user,
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_context_shape() {
        let ctx = TaskContext::new_kernel(0xFFFF_9000_0000_0000, 0xFFFF_A000_0001_0000, 0x1000);
        assert_eq!(ctx.rsp, 0xFFFF_A000_0001_0000 - 16);
        assert_eq!(ctx.rflags, 0x202, "IF must be set on fresh contexts");
        assert_eq!(ctx.cs, 0x08);
        assert_eq!(ctx.ss, 0x10);
        assert!(!ctx.is_user());
    }

    #[test]
    fn test_user_context_shape() {
        let mut ctx = TaskContext::new_user(0x40_0000, 0x7FFF_F000, 0x2000);
        ctx.set_arg(7);
        assert_eq!(ctx.cs, 0x23);
        assert_eq!(ctx.ss, 0x1B);
        assert_eq!(ctx.rdi, 7);
        assert!(ctx.is_user());
        assert_eq!(ctx.cr3, 0x2000);
    }
}
