//! Task creation, termination and the wait/exit plumbing
//!
//! Creation allocates the stacks (kernel heap) and, for user tasks, a
//! process address space before touching the scheduler lock. Termination
//! is idempotent; a task terminating itself keeps its stack and VM until
//! a later reaping pass, because nobody frees the stack they are standing
//! on.

use log::{debug, info};

use super::scheduler::{self, SCHED};
use super::task::{
    ExitReason, FaultReason, Task, TaskFlags, TaskId, TaskState, INVALID_TASK_ID,
    KERNEL_STACK_SIZE, MAX_TASKS, USER_STACK_SIZE, USER_STACK_TOP,
};
use crate::arch::x86_64::context::TaskContext;
use crate::arch::x86_64::timer;
use crate::error::{KernelError, KernelResult};
use crate::mm::heap;
use crate::mm::page_table::{self, PageFlags};
use crate::mm::vas;

/// Resources owned by a dead task, released outside the scheduler lock.
struct Reclaim {
    kernel_stack_base: u64,
    process_id: u32,
    is_user: bool,
}

fn release(r: Reclaim) {
    if r.kernel_stack_base != 0 {
        heap::kfree(r.kernel_stack_base as *mut u8);
    }
    if r.is_user && r.process_id != vas::INVALID_PROCESS_ID {
        if let Err(e) = vas::process_vm_destroy(r.process_id) {
            debug!("task reclaim: vm destroy failed: {}", e);
        }
    }
}

fn extract_reclaim(t: &mut Task) -> Reclaim {
    Reclaim {
        kernel_stack_base: t.kernel_stack_base,
        process_id: t.process_id,
        is_user: t.is_user(),
    }
}

/// All kernel tasks start here; the entry function and its argument ride
/// in RDI/RSI of the initial context.
extern "C" fn kernel_task_trampoline(entry: u64, arg: u64) -> ! {
    // SAFETY: task_create stores a `extern "C" fn(u64)` here.
    let f: extern "C" fn(u64) = unsafe { core::mem::transmute(entry as usize) };
    f(arg);
    task_exit(0);
}

/// The idle task: reap finished tasks, wait for an interrupt, offer the
/// CPU back.
extern "C" fn idle_task_main(_arg: u64) {
    loop {
        reap_finished();
        crate::sync::enable_interrupts();
        crate::arch::idle_once();
        scheduler::schedule();
    }
}

/// Create a task. Kernel mode when `flags` says so, user mode otherwise
/// (the default).
pub fn task_create(
    name: &str,
    entry: u64,
    arg: u64,
    mut flags: TaskFlags,
    priority: u8,
) -> KernelResult<TaskId> {
    reap_finished();

    if !flags.contains(TaskFlags::KERNEL_MODE) {
        flags |= TaskFlags::USER_MODE;
    }
    if entry == 0 {
        return Err(KernelError::InvalidArgument { name: "entry" });
    }

    // Gather resources before taking the scheduler lock.
    let mut process_id = vas::INVALID_PROCESS_ID;
    let mut user_stack_base = 0;
    let kernel_stack_base;
    let context;

    if flags.contains(TaskFlags::KERNEL_MODE) {
        let stack = heap::kmalloc(KERNEL_STACK_SIZE);
        if stack.is_null() {
            return Err(KernelError::OutOfMemory {
                requested: KERNEL_STACK_SIZE,
            });
        }
        kernel_stack_base = stack as u64;
        let stack_top = (kernel_stack_base + KERNEL_STACK_SIZE as u64) & !0xF;
        let mut ctx = TaskContext::new_kernel(
            kernel_task_trampoline as usize as u64,
            stack_top,
            page_table::kernel_pml4(),
        );
        ctx.rdi = entry;
        ctx.rsi = arg;
        context = ctx;
    } else {
        let pid = vas::process_vm_create()?;
        user_stack_base = USER_STACK_TOP - USER_STACK_SIZE;
        if let Err(e) =
            vas::process_vm_map_user(pid, user_stack_base, USER_STACK_SIZE, PageFlags::WRITABLE)
        {
            let _ = vas::process_vm_destroy(pid);
            return Err(e);
        }
        let stack = heap::kmalloc(KERNEL_STACK_SIZE);
        if stack.is_null() {
            let _ = vas::process_vm_destroy(pid);
            return Err(KernelError::OutOfMemory {
                requested: KERNEL_STACK_SIZE,
            });
        }
        kernel_stack_base = stack as u64;
        let pml4 = vas::process_vm_get_page_dir(pid)
            .ok_or(KernelError::ProcessNotFound { pid })?;
        let mut ctx = TaskContext::new_user(entry, USER_STACK_TOP, pml4);
        ctx.set_arg(arg);
        process_id = pid;
        context = ctx;
    }

    let created = {
        let mut guard = SCHED.lock();
        let g = &mut *guard;
        let slot = g
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Invalid);
        match slot {
            None => None,
            Some(slot) => {
                let id = slot as TaskId;
                let t = &mut g.tasks[slot];
                *t = Task::empty();
                t.task_id = id;
                t.set_name(name);
                t.priority = priority;
                t.flags = flags;
                t.process_id = process_id;
                t.user_stack_base = user_stack_base;
                t.user_stack_size = if user_stack_base != 0 { USER_STACK_SIZE } else { 0 };
                t.kernel_stack_base = kernel_stack_base;
                t.kernel_stack_top = (kernel_stack_base + KERNEL_STACK_SIZE as u64) & !0xF;
                t.entry = entry;
                t.arg = arg;
                t.context = context;
                t.creation_time = timer::ticks();
                t.set_state(TaskState::Ready);
                if !flags.contains(TaskFlags::IDLE) {
                    g.ready.enqueue(&mut g.tasks, id);
                } else {
                    g.idle = id;
                }
                Some(id)
            }
        }
    };

    match created {
        Some(id) => {
            info!("task {} '{}' created ({:?})", id, name, flags);
            Ok(id)
        }
        None => {
            release(Reclaim {
                kernel_stack_base,
                process_id,
                is_user: flags.contains(TaskFlags::USER_MODE),
            });
            Err(KernelError::ResourceExhausted {
                resource: "task slots",
            })
        }
    }
}

/// Create the idle task. It never enters the ready queue; the scheduler
/// falls back to it when nothing else is runnable.
pub fn create_idle_task() -> KernelResult<TaskId> {
    task_create(
        "idle",
        idle_task_main as usize as u64,
        0,
        TaskFlags::KERNEL_MODE | TaskFlags::IDLE,
        u8::MAX,
    )
}

/// Terminate a task. Idempotent: terminating a dead or never-created id
/// reports success. Self-termination leaves resource reclamation to the
/// next reaping pass; the caller must follow up with `schedule()`.
pub fn task_terminate(id: TaskId) -> KernelResult<()> {
    let reclaim = {
        let mut guard = SCHED.lock();
        let g = &mut *guard;
        if id as usize >= MAX_TASKS {
            return Ok(());
        }
        match g.tasks[id as usize].state {
            TaskState::Invalid | TaskState::Terminated => return Ok(()),
            _ => {}
        }

        g.ready.remove(&mut g.tasks, id);
        let now = timer::ticks();
        {
            let t = &mut g.tasks[id as usize];
            if t.state == TaskState::Running {
                t.total_runtime += now.saturating_sub(t.last_run_ts);
            }
            if t.exit_reason == ExitReason::None {
                t.exit_reason = ExitReason::Killed;
            }
            t.set_state(TaskState::Terminated);
        }
        info!("task {} terminated", id);

        // Release waiters in slot order.
        for i in 0..MAX_TASKS {
            if g.tasks[i].state == TaskState::Blocked
                && g.tasks[i].waiting_on_task_id == id
            {
                g.tasks[i].waiting_on_task_id = INVALID_TASK_ID;
                g.tasks[i].wake_tick = 0;
                g.tasks[i].set_state(TaskState::Ready);
                g.ready.enqueue(&mut g.tasks, i as TaskId);
            }
        }

        if g.current == id {
            // Still standing on its own stack; reaped once off-CPU.
            None
        } else {
            let r = extract_reclaim(&mut g.tasks[id as usize]);
            g.tasks[id as usize] = Task::empty();
            Some(r)
        }
    };
    if let Some(r) = reclaim {
        release(r);
    }
    Ok(())
}

/// Exit the current task and never come back.
pub fn task_exit(code: i32) -> ! {
    if let Some(id) = scheduler::current_task_id() {
        scheduler::with_current_task(|t| {
            t.exit_reason = ExitReason::Normal;
            t.exit_code = code;
        });
        let _ = task_terminate(id);
    }
    scheduler::schedule();
    // Only reachable when the scheduler has nothing to run at all.
    crate::arch::halt_loop();
}

/// Fault-policy termination of the current task (from exception context).
/// The interrupt path calls `schedule()` afterwards.
pub fn terminate_current_from_fault(reason: FaultReason) {
    if let Some(id) = scheduler::current_task_id() {
        scheduler::with_current_task(|t| {
            t.exit_reason = ExitReason::UserFault;
            t.fault_reason = reason;
            t.exit_code = 1;
        });
        let _ = task_terminate(id);
    }
}

/// Free the resources of terminated tasks that are no longer on the CPU.
/// Runs from the idle loop and before each creation.
pub fn reap_finished() {
    loop {
        let reclaim = {
            let mut guard = SCHED.lock();
            let g = &mut *guard;
            let slot = (0..MAX_TASKS).find(|&i| {
                g.tasks[i].state == TaskState::Terminated && g.current != i as TaskId
            });
            match slot {
                None => None,
                Some(i) => {
                    let r = extract_reclaim(&mut g.tasks[i]);
                    g.tasks[i] = Task::empty();
                    debug!("reaped task slot {}", i);
                    Some(r)
                }
            }
        };
        match reclaim {
            Some(r) => release(r),
            None => break,
        }
    }
}
