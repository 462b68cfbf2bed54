//! Task control blocks

use bitflags::bitflags;
use log::warn;

use crate::arch::x86_64::context::TaskContext;
use crate::mm::vas::INVALID_PROCESS_ID;

pub type TaskId = u16;

/// Sentinel: terminates ready-queue chains and marks "no task".
pub const INVALID_TASK_ID: TaskId = u16::MAX;

/// Size of the task table.
pub const MAX_TASKS: usize = 32;

/// Task name storage, including the NUL-ish tail.
pub const TASK_NAME_LEN: usize = 32;

/// Timer ticks per quantum.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Kernel and RSP0 stacks come from the kernel heap.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// User stacks live at the top of the lower half.
pub const USER_STACK_SIZE: u64 = 64 * 1024;
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFF0_0000;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot unused, reusable.
    Invalid,
    Ready,
    Running,
    Blocked,
    /// Finished; resources reclaimed once the task is off-CPU.
    Terminated,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        const KERNEL_MODE = 1 << 0;
        const USER_MODE = 1 << 1;
        /// Never preempted by the timer; runs until it yields or exits.
        const NO_PREEMPT = 1 << 2;
        /// The idle task: runs only when the ready queue is empty and is
        /// never enqueued.
        const IDLE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    None,
    Normal,
    UserFault,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    None,
    UserPage,
    UserGp,
    UserUd,
    UserDeviceNa,
}

/// Task control block.
pub struct Task {
    pub task_id: TaskId,
    pub name: [u8; TASK_NAME_LEN],
    pub state: TaskState,
    pub priority: u8,
    pub flags: TaskFlags,
    pub process_id: u32,
    pub user_stack_base: u64,
    pub user_stack_size: u64,
    pub kernel_stack_base: u64,
    pub kernel_stack_top: u64,
    pub entry: u64,
    pub arg: u64,
    pub context: TaskContext,
    pub time_slice: u32,
    pub time_slice_remaining: u32,
    pub total_runtime: u64,
    pub creation_time: u64,
    pub yield_count: u64,
    pub last_run_ts: u64,
    pub waiting_on_task_id: TaskId,
    /// Tick at which a sleeping task becomes ready again (0 = not asleep).
    pub wake_tick: u64,
    pub user_started: bool,
    /// The context field holds a ring-3 image captured at trap entry; the
    /// scheduler must not overwrite it with a kernel continuation.
    pub context_from_user: bool,
    /// Mid-syscall: preemption is deferred until the trap returns.
    pub in_syscall: bool,
    pub exit_reason: ExitReason,
    pub fault_reason: FaultReason,
    pub exit_code: i32,
    pub next_ready: TaskId,
}

impl Task {
    pub const fn empty() -> Self {
        Self {
            task_id: INVALID_TASK_ID,
            name: [0; TASK_NAME_LEN],
            state: TaskState::Invalid,
            priority: 0,
            flags: TaskFlags::empty(),
            process_id: INVALID_PROCESS_ID,
            user_stack_base: 0,
            user_stack_size: 0,
            kernel_stack_base: 0,
            kernel_stack_top: 0,
            entry: 0,
            arg: 0,
            context: TaskContext::zeroed(),
            time_slice: DEFAULT_TIME_SLICE,
            time_slice_remaining: DEFAULT_TIME_SLICE,
            total_runtime: 0,
            creation_time: 0,
            yield_count: 0,
            last_run_ts: 0,
            waiting_on_task_id: INVALID_TASK_ID,
            wake_tick: 0,
            user_started: false,
            context_from_user: false,
            in_syscall: false,
            exit_reason: ExitReason::None,
            fault_reason: FaultReason::None,
            exit_code: 0,
            next_ready: INVALID_TASK_ID,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name[len..].fill(0);
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }

    pub fn is_user(&self) -> bool {
        self.flags.contains(TaskFlags::USER_MODE)
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(TaskFlags::IDLE)
    }

    /// Record a state change. Illegal transitions are logged for
    /// diagnostics but still recorded; refusing them would leave the
    /// table and the queues disagreeing about reality.
    pub fn set_state(&mut self, new: TaskState) {
        if !transition_allowed(self.state, new) {
            warn!(
                "task {}: illegal state transition {:?} -> {:?}",
                self.task_id, self.state, new
            );
        }
        self.state = new;
    }
}

/// The legal task lifecycle.
pub fn transition_allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Invalid, Ready)
            | (Ready, Running)
            | (Ready, Terminated)
            | (Running, Ready)
            | (Running, Blocked)
            | (Running, Terminated)
            | (Blocked, Ready)
            | (Blocked, Terminated)
            | (Terminated, Invalid)
    )
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        let mut t = Task::empty();
        t.set_name("gatekeeper");
        assert_eq!(t.name_str(), "gatekeeper");
        t.set_name("a-very-long-name-that-exceeds-the-thirty-two-byte-field");
        assert_eq!(t.name_str().len(), TASK_NAME_LEN - 1);
    }

    #[test]
    fn test_lifecycle_transitions() {
        use TaskState::*;
        assert!(transition_allowed(Invalid, Ready));
        assert!(transition_allowed(Ready, Running));
        assert!(transition_allowed(Running, Blocked));
        assert!(transition_allowed(Blocked, Ready));
        assert!(transition_allowed(Running, Terminated));
        assert!(transition_allowed(Terminated, Invalid));
        assert!(!transition_allowed(Invalid, Running));
        assert!(!transition_allowed(Blocked, Running));
        assert!(!transition_allowed(Terminated, Ready));
    }

    #[test]
    fn test_illegal_transition_still_recorded() {
        let mut t = Task::empty();
        t.set_state(TaskState::Running); // illegal from Invalid, but recorded
        assert_eq!(t.state, TaskState::Running);
    }
}
