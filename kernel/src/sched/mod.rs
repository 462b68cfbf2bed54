//! Task management and scheduling
//!
//! [`task`] defines the task control block, [`queue`] the intrusive ready
//! queue, [`scheduler`] the dispatch loop and preemption machinery, and
//! [`task_management`] creation, termination and the wait/exit plumbing.

pub mod queue;
pub mod scheduler;
pub mod task;
pub mod task_management;

pub use scheduler::{
    block_current_task, capture_user_context, current_task_id, discard_captured_context,
    on_irq_exit, schedule, scheduler_start, scheduler_timer_tick, set_preemption_enabled,
    sleep_ms, task_wait_for, yield_current,
};
pub use task_management::{
    task_create, task_exit, task_terminate, terminate_current_from_fault,
};
