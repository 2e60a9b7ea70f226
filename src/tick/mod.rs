//! Tick thread: scheduling, deferred tasks and crash diagnostics

pub mod diagnostics;
pub mod scheduler;
pub mod task_queue;
