//! Task model, priority queue and the scheduler that drives execution.
//!
//! - [`task`]: the task record and its status machine
//! - [`queue`]: in-memory priority index of runnable tasks
//! - [`engine`]: recovery, dispatch, retry, cancellation and shutdown
//! - [`lease`]: periodic lease renewal for remote tasks while they run

pub mod engine;
pub mod lease;
pub mod queue;
pub mod task;

pub use engine::{QueueStatus, RecoveryReport, Scheduler};
pub use lease::{LeaseGuard, LeaseRenewer};
pub use queue::TaskQueue;
pub use task::{Task, TaskStatus, TaskType};
