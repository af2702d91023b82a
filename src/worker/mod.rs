//! Execution pool for task commands.
//!
//! - [`TaskExecutor`]: bounded-concurrency runner. Spawns the command, enforces
//!   the timeout, captures output and records the result on the task.
//! - [`CommandValidator`]: optional allow-list / blocked-pattern check applied
//!   before anything is spawned.
//! - [`output`]: per-stream capture with a byte limit.
//!
//! # Execution Flow
//!
//! 1. The scheduler reserves a slot with [`TaskExecutor::try_admit`]
//! 2. [`TaskExecutor::execute_cancellable`] spawns `sh -c <command>` (or the command
//!    with its args) in a new process group
//! 3. The run ends on exit, timeout or cancellation; the latter two SIGTERM the
//!    group and SIGKILL it after a grace period
//! 4. Status, exit code, output and timestamps are written back to the task

pub mod executor;
pub mod output;
pub mod validator;

pub use executor::{Admission, TaskExecutor};
pub use validator::CommandValidator;
