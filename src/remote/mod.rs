//! Communication with the central server.
//!
//! - [`client`]: the [`TaskReporter`] seam and its HTTP implementation
//! - [`poller`]: claims leased tasks and hands them to the scheduler
//! - [`syncer`]: reconciles terminal results the inline reports missed

pub mod client;
pub mod poller;
pub mod syncer;

pub use client::{ServerClient, TaskReporter};
pub use poller::TaskPoller;
pub use syncer::{ResultSyncer, SyncReport};
