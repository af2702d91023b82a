//! Durable task records.
//!
//! The store is the source of truth for task status. Everything else (the
//! in-memory queue, running executions) is rebuilt from it after a restart.

mod sqlite;

pub use sqlite::TaskStore;
