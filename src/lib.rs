pub mod agent;
pub mod config;
pub mod error;
pub mod remote;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
