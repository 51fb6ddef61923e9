//! Side-effecting helpers: stores, processes, prompts, config.

pub mod atomic;
pub mod config;
pub mod executor;
pub mod git;
pub mod init;
pub mod platform;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod store;
pub mod worker;
