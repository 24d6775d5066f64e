//! Side-effecting adapters for the job engine.

pub mod config;
pub mod git;
pub mod process;
pub mod prompt;
pub mod store;
pub mod tracker;
pub mod workspace;
