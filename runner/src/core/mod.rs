//! Deterministic, pure logic shared by the job engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod branch;
pub mod description;
pub mod stage;
pub mod status;
pub mod stream;
pub mod tool_summary;
pub mod types;
