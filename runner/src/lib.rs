//! Background job engine for autonomous coding agents.
//!
//! A job takes a repository and a task (an issue, a direct request or a
//! follow-up on an existing branch), runs an agent in an isolated workspace
//! and publishes the result as a pushed branch. The crate keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (status transitions, branch
//!   naming, stream decoding, change descriptions). No I/O.
//! - **[`io`]**: Side-effecting adapters (processes, git, issue tracker,
//!   store, prompts, workspaces). Isolated to enable fakes in tests.
//!
//! [`engine`] coordinates both, with [`provider`] supplying the agent,
//! [`bus`] fanning out live log lines and [`cancel`] tracking running jobs.

pub mod bus;
pub mod cancel;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod provider;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
