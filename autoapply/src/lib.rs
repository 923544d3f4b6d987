//! Autonomous job-application agent.
//!
//! Workers claim job URLs from a shared queue and drive a browser through
//! the application form with a perceive, decide, act loop. The crate keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (status transitions, perception
//!   filtering, decision parsing, budgets). No I/O.
//! - **[`io`]**: Side-effecting adapters (SQLite store, WebDriver, model
//!   server, intervention gate, monitor, config and profile files).
//!
//! Orchestration modules ([`perceive`], [`decide`], [`dispatch`], [`job`],
//! [`worker`]) combine the two into the per-job state machine.

pub mod core;
pub mod decide;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod job;
pub mod logging;
pub mod perceive;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
