//! Deterministic, pure logic shared by the agent core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures (page candidates, model text, history) and return
//! deterministic outputs suitable for tests.

pub mod budget;
pub mod decision;
pub mod perception;
pub mod phase;
pub mod scratchpad;
pub mod tools;
pub mod types;
