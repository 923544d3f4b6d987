//! Side-effecting operations: storage, browser, model servers and the human gate.
//!
//! Everything behind a trait here ([`browser::BrowserDriver`],
//! [`model::TextModel`], [`model::VisionModel`]) has a test double in
//! `test_support`.

pub mod attempt_log;
pub mod browser;
pub mod config;
pub mod init;
pub mod intervention;
pub mod model;
pub mod monitor;
pub mod process;
pub mod profile;
pub mod prompt;
pub mod store;
pub mod webdriver;
