//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//!
//! - **Job log and attempt log (`io/store`, `io/attempt_log`)**: Product
//!   record. The job log lives in the database; per-iteration prompts and
//!   responses land in `<state_dir>/attempts/`. Unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter for the CLI.
pub const CLI_DEFAULT: &str = "warn";

/// Initialize the tracing subscriber with [`CLI_DEFAULT`].
///
/// # Example
/// ```bash
/// RUST_LOG=autoapply=debug autoapply work --once
/// ```
pub fn init() {
    init_with_default(CLI_DEFAULT);
}

/// Initialize the tracing subscriber; `default` applies when `RUST_LOG` is unset.
///
/// Output: stderr, compact format.
pub fn init_with_default(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
