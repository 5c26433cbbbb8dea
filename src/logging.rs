//! Shared logging setup for both binaries.
//!
//! Leveled, `RUST_LOG`-filterable output. Recoverable conditions (framing
//! errors, fork failures for individual tasks, reap failures) are logged at
//! `warn!`/`error!` from the subsystem that observed them; nothing here
//! changes control flow.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes the global logger exactly once per process. Safe to call
/// from both binaries and from tests.
pub fn init() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .init();
    });
}
