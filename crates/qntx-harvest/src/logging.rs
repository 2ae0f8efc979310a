//! Subscriber setup for hosts embedding the engine
//!
//! The engine only emits `tracing` events and never installs a global
//! subscriber itself. Delivery and event threads are named after the
//! engine (`<name>-delivery`, `<name>-events`), so the formatter prints
//! thread names to tell their lines apart.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter applied when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info";

/// Install a compact subscriber filtered by `RUST_LOG`, else [`DEFAULT_FILTER`].
///
/// Returns false when a global subscriber was already in place.
pub fn init() -> bool {
    init_with_filter(DEFAULT_FILTER)
}

/// Like [`init`] with a caller-chosen fallback, e.g. `"qntx_harvest=debug"`.
pub fn init_with_filter(fallback: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_thread_names(true))
        .try_init()
        .is_ok()
}

/// Glyphs that mark session boundaries and buffer traffic in host logs.
pub mod prefix {
    pub const SESSION_OPEN: &str = "✿";
    pub const SESSION_CLOSE: &str = "❀";
    /// Per-buffer lines, only emitted with `log_buffers`
    pub const BUFFER: &str = "▤";
}
