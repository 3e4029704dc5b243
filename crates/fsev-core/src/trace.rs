//! Process-wide diagnostic tracing switch.
//!
//! Diagnostic tracing is a very chatty, opt-in channel for investigating
//! the native callback path (callback entry, chunk boundaries, handler
//! failures). It is decided once per process and never changes after
//! that: either explicitly through [`init`] at startup, or lazily from
//! the [`TRACE_ENV`] environment variable the first time it is read.
//!
//! Records are emitted through [`diag!`](crate::diag) at `TRACE` level,
//! so a subscriber filter still applies on top of the switch.
//!
//! # Examples
//!
//! ```
//! fsev_core::trace::init(true);
//! assert!(fsev_core::trace::enabled());
//! fsev_core::diag!(events = 3, "callback fired");
//! ```

use std::sync::OnceLock;

/// Environment variable consulted when [`init`] was never called.
pub const TRACE_ENV: &str = "FSEV_TRACE";

static TRACING_ENABLED: OnceLock<bool> = OnceLock::new();

/// Fixes the diagnostic tracing switch for the rest of the process.
///
/// The first decision wins. Returns the value that is in effect, which
/// differs from `enabled` if the switch had already been decided.
pub fn init(enabled: bool) -> bool {
    *TRACING_ENABLED.get_or_init(|| enabled)
}

/// Returns whether diagnostic tracing is on.
#[inline]
#[must_use]
pub fn enabled() -> bool {
    *TRACING_ENABLED.get_or_init(from_env)
}

fn from_env() -> bool {
    std::env::var(TRACE_ENV).is_ok_and(|value| parse_switch(&value))
}

/// Parses a boolean switch value the way the CLI and environment accept it.
fn parse_switch(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Emits a `TRACE` record only when diagnostic tracing is enabled.
///
/// Accepts the same arguments as [`tracing::trace!`].
#[macro_export]
macro_rules! diag {
    ($($arg:tt)+) => {
        if $crate::trace::enabled() {
            $crate::__tracing::trace!(target: "fsev::diag", $($arg)+);
        }
    };
}
