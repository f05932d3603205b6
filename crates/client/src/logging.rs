//! Logging macros.
//!
//! Thin wrappers over `tracing` that pin every event to the
//! `notiflow_client` target, so one `EnvFilter` directive controls the
//! whole crate. Arguments are passed through unchanged: format strings and
//! structured fields both work.
//!
//! ```ignore
//! log_info!(attempt = 3, "reconnecting in {:?}", delay);
//! ```

#[doc(hidden)]
pub use tracing as __tracing;

pub const TARGET: &str = "notiflow_client";

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::info!(target: $crate::logging::TARGET, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::error!(target: $crate::logging::TARGET, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::warn!(target: $crate::logging::TARGET, $($arg)*)
    };
}

/// Connection state transitions and dropped stale events go here.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::debug!(target: $crate::logging::TARGET, $($arg)*)
    };
}
