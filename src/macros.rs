//! Internal logging macros.
//!
//! With the `logging` feature (default) these forward to `tracing` at the
//! matching level. Without it, `log_error!` still prints to stderr so
//! critical failures stay visible; the other levels evaluate their format
//! arguments and discard them, so call sites compile identically under both
//! configurations and keep their argument captures "used".
//!
//! Every expansion is a block expression, valid in statement and expression
//! position alike (match arms included).

macro_rules! log_error {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::error!($($arg)*);
        #[cfg(not(feature = "logging"))]
        eprintln!($($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::warn!($($arg)*);
        #[cfg(not(feature = "logging"))]
        { let _ = format_args!($($arg)*); }
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::info!($($arg)*);
        #[cfg(not(feature = "logging"))]
        { let _ = format_args!($($arg)*); }
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        tracing::debug!($($arg)*);
        #[cfg(not(feature = "logging"))]
        { let _ = format_args!($($arg)*); }
    }};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;

#[cfg(test)]
mod tests {
    // ---
    use super::{log_debug, log_info, log_warn};

    #[test]
    fn test_macros_are_valid_in_expression_position() {
        // ---
        // Match arms use the macros as the whole arm body; this must compile
        // with and without the `logging` feature.
        let reply_to: Option<&str> = None;
        match reply_to {
            Some(_) => {}
            None => log_warn!("request without reply_to, discarding reply"),
        }

        let expired = 0;
        if expired > 0 {
            log_debug!("sweep expired {expired} pending call(s)");
        } else {
            log_info!("nothing expired");
        }
    }
}
