//! Helper macros for logging (console printing).

use env_logger::Env;

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_debug!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_info!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_warn!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_error!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return an `Err(GuidStoreError)`
/// containing the string.
///
/// Example:
/// ```no_compile
/// return logged_err!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {
        {
            $crate::pf_error!($prefix; $fmt_str);
            Err($crate::GuidStoreError::msg($fmt_str))
        }
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        {
            $crate::pf_error!($prefix; $fmt_str, $($fmt_arg)*);
            Err($crate::GuidStoreError::msg(format!($fmt_str, $($fmt_arg)*)))
        }
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}
