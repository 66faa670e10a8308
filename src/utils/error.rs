//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Unified error type for GuidStore. The dedicated variants are the failure
/// kinds surfaced to callers or acted upon by replicas; everything else is
/// carried as a plain message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GuidStoreError {
    /// Free-form failure message.
    Msg(String),

    /// No majority answered within the deadline after bounded retries.
    ConsensusTimeout { group: u32, attempts: usize },

    /// Authorization failed for the given accessor.
    AclDenied { accessor: String, field: String },

    /// Target record does not exist.
    RecordNotFound(String),

    /// Majority of the group unreachable.
    GroupUnavailable(u32),

    /// Log discontinuity between `expected` and `got`.
    SlotGap { expected: usize, got: usize },
}

impl GuidStoreError {
    pub fn msg(msg: impl ToString) -> Self {
        GuidStoreError::Msg(msg.to_string())
    }
}

impl fmt::Display for GuidStoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GuidStoreError::Msg(m) => write!(f, "{}", m),
            GuidStoreError::ConsensusTimeout { group, attempts } => write!(
                f,
                "consensus timeout on group {} after {} attempts",
                group, attempts
            ),
            GuidStoreError::AclDenied { accessor, field } => {
                write!(f, "accessor '{}' denied on field '{}'", accessor, field)
            }
            GuidStoreError::RecordNotFound(guid) => {
                write!(f, "record '{}' not found", guid)
            }
            GuidStoreError::GroupUnavailable(group) => {
                write!(f, "group {} unavailable", group)
            }
            GuidStoreError::SlotGap { expected, got } => {
                write!(f, "slot gap: expected {} got {}", expected, got)
            }
        }
    }
}

impl error::Error for GuidStoreError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `GuidStoreError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for GuidStoreError {
            fn from(e: $error) -> Self {
                GuidStoreError::Msg(e.to_string())
            }
        }
    };
}

// Same as above, for generic error types.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for GuidStoreError {
            fn from(e: $error) -> GuidStoreError {
                GuidStoreError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(std::sync::PoisonError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = GuidStoreError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        let e = GuidStoreError::SlotGap {
            expected: 7,
            got: 9,
        };
        assert_eq!(format!("{}", e), "slot gap: expected 7 got 9");
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = GuidStoreError::from(io_error);
        assert!(
            matches!(e, GuidStoreError::Msg(ref m) if m.contains("oh no!"))
        );
    }

    #[test]
    fn denial_display() {
        let e = GuidStoreError::AclDenied {
            accessor: "bob".into(),
            field: "ssn".into(),
        };
        assert_eq!(format!("{}", e), "accessor 'bob' denied on field 'ssn'");
    }
}
