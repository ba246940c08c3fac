//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for replicore.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ReplicoreError(pub String);

impl ReplicoreError {
    /// Wraps anything that can be turned into a string.
    pub fn msg(msg: impl ToString) -> Self {
        ReplicoreError(msg.to_string())
    }
}

impl fmt::Display for ReplicoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for ReplicoreError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ReplicoreError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ReplicoreError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ReplicoreError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::num::ParseIntError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
