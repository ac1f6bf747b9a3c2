//! Account identities.
//!
//! An account is addressed by an ACI (account identity) or a PNI (phone-number
//! identity). Both wrap a UUID and differ only in their textual and binary
//! prefixes.

mod service_identifier;
mod uuid_bytes;

pub use service_identifier::{IdentityType, ServiceIdentifier};
pub use uuid_bytes::{uuid_from_bytes, uuid_to_bytes};

/// Error type for identity parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid UUID string: {0}")]
    InvalidUuid(String),

    #[error("Identifier did not start with the \"{expected}\" prefix")]
    MissingPrefix { expected: &'static str },

    #[error("Unexpected byte array length: {0}")]
    InvalidLength(usize),

    #[error("Unexpected byte array prefix: {0:#04x}")]
    InvalidPrefix(u8),
}
