use uuid::Uuid;

use super::IdentityError;

/// Big-endian 16-byte form of a UUID.
pub fn uuid_to_bytes(uuid: &Uuid) -> [u8; 16] {
    *uuid.as_bytes()
}

/// Parse exactly 16 big-endian bytes into a UUID.
pub fn uuid_from_bytes(bytes: &[u8]) -> Result<Uuid, IdentityError> {
    Uuid::from_slice(bytes).map_err(|_| IdentityError::InvalidLength(bytes.len()))
}
