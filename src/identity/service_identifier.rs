use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use super::{uuid_from_bytes, uuid_to_bytes, IdentityError};

const HYPHENATED_UUID_LEN: usize = 36;

/// The two identity kinds with their binary and textual prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityType {
    Aci,
    Pni,
}

impl IdentityType {
    pub fn byte_prefix(&self) -> u8 {
        match self {
            IdentityType::Aci => 0x00,
            IdentityType::Pni => 0x01,
        }
    }

    pub fn string_prefix(&self) -> &'static str {
        match self {
            IdentityType::Aci => "ACI:",
            IdentityType::Pni => "PNI:",
        }
    }
}

/// An account-or-alias identity.
///
/// Textual form is the bare UUID for ACIs and `PNI:<uuid>` for PNIs. The
/// compact binary form omits the prefix byte for ACIs only; the fixed-width
/// form always carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceIdentifier {
    Aci(Uuid),
    Pni(Uuid),
}

impl ServiceIdentifier {
    pub fn identity_type(&self) -> IdentityType {
        match self {
            ServiceIdentifier::Aci(_) => IdentityType::Aci,
            ServiceIdentifier::Pni(_) => IdentityType::Pni,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            ServiceIdentifier::Aci(uuid) | ServiceIdentifier::Pni(uuid) => *uuid,
        }
    }

    pub fn to_service_identifier_string(&self) -> String {
        self.to_string()
    }

    pub fn to_compact_bytes(&self) -> Vec<u8> {
        match self {
            ServiceIdentifier::Aci(uuid) => uuid_to_bytes(uuid).to_vec(),
            ServiceIdentifier::Pni(_) => self.to_fixed_width_bytes().to_vec(),
        }
    }

    pub fn to_fixed_width_bytes(&self) -> [u8; 17] {
        let mut bytes = [0u8; 17];
        bytes[0] = self.identity_type().byte_prefix();
        bytes[1..].copy_from_slice(&uuid_to_bytes(&self.uuid()));
        bytes
    }

    /// Parse an ACI first, falling back to PNI.
    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        Self::parse_aci(value).or_else(|_| Self::parse_pni(value))
    }

    pub fn parse_aci(value: &str) -> Result<Self, IdentityError> {
        parse_hyphenated(value).map(ServiceIdentifier::Aci)
    }

    pub fn parse_pni(value: &str) -> Result<Self, IdentityError> {
        let prefix = IdentityType::Pni.string_prefix();
        let uuid = value
            .strip_prefix(prefix)
            .ok_or(IdentityError::MissingPrefix { expected: prefix })?;
        parse_hyphenated(uuid).map(ServiceIdentifier::Pni)
    }

    /// Decode compact or fixed-width bytes, ACI first.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        Self::aci_from_bytes(bytes).or_else(|_| Self::pni_from_bytes(bytes))
    }

    /// Accepts 16 bare bytes or 17 bytes with the ACI prefix.
    pub fn aci_from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let uuid = match bytes.len() {
            17 => {
                if bytes[0] != IdentityType::Aci.byte_prefix() {
                    return Err(IdentityError::InvalidPrefix(bytes[0]));
                }
                uuid_from_bytes(&bytes[1..])?
            }
            _ => uuid_from_bytes(bytes)?,
        };
        Ok(ServiceIdentifier::Aci(uuid))
    }

    /// Accepts only 17 bytes with the PNI prefix.
    pub fn pni_from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != 17 {
            return Err(IdentityError::InvalidLength(bytes.len()));
        }
        if bytes[0] != IdentityType::Pni.byte_prefix() {
            return Err(IdentityError::InvalidPrefix(bytes[0]));
        }
        Ok(ServiceIdentifier::Pni(uuid_from_bytes(&bytes[1..])?))
    }
}

fn parse_hyphenated(value: &str) -> Result<Uuid, IdentityError> {
    if value.len() != HYPHENATED_UUID_LEN {
        return Err(IdentityError::InvalidUuid(value.to_string()));
    }
    Uuid::try_parse(value).map_err(|_| IdentityError::InvalidUuid(value.to_string()))
}

impl fmt::Display for ServiceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceIdentifier::Aci(uuid) => write!(f, "{}", uuid.hyphenated()),
            ServiceIdentifier::Pni(uuid) => {
                write!(f, "{}{}", IdentityType::Pni.string_prefix(), uuid.hyphenated())
            }
        }
    }
}

impl FromStr for ServiceIdentifier {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ServiceIdentifier> for String {
    fn from(id: ServiceIdentifier) -> Self {
        id.to_string()
    }
}
