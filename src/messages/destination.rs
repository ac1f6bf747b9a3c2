//! Mailbox key scheme.
//!
//! All per-mailbox keys share the `{<uuid>::<deviceId>}` hash tag so scripts
//! touching several of them stay inside one cluster slot. The per-slot queue
//! index uses a different, slot-derived tag so the persistence sweep can
//! address it by slot number alone.

use std::fmt;

use uuid::Uuid;

use crate::redis::slots::{key_slot, minimal_hash_tag};

use super::device::MAXIMUM_DEVICE_ID;

const MESSAGE_QUEUE_PREFIX: &str = "message_queue::";
const QUEUE_INDEX_PREFIX: &str = "message_queue_index::";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DestinationError {
    #[error("Device id {0} out of range 1..{MAXIMUM_DEVICE_ID}")]
    InvalidDeviceId(u8),

    #[error("Malformed queue name: {0}")]
    MalformedQueueName(String),
}

/// One mailbox: an account and one of its devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    uuid: Uuid,
    device_id: u8,
}

impl Destination {
    pub fn new(uuid: Uuid, device_id: u8) -> Result<Self, DestinationError> {
        if device_id == 0 || device_id >= MAXIMUM_DEVICE_ID {
            return Err(DestinationError::InvalidDeviceId(device_id));
        }
        Ok(Self { uuid, device_id })
    }

    /// Recover the destination from a queue key such as
    /// `message_queue::{<uuid>::<deviceId>}`, as returned by the sweep index.
    pub fn from_queue_key(queue_name: &str) -> Result<Self, DestinationError> {
        let malformed = || DestinationError::MalformedQueueName(queue_name.to_string());

        let open = queue_name.find('{').ok_or_else(malformed)?;
        let close = queue_name.rfind('}').ok_or_else(malformed)?;
        if close <= open {
            return Err(malformed());
        }

        let (uuid, device_id) = queue_name[open + 1..close]
            .rsplit_once("::")
            .ok_or_else(malformed)?;
        let uuid = Uuid::try_parse(uuid).map_err(|_| malformed())?;
        let device_id = device_id.parse::<u8>().map_err(|_| malformed())?;

        Self::new(uuid, device_id)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    /// `<uuid>::<deviceId>`, the hash tag shared by all mailbox keys.
    pub fn hash_tag(&self) -> String {
        format!("{}::{}", self.uuid.hyphenated(), self.device_id)
    }

    pub fn slot(&self) -> u16 {
        key_slot(self.hash_tag())
    }

    pub fn message_queue_key(&self) -> String {
        format!("{MESSAGE_QUEUE_PREFIX}{{{}}}", self.hash_tag())
    }

    pub fn message_queue_metadata_key(&self) -> String {
        format!("message_queue_metadata::{{{}}}", self.hash_tag())
    }

    pub fn persist_in_progress_key(&self) -> String {
        format!("message_queue_persisting::{{{}}}", self.hash_tag())
    }

    /// Channel the unlock script publishes the persisted event on.
    pub fn persisted_event_channel(&self) -> String {
        format!("message_queue_persisted::{{{}}}", self.hash_tag())
    }

    pub fn queue_index_key(&self) -> String {
        queue_index_key(self.slot())
    }
}

/// Index of mailboxes awaiting persistence in `slot`.
pub fn queue_index_key(slot: u16) -> String {
    format!("{QUEUE_INDEX_PREFIX}{{{}}}", minimal_hash_tag(slot))
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash_tag())
    }
}
