use uuid::Uuid;

use crate::identity::ServiceIdentifier;

use super::envelope::{Envelope, MessageType};

/// What callers learn about a message taken out of a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedMessage {
    pub server_guid: Uuid,
    pub server_timestamp: u64,
    pub client_timestamp: u64,
    pub message_type: MessageType,
    /// `None` for sealed-sender messages and unparseable identifiers
    pub source_service_id: Option<ServiceIdentifier>,
    pub destination_service_id: Option<ServiceIdentifier>,
}

impl RemovedMessage {
    /// Returns `None` when the stored GUID is not a UUID, which only happens
    /// for entries written by something other than this cache.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        Some(Self {
            server_guid: envelope.server_guid_uuid()?,
            server_timestamp: envelope.server_timestamp,
            client_timestamp: envelope.client_timestamp,
            message_type: envelope.message_type(),
            source_service_id: envelope.source_identifier().ok().flatten(),
            destination_service_id: envelope.destination_identifier().ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_envelope() {
        let guid = Uuid::new_v4();
        let destination = Uuid::new_v4();
        let envelope = Envelope {
            server_guid: guid.to_string(),
            destination_service_id: destination.to_string(),
            server_timestamp: 200,
            client_timestamp: 150,
            message_type: MessageType::Ciphertext as i32,
            ..Default::default()
        };

        let removed = RemovedMessage::from_envelope(&envelope).unwrap();
        assert_eq!(removed.server_guid, guid);
        assert_eq!(removed.server_timestamp, 200);
        assert_eq!(removed.client_timestamp, 150);
        assert_eq!(removed.message_type, MessageType::Ciphertext);
        assert_eq!(removed.source_service_id, None);
        assert_eq!(
            removed.destination_service_id,
            Some(ServiceIdentifier::Aci(destination))
        );
    }

    #[test]
    fn test_malformed_identifiers_do_not_drop_removal() {
        let envelope = Envelope {
            server_guid: Uuid::new_v4().to_string(),
            source_service_id: Some("PNI:garbage".to_string()),
            destination_service_id: String::new(),
            ..Default::default()
        };

        let removed = RemovedMessage::from_envelope(&envelope).unwrap();
        assert_eq!(removed.source_service_id, None);
        assert_eq!(removed.destination_service_id, None);
    }
}
