//! Binary message records.
//!
//! Field numbers follow the envelope format clients already speak, so stored
//! entries stay readable by the delivery path without translation.

use uuid::Uuid;

use crate::identity::{IdentityError, ServiceIdentifier};

/// A queued message. `content` is opaque to the cache.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub message_type: i32,
    #[prost(uint64, tag = "5")]
    pub client_timestamp: u64,
    #[prost(uint32, optional, tag = "7")]
    pub source_device: Option<u32>,
    #[prost(bytes = "vec", tag = "8")]
    pub content: Vec<u8>,
    #[prost(string, tag = "9")]
    pub server_guid: String,
    #[prost(uint64, tag = "10")]
    pub server_timestamp: u64,
    #[prost(string, optional, tag = "11")]
    pub source_service_id: Option<String>,
    #[prost(bool, tag = "12")]
    pub ephemeral: bool,
    #[prost(string, tag = "13")]
    pub destination_service_id: String,
    #[prost(bool, tag = "14")]
    pub urgent: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unknown = 0,
    Ciphertext = 1,
    KeyExchange = 2,
    PrekeyBundle = 3,
    ServerDeliveryReceipt = 5,
    UnidentifiedSender = 6,
    PlaintextContent = 8,
}

impl Envelope {
    /// The server GUID, if it is a well-formed UUID.
    pub fn server_guid_uuid(&self) -> Option<Uuid> {
        Uuid::try_parse(&self.server_guid).ok()
    }

    /// The sender, absent for sealed-sender messages.
    pub fn source_identifier(&self) -> Result<Option<ServiceIdentifier>, IdentityError> {
        self.source_service_id
            .as_deref()
            .map(ServiceIdentifier::parse)
            .transpose()
    }

    pub fn destination_identifier(&self) -> Result<ServiceIdentifier, IdentityError> {
        ServiceIdentifier::parse(&self.destination_service_id)
    }

    /// Ephemeral and sent before `earliest_allowable_timestamp`.
    pub fn is_stale_ephemeral(&self, earliest_allowable_timestamp: i64) -> bool {
        self.ephemeral && (self.client_timestamp as i64) < earliest_allowable_timestamp
    }
}

/// Event published to a mailbox's listeners.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientEvent {
    #[prost(oneof = "client_event::Event", tags = "1, 3")]
    pub event: Option<client_event::Event>,
}

pub mod client_event {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        NewMessageAvailable(super::NewMessageAvailable),
        #[prost(message, tag = "3")]
        MessagesPersisted(super::MessagesPersisted),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NewMessageAvailable {}

/// Queued messages moved to durable storage.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MessagesPersisted {}

impl ClientEvent {
    pub fn messages_persisted() -> Self {
        Self {
            event: Some(client_event::Event::MessagesPersisted(MessagesPersisted {})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_message_type_accessor() {
        let mut envelope = Envelope::default();
        envelope.set_message_type(MessageType::Ciphertext);
        assert_eq!(envelope.message_type(), MessageType::Ciphertext);

        envelope.message_type = 42;
        assert_eq!(envelope.message_type(), MessageType::Unknown);
        assert!(MessageType::try_from(42).is_err());
    }

    #[test]
    fn test_decode_preserves_optional_fields() {
        let envelope = Envelope {
            source_device: Some(2),
            source_service_id: None,
            content: b"payload".to_vec(),
            ..Default::default()
        };

        let decoded = Envelope::decode(envelope.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.source_device, Some(2));
        assert_eq!(decoded.source_service_id, None);
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_stale_ephemeral() {
        let envelope = Envelope {
            ephemeral: true,
            client_timestamp: 1_000,
            ..Default::default()
        };
        assert!(envelope.is_stale_ephemeral(1_001));
        assert!(!envelope.is_stale_ephemeral(1_000));

        let durable = Envelope {
            ephemeral: false,
            ..envelope
        };
        assert!(!durable.is_stale_ephemeral(i64::MAX));
    }

    #[test]
    fn test_server_guid_uuid() {
        let guid = Uuid::new_v4();
        let envelope = Envelope {
            server_guid: guid.to_string(),
            ..Default::default()
        };
        assert_eq!(envelope.server_guid_uuid(), Some(guid));
        assert_eq!(Envelope::default().server_guid_uuid(), None);
    }

    #[test]
    fn test_service_identifiers() {
        let aci = Uuid::new_v4();
        let pni = Uuid::new_v4();
        let envelope = Envelope {
            source_service_id: Some(aci.to_string()),
            destination_service_id: format!("PNI:{}", pni),
            ..Default::default()
        };

        assert_eq!(envelope.source_identifier(), Ok(Some(ServiceIdentifier::Aci(aci))));
        assert_eq!(envelope.destination_identifier(), Ok(ServiceIdentifier::Pni(pni)));

        let sealed = Envelope {
            source_service_id: None,
            destination_service_id: "not-an-identifier".to_string(),
            ..envelope
        };
        assert_eq!(sealed.source_identifier(), Ok(None));
        assert!(sealed.destination_identifier().is_err());
    }

    #[test]
    fn test_messages_persisted_event_decodes() {
        let bytes = ClientEvent::messages_persisted().encode_to_vec();
        let event = ClientEvent::decode(bytes.as_slice()).unwrap();
        assert!(matches!(
            event.event,
            Some(client_event::Event::MessagesPersisted(_))
        ));
    }
}
