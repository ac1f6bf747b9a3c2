//! Storage abstraction behind the messages cache.
//!
//! A store exposes the atomic per-mailbox operations the cache is built
//! from. Each method is atomic with respect to the mailbox (and its slot's
//! queue index) it touches; nothing here spans two mailboxes.

use async_trait::async_trait;
use prost::Message;
use thiserror::Error;
use uuid::Uuid;

use crate::redis::ClusterError;

use super::destination::Destination;
use super::envelope::Envelope;

/// TTL of the persist-in-progress lock.
pub const PERSIST_LOCK_TTL_SECONDS: u64 = 30;

/// Value stored under a persist-in-progress key.
pub const PERSIST_LOCK_VALUE: &str = "1";

/// Global round-robin cursor shared by persistence sweep workers.
pub const NEXT_SLOT_TO_PERSIST_KEY: &str = "user_queue_persist_slot";

/// Width of the hex sequence prefix on every log entry.
pub const ENTRY_SEQUENCE_WIDTH: usize = 16;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Cluster call failed, timed out, or was rejected by the breaker
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A stored entry is not a valid message record
    #[error("Failed to decode stored message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A Lua script could not be registered at startup
    #[error("Failed to register script {script}: {reason}")]
    ScriptRegistration { script: &'static str, reason: String },
}

impl StoreError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, StoreError::Cluster(ClusterError::CircuitOpen(_)))
    }
}

/// One page of a mailbox read in score order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Envelope>,
    /// Score of the last message, or -1 when the page is empty
    pub cursor: i64,
}

impl MessagePage {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            cursor: -1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Backend for per-device mailboxes.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (`Send + Sync`) as they are shared
/// across the cache's tasks and its deletion runtime.
#[async_trait]
pub trait MessageQueueStore: Send + Sync {
    /// Add `message` unless its GUID is already present; registers the
    /// mailbox in its slot's queue index at `now_ms` if absent.
    ///
    /// Returns `false` for a duplicate GUID.
    async fn insert(
        &self,
        destination: &Destination,
        message: &Envelope,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Remove the given GUIDs, returning the messages that were present.
    async fn remove_by_guid(
        &self,
        destination: &Destination,
        guids: &[Uuid],
    ) -> Result<Vec<Envelope>, StoreError>;

    /// Delete `processed_guids`, then return up to `limit` remaining messages.
    /// An empty result means the mailbox, its metadata and its queue index
    /// entry are gone.
    async fn remove_queue_page(
        &self,
        destination: &Destination,
        processed_guids: &[String],
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError>;

    /// Up to `limit` messages with score greater than `after`.
    ///
    /// A full page is extended with every remaining message sharing the last
    /// score, so resuming from the returned cursor never skips a message.
    async fn get_messages_page(
        &self,
        destination: &Destination,
        limit: usize,
        after: i64,
    ) -> Result<MessagePage, StoreError>;

    /// The first `limit` messages in score order, without a cursor.
    async fn first_messages(
        &self,
        destination: &Destination,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError>;

    async fn message_count(&self, destination: &Destination) -> Result<u64, StoreError>;

    /// Queue keys in `slot`'s index registered at or before `max_time`,
    /// oldest first. Returned keys are removed from the index.
    async fn queues_to_persist(
        &self,
        slot: u16,
        max_time: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    async fn add_queue_to_persist(
        &self,
        destination: &Destination,
        now_ms: i64,
    ) -> Result<(), StoreError>;

    /// Take the persist-in-progress lock. `false` means another worker
    /// holds it.
    async fn lock_queue(&self, destination: &Destination) -> Result<bool, StoreError>;

    /// Release the lock and publish `event` on the mailbox's persisted channel.
    async fn unlock_queue(&self, destination: &Destination, event: &[u8])
        -> Result<(), StoreError>;

    /// Increment the global sweep cursor and return the new value.
    async fn next_persist_cursor(&self) -> Result<i64, StoreError>;

    /// Get the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Log entry layout: a 16-digit hex sequence number followed by the encoded
/// message. The prefix keeps entries with equal scores in insertion order.
pub fn encode_entry(sequence: u64, message: &Envelope) -> Vec<u8> {
    let mut entry = format!("{sequence:016x}").into_bytes();
    entry.extend_from_slice(&message.encode_to_vec());
    entry
}

pub fn decode_entry(entry: &[u8]) -> Result<Envelope, StoreError> {
    let payload = entry.get(ENTRY_SEQUENCE_WIDTH..).unwrap_or_default();
    Ok(Envelope::decode(payload)?)
}
