//! In-memory message store.
//!
//! Mirrors the Redis scripts' semantics under one mutex, so every operation is
//! atomic the same way a script is. Intended for tests and single-node
//! development; nothing survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::destination::Destination;
use super::envelope::Envelope;
use super::store::{
    decode_entry, encode_entry, MessagePage, MessageQueueStore, StoreError,
    PERSIST_LOCK_TTL_SECONDS,
};

const PERSISTED_EVENT_CAPACITY: usize = 256;

/// Position of an entry in a mailbox log: (score, sequence).
type Position = (i64, u64);

#[derive(Default)]
struct Mailbox {
    entries: BTreeMap<Position, Vec<u8>>,
    positions: HashMap<String, Position>,
    sequence: u64,
}

impl Mailbox {
    fn remove_guid(&mut self, guid: &str) -> Option<Vec<u8>> {
        let position = self.positions.remove(guid)?;
        self.entries.remove(&position)
    }
}

#[derive(Default)]
struct Keyspace {
    mailboxes: HashMap<Destination, Mailbox>,
    /// Per-slot index: queue key -> registration time
    indices: HashMap<u16, HashMap<String, i64>>,
    locks: HashMap<Destination, Instant>,
    persist_cursor: i64,
}

impl Keyspace {
    fn register_queue(&mut self, destination: &Destination, now_ms: i64) {
        self.indices
            .entry(destination.slot())
            .or_default()
            .entry(destination.message_queue_key())
            .or_insert(now_ms);
    }

    fn drop_mailbox_if_empty(&mut self, destination: &Destination) {
        let empty = self
            .mailboxes
            .get(destination)
            .map_or(true, |mailbox| mailbox.entries.is_empty());
        if empty {
            self.mailboxes.remove(destination);
        }
    }
}

/// A persisted-messages notification published on unlock.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEvent {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// In-memory message store.
pub struct MemoryQueueStore {
    keyspace: Mutex<Keyspace>,
    persisted_events: broadcast::Sender<PersistedEvent>,
    lock_ttl: Duration,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::with_lock_ttl(Duration::from_secs(PERSIST_LOCK_TTL_SECONDS))
    }

    /// Use a custom lock TTL, mainly so tests can watch a lock expire.
    pub fn with_lock_ttl(lock_ttl: Duration) -> Self {
        let (persisted_events, _) = broadcast::channel(PERSISTED_EVENT_CAPACITY);
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            persisted_events,
            lock_ttl,
        }
    }

    /// Receive the events published by [`MessageQueueStore::unlock_queue`].
    pub fn subscribe_persisted(&self) -> broadcast::Receiver<PersistedEvent> {
        self.persisted_events.subscribe()
    }

    /// Whether `destination` is registered in its slot's queue index.
    pub fn is_queued_for_persistence(&self, destination: &Destination) -> bool {
        self.keyspace()
            .indices
            .get(&destination.slot())
            .is_some_and(|index| index.contains_key(&destination.message_queue_key()))
    }

    /// Number of metadata entries, which must always equal the log length.
    pub fn metadata_len(&self, destination: &Destination) -> usize {
        self.keyspace()
            .mailboxes
            .get(destination)
            .map_or(0, |mailbox| mailbox.positions.len())
    }

    /// Number of persistence locks currently held, expired ones included
    /// until the next lock attempt.
    pub fn held_locks(&self) -> usize {
        self.keyspace().locks.len()
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        // No operation panics mid-mutation, so a poisoned keyspace is intact
        self.keyspace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_all<'a>(entries: impl IntoIterator<Item = &'a Vec<u8>>) -> Result<Vec<Envelope>, StoreError> {
    entries.into_iter().map(|entry| decode_entry(entry)).collect()
}

#[async_trait]
impl MessageQueueStore for MemoryQueueStore {
    async fn insert(
        &self,
        destination: &Destination,
        message: &Envelope,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut keyspace = self.keyspace();
        let mailbox = keyspace.mailboxes.entry(*destination).or_default();

        if mailbox.positions.contains_key(&message.server_guid) {
            return Ok(false);
        }

        mailbox.sequence += 1;
        let position = (message.server_timestamp as i64, mailbox.sequence);
        mailbox
            .entries
            .insert(position, encode_entry(mailbox.sequence, message));
        mailbox
            .positions
            .insert(message.server_guid.clone(), position);

        keyspace.register_queue(destination, now_ms);
        Ok(true)
    }

    async fn remove_by_guid(
        &self,
        destination: &Destination,
        guids: &[Uuid],
    ) -> Result<Vec<Envelope>, StoreError> {
        let mut keyspace = self.keyspace();
        let Some(mailbox) = keyspace.mailboxes.get_mut(destination) else {
            return Ok(Vec::new());
        };

        let removed: Vec<Vec<u8>> = guids
            .iter()
            .filter_map(|guid| mailbox.remove_guid(&guid.to_string()))
            .collect();

        keyspace.drop_mailbox_if_empty(destination);
        decode_all(&removed)
    }

    async fn remove_queue_page(
        &self,
        destination: &Destination,
        processed_guids: &[String],
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        let mut keyspace = self.keyspace();

        let entries: Vec<Vec<u8>> = match keyspace.mailboxes.get_mut(destination) {
            Some(mailbox) => {
                for guid in processed_guids {
                    mailbox.remove_guid(guid);
                }
                mailbox.entries.values().take(limit).cloned().collect()
            }
            None => Vec::new(),
        };

        if entries.is_empty() {
            keyspace.mailboxes.remove(destination);
            if let Some(index) = keyspace.indices.get_mut(&destination.slot()) {
                index.remove(&destination.message_queue_key());
            }
        }

        decode_all(&entries)
    }

    async fn get_messages_page(
        &self,
        destination: &Destination,
        limit: usize,
        after: i64,
    ) -> Result<MessagePage, StoreError> {
        let keyspace = self.keyspace();
        let Some(mailbox) = keyspace.mailboxes.get(destination) else {
            return Ok(MessagePage::empty());
        };

        let mut page: Vec<(&Position, &Vec<u8>)> = mailbox
            .entries
            .range((after.saturating_add(1), 0)..)
            .take(limit)
            .collect();

        if limit > 0 && page.len() == limit {
            if let Some(&(&(last_score, last_sequence), _)) = page.last() {
                page.extend(
                    mailbox
                        .entries
                        .range((last_score, last_sequence + 1)..=(last_score, u64::MAX)),
                );
            }
        }

        let Some(&(&(cursor, _), _)) = page.last() else {
            return Ok(MessagePage::empty());
        };

        Ok(MessagePage {
            messages: decode_all(page.into_iter().map(|(_, entry)| entry))?,
            cursor,
        })
    }

    async fn first_messages(
        &self,
        destination: &Destination,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        let keyspace = self.keyspace();
        match keyspace.mailboxes.get(destination) {
            Some(mailbox) => decode_all(mailbox.entries.values().take(limit)),
            None => Ok(Vec::new()),
        }
    }

    async fn message_count(&self, destination: &Destination) -> Result<u64, StoreError> {
        Ok(self
            .keyspace()
            .mailboxes
            .get(destination)
            .map_or(0, |mailbox| mailbox.entries.len() as u64))
    }

    async fn queues_to_persist(
        &self,
        slot: u16,
        max_time: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut keyspace = self.keyspace();
        let Some(index) = keyspace.indices.get_mut(&slot) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<(i64, String)> = index
            .iter()
            .filter(|(_, registered)| **registered <= max_time)
            .map(|(queue, registered)| (*registered, queue.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        for (_, queue) in &due {
            index.remove(queue);
        }

        Ok(due.into_iter().map(|(_, queue)| queue).collect())
    }

    async fn add_queue_to_persist(
        &self,
        destination: &Destination,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        self.keyspace().register_queue(destination, now_ms);
        Ok(())
    }

    async fn lock_queue(&self, destination: &Destination) -> Result<bool, StoreError> {
        let mut keyspace = self.keyspace();
        let now = Instant::now();

        // Expired locks count as absent, as with EX in Redis
        keyspace.locks.retain(|_, expires_at| *expires_at > now);
        if keyspace.locks.contains_key(destination) {
            return Ok(false);
        }

        keyspace.locks.insert(*destination, now + self.lock_ttl);
        Ok(true)
    }

    async fn unlock_queue(
        &self,
        destination: &Destination,
        event: &[u8],
    ) -> Result<(), StoreError> {
        self.keyspace().locks.remove(destination);

        // No subscribers is not an error, same as PUBLISH to an empty channel
        let _ = self.persisted_events.send(PersistedEvent {
            channel: destination.persisted_event_channel(),
            payload: event.to_vec(),
        });
        Ok(())
    }

    async fn next_persist_cursor(&self) -> Result<i64, StoreError> {
        let mut keyspace = self.keyspace();
        keyspace.persist_cursor += 1;
        Ok(keyspace.persist_cursor)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> Destination {
        Destination::new(Uuid::new_v4(), 1).unwrap()
    }

    fn message(guid: &str, server_timestamp: u64) -> Envelope {
        Envelope {
            server_guid: guid.to_string(),
            server_timestamp,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_is_conditional() {
        let store = MemoryQueueStore::new();
        let d = destination();

        assert!(store.insert(&d, &message("a", 1), 0).await.unwrap());
        assert!(!store.insert(&d, &message("a", 2), 0).await.unwrap());
        assert_eq!(store.message_count(&d).await.unwrap(), 1);
        assert_eq!(store.metadata_len(&d), 1);
    }

    #[tokio::test]
    async fn test_page_is_extended_over_equal_scores() {
        let store = MemoryQueueStore::new();
        let d = destination();
        for (guid, ts) in [("a", 1), ("b", 2), ("c", 2), ("d", 2), ("e", 3)] {
            store.insert(&d, &message(guid, ts), 0).await.unwrap();
        }

        let page = store.get_messages_page(&d, 2, -1).await.unwrap();
        let guids: Vec<_> = page.messages.iter().map(|m| m.server_guid.as_str()).collect();
        assert_eq!(guids, ["a", "b", "c", "d"]);
        assert_eq!(page.cursor, 2);

        let page = store.get_messages_page(&d, 2, page.cursor).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].server_guid, "e");

        let page = store.get_messages_page(&d, 2, page.cursor).await.unwrap();
        assert_eq!(page, MessagePage::empty());
    }

    #[tokio::test]
    async fn test_remove_queue_page_clears_index() {
        let store = MemoryQueueStore::new();
        let d = destination();
        store.insert(&d, &message("a", 1), 0).await.unwrap();
        assert!(store.is_queued_for_persistence(&d));

        let page = store.remove_queue_page(&d, &[], 10).await.unwrap();
        assert_eq!(page.len(), 1);

        let page = store
            .remove_queue_page(&d, &["a".to_string()], 10)
            .await
            .unwrap();
        assert!(page.is_empty());
        assert!(!store.is_queued_for_persistence(&d));
        assert_eq!(store.metadata_len(&d), 0);
    }

    #[tokio::test]
    async fn test_queues_to_persist_oldest_first_and_removed() {
        let store = MemoryQueueStore::new();
        let d = destination();
        store.add_queue_to_persist(&d, 100).await.unwrap();

        assert!(store
            .queues_to_persist(d.slot(), 99, 10)
            .await
            .unwrap()
            .is_empty());

        let queues = store.queues_to_persist(d.slot(), 100, 10).await.unwrap();
        assert_eq!(queues, vec![d.message_queue_key()]);
        assert!(store
            .queues_to_persist(d.slot(), 100, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_lock_expires() {
        let store = MemoryQueueStore::with_lock_ttl(Duration::from_millis(20));
        let d = destination();

        assert!(store.lock_queue(&d).await.unwrap());
        assert!(!store.lock_queue(&d).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.lock_queue(&d).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_locks_are_pruned() {
        let store = MemoryQueueStore::with_lock_ttl(Duration::from_millis(20));

        for _ in 0..5 {
            assert!(store.lock_queue(&destination()).await.unwrap());
        }
        assert_eq!(store.held_locks(), 5);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.lock_queue(&destination()).await.unwrap());
        assert_eq!(store.held_locks(), 1);
    }

    #[tokio::test]
    async fn test_unlock_publishes_event() {
        let store = MemoryQueueStore::new();
        let mut events = store.subscribe_persisted();
        let d = destination();

        store.lock_queue(&d).await.unwrap();
        store.unlock_queue(&d, b"event").await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.channel, d.persisted_event_channel());
        assert_eq!(event.payload, b"event");
        assert!(store.lock_queue(&d).await.unwrap());
    }
}
