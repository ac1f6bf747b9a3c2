//! Integration tests for the messages cache
//!
//! These drive `MessagesCache` end to end against the in-memory store, which
//! implements the same atomic semantics as the Redis Cluster scripts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use prost::Message;
use tokio::runtime::Handle;
use uuid::Uuid;

use ara_mailbox_cache::messages::{
    client_event, event, operation, ClientEvent, Clock, Destination, Envelope,
    MemoryQueueStore, MessagePage, MessageQueueStore, MessageType, MessagesCache,
    MessagesCacheError, StoreError, PAGE_SIZE,
};
use ara_mailbox_cache::metrics::MetricsRecorder;
use ara_mailbox_cache::redis::slots::{key_slot, minimal_hash_tag, SLOT_COUNT};

const NOW: i64 = 1_700_000_000_000;

struct FixedClock(AtomicI64);

impl FixedClock {
    fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Records every metric call for assertions
#[derive(Default)]
struct CapturingRecorder {
    latencies: Mutex<Vec<String>>,
    counters: Mutex<Vec<(String, u64)>>,
}

impl CapturingRecorder {
    fn timed(&self, operation: &str) -> usize {
        self.latencies
            .lock()
            .unwrap()
            .iter()
            .filter(|name| name.as_str() == operation)
            .count()
    }

    fn counted(&self, event: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, count)| count)
            .sum()
    }
}

impl MetricsRecorder for CapturingRecorder {
    fn record_latency(&self, operation: &str, _elapsed: Duration) {
        self.latencies.lock().unwrap().push(operation.to_string());
    }

    fn increment(&self, event: &str, count: u64) {
        self.counters
            .lock()
            .unwrap()
            .push((event.to_string(), count));
    }
}

struct TestEnvironment {
    store: Arc<MemoryQueueStore>,
    recorder: Arc<CapturingRecorder>,
    cache: MessagesCache,
}

fn create_test_environment() -> TestEnvironment {
    let store = Arc::new(MemoryQueueStore::new());
    let recorder = Arc::new(CapturingRecorder::default());
    let cache = MessagesCache::new(store.clone(), Handle::current())
        .with_clock(Arc::new(FixedClock::new(NOW)))
        .with_metrics(recorder.clone());

    TestEnvironment {
        store,
        recorder,
        cache,
    }
}

fn destination() -> Destination {
    Destination::new(Uuid::new_v4(), 1).unwrap()
}

fn message(server_timestamp: u64) -> Envelope {
    let mut envelope = Envelope {
        server_timestamp,
        client_timestamp: NOW as u64,
        content: b"ciphertext".to_vec(),
        destination_service_id: Uuid::new_v4().to_string(),
        source_device: Some(1),
        ..Default::default()
    };
    envelope.set_message_type(MessageType::Ciphertext);
    envelope
}

fn ephemeral(client_timestamp: i64) -> Envelope {
    Envelope {
        ephemeral: true,
        client_timestamp: client_timestamp as u64,
        ..message(NOW as u64)
    }
}

async fn fetch_all(cache: &MessagesCache, destination: &Destination) -> Vec<Envelope> {
    cache.get(destination).try_collect().await.unwrap()
}

fn guids(messages: &[Envelope]) -> Vec<String> {
    messages.iter().map(|m| m.server_guid.clone()).collect()
}

#[tokio::test]
async fn test_insert_then_get_round_trip() {
    let env = create_test_environment();
    let d = destination();
    let guid = Uuid::new_v4();
    let original = message(100);

    assert!(env.cache.insert(guid, &d, original.clone()).await.unwrap());

    let fetched = fetch_all(&env.cache, &d).await;
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].server_guid, guid.to_string());
    assert_eq!(
        fetched[0],
        Envelope {
            server_guid: guid.to_string(),
            ..original
        }
    );
    assert_eq!(env.recorder.timed(operation::INSERT), 1);
    assert_eq!(env.recorder.timed(operation::GET), 1);
}

#[tokio::test]
async fn test_repeated_insert_is_idempotent() {
    let env = create_test_environment();
    let d = destination();
    let guid = Uuid::new_v4();

    assert!(env.cache.insert(guid, &d, message(100)).await.unwrap());
    for _ in 0..3 {
        assert!(!env.cache.insert(guid, &d, message(100)).await.unwrap());
    }

    assert_eq!(env.store.message_count(&d).await.unwrap(), 1);
    assert_eq!(env.store.metadata_len(&d), 1);
    assert_eq!(fetch_all(&env.cache, &d).await.len(), 1);
}

#[tokio::test]
async fn test_batch_remove_returns_existing_subset() {
    let env = create_test_environment();
    let d = destination();
    let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    for (i, id) in ids.iter().enumerate() {
        env.cache
            .insert(*id, &d, message(100 + i as u64))
            .await
            .unwrap();
    }

    let missing = Uuid::new_v4();
    let removed = env
        .cache
        .remove_all(&d, vec![ids[1], ids[3], missing])
        .await
        .unwrap();

    let removed_guids: HashSet<Uuid> = removed.iter().map(|r| r.server_guid).collect();
    assert_eq!(removed.len(), 2);
    assert_eq!(removed_guids, HashSet::from([ids[1], ids[3]]));
    assert!(removed
        .iter()
        .all(|r| r.message_type == MessageType::Ciphertext));

    let remaining = fetch_all(&env.cache, &d).await;
    assert_eq!(
        guids(&remaining),
        vec![ids[0].to_string(), ids[2].to_string()]
    );
    assert_eq!(env.recorder.timed(operation::REMOVE_BY_GUID), 1);
    assert_eq!(env.recorder.counted(event::REMOVE), 2);
}

#[tokio::test]
async fn test_remove_single_absent_message() {
    let env = create_test_environment();
    let d = destination();

    assert!(env.cache.remove(&d, Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_has_messages_tracks_insert_and_remove() {
    let env = create_test_environment();
    let d = destination();
    let guid = Uuid::new_v4();

    assert!(!env.cache.has_messages(&d).await.unwrap());

    env.cache.insert(guid, &d, message(100)).await.unwrap();
    assert!(env.cache.has_messages(&d).await.unwrap());

    let removed = env.cache.remove(&d, guid).await.unwrap().unwrap();
    assert_eq!(removed.server_guid, guid);
    assert_eq!(removed.server_timestamp, 100);
    assert!(!env.cache.has_messages(&d).await.unwrap());
    assert_eq!(env.store.metadata_len(&d), 0);
}

#[tokio::test]
async fn test_get_discards_stale_ephemeral_messages() {
    let env = create_test_environment();
    let d = destination();
    let stale = Uuid::new_v4();
    let fresh = Uuid::new_v4();
    let regular = Uuid::new_v4();

    env.cache
        .insert(stale, &d, ephemeral(NOW - 11_000))
        .await
        .unwrap();
    env.cache.insert(fresh, &d, ephemeral(NOW)).await.unwrap();
    env.cache.insert(regular, &d, message(NOW as u64)).await.unwrap();

    let fetched = fetch_all(&env.cache, &d).await;
    assert_eq!(guids(&fetched), vec![fresh.to_string(), regular.to_string()]);

    env.cache.drain_pending_discards().await;
    assert_eq!(env.store.message_count(&d).await.unwrap(), 2);
    assert!(env.cache.remove(&d, stale).await.unwrap().is_none());
    assert_eq!(env.recorder.counted(event::STALE_EPHEMERAL_MESSAGES), 1);
}

#[tokio::test]
async fn test_get_batches_stale_discards() {
    let env = create_test_environment();
    let d = destination();
    let count = PAGE_SIZE + 5;

    for _ in 0..count {
        env.cache
            .insert(Uuid::new_v4(), &d, ephemeral(NOW - 60_000))
            .await
            .unwrap();
    }

    assert!(fetch_all(&env.cache, &d).await.is_empty());

    env.cache.drain_pending_discards().await;
    assert!(!env.cache.has_messages(&d).await.unwrap());
    assert_eq!(
        env.recorder.counted(event::STALE_EPHEMERAL_MESSAGES),
        count as u64
    );
    // One removal per full batch plus the remainder
    assert_eq!(env.recorder.timed(operation::REMOVE_BY_GUID), 2);
}

#[tokio::test]
async fn test_clear_empties_mailbox_across_pages() {
    let env = create_test_environment();
    let d = destination();
    let other = destination();

    for i in 0..(PAGE_SIZE * 2 + 50) {
        env.cache
            .insert(Uuid::new_v4(), &d, message(i as u64))
            .await
            .unwrap();
    }
    env.cache
        .insert(Uuid::new_v4(), &other, message(1))
        .await
        .unwrap();

    env.cache.clear(&d).await.unwrap();

    assert!(!env.cache.has_messages(&d).await.unwrap());
    assert_eq!(env.store.metadata_len(&d), 0);
    assert!(!env.store.is_queued_for_persistence(&d));
    assert!(env.cache.has_messages(&other).await.unwrap());
    assert_eq!(env.recorder.timed(operation::CLEAR), 1);
}

#[tokio::test]
async fn test_clear_account_covers_every_device() {
    let env = create_test_environment();
    let account = Uuid::new_v4();
    let first = Destination::new(account, 1).unwrap();
    let last = Destination::new(account, 126).unwrap();

    env.cache.insert(Uuid::new_v4(), &first, message(1)).await.unwrap();
    env.cache.insert(Uuid::new_v4(), &last, message(2)).await.unwrap();

    env.cache.clear_account(account).await.unwrap();

    assert!(!env.cache.has_messages(&first).await.unwrap());
    assert!(!env.cache.has_messages(&last).await.unwrap());
}

#[test]
fn test_minimal_hash_tag_maps_back_to_slot() {
    for slot in 0..SLOT_COUNT {
        assert_eq!(key_slot(minimal_hash_tag(slot)), slot);
    }

    let d = destination();
    assert_eq!(key_slot(d.queue_index_key()), d.slot());
}

#[tokio::test]
async fn test_persist_lock_excludes_second_worker() {
    let env = create_test_environment();
    let d = destination();
    let mut events = env.store.subscribe_persisted();
    env.cache.insert(Uuid::new_v4(), &d, message(1)).await.unwrap();

    assert!(env.cache.lock_queue_for_persistence(&d).await.unwrap());
    assert!(!env.cache.lock_queue_for_persistence(&d).await.unwrap());

    // Locked mailboxes stay deliverable
    assert_eq!(fetch_all(&env.cache, &d).await.len(), 1);

    env.cache.unlock_queue_for_persistence(&d).await.unwrap();
    let published = events.recv().await.unwrap();
    assert_eq!(published.channel, d.persisted_event_channel());
    let decoded = ClientEvent::decode(published.payload.as_slice()).unwrap();
    assert!(matches!(
        decoded.event,
        Some(client_event::Event::MessagesPersisted(_))
    ));

    assert!(env.cache.lock_queue_for_persistence(&d).await.unwrap());
}

#[tokio::test]
async fn test_get_yields_in_timestamp_order_and_reflects_removal() {
    let env = create_test_environment();
    let d = destination();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    env.cache.insert(b, &d, message(200)).await.unwrap();
    env.cache.insert(a, &d, message(100)).await.unwrap();

    let fetched = fetch_all(&env.cache, &d).await;
    assert_eq!(guids(&fetched), vec![a.to_string(), b.to_string()]);

    env.cache.remove(&d, b).await.unwrap();
    let fetched = fetch_all(&env.cache, &d).await;
    assert_eq!(guids(&fetched), vec![a.to_string()]);
}

#[tokio::test]
async fn test_get_pages_through_equal_timestamps() {
    let env = create_test_environment();
    let d = destination();
    let mut inserted = Vec::new();

    for _ in 0..(PAGE_SIZE + 20) {
        let guid = Uuid::new_v4();
        env.cache.insert(guid, &d, message(500)).await.unwrap();
        inserted.push(guid.to_string());
    }

    let fetched = fetch_all(&env.cache, &d).await;
    assert_eq!(guids(&fetched), inserted);
}

#[tokio::test]
async fn test_earliest_undelivered_timestamp() {
    let env = create_test_environment();
    let d = destination();

    assert!(matches!(
        env.cache.get_earliest_undelivered_timestamp(&d).await,
        Err(MessagesCacheError::EmptyQueue)
    ));

    env.cache.insert(Uuid::new_v4(), &d, message(300)).await.unwrap();
    env.cache.insert(Uuid::new_v4(), &d, message(100)).await.unwrap();

    assert_eq!(
        env.cache.get_earliest_undelivered_timestamp(&d).await.unwrap(),
        100
    );
}

#[tokio::test]
async fn test_persistence_sweep_finds_registered_queue() {
    let env = create_test_environment();
    let d = destination();
    env.cache.insert(Uuid::new_v4(), &d, message(1)).await.unwrap();

    let before = Utc.timestamp_millis_opt(NOW - 1).unwrap();
    assert!(env
        .cache
        .queues_to_persist(d.slot(), before, 10)
        .await
        .unwrap()
        .is_empty());

    let max_time = Utc.timestamp_millis_opt(NOW).unwrap();
    let queues = env.cache.queues_to_persist(d.slot(), max_time, 10).await.unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(Destination::from_queue_key(&queues[0]).unwrap(), d);
    assert_eq!(env.recorder.timed(operation::GET_QUEUES_TO_PERSIST), 2);

    // Enumeration consumed the entry; registering again restores it
    assert!(!env.store.is_queued_for_persistence(&d));
    env.cache.add_queue_to_persist(&d).await.unwrap();
    assert!(env.store.is_queued_for_persistence(&d));
}

#[tokio::test]
async fn test_next_slot_to_persist_wraps_around() {
    let env = create_test_environment();

    let mut last = 0;
    for expected in 1..SLOT_COUNT {
        last = env.cache.next_slot_to_persist().await.unwrap();
        assert_eq!(last, expected);
    }
    assert_eq!(last, SLOT_COUNT - 1);
    assert_eq!(env.cache.next_slot_to_persist().await.unwrap(), 0);
}

#[tokio::test]
async fn test_messages_to_persist_skips_and_discards_ephemeral() {
    let env = create_test_environment();
    let d = destination();
    let durable = Uuid::new_v4();
    let transient = Uuid::new_v4();

    env.cache.insert(durable, &d, message(1)).await.unwrap();
    env.cache.insert(transient, &d, ephemeral(NOW)).await.unwrap();

    let to_persist = env.cache.get_messages_to_persist(&d, 10).await.unwrap();
    assert_eq!(guids(&to_persist), vec![durable.to_string()]);

    env.cache.drain_pending_discards().await;
    let remaining = fetch_all(&env.cache, &d).await;
    assert_eq!(guids(&remaining), vec![durable.to_string()]);
}

#[tokio::test]
async fn test_estimate_persisted_queue_size_counts_durable_messages() {
    let env = create_test_environment();
    let d = destination();

    assert_eq!(env.cache.estimate_persisted_queue_size_bytes(&d).await.unwrap(), 0);

    for i in 0..(PAGE_SIZE + 10) {
        env.cache
            .insert(Uuid::new_v4(), &d, message(i as u64))
            .await
            .unwrap();
    }
    env.cache.insert(Uuid::new_v4(), &d, ephemeral(NOW)).await.unwrap();

    let expected: u64 = fetch_all(&env.cache, &d)
        .await
        .iter()
        .filter(|m| !m.ephemeral)
        .map(|m| m.encoded_len() as u64)
        .sum();
    assert!(expected > 0);
    assert_eq!(
        env.cache.estimate_persisted_queue_size_bytes(&d).await.unwrap(),
        expected
    );
}

/// Delegates to the memory store, optionally stalling on `first_messages` or
/// draining pages that never shrink.
struct FaultyStore {
    inner: MemoryQueueStore,
    stall: Duration,
    stuck_drain: bool,
}

impl FaultyStore {
    fn stalled(stall: Duration) -> Self {
        Self {
            inner: MemoryQueueStore::new(),
            stall,
            stuck_drain: false,
        }
    }

    fn stuck_drain() -> Self {
        Self {
            inner: MemoryQueueStore::new(),
            stall: Duration::ZERO,
            stuck_drain: true,
        }
    }
}

#[async_trait]
impl MessageQueueStore for FaultyStore {
    async fn insert(&self, d: &Destination, m: &Envelope, now_ms: i64) -> Result<bool, StoreError> {
        self.inner.insert(d, m, now_ms).await
    }

    async fn remove_by_guid(&self, d: &Destination, guids: &[Uuid]) -> Result<Vec<Envelope>, StoreError> {
        self.inner.remove_by_guid(d, guids).await
    }

    async fn remove_queue_page(
        &self,
        d: &Destination,
        processed: &[String],
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        if self.stuck_drain {
            // Same page every time, as for entries whose metadata is gone
            return self.inner.first_messages(d, limit).await;
        }
        self.inner.remove_queue_page(d, processed, limit).await
    }

    async fn get_messages_page(
        &self,
        d: &Destination,
        limit: usize,
        after: i64,
    ) -> Result<MessagePage, StoreError> {
        self.inner.get_messages_page(d, limit, after).await
    }

    async fn first_messages(&self, d: &Destination, limit: usize) -> Result<Vec<Envelope>, StoreError> {
        if !self.stall.is_zero() {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.first_messages(d, limit).await
    }

    async fn message_count(&self, d: &Destination) -> Result<u64, StoreError> {
        self.inner.message_count(d).await
    }

    async fn queues_to_persist(&self, slot: u16, max_time: i64, limit: usize) -> Result<Vec<String>, StoreError> {
        self.inner.queues_to_persist(slot, max_time, limit).await
    }

    async fn add_queue_to_persist(&self, d: &Destination, now_ms: i64) -> Result<(), StoreError> {
        self.inner.add_queue_to_persist(d, now_ms).await
    }

    async fn lock_queue(&self, d: &Destination) -> Result<bool, StoreError> {
        self.inner.lock_queue(d).await
    }

    async fn unlock_queue(&self, d: &Destination, event: &[u8]) -> Result<(), StoreError> {
        self.inner.unlock_queue(d, event).await
    }

    async fn next_persist_cursor(&self) -> Result<i64, StoreError> {
        self.inner.next_persist_cursor().await
    }

    fn backend_type(&self) -> &'static str {
        "faulty"
    }
}

#[tokio::test]
async fn test_messages_to_persist_times_out() {
    let store = Arc::new(FaultyStore::stalled(Duration::from_millis(200)));
    let cache = MessagesCache::new(store, Handle::current())
        .with_clock(Arc::new(FixedClock::new(NOW)))
        .with_persist_fetch_timeout(Duration::from_millis(20));
    let d = destination();
    cache.insert(Uuid::new_v4(), &d, message(1)).await.unwrap();

    let result = cache.get_messages_to_persist(&d, 10).await;
    assert!(matches!(
        result,
        Err(MessagesCacheError::PersistFetchTimeout(timeout)) if timeout == Duration::from_millis(20)
    ));
}

#[tokio::test]
async fn test_clear_without_progress_reports_incomplete() {
    let store = Arc::new(FaultyStore::stuck_drain());
    let cache = MessagesCache::new(store.clone(), Handle::current())
        .with_clock(Arc::new(FixedClock::new(NOW)));
    let d = destination();
    for i in 0..3 {
        cache.insert(Uuid::new_v4(), &d, message(i)).await.unwrap();
    }

    let result = cache.clear(&d).await;

    match result {
        Err(MessagesCacheError::ClearIncomplete { destination, remaining }) => {
            assert_eq!(destination, d.to_string());
            assert_eq!(remaining, 3);
        }
        other => panic!("expected ClearIncomplete, got {:?}", other),
    }
    assert_eq!(store.message_count(&d).await.unwrap(), 3);
}
