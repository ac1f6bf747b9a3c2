//! Per-device mailbox cache.
//!
//! [`MessagesCache`] is the entry point for queueing, fetching and removing
//! messages, and for the persistence sweep that moves cold mailboxes to
//! durable storage. All atomicity comes from the store; this layer adds
//! GUID assignment, ephemeral expiry, paging and timing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::Stream;
use prost::Message;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::metrics::{MetricsRecorder, PrometheusRecorder};
use crate::redis::slots::SLOT_COUNT;

use super::destination::{Destination, DestinationError};
use super::device::all_possible_device_ids;
use super::envelope::{ClientEvent, Envelope};
use super::removed::RemovedMessage;
use super::store::{MessageQueueStore, StoreError};

/// Messages fetched per store call.
pub const PAGE_SIZE: usize = 100;

/// Ephemeral messages older than this are discarded instead of delivered.
pub const MAX_EPHEMERAL_MESSAGE_DELAY: Duration = Duration::from_secs(10);

const DEFAULT_PERSIST_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Stable operation names for timers.
pub mod operation {
    pub const INSERT: &str = "insert";
    pub const GET: &str = "get";
    pub const REMOVE_BY_GUID: &str = "removeByGuid";
    pub const CLEAR: &str = "clear";
    pub const GET_QUEUES_TO_PERSIST: &str = "getQueuesToPersist";
}

/// Stable event names for counters.
pub mod event {
    pub const REMOVE: &str = "remove";
    pub const STALE_EPHEMERAL_MESSAGES: &str = "staleEphemeralMessages";
}

#[derive(Debug, Error)]
pub enum MessagesCacheError {
    #[error(transparent)]
    Store(StoreError),

    /// The cluster client's circuit breaker is open
    #[error("Messages cache unavailable: circuit '{0}' is open")]
    Unavailable(String),

    #[error("Mailbox is empty")]
    EmptyQueue,

    #[error("Fetching messages to persist timed out after {0:?}")]
    PersistFetchTimeout(Duration),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error("Deletion task failed: {0}")]
    TaskFailed(String),

    /// A drain page returned only entries that cannot be deleted by GUID
    #[error("Clearing {destination} stopped with {remaining} undeletable entries left")]
    ClearIncomplete { destination: String, remaining: usize },
}

impl From<StoreError> for MessagesCacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cluster(crate::redis::ClusterError::CircuitOpen(name)) => {
                MessagesCacheError::Unavailable(name)
            }
            other => MessagesCacheError::Store(other),
        }
    }
}

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Mailbox cache over a [`MessageQueueStore`].
///
/// Removal work (explicit removes, mailbox clears, stale-message discards)
/// runs on the `deletion` runtime so it does not queue behind inserts and
/// fetches on the caller's runtime.
pub struct MessagesCache {
    store: Arc<dyn MessageQueueStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRecorder>,
    deletion: Handle,
    persist_fetch_timeout: Duration,
    pending_discards: Mutex<JoinSet<()>>,
}

impl MessagesCache {
    pub fn new(store: Arc<dyn MessageQueueStore>, deletion: Handle) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(PrometheusRecorder),
            deletion,
            persist_fetch_timeout: DEFAULT_PERSIST_FETCH_TIMEOUT,
            pending_discards: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_persist_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.persist_fetch_timeout = timeout;
        self
    }

    pub fn backend_type(&self) -> &'static str {
        self.store.backend_type()
    }

    /// Queue `message` under `guid`, replacing any GUID the message carries.
    ///
    /// Returns `false` if `guid` is already queued for `destination`; the
    /// stored message is left untouched in that case.
    pub async fn insert(
        &self,
        guid: Uuid,
        destination: &Destination,
        message: Envelope,
    ) -> Result<bool, MessagesCacheError> {
        let started = Instant::now();
        let message = Envelope {
            server_guid: guid.to_string(),
            ..message
        };

        let result = self
            .store
            .insert(destination, &message, self.clock.now_millis())
            .await;
        self.metrics.record_latency(operation::INSERT, started.elapsed());

        let inserted = result?;
        if !inserted {
            tracing::debug!(destination = %destination, guid = %guid, "Duplicate insert ignored");
        }
        Ok(inserted)
    }

    pub async fn remove(
        &self,
        destination: &Destination,
        guid: Uuid,
    ) -> Result<Option<RemovedMessage>, MessagesCacheError> {
        Ok(self
            .remove_all(destination, vec![guid])
            .await?
            .into_iter()
            .next())
    }

    /// Remove `guids`, returning the messages that were present. Runs on the
    /// deletion runtime.
    pub async fn remove_all(
        &self,
        destination: &Destination,
        guids: Vec<Uuid>,
    ) -> Result<Vec<RemovedMessage>, MessagesCacheError> {
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let destination = *destination;

        let removed = self
            .deletion
            .spawn(async move { remove_messages(&*store, &*metrics, &destination, &guids).await })
            .await
            .map_err(|e| MessagesCacheError::TaskFailed(e.to_string()))??;
        Ok(removed)
    }

    pub async fn has_messages(&self, destination: &Destination) -> Result<bool, MessagesCacheError> {
        Ok(self.store.message_count(destination).await? > 0)
    }

    /// Stream every deliverable message in the mailbox, oldest first.
    ///
    /// Ephemeral messages older than [`MAX_EPHEMERAL_MESSAGE_DELAY`] are not
    /// yielded; they are removed in batches of [`PAGE_SIZE`] by detached
    /// tasks on the deletion runtime. The stream fetches one page per store
    /// call and ends at the first empty page. A store error is yielded once
    /// and ends the stream.
    pub fn get(
        &self,
        destination: &Destination,
    ) -> impl Stream<Item = Result<Envelope, MessagesCacheError>> + Send + '_ {
        let destination = *destination;

        async_stream::stream! {
            let started = Instant::now();
            let earliest_allowable =
                self.clock.now_millis() - MAX_EPHEMERAL_MESSAGE_DELAY.as_millis() as i64;
            let mut cursor = -1;
            let mut stale = Vec::new();

            loop {
                let page = match self.store.get_messages_page(&destination, PAGE_SIZE, cursor).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(MessagesCacheError::from(e));
                        break;
                    }
                };
                if page.is_empty() {
                    break;
                }
                cursor = page.cursor;

                for message in page.messages {
                    if !message.is_stale_ephemeral(earliest_allowable) {
                        yield Ok(message);
                        continue;
                    }

                    match message.server_guid_uuid() {
                        Some(guid) => stale.push(guid),
                        None => tracing::warn!(
                            destination = %destination,
                            guid = %message.server_guid,
                            "Stale ephemeral message has a malformed GUID"
                        ),
                    }
                    if stale.len() >= PAGE_SIZE {
                        self.discard_messages(destination, std::mem::take(&mut stale));
                    }
                }
            }

            if !stale.is_empty() {
                self.discard_messages(destination, stale);
            }
            self.metrics.record_latency(operation::GET, started.elapsed());
        }
    }

    /// Server timestamp of the oldest queued message.
    pub async fn get_earliest_undelivered_timestamp(
        &self,
        destination: &Destination,
    ) -> Result<u64, MessagesCacheError> {
        let page = self.store.get_messages_page(destination, 1, -1).await?;
        page.messages
            .first()
            .map(|message| message.server_timestamp)
            .ok_or(MessagesCacheError::EmptyQueue)
    }

    /// Empty the mailbox, its metadata and its queue index entry.
    pub async fn clear(&self, destination: &Destination) -> Result<(), MessagesCacheError> {
        let started = Instant::now();
        let store = Arc::clone(&self.store);
        let destination = *destination;

        let result = self
            .deletion
            .spawn(async move { drain_queue(&*store, &destination).await })
            .await;
        self.metrics.record_latency(operation::CLEAR, started.elapsed());

        result.map_err(|e| MessagesCacheError::TaskFailed(e.to_string()))??;
        Ok(())
    }

    /// Clear the mailbox of every possible device of `account`.
    pub async fn clear_account(&self, account: Uuid) -> Result<(), MessagesCacheError> {
        let destinations = all_possible_device_ids()
            .map(|device_id| Destination::new(account, device_id))
            .collect::<Result<Vec<_>, _>>()?;

        futures::future::try_join_all(destinations.iter().map(|d| self.clear(d))).await?;
        Ok(())
    }

    /// Advance the shared sweep cursor and return the slot to sweep next.
    pub async fn next_slot_to_persist(&self) -> Result<u16, MessagesCacheError> {
        let cursor = self.store.next_persist_cursor().await?;
        Ok(cursor.rem_euclid(SLOT_COUNT as i64) as u16)
    }

    /// Queue keys in `slot` registered no later than `max_time`. Parse them
    /// with [`Destination::from_queue_key`].
    pub async fn queues_to_persist(
        &self,
        slot: u16,
        max_time: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, MessagesCacheError> {
        let started = Instant::now();
        let result = self
            .store
            .queues_to_persist(slot, max_time.timestamp_millis(), limit)
            .await;
        self.metrics
            .record_latency(operation::GET_QUEUES_TO_PERSIST, started.elapsed());
        Ok(result?)
    }

    pub async fn add_queue_to_persist(
        &self,
        destination: &Destination,
    ) -> Result<(), MessagesCacheError> {
        self.store
            .add_queue_to_persist(destination, self.clock.now_millis())
            .await?;
        Ok(())
    }

    /// Take the 30 second persist lock. `false` means another worker owns the
    /// mailbox and it should be skipped.
    pub async fn lock_queue_for_persistence(
        &self,
        destination: &Destination,
    ) -> Result<bool, MessagesCacheError> {
        let acquired = self.store.lock_queue(destination).await?;
        if !acquired {
            tracing::debug!(destination = %destination, "Mailbox already locked for persistence");
        }
        Ok(acquired)
    }

    /// Release the persist lock and notify listeners that the mailbox's
    /// messages are now durable.
    pub async fn unlock_queue_for_persistence(
        &self,
        destination: &Destination,
    ) -> Result<(), MessagesCacheError> {
        let event = ClientEvent::messages_persisted().encode_to_vec();
        self.store.unlock_queue(destination, &event).await?;
        Ok(())
    }

    /// Up to `limit` of the oldest messages that should go to durable
    /// storage. Ephemeral messages among them are discarded, never returned.
    pub async fn get_messages_to_persist(
        &self,
        destination: &Destination,
        limit: usize,
    ) -> Result<Vec<Envelope>, MessagesCacheError> {
        let started = Instant::now();

        let fetched = tokio::time::timeout(
            self.persist_fetch_timeout,
            self.store.first_messages(destination, limit),
        )
        .await
        .map_err(|_| MessagesCacheError::PersistFetchTimeout(self.persist_fetch_timeout))?;
        self.metrics.record_latency(operation::GET, started.elapsed());

        let (ephemeral, persistable): (Vec<_>, Vec<_>) =
            fetched?.into_iter().partition(|message| message.ephemeral);

        let ephemeral_guids: Vec<Uuid> = ephemeral
            .iter()
            .filter_map(Envelope::server_guid_uuid)
            .collect();
        for batch in ephemeral_guids.chunks(PAGE_SIZE) {
            self.discard_messages(*destination, batch.to_vec());
        }

        Ok(persistable)
    }

    /// Sum of the encoded sizes of every non-ephemeral queued message.
    pub async fn estimate_persisted_queue_size_bytes(
        &self,
        destination: &Destination,
    ) -> Result<u64, MessagesCacheError> {
        let mut cursor = -1;
        let mut total = 0u64;

        loop {
            let page = self
                .store
                .get_messages_page(destination, PAGE_SIZE, cursor)
                .await?;
            if page.is_empty() {
                return Ok(total);
            }
            cursor = page.cursor;

            total += page
                .messages
                .iter()
                .filter(|message| !message.ephemeral)
                .map(|message| message.encoded_len() as u64)
                .sum::<u64>();
        }
    }

    /// Wait for every detached discard submitted so far.
    pub async fn drain_pending_discards(&self) {
        let mut pending = std::mem::take(
            &mut *self
                .pending_discards
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Discard task failed");
            }
        }
    }

    /// Remove `guids` in a detached task on the deletion runtime.
    fn discard_messages(&self, destination: Destination, guids: Vec<Uuid>) {
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);

        let task = async move {
            match remove_messages(&*store, &*metrics, &destination, &guids).await {
                Ok(removed) => {
                    metrics.increment(event::STALE_EPHEMERAL_MESSAGES, removed.len() as u64);
                    tracing::debug!(
                        destination = %destination,
                        count = removed.len(),
                        "Discarded stale ephemeral messages"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        destination = %destination,
                        count = guids.len(),
                        error = %e,
                        "Failed to discard stale ephemeral messages"
                    );
                }
            }
        };

        let mut pending = self
            .pending_discards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while pending.try_join_next().is_some() {}
        pending.spawn_on(task, &self.deletion);
    }
}

async fn remove_messages(
    store: &dyn MessageQueueStore,
    metrics: &dyn MetricsRecorder,
    destination: &Destination,
    guids: &[Uuid],
) -> Result<Vec<RemovedMessage>, StoreError> {
    let started = Instant::now();
    let result = store.remove_by_guid(destination, guids).await;
    metrics.record_latency(operation::REMOVE_BY_GUID, started.elapsed());

    let removed: Vec<RemovedMessage> = result?
        .iter()
        .filter_map(RemovedMessage::from_envelope)
        .collect();
    metrics.increment(event::REMOVE, removed.len() as u64);
    Ok(removed)
}

/// Drain a mailbox page by page, deleting each page on the following call.
async fn drain_queue(
    store: &dyn MessageQueueStore,
    destination: &Destination,
) -> Result<(), MessagesCacheError> {
    let mut processed: Vec<String> = Vec::new();

    loop {
        let page = store
            .remove_queue_page(destination, &processed, PAGE_SIZE)
            .await?;
        if page.is_empty() {
            return Ok(());
        }

        let next: Vec<String> = page.into_iter().map(|message| message.server_guid).collect();
        if next == processed {
            // Entries without metadata can never be deleted by GUID
            tracing::error!(
                destination = %destination,
                count = next.len(),
                "Mailbox drain made no progress"
            );
            return Err(MessagesCacheError::ClearIncomplete {
                destination: destination.to_string(),
                remaining: next.len(),
            });
        }
        processed = next;
    }
}
