//! Redis Cluster message store.
//!
//! Every multi-key operation runs as a Lua script whose keys share one hash
//! slot. Scripts are loaded once at construction through the blocking
//! connection; later calls go through `EVALSHA` on the async connection.

use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use redis::{AsyncCommands, FromRedisValue, Script};
use uuid::Uuid;

use crate::redis::ClusterConnection;

use super::destination::{queue_index_key, Destination};
use super::envelope::Envelope;
use super::store::{
    decode_entry, MessagePage, MessageQueueStore, StoreError, NEXT_SLOT_TO_PERSIST_KEY,
    PERSIST_LOCK_TTL_SECONDS, PERSIST_LOCK_VALUE,
};

/// Handles to the registered queue scripts.
struct QueueScripts {
    insert: Script,
    remove_by_guid: Script,
    remove_queue: Script,
    get_messages: Script,
    get_queues_to_persist: Script,
    unlock_queue: Script,
}

impl QueueScripts {
    fn new() -> Self {
        Self {
            insert: Script::new(include_str!("scripts/insert_message.lua")),
            remove_by_guid: Script::new(include_str!("scripts/remove_item_by_guid.lua")),
            remove_queue: Script::new(include_str!("scripts/remove_queue.lua")),
            get_messages: Script::new(include_str!("scripts/get_messages.lua")),
            get_queues_to_persist: Script::new(include_str!("scripts/get_queues_to_persist.lua")),
            unlock_queue: Script::new(include_str!("scripts/unlock_queue.lua")),
        }
    }

    fn named(&self) -> [(&'static str, &Script); 6] {
        [
            ("insert_message", &self.insert),
            ("remove_item_by_guid", &self.remove_by_guid),
            ("remove_queue", &self.remove_queue),
            ("get_messages", &self.get_messages),
            ("get_queues_to_persist", &self.get_queues_to_persist),
            ("unlock_queue", &self.unlock_queue),
        ]
    }

    /// Load every script through the blocking connection and check that the
    /// server agrees on each SHA1.
    fn register(connection: &ClusterConnection) -> Result<Self, StoreError> {
        let scripts = Self::new();

        for (name, script) in scripts.named() {
            let sha: String = connection
                .execute_sync("scriptLoad", |conn| script.prepare_invoke().load(conn))
                .map_err(|e| StoreError::ScriptRegistration {
                    script: name,
                    reason: e.to_string(),
                })?;

            if sha != script.get_hash() {
                return Err(StoreError::ScriptRegistration {
                    script: name,
                    reason: format!("server returned {sha}, expected {}", script.get_hash()),
                });
            }

            tracing::info!(script = name, sha = %sha, "Registered Lua script");
        }

        Ok(scripts)
    }
}

/// Message store backed by a Redis Cluster.
pub struct RedisClusterStore {
    connection: Arc<ClusterConnection>,
    scripts: QueueScripts,
}

impl RedisClusterStore {
    /// Register the queue scripts and build the store.
    ///
    /// Blocks on network I/O; call it from `spawn_blocking` or before the
    /// runtime starts.
    pub fn new(connection: Arc<ClusterConnection>) -> Result<Self, StoreError> {
        let scripts = QueueScripts::register(&connection)?;
        Ok(Self {
            connection,
            scripts,
        })
    }

    pub fn connection(&self) -> &Arc<ClusterConnection> {
        &self.connection
    }

    async fn invoke<T>(
        &self,
        operation: &str,
        script: &Script,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<T, StoreError>
    where
        T: FromRedisValue + Send,
    {
        let result = self
            .connection
            .execute(operation, |mut conn| {
                let mut invocation = script.prepare_invoke();
                for key in keys {
                    invocation.key(key);
                }
                for arg in args {
                    invocation.arg(arg.as_slice());
                }
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;
        Ok(result)
    }

    fn decode_entries(entries: &[Vec<u8>]) -> Result<Vec<Envelope>, StoreError> {
        entries.iter().map(|entry| decode_entry(entry)).collect()
    }
}

/// Split a flat `entry, score, entry, score, ...` script reply into a page.
///
/// A reply with an odd number of elements is logged and read as an empty
/// page so delivery keeps going.
fn parse_page(destination: &Destination, reply: Vec<Vec<u8>>) -> Result<MessagePage, StoreError> {
    if reply.len() % 2 != 0 {
        tracing::error!(
            destination = %destination,
            len = reply.len(),
            "Get messages script returned an odd number of elements"
        );
        return Ok(MessagePage::empty());
    }

    let Some(last_score) = reply.last() else {
        return Ok(MessagePage::empty());
    };

    let cursor = match std::str::from_utf8(last_score)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
    {
        Some(score) => score as i64,
        None => {
            tracing::error!(destination = %destination, "Get messages script returned a non-numeric score");
            return Ok(MessagePage::empty());
        }
    };

    let messages = reply
        .chunks_exact(2)
        .map(|pair| decode_entry(&pair[0]))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MessagePage { messages, cursor })
}

#[async_trait]
impl MessageQueueStore for RedisClusterStore {
    async fn insert(
        &self,
        destination: &Destination,
        message: &Envelope,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let keys = [
            destination.message_queue_key(),
            destination.message_queue_metadata_key(),
            destination.queue_index_key(),
        ];
        let args = [
            message.encode_to_vec(),
            message.server_timestamp.to_string().into_bytes(),
            message.server_guid.clone().into_bytes(),
            now_ms.to_string().into_bytes(),
        ];

        let added: i64 = self
            .invoke("insert", &self.scripts.insert, &keys, &args)
            .await?;
        Ok(added == 1)
    }

    async fn remove_by_guid(
        &self,
        destination: &Destination,
        guids: &[Uuid],
    ) -> Result<Vec<Envelope>, StoreError> {
        if guids.is_empty() {
            return Ok(Vec::new());
        }

        let keys = [
            destination.message_queue_key(),
            destination.message_queue_metadata_key(),
        ];
        let args: Vec<Vec<u8>> = guids
            .iter()
            .map(|guid| guid.to_string().into_bytes())
            .collect();

        let removed: Vec<Vec<u8>> = self
            .invoke("removeByGuid", &self.scripts.remove_by_guid, &keys, &args)
            .await?;
        Self::decode_entries(&removed)
    }

    async fn remove_queue_page(
        &self,
        destination: &Destination,
        processed_guids: &[String],
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        let keys = [
            destination.message_queue_key(),
            destination.message_queue_metadata_key(),
            destination.queue_index_key(),
        ];
        let args: Vec<Vec<u8>> = std::iter::once(limit.to_string().into_bytes())
            .chain(processed_guids.iter().map(|guid| guid.clone().into_bytes()))
            .collect();

        let entries: Vec<Vec<u8>> = self
            .invoke("removeQueue", &self.scripts.remove_queue, &keys, &args)
            .await?;
        Self::decode_entries(&entries)
    }

    async fn get_messages_page(
        &self,
        destination: &Destination,
        limit: usize,
        after: i64,
    ) -> Result<MessagePage, StoreError> {
        let keys = [
            destination.message_queue_key(),
            destination.persist_in_progress_key(),
        ];
        let args = [
            limit.to_string().into_bytes(),
            after.to_string().into_bytes(),
        ];

        let reply: Vec<Vec<u8>> = self
            .invoke("getMessages", &self.scripts.get_messages, &keys, &args)
            .await?;
        parse_page(destination, reply)
    }

    async fn first_messages(
        &self,
        destination: &Destination,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let key = &destination.message_queue_key();
        let stop = limit as isize - 1;
        let entries: Vec<Vec<u8>> = self
            .connection
            .execute("zrange", move |mut conn| async move {
                conn.zrange(key, 0, stop).await
            })
            .await?;
        Self::decode_entries(&entries)
    }

    async fn message_count(&self, destination: &Destination) -> Result<u64, StoreError> {
        let key = &destination.message_queue_key();
        let count: u64 = self
            .connection
            .execute("zcard", move |mut conn| async move { conn.zcard(key).await })
            .await?;
        Ok(count)
    }

    async fn queues_to_persist(
        &self,
        slot: u16,
        max_time: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let keys = [queue_index_key(slot)];
        let args = [
            max_time.to_string().into_bytes(),
            limit.to_string().into_bytes(),
        ];

        self.invoke(
            "getQueuesToPersist",
            &self.scripts.get_queues_to_persist,
            &keys,
            &args,
        )
        .await
    }

    async fn add_queue_to_persist(
        &self,
        destination: &Destination,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let index_key = &destination.queue_index_key();
        let queue_key = &destination.message_queue_key();

        self.connection
            .execute("zaddNx", move |mut conn| async move {
                let _: i64 = redis::cmd("ZADD")
                    .arg(index_key)
                    .arg("NX")
                    .arg(now_ms)
                    .arg(queue_key)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn lock_queue(&self, destination: &Destination) -> Result<bool, StoreError> {
        let key = &destination.persist_in_progress_key();

        let reply: Option<String> = self
            .connection
            .execute("lockQueue", move |mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(PERSIST_LOCK_VALUE)
                    .arg("NX")
                    .arg("EX")
                    .arg(PERSIST_LOCK_TTL_SECONDS)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock_queue(
        &self,
        destination: &Destination,
        event: &[u8],
    ) -> Result<(), StoreError> {
        let keys = [
            destination.persist_in_progress_key(),
            destination.persisted_event_channel(),
        ];
        let args = [event.to_vec()];

        self.invoke("unlockQueue", &self.scripts.unlock_queue, &keys, &args)
            .await
    }

    async fn next_persist_cursor(&self) -> Result<i64, StoreError> {
        let cursor: i64 = self
            .connection
            .execute("incr", |mut conn| async move {
                conn.incr(NEXT_SLOT_TO_PERSIST_KEY, 1).await
            })
            .await?;
        Ok(cursor)
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}
