//! Per-device mailboxes.
//!
//! - `destination`: mailbox addressing and key layout
//! - `envelope`: wire format of queued messages and client events
//! - `store`: the atomic storage operations, with Redis Cluster and
//!   in-memory backends
//! - `cache`: the messages cache built on a store

mod cache;
mod destination;
mod device;
mod envelope;
mod factory;
mod memory_store;
mod redis_store;
mod removed;
mod store;

pub use cache::{
    event, operation, Clock, MessagesCache, MessagesCacheError, SystemClock,
    MAX_EPHEMERAL_MESSAGE_DELAY, PAGE_SIZE,
};
pub use destination::{queue_index_key, Destination, DestinationError};
pub use device::{all_possible_device_ids, MAXIMUM_DEVICE_ID, PRIMARY_ID};
pub use envelope::{client_event, ClientEvent, Envelope, MessageType};
pub use factory::create_message_store;
pub use memory_store::{MemoryQueueStore, PersistedEvent};
pub use redis_store::RedisClusterStore;
pub use removed::RemovedMessage;
pub use store::{
    decode_entry, encode_entry, MessagePage, MessageQueueStore, StoreError,
    NEXT_SLOT_TO_PERSIST_KEY, PERSIST_LOCK_TTL_SECONDS,
};
