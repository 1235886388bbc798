use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod live;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, ThreadId};
pub use live::{ChangeFeed, DependencySet, LiveQuery, LiveQueryEngine, TableVersions};
pub use sqlite::SqliteStorage;
pub use types::{
    DEFAULT_THREAD_TITLE, MessageRecord, MessageRole, NewMessage, NewThread, Table, ThreadRecord,
    normalize_thread_title,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Thread table operations.
///
/// Every write is durable when the returned future resolves, and the change is
/// published to the store's [`ChangeFeed`] only after that point.
pub trait ThreadStore: Send + Sync {
    fn insert_thread(&self, input: NewThread) -> BoxFuture<'_, StorageResult<ThreadRecord>>;
    fn get_thread(&self, thread_id: ThreadId) -> BoxFuture<'_, StorageResult<Option<ThreadRecord>>>;
    /// Most recently active first; equal timestamps fall back to id order.
    fn list_threads(&self) -> BoxFuture<'_, StorageResult<Vec<ThreadRecord>>>;
    /// Removes the thread and all of its messages in one transaction.
    fn delete_thread(&self, thread_id: ThreadId) -> BoxFuture<'_, StorageResult<()>>;
}

/// Message table operations. Messages are append-only.
pub trait MessageStore: Send + Sync {
    /// Appends to the thread and refreshes the thread's `updated_at` atomically.
    fn append_message(
        &self,
        thread_id: ThreadId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>>;
    /// Creation order. Unknown threads yield an empty list.
    fn list_messages(&self, thread_id: ThreadId)
    -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
}

/// Exposes the feed a store publishes committed writes to.
pub trait ChangeSource: Send + Sync {
    fn change_feed(&self) -> &ChangeFeed;
}

pub trait Storage: ThreadStore + MessageStore + ChangeSource {}

impl<T> Storage for T where T: ThreadStore + MessageStore + ChangeSource {}
