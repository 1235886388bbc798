use std::sync::Arc;

use quill_storage::{
    DEFAULT_THREAD_TITLE, DependencySet, LiveQuery, LiveQueryEngine, MessageRecord, MessageRole,
    NewMessage, NewThread, Storage, StorageResult, Table, ThreadId, ThreadRecord,
};
use snafu::ResultExt;

use super::error::{ChatError, ChatResult, StorageUnavailableSnafu};

/// Input for [`ConversationRepository::create_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub thread_id: ThreadId,
    pub role: MessageRole,
    pub content: String,
    pub thought: String,
}

impl MessageDraft {
    pub fn user(thread_id: ThreadId, content: impl Into<String>) -> Self {
        Self {
            thread_id,
            role: MessageRole::User,
            content: content.into(),
            thought: String::new(),
        }
    }

    pub fn assistant(
        thread_id: ThreadId,
        content: impl Into<String>,
        thought: impl Into<String>,
    ) -> Self {
        Self {
            thread_id,
            role: MessageRole::Assistant,
            content: content.into(),
            thought: thought.into(),
        }
    }
}

/// Thread and message operations over a [`Storage`], plus live views of the
/// two list operations.
#[derive(Clone)]
pub struct ConversationRepository {
    store: Arc<dyn Storage>,
    live: LiveQueryEngine,
}

impl ConversationRepository {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        let live = LiveQueryEngine::new(store.change_feed().clone());
        Self { store, live }
    }

    /// Blank titles become "Untitled"; this never fails validation.
    pub async fn create_thread(&self, title: &str) -> ChatResult<ThreadId> {
        let thread = self
            .store
            .insert_thread(NewThread::new(title))
            .await
            .context(StorageUnavailableSnafu {
                stage: "create-thread",
            })?;
        tracing::info!(thread_id = %thread.id, title = %thread.title, "thread created");
        Ok(thread.id)
    }

    pub async fn get_thread(&self, thread_id: ThreadId) -> ChatResult<ThreadRecord> {
        self.store
            .get_thread(thread_id)
            .await
            .context(StorageUnavailableSnafu { stage: "get-thread" })?
            .ok_or(ChatError::ThreadNotFound {
                stage: "get-thread",
                thread_id,
            })
    }

    pub async fn list_threads(&self) -> ChatResult<Vec<ThreadRecord>> {
        self.store
            .list_threads()
            .await
            .context(StorageUnavailableSnafu {
                stage: "list-threads",
            })
    }

    pub async fn delete_thread(&self, thread_id: ThreadId) -> ChatResult<()> {
        self.store
            .delete_thread(thread_id)
            .await
            .map_err(|source| ChatError::from_storage("delete-thread", thread_id, source))?;
        tracing::info!(thread_id = %thread_id, "thread deleted");
        Ok(())
    }

    pub async fn create_message(&self, draft: MessageDraft) -> ChatResult<MessageRecord> {
        let MessageDraft {
            thread_id,
            role,
            content,
            thought,
        } = draft;

        let message = self
            .store
            .append_message(
                thread_id,
                NewMessage {
                    role,
                    content,
                    thought,
                },
            )
            .await
            .map_err(|source| ChatError::from_storage("create-message", thread_id, source))?;

        tracing::debug!(
            thread_id = %thread_id,
            message_id = %message.id,
            role = %message.role,
            "message created"
        );
        Ok(message)
    }

    /// Creation order. An unknown or deleted thread yields an empty list.
    pub async fn list_messages_for_thread(
        &self,
        thread_id: ThreadId,
    ) -> ChatResult<Vec<MessageRecord>> {
        self.store
            .list_messages(thread_id)
            .await
            .context(StorageUnavailableSnafu {
                stage: "list-messages",
            })
    }

    /// Delivers the thread list now and after every write that could change it.
    pub fn watch_threads<C>(&self, mut on_change: C) -> LiveQuery
    where
        C: FnMut(ChatResult<Vec<ThreadRecord>>) + Send + 'static,
    {
        let store = self.store.clone();
        self.live.subscribe(
            DependencySet::on(Table::Threads),
            move || {
                let store = store.clone();
                Box::pin(async move { store.list_threads().await })
            },
            move |result: StorageResult<Vec<ThreadRecord>>| {
                on_change(result.context(StorageUnavailableSnafu {
                    stage: "watch-threads",
                }))
            },
        )
    }

    /// Delivers the thread's messages now and after every message write.
    pub fn watch_messages<C>(&self, thread_id: ThreadId, mut on_change: C) -> LiveQuery
    where
        C: FnMut(ChatResult<Vec<MessageRecord>>) + Send + 'static,
    {
        let store = self.store.clone();
        self.live.subscribe(
            DependencySet::on(Table::Messages),
            move || {
                let store = store.clone();
                Box::pin(async move { store.list_messages(thread_id).await })
            },
            move |result: StorageResult<Vec<MessageRecord>>| {
                on_change(result.context(StorageUnavailableSnafu {
                    stage: "watch-messages",
                }))
            },
        )
    }
}

/// Case-insensitive title search. Blank titles match as "Untitled" and a blank
/// query keeps every thread.
pub fn filter_threads<'a>(threads: &'a [ThreadRecord], query: &str) -> Vec<&'a ThreadRecord> {
    let needle = query.trim().to_lowercase();
    threads
        .iter()
        .filter(|thread| {
            if needle.is_empty() {
                return true;
            }
            let title = thread.title.trim();
            let title = if title.is_empty() {
                DEFAULT_THREAD_TITLE
            } else {
                title
            };
            title.to_lowercase().contains(&needle)
        })
        .collect()
}
