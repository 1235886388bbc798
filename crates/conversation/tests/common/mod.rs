#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quill_conversation::{
    ConversationRepository, CoordinatorConfig, SessionSnapshot, StreamCoordinator,
};
use quill_llm::{
    LlmProvider, ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamEventMapped, StreamEventPayload, StreamRequest, make_event_stream,
};
use quill_storage::{
    BoxFuture, ChangeFeed, ChangeSource, MessageId, MessageRecord, MessageRole, MessageStore,
    NewMessage, NewThread, SqliteStorage, StorageResult, ThreadId, ThreadRecord, ThreadStore,
};
use tokio::sync::{Semaphore, mpsc, watch};

/// In-process provider. Each `stream_chat` call consumes the next queued feed
/// and forwards whatever the test pushes into it.
#[derive(Default)]
pub struct TestProvider {
    feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<StreamEventPayload>>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl TestProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a reply that is emitted all at once.
    pub fn script(&self, payloads: Vec<StreamEventPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        for payload in payloads {
            let _ = tx.send(payload);
        }
        self.feeds.lock().push_back(rx);
    }

    /// Queues a reply the test drives step by step.
    pub fn feed(&self) -> mpsc::UnboundedSender<StreamEventPayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().push_back(rx);
        tx
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }
}

impl LlmProvider for TestProvider {
    fn id(&self) -> &str {
        "test"
    }

    fn name(&self) -> &str {
        "Test"
    }

    fn default_model(&self) -> &str {
        "test-model"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let Some(mut feed) = self.feeds.lock().pop_front() else {
            return Err(ProviderError::UnsupportedProvider {
                stage: "test-provider-no-feed",
                provider_id: "test".to_string(),
            });
        };
        let target = request.target;
        self.requests.lock().push(request);

        let (event_tx, stream, mut cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    payload = feed.recv() => match payload {
                        Some(payload) => {
                            if event_tx.send(StreamEventMapped { target, payload }).is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });

        Ok(ProviderStreamHandle { stream, worker })
    }
}

pub struct Harness {
    pub repository: ConversationRepository,
    pub coordinator: StreamCoordinator,
    pub provider: Arc<TestProvider>,
}

pub async fn harness() -> Harness {
    harness_with(CoordinatorConfig::default()).await
}

pub async fn harness_with(config: CoordinatorConfig) -> Harness {
    let store = SqliteStorage::open_in_memory()
        .await
        .expect("in-memory store opens");
    let repository = ConversationRepository::new(Arc::new(store));
    let provider = TestProvider::new();
    let coordinator = StreamCoordinator::new(
        repository.clone(),
        Some(provider.clone() as Arc<dyn LlmProvider>),
        config,
    );
    Harness {
        repository,
        coordinator,
        provider,
    }
}

/// Holds assistant appends until the test releases a permit, so a session can
/// be parked in `Committing`.
pub struct GatedStore {
    inner: SqliteStorage,
    gate: Arc<Semaphore>,
}

impl ThreadStore for GatedStore {
    fn insert_thread(&self, input: NewThread) -> BoxFuture<'_, StorageResult<ThreadRecord>> {
        self.inner.insert_thread(input)
    }

    fn get_thread(&self, thread_id: ThreadId) -> BoxFuture<'_, StorageResult<Option<ThreadRecord>>> {
        self.inner.get_thread(thread_id)
    }

    fn list_threads(&self) -> BoxFuture<'_, StorageResult<Vec<ThreadRecord>>> {
        self.inner.list_threads()
    }

    fn delete_thread(&self, thread_id: ThreadId) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.delete_thread(thread_id)
    }
}

impl MessageStore for GatedStore {
    fn append_message(
        &self,
        thread_id: ThreadId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            if input.role == MessageRole::Assistant {
                let _permit = self.gate.acquire().await.expect("gate open");
            }
            self.inner.append_message(thread_id, input).await
        })
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        self.inner.get_message(message_id)
    }

    fn list_messages(&self, thread_id: ThreadId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        self.inner.list_messages(thread_id)
    }
}

impl ChangeSource for GatedStore {
    fn change_feed(&self) -> &ChangeFeed {
        self.inner.change_feed()
    }
}

/// Like [`harness`], but assistant replies wait on the returned gate before
/// they are written.
pub async fn gated_harness() -> (Harness, Arc<Semaphore>) {
    let inner = SqliteStorage::open_in_memory()
        .await
        .expect("in-memory store opens");
    let gate = Arc::new(Semaphore::new(0));
    let store = GatedStore {
        inner,
        gate: gate.clone(),
    };
    let repository = ConversationRepository::new(Arc::new(store));
    let provider = TestProvider::new();
    let coordinator = StreamCoordinator::new(
        repository.clone(),
        Some(provider.clone() as Arc<dyn LlmProvider>),
        CoordinatorConfig::default(),
    );
    let harness = Harness {
        repository,
        coordinator,
        provider,
    };
    (harness, gate)
}

/// Panics inside `stream_chat`, standing in for a buggy provider.
pub struct PanickingProvider;

impl LlmProvider for PanickingProvider {
    fn id(&self) -> &str {
        "panicking"
    }

    fn name(&self) -> &str {
        "Panicking"
    }

    fn default_model(&self) -> &str {
        "panicking-model"
    }

    fn stream_chat(&self, _request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        panic!("provider bug");
    }
}

pub async fn wait_for_snapshot(
    rx: &mut watch::Receiver<SessionSnapshot>,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
        .await
        .expect("snapshot condition reached in time")
        .expect("coordinator alive")
        .clone()
}
