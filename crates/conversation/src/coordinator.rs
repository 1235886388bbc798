//! Per-thread reply sessions.
//!
//! A session persists the user's prompt, streams the provider's reply into an
//! in-memory buffer and commits the finished reply as one assistant message.
//! Each session runs on its own task, so it completes whether or not anyone is
//! still watching. Cancelled or failed sessions never write an assistant
//! message.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::FutureExt;
use parking_lot::Mutex;
use quill_llm::{
    LlmProvider, ProviderMessage, ProviderStreamHandle, Role, StreamEventPayload, StreamFailure,
    StreamRequest, StreamSessionId, StreamTarget,
};
use quill_storage::{MessageRecord, MessageRole, ThreadId};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::{
    ChatError, ChatResult, EmptyPromptSnafu, ProviderUnavailableSnafu, SessionAbortedSnafu,
    SessionBusySnafu, SessionPanickedSnafu, TransportSnafu,
};
use super::repository::{ConversationRepository, MessageDraft};
use super::session::{SessionState, SessionTransition};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Empty selects the provider's default model.
    pub model_id: String,
    pub system_prompt: String,
    pub request_timeout: Duration,
    /// Prior messages sent along with each prompt.
    pub context_messages: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            context_messages: 0,
        }
    }
}

/// What observers see of a thread's session. The buffer is not durable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub content: String,
    pub thought: String,
    /// Message of the most recent failure, cleared by the next submit.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Committed(MessageRecord),
    Cancelled,
}

/// Caller's handle to a running session. Dropping it does not stop the session.
pub struct SessionHandle {
    target: StreamTarget,
    coordinator: StreamCoordinator,
    join: JoinHandle<ChatResult<SessionOutcome>>,
}

impl SessionHandle {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub fn thread_id(&self) -> ThreadId {
        ThreadId::new(self.target.thread_id)
    }

    /// Requests cancellation; returns false once the reply is already committing.
    pub fn cancel(&self) -> bool {
        self.coordinator.cancel_target(self.target)
    }

    pub async fn outcome(self) -> ChatResult<SessionOutcome> {
        let thread_id = self.thread_id();
        self.join.await.context(SessionAbortedSnafu {
            stage: "session-join",
            thread_id,
        })?
    }
}

/// Runs at most one reply session per thread.
#[derive(Clone)]
pub struct StreamCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    repository: ConversationRepository,
    provider: Option<Arc<dyn LlmProvider>>,
    config: ArcSwap<CoordinatorConfig>,
    slots: Mutex<HashMap<ThreadId, ThreadSlot>>,
    next_session: AtomicU64,
}

struct ThreadSlot {
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
    active: Option<ActiveSession>,
}

impl ThreadSlot {
    fn new() -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        Self {
            snapshot: Arc::new(snapshot),
            active: None,
        }
    }

    /// Nothing running, nobody watching and no error left to report.
    fn is_disposable(&self) -> bool {
        self.active.is_none()
            && self.snapshot.receiver_count() == 0
            && self.snapshot.borrow().last_error.is_none()
    }
}

struct ActiveSession {
    target: StreamTarget,
    cancel: CancellationToken,
}

impl StreamCoordinator {
    /// `provider` is `None` when no provider could be configured; submits then
    /// fail with `ProviderUnavailable`.
    pub fn new(
        repository: ConversationRepository,
        provider: Option<Arc<dyn LlmProvider>>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                repository,
                provider,
                config: ArcSwap::from_pointee(config),
                slots: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    pub fn repository(&self) -> &ConversationRepository {
        &self.inner.repository
    }

    pub fn config(&self) -> Arc<CoordinatorConfig> {
        self.inner.config.load_full()
    }

    /// Applies to sessions submitted after the call.
    pub fn update_config(&self, config: CoordinatorConfig) {
        self.inner.config.store(Arc::new(config));
    }

    /// The model new sessions will request.
    pub fn effective_model(&self) -> Option<String> {
        let config = self.inner.config.load();
        let configured = config.model_id.trim();
        if !configured.is_empty() {
            return Some(configured.to_string());
        }
        self.inner
            .provider
            .as_ref()
            .map(|provider| provider.default_model().to_string())
    }

    /// Starts a reply session for `thread_id`.
    ///
    /// Fails immediately with `EmptyPrompt`, `ProviderUnavailable` or
    /// `SessionBusy`; everything after dispatch is reported through the
    /// returned handle and the thread's snapshot. Must be called from within a
    /// tokio runtime.
    pub fn submit(&self, thread_id: ThreadId, prompt: &str) -> ChatResult<SessionHandle> {
        let prompt = prompt.trim();
        ensure!(!prompt.is_empty(), EmptyPromptSnafu { stage: "submit" });
        let provider = self
            .inner
            .provider
            .clone()
            .context(ProviderUnavailableSnafu {
                stage: "submit",
                reason: "no provider is configured",
            })?;

        let session_id = StreamSessionId(self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        let target = StreamTarget::new(thread_id.as_uuid(), session_id);
        let cancel = CancellationToken::new();

        let snapshot = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(thread_id).or_insert_with(ThreadSlot::new);
            ensure!(
                slot.active.is_none(),
                SessionBusySnafu {
                    stage: "submit",
                    thread_id,
                }
            );

            let dispatched = slot
                .snapshot
                .borrow()
                .state
                .apply(SessionTransition::Dispatch(target));
            let Ok(state) = dispatched else {
                return SessionBusySnafu {
                    stage: "submit-dispatch",
                    thread_id,
                }
                .fail();
            };

            slot.snapshot.send_replace(SessionSnapshot {
                state,
                ..SessionSnapshot::default()
            });
            slot.active = Some(ActiveSession {
                target,
                cancel: cancel.clone(),
            });
            slot.snapshot.clone()
        };

        tracing::debug!(thread_id = %thread_id, session_id = %session_id, "reply session dispatched");

        let session = Session {
            inner: self.inner.clone(),
            provider,
            thread_id,
            target,
            cancel,
            snapshot,
        };
        let join = tokio::spawn(session.run(prompt.to_string()));

        Ok(SessionHandle {
            target,
            coordinator: self.clone(),
            join,
        })
    }

    /// Cancels the thread's active session. Returns false when there is none or
    /// its reply is already being committed.
    pub fn cancel(&self, thread_id: ThreadId) -> bool {
        self.cancel_matching(thread_id, None)
    }

    fn cancel_target(&self, target: StreamTarget) -> bool {
        self.cancel_matching(ThreadId::new(target.thread_id), Some(target))
    }

    fn cancel_matching(&self, thread_id: ThreadId, expected: Option<StreamTarget>) -> bool {
        let slots = self.inner.slots.lock();
        let Some(slot) = slots.get(&thread_id) else {
            return false;
        };
        let Some(active) = slot.active.as_ref() else {
            return false;
        };
        if expected.is_some_and(|target| target != active.target) {
            return false;
        }
        if !slot.snapshot.borrow().state.is_cancellable() {
            tracing::debug!(thread_id = %thread_id, "cancel ignored while committing");
            return false;
        }

        active.cancel.cancel();
        tracing::debug!(thread_id = %thread_id, session_id = %active.target.session_id, "reply session cancel requested");
        true
    }

    pub fn snapshot(&self, thread_id: ThreadId) -> SessionSnapshot {
        self.inner
            .slots
            .lock()
            .get(&thread_id)
            .map(|slot| slot.snapshot.borrow().clone())
            .unwrap_or_default()
    }

    /// Observes the thread's session state and buffer.
    pub fn watch(&self, thread_id: ThreadId) -> watch::Receiver<SessionSnapshot> {
        self.inner
            .slots
            .lock()
            .entry(thread_id)
            .or_insert_with(ThreadSlot::new)
            .snapshot
            .subscribe()
    }

    pub fn is_idle(&self, thread_id: ThreadId) -> bool {
        self.inner
            .slots
            .lock()
            .get(&thread_id)
            .is_none_or(|slot| slot.active.is_none())
    }

    /// Cancels any reply in progress, deletes the thread and forgets its
    /// session state.
    pub async fn delete_thread(&self, thread_id: ThreadId) -> ChatResult<()> {
        self.cancel(thread_id);
        self.inner.repository.delete_thread(thread_id).await?;
        let mut slots = self.inner.slots.lock();
        if slots
            .get(&thread_id)
            .is_some_and(|slot| slot.active.is_none())
        {
            slots.remove(&thread_id);
        }
        Ok(())
    }

    #[cfg(test)]
    fn tracked_threads(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

struct Session {
    inner: Arc<CoordinatorInner>,
    provider: Arc<dyn LlmProvider>,
    thread_id: ThreadId,
    target: StreamTarget,
    cancel: CancellationToken,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
}

impl Session {
    async fn run(self, prompt: String) -> ChatResult<SessionOutcome> {
        // A panicking provider must still release the thread.
        let result = match AssertUnwindSafe(self.drive(prompt)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => SessionPanickedSnafu {
                stage: "session-drive",
                thread_id: self.thread_id,
                message: panic_message(payload.as_ref()),
            }
            .fail(),
        };
        self.finish(&result);
        result
    }

    async fn drive(&self, prompt: String) -> ChatResult<SessionOutcome> {
        let user_message = self
            .inner
            .repository
            .create_message(MessageDraft::user(self.thread_id, prompt))
            .await?;

        if self.cancel.is_cancelled() {
            return Ok(SessionOutcome::Cancelled);
        }

        let config = self.inner.config.load_full();
        let request = self.build_request(&config, &user_message).await?;
        let ProviderStreamHandle { mut stream, worker } = self
            .provider
            .stream_chat(request)
            .map_err(|error| ChatError::from_failure("open-stream", StreamFailure::from(&error)))?;
        tokio::spawn(worker);
        self.transition(SessionTransition::BeginStreaming(self.target));

        let deadline = tokio::time::sleep(config.request_timeout);
        tokio::pin!(deadline);

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // Dropping the stream tells the provider worker to stop.
                    return Ok(SessionOutcome::Cancelled);
                }
                _ = &mut deadline => {
                    return TransportSnafu {
                        stage: "stream-timeout",
                        message: format!(
                            "no complete reply within {}s",
                            config.request_timeout.as_secs_f64()
                        ),
                    }
                    .fail();
                }
                event = stream.recv() => event,
            };

            let Some(event) = event else {
                return TransportSnafu {
                    stage: "stream-closed",
                    message: "provider stream closed before completing",
                }
                .fail();
            };
            if !self.snapshot.borrow().state.accepts_stream_event(event.target) {
                tracing::debug!(target = ?event.target, "dropping event for inactive session");
                continue;
            }

            match event.payload {
                StreamEventPayload::Delta(text) => {
                    self.snapshot.send_modify(|snapshot| snapshot.content.push_str(&text));
                }
                StreamEventPayload::ReasoningDelta(text) => {
                    self.snapshot.send_modify(|snapshot| snapshot.thought.push_str(&text));
                }
                StreamEventPayload::Done => break,
                StreamEventPayload::Error(failure) => {
                    return Err(ChatError::from_failure("stream-event", failure));
                }
            }
        }
        drop(stream);

        if !self.begin_commit() {
            return Ok(SessionOutcome::Cancelled);
        }

        let (content, thought) = {
            let snapshot = self.snapshot.borrow();
            (snapshot.content.clone(), snapshot.thought.clone())
        };
        let reply = self
            .inner
            .repository
            .create_message(MessageDraft::assistant(self.thread_id, content, thought))
            .await?;

        tracing::info!(
            thread_id = %self.thread_id,
            message_id = %reply.id,
            "assistant reply committed"
        );
        Ok(SessionOutcome::Committed(reply))
    }

    async fn build_request(
        &self,
        config: &CoordinatorConfig,
        user_message: &MessageRecord,
    ) -> ChatResult<StreamRequest> {
        let mut messages = Vec::new();
        if config.context_messages > 0 {
            let prior = self
                .inner
                .repository
                .list_messages_for_thread(self.thread_id)
                .await?
                .into_iter()
                .filter(|message| message.seq < user_message.seq)
                .collect::<Vec<_>>();
            let skip = prior.len().saturating_sub(config.context_messages);
            messages.extend(prior.into_iter().skip(skip).map(|message| {
                ProviderMessage::new(provider_role(message.role), message.content)
            }));
        }
        messages.push(ProviderMessage::new(
            Role::User,
            user_message.content.clone(),
        ));

        let model_id = match config.model_id.trim() {
            "" => self.provider.default_model().to_string(),
            configured => configured.to_string(),
        };
        let mut request = StreamRequest::new(self.target, model_id, messages);
        if !config.system_prompt.trim().is_empty() {
            request = request.with_preamble(config.system_prompt.clone());
        }
        Ok(request)
    }

    /// Moves to `Committing` unless a cancel got in first. Shares the slot lock
    /// with `cancel_matching`, so the two cannot interleave.
    fn begin_commit(&self) -> bool {
        let _slots = self.inner.slots.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        self.transition(SessionTransition::Commit(self.target))
    }

    fn transition(&self, transition: SessionTransition) -> bool {
        let mut applied = false;
        self.snapshot.send_if_modified(|snapshot| {
            match snapshot.state.apply(transition) {
                Ok(next) => {
                    applied = true;
                    let changed = next != snapshot.state;
                    snapshot.state = next;
                    changed
                }
                Err(rejection) => {
                    tracing::debug!(target = ?self.target, ?rejection, "session transition rejected");
                    false
                }
            }
        });
        applied
    }

    fn finish(&self, result: &ChatResult<SessionOutcome>) {
        match result {
            Ok(SessionOutcome::Committed(_)) => {}
            Ok(SessionOutcome::Cancelled) => {
                self.transition(SessionTransition::Cancel(self.target));
                tracing::info!(thread_id = %self.thread_id, "reply session cancelled");
            }
            Err(error) => {
                tracing::warn!(
                    thread_id = %self.thread_id,
                    stage = error.stage(),
                    error = %error,
                    "reply session failed"
                );
                let message = error.to_string();
                self.transition(SessionTransition::Fail {
                    target: self.target,
                    message: message.clone(),
                });
                self.snapshot
                    .send_modify(|snapshot| snapshot.last_error = Some(message));
            }
        }

        // Release the slot and settle together so a submit that sees `Idle`
        // can always dispatch.
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get_mut(&self.thread_id)
            && slot
                .active
                .as_ref()
                .is_some_and(|active| active.target == self.target)
        {
            slot.active = None;
        }
        self.snapshot.send_modify(|snapshot| {
            if let Ok(next) = snapshot.state.apply(SessionTransition::Settle(self.target)) {
                snapshot.state = next;
            }
            snapshot.content.clear();
            snapshot.thought.clear();
        });
        slots.retain(|_, slot| !slot.is_disposable());
        tracing::debug!(thread_id = %self.thread_id, session_id = %self.target.session_id, "reply session settled");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn provider_role(role: MessageRole) -> Role {
    match role {
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    }
}

#[cfg(test)]
mod tests {
    use quill_llm::{
        ProviderResult, ProviderWorker, StreamEventMapped, make_event_stream,
    };
    use quill_storage::SqliteStorage;

    use super::*;

    /// Answers every request with "ok" as soon as its worker runs.
    struct InstantProvider;

    impl LlmProvider for InstantProvider {
        fn id(&self) -> &str {
            "instant"
        }

        fn name(&self) -> &str {
            "Instant"
        }

        fn default_model(&self) -> &str {
            "instant-model"
        }

        fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
            let (event_tx, stream, _cancel_rx) = make_event_stream();
            let target = request.target;
            let worker: ProviderWorker = Box::pin(async move {
                for payload in [
                    StreamEventPayload::Delta("ok".into()),
                    StreamEventPayload::Done,
                ] {
                    let _ = event_tx.send(StreamEventMapped { target, payload });
                }
            });
            Ok(ProviderStreamHandle { stream, worker })
        }
    }

    async fn coordinator() -> StreamCoordinator {
        let store = SqliteStorage::open_in_memory().await.expect("store opens");
        StreamCoordinator::new(
            ConversationRepository::new(Arc::new(store)),
            Some(Arc::new(InstantProvider)),
            CoordinatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn settled_sessions_without_watchers_are_forgotten() {
        let coordinator = coordinator().await;
        let repository = coordinator.repository().clone();
        let watched = repository.create_thread("watched").await.expect("thread");
        let unwatched = repository.create_thread("unwatched").await.expect("thread");

        let _receiver = coordinator.watch(watched);
        let dropped = coordinator.watch(unwatched);
        drop(dropped);

        let outcome = coordinator
            .submit(watched, "hi")
            .expect("submit")
            .outcome()
            .await
            .expect("session succeeds");
        assert!(matches!(outcome, SessionOutcome::Committed(_)));
        assert_eq!(coordinator.tracked_threads(), 1);

        let outcome = coordinator
            .submit(unwatched, "hi")
            .expect("submit")
            .outcome()
            .await
            .expect("session succeeds");
        assert!(matches!(outcome, SessionOutcome::Committed(_)));
        assert_eq!(coordinator.tracked_threads(), 1);
        assert_eq!(coordinator.snapshot(unwatched), SessionSnapshot::default());
    }

    #[tokio::test]
    async fn deleting_a_thread_drops_its_session_state() {
        let coordinator = coordinator().await;
        let thread_id = coordinator
            .repository()
            .create_thread("short lived")
            .await
            .expect("thread");
        let _receiver = coordinator.watch(thread_id);
        assert_eq!(coordinator.tracked_threads(), 1);

        coordinator.delete_thread(thread_id).await.expect("delete");
        assert_eq!(coordinator.tracked_threads(), 0);
        assert!(matches!(
            coordinator.delete_thread(thread_id).await,
            Err(ChatError::ThreadNotFound { .. })
        ));
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"provider bug"), "provider bug");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&7_u8), "unknown panic");
    }

    #[test]
    fn default_config_carries_system_prompt_and_timeout() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.system_prompt, "You are a helpful AI assistant.");
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.context_messages, 0);
        assert!(config.model_id.is_empty());
    }

    #[test]
    fn stored_roles_map_to_provider_roles() {
        assert_eq!(provider_role(MessageRole::User), Role::User);
        assert_eq!(provider_role(MessageRole::Assistant), Role::Assistant);
    }
}
