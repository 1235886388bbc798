mod common;

use std::sync::Arc;
use std::time::Duration;

use quill_conversation::{
    ChatError, ConversationRepository, CoordinatorConfig, MessageDraft, SessionOutcome,
    SessionState, StreamCoordinator,
};
use quill_llm::{Role, StreamEventPayload, StreamFailure};
use quill_storage::{MessageRole, SqliteStorage, ThreadId};

use common::{PanickingProvider, gated_harness, harness, harness_with, wait_for_snapshot};

fn turns(messages: &[quill_storage::MessageRecord]) -> Vec<(MessageRole, String)> {
    messages
        .iter()
        .map(|message| (message.role, message.content.clone()))
        .collect()
}

#[tokio::test]
async fn submit_persists_user_message_then_reply() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("").await.expect("thread");
    harness.provider.script(vec![
        StreamEventPayload::ReasoningDelta("greeting ".into()),
        StreamEventPayload::Delta("Hel".into()),
        StreamEventPayload::ReasoningDelta("back".into()),
        StreamEventPayload::Delta("lo!".into()),
        StreamEventPayload::Done,
    ]);

    let handle = harness
        .coordinator
        .submit(thread_id, "  hi  ")
        .expect("submit accepted");
    let outcome = handle.outcome().await.expect("session succeeds");

    let SessionOutcome::Committed(reply) = outcome else {
        panic!("expected a committed reply, got {outcome:?}");
    };
    assert_eq!(reply.content, "Hello!");
    assert_eq!(reply.thought, "greeting back");

    let messages = harness
        .repository
        .list_messages_for_thread(thread_id)
        .await
        .expect("list");
    assert_eq!(
        turns(&messages),
        [
            (MessageRole::User, "hi".to_string()),
            (MessageRole::Assistant, "Hello!".to_string()),
        ]
    );

    let snapshot = harness.coordinator.snapshot(thread_id);
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.content.is_empty());
    assert!(snapshot.thought.is_empty());
    assert_eq!(snapshot.last_error, None);
    assert!(harness.coordinator.is_idle(thread_id));

    let requests = harness.provider.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].preamble.as_deref(),
        Some("You are a helpful AI assistant.")
    );
    assert_eq!(requests[0].model_id, "test-model");
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].messages[0].role, Role::User);
    assert_eq!(requests[0].messages[0].content, "hi");
}

#[tokio::test]
async fn buffer_is_observable_while_streaming() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("live").await.expect("thread");
    let feed = harness.provider.feed();
    let mut snapshots = harness.coordinator.watch(thread_id);

    let handle = harness.coordinator.submit(thread_id, "tell me").expect("submit");
    wait_for_snapshot(&mut snapshots, |snapshot| {
        matches!(snapshot.state, SessionState::Streaming(_))
    })
    .await;

    feed.send(StreamEventPayload::Delta("par".into())).expect("feed open");
    feed.send(StreamEventPayload::ReasoningDelta("hmm".into()))
        .expect("feed open");
    let buffered = wait_for_snapshot(&mut snapshots, |snapshot| {
        snapshot.content == "par" && snapshot.thought == "hmm"
    })
    .await;
    assert_eq!(buffered.state, SessionState::Streaming(handle.target()));

    // Nothing but the user message is durable yet.
    let messages = harness
        .repository
        .list_messages_for_thread(thread_id)
        .await
        .expect("list");
    assert_eq!(messages.len(), 1);

    feed.send(StreamEventPayload::Delta("tial".into())).expect("feed open");
    feed.send(StreamEventPayload::Done).expect("feed open");
    assert!(matches!(
        handle.outcome().await,
        Ok(SessionOutcome::Committed(reply)) if reply.content == "partial"
    ));
}

#[tokio::test]
async fn second_submit_is_busy_and_first_session_still_commits() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("busy").await.expect("thread");
    let feed = harness.provider.feed();
    let mut snapshots = harness.coordinator.watch(thread_id);

    let first = harness.coordinator.submit(thread_id, "first").expect("submit");
    wait_for_snapshot(&mut snapshots, |snapshot| {
        matches!(snapshot.state, SessionState::Streaming(_))
    })
    .await;

    let Err(error) = harness.coordinator.submit(thread_id, "second") else {
        panic!("second submit must be rejected");
    };
    assert!(matches!(error, ChatError::SessionBusy { thread_id: id, .. } if id == thread_id));

    feed.send(StreamEventPayload::Delta("done".into())).expect("feed open");
    feed.send(StreamEventPayload::Done).expect("feed open");
    assert!(matches!(
        first.outcome().await,
        Ok(SessionOutcome::Committed(_))
    ));

    let messages = harness
        .repository
        .list_messages_for_thread(thread_id)
        .await
        .expect("list");
    assert_eq!(
        turns(&messages),
        [
            (MessageRole::User, "first".to_string()),
            (MessageRole::Assistant, "done".to_string()),
        ]
    );
    assert_eq!(harness.provider.requests().len(), 1);
}

#[tokio::test]
async fn submit_while_dispatching_is_busy() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("early").await.expect("thread");
    let feed = harness.provider.feed();

    // The spawned session has not run yet on this single-threaded runtime.
    let first = harness.coordinator.submit(thread_id, "first").expect("submit");
    assert_eq!(
        harness.coordinator.snapshot(thread_id).state,
        SessionState::Dispatching(first.target())
    );
    let Err(error) = harness.coordinator.submit(thread_id, "second") else {
        panic!("submit during dispatch must be rejected");
    };
    assert!(matches!(error, ChatError::SessionBusy { thread_id: id, .. } if id == thread_id));

    feed.send(StreamEventPayload::Delta("only once".into())).expect("feed open");
    feed.send(StreamEventPayload::Done).expect("feed open");
    assert!(matches!(
        first.outcome().await,
        Ok(SessionOutcome::Committed(_))
    ));
    assert_eq!(harness.provider.requests().len(), 1);
}

#[tokio::test]
async fn cancel_during_commit_is_ignored() {
    let (harness, gate) = gated_harness().await;
    let thread_id = harness.repository.create_thread("late").await.expect("thread");
    harness.provider.script(vec![
        StreamEventPayload::Delta("kept".into()),
        StreamEventPayload::Done,
    ]);
    let mut snapshots = harness.coordinator.watch(thread_id);

    let handle = harness.coordinator.submit(thread_id, "go").expect("submit");
    wait_for_snapshot(&mut snapshots, |snapshot| {
        matches!(snapshot.state, SessionState::Committing(_))
    })
    .await;

    assert!(!harness.coordinator.cancel(thread_id));
    assert!(!handle.cancel());
    assert!(!harness.coordinator.is_idle(thread_id));

    gate.add_permits(1);
    let Ok(SessionOutcome::Committed(reply)) = handle.outcome().await else {
        panic!("commit must win over a late cancel");
    };
    assert_eq!(reply.content, "kept");
    assert!(harness.coordinator.is_idle(thread_id));

    let messages = harness
        .repository
        .list_messages_for_thread(thread_id)
        .await
        .expect("list");
    assert_eq!(
        turns(&messages),
        [
            (MessageRole::User, "go".to_string()),
            (MessageRole::Assistant, "kept".to_string()),
        ]
    );
}

#[tokio::test]
async fn panicking_provider_releases_the_thread() {
    let store = SqliteStorage::open_in_memory().await.expect("store opens");
    let repository = ConversationRepository::new(Arc::new(store));
    let coordinator = StreamCoordinator::new(
        repository.clone(),
        Some(Arc::new(PanickingProvider) as Arc<dyn quill_llm::LlmProvider>),
        CoordinatorConfig::default(),
    );
    let thread_id = repository.create_thread("fragile").await.expect("thread");
    let _snapshots = coordinator.watch(thread_id);

    let outcome = coordinator.submit(thread_id, "boom").expect("submit").outcome().await;
    let Err(ChatError::SessionPanicked { message, .. }) = outcome else {
        panic!("panic must surface as a session error");
    };
    assert_eq!(message, "provider bug");

    assert!(coordinator.is_idle(thread_id));
    let snapshot = coordinator.snapshot(thread_id);
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.last_error.is_some_and(|error| error.contains("provider bug")));

    // The thread accepts the next prompt instead of staying busy.
    let retry = coordinator.submit(thread_id, "again").expect("not busy");
    assert!(matches!(
        retry.outcome().await,
        Err(ChatError::SessionPanicked { .. })
    ));
    let messages = repository
        .list_messages_for_thread(thread_id)
        .await
        .expect("list");
    assert_eq!(
        turns(&messages),
        [
            (MessageRole::User, "boom".to_string()),
            (MessageRole::User, "again".to_string()),
        ]
    );
}

#[tokio::test]
async fn cancel_before_commit_discards_the_reply() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("cancel").await.expect("thread");
    let feed = harness.provider.feed();
    let mut snapshots = harness.coordinator.watch(thread_id);

    let handle = harness.coordinator.submit(thread_id, "long answer please").expect("submit");
    feed.send(StreamEventPayload::Delta("partial".into()))
        .expect("feed open");
    wait_for_snapshot(&mut snapshots, |snapshot| snapshot.content == "partial").await;

    assert!(harness.coordinator.cancel(thread_id));
    // Increments after the cancel must not revive the session.
    let _ = feed.send(StreamEventPayload::Delta(" more".into()));
    let _ = feed.send(StreamEventPayload::Done);

    assert!(matches!(handle.outcome().await, Ok(SessionOutcome::Cancelled)));

    let messages = harness
        .repository
        .list_messages_for_thread(thread_id)
        .await
        .expect("list");
    assert_eq!(
        turns(&messages),
        [(MessageRole::User, "long answer please".to_string())]
    );

    let snapshot = harness.coordinator.snapshot(thread_id);
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.content.is_empty());
    assert!(!harness.coordinator.cancel(thread_id));
}

#[tokio::test]
async fn handle_cancel_stops_its_own_session() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("handle").await.expect("thread");
    let _feed = harness.provider.feed();
    let mut snapshots = harness.coordinator.watch(thread_id);

    let handle = harness.coordinator.submit(thread_id, "wait").expect("submit");
    wait_for_snapshot(&mut snapshots, |snapshot| {
        matches!(snapshot.state, SessionState::Streaming(_))
    })
    .await;

    assert!(handle.cancel());
    assert!(matches!(handle.outcome().await, Ok(SessionOutcome::Cancelled)));
    assert!(harness.coordinator.is_idle(thread_id));
}

#[tokio::test]
async fn remote_error_fails_without_partial_message() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("fail").await.expect("thread");
    harness.provider.script(vec![
        StreamEventPayload::Delta("half an ans".into()),
        StreamEventPayload::Error(StreamFailure::remote("upstream returned 500")),
    ]);

    let handle = harness.coordinator.submit(thread_id, "question").expect("submit");
    let error = handle.outcome().await.expect_err("session fails");
    assert!(matches!(error, ChatError::Remote { ref message, .. } if message == "upstream returned 500"));

    let messages = harness
        .repository
        .list_messages_for_thread(thread_id)
        .await
        .expect("list");
    assert_eq!(turns(&messages), [(MessageRole::User, "question".to_string())]);

    let snapshot = harness.coordinator.snapshot(thread_id);
    assert_eq!(snapshot.state, SessionState::Idle);
    assert!(snapshot.content.is_empty());
    assert!(
        snapshot
            .last_error
            .as_deref()
            .is_some_and(|message| message.contains("upstream returned 500"))
    );

    // A resubmit is accepted and clears the previous error.
    harness
        .provider
        .script(vec![StreamEventPayload::Delta("ok".into()), StreamEventPayload::Done]);
    let retry = harness.coordinator.submit(thread_id, "question").expect("resubmit");
    assert_eq!(harness.coordinator.snapshot(thread_id).last_error, None);
    assert!(matches!(retry.outcome().await, Ok(SessionOutcome::Committed(_))));
}

#[tokio::test]
async fn request_timeout_fails_as_transport_error() {
    let harness = harness_with(CoordinatorConfig {
        request_timeout: Duration::from_millis(50),
        ..CoordinatorConfig::default()
    })
    .await;
    let thread_id = harness.repository.create_thread("slow").await.expect("thread");
    let _silent_feed = harness.provider.feed();

    let handle = harness.coordinator.submit(thread_id, "anyone?").expect("submit");
    let error = handle.outcome().await.expect_err("times out");
    assert!(matches!(error, ChatError::Transport { .. }));
    assert!(harness.coordinator.is_idle(thread_id));
}

#[tokio::test]
async fn provider_closing_early_is_a_transport_error() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("cut").await.expect("thread");
    harness
        .provider
        .script(vec![StreamEventPayload::Delta("cut off".into())]);

    let handle = harness.coordinator.submit(thread_id, "go").expect("submit");
    let error = handle.outcome().await.expect_err("fails");
    assert!(matches!(error, ChatError::Transport { .. }));
}

#[tokio::test]
async fn missing_thread_fails_before_any_request() {
    let harness = harness().await;
    let thread_id = ThreadId::new_v7();

    let handle = harness.coordinator.submit(thread_id, "hello").expect("submit");
    let error = handle.outcome().await.expect_err("thread is missing");
    assert!(matches!(error, ChatError::ThreadNotFound { .. }));
    assert!(harness.provider.requests().is_empty());
    assert!(harness.coordinator.is_idle(thread_id));
}

#[tokio::test]
async fn blank_prompt_and_missing_provider_are_rejected_up_front() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("t").await.expect("thread");

    assert!(matches!(
        harness.coordinator.submit(thread_id, " \n\t "),
        Err(ChatError::EmptyPrompt { .. })
    ));

    let store = SqliteStorage::open_in_memory().await.expect("store");
    let repository = ConversationRepository::new(Arc::new(store));
    let offline = StreamCoordinator::new(repository, None, CoordinatorConfig::default());
    assert!(matches!(
        offline.submit(thread_id, "hi"),
        Err(ChatError::ProviderUnavailable { .. })
    ));
    assert_eq!(offline.effective_model(), None);
}

#[tokio::test]
async fn context_window_sends_recent_history() {
    let harness = harness_with(CoordinatorConfig {
        context_messages: 2,
        model_id: "picked-model".to_string(),
        ..CoordinatorConfig::default()
    })
    .await;
    let thread_id = harness.repository.create_thread("memory").await.expect("thread");
    for draft in [
        MessageDraft::user(thread_id, "one"),
        MessageDraft::assistant(thread_id, "two", ""),
        MessageDraft::user(thread_id, "three"),
    ] {
        harness.repository.create_message(draft).await.expect("seed");
    }
    harness
        .provider
        .script(vec![StreamEventPayload::Delta("four".into()), StreamEventPayload::Done]);

    let handle = harness.coordinator.submit(thread_id, "next").expect("submit");
    handle.outcome().await.expect("commits");

    let requests = harness.provider.requests();
    let sent = requests[0]
        .messages
        .iter()
        .map(|message| (message.role, message.content.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        sent,
        [
            (Role::Assistant, "two"),
            (Role::User, "three"),
            (Role::User, "next"),
        ]
    );
    assert_eq!(requests[0].model_id, "picked-model");
}

#[tokio::test]
async fn reply_commits_after_every_observer_is_gone() {
    let harness = harness().await;
    let thread_id = harness.repository.create_thread("detached").await.expect("thread");
    let feed = harness.provider.feed();

    let handle = harness.coordinator.submit(thread_id, "fire and forget").expect("submit");
    drop(handle);
    feed.send(StreamEventPayload::Delta("still saved".into()))
        .expect("feed open");
    feed.send(StreamEventPayload::Done).expect("feed open");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _live = harness.repository.watch_messages(thread_id, move |result| {
        let _ = tx.send(result.expect("list succeeds").len());
    });
    let mut count = 0;
    while count < 2 {
        count = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reply committed in time")
            .expect("subscription open");
    }
    assert_eq!(count, 2);
}

#[tokio::test]
async fn sessions_on_different_threads_run_concurrently() {
    let harness = harness().await;
    let first_thread = harness.repository.create_thread("a").await.expect("thread");
    let second_thread = harness.repository.create_thread("b").await.expect("thread");
    let first_feed = harness.provider.feed();
    let second_feed = harness.provider.feed();

    let first = harness.coordinator.submit(first_thread, "to a").expect("submit a");
    let second = harness.coordinator.submit(second_thread, "to b").expect("submit b");

    for feed in [&second_feed, &first_feed] {
        feed.send(StreamEventPayload::Delta("reply".into()))
            .expect("feed open");
        feed.send(StreamEventPayload::Done).expect("feed open");
    }

    assert!(matches!(first.outcome().await, Ok(SessionOutcome::Committed(_))));
    assert!(matches!(second.outcome().await, Ok(SessionOutcome::Committed(_))));

    for thread_id in [first_thread, second_thread] {
        let messages = harness
            .repository
            .list_messages_for_thread(thread_id)
            .await
            .expect("list");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, MessageRole::Assistant);
    }
}

#[tokio::test]
async fn committed_conversation_survives_reopening_the_store() {
    let directory = tempfile::tempdir().expect("temp dir");
    let path = directory.path().join("chat.db");
    let location = path.to_str().expect("utf-8 path");

    let store = SqliteStorage::open(location).await.expect("store opens");
    let repository = ConversationRepository::new(Arc::new(store.clone()));
    let provider = common::TestProvider::new();
    provider.script(vec![
        StreamEventPayload::Delta("persisted".into()),
        StreamEventPayload::Done,
    ]);
    let coordinator = StreamCoordinator::new(
        repository.clone(),
        Some(provider as Arc<dyn quill_llm::LlmProvider>),
        CoordinatorConfig::default(),
    );

    let thread_id = repository.create_thread("durable").await.expect("thread");
    let outcome = coordinator
        .submit(thread_id, "remember this")
        .expect("submit")
        .outcome()
        .await
        .expect("session succeeds");
    assert!(matches!(outcome, SessionOutcome::Committed(_)));
    store.close().await;

    let reopened = SqliteStorage::open(location).await.expect("store reopens");
    let repository = ConversationRepository::new(Arc::new(reopened));
    let threads = repository.list_threads().await.expect("threads");
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].title, "durable");
    let messages = repository
        .list_messages_for_thread(thread_id)
        .await
        .expect("messages");
    assert_eq!(
        turns(&messages),
        [
            (MessageRole::User, "remember this".to_string()),
            (MessageRole::Assistant, "persisted".to_string()),
        ]
    );
}
