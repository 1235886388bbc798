use quill_llm::{FailureKind, StreamFailure};
use quill_storage::{StorageError, ThreadId};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("conversation store is unavailable at {stage}: {source}"))]
    StorageUnavailable {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("thread '{thread_id}' does not exist"))]
    ThreadNotFound {
        stage: &'static str,
        thread_id: ThreadId,
    },
    #[snafu(display("thread '{thread_id}' already has a reply in progress"))]
    SessionBusy {
        stage: &'static str,
        thread_id: ThreadId,
    },
    #[snafu(display("could not reach the completion provider: {message}"))]
    Transport {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("completion provider returned an error: {message}"))]
    Remote {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("prompt is empty"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("no completion provider is configured: {reason}"))]
    ProviderUnavailable {
        stage: &'static str,
        reason: String,
    },
    #[snafu(display("reply session for thread '{thread_id}' panicked: {message}"))]
    SessionPanicked {
        stage: &'static str,
        thread_id: ThreadId,
        message: String,
    },
    #[snafu(display("reply session for thread '{thread_id}' stopped unexpectedly: {source}"))]
    SessionAborted {
        stage: &'static str,
        thread_id: ThreadId,
        source: tokio::task::JoinError,
    },
}

impl ChatError {
    /// Maps a storage error touching `thread_id`, keeping missing rows distinct
    /// from an unusable store.
    pub(crate) fn from_storage(
        stage: &'static str,
        thread_id: ThreadId,
        source: StorageError,
    ) -> Self {
        if source.is_not_found() {
            Self::ThreadNotFound { stage, thread_id }
        } else {
            Self::StorageUnavailable { stage, source }
        }
    }

    pub(crate) fn from_failure(stage: &'static str, failure: StreamFailure) -> Self {
        match failure.kind {
            FailureKind::Transport => Self::Transport {
                stage,
                message: failure.message,
            },
            FailureKind::Remote => Self::Remote {
                stage,
                message: failure.message,
            },
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::StorageUnavailable { stage, .. }
            | Self::ThreadNotFound { stage, .. }
            | Self::SessionBusy { stage, .. }
            | Self::Transport { stage, .. }
            | Self::Remote { stage, .. }
            | Self::EmptyPrompt { stage }
            | Self::ProviderUnavailable { stage, .. }
            | Self::SessionPanicked { stage, .. }
            | Self::SessionAborted { stage, .. } => stage,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
