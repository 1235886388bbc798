mod coordinator;
mod error;
mod prompt;
mod repository;
mod session;

pub use coordinator::{
    CoordinatorConfig, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SYSTEM_PROMPT, SessionHandle,
    SessionOutcome, SessionSnapshot, StreamCoordinator,
};
pub use error::{ChatError, ChatResult};
pub use prompt::{MAX_PROMPT_CHARS, exceeds_prompt_budget, prompt_char_count, tidy_prompt};
pub use repository::{ConversationRepository, MessageDraft, filter_threads};
pub use session::{
    SessionState, SessionTransition, SessionTransitionRejection, SessionTransitionResult,
};
