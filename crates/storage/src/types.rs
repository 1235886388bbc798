use std::fmt;

use super::ids::{MessageId, ThreadId};

/// Title stored for threads created with an empty or whitespace-only title.
pub const DEFAULT_THREAD_TITLE: &str = "Untitled";

/// Returns the trimmed title, or [`DEFAULT_THREAD_TITLE`] when nothing is left.
pub fn normalize_thread_title(title: &str) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        DEFAULT_THREAD_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Logical tables the store exposes to change subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Threads,
    Messages,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Threads, Table::Messages];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Threads => "threads",
            Self::Messages => "messages",
        }
    }
}

/// Storage-local message role, decoupled from provider-facing roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: ThreadId,
    pub title: String,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewThread {
    pub title: String,
}

impl NewThread {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub thread_id: ThreadId,
    /// Per-thread commit order, starting at 1.
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    pub thought: String,
    pub created_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub thought: String,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            thought: String::new(),
        }
    }

    pub fn assistant(content: impl Into<String>, thought: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            thought: thought.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_titles_normalize_to_default() {
        assert_eq!(normalize_thread_title(""), DEFAULT_THREAD_TITLE);
        assert_eq!(normalize_thread_title("   \t\n"), DEFAULT_THREAD_TITLE);
        assert_eq!(normalize_thread_title("  Trip plans "), "Trip plans");
    }
}
