use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::{MessageId, ThreadId};
use super::live::ChangeFeed;
use super::types::{
    MessageRecord, MessageRole, NewMessage, NewThread, Table, ThreadRecord, normalize_thread_title,
};
use super::{BoxFuture, ChangeSource, MessageStore, ThreadStore};

/// SQLite-backed store for threads and messages.
///
/// The pool holds exactly one long-lived connection. Writes are therefore
/// serialized, and every multi-statement write runs inside one transaction, so
/// readers only ever see whole writes. Cloning shares the pool and change feed.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    changes: ChangeFeed,
}

impl SqliteStorage {
    /// Opens (creating if needed) the database at a file path, a `sqlite:` URL
    /// or `:memory:`, and applies pending migrations.
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // In-memory databases live only as long as their connection, so the
        // single connection is never reaped.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened sqlite conversation store");

        Ok(Self {
            pool,
            changes: ChangeFeed::new(),
        })
    }

    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Waits for in-flight queries and closes the connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl ChangeSource for SqliteStorage {
    fn change_feed(&self) -> &ChangeFeed {
        &self.changes
    }
}

impl ThreadStore for SqliteStorage {
    fn insert_thread(&self, input: NewThread) -> BoxFuture<'_, StorageResult<ThreadRecord>> {
        Box::pin(async move {
            let title = normalize_thread_title(&input.title);
            let thread_id = ThreadId::new_v7();
            let now = unix_timestamp_millis();

            sqlx::query("INSERT INTO threads (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)")
                .bind(thread_id.to_string())
                .bind(title.clone())
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "thread-insert",
                })?;

            self.changes.publish(&[Table::Threads]);
            tracing::debug!(thread_id = %thread_id, "thread inserted");

            let timestamp = i64_to_u64(now, "thread-insert-timestamp")?;
            Ok(ThreadRecord {
                id: thread_id,
                title,
                created_at_unix_millis: timestamp,
                updated_at_unix_millis: timestamp,
            })
        })
    }

    fn get_thread(&self, thread_id: ThreadId) -> BoxFuture<'_, StorageResult<Option<ThreadRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ThreadRow>(
                "SELECT id, title, created_at, updated_at FROM threads WHERE id = ?",
            )
            .bind(thread_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "thread-get-query",
            })?;

            row.map(thread_row_to_record).transpose()
        })
    }

    fn list_threads(&self) -> BoxFuture<'_, StorageResult<Vec<ThreadRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ThreadRow>(
                "SELECT id, title, created_at, updated_at FROM threads ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "thread-list-query",
            })?;

            rows.into_iter().map(thread_row_to_record).collect()
        })
    }

    fn delete_thread(&self, thread_id: ThreadId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "thread-delete-begin",
            })?;

            // Messages go first in the same transaction; the FK cascade is a backstop.
            let removed_messages = sqlx::query("DELETE FROM messages WHERE thread_id = ?")
                .bind(thread_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "thread-delete-messages",
                })?
                .rows_affected();

            let removed_threads = sqlx::query("DELETE FROM threads WHERE id = ?")
                .bind(thread_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "thread-delete-thread",
                })?
                .rows_affected();

            // Dropping `tx` on the error path rolls back.
            ensure!(
                removed_threads > 0,
                NotFoundSnafu {
                    stage: "thread-delete-missing",
                    entity: "thread",
                    id: thread_id.to_string(),
                }
            );

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "thread-delete-commit",
            })?;

            self.changes.publish(&[Table::Messages, Table::Threads]);
            tracing::debug!(
                thread_id = %thread_id,
                removed_messages,
                "thread deleted with its messages"
            );

            Ok(())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        thread_id: ThreadId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            let thread_count =
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM threads WHERE id = ?")
                    .bind(thread_id.to_string())
                    .fetch_one(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-append-load-thread",
                    })?;
            ensure!(
                thread_count > 0,
                NotFoundSnafu {
                    stage: "message-append-missing-thread",
                    entity: "thread",
                    id: thread_id.to_string(),
                }
            );

            let next_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE thread_id = ?",
            )
            .bind(thread_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-next-seq",
            })?;

            let now = unix_timestamp_millis();
            let message_id = MessageId::new_v7();

            sqlx::query(
                "INSERT INTO messages (id, thread_id, seq, role, content, thought, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(thread_id.to_string())
            .bind(next_seq)
            .bind(input.role.as_str())
            .bind(input.content.clone())
            .bind(input.thought.clone())
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            // MAX keeps updated_at monotonic even if the wall clock steps back.
            sqlx::query("UPDATE threads SET updated_at = MAX(updated_at, ?) WHERE id = ?")
                .bind(now)
                .bind(thread_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-touch-thread",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            self.changes.publish(&[Table::Messages, Table::Threads]);
            tracing::debug!(
                thread_id = %thread_id,
                message_id = %message_id,
                seq = next_seq,
                role = %input.role,
                "message appended"
            );

            Ok(MessageRecord {
                id: message_id,
                thread_id,
                seq: i64_to_u64(next_seq, "message-append-seq")?,
                role: input.role,
                content: input.content,
                thought: input.thought,
                created_at_unix_millis: i64_to_u64(now, "message-append-created-at")?,
            })
        })
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, MessageRow>(
                "SELECT id, thread_id, seq, role, content, thought, created_at FROM messages WHERE id = ?",
            )
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-get-query",
            })?;

            row.map(message_row_to_record).transpose()
        })
    }

    fn list_messages(
        &self,
        thread_id: ThreadId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, thread_id, seq, role, content, thought, created_at FROM messages WHERE thread_id = ? ORDER BY seq ASC",
            )
            .bind(thread_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct ThreadRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    thread_id: String,
    seq: i64,
    role: String,
    content: String,
    thought: String,
    created_at: i64,
}

fn thread_row_to_record(row: ThreadRow) -> StorageResult<ThreadRecord> {
    Ok(ThreadRecord {
        id: ThreadId::parse(&row.id)?,
        title: row.title,
        created_at_unix_millis: i64_to_u64(row.created_at, "thread-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "thread-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        thread_id: ThreadId::parse(&row.thread_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        thought: row.thought,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-row-role",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
