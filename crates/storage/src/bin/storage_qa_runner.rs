//! Runs storage checks against a database file and prints `key=value` lines.
//!
//! `storage_qa_runner <scenario|all> --db <path>`

use std::fmt::Display;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use quill_storage::{
    ChangeSource, DEFAULT_THREAD_TITLE, MessageId, MessageRole, MessageStore, NewMessage,
    NewThread, SqliteStorage, StorageError, Table, ThreadId, ThreadStore,
};

const SCENARIOS: [&str; 7] = [
    "schema",
    "orphan_insert",
    "thread_lifecycle",
    "cascade",
    "ordering",
    "change_feed",
    "reopen",
];

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("usage: storage_qa_runner <scenario|all> --db <path>"))]
    Usage { stage: &'static str },
    #[snafu(display("unknown scenario '{name}', expected one of {}", SCENARIOS.join(", ")))]
    UnknownScenario { stage: &'static str, name: String },
    #[snafu(display("storage call failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sqlite query failed on `{stage}`: {source}"))]
    Sql {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("{scenario}: check `{check}` did not hold"))]
    CheckFailed {
        stage: &'static str,
        scenario: &'static str,
        check: &'static str,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

/// Collected results of one scenario; every boolean entry must be true.
struct Report {
    scenario: &'static str,
    lines: Vec<(&'static str, String)>,
    failed: Option<&'static str>,
}

impl Report {
    fn new(scenario: &'static str) -> Self {
        Self {
            scenario,
            lines: Vec::new(),
            failed: None,
        }
    }

    fn note(&mut self, key: &'static str, value: impl Display) {
        self.lines.push((key, value.to_string()));
    }

    fn check(&mut self, key: &'static str, holds: bool) {
        self.note(key, holds);
        if !holds && self.failed.is_none() {
            self.failed = Some(key);
        }
    }

    fn finish(self) -> RunnerResult<()> {
        for (key, value) in &self.lines {
            println!("{}.{key}={value}", self.scenario);
        }
        match self.failed {
            Some(check) => CheckFailedSnafu {
                stage: "finish-report",
                scenario: self.scenario,
                check,
            }
            .fail(),
            None => Ok(()),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    match run().await {
        Ok(()) => println!("runner_ok=true"),
        Err(error) => {
            println!("runner_ok=false");
            eprintln!("runner_error={error}");
            std::process::exit(1);
        }
    }
}

async fn run() -> RunnerResult<()> {
    let mut args = std::env::args().skip(1);
    let scenario = args.next().context(UsageSnafu {
        stage: "read-scenario",
    })?;
    let db_path = match (args.next().as_deref(), args.next()) {
        (Some("--db"), Some(path)) => path,
        _ => return UsageSnafu { stage: "read-db" }.fail(),
    };
    ensure!(args.next().is_none(), UsageSnafu { stage: "trailing-args" });

    let selected: Vec<&str> = if scenario == "all" {
        SCENARIOS.to_vec()
    } else {
        let name = SCENARIOS
            .iter()
            .copied()
            .find(|name| *name == scenario)
            .context(UnknownScenarioSnafu {
                stage: "select-scenario",
                name: scenario.clone(),
            })?;
        vec![name]
    };

    println!("db_path={db_path}");
    for name in selected {
        let report = run_scenario(name, &db_path).await?;
        report.finish()?;
    }
    Ok(())
}

async fn run_scenario(name: &str, db_path: &str) -> RunnerResult<Report> {
    let storage = SqliteStorage::open(db_path)
        .await
        .context(StoreSnafu { stage: "open" })?;
    let report = match name {
        "schema" => schema(&storage).await?,
        "orphan_insert" => orphan_insert(&storage).await?,
        "thread_lifecycle" => thread_lifecycle(&storage).await?,
        "cascade" => cascade(&storage).await?,
        "ordering" => ordering(&storage).await?,
        "change_feed" => change_feed(&storage).await?,
        _ => {
            storage.close().await;
            return reopen(db_path).await;
        }
    };
    storage.close().await;
    Ok(report)
}

async fn schema(storage: &SqliteStorage) -> RunnerResult<Report> {
    let mut report = Report::new("schema");
    let tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
    )
    .fetch_all(storage.pool())
    .await
    .context(SqlSnafu { stage: "schema-tables" })?;
    let journal = sqlx::query_scalar::<_, String>("PRAGMA journal_mode")
        .fetch_one(storage.pool())
        .await
        .context(SqlSnafu { stage: "schema-journal" })?;
    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys")
        .fetch_one(storage.pool())
        .await
        .context(SqlSnafu { stage: "schema-foreign-keys" })?;

    report.check(
        "tables_present",
        ["threads", "messages"]
            .iter()
            .all(|table| tables.iter().any(|name| name == table)),
    );
    report.check("wal", journal.eq_ignore_ascii_case("wal"));
    report.check("foreign_keys", foreign_keys == 1);
    Ok(report)
}

async fn orphan_insert(storage: &SqliteStorage) -> RunnerResult<Report> {
    let mut report = Report::new("orphan_insert");
    let inserted = sqlx::query(
        "INSERT INTO messages (id, thread_id, seq, role, content, thought, created_at) \
         VALUES (?, ?, 1, 'user', 'orphan', '', 0)",
    )
    .bind(MessageId::new_v7().to_string())
    .bind(ThreadId::new_v7().to_string())
    .execute(storage.pool())
    .await;

    let rejected = match inserted {
        Ok(_) => false,
        Err(sqlx::Error::Database(error)) => error.is_foreign_key_violation(),
        Err(source) => return Err(RunnerError::Sql { stage: "orphan-insert", source }),
    };
    report.check("rejected_by_foreign_key", rejected);

    let via_store = storage
        .append_message(ThreadId::new_v7(), NewMessage::user("orphan"))
        .await;
    report.check(
        "append_reports_not_found",
        via_store.is_err_and(|error| error.is_not_found()),
    );
    Ok(report)
}

async fn thread_lifecycle(storage: &SqliteStorage) -> RunnerResult<Report> {
    let mut report = Report::new("thread_lifecycle");
    let blank = storage
        .insert_thread(NewThread::new(" \t"))
        .await
        .context(StoreSnafu { stage: "lifecycle-insert-blank" })?;
    let named = storage
        .insert_thread(NewThread::new("  QA thread "))
        .await
        .context(StoreSnafu { stage: "lifecycle-insert-named" })?;
    report.check("blank_title_defaulted", blank.title == DEFAULT_THREAD_TITLE);
    report.check("title_trimmed", named.title == "QA thread");

    let listed = storage
        .list_threads()
        .await
        .context(StoreSnafu { stage: "lifecycle-list" })?;
    report.note("listed", listed.len());
    report.check(
        "recent_first",
        listed.windows(2).all(|pair| {
            (pair[0].updated_at_unix_millis, pair[0].id)
                >= (pair[1].updated_at_unix_millis, pair[1].id)
        }),
    );

    storage
        .delete_thread(named.id)
        .await
        .context(StoreSnafu { stage: "lifecycle-delete" })?;
    let gone = storage
        .get_thread(named.id)
        .await
        .context(StoreSnafu { stage: "lifecycle-get" })?
        .is_none();
    report.check("deleted", gone);
    report.check(
        "second_delete_not_found",
        storage
            .delete_thread(named.id)
            .await
            .is_err_and(|error| error.is_not_found()),
    );
    Ok(report)
}

async fn cascade(storage: &SqliteStorage) -> RunnerResult<Report> {
    let mut report = Report::new("cascade");
    let thread = storage
        .insert_thread(NewThread::new("cascade"))
        .await
        .context(StoreSnafu { stage: "cascade-insert" })?;
    for content in ["one", "two", "three"] {
        storage
            .append_message(thread.id, NewMessage::user(content))
            .await
            .context(StoreSnafu { stage: "cascade-append" })?;
    }
    storage
        .delete_thread(thread.id)
        .await
        .context(StoreSnafu { stage: "cascade-delete" })?;

    let leftover = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE thread_id = ?")
        .bind(thread.id.to_string())
        .fetch_one(storage.pool())
        .await
        .context(SqlSnafu { stage: "cascade-count" })?;
    report.note("leftover_messages", leftover);
    report.check("messages_removed", leftover == 0);
    Ok(report)
}

async fn ordering(storage: &SqliteStorage) -> RunnerResult<Report> {
    let mut report = Report::new("ordering");
    let thread = storage
        .insert_thread(NewThread::new("ordering"))
        .await
        .context(StoreSnafu { stage: "ordering-insert" })?;
    storage
        .append_message(thread.id, NewMessage::user("question"))
        .await
        .context(StoreSnafu { stage: "ordering-append-user" })?;
    let answer = storage
        .append_message(thread.id, NewMessage::assistant("answer", "reasoning"))
        .await
        .context(StoreSnafu { stage: "ordering-append-assistant" })?;

    let messages = storage
        .list_messages(thread.id)
        .await
        .context(StoreSnafu { stage: "ordering-list" })?;
    let roles = messages.iter().map(|message| message.role).collect::<Vec<_>>();
    report.check("roles_in_order", roles == [MessageRole::User, MessageRole::Assistant]);
    report.check(
        "seq_increasing",
        messages.windows(2).all(|pair| pair[0].seq < pair[1].seq),
    );
    report.check("thought_kept", answer.thought == "reasoning");

    let touched = storage
        .get_thread(thread.id)
        .await
        .context(StoreSnafu { stage: "ordering-get-thread" })?
        .is_some_and(|record| record.updated_at_unix_millis >= answer.created_at_unix_millis);
    report.check("thread_touched", touched);
    Ok(report)
}

async fn change_feed(storage: &SqliteStorage) -> RunnerResult<Report> {
    let mut report = Report::new("change_feed");
    let before = storage.change_feed().current();
    let thread = storage
        .insert_thread(NewThread::new("feed"))
        .await
        .context(StoreSnafu { stage: "feed-insert" })?;
    let after_thread = storage.change_feed().current();
    storage
        .append_message(thread.id, NewMessage::user("ping"))
        .await
        .context(StoreSnafu { stage: "feed-append" })?;
    let after_message = storage.change_feed().current();
    let _ = storage.delete_thread(ThreadId::new_v7()).await;
    let after_failed = storage.change_feed().current();

    report.check(
        "thread_write_published",
        after_thread.get(Table::Threads) > before.get(Table::Threads)
            && after_thread.get(Table::Messages) == before.get(Table::Messages),
    );
    report.check(
        "message_write_published",
        after_message.get(Table::Messages) > after_thread.get(Table::Messages),
    );
    report.check("failed_write_silent", after_failed == after_message);
    Ok(report)
}

async fn reopen(db_path: &str) -> RunnerResult<Report> {
    let mut report = Report::new("reopen");
    let first = SqliteStorage::open(db_path)
        .await
        .context(StoreSnafu { stage: "reopen-open-first" })?;
    let thread = first
        .insert_thread(NewThread::new("durable"))
        .await
        .context(StoreSnafu { stage: "reopen-insert" })?;
    first
        .append_message(thread.id, NewMessage::user("still here"))
        .await
        .context(StoreSnafu { stage: "reopen-append" })?;
    first.close().await;

    let second = SqliteStorage::open(db_path)
        .await
        .context(StoreSnafu { stage: "reopen-open-second" })?;
    let survived = second
        .get_thread(thread.id)
        .await
        .context(StoreSnafu { stage: "reopen-get" })?
        .is_some();
    let messages = second
        .list_messages(thread.id)
        .await
        .context(StoreSnafu { stage: "reopen-list" })?;
    second.close().await;

    report.check("thread_survived", survived);
    report.check("messages_survived", messages.len() == 1);
    Ok(report)
}
