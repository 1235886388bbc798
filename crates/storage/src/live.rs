//! Change feed and live queries over the store.
//!
//! Stores bump a per-table version after every committed write. A live query
//! remembers the versions it last evaluated against and re-runs whenever one of
//! its dependency tables moves. Versions travel over a `watch` channel, so
//! bursts of writes coalesce into one re-evaluation but the latest write is
//! never lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::BoxFuture;
use super::error::StorageResult;
use super::types::Table;

/// Monotonic write counters, one per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableVersions {
    pub threads: u64,
    pub messages: u64,
}

impl TableVersions {
    pub fn get(&self, table: Table) -> u64 {
        match table {
            Table::Threads => self.threads,
            Table::Messages => self.messages,
        }
    }

    fn bump(&mut self, table: Table) {
        match table {
            Table::Threads => self.threads = self.threads.wrapping_add(1),
            Table::Messages => self.messages = self.messages.wrapping_add(1),
        }
    }
}

/// Broadcasts committed writes to live queries.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    versions: Arc<watch::Sender<TableVersions>>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (versions, _) = watch::channel(TableVersions::default());
        Self {
            versions: Arc::new(versions),
        }
    }

    /// Must only be called once the write touching `tables` is durable.
    pub fn publish(&self, tables: &[Table]) {
        self.versions.send_modify(|versions| {
            for table in tables {
                versions.bump(*table);
            }
        });
        tracing::trace!(
            tables = ?tables.iter().map(Table::name).collect::<Vec<_>>(),
            "published store change"
        );
    }

    pub fn current(&self) -> TableVersions {
        *self.versions.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TableVersions> {
        self.versions.subscribe()
    }
}

/// Tables a live query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DependencySet {
    threads: bool,
    messages: bool,
}

impl DependencySet {
    pub fn on(table: Table) -> Self {
        Self::default().and(table)
    }

    pub fn all() -> Self {
        Table::ALL
            .into_iter()
            .fold(Self::default(), |set, table| set.and(table))
    }

    pub fn and(mut self, table: Table) -> Self {
        match table {
            Table::Threads => self.threads = true,
            Table::Messages => self.messages = true,
        }
        self
    }

    pub fn contains(&self, table: Table) -> bool {
        match table {
            Table::Threads => self.threads,
            Table::Messages => self.messages,
        }
    }

    /// True when any dependency table was written between the two snapshots.
    pub fn touched(&self, before: &TableVersions, after: &TableVersions) -> bool {
        Table::ALL
            .into_iter()
            .any(|table| self.contains(table) && before.get(table) != after.get(table))
    }
}

/// Handle to a running live query. Dropping it unsubscribes.
#[derive(Debug)]
pub struct LiveQuery {
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl LiveQuery {
    /// Stops future notifications. Calling it more than once is a no-op.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.cancel.cancel();
            tracing::trace!("live query unsubscribed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[derive(Debug, Clone)]
pub struct LiveQueryEngine {
    feed: ChangeFeed,
}

impl LiveQueryEngine {
    pub fn new(feed: ChangeFeed) -> Self {
        Self { feed }
    }

    /// Runs `query` now and again after every write to `dependencies`,
    /// handing each result to `on_change`.
    ///
    /// Must be called from within a tokio runtime. Query errors are delivered
    /// as `Err` values and do not end the subscription.
    pub fn subscribe<T, Q, C>(
        &self,
        dependencies: DependencySet,
        mut query: Q,
        mut on_change: C,
    ) -> LiveQuery
    where
        T: Send + 'static,
        Q: FnMut() -> BoxFuture<'static, StorageResult<T>> + Send + 'static,
        C: FnMut(StorageResult<T>) + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let mut versions = self.feed.subscribe();

        let task_active = active.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            // Snapshot before evaluating: a write racing the query marks the
            // channel as changed and forces one more evaluation.
            let mut seen = *versions.borrow_and_update();

            loop {
                let result = tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => return,
                    result = query() => result,
                };

                if !task_active.load(Ordering::Acquire) {
                    return;
                }
                on_change(result);

                loop {
                    tokio::select! {
                        biased;
                        _ = task_cancel.cancelled() => return,
                        changed = versions.changed() => {
                            if changed.is_err() {
                                // Store dropped; nothing can change any more.
                                return;
                            }
                        }
                    }

                    let latest = *versions.borrow_and_update();
                    let touched = dependencies.touched(&seen, &latest);
                    seen = latest;
                    if touched {
                        break;
                    }
                }
            }
        });

        LiveQuery { active, cancel }
    }
}
