//! Per-record change notifications.
//!
//! [`ChangeWatcher::watch`] opens the bucket's change stream for one record
//! key and drives it from a background task, decoding each revision and
//! handing it to a callback. An optional column filter suppresses revisions
//! that leave the named columns untouched.

use common::{Storage, Watcher};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::serde::decode_record;
use crate::storage::RecordStore;

/// Opens record watches for one model.
#[derive(Clone)]
pub struct ChangeWatcher {
    store: RecordStore,
}

impl ChangeWatcher {
    pub(crate) fn new(store: RecordStore) -> Self {
        Self { store }
    }

    /// Watches the record with the given id.
    ///
    /// Without `columns`, `callback` receives every revision, starting with
    /// the record's current value if it exists. With `columns`, the current
    /// value only sets the baseline, and `callback` fires for revisions where
    /// at least one named column differs from the last value it was given.
    /// A column-filtered watch therefore never fires for the value present
    /// when it opens; read it with [`RecordStore::find`] if it is needed.
    ///
    /// Deletions and undecodable revisions are skipped. The stream is opened
    /// before this returns, so every later write is observed.
    #[tracing::instrument(level = "debug", skip(self, columns, callback))]
    pub async fn watch<F>(
        &self,
        id: u64,
        columns: Option<Vec<String>>,
        callback: F,
    ) -> Result<WatchHandle>
    where
        F: FnMut(Record) + Send + 'static,
    {
        let key = self.store.router().record_key(id);
        let watcher = self.store.storage()?.watch(&key).await?;

        let stop_tok = CancellationToken::new();
        let task = WatchTask {
            key,
            watcher,
            filter: ColumnFilter::new(columns),
            callback,
            stop_tok: stop_tok.clone(),
        };
        let task_jh = tokio::spawn(task.run());
        Ok(WatchHandle {
            task_jh: Some(task_jh),
            stop_tok,
        })
    }
}

/// Handle to a running watch.
///
/// Dropping the handle cancels the watch without waiting for it.
#[derive(Debug)]
pub struct WatchHandle {
    task_jh: Option<JoinHandle<()>>,
    stop_tok: CancellationToken,
}

impl WatchHandle {
    /// Cancels the watch and waits for its task to exit.
    ///
    /// A callback already running completes first; none starts after this
    /// returns.
    pub async fn stop(mut self) -> Result<()> {
        self.stop_tok.cancel();
        match self.task_jh.take() {
            Some(task_jh) => task_jh
                .await
                .map_err(|err| Error::Internal(format!("watch task failed: {}", err))),
            None => Ok(()),
        }
    }

    /// Returns true once the watch task has exited, either because it was
    /// stopped or because the stream ended.
    pub fn is_finished(&self) -> bool {
        self.task_jh
            .as_ref()
            .is_none_or(|task_jh| task_jh.is_finished())
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop_tok.cancel();
    }
}

struct WatchTask<F> {
    key: String,
    watcher: Box<dyn Watcher + Send>,
    filter: ColumnFilter,
    callback: F,
    stop_tok: CancellationToken,
}

impl<F> WatchTask<F>
where
    F: FnMut(Record) + Send + 'static,
{
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop_tok.cancelled() => break,
                next = self.watcher.next() => next,
            };
            match next {
                Ok(Some(watched)) => {
                    let entry = watched.entry;
                    if entry.is_tombstone() {
                        tracing::debug!(key = %self.key, op = %entry.operation, "skipping tombstone");
                        continue;
                    }
                    let record = match decode_record(&self.key, &entry.value) {
                        Ok(record) => record,
                        Err(err) => {
                            tracing::warn!(key = %self.key, error = %err, "skipping undecodable revision");
                            continue;
                        }
                    };
                    if self.filter.should_deliver(&record, watched.initial) {
                        (self.callback)(record);
                    }
                }
                Ok(None) => {
                    tracing::debug!(key = %self.key, "watch stream closed");
                    break;
                }
                Err(err) => {
                    tracing::warn!(key = %self.key, error = %err, "watch stream failed");
                    break;
                }
            }
        }
    }
}

/// Decides which revisions reach the callback.
#[derive(Debug, Default)]
struct ColumnFilter {
    columns: Option<Vec<String>>,
    last_delivered: Option<Record>,
}

impl ColumnFilter {
    fn new(columns: Option<Vec<String>>) -> Self {
        Self {
            columns,
            last_delivered: None,
        }
    }

    fn should_deliver(&mut self, record: &Record, initial: bool) -> bool {
        let Some(columns) = &self.columns else {
            return true;
        };
        if initial {
            self.last_delivered = Some(record.clone());
            return false;
        }
        let changed = columns.iter().any(|column| {
            self.last_delivered.as_ref().and_then(|last| last.get(column)) != record.get(column)
        });
        if changed {
            self.last_delivered = Some(record.clone());
        }
        changed
    }
}
