use couchtable_core::adapter::Adapter;
use couchtable_core::error::{Result, TableError};
use couchtable_core::record::{DocResult, REV_FIELD, Record, record_id};

/// How already-committed work is undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revert {
    /// Delete the documents that were created.
    Delete,
    /// Re-write captured pre-images.
    Restore,
}

/// Request-scoped batch: staged records and ids, plus the records needed to
/// revert committed work. Never shared between requests.
#[derive(Debug)]
pub struct Transaction {
    revert: Revert,
    records: Vec<Record>,
    ids: Vec<String>,
    rollback: Vec<Record>,
}

impl Transaction {
    pub fn new(revert: Revert) -> Self {
        Self {
            revert,
            records: Vec::new(),
            ids: Vec::new(),
            rollback: Vec::new(),
        }
    }

    pub fn stage_record(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn stage_id(&mut self, id: impl Into<String>) {
        self.ids.push(id.into());
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.ids.is_empty()
    }

    /// Hand the staged work to the commit and clear it.
    pub fn take_staged(&mut self) -> (Vec<Record>, Vec<String>) {
        (
            std::mem::take(&mut self.records),
            std::mem::take(&mut self.ids),
        )
    }

    /// Remember a committed record for [`Transaction::rollback`]. For
    /// [`Revert::Restore`] the record must carry the store's newest `_rev`.
    ///
    /// An id already recorded keeps its first body; only its `_rev` moves to
    /// the newer revision.
    pub fn add_to_rollback(&mut self, record: Record) {
        if let Some(id) = record_id(&record)
            && let Some(first) = self.rollback.iter_mut().find(|r| record_id(r) == Some(id))
        {
            if let Some(rev) = record.get(REV_FIELD) {
                first.insert(REV_FIELD.into(), rev.clone());
            }
            return;
        }
        self.rollback.push(record);
    }

    pub fn rollback_len(&self) -> usize {
        self.rollback.len()
    }

    /// Revert everything recorded so far in one multi-document call.
    pub async fn rollback(&mut self, adapter: &dyn Adapter) -> Result<()> {
        let records = std::mem::take(&mut self.rollback);
        if records.is_empty() {
            return Ok(());
        }
        tracing::info!(
            database = adapter.database(),
            records = records.len(),
            revert = ?self.revert,
            "rolling back committed records"
        );

        let results = match self.revert {
            Revert::Delete => adapter.delete_docs(records, true).await?,
            Revert::Restore => adapter.store_docs(records, true).await?,
        };
        match results.iter().find(|r| !r.is_ok()) {
            Some(failed) => Err(failed.to_error()),
            None => Ok(()),
        }
    }

    /// Roll back after `error` and return the error the caller should see:
    /// `error` itself, or [`TableError::RollbackFailed`] when the revert
    /// failed too.
    pub async fn abort(&mut self, adapter: &dyn Adapter, error: TableError) -> TableError {
        self.records.clear();
        self.ids.clear();
        match self.rollback(adapter).await {
            Ok(()) => error,
            Err(rollback) => {
                tracing::error!(%error, %rollback, "rollback failed");
                TableError::RollbackFailed {
                    error: Box::new(error),
                    rollback: Box::new(rollback),
                }
            }
        }
    }
}

/// Pre-image with the revision produced by the write that replaced it, so
/// restoring it is not a conflict.
pub fn pre_image(mut old: Record, result: &DocResult) -> Record {
    old.extend(result.to_record());
    old
}
