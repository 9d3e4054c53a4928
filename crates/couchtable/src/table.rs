use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use couchtable_core::adapter::Adapter;
use couchtable_core::error::{Result, TableError};
use couchtable_core::operation::TableOperation;
use couchtable_core::options::{Fields, TableOptions};
use couchtable_core::record::{
    DocResult, ID_FIELD, ItemResult, QueryOptions, REV_FIELD, Record, Row, clean_record,
    merge_into, parse_record, record_id, strip_identifiers,
};

use crate::transaction::{Revert, Transaction, pre_image};

/// Result of a table operation: one entry per record, plus the total row
/// count when a list reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableResponse {
    #[serde(rename = "resource")]
    pub records: Vec<ItemResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl TableResponse {
    fn from_records(records: Vec<Record>) -> Self {
        Self {
            records: records.into_iter().map(ItemResult::Ok).collect(),
            count: None,
        }
    }

    fn from_items(records: Vec<ItemResult>) -> Self {
        Self {
            records,
            count: None,
        }
    }

    /// Successful records, skipping per-item error markers.
    pub fn ok_records(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter_map(ItemResult::record)
    }

    pub fn first(&self) -> Option<&Record> {
        self.records.first().and_then(ItemResult::record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Execution flags shared by every record of one request.
#[derive(Debug, Clone, Copy)]
struct Mode {
    single: bool,
    continue_on_error: bool,
    rollback: bool,
}

impl Mode {
    fn new(opts: &TableOptions, items: usize) -> Self {
        Self {
            single: items == 1,
            // A rollback request stops at the first failure.
            continue_on_error: opts.continue_on_error && !opts.rollback,
            rollback: opts.rollback,
        }
    }

    /// Whether records run one by one instead of being staged.
    fn inline(&self) -> bool {
        self.single || self.continue_on_error || self.rollback
    }
}

/// One record's worth of inline work.
enum Inline {
    Create(Record),
    Replace(Record),
    Merge(String, Record),
    Delete(String),
    Get(String),
}

impl Inline {
    fn id(&self) -> Option<&str> {
        match self {
            Inline::Create(r) | Inline::Replace(r) => record_id(r),
            Inline::Merge(id, _) | Inline::Delete(id) | Inline::Get(id) => Some(id),
        }
    }
}

/// A CouchDB database exposed as a table.
///
/// The handle is bound to one database for the duration of a request. Each
/// [`Table::execute`] call is one request: its batch state lives on the
/// stack of that call and is never shared.
pub struct Table {
    adapter: Arc<dyn Adapter>,
    max_records: Option<u64>,
}

impl Table {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapter,
            max_records: None,
        }
    }

    /// Cap every list `limit` at `max_records`.
    pub fn with_max_records(mut self, max_records: Option<u64>) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn name(&self) -> &str {
        self.adapter.database()
    }

    /// Run one table operation.
    ///
    /// The request is validated before any store call, so a rejected
    /// request leaves the store untouched.
    #[tracing::instrument(
        name = "table.execute",
        skip_all,
        fields(table = %self.name(), operation = operation.name())
    )]
    pub async fn execute(&self, operation: TableOperation, opts: &TableOptions) -> Result<TableResponse> {
        operation.validate(opts)?;

        match operation {
            TableOperation::List { .. } => self.list(opts).await,
            TableOperation::GetByIds { ids } => self.get_by_ids(ids, opts).await,
            TableOperation::GetByFilter { .. }
            | TableOperation::ReplaceByFilter { .. }
            | TableOperation::MergeByFilter { .. } => Err(TableError::filters_unsupported()),
            TableOperation::Create { records } => self.create(records, opts).await,
            TableOperation::Replace { records } => {
                let mode = Mode::new(opts, records.len());
                let items = parse_all(records, mode, parse_identified)?;
                self.replace(items, mode, opts).await
            }
            TableOperation::ReplaceByIds { ids, record } => {
                let body = parse_patch(parse_record(record)?)?;
                let mode = Mode::new(opts, ids.len());
                let items = ids
                    .into_iter()
                    .map(|id| {
                        let mut record = body.clone();
                        record.insert(ID_FIELD.into(), Value::String(id));
                        Ok(record)
                    })
                    .collect();
                self.replace(items, mode, opts).await
            }
            TableOperation::Merge { records } => {
                let mode = Mode::new(opts, records.len());
                let items = parse_all(records, mode, |value| {
                    let record = parse_identified(value)?;
                    let id = record_id(&record).unwrap_or_default().to_string();
                    Ok((id, parse_patch(record)?))
                })?;
                self.merge(items, mode, opts).await
            }
            TableOperation::MergeByIds { ids, patch } => {
                let patch = parse_patch(parse_record(patch)?)?;
                let mode = Mode::new(opts, ids.len());
                let items = ids.into_iter().map(|id| Ok((id, patch.clone()))).collect();
                self.merge(items, mode, opts).await
            }
            TableOperation::DeleteByIds { ids } => self.delete(ids, opts).await,
            TableOperation::DeleteByFilter { .. } => match &opts.ids {
                Some(ids) => self.delete(ids.clone(), opts).await,
                None => self.truncate(opts).await,
            },
        }
    }

    // -----------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------

    async fn list(&self, opts: &TableOptions) -> Result<TableResponse> {
        let include_docs = opts.include_docs || opts.fields.requires_more();
        let limit = match (opts.limit, self.max_records) {
            (Some(limit), Some(max)) => Some(limit.min(max)),
            (limit, max) => limit.or(max),
        };
        let query = QueryOptions {
            include_docs,
            skip: opts.offset.unwrap_or(0),
            limit,
            ..Default::default()
        };

        let response = match &opts.view {
            Some(view) => self.adapter.get_view(&view.design, &view.view, query).await?,
            None => self.adapter.get_all_docs(query).await?,
        };

        let report_count = opts.include_count || response.offset.unwrap_or(0) != 0;
        let count = report_count.then(|| response.total_rows.unwrap_or(0));
        let records = response
            .rows
            .into_iter()
            .filter(|row| row.error.is_none())
            .map(|row| clean_record(&row.into_record(include_docs), &opts.fields))
            .collect();

        Ok(TableResponse {
            count,
            ..TableResponse::from_records(records)
        })
    }

    async fn get_by_ids(&self, ids: Vec<String>, opts: &TableOptions) -> Result<TableResponse> {
        // Reads have nothing to roll back.
        let mode = Mode {
            single: ids.len() == 1,
            continue_on_error: opts.continue_on_error,
            rollback: false,
        };
        if mode.single || mode.continue_on_error {
            let items = ids.into_iter().map(|id| Ok(Inline::Get(id))).collect();
            return self.run_inline(items, mode, Revert::Restore, opts).await;
        }

        let mut tx = Transaction::new(Revert::Restore);
        ids.into_iter().for_each(|id| tx.stage_id(id));
        let (_, ids) = tx.take_staged();

        let rows = self
            .fetch_current(&ids, opts.fields.requires_more(), &opts.fields, "retrieve")
            .await?;
        let records = rows
            .into_iter()
            .map(|row| clean_record(&row.into_record(true), &opts.fields))
            .collect();
        Ok(TableResponse::from_records(records))
    }

    async fn create(&self, records: Vec<Value>, opts: &TableOptions) -> Result<TableResponse> {
        let mode = Mode::new(opts, records.len());
        let items = parse_all(records, mode, parse_record)?;

        if mode.single || mode.continue_on_error {
            let items = items.into_iter().map(|r| r.map(Inline::Create)).collect();
            return self.run_inline(items, mode, Revert::Delete, opts).await;
        }

        let mut tx = Transaction::new(Revert::Delete);
        for record in items.into_iter().flatten() {
            tx.stage_record(record);
        }
        let (records, _) = tx.take_staged();
        tracing::debug!(records = records.len(), all_or_nothing = mode.rollback, "committing staged creates");

        // With rollback the store is asked to accept all or none; a store
        // that still reports partial success gets the stored records removed.
        let results = self.adapter.store_docs(records.clone(), mode.rollback).await?;
        if mode.rollback
            && let Some(failed) = results.iter().find(|r| !r.is_ok())
        {
            let error = failed.to_error();
            for stored in results.iter().filter(|r| r.is_ok()) {
                tx.add_to_rollback(stored.to_record());
            }
            return Err(tx.abort(self.adapter.as_ref(), error).await);
        }

        self.bulk_outcome(records, results, opts, "create")
    }

    async fn replace(&self, items: Vec<Result<Record>>, mode: Mode, opts: &TableOptions) -> Result<TableResponse> {
        if mode.inline() {
            let items = items.into_iter().map(|r| r.map(Inline::Replace)).collect();
            return self.run_inline(items, mode, Revert::Restore, opts).await;
        }

        // A later record for the same id replaces the earlier one.
        let keyed = items
            .into_iter()
            .flatten()
            .map(|record| (record_id(&record).unwrap_or_default().to_string(), record))
            .collect();
        let (unique, order) = fold_by_id(keyed, |record, next| *record = next);
        let outcome = self.replace_staged(unique, opts).await;
        expand(outcome, &order)
    }

    async fn replace_staged(&self, items: Vec<(String, Record)>, opts: &TableOptions) -> Result<TableResponse> {
        let mut tx = Transaction::new(Revert::Restore);
        for (_, record) in items {
            tx.stage_record(record);
        }
        let (mut records, _) = tx.take_staged();

        // One scan resolves every revision the caller left out.
        let unresolved: Vec<String> = records
            .iter()
            .filter(|r| !r.contains_key(REV_FIELD))
            .filter_map(|r| record_id(r).map(String::from))
            .collect();
        if !unresolved.is_empty() {
            let rows = self
                .fetch_current(&unresolved, false, &Fields::Default, "update")
                .await?;
            let revs: HashMap<String, String> = rows
                .iter()
                .filter_map(|row| Some((row.id.clone()?, row.rev()?.to_string())))
                .collect();
            for record in records.iter_mut().filter(|r| !r.contains_key(REV_FIELD)) {
                if let Some(rev) = record_id(record).and_then(|id| revs.get(id)).cloned() {
                    record.insert(REV_FIELD.into(), Value::String(rev));
                }
            }
        }

        tracing::debug!(records = records.len(), "committing staged replaces");
        let results = self.adapter.store_docs(records.clone(), false).await?;
        self.bulk_outcome(records, results, opts, "update")
    }

    async fn merge(
        &self,
        items: Vec<Result<(String, Record)>>,
        mode: Mode,
        opts: &TableOptions,
    ) -> Result<TableResponse> {
        if mode.inline() {
            let items = items
                .into_iter()
                .map(|r| r.map(|(id, patch)| Inline::Merge(id, patch)))
                .collect();
            return self.run_inline(items, mode, Revert::Restore, opts).await;
        }

        // Patches for the same id are applied in order to one fetched document.
        let items = items.into_iter().flatten().collect();
        let (unique, order) = fold_by_id(items, |patch: &mut Record, next| patch.extend(next));
        let outcome = self.merge_staged(unique, opts).await;
        expand(outcome, &order)
    }

    async fn merge_staged(&self, items: Vec<(String, Record)>, opts: &TableOptions) -> Result<TableResponse> {
        let ids: Vec<String> = items.iter().map(|(id, _)| id.clone()).collect();
        let rows = self
            .fetch_current(&ids, true, &Fields::Default, "merge")
            .await?;

        let mut tx = Transaction::new(Revert::Restore);
        for (row, (_, patch)) in rows.into_iter().zip(&items) {
            tx.stage_record(merge_into(row.into_record(true), patch));
        }
        let (merged, _) = tx.take_staged();

        tracing::debug!(records = merged.len(), "committing staged merges");
        let results = self.adapter.store_docs(merged.clone(), false).await?;
        self.bulk_outcome(merged, results, opts, "merge")
    }

    async fn delete(&self, ids: Vec<String>, opts: &TableOptions) -> Result<TableResponse> {
        let mode = Mode::new(opts, ids.len());
        if mode.inline() {
            let items = ids.into_iter().map(|id| Ok(Inline::Delete(id))).collect();
            return self.run_inline(items, mode, Revert::Restore, opts).await;
        }

        let keyed = ids.into_iter().map(|id| (id, ())).collect();
        let (unique, order) = fold_by_id(keyed, |_, _| {});
        let outcome = self.delete_staged(unique.into_iter().map(|(id, _)| id), opts).await;
        expand(outcome, &order)
    }

    async fn delete_staged(&self, ids: impl Iterator<Item = String>, opts: &TableOptions) -> Result<TableResponse> {
        let mut tx = Transaction::new(Revert::Restore);
        ids.for_each(|id| tx.stage_id(id));
        let (_, ids) = tx.take_staged();

        let require_more = opts.fields.requires_more();
        let rows = self
            .fetch_current(&ids, require_more, &Fields::Default, "delete")
            .await?;
        let tombstones: Vec<Record> = rows.iter().map(|row| id_and_rev(row)).collect();
        let before: Vec<Record> = if require_more {
            rows.into_iter().map(|row| row.into_record(true)).collect()
        } else {
            tombstones.clone()
        };

        tracing::debug!(records = tombstones.len(), "committing staged deletes");
        let results = self.adapter.delete_docs(tombstones, false).await?;
        self.bulk_outcome(before, results, opts, "delete")
    }

    /// Delete every document except design documents in one call.
    async fn truncate(&self, opts: &TableOptions) -> Result<TableResponse> {
        let response = self.adapter.get_all_docs(QueryOptions::default()).await?;
        let docs: Vec<Record> = response
            .rows
            .iter()
            .filter(|row| !row.is_missing())
            .filter(|row| !row.id.as_deref().unwrap_or_default().starts_with("_design/"))
            .map(id_and_rev)
            .collect();
        if docs.is_empty() {
            return Ok(TableResponse::default());
        }

        tracing::info!(table = %self.name(), records = docs.len(), "truncating table");
        let results = self.adapter.delete_docs(docs.clone(), true).await?;
        self.bulk_outcome(docs, results, opts, "delete")
    }

    // -----------------------------------------------------------------
    // Inline execution
    // -----------------------------------------------------------------

    async fn run_inline(
        &self,
        items: Vec<Result<Inline>>,
        mode: Mode,
        revert: Revert,
        opts: &TableOptions,
    ) -> Result<TableResponse> {
        let mut tx = Transaction::new(revert);
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            let id = item.as_ref().ok().and_then(Inline::id).map(String::from);
            let outcome = match item {
                Ok(action) => self.apply(action, opts, mode.rollback, &mut tx).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(record) => results.push(ItemResult::Ok(record)),
                Err(err) => {
                    if let Some(end) = self
                        .item_failed(&mut tx, mode, &mut results, id.as_deref(), err)
                        .await
                    {
                        return Err(end);
                    }
                }
            }
        }

        Ok(TableResponse::from_items(results))
    }

    /// Handle one failed inline record. Returns the error that ends the
    /// request, or `None` to carry on with the next record.
    async fn item_failed(
        &self,
        tx: &mut Transaction,
        mode: Mode,
        results: &mut Vec<ItemResult>,
        id: Option<&str>,
        err: TableError,
    ) -> Option<TableError> {
        if mode.rollback {
            tracing::warn!(table = %self.name(), id, %err, "record failed, rolling back");
            return Some(tx.abort(self.adapter.as_ref(), err).await);
        }
        if mode.continue_on_error {
            tracing::debug!(table = %self.name(), id, %err, "record failed, continuing");
            results.push(ItemResult::failed(&err, id));
            return None;
        }
        if mode.single {
            return Some(err);
        }
        results.push(ItemResult::failed(&err, id));
        Some(TableError::BatchPartialFailure {
            message: err.to_string(),
            results: std::mem::take(results),
        })
    }

    async fn apply(
        &self,
        action: Inline,
        opts: &TableOptions,
        rollback: bool,
        tx: &mut Transaction,
    ) -> Result<Record> {
        let fields = &opts.fields;
        match action {
            Inline::Get(id) => {
                let doc = self.adapter.get_doc(&id).await?;
                Ok(clean_record(&doc, fields))
            }
            Inline::Create(record) => {
                let result = self.adapter.store_doc(record.clone()).await?;
                Ok(output(record, &result, fields))
            }
            Inline::Replace(mut record) => {
                let id = record_id(&record).unwrap_or_default().to_string();
                let needs_rev = !record.contains_key(REV_FIELD);
                // The store has no undo, so rollback needs the pre-image.
                let old = if needs_rev || rollback {
                    Some(self.adapter.get_doc(&id).await?)
                } else {
                    None
                };
                if needs_rev
                    && let Some(rev) = old.as_ref().and_then(|o| o.get(REV_FIELD))
                {
                    record.insert(REV_FIELD.into(), rev.clone());
                }

                let result = self.adapter.store_doc(record.clone()).await?;
                if rollback && let Some(old) = old {
                    tx.add_to_rollback(pre_image(old, &result));
                }
                Ok(output(record, &result, fields))
            }
            Inline::Merge(id, patch) => {
                let old = self.adapter.get_doc(&id).await?;
                let merged = merge_into(old.clone(), &patch);
                let result = self.adapter.store_doc(merged.clone()).await?;
                if rollback {
                    tx.add_to_rollback(pre_image(old, &result));
                }
                Ok(output(merged, &result, fields))
            }
            Inline::Delete(id) => {
                let old = self.adapter.get_doc(&id).await?;
                let mut tombstone = Record::new();
                tombstone.insert(ID_FIELD.into(), Value::String(id));
                if let Some(rev) = old.get(REV_FIELD) {
                    tombstone.insert(REV_FIELD.into(), rev.clone());
                }
                let result = self.adapter.delete_doc(tombstone).await?;
                if rollback {
                    tx.add_to_rollback(pre_image(old.clone(), &result));
                }
                Ok(output(old, &result, fields))
            }
        }
    }

    // -----------------------------------------------------------------
    // Staged helpers
    // -----------------------------------------------------------------

    /// Fetch the current rows of `ids` with one keys-filtered scan. A miss
    /// fails the whole batch before anything is written.
    async fn fetch_current(
        &self,
        ids: &[String],
        include_docs: bool,
        fields: &Fields,
        action: &str,
    ) -> Result<Vec<Row>> {
        let response = self
            .adapter
            .get_all_docs(QueryOptions::keys(ids.to_vec(), include_docs))
            .await?;

        if !response.rows.iter().any(Row::is_missing) && response.rows.len() == ids.len() {
            return Ok(response.rows);
        }

        let results = response
            .rows
            .into_iter()
            .map(|row| {
                if row.is_missing() {
                    let id = row.key.as_str().unwrap_or_default();
                    ItemResult::failed(&TableError::NotFound(id.to_string()), Some(id))
                } else {
                    ItemResult::Ok(clean_record(&row.into_record(true), fields))
                }
            })
            .collect();
        Err(TableError::BatchPartialFailure {
            message: format!("Not all requested ids were found to {action}."),
            results,
        })
    }

    /// Pair each submitted record with its bulk result. Any per-document
    /// failure fails the batch with every outcome attached.
    fn bulk_outcome(
        &self,
        submitted: Vec<Record>,
        results: Vec<DocResult>,
        opts: &TableOptions,
        action: &str,
    ) -> Result<TableResponse> {
        let total = results.len();
        let mut failures = 0;
        let items: Vec<ItemResult> = submitted
            .into_iter()
            .zip(results)
            .map(|(record, result)| {
                if result.is_ok() {
                    ItemResult::Ok(output(record, &result, &opts.fields))
                } else {
                    failures += 1;
                    ItemResult::failed(&result.to_error(), Some(&result.id))
                }
            })
            .collect();

        if failures > 0 {
            tracing::warn!(table = %self.name(), action, failures, total, "batch partially failed");
            return Err(TableError::BatchPartialFailure {
                message: format!("{failures} of {total} records failed to {action}."),
                results: items,
            });
        }
        Ok(TableResponse::from_items(items))
    }
}

/// Collapse entries addressing the same id into one, in first-seen order.
/// Also returns, for every input entry, the index of its collapsed entry.
fn fold_by_id<T>(
    items: Vec<(String, T)>,
    mut fold: impl FnMut(&mut T, T),
) -> (Vec<(String, T)>, Vec<usize>) {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<(String, T)> = Vec::with_capacity(items.len());
    let mut order = Vec::with_capacity(items.len());
    for (id, item) in items {
        match index.get(&id) {
            Some(&i) => {
                fold(&mut unique[i].1, item);
                order.push(i);
            }
            None => {
                index.insert(id.clone(), unique.len());
                order.push(unique.len());
                unique.push((id, item));
            }
        }
    }
    (unique, order)
}

/// Map per-id outcomes back to one entry per submitted record.
fn expand(outcome: Result<TableResponse>, order: &[usize]) -> Result<TableResponse> {
    let pick = |items: Vec<ItemResult>| -> Vec<ItemResult> {
        order.iter().filter_map(|&i| items.get(i).cloned()).collect()
    };
    match outcome {
        Ok(response) => Ok(TableResponse {
            records: pick(response.records),
            ..response
        }),
        Err(TableError::BatchPartialFailure { message, results }) => {
            Err(TableError::BatchPartialFailure {
                message,
                results: pick(results),
            })
        }
        Err(err) => Err(err),
    }
}

/// The output record of a write: the submitted record overlaid with the
/// store's `_id`/`_rev` when extra fields were requested, else just those.
fn output(record: Record, result: &DocResult, fields: &Fields) -> Record {
    let written = if fields.requires_more() {
        merge_into(record, &result.to_record())
    } else {
        result.to_record()
    };
    clean_record(&written, fields)
}

fn id_and_rev(row: &Row) -> Record {
    let mut out = Record::new();
    let id = row.id.clone().or_else(|| row.key.as_str().map(String::from));
    out.insert(ID_FIELD.into(), id.map_or(Value::Null, Value::String));
    if let Some(rev) = row.rev() {
        out.insert(REV_FIELD.into(), Value::String(rev.to_string()));
    }
    out
}

/// Parse every submitted record before the first store call. Without
/// `continue` the first invalid record fails the request; with it, invalid
/// records are kept as per-item errors.
fn parse_all<T>(
    values: Vec<Value>,
    mode: Mode,
    parse: impl Fn(Value) -> Result<T>,
) -> Result<Vec<Result<T>>> {
    values
        .into_iter()
        .map(|value| match parse(value) {
            Ok(parsed) => Ok(Ok(parsed)),
            Err(err) if mode.continue_on_error => Ok(Err(err)),
            Err(err) => Err(err),
        })
        .collect()
}

/// A record addressed by its own identifier, normalized to carry `_id`.
fn parse_identified(value: Value) -> Result<Record> {
    let mut record = parse_record(value)?;
    let id = match record_id(&record) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => {
            return Err(TableError::Validation(
                "No identifier found in record.".into(),
            ));
        }
    };
    record.insert(ID_FIELD.into(), Value::String(id));
    Ok(record)
}

fn parse_patch(record: Record) -> Result<Record> {
    let patch = strip_identifiers(record);
    if patch.is_empty() {
        return Err(TableError::Validation(
            "No valid fields were found in record.".into(),
        ));
    }
    Ok(patch)
}
