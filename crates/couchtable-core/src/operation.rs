use serde_json::Value;

use crate::error::{Result, TableError};
use crate::options::TableOptions;

/// A table request, one variant per REST verb and addressing mode.
///
/// Records are carried unparsed; each is validated individually when the
/// request runs so that `continue` can report bad records in place.
#[derive(Debug, Clone, PartialEq)]
pub enum TableOperation {
    /// List records, optionally through a named view.
    List { filter: Option<String> },
    GetByIds { ids: Vec<String> },
    GetByFilter { filter: String },
    Create { records: Vec<Value> },
    /// Replace whole records; each record carries its `_id`.
    Replace { records: Vec<Value> },
    /// Replace the records named by `ids` with the same body.
    ReplaceByIds { ids: Vec<String>, record: Value },
    ReplaceByFilter { filter: String, record: Value },
    /// Merge partial records; each record carries its `_id`.
    Merge { records: Vec<Value> },
    /// Merge the same patch into the records named by `ids`.
    MergeByIds { ids: Vec<String>, patch: Value },
    MergeByFilter { filter: String, patch: Value },
    DeleteByIds { ids: Vec<String> },
    /// Delete by filter. Without a filter this needs `ids` or `force`.
    DeleteByFilter { filter: Option<String> },
}

impl TableOperation {
    pub fn name(&self) -> &'static str {
        match self {
            TableOperation::List { .. } => "list",
            TableOperation::GetByIds { .. } => "get_by_ids",
            TableOperation::GetByFilter { .. } => "get_by_filter",
            TableOperation::Create { .. } => "create",
            TableOperation::Replace { .. } => "replace",
            TableOperation::ReplaceByIds { .. } => "replace_by_ids",
            TableOperation::ReplaceByFilter { .. } => "replace_by_filter",
            TableOperation::Merge { .. } => "merge",
            TableOperation::MergeByIds { .. } => "merge_by_ids",
            TableOperation::MergeByFilter { .. } => "merge_by_filter",
            TableOperation::DeleteByIds { .. } => "delete_by_ids",
            TableOperation::DeleteByFilter { .. } => "delete_by_filter",
        }
    }

    /// Reject requests that can never reach the store: relational filters,
    /// empty identifier lists, empty record lists, and unforced
    /// delete-all. Runs before any store call.
    pub fn validate(&self, opts: &TableOptions) -> Result<()> {
        opts.validate()?;

        match self {
            TableOperation::List { filter } => {
                if has_text(filter.as_deref()) || opts.has_filter() {
                    return Err(TableError::filters_unsupported());
                }
            }
            TableOperation::GetByFilter { .. }
            | TableOperation::ReplaceByFilter { .. }
            | TableOperation::MergeByFilter { .. } => {
                return Err(TableError::filters_unsupported());
            }
            TableOperation::GetByIds { ids } | TableOperation::DeleteByIds { ids } => {
                check_ids(ids)?;
            }
            TableOperation::ReplaceByIds { ids, .. } | TableOperation::MergeByIds { ids, .. } => {
                if opts.has_filter() {
                    return Err(TableError::filters_unsupported());
                }
                check_ids(ids)?;
            }
            TableOperation::Create { records } => check_records(records)?,
            TableOperation::Replace { records } | TableOperation::Merge { records } => {
                if opts.has_filter() {
                    return Err(TableError::filters_unsupported());
                }
                check_records(records)?;
            }
            TableOperation::DeleteByFilter { filter } => {
                if has_text(filter.as_deref()) || opts.has_filter() {
                    return Err(TableError::filters_unsupported());
                }
                match &opts.ids {
                    Some(ids) => check_ids(ids)?,
                    None if opts.force => {}
                    None => {
                        return Err(TableError::Validation(
                            "Deleting all records of a table requires the 'force' option.".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn has_text(s: Option<&str>) -> bool {
    s.is_some_and(|s| !s.trim().is_empty())
}

fn check_ids(ids: &[String]) -> Result<()> {
    if ids.is_empty() {
        return Err(TableError::Validation("No record ids were given.".into()));
    }
    if ids.iter().any(|id| id.trim().is_empty()) {
        return Err(TableError::Validation("Record ids can not be empty.".into()));
    }
    Ok(())
}

fn check_records(records: &[Value]) -> Result<()> {
    if records.is_empty() {
        return Err(TableError::Validation("No records detected in request.".into()));
    }
    Ok(())
}
