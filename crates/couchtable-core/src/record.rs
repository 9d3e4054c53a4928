use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TableError};
use crate::options::Fields;

/// Identifier field of every CouchDB document.
pub const ID_FIELD: &str = "_id";
/// Revision field of every CouchDB document.
pub const REV_FIELD: &str = "_rev";

/// A table record: a JSON object carrying `_id` and, once stored, `_rev`.
pub type Record = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Revision
// ---------------------------------------------------------------------------

/// A CouchDB revision token: `{pos}-{hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub pos: u64,
    pub hash: String,
}

impl Revision {
    pub fn new(pos: u64, hash: String) -> Self {
        Self { pos, hash }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pos, self.hash)
    }
}

impl FromStr for Revision {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TableError::Validation(format!("Invalid rev format: {s}"));
        let (pos, hash) = s.split_once('-').ok_or_else(invalid)?;
        let pos: u64 = pos.parse().map_err(|_| invalid())?;
        if hash.is_empty() {
            return Err(invalid());
        }
        Ok(Revision::new(pos, hash.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Record helpers
// ---------------------------------------------------------------------------

/// Identifier of a record as CouchDB reports it: `_id`, falling back to `id`.
pub fn record_id(record: &Record) -> Option<&str> {
    record
        .get(ID_FIELD)
        .or_else(|| record.get("id"))
        .and_then(Value::as_str)
}

/// Revision of a record: `_rev`, then `rev` (bulk results), then
/// `value.rev` (`_all_docs` and view rows).
pub fn record_rev(record: &Record) -> Option<&str> {
    record
        .get(REV_FIELD)
        .or_else(|| record.get("rev"))
        .or_else(|| record.get("value").and_then(|v| v.get("rev")))
        .and_then(Value::as_str)
}

/// Accept a client-supplied record. It must be a JSON object with at least
/// one field.
pub fn parse_record(value: Value) -> Result<Record> {
    match value {
        Value::Object(map) if !map.is_empty() => Ok(map),
        Value::Object(_) => Err(TableError::Validation(
            "No valid fields were found in record.".into(),
        )),
        other => Err(TableError::Validation(format!(
            "Record must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

/// Drop `_id` and `_rev` from a merge patch. The store's current revision is
/// always the one written back.
pub fn strip_identifiers(mut record: Record) -> Record {
    record.remove(ID_FIELD);
    record.remove(REV_FIELD);
    record
}

/// Overlay `patch` onto `base`, key by key.
pub fn merge_into(mut base: Record, patch: &Record) -> Record {
    for (k, v) in patch {
        base.insert(k.clone(), v.clone());
    }
    base
}

/// Normalize a record for output according to the requested fields.
///
/// `Fields::All` returns the record as is; otherwise the output always has
/// `_id` and `_rev` first, followed by any requested fields (missing ones
/// are `null`).
pub fn clean_record(record: &Record, fields: &Fields) -> Record {
    let names = match fields {
        Fields::All => return record.clone(),
        Fields::Default => &[][..],
        Fields::Only(names) => names.as_slice(),
    };

    let mut out = Record::new();
    out.insert(
        ID_FIELD.into(),
        record_id(record).map_or(Value::Null, |s| Value::String(s.to_string())),
    );
    out.insert(
        REV_FIELD.into(),
        record_rev(record).map_or(Value::Null, |s| Value::String(s.to_string())),
    );
    for name in names {
        if name.eq_ignore_ascii_case(ID_FIELD) || name.eq_ignore_ascii_case(REV_FIELD) {
            continue;
        }
        out.insert(name.clone(), record.get(name).cloned().unwrap_or(Value::Null));
    }
    out
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Per-item outcomes
// ---------------------------------------------------------------------------

/// Error marker placed in a batch result list where a record failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ItemError {
    pub fn from_error(err: &TableError, id: Option<&str>) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            id: id.map(String::from),
        }
    }
}

/// One entry of a batch result: the cleaned record or an error marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ItemResult {
    Ok(Record),
    Err { error: ItemError },
}

impl ItemResult {
    pub fn failed(err: &TableError, id: Option<&str>) -> Self {
        ItemResult::Err {
            error: ItemError::from_error(err, id),
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            ItemResult::Ok(r) => Some(r),
            ItemResult::Err { .. } => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ItemResult::Ok(_))
    }
}

// ---------------------------------------------------------------------------
// Store call shapes
// ---------------------------------------------------------------------------

/// Per-document result of a single or multi-document write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocResult {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DocResult {
    pub fn ok(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev.into()),
            error: None,
            reason: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: &str, reason: &str) -> Self {
        Self {
            id: id.into(),
            rev: None,
            error: Some(error.into()),
            reason: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The result as an `_id`/`_rev` record.
    pub fn to_record(&self) -> Record {
        let mut out = Record::new();
        out.insert(ID_FIELD.into(), Value::String(self.id.clone()));
        if let Some(rev) = &self.rev {
            out.insert(REV_FIELD.into(), Value::String(rev.clone()));
        }
        out
    }

    /// Convert a failed result into the matching error.
    pub fn to_error(&self) -> TableError {
        let reason = self.reason.clone().unwrap_or_default();
        match self.error.as_deref() {
            Some("conflict") => crate::error::StoreError::Conflict(self.id.clone()).into(),
            Some("not_found") => TableError::NotFound(format!("{}: {reason}", self.id)),
            Some("forbidden") => crate::error::StoreError::Forbidden(reason).into(),
            Some(other) => crate::error::StoreError::Http {
                status: 0,
                body: format!("{other}: {reason}"),
            }
            .into(),
            None => TableError::Validation(format!("{} did not fail", self.id)),
        }
    }
}

/// Query parameters for `_all_docs` and view queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub include_docs: bool,
    pub skip: u64,
    pub limit: Option<u64>,
    /// Restrict the scan to these keys, in order.
    pub keys: Option<Vec<String>>,
}

impl QueryOptions {
    pub fn keys(keys: Vec<String>, include_docs: bool) -> Self {
        Self {
            include_docs,
            keys: Some(keys),
            ..Default::default()
        }
    }
}

/// A row of an `_all_docs` or view response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    /// Set for requested keys the store could not resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Row {
    pub fn rev(&self) -> Option<&str> {
        self.value.get("rev").and_then(Value::as_str)
    }

    /// Whether a keys-filtered row points at no live document.
    pub fn is_missing(&self) -> bool {
        self.error.is_some()
            || self.value.get("deleted").and_then(Value::as_bool) == Some(true)
    }

    /// The row as a record: the embedded document when present, else the
    /// row itself.
    pub fn into_record(self, use_doc: bool) -> Record {
        if use_doc {
            if let Some(Value::Object(doc)) = self.doc {
                return doc;
            }
        }
        match serde_json::to_value(&self) {
            Ok(Value::Object(map)) => map,
            _ => Record::new(),
        }
    }
}

/// Response of `_all_docs` and view queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    pub rows: Vec<Row>,
}
