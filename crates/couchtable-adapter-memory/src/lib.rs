use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use uuid::Uuid;

use couchtable_core::adapter::{Adapter, Connection};
use couchtable_core::collation::collate;
use couchtable_core::error::{Result, StoreError, TableError};
use couchtable_core::record::{
    DocResult, ID_FIELD, QueryOptions, QueryResponse, REV_FIELD, Record, Revision, Row,
};

/// A view map function: emits `(key, value)` pairs for a document.
pub type MapFn = Arc<dyn Fn(&Record) -> Vec<(Value, Value)> + Send + Sync>;

// ---------------------------------------------------------------------------
// Internal storage types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredDoc {
    rev: Revision,
    deleted: bool,
    /// Document body without `_id`/`_rev`.
    data: Record,
}

#[derive(Clone, Default)]
struct Database {
    docs: BTreeMap<String, StoredDoc>,
    update_seq: u64,
    views: HashMap<(String, String), MapFn>,
}

#[derive(Default)]
struct Inner {
    databases: BTreeMap<String, Database>,
}

/// In-memory stand-in for a CouchDB server. All data is held in RAM.
///
/// Revisions, conflicts on stale revisions, tombstones, `all_or_nothing`
/// bulk writes and keys-filtered scans behave like CouchDB's. Views are
/// Rust closures registered with [`MemoryConnection::register_view`].
#[derive(Clone, Default)]
pub struct MemoryConnection {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a map function as `_design/{design}/_view/{view}` on an
    /// existing database.
    pub async fn register_view<F>(&self, db: &str, design: &str, view: &str, map: F) -> Result<()>
    where
        F: Fn(&Record) -> Vec<(Value, Value)> + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().await;
        let database = database_mut(&mut inner, db)?;
        database
            .views
            .insert((design.to_string(), view.to_string()), Arc::new(map));
        Ok(())
    }

    /// Bound handle to one database, typed as the concrete adapter.
    pub fn database(&self, name: &str) -> MemoryAdapter {
        MemoryAdapter {
            inner: self.inner.clone(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner.databases.keys().cloned().collect())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        if !is_valid_db_name(name) {
            return Err(StoreError::Http {
                status: 400,
                body: format!("illegal_database_name: {name}"),
            }
            .into());
        }
        let mut inner = self.inner.write().await;
        if inner.databases.contains_key(name) {
            return Err(StoreError::DatabaseExists(name.to_string()).into());
        }
        inner.databases.insert(name.to_string(), Database::default());
        tracing::debug!(database = name, "created in-memory database");
        Ok(())
    }

    async fn delete_database(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .databases
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TableError::NotFound(format!("{name} (Database does not exist.)")))
    }

    async fn database_info(&self, name: &str) -> Result<Value> {
        let inner = self.inner.read().await;
        let db = database(&inner, name)?;
        let doc_count = db.docs.values().filter(|d| !d.deleted).count();
        Ok(json!({
            "db_name": name,
            "doc_count": doc_count,
            "doc_del_count": db.docs.len() - doc_count,
            "update_seq": db.update_seq,
        }))
    }

    fn use_database(&self, name: &str) -> Arc<dyn Adapter> {
        Arc::new(self.database(name))
    }
}

// ---------------------------------------------------------------------------
// MemoryAdapter
// ---------------------------------------------------------------------------

/// Document calls against one in-memory database.
#[derive(Clone)]
pub struct MemoryAdapter {
    inner: Arc<RwLock<Inner>>,
    name: String,
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn database(&self) -> &str {
        &self.name
    }

    async fn get_doc(&self, id: &str) -> Result<Record> {
        let inner = self.inner.read().await;
        let db = database(&inner, &self.name)?;
        match db.docs.get(id) {
            Some(stored) if !stored.deleted => Ok(to_record(id, stored)),
            Some(_) => Err(TableError::NotFound(format!("{id} (deleted)"))),
            None => Err(TableError::NotFound(format!("{id} (missing)"))),
        }
    }

    async fn store_doc(&self, doc: Record) -> Result<DocResult> {
        let mut inner = self.inner.write().await;
        let db = database_mut(&mut inner, &self.name)?;
        let result = write_doc(db, doc, false);
        into_single_result(result)
    }

    async fn delete_doc(&self, doc: Record) -> Result<DocResult> {
        let mut inner = self.inner.write().await;
        let db = database_mut(&mut inner, &self.name)?;
        let result = write_doc(db, doc, true);
        into_single_result(result)
    }

    async fn store_docs(&self, docs: Vec<Record>, all_or_nothing: bool) -> Result<Vec<DocResult>> {
        let mut inner = self.inner.write().await;
        let db = database_mut(&mut inner, &self.name)?;
        bulk_write(db, docs, false, all_or_nothing)
    }

    async fn delete_docs(&self, docs: Vec<Record>, all_or_nothing: bool) -> Result<Vec<DocResult>> {
        let mut inner = self.inner.write().await;
        let db = database_mut(&mut inner, &self.name)?;
        bulk_write(db, docs, true, all_or_nothing)
    }

    async fn get_all_docs(&self, opts: QueryOptions) -> Result<QueryResponse> {
        let inner = self.inner.read().await;
        let db = database(&inner, &self.name)?;

        let rows: Vec<Row> = match &opts.keys {
            Some(keys) => keys.iter().map(|key| key_row(db, key, opts.include_docs)).collect(),
            None => db
                .docs
                .iter()
                .filter(|(_, stored)| !stored.deleted)
                .map(|(id, stored)| doc_row(id, stored, opts.include_docs))
                .collect(),
        };
        let total_rows = db.docs.values().filter(|d| !d.deleted).count() as u64;

        Ok(paginate(rows, total_rows, &opts))
    }

    async fn get_view(&self, design: &str, view: &str, opts: QueryOptions) -> Result<QueryResponse> {
        let inner = self.inner.read().await;
        let db = database(&inner, &self.name)?;
        let design = design.strip_prefix("_design/").unwrap_or(design);

        let map = db
            .views
            .get(&(design.to_string(), view.to_string()))
            .ok_or_else(|| TableError::NotFound(format!("_design/{design}/_view/{view} (missing_named_view)")))?;

        let mut rows = Vec::new();
        for (id, stored) in db.docs.iter().filter(|(_, d)| !d.deleted) {
            let record = to_record(id, stored);
            for (key, value) in map(&record) {
                rows.push(Row {
                    id: Some(id.clone()),
                    key,
                    value,
                    doc: opts.include_docs.then(|| Value::Object(record.clone())),
                    error: None,
                });
            }
        }
        // Stable sort keeps id order among equal keys.
        rows.sort_by(|a, b| collate(&a.key, &b.key));

        if let Some(keys) = &opts.keys {
            rows.retain(|row| keys.iter().any(|k| row.key.as_str() == Some(k.as_str())));
        }
        let total_rows = rows.len() as u64;

        Ok(paginate(rows, total_rows, &opts))
    }
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

fn database<'a>(inner: &'a Inner, name: &str) -> Result<&'a Database> {
    inner
        .databases
        .get(name)
        .ok_or_else(|| TableError::NotFound(format!("{name} (Database does not exist.)")))
}

fn database_mut<'a>(inner: &'a mut Inner, name: &str) -> Result<&'a mut Database> {
    inner
        .databases
        .get_mut(name)
        .ok_or_else(|| TableError::NotFound(format!("{name} (Database does not exist.)")))
}

/// CouchDB database naming rule: `^[a-z][a-z0-9_$()+/-]*$`.
fn is_valid_db_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some('a'..='z'))
        && chars.all(|c| {
            matches!(c, 'a'..='z' | '0'..='9' | '_' | '$' | '(' | ')' | '+' | '-' | '/')
        })
}

/// Generate a revision hash from the previous revision and the new content.
fn generate_rev_hash(data: &Record, deleted: bool, prev_rev: Option<&Revision>) -> String {
    let mut hasher = Md5::new();
    if let Some(prev) = prev_rev {
        hasher.update(prev.to_string().as_bytes());
    }
    hasher.update(if deleted { b"1" } else { b"0" });
    let serialized = serde_json::to_string(data).unwrap_or_default();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn to_record(id: &str, stored: &StoredDoc) -> Record {
    let mut out = Record::new();
    out.insert(ID_FIELD.into(), Value::String(id.to_string()));
    out.insert(REV_FIELD.into(), Value::String(stored.rev.to_string()));
    for (k, v) in &stored.data {
        out.insert(k.clone(), v.clone());
    }
    out
}

fn doc_row(id: &str, stored: &StoredDoc, include_docs: bool) -> Row {
    let mut value = json!({ "rev": stored.rev.to_string() });
    if stored.deleted {
        value["deleted"] = Value::Bool(true);
    }
    Row {
        id: Some(id.to_string()),
        key: Value::String(id.to_string()),
        value,
        doc: (include_docs && !stored.deleted).then(|| Value::Object(to_record(id, stored))),
        error: None,
    }
}

fn key_row(db: &Database, key: &str, include_docs: bool) -> Row {
    match db.docs.get(key) {
        Some(stored) => doc_row(key, stored, include_docs),
        None => Row {
            id: None,
            key: Value::String(key.to_string()),
            value: Value::Null,
            doc: None,
            error: Some("not_found".into()),
        },
    }
}

fn paginate(rows: Vec<Row>, total_rows: u64, opts: &QueryOptions) -> QueryResponse {
    let rows: Vec<Row> = rows
        .into_iter()
        .skip(opts.skip as usize)
        .take(opts.limit.map_or(usize::MAX, |l| l as usize))
        .collect();
    QueryResponse {
        total_rows: Some(total_rows),
        offset: Some(opts.skip),
        rows,
    }
}

fn into_single_result(result: DocResult) -> Result<DocResult> {
    if result.is_ok() {
        Ok(result)
    } else {
        Err(result.to_error())
    }
}

fn bulk_write(
    db: &mut Database,
    docs: Vec<Record>,
    deleting: bool,
    all_or_nothing: bool,
) -> Result<Vec<DocResult>> {
    if !all_or_nothing {
        return Ok(docs.into_iter().map(|d| write_doc(db, d, deleting)).collect());
    }

    // Apply to a scratch copy; only publish it if every document succeeded.
    let mut scratch = db.clone();
    let results: Vec<DocResult> = docs
        .into_iter()
        .map(|d| write_doc(&mut scratch, d, deleting))
        .collect();
    if let Some(failed) = results.iter().find(|r| !r.is_ok()) {
        return Err(StoreError::Rejected(format!(
            "{}: {}",
            failed.id,
            failed.reason.as_deref().unwrap_or("rejected")
        ))
        .into());
    }
    *db = scratch;
    Ok(results)
}

/// Apply one write with CouchDB's revision rules and return its result.
fn write_doc(db: &mut Database, mut doc: Record, deleting: bool) -> DocResult {
    let id = match doc.remove(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => id,
        Some(_) => return DocResult::failed("", "bad_request", "Document id must be a non-empty string."),
        None if deleting => return DocResult::failed("", "bad_request", "Document id is required."),
        None => Uuid::new_v4().simple().to_string(),
    };
    if id.starts_with('_') && !id.starts_with("_design/") {
        return DocResult::failed(id, "bad_request", "Only reserved document ids may start with underscore.");
    }

    let given_rev = match doc.remove(REV_FIELD) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => match s.parse::<Revision>() {
            Ok(rev) => Some(rev),
            Err(_) => return DocResult::failed(id, "bad_request", "Invalid rev format"),
        },
        Some(_) => return DocResult::failed(id, "bad_request", "Invalid rev format"),
    };
    let deleted = deleting || doc.remove("_deleted").and_then(|v| v.as_bool()).unwrap_or(false);

    let prev = db.docs.get(&id);
    match (prev, &given_rev) {
        (Some(stored), Some(rev)) if stored.rev != *rev => {
            return DocResult::failed(id, "conflict", "Document update conflict.");
        }
        (Some(stored), None) if !stored.deleted => {
            return DocResult::failed(id, "conflict", "Document update conflict.");
        }
        (Some(stored), _) if stored.deleted && deleted => {
            return DocResult::failed(id, "not_found", "deleted");
        }
        (None, Some(_)) => return DocResult::failed(id, "conflict", "Document update conflict."),
        (None, None) if deleted => return DocResult::failed(id, "not_found", "missing"),
        _ => {}
    }

    let prev_rev = prev.map(|s| s.rev.clone());
    let data = if deleted { Record::new() } else { doc };
    let hash = generate_rev_hash(&data, deleted, prev_rev.as_ref());
    let rev = Revision::new(prev_rev.as_ref().map_or(1, |r| r.pos + 1), hash);

    db.update_seq += 1;
    db.docs.insert(
        id.clone(),
        StoredDoc {
            rev: rev.clone(),
            deleted,
            data,
        },
    );
    DocResult::ok(id, rev.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
