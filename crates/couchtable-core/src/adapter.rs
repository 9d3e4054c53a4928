use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::record::{DocResult, QueryOptions, QueryResponse, Record};

/// A connection to a document-store server hosting many databases.
///
/// Each database is exposed to callers as one table.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Names of every database on the server, system databases included.
    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn create_database(&self, name: &str) -> Result<()>;

    async fn delete_database(&self, name: &str) -> Result<()>;

    /// Database information as the store reports it (`db_name`,
    /// `doc_count`, `update_seq`, ...).
    async fn database_info(&self, name: &str) -> Result<Value>;

    /// Select a database for document calls.
    ///
    /// The handle is bound to `name` only; it does not check that the
    /// database exists, and callers should not keep it past one request.
    fn use_database(&self, name: &str) -> Arc<dyn Adapter>;
}

/// Document calls against one selected database.
///
/// Mirrors the small subset of the CouchDB document API the table adapter
/// needs. Every write returns the store-assigned revision.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// The database this handle is bound to.
    fn database(&self) -> &str;

    /// Fetch the current revision of a live document.
    async fn get_doc(&self, id: &str) -> Result<Record>;

    /// Create or update one document. Without `_id` the store assigns one;
    /// updating requires the current `_rev`.
    async fn store_doc(&self, doc: Record) -> Result<DocResult>;

    /// Delete one document; `doc` must carry `_id` and the current `_rev`.
    async fn delete_doc(&self, doc: Record) -> Result<DocResult>;

    /// Write many documents in one round trip.
    ///
    /// With `all_or_nothing`, the store either accepts every document or
    /// rejects the call as a whole; otherwise each document succeeds or
    /// fails on its own and failures come back as per-document results.
    async fn store_docs(&self, docs: Vec<Record>, all_or_nothing: bool) -> Result<Vec<DocResult>>;

    /// Delete many documents in one round trip; each needs `_id` and `_rev`.
    async fn delete_docs(&self, docs: Vec<Record>, all_or_nothing: bool) -> Result<Vec<DocResult>>;

    /// Scan the database in id order (`_all_docs`).
    async fn get_all_docs(&self, opts: QueryOptions) -> Result<QueryResponse>;

    /// Query a stored view of a design document.
    async fn get_view(&self, design: &str, view: &str, opts: QueryOptions) -> Result<QueryResponse>;
}
