#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use couchtable::{Adapter, Connection, MemoryAdapter, MemoryConnection, Record, StoreError, Table};
use couchtable_core::error::Result;
use couchtable_core::record::{DocResult, QueryOptions, QueryResponse};

pub fn rec(v: Value) -> Record {
    v.as_object().cloned().expect("object")
}

pub async fn memory_table(name: &str) -> (MemoryConnection, Table) {
    let conn = MemoryConnection::new();
    conn.create_database(name).await.unwrap();
    let table = Table::new(conn.use_database(name));
    (conn, table)
}

/// Wraps the memory store: counts calls and injects the failures a real
/// CouchDB can produce.
pub struct FlakyAdapter {
    inner: MemoryAdapter,
    calls: AtomicUsize,
    /// `store_docs` and `delete_docs` fail with a transport error.
    pub fail_bulk_writes: bool,
    /// Bulk writes ignore `all_or_nothing`, as CouchDB 2 and later do.
    pub ignore_all_or_nothing: bool,
}

impl FlakyAdapter {
    pub fn new(inner: MemoryAdapter) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            fail_bulk_writes: false,
            ignore_all_or_nothing: false,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn bulk(&self, all_or_nothing: bool) -> Result<bool> {
        if self.fail_bulk_writes {
            return Err(StoreError::Transport("injected bulk failure".into()).into());
        }
        Ok(all_or_nothing && !self.ignore_all_or_nothing)
    }
}

#[async_trait]
impl Adapter for FlakyAdapter {
    fn database(&self) -> &str {
        self.inner.database()
    }

    async fn get_doc(&self, id: &str) -> Result<Record> {
        self.hit();
        self.inner.get_doc(id).await
    }

    async fn store_doc(&self, doc: Record) -> Result<DocResult> {
        self.hit();
        self.inner.store_doc(doc).await
    }

    async fn delete_doc(&self, doc: Record) -> Result<DocResult> {
        self.hit();
        self.inner.delete_doc(doc).await
    }

    async fn store_docs(&self, docs: Vec<Record>, all_or_nothing: bool) -> Result<Vec<DocResult>> {
        self.hit();
        let all_or_nothing = self.bulk(all_or_nothing)?;
        self.inner.store_docs(docs, all_or_nothing).await
    }

    async fn delete_docs(&self, docs: Vec<Record>, all_or_nothing: bool) -> Result<Vec<DocResult>> {
        self.hit();
        let all_or_nothing = self.bulk(all_or_nothing)?;
        self.inner.delete_docs(docs, all_or_nothing).await
    }

    async fn get_all_docs(&self, opts: QueryOptions) -> Result<QueryResponse> {
        self.hit();
        self.inner.get_all_docs(opts).await
    }

    async fn get_view(&self, design: &str, view: &str, opts: QueryOptions) -> Result<QueryResponse> {
        self.hit();
        self.inner.get_view(design, view, opts).await
    }
}

/// A table over a [`FlakyAdapter`], returning the adapter for inspection.
pub async fn flaky_table(
    name: &str,
    configure: impl FnOnce(&mut FlakyAdapter),
) -> (MemoryConnection, Arc<FlakyAdapter>, Table) {
    let conn = MemoryConnection::new();
    conn.create_database(name).await.unwrap();
    let mut flaky = FlakyAdapter::new(conn.database(name));
    configure(&mut flaky);
    let flaky = Arc::new(flaky);
    let table = Table::new(flaky.clone());
    (conn, flaky, table)
}
