//! HTTP store for couchtable.
//!
//! Talks to a CouchDB server over its REST API. `HttpConnection` covers the
//! server-level endpoints (`_all_dbs`, database create/delete/info) and hands
//! out `HttpAdapter` handles bound to one database for document calls.
mod auth;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use couchtable_core::adapter::{Adapter, Connection};
use couchtable_core::error::{Result, StoreError, TableError};
use couchtable_core::record::{
    DocResult, ID_FIELD, QueryOptions, QueryResponse, REV_FIELD, Record,
};

pub use auth::Credentials;

// ---------------------------------------------------------------------------
// CouchDB JSON shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CouchDbError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct CouchDbPutResponse {
    id: String,
    rev: String,
}

#[derive(Debug, Serialize)]
struct CouchDbBulkDocsRequest<'a> {
    docs: &'a [Record],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    all_or_nothing: bool,
}

#[derive(Debug, Serialize)]
struct CouchDbKeysRequest<'a> {
    keys: &'a [String],
}

// ---------------------------------------------------------------------------
// HttpConnection
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Shared {
    client: Client,
    server_url: String,
    credentials: Option<Credentials>,
}

impl Shared {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.server_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.credentials {
            Some(creds) => creds.apply(request),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Response> {
        let resp = request
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        check_error(resp, context).await
    }
}

/// Connection to a CouchDB server, e.g. `http://localhost:5984`.
#[derive(Debug, Clone)]
pub struct HttpConnection {
    shared: Arc<Shared>,
}

impl HttpConnection {
    /// Create a connection to a CouchDB server URL (without database path).
    pub fn new(server_url: &str) -> Self {
        Self::with_client(server_url, Client::new(), None)
    }

    /// Create a connection that sends `credentials` as basic auth.
    pub fn with_credentials(server_url: &str, credentials: Credentials) -> Self {
        Self::with_client(server_url, Client::new(), Some(credentials))
    }

    /// Create a connection with a custom reqwest client (timeouts, TLS).
    pub fn with_client(server_url: &str, client: Client, credentials: Option<Credentials>) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                server_url: server_url.trim_end_matches('/').to_string(),
                credentials,
            }),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.shared.server_url
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let url = self.shared.url("_all_dbs");
        let resp = self
            .shared
            .send(self.shared.request(Method::GET, &url), "_all_dbs")
            .await?;
        decode(resp).await
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        let url = self.shared.url(&urlencoded(name));
        self.shared
            .send(self.shared.request(Method::PUT, &url), name)
            .await?;
        tracing::info!(database = name, "created database");
        Ok(())
    }

    async fn delete_database(&self, name: &str) -> Result<()> {
        let url = self.shared.url(&urlencoded(name));
        self.shared
            .send(self.shared.request(Method::DELETE, &url), name)
            .await?;
        tracing::info!(database = name, "deleted database");
        Ok(())
    }

    async fn database_info(&self, name: &str) -> Result<Value> {
        let url = self.shared.url(&urlencoded(name));
        let resp = self
            .shared
            .send(self.shared.request(Method::GET, &url), name)
            .await?;
        decode(resp).await
    }

    fn use_database(&self, name: &str) -> Arc<dyn Adapter> {
        Arc::new(HttpAdapter {
            shared: self.shared.clone(),
            base_url: self.shared.url(&urlencoded(name)),
            db_name: name.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// HttpAdapter
// ---------------------------------------------------------------------------

/// Document calls against one CouchDB database.
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    shared: Arc<Shared>,
    base_url: String,
    db_name: String,
}

impl HttpAdapter {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn bulk(&self, docs: &[Record], all_or_nothing: bool) -> Result<Vec<DocResult>> {
        let body = CouchDbBulkDocsRequest {
            docs,
            all_or_nothing,
        };
        let request = self
            .shared
            .request(Method::POST, &self.url("_bulk_docs"))
            .json(&body);
        let resp = self.shared.send(request, &self.db_name).await?;
        decode(resp).await
    }

    async fn query(&self, path: &str, opts: &QueryOptions) -> Result<QueryResponse> {
        let url = self.url(path);
        let params = query_params(opts);
        let request = match &opts.keys {
            Some(keys) => self
                .shared
                .request(Method::POST, &url)
                .query(&params)
                .json(&CouchDbKeysRequest { keys }),
            None => self.shared.request(Method::GET, &url).query(&params),
        };
        let resp = self.shared.send(request, path).await?;
        decode(resp).await
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    fn database(&self) -> &str {
        &self.db_name
    }

    async fn get_doc(&self, id: &str) -> Result<Record> {
        let url = self.url(&urlencoded(id));
        let resp = self
            .shared
            .send(self.shared.request(Method::GET, &url), id)
            .await?;
        decode(resp).await
    }

    async fn store_doc(&self, doc: Record) -> Result<DocResult> {
        let request = match doc.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) => self
                .shared
                .request(Method::PUT, &self.url(&urlencoded(id)))
                .json(&doc),
            None => self.shared.request(Method::POST, &self.base_url).json(&doc),
        };
        let context = doc
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or(&self.db_name);
        let resp = self.shared.send(request, context).await?;
        let put: CouchDbPutResponse = decode(resp).await?;
        Ok(DocResult::ok(put.id, put.rev))
    }

    async fn delete_doc(&self, doc: Record) -> Result<DocResult> {
        let (id, rev) = id_and_rev(&doc)?;
        let request = self
            .shared
            .request(Method::DELETE, &self.url(&urlencoded(id)))
            .query(&[("rev", rev)]);
        let resp = self.shared.send(request, id).await?;
        let put: CouchDbPutResponse = decode(resp).await?;
        Ok(DocResult::ok(put.id, put.rev))
    }

    async fn store_docs(&self, docs: Vec<Record>, all_or_nothing: bool) -> Result<Vec<DocResult>> {
        tracing::debug!(database = %self.db_name, count = docs.len(), all_or_nothing, "_bulk_docs");
        self.bulk(&docs, all_or_nothing).await
    }

    async fn delete_docs(&self, docs: Vec<Record>, all_or_nothing: bool) -> Result<Vec<DocResult>> {
        let tombstones = docs
            .iter()
            .map(|doc| {
                let (id, rev) = id_and_rev(doc)?;
                let mut t = Record::new();
                t.insert(ID_FIELD.into(), Value::String(id.to_string()));
                t.insert(REV_FIELD.into(), Value::String(rev.to_string()));
                t.insert("_deleted".into(), Value::Bool(true));
                Ok(t)
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(database = %self.db_name, count = tombstones.len(), all_or_nothing, "_bulk_docs delete");
        self.bulk(&tombstones, all_or_nothing).await
    }

    async fn get_all_docs(&self, opts: QueryOptions) -> Result<QueryResponse> {
        self.query("_all_docs", &opts).await
    }

    async fn get_view(&self, design: &str, view: &str, opts: QueryOptions) -> Result<QueryResponse> {
        let design = design.strip_prefix("_design/").unwrap_or(design);
        let path = format!("_design/{}/_view/{}", urlencoded(design), urlencoded(view));
        self.query(&path, &opts).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn check_error(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let body: CouchDbError = serde_json::from_str(&text).unwrap_or(CouchDbError {
        error: String::new(),
        reason: text.clone(),
    });
    tracing::debug!(%status, error = %body.error, reason = %body.reason, context, "CouchDB request failed");

    Err(match status {
        StatusCode::UNAUTHORIZED => StoreError::Unauthorized.into(),
        StatusCode::FORBIDDEN => StoreError::Forbidden(body.reason).into(),
        StatusCode::NOT_FOUND => TableError::NotFound(format!("{context} ({})", body.reason)),
        StatusCode::CONFLICT => StoreError::Conflict(context.to_string()).into(),
        StatusCode::PRECONDITION_FAILED => StoreError::DatabaseExists(context.to_string()).into(),
        StatusCode::EXPECTATION_FAILED => StoreError::Rejected(body.reason).into(),
        _ => StoreError::Http {
            status: status.as_u16(),
            body: text,
        }
        .into(),
    })
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| StoreError::Decode(e.to_string()).into())
}

fn id_and_rev(doc: &Record) -> Result<(&str, &str)> {
    let id = doc
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| TableError::Validation("Document to delete has no '_id'.".into()))?;
    let rev = doc
        .get(REV_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| TableError::Validation(format!("Document '{id}' to delete has no '_rev'.")))?;
    Ok((id, rev))
}

fn query_params(opts: &QueryOptions) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if opts.include_docs {
        params.push(("include_docs", "true".to_string()));
    }
    if opts.skip > 0 {
        params.push(("skip", opts.skip.to_string()));
    }
    if let Some(limit) = opts.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

/// Percent-encode a path segment (database names, document ids).
fn urlencoded(s: &str) -> String {
    s.replace('%', "%25")
        .replace(' ', "%20")
        .replace('/', "%2F")
        .replace('?', "%3F")
        .replace('#', "%23")
        .replace('+', "%2B")
}
