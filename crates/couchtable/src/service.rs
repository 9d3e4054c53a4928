use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use couchtable_adapter_http::HttpConnection;
use couchtable_core::adapter::Connection;
use couchtable_core::error::{Result, TableError};
use couchtable_core::operation::TableOperation;
use couchtable_core::options::TableOptions;

use crate::config::ServiceConfig;
use crate::schema::{Schema, TableList};
use crate::table::{Table, TableResponse};

pub const SCHEMA_RESOURCE: &str = "_schema";
pub const TABLE_RESOURCE: &str = "_table";

/// One configured CouchDB service: a connection plus the tables it exposes.
///
/// Known table names are cached per instance. The cache is refreshed once
/// before a lookup miss is reported, and table create/drop through this
/// service invalidates it; call [`CouchDbService::invalidate_tables`] after
/// out-of-band changes.
pub struct CouchDbService {
    config: ServiceConfig,
    database: String,
    connection: Arc<dyn Connection>,
    tables: RwLock<Option<Vec<String>>>,
}

impl CouchDbService {
    /// Validate `config` and connect to its CouchDB server over HTTP.
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let server_url = config.server_url()?;
        let connection = match config.credentials() {
            Some(credentials) => HttpConnection::with_credentials(&server_url, credentials),
            None => HttpConnection::new(&server_url),
        };
        tracing::debug!(server = %server_url, "configured CouchDB service");
        Self::with_connection(config, Arc::new(connection))
    }

    /// Use an existing connection, e.g. the in-memory store.
    pub fn with_connection(config: ServiceConfig, connection: Arc<dyn Connection>) -> Result<Self> {
        config.validate()?;
        let database = config.database_name().ok_or_else(|| {
            TableError::Config("No CouchDb database selected in configuration.".into())
        })?;
        Ok(Self {
            config,
            database,
            connection,
            tables: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The database named by the configuration.
    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn schema(&self) -> Schema {
        Schema::new(self.connection.clone())
    }

    /// Forget the cached table names.
    pub async fn invalidate_tables(&self) {
        *self.tables.write().await = None;
    }

    /// Check that `name` is an existing table and return it.
    pub async fn correct_table_name(&self, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TableError::Validation("Table name can not be empty.".into()));
        }

        let cached = self
            .tables
            .read()
            .await
            .as_ref()
            .is_some_and(|tables| tables.iter().any(|t| t == name));
        if cached {
            return Ok(name.to_string());
        }

        let tables = self.connection.list_databases().await?;
        let found = tables.iter().any(|t| t == name);
        *self.tables.write().await = Some(tables);
        if found {
            Ok(name.to_string())
        } else {
            Err(TableError::NotFound(format!("Table '{name}' not found.")))
        }
    }

    /// Bind a table handle for one request.
    pub async fn table(&self, name: &str) -> Result<Table> {
        let name = self.correct_table_name(name).await?;
        Ok(Table::new(self.connection.use_database(&name)).with_max_records(self.config.max_records))
    }

    /// Run `operation` against `table`. Invalid requests are rejected before
    /// the table name is even resolved.
    pub async fn execute(
        &self,
        table: &str,
        operation: TableOperation,
        opts: &TableOptions,
    ) -> Result<TableResponse> {
        operation.validate(opts)?;
        self.table(table).await?.execute(operation, opts).await
    }

    pub async fn list_tables(&self, include_properties: bool) -> Result<TableList> {
        self.schema().list_tables(include_properties).await
    }

    pub async fn describe_table(&self, name: &str) -> Result<Value> {
        self.schema().describe_table(name).await
    }

    pub async fn create_table(&self, name: &str) -> Result<Value> {
        let out = self.schema().create_table(name).await?;
        self.invalidate_tables().await;
        Ok(out)
    }

    pub async fn update_table(&self, name: &str) -> Result<Value> {
        self.schema().update_table(name).await
    }

    pub async fn drop_table(&self, name: &str) -> Result<Value> {
        let out = self.schema().drop_table(name).await?;
        self.invalidate_tables().await;
        Ok(out)
    }

    /// Resource paths this service exposes, for a host's access control
    /// listing: the schema and table roots, then one entry per user table.
    pub async fn access_components(&self) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .connection
            .list_databases()
            .await?
            .into_iter()
            .filter(|name| !name.starts_with('_'))
            .collect();

        let mut out = Vec::with_capacity(4 + 2 * names.len());
        for resource in [SCHEMA_RESOURCE, TABLE_RESOURCE] {
            out.push(format!("{resource}/"));
            out.push(format!("{resource}/*"));
            out.extend(names.iter().map(|name| format!("{resource}/{name}")));
        }
        Ok(out)
    }
}
