//! # couchtable
//!
//! Table-style CRUD over CouchDB. Each CouchDB database is a table; each
//! document is a record identified by `_id` and versioned by `_rev`.
//!
//! ```no_run
//! use couchtable::{CouchDbService, ServiceConfig, TableOperation, TableOptions};
//!
//! # async fn example() -> couchtable::Result<()> {
//! let config = ServiceConfig::from_json(r#"{"dsn": "http://localhost:5984/app"}"#)?;
//! let service = CouchDbService::from_config(config)?;
//!
//! let created = service
//!     .execute(
//!         "app",
//!         TableOperation::Create {
//!             records: vec![serde_json::json!({"name": "Alice"})],
//!         },
//!         &TableOptions::default(),
//!     )
//!     .await?;
//! println!("{}", serde_json::to_string(&created)?);
//! # Ok(())
//! # }
//! ```
//!
//! Multi-record requests are staged and written with one bulk call. With
//! `continue` each record runs on its own and failures are reported in
//! place; with `rollback` the first failure reverts what was already
//! written.

pub mod config;
pub mod schema;
pub mod service;
pub mod table;
pub mod transaction;

pub use couchtable_core::adapter::{Adapter, Connection};
pub use couchtable_core::error::{Result, StoreError, TableError};
pub use couchtable_core::operation::TableOperation;
pub use couchtable_core::options::{Fields, TableOptions, ViewSelector, parse_ids};
pub use couchtable_core::record::{ItemError, ItemResult, Record};

pub use couchtable_adapter_http::{Credentials, HttpConnection};
pub use couchtable_adapter_memory::{MemoryAdapter, MemoryConnection};

pub use config::ServiceConfig;
pub use schema::{Schema, TableInfo, TableList};
pub use service::CouchDbService;
pub use table::{Table, TableResponse};
pub use transaction::{Revert, Transaction};
