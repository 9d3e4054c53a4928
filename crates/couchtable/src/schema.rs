use std::sync::Arc;

use heck::ToTitleCase;
use serde::Serialize;
use serde_json::{Value, json};

use couchtable_core::adapter::Connection;
use couchtable_core::error::{Result, TableError};
use couchtable_core::record::{ID_FIELD, REV_FIELD};

/// Display properties of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub label: String,
    pub plural: String,
}

impl TableInfo {
    pub fn new(name: &str) -> Self {
        let label = label_for(name);
        let plural = pluralize(&label);
        Self {
            name: name.to_string(),
            label,
            plural,
        }
    }
}

/// Table listing: bare names, or names with display properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TableList {
    Names(Vec<String>),
    Properties(Vec<TableInfo>),
}

/// Table-level operations. Each table is one CouchDB database.
#[derive(Clone)]
pub struct Schema {
    connection: Arc<dyn Connection>,
}

impl Schema {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    /// User tables on the server. System databases (leading `_`) are
    /// skipped.
    pub async fn list_tables(&self, include_properties: bool) -> Result<TableList> {
        let names: Vec<String> = self
            .connection
            .list_databases()
            .await?
            .into_iter()
            .filter(|name| !name.starts_with('_'))
            .collect();

        if include_properties {
            Ok(TableList::Properties(
                names.iter().map(|n| TableInfo::new(n)).collect(),
            ))
        } else {
            Ok(TableList::Names(names))
        }
    }

    /// Database information as reported by the store, plus `name` and the
    /// two fields every record carries.
    pub async fn describe_table(&self, name: &str) -> Result<Value> {
        let name = require_name(name, "Table name can not be empty.")?;
        let mut info = self.connection.database_info(name).await?;
        if let Value::Object(map) = &mut info {
            map.insert("name".into(), Value::String(name.to_string()));
            map.insert("fields".into(), record_fields());
        }
        Ok(info)
    }

    pub async fn create_table(&self, name: &str) -> Result<Value> {
        let name = require_name(name, "No 'name' field in data.")?;
        self.connection.create_database(name).await?;
        tracing::info!(table = name, "created table");
        Ok(json!({ "name": name }))
    }

    /// CouchDB tables carry no schema; this only checks the table exists.
    pub async fn update_table(&self, name: &str) -> Result<Value> {
        let name = require_name(name, "No 'name' field in data.")?;
        self.connection.database_info(name).await?;
        Ok(json!({ "name": name }))
    }

    pub async fn drop_table(&self, name: &str) -> Result<Value> {
        let name = require_name(name, "Table name can not be empty.")?;
        self.connection.delete_database(name).await?;
        tracing::info!(table = name, "dropped table");
        Ok(json!({ "name": name }))
    }
}

/// `_id` is the string primary key, assigned by the store when absent.
fn record_fields() -> Value {
    json!([
        {"name": ID_FIELD, "type": "string", "is_primary_key": true, "auto_increment": true},
        {"name": REV_FIELD, "type": "string", "is_primary_key": false, "auto_increment": false},
    ])
}

fn require_name<'a>(name: &'a str, message: &str) -> Result<&'a str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TableError::Validation(message.into()));
    }
    Ok(name)
}

/// `user_accounts.archive` -> `User Accounts Archive`.
fn label_for(name: &str) -> String {
    name.to_title_case()
}

/// English plural of the last word of `label`.
fn pluralize(label: &str) -> String {
    let (head, last) = match label.rsplit_once(' ') {
        Some((head, last)) => (format!("{head} "), last),
        None => (String::new(), label),
    };
    let lower = last.to_ascii_lowercase();

    let plural = if lower.is_empty() {
        String::new()
    } else if ["ss", "x", "z", "ch", "sh"].iter().any(|s| lower.ends_with(s)) {
        format!("{last}es")
    } else if lower.ends_with('s') {
        last.to_string()
    } else if lower.ends_with('y')
        && !lower.ends_with("ay")
        && !lower.ends_with("ey")
        && !lower.ends_with("oy")
        && !lower.ends_with("uy")
    {
        format!("{}ies", &last[..last.len() - 1])
    } else {
        format!("{last}s")
    };
    head + &plural
}
