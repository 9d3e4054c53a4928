use std::path::Path;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use couchtable_adapter_http::Credentials;
use couchtable_core::error::{Result, TableError};

/// Server used when a configuration carries no DSN.
pub const DEFAULT_DSN: &str = "http://localhost:5984";

/// Per-service CouchDB connection settings.
///
/// `username`, `password` and `db` at the top level are the legacy layout;
/// the same keys inside `options` take precedence. Any other `options` keys
/// are kept as given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub dsn: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: Option<String>,
    pub options: Map<String, Value>,
    /// Upper bound applied to every list `limit`.
    pub max_records: Option<u64>,
}

impl ServiceConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| TableError::Config(format!("invalid service configuration: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TableError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Reject configurations with an unparseable DSN or no derivable
    /// database name.
    pub fn validate(&self) -> Result<()> {
        self.parsed_dsn()?;
        if self.database_name().is_none() {
            return Err(TableError::Config(
                "Database name must be included in the 'dsn' or as an 'option' attribute.".into(),
            ));
        }
        Ok(())
    }

    pub fn dsn(&self) -> &str {
        match self.dsn.as_deref().map(str::trim) {
            Some(dsn) if !dsn.is_empty() => dsn,
            _ => DEFAULT_DSN,
        }
    }

    /// The configured database: `options.db`, then the legacy `db`, then the
    /// first path segment of the DSN.
    pub fn database_name(&self) -> Option<String> {
        if let Some(db) = self.option_str("db") {
            return Some(db.to_string());
        }
        if let Some(db) = non_empty(self.db.as_deref()) {
            return Some(db.to_string());
        }
        let url = self.parsed_dsn().ok()?;
        url.path_segments()?
            .find(|s| !s.is_empty())
            .map(String::from)
    }

    /// The DSN reduced to scheme, host and port.
    pub fn server_url(&self) -> Result<String> {
        let mut url = self.parsed_dsn()?;
        url.set_path("");
        url.set_query(None);
        url.set_fragment(None);
        // Clearing userinfo only fails for cannot-be-a-base URLs, which
        // parsed_dsn already rejected.
        let _ = url.set_username("");
        let _ = url.set_password(None);
        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    /// Basic-auth credentials, if a username is configured anywhere.
    pub fn credentials(&self) -> Option<Credentials> {
        let url = self.parsed_dsn().ok();
        let dsn_user = url
            .as_ref()
            .map(|u| u.username())
            .filter(|u| !u.is_empty());
        let dsn_password = url.as_ref().and_then(|u| u.password());

        let username = self
            .option_str("username")
            .or(non_empty(self.username.as_deref()))
            .or(dsn_user)?;
        let password = self
            .option_str("password")
            .or(self.password.as_deref())
            .or(dsn_password)
            .map(String::from);
        Some(Credentials::new(username, password))
    }

    fn option_str(&self, key: &str) -> Option<&str> {
        non_empty(self.options.get(key).and_then(Value::as_str))
    }

    fn parsed_dsn(&self) -> Result<Url> {
        let dsn = self.dsn();
        let full = if dsn.contains("://") {
            dsn.to_string()
        } else {
            format!("http://{dsn}")
        };
        let url = Url::parse(&full)
            .map_err(|e| TableError::Config(format!("invalid dsn '{dsn}': {e}")))?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(TableError::Config(format!("invalid dsn '{dsn}': missing host")));
        }
        Ok(url)
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}
