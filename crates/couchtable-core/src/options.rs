use std::collections::HashMap;

use crate::error::{Result, TableError};
use crate::record::ID_FIELD;

/// Which fields of a record are returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Fields {
    /// Identifier and revision only.
    #[default]
    Default,
    /// The full record (`*`).
    All,
    /// Identifier, revision, and the listed fields.
    Only(Vec<String>),
}

impl Fields {
    /// Parse a `fields` parameter: `*`, empty, or a comma-separated list.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().trim_matches(',');
        if raw == "*" {
            return Fields::All;
        }
        let names: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            Fields::Default
        } else {
            Fields::Only(names)
        }
    }

    /// Whether anything beyond `_id` and `_rev` is requested, which means
    /// full documents must be fetched or merged back into results.
    pub fn requires_more(&self) -> bool {
        match self {
            Fields::Default => false,
            Fields::All => true,
            Fields::Only(names) => names
                .iter()
                .any(|n| !n.eq_ignore_ascii_case(ID_FIELD) && !n.eq_ignore_ascii_case("_rev")),
        }
    }
}

/// A named view (design document + view name) replacing the full scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSelector {
    pub design: String,
    pub view: String,
}

/// Options recognized by every table operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableOptions {
    /// Fields to return (`fields`).
    pub fields: Fields,
    /// Explicit identifiers (`ids`).
    pub ids: Option<Vec<String>>,
    /// Identifier field override (`id_field`); only `_id` is meaningful.
    pub id_field: Option<String>,
    /// Identifier type override (`id_type`); only `string` is meaningful.
    pub id_type: Option<String>,
    /// Report per-item failures instead of stopping (`continue`).
    pub continue_on_error: bool,
    /// Revert committed work when a later record fails (`rollback`).
    pub rollback: bool,
    /// Report the total row count on lists (`include_count`).
    pub include_count: bool,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Named view to list through (`design` + `view`).
    pub view: Option<ViewSelector>,
    /// Return full document bodies on lists (`include_docs`).
    pub include_docs: bool,
    /// Required to delete every record of a table without ids (`force`).
    pub force: bool,
    /// Relational filter expression (`filter`). Always refused.
    pub filter: Option<String>,
}

impl TableOptions {
    /// Build options from a free-form parameter map, as a gateway would pass
    /// query-string parameters through.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let mut opts = TableOptions::default();

        for (key, value) in params {
            match key.as_str() {
                "fields" => opts.fields = Fields::parse(value),
                "ids" => opts.ids = Some(parse_ids(value)),
                "id_field" => opts.id_field = Some(value.trim().to_string()),
                "id_type" => opts.id_type = Some(value.trim().to_string()),
                "continue" => opts.continue_on_error = parse_bool(key, value)?,
                "rollback" => opts.rollback = parse_bool(key, value)?,
                "include_count" => opts.include_count = parse_bool(key, value)?,
                "include_docs" => opts.include_docs = parse_bool(key, value)?,
                "force" => opts.force = parse_bool(key, value)?,
                "offset" | "skip" => opts.offset = Some(parse_u64(key, value)?),
                "limit" => opts.limit = Some(parse_u64(key, value)?),
                "filter" => {
                    if !value.trim().is_empty() {
                        opts.filter = Some(value.clone());
                    }
                }
                "design" | "view" => {}
                _ => tracing::trace!(param = %key, "ignoring unrecognized table option"),
            }
        }

        let design = params.get("design").map(|s| s.trim()).filter(|s| !s.is_empty());
        let view = params.get("view").map(|s| s.trim()).filter(|s| !s.is_empty());
        opts.view = match (design, view) {
            (Some(design), Some(view)) => Some(ViewSelector {
                design: design.to_string(),
                view: view.to_string(),
            }),
            (None, None) => None,
            _ => {
                return Err(TableError::Validation(
                    "Both 'design' and 'view' are required to query a view.".into(),
                ));
            }
        };

        opts.validate()?;
        Ok(opts)
    }

    /// Check option combinations that no CouchDB table can honor.
    pub fn validate(&self) -> Result<()> {
        if let Some(field) = &self.id_field
            && field != ID_FIELD
        {
            return Err(TableError::Validation(format!(
                "CouchDB records are identified by '{ID_FIELD}' only, not '{field}'."
            )));
        }
        if let Some(ty) = &self.id_type
            && !ty.eq_ignore_ascii_case("string")
        {
            return Err(TableError::Validation(format!(
                "CouchDB identifiers are strings, not '{ty}'."
            )));
        }
        Ok(())
    }

    pub fn has_filter(&self) -> bool {
        self.filter.as_deref().is_some_and(|f| !f.trim().is_empty())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TableError::Validation(format!(
            "Invalid boolean for '{key}': {value}"
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| TableError::Validation(format!("Invalid number for '{key}': {value}")))
}

/// Split a comma-separated id list, dropping blanks.
pub fn parse_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
