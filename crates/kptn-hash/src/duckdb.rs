//! DuckDB table digests.
//!
//! The hasher never owns a database connection. Anything that can run SQL for
//! us implements [`DuckdbEngine`]; the runtime config supplies one as a typed
//! resource handle when the pipeline declares `duckdb://` outputs.

use md5::{Digest, Md5};
use tracing::warn;

use crate::Error;

pub const DUCKDB_OUTPUT_PREFIX: &str = "duckdb://";
const DUCKDB_EMPTY_SENTINEL: &str = "duckdb-empty-table";

/// MD5 sentinel for an empty or missing table.
pub fn duckdb_empty_hash() -> String {
    md5_hex(DUCKDB_EMPTY_SENTINEL)
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Capability handle for running SQL against a DuckDB database. Registered
/// factories in the runtime config produce implementations; the hasher and
/// the SQL task runner consume them.
pub trait DuckdbEngine: Send + Sync {
    /// Run a query expected to produce at most one row with one column;
    /// `None` when the result set is empty or the value is SQL NULL.
    fn query_scalar(&self, sql: &str) -> Result<Option<String>, String>;

    /// Execute a statement with optional named parameters.
    fn execute(&self, sql: &str, params: &[(String, serde_json::Value)]) -> Result<(), String>;
}

/// Split a `duckdb://[schema.]table` target into its parts.
pub fn parse_duckdb_target(target: &str) -> Result<(Option<&str>, &str), Error> {
    let body = target
        .strip_prefix(DUCKDB_OUTPUT_PREFIX)
        .ok_or_else(|| Error::NotDuckdbTarget(target.to_string()))?;
    if body.is_empty() {
        return Err(Error::EmptyDuckdbTarget);
    }
    Ok(match body.split_once('.') {
        Some((schema, table)) if !schema.is_empty() => (Some(schema), table),
        Some((_, table)) => (None, table),
        None => (None, body),
    })
}

fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Digest one `duckdb://` target. The digest is the MD5 of the ordered
/// concatenation of per-row MD5s, so it is stable across row order. An empty
/// or missing table maps to the fixed sentinel; an absent engine yields
/// `None` so the target simply isn't captured.
pub fn hash_duckdb_target(engine: Option<&dyn DuckdbEngine>, target: &str) -> Result<Option<String>, Error> {
    let Some(engine) = engine else {
        warn!("DuckDB outputs requested but no 'duckdb' engine is configured");
        return Ok(None);
    };
    let (schema, table) = parse_duckdb_target(target)?;
    let mut qualified = quote_identifier(table);
    if let Some(schema) = schema {
        qualified = format!("{}.{}", quote_identifier(schema), qualified);
    }
    let alias = "tscache_tbl";
    let row_hash = format!("md5({alias}::TEXT)");
    let query = format!(
        "SELECT string_agg({row_hash}, '' ORDER BY {row_hash}) AS concatenated_hashes \
         FROM {qualified} AS {alias}"
    );
    match engine.query_scalar(&query) {
        Ok(Some(concatenated)) => Ok(Some(md5_hex(&concatenated))),
        Ok(None) => Ok(Some(duckdb_empty_hash())),
        Err(message) => {
            warn!("Failed to hash DuckDB output '{target}': {message}");
            Ok(None)
        }
    }
}
