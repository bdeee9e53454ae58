//! kptn-hash: content-addressed fingerprinting for the task state cache.
//!
//! Everything the cache compares is produced here: object digests, file
//! digests, R source-import closures, Python function closures, DuckDB table
//! digests, and the output hashes that become a task's `outputs_version`.

pub mod duckdb;
mod outputs;
mod py_closure;
mod r_closure;
mod scripts;

use std::io::Read;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub use crate::{
    duckdb::{duckdb_empty_hash, DuckdbEngine, DUCKDB_OUTPUT_PREFIX},
    outputs::{hash_subtask_outputs, hash_task_outputs, OutputContext},
    py_closure::{py_code_hashes_or_file, PyFunctionAnalyzer},
    r_closure::{collect_r_file_list, find_here_root, hash_r_files},
    scripts::{locate_py_script, locate_r_scripts, locate_sql_script},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid glob pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("R script {script} not found for task '{task}' (searched: {searched})")]
    RScriptNotFound {
        task: String,
        script: String,
        searched: String,
    },
    #[error("Python script {script} not found for task '{task}'; attempted: {attempted}")]
    PyScriptNotFound {
        task: String,
        script: String,
        attempted: String,
    },
    #[error("DuckDB SQL file '{script}' for task '{task}' not found (searched: {searched})")]
    SqlScriptNotFound {
        task: String,
        script: String,
        searched: String,
    },
    #[error("not a DuckDB target: {0}")]
    NotDuckdbTarget(String),
    #[error("DuckDB output spec missing table name")]
    EmptyDuckdbTarget,
    #[error("scratch directory not set but task declares file outputs")]
    MissingScratchDir,
    #[error("function '{function}' not found in {path}")]
    FunctionNotFound { function: String, path: String },
    #[error("unable to parse module at {0}")]
    UnparseableModule(String),
}

impl Error {
    pub(crate) fn io(path: impl AsRef<Utf8Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_string(),
            source,
        }
    }
}

/// A single named code digest. A task's `code_hashes` is an ordered list of
/// these; Python entries are keyed by qualified function name, R entries by
/// path relative to the R task root, SQL entries by the script path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeHashEntry {
    pub name: String,
    pub hash: String,
}

impl CodeHashEntry {
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
        }
    }
}

/// SHA-1 of raw bytes, hex-encoded.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest of a JSON-encodable object. `Null` stays `None`; bare strings are
/// hashed as-is; anything structured is canonicalised through its compact
/// JSON encoding first. Every "digest of object" in the cache is this
/// function, so two sides of a comparison must feed it identically ordered
/// structures.
pub fn hash_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) => Some(hash_bytes(text.as_bytes())),
        other => Some(hash_bytes(other.to_string().as_bytes())),
    }
}

/// Convenience over [`hash_value`] for anything serialisable.
pub fn hash_serializable<T: Serialize>(value: &T) -> Option<String> {
    let encoded = serde_json::to_value(value).ok()?;
    hash_value(&encoded)
}

/// Streaming SHA-1 of file contents.
pub fn hash_file(path: &Utf8Path) -> Result<String, Error> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|e| Error::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest an ordered list of code hash entries into a `code_version`.
pub fn code_version(entries: &[CodeHashEntry]) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    hash_serializable(&entries)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_hash_value_is_deterministic() {
        let value = json!({"a": 1, "b": [1, 2, 3]});
        assert_eq!(hash_value(&value), hash_value(&value));
    }

    #[test]
    fn test_hash_value_null_is_none() {
        assert_eq!(hash_value(&serde_json::Value::Null), None);
    }

    #[test]
    fn test_hash_value_distinguishes_values() {
        let a = hash_value(&json!({"dep": "aaaa"}));
        let b = hash_value(&json!({"dep": "bbbb"}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_string_hashes_as_raw_text() {
        // A bare string is hashed without JSON quoting, so it matches the
        // digest of the same bytes.
        assert_eq!(
            hash_value(&json!("hello")),
            Some(hash_bytes(b"hello".as_slice()))
        );
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"file contents")?;
        let path = camino::Utf8PathBuf::try_from(path)?;
        assert_eq!(hash_file(&path)?, hash_bytes(b"file contents"));
        Ok(())
    }

    #[test]
    fn test_code_version_empty_is_none() {
        assert_eq!(code_version(&[]), None);
    }
}
