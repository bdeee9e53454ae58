//! Output hashing: the digests that become a task's `outputs_version`.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::warn;

use crate::{
    duckdb::{hash_duckdb_target, DuckdbEngine, DUCKDB_OUTPUT_PREFIX},
    Error,
};

fn var_pattern() -> Regex {
    Regex::new(r"\$\{([a-zA-Z0-9\-_\.]+)\}").unwrap()
}

/// Everything output hashing needs from the caller: where outputs land and,
/// when `duckdb://` targets are declared, something that can run SQL.
#[derive(Clone, Copy, Default)]
pub struct OutputContext<'a> {
    pub scratch_dir: Option<&'a Utf8Path>,
    pub duckdb: Option<&'a dyn DuckdbEngine>,
}

/// Expand `${var}` placeholders via `lookup`; unresolved placeholders become
/// `*` wildcards.
fn expand_placeholders(pattern: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let regex = var_pattern();
    let mut expanded = pattern.to_string();
    for capture in regex.captures_iter(pattern) {
        let name = &capture[1];
        let replacement = lookup(name).unwrap_or_else(|| "*".to_string());
        expanded = expanded.replace(&format!("${{{name}}}"), &replacement);
    }
    expanded
}

fn collect_matching_files(
    scratch_dir: &Utf8Path,
    pattern: &str,
) -> Result<BTreeSet<Utf8PathBuf>, Error> {
    let mut files = BTreeSet::new();
    if pattern.contains(['*', '?', '[']) {
        let glob_pattern = scratch_dir.join(pattern);
        let matches = glob::glob(glob_pattern.as_str()).map_err(|source| Error::Pattern {
            pattern: glob_pattern.to_string(),
            source,
        })?;
        let mut found_any = false;
        for entry in matches.flatten() {
            if let Ok(path) = Utf8PathBuf::try_from(entry) {
                files.insert(path);
                found_any = true;
            }
        }
        if !found_any {
            warn!("File {glob_pattern} not found");
        }
    } else {
        let candidate = scratch_dir.join(pattern);
        if candidate.exists() {
            files.insert(candidate);
        } else {
            warn!("File {candidate} not found");
        }
    }
    Ok(files)
}

fn hash_outputs_with_lookup(
    context: OutputContext<'_>,
    outputs: &[String],
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Option<String>, Error> {
    let (duckdb_targets, file_patterns): (Vec<&String>, Vec<&String>) = outputs
        .iter()
        .partition(|output| output.starts_with(DUCKDB_OUTPUT_PREFIX));

    let mut file_list: BTreeSet<Utf8PathBuf> = BTreeSet::new();
    if !file_patterns.is_empty() {
        let scratch_dir = context.scratch_dir.ok_or(Error::MissingScratchDir)?;
        for pattern in file_patterns {
            let expanded = expand_placeholders(pattern, lookup);
            file_list.extend(collect_matching_files(scratch_dir, &expanded)?);
        }
    }

    let mut hashed_outputs: Vec<serde_json::Value> = Vec::new();
    for file_path in &file_list {
        let key = context
            .scratch_dir
            .and_then(|scratch| file_path.strip_prefix(scratch).ok())
            .map(|relative| relative.to_string())
            .unwrap_or_else(|| file_path.to_string());
        let digest = match crate::hash_file(file_path) {
            Ok(digest) => digest,
            Err(error) => {
                warn!("Skipping unreadable output {file_path}: {error}");
                continue;
            }
        };
        hashed_outputs.push(serde_json::json!({ key: digest }));
    }

    let mut sorted_targets: Vec<&String> = duckdb_targets.into_iter().collect();
    sorted_targets.sort();
    sorted_targets.dedup();
    for target in sorted_targets {
        if let Some(digest) = hash_duckdb_target(context.duckdb, target)? {
            let target_key = target.to_string();
            hashed_outputs.push(serde_json::json!({ target_key: digest }));
        }
    }

    if hashed_outputs.is_empty() {
        return Ok(None);
    }
    Ok(crate::hash_value(&serde_json::Value::Array(hashed_outputs)))
}

/// Hash a task's declared outputs. `${var}` placeholders resolve against the
/// process environment at hash time.
pub fn hash_task_outputs(
    context: OutputContext<'_>,
    outputs: &[String],
) -> Result<Option<String>, Error> {
    hash_outputs_with_lookup(context, outputs, &|name| std::env::var(name).ok())
}

/// Hash one subtask's outputs. Placeholders resolve against the subtask's
/// kwargs first, then fall back to wildcards.
pub fn hash_subtask_outputs(
    context: OutputContext<'_>,
    outputs: &[String],
    kwargs: &BTreeMap<String, serde_json::Value>,
) -> Result<Option<String>, Error> {
    hash_outputs_with_lookup(context, outputs, &|name| {
        kwargs.get(name).map(|value| match value {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    })
}
