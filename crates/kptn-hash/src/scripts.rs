//! Task script resolution across configured search roots.

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::Error;

fn var_pattern() -> Regex {
    Regex::new(r"\$\{([a-zA-Z0-9\-_\.]+)\}").unwrap()
}

fn dedupe(dirs: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    let mut seen = std::collections::HashSet::new();
    dirs.iter()
        .filter(|dir| seen.insert(dir.as_str().to_string()))
        .cloned()
        .collect()
}

/// Locate the R script(s) for a task. Patterns containing `${var}`
/// placeholders are globbed with the placeholders wildcarded; the first
/// search root with a match wins. Returns the matching script paths and the
/// root they were found under (the base for relative hash keys).
pub fn locate_r_scripts(
    task_name: &str,
    filename: &str,
    search_dirs: &[Utf8PathBuf],
) -> Result<(Vec<Utf8PathBuf>, Utf8PathBuf), Error> {
    let relative = Utf8Path::new(filename);
    if relative.is_absolute() {
        if relative.exists() {
            let parent = relative
                .parent()
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|| Utf8PathBuf::from("/"));
            return Ok((vec![relative.to_path_buf()], parent));
        }
        return Err(Error::RScriptNotFound {
            task: task_name.to_string(),
            script: filename.to_string(),
            searched: filename.to_string(),
        });
    }

    for base_dir in dedupe(search_dirs) {
        if filename.contains('$') {
            let wildcarded = var_pattern().replace_all(filename, "*");
            let pattern = base_dir.join(wildcarded.as_ref());
            let matches: Vec<Utf8PathBuf> = glob::glob(pattern.as_str())
                .map_err(|source| Error::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })?
                .flatten()
                .filter_map(|path| Utf8PathBuf::try_from(path).ok())
                .collect();
            if !matches.is_empty() {
                return Ok((matches, base_dir));
            }
        } else {
            let candidate = base_dir.join(relative);
            if candidate.exists() {
                return Ok((vec![candidate], base_dir));
            }
        }
    }

    Err(Error::RScriptNotFound {
        task: task_name.to_string(),
        script: filename.to_string(),
        searched: search_dirs
            .iter()
            .map(|dir| dir.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Locate the Python script for a task across the search roots, with a final
/// fallback to the current working directory.
pub fn locate_py_script(
    task_name: &str,
    filename: &str,
    search_dirs: &[Utf8PathBuf],
) -> Result<Utf8PathBuf, Error> {
    let candidate = Utf8Path::new(filename);
    if candidate.is_absolute() {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        return Err(Error::PyScriptNotFound {
            task: task_name.to_string(),
            script: filename.to_string(),
            attempted: filename.to_string(),
        });
    }

    let mut attempted = Vec::new();
    for base_dir in dedupe(search_dirs) {
        let candidate_path = base_dir.join(candidate);
        if candidate_path.exists() {
            return Ok(candidate_path);
        }
        attempted.push(candidate_path);
    }

    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(cwd) = Utf8PathBuf::try_from(cwd) {
            let fallback = cwd.join(candidate);
            if fallback.exists() {
                return Ok(fallback);
            }
            attempted.push(fallback);
        }
    }

    Err(Error::PyScriptNotFound {
        task: task_name.to_string(),
        script: filename.to_string(),
        attempted: attempted
            .iter()
            .map(|path| path.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Locate a DuckDB SQL script across the search roots.
pub fn locate_sql_script(
    task_name: &str,
    filename: &str,
    search_dirs: &[Utf8PathBuf],
) -> Result<Utf8PathBuf, Error> {
    let candidate = Utf8Path::new(filename);
    if candidate.is_absolute() {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
    } else {
        for base_dir in dedupe(search_dirs) {
            let candidate_path = base_dir.join(candidate);
            if candidate_path.exists() {
                return Ok(candidate_path);
            }
        }
    }
    Err(Error::SqlScriptNotFound {
        task: task_name.to_string(),
        script: filename.to_string(),
        searched: search_dirs
            .iter()
            .map(|dir| dir.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    })
}
