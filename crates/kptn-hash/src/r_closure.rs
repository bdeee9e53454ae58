//! R source-import closure hashing.
//!
//! Starting from a task's declared R script(s) we follow every
//! `source("...")`, `source(here("..."))` and `r_script("...")` call,
//! resolving plain `source` relative to the calling file's directory and
//! `here` relative to the nearest ancestor containing a `.here` marker.

use std::collections::{BTreeSet, HashMap};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::warn;

use crate::{CodeHashEntry, Error};

fn source_patterns() -> [Regex; 3] {
    [
        Regex::new(r#"source\("(.*?)"\)"#).unwrap(),
        Regex::new(r#"source\(.*here\("(.*?)"\)\)"#).unwrap(),
        Regex::new(r#"r_script\("(.*?)"\)"#).unwrap(),
    ]
}

/// Walk up from `start` looking for a directory containing a `.here` marker.
/// Falls back to `project_root` when no marker exists.
pub fn find_here_root(start: &Utf8Path, project_root: &Utf8Path) -> Utf8PathBuf {
    let mut current = if start.is_file() {
        start.parent().map(Utf8Path::to_path_buf)
    } else {
        Some(start.to_path_buf())
    };
    while let Some(dir) = current {
        if dir.join(".here").exists() {
            return dir;
        }
        current = dir.parent().map(Utf8Path::to_path_buf);
    }
    project_root.to_path_buf()
}

fn read_r_file(path: &Utf8Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|e| Error::io(path, e))
}

fn imports_of(file_path: &Utf8Path, project_root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, Error> {
    let base_dir = file_path.parent().unwrap_or(Utf8Path::new("."));
    let content = read_r_file(file_path)?;
    let [literal, here, rscript] = source_patterns();

    let mut imports = Vec::new();
    for capture in literal.captures_iter(&content) {
        imports.push(base_dir.join(&capture[1]));
    }
    let here_root = find_here_root(file_path, project_root);
    for capture in here.captures_iter(&content) {
        imports.push(here_root.join(&capture[1]));
    }
    for capture in rscript.captures_iter(&content) {
        imports.push(base_dir.join(&capture[1]));
    }
    Ok(imports)
}

struct RImportFinder {
    cache: HashMap<Utf8PathBuf, Vec<Utf8PathBuf>>,
    project_root: Utf8PathBuf,
}

impl RImportFinder {
    fn search(&mut self, file_path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, Error> {
        let imports = imports_of(file_path, &self.project_root)?;
        self.cache.insert(file_path.to_path_buf(), imports.clone());

        let mut child_imports = Vec::new();
        for import in &imports {
            if import.exists() {
                if !self.cache.contains_key(import) {
                    child_imports.extend(self.search(import)?);
                }
            } else {
                warn!("R import {import} does not exist");
            }
        }
        let mut all = imports;
        all.extend(child_imports);
        Ok(all)
    }
}

/// Return the alphabetically sorted, deduplicated list of all files reachable
/// from the given R scripts, the scripts themselves included.
pub fn collect_r_file_list(
    file_paths: &[Utf8PathBuf],
    project_root: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, Error> {
    let mut finder = RImportFinder {
        cache: HashMap::new(),
        project_root: project_root.to_path_buf(),
    };
    let mut results = BTreeSet::new();
    for file_path in file_paths {
        results.insert(file_path.clone());
        for import in finder.search(file_path)? {
            results.insert(import);
        }
    }
    Ok(results.into_iter().collect())
}

/// Hash each file in the closure, keyed by path relative to `base_dir`.
pub fn hash_r_files(
    file_paths: &[Utf8PathBuf],
    base_dir: &Utf8Path,
) -> Result<Vec<CodeHashEntry>, Error> {
    let file_list = collect_r_file_list(file_paths, base_dir)?;
    let mut entries = Vec::with_capacity(file_list.len());
    for file in &file_list {
        if !file.exists() {
            continue;
        }
        let contents = read_r_file(file)?;
        let relative = file
            .strip_prefix(base_dir)
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|_| file.clone());
        let digest = crate::hash_bytes(contents.as_bytes());
        entries.push(CodeHashEntry::new(relative.as_str(), digest));
    }
    Ok(entries)
}
