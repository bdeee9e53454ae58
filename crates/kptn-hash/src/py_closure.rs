//! Python function-closure hashing.
//!
//! The entry function of a Python task is located in its module, then every
//! reachable function is collected: locally defined functions called by name,
//! `from m import f` symbols, and `alias.attr(...)` calls whose receiver is a
//! module imported in the same file. Each reachable function contributes the
//! SHA-1 of its exact source segment, keyed by qualified name.
//!
//! Modules are indexed with a line scanner rather than a full grammar: kptn
//! only needs top-level `def` blocks, import bindings, and call sites. When a
//! module cannot be scanned the caller downgrades to a file-level digest.

use std::collections::{BTreeMap, HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::warn;

use crate::{CodeHashEntry, Error};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct FunctionRef {
    module: String,
    name: String,
    file_path: Utf8PathBuf,
}

impl FunctionRef {
    fn qualname(&self) -> String {
        if self.module.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.module, self.name)
        }
    }
}

#[derive(Debug)]
struct ModuleSummary {
    file_path: Utf8PathBuf,
    module_name: String,
    /// Top-level function name -> exact source segment of its `def` block.
    functions: BTreeMap<String, String>,
    /// `import m [as a]` bindings: bound name -> full module path.
    module_aliases: BTreeMap<String, String>,
    /// `from m import f [as g]` bindings: bound name -> (module path, original name).
    symbol_aliases: BTreeMap<String, (String, String)>,
}

enum CallTarget {
    Name(String),
    Attr(String, String),
}

impl ModuleSummary {
    fn parse(file_path: &Utf8Path, module_name: &str, source: &str) -> Self {
        let def_pattern = Regex::new(r"^(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(").unwrap();
        let import_pattern = Regex::new(r"^import\s+(.+?)\s*$").unwrap();
        let from_pattern = Regex::new(r"^from\s+(\.*[\w.]*)\s+import\s+(.+?)\s*$").unwrap();

        let package_parts: Vec<&str> = if module_name.is_empty() {
            Vec::new()
        } else {
            let parts: Vec<&str> = module_name.split('.').collect();
            parts[..parts.len().saturating_sub(1)].to_vec()
        };

        let mut functions = BTreeMap::new();
        let mut module_aliases = BTreeMap::new();
        let mut symbol_aliases = BTreeMap::new();

        let lines: Vec<&str> = source.lines().collect();
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];
            if let Some(capture) = def_pattern.captures(line) {
                let name = capture[1].to_string();
                let mut end = i + 1;
                while end < lines.len() {
                    let candidate = lines[end];
                    let is_top_level =
                        !candidate.trim().is_empty() && !candidate.starts_with([' ', '\t']);
                    if is_top_level {
                        break;
                    }
                    end += 1;
                }
                // Trim trailing blank lines off the segment.
                let mut last = end;
                while last > i + 1 && lines[last - 1].trim().is_empty() {
                    last -= 1;
                }
                functions.insert(name, lines[i..last].join("\n"));
                i = end;
                continue;
            }
            if let Some(capture) = import_pattern.captures(line) {
                for item in capture[1].split(',') {
                    let item = item.trim();
                    if item.is_empty() || item == "*" {
                        continue;
                    }
                    let (module, alias) = match item.split_once(" as ") {
                        Some((module, alias)) => (module.trim(), Some(alias.trim())),
                        None => (item, None),
                    };
                    let bound = alias
                        .unwrap_or_else(|| module.split('.').next().unwrap_or(module))
                        .to_string();
                    module_aliases.insert(bound, module.to_string());
                }
            } else if let Some(capture) = from_pattern.captures(line) {
                let module_spec = capture[1].to_string();
                if let Some(module_path) = resolve_absolute_module(&module_spec, &package_parts) {
                    let names = capture[2].trim().trim_start_matches('(').trim_end_matches(')');
                    if !names.split(',').any(|name| name.trim() == "*") {
                        for item in names.split(',') {
                            let item = item.trim();
                            if item.is_empty() {
                                continue;
                            }
                            let (original, alias) = match item.split_once(" as ") {
                                Some((original, alias)) => (original.trim(), alias.trim()),
                                None => (item, item),
                            };
                            symbol_aliases.insert(
                                alias.to_string(),
                                (module_path.clone(), original.to_string()),
                            );
                        }
                    }
                }
            }
            i += 1;
        }

        ModuleSummary {
            file_path: file_path.to_path_buf(),
            module_name: module_name.to_string(),
            functions,
            module_aliases,
            symbol_aliases,
        }
    }

    fn call_targets(&self, function_source: &str) -> Vec<CallTarget> {
        let attr_call = Regex::new(r"(?:^|[^\w.])([A-Za-z_]\w*)\.([A-Za-z_]\w*)\s*\(").unwrap();
        let name_call = Regex::new(r"(?:^|[^\w.])([A-Za-z_]\w*)\s*\(").unwrap();

        let mut targets = Vec::new();
        for capture in attr_call.captures_iter(function_source) {
            targets.push(CallTarget::Attr(
                capture[1].to_string(),
                capture[2].to_string(),
            ));
        }
        for capture in name_call.captures_iter(function_source) {
            targets.push(CallTarget::Name(capture[1].to_string()));
        }
        targets
    }
}

/// Resolve a `from`-import module spec (possibly relative) to an absolute
/// dotted module path, given the package parts of the importing module.
fn resolve_absolute_module(module_spec: &str, package_parts: &[&str]) -> Option<String> {
    let level = module_spec.chars().take_while(|&c| c == '.').count();
    let remainder = &module_spec[level..];
    if level == 0 {
        return (!remainder.is_empty()).then(|| remainder.to_string());
    }
    if level - 1 > package_parts.len() {
        return None;
    }
    let mut parts: Vec<&str> = package_parts[..package_parts.len() - (level - 1)].to_vec();
    parts.extend(remainder.split('.').filter(|part| !part.is_empty()));
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("."))
}

/// Collects function closures across the configured Python task directories.
pub struct PyFunctionAnalyzer {
    root_dirs: Vec<Utf8PathBuf>,
    by_path: HashMap<Utf8PathBuf, ModuleSummary>,
    path_by_name: HashMap<String, Utf8PathBuf>,
}

impl PyFunctionAnalyzer {
    pub fn new(root_dirs: Vec<Utf8PathBuf>) -> Self {
        Self {
            root_dirs,
            by_path: HashMap::new(),
            path_by_name: HashMap::new(),
        }
    }

    /// Digest the closure of `function_name` starting at `file_path`. Entries
    /// are sorted by qualified name. Errors here mean the module could not be
    /// scanned or the entry function is missing; callers downgrade to a
    /// file-level digest.
    pub fn build_function_hashes(
        &mut self,
        file_path: &Utf8Path,
        function_name: &str,
    ) -> Result<Vec<CodeHashEntry>, Error> {
        let module_path = self
            .load_module_from_path(file_path)?
            .ok_or_else(|| Error::UnparseableModule(file_path.to_string()))?;
        let summary = &self.by_path[&module_path];
        if !summary.functions.contains_key(function_name) {
            return Err(Error::FunctionNotFound {
                function: function_name.to_string(),
                path: file_path.to_string(),
            });
        }
        let seed = FunctionRef {
            module: summary.module_name.clone(),
            name: function_name.to_string(),
            file_path: module_path.clone(),
        };

        let closure = self.collect_closure(seed);
        let mut refs: Vec<&FunctionRef> = closure.iter().collect();
        refs.sort_by(|a, b| {
            (a.qualname(), a.file_path.as_str()).cmp(&(b.qualname(), b.file_path.as_str()))
        });

        let mut entries = Vec::with_capacity(refs.len());
        for function_ref in refs {
            let Some(source) = self
                .by_path
                .get(&function_ref.file_path)
                .and_then(|summary| summary.functions.get(&function_ref.name))
            else {
                continue;
            };
            entries.push(CodeHashEntry::new(
                function_ref.qualname(),
                crate::hash_bytes(source.as_bytes()),
            ));
        }
        Ok(entries)
    }

    fn collect_closure(&mut self, seed: FunctionRef) -> HashSet<FunctionRef> {
        let mut visited: HashSet<FunctionRef> = HashSet::new();
        let mut stack = vec![seed];
        while let Some(function_ref) = stack.pop() {
            if !visited.insert(function_ref.clone()) {
                continue;
            }
            let Ok(Some(path)) = self.load_module_from_path(&function_ref.file_path) else {
                continue;
            };
            let Some(source) = self.by_path[&path].functions.get(&function_ref.name).cloned()
            else {
                continue;
            };
            let targets = self.by_path[&path].call_targets(&source);
            for target in targets {
                if let Some(dep) = self.resolve_call_target(&path, target) {
                    if !visited.contains(&dep) {
                        stack.push(dep);
                    }
                }
            }
        }
        visited
    }

    fn resolve_call_target(
        &mut self,
        summary_path: &Utf8Path,
        target: CallTarget,
    ) -> Option<FunctionRef> {
        match target {
            CallTarget::Name(name) => {
                let summary = self.by_path.get(summary_path)?;
                if summary.functions.contains_key(&name) {
                    return Some(FunctionRef {
                        module: summary.module_name.clone(),
                        name,
                        file_path: summary.file_path.clone(),
                    });
                }
                let (module_name, original) = summary.symbol_aliases.get(&name)?.clone();
                let module_path = self.load_module_by_name(&module_name)?;
                let module_summary = self.by_path.get(&module_path)?;
                module_summary
                    .functions
                    .contains_key(&original)
                    .then(|| FunctionRef {
                        module: module_summary.module_name.clone(),
                        name: original,
                        file_path: module_summary.file_path.clone(),
                    })
            }
            CallTarget::Attr(base, attr) => {
                let summary = self.by_path.get(summary_path)?;
                let module_name = summary
                    .module_aliases
                    .get(&base)
                    .cloned()
                    .or_else(|| summary.symbol_aliases.get(&base).map(|(m, _)| m.clone()))?;
                let module_path = self.load_module_by_name(&module_name)?;
                let module_summary = self.by_path.get(&module_path)?;
                module_summary.functions.contains_key(&attr).then(|| FunctionRef {
                    module: module_summary.module_name.clone(),
                    name: attr,
                    file_path: module_summary.file_path.clone(),
                })
            }
        }
    }

    fn load_module_from_path(&mut self, file_path: &Utf8Path) -> Result<Option<Utf8PathBuf>, Error> {
        if self.by_path.contains_key(file_path) {
            return Ok(Some(file_path.to_path_buf()));
        }
        let Ok(source) = std::fs::read_to_string(file_path) else {
            return Ok(None);
        };
        let module_name = self.infer_module_name(file_path).unwrap_or_default();
        let summary = ModuleSummary::parse(file_path, &module_name, &source);
        if !summary.module_name.is_empty() {
            self.path_by_name
                .insert(summary.module_name.clone(), file_path.to_path_buf());
        }
        self.by_path.insert(file_path.to_path_buf(), summary);
        Ok(Some(file_path.to_path_buf()))
    }

    fn load_module_by_name(&mut self, module_name: &str) -> Option<Utf8PathBuf> {
        if let Some(path) = self.path_by_name.get(module_name) {
            return Some(path.clone());
        }
        let file_path = self.find_module_path(module_name)?;
        let source = std::fs::read_to_string(&file_path).ok()?;
        let summary = ModuleSummary::parse(&file_path, module_name, &source);
        self.path_by_name
            .insert(module_name.to_string(), file_path.clone());
        self.by_path.insert(file_path.clone(), summary);
        Some(file_path)
    }

    fn infer_module_name(&self, file_path: &Utf8Path) -> Option<String> {
        for root in &self.root_dirs {
            let Ok(relative) = file_path.strip_prefix(root) else {
                continue;
            };
            let trimmed: Utf8PathBuf = if relative.file_stem() == Some("__init__") {
                relative
                    .parent()
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or_default()
            } else {
                relative.with_extension("")
            };
            let parts: Vec<&str> = trimmed
                .components()
                .map(|component| component.as_str())
                .filter(|part| !part.is_empty())
                .collect();
            if parts.is_empty() {
                return None;
            }
            return Some(parts.join("."));
        }
        None
    }

    fn find_module_path(&self, module_name: &str) -> Option<Utf8PathBuf> {
        let relative: Utf8PathBuf = module_name.split('.').collect();
        for root in &self.root_dirs {
            let candidate = root.join(&relative).with_extension("py");
            if candidate.exists() {
                return Some(candidate);
            }
            let init_candidate = root.join(&relative).join("__init__.py");
            if init_candidate.exists() {
                return Some(init_candidate);
            }
        }
        None
    }
}

/// Closure hashes for the entry function, downgrading to a file-level digest
/// on any scan failure.
pub fn py_code_hashes_or_file(
    analyzer: &mut PyFunctionAnalyzer,
    task_name: &str,
    file_path: &Utf8Path,
    function_name: &str,
) -> Result<Vec<CodeHashEntry>, Error> {
    match analyzer.build_function_hashes(file_path, function_name) {
        Ok(entries) => Ok(entries),
        Err(error) => {
            warn!("Falling back to file hash for {task_name} due to {error}");
            let digest = crate::hash_file(file_path)?;
            Ok(vec![CodeHashEntry::new("__file__", digest)])
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write(dir: &Utf8Path, name: &str, contents: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_collects_local_helper_functions() {
        let (_guard, root) = tempdir();
        let task = write(
            &root,
            "process.py",
            "def helper():\n    return 1\n\ndef process():\n    return helper()\n",
        );

        let mut analyzer = PyFunctionAnalyzer::new(vec![root.clone()]);
        let entries = analyzer.build_function_hashes(&task, "process").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["process.helper", "process.process"]);
    }

    #[test]
    fn test_follows_from_imports_across_modules() {
        let (_guard, root) = tempdir();
        write(&root, "utils.py", "def shared():\n    return 2\n");
        let task = write(
            &root,
            "process.py",
            "from utils import shared\n\ndef process():\n    return shared()\n",
        );

        let mut analyzer = PyFunctionAnalyzer::new(vec![root.clone()]);
        let entries = analyzer.build_function_hashes(&task, "process").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["process.process", "utils.shared"]);
    }

    #[test]
    fn test_follows_module_alias_attribute_calls() {
        let (_guard, root) = tempdir();
        write(&root, "helpers.py", "def transform():\n    return 3\n");
        let task = write(
            &root,
            "process.py",
            "import helpers as h\n\ndef process():\n    return h.transform()\n",
        );

        let mut analyzer = PyFunctionAnalyzer::new(vec![root.clone()]);
        let entries = analyzer.build_function_hashes(&task, "process").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["helpers.transform", "process.process"]);
    }

    #[test]
    fn test_changed_helper_changes_digest() {
        let (_guard, root) = tempdir();
        let task = write(
            &root,
            "process.py",
            "def helper():\n    return 1\n\ndef process():\n    return helper()\n",
        );
        let mut analyzer = PyFunctionAnalyzer::new(vec![root.clone()]);
        let before = analyzer.build_function_hashes(&task, "process").unwrap();

        write(
            &root,
            "process.py",
            "def helper():\n    return 99\n\ndef process():\n    return helper()\n",
        );
        let mut analyzer = PyFunctionAnalyzer::new(vec![root.clone()]);
        let after = analyzer.build_function_hashes(&task, "process").unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_function_is_an_error() {
        let (_guard, root) = tempdir();
        let task = write(&root, "process.py", "def other():\n    return 1\n");

        let mut analyzer = PyFunctionAnalyzer::new(vec![root.clone()]);
        let result = analyzer.build_function_hashes(&task, "process");
        assert!(matches!(result, Err(Error::FunctionNotFound { .. })));
    }

    #[test]
    fn test_fallback_produces_file_entry() {
        let (_guard, root) = tempdir();
        let task = write(&root, "process.py", "x = 1\n");

        let mut analyzer = PyFunctionAnalyzer::new(vec![root.clone()]);
        let entries = py_code_hashes_or_file(&mut analyzer, "process", &task, "process").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "__file__");
    }

    #[test]
    fn test_cyclic_calls_terminate() {
        let (_guard, root) = tempdir();
        let task = write(
            &root,
            "process.py",
            "def a():\n    return b()\n\ndef b():\n    return a()\n\ndef process():\n    return a()\n",
        );

        let mut analyzer = PyFunctionAnalyzer::new(vec![root.clone()]);
        let entries = analyzer.build_function_hashes(&task, "process").unwrap();
        assert_eq!(entries.len(), 3);
    }
}
