//! kptn-catalog: loads and merges `kptn.yaml` task/graph definitions.
//!
//! Multiple config files deep-merge into one catalog (leaf conflicts are
//! errors), graphs flatten their `extends` chains, and dependency specs
//! normalise to plain lists.

mod arguments;
mod graph;
mod task_definition;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use thiserror::Error;

pub use crate::{
    arguments::{build_task_argument_plan, resolve_dependency_key, TaskArgumentPlan},
    graph::{flatten_graph, DepSpec, ExtendsEntry, ExtendsSpec, FlatGraph, GraphDefinition},
    task_definition::{parse_file_spec, ComputeSpec, ExecutionSpec, TaskDefinition, TaskLanguage},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("tasks config file {path} not found")]
    ConfigNotFound { path: String },
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("conflict at {path} while merging task configs")]
    MergeConflict { path: String },
    #[error("Task '{name}' not found in list of tasks, [{available}]")]
    UnknownTask { name: String, available: String },
    #[error("Graph '{name}' not found; available graphs: {available}")]
    UnknownGraph { name: String, available: String },
    #[error("Task ({task}) not found in list of tasks; pipeline: {pipeline}; pipeline_keys: [{available}]")]
    TaskNotInPipeline {
        task: String,
        pipeline: String,
        available: String,
    },
    #[error("Task '{task}' is missing required 'file' field")]
    MissingFile { task: String },
    #[error("Task '{task}' has unsupported file suffix '{suffix}' for file '{file}'")]
    UnsupportedExtension {
        task: String,
        file: String,
        suffix: String,
    },
    #[error("Cycle detected in graph inheritance involving '{graph}'")]
    ExtendsCycle { graph: String },
    #[error("graph '{graph}': task '{task}' depends on unknown task '{dep}'")]
    UnknownDependency {
        graph: String,
        task: String,
        dep: String,
    },
}

/// The merged task/graph catalog for one pipeline project.
#[derive(Debug, Default)]
pub struct Catalog {
    tasks: IndexMap<String, TaskDefinition>,
    graphs: IndexMap<String, GraphDefinition>,
    /// The full merged document, for settings/config consumers.
    document: serde_json::Value,
    /// Directory of the config file that first defined each task.
    task_roots: IndexMap<String, Utf8PathBuf>,
    base_dirs: Vec<Utf8PathBuf>,
}

impl Catalog {
    /// Load one or more config files and deep-merge them. Key conflicts at
    /// leaf values are errors naming the conflicting path.
    pub fn load(paths: &[Utf8PathBuf]) -> Result<Self, Error> {
        let mut merged = serde_json::Value::Object(serde_json::Map::new());
        let mut task_roots = IndexMap::new();
        let mut base_dirs = Vec::new();

        for path in paths {
            let document = read_document(path)?;
            let base_dir = path
                .parent()
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|| Utf8PathBuf::from("."));
            if let Some(tasks) = document.get("tasks").and_then(serde_json::Value::as_object) {
                for task_name in tasks.keys() {
                    task_roots
                        .entry(task_name.clone())
                        .or_insert_with(|| base_dir.clone());
                }
            }
            if !base_dirs.contains(&base_dir) {
                base_dirs.push(base_dir);
            }
            merge_documents(&mut merged, document, &mut Vec::new())?;
        }

        Self::from_document(merged, task_roots, base_dirs)
    }

    /// Build a catalog from an already-merged document. Used by tests and by
    /// callers that assemble configuration in memory.
    pub fn from_merged_document(document: serde_json::Value) -> Result<Self, Error> {
        Self::from_document(document, IndexMap::new(), Vec::new())
    }

    fn from_document(
        document: serde_json::Value,
        task_roots: IndexMap<String, Utf8PathBuf>,
        base_dirs: Vec<Utf8PathBuf>,
    ) -> Result<Self, Error> {
        let tasks: IndexMap<String, TaskDefinition> = match document.get("tasks") {
            Some(block) => {
                serde_json::from_value(block.clone()).map_err(|error| Error::Parse {
                    path: "tasks".to_string(),
                    message: error.to_string(),
                })?
            }
            None => IndexMap::new(),
        };
        let graphs: IndexMap<String, GraphDefinition> = match document.get("graphs") {
            Some(block) => {
                serde_json::from_value(block.clone()).map_err(|error| Error::Parse {
                    path: "graphs".to_string(),
                    message: error.to_string(),
                })?
            }
            None => IndexMap::new(),
        };

        Ok(Catalog {
            tasks,
            graphs,
            document,
            task_roots,
            base_dirs,
        })
    }

    pub fn get_task(&self, name: &str) -> Result<&TaskDefinition, Error> {
        self.tasks.get(name).ok_or_else(|| {
            let mut available: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
            available.sort_unstable();
            Error::UnknownTask {
                name: name.to_string(),
                available: available.join(", "),
            }
        })
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&str, &TaskDefinition)> {
        self.tasks.iter().map(|(name, task)| (name.as_str(), task))
    }

    pub fn graphs(&self) -> impl Iterator<Item = &str> {
        self.graphs.keys().map(String::as_str)
    }

    /// Flatten a graph's `extends` chain into its full task map.
    pub fn flat_graph(&self, pipeline: &str) -> Result<FlatGraph, Error> {
        flatten_graph(&self.graphs, pipeline)
    }

    /// The normalised dependency list of one task within a pipeline.
    pub fn dep_list(&self, pipeline: &str, task_name: &str) -> Result<Vec<String>, Error> {
        let flat = self.flat_graph(pipeline)?;
        flat.dep_list(task_name).ok_or_else(|| {
            let available: Vec<&str> = flat.tasks.keys().map(String::as_str).collect();
            Error::TaskNotInPipeline {
                task: task_name.to_string(),
                pipeline: pipeline.to_string(),
                available: available.join(", "),
            }
        })
    }

    /// A task's static args within a pipeline: base `args` merged with any
    /// graph-level overrides (extends entries and structured dep specs).
    pub fn task_args(
        &self,
        pipeline: &str,
        task_name: &str,
    ) -> Result<Option<IndexMap<String, serde_json::Value>>, Error> {
        let task = self.get_task(task_name)?;
        let flat = self.flat_graph(pipeline)?;

        let mut merged = task.args.clone().unwrap_or_default();
        if let Some(overrides) = flat.arg_overrides.get(task_name) {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        if merged.is_empty() {
            Ok(None)
        } else {
            Ok(Some(merged))
        }
    }

    /// The argument plan for a task within a pipeline.
    pub fn argument_plan(
        &self,
        pipeline: &str,
        task_name: &str,
    ) -> Result<TaskArgumentPlan, Error> {
        let mut task = self.get_task(task_name)?.clone();
        task.args = self.task_args(pipeline, task_name)?;
        let deps = self.dep_list(pipeline, task_name)?;
        Ok(build_task_argument_plan(&task, &deps))
    }

    /// The merged document, for settings and runtime-config consumers.
    pub fn document(&self) -> &serde_json::Value {
        &self.document
    }

    /// The `config` block of the merged document.
    pub fn config_block(&self) -> serde_json::Map<String, serde_json::Value> {
        self.document
            .get("config")
            .and_then(serde_json::Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// Directory of the config file that defined a task, when known.
    pub fn task_root(&self, task_name: &str) -> Option<&Utf8Path> {
        self.task_roots.get(task_name).map(Utf8PathBuf::as_path)
    }

    /// Directories of all loaded config files, in load order.
    pub fn base_dirs(&self) -> &[Utf8PathBuf] {
        &self.base_dirs
    }
}

fn read_document(path: &Utf8Path) -> Result<serde_json::Value, Error> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_string(),
        });
    }
    tracing::debug!("Reading tasks config from {path}");
    let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_string(),
        source,
    })?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&contents).map_err(|error| Error::Parse {
        path: path.to_string(),
        message: error.to_string(),
    })?;
    serde_json::to_value(yaml).map_err(|error| Error::Parse {
        path: path.to_string(),
        message: error.to_string(),
    })
}

/// Deep-merge `incoming` into `target`. Matching maps merge recursively;
/// equal leaves coexist; unequal leaves conflict.
fn merge_documents(
    target: &mut serde_json::Value,
    incoming: serde_json::Value,
    path: &mut Vec<String>,
) -> Result<(), Error> {
    match (target, incoming) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(incoming_map)) => {
            for (key, incoming_value) in incoming_map {
                match target_map.get_mut(&key) {
                    Some(existing) => {
                        path.push(key);
                        merge_documents(existing, incoming_value, path)?;
                        path.pop();
                    }
                    None => {
                        target_map.insert(key, incoming_value);
                    }
                }
            }
            Ok(())
        }
        (existing, incoming_value) => {
            if *existing == incoming_value {
                Ok(())
            } else {
                Err(Error::MergeConflict {
                    path: path.join("."),
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn write_config(dir: &Utf8Path, name: &str, contents: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    const BASIC: &str = "settings:\n  storage_key: main\ntasks:\n  a:\n    file: tasks/a.py\n  b:\n    file: tasks/b.py\ngraphs:\n  flow:\n    tasks:\n      a:\n      b: a\n";

    #[test]
    fn test_load_single_config() {
        let (_guard, dir) = tempdir();
        let path = write_config(&dir, "kptn.yaml", BASIC);

        let catalog = Catalog::load(&[path]).unwrap();
        assert!(catalog.get_task("a").is_ok());
        assert_eq!(catalog.dep_list("flow", "b").unwrap(), vec!["a"]);
        assert_eq!(catalog.dep_list("flow", "a").unwrap(), Vec::<String>::new());
        assert_eq!(catalog.task_root("a"), Some(dir.as_path()));
    }

    #[test]
    fn test_unknown_task_lists_available() {
        let (_guard, dir) = tempdir();
        let path = write_config(&dir, "kptn.yaml", BASIC);
        let catalog = Catalog::load(&[path]).unwrap();

        let error = catalog.get_task("ghost").unwrap_err();
        assert!(error.to_string().contains("a, b"));
    }

    #[test]
    fn test_unknown_pipeline_task_lists_pipeline_keys() {
        let (_guard, dir) = tempdir();
        let path = write_config(&dir, "kptn.yaml", BASIC);
        let catalog = Catalog::load(&[path]).unwrap();

        let error = catalog.dep_list("flow", "ghost").unwrap_err();
        assert!(matches!(error, Error::TaskNotInPipeline { .. }));
    }

    #[test]
    fn test_merge_combines_configs() {
        let (_guard, dir) = tempdir();
        let first = write_config(&dir, "kptn.yaml", BASIC);
        let second = write_config(
            &dir,
            "extra.yaml",
            "tasks:\n  c:\n    file: tasks/c.py\ngraphs:\n  extra_flow:\n    tasks:\n      c:\n",
        );

        let catalog = Catalog::load(&[first, second]).unwrap();
        assert!(catalog.get_task("c").is_ok());
        assert!(catalog.flat_graph("flow").is_ok());
        assert!(catalog.flat_graph("extra_flow").is_ok());
    }

    #[test]
    fn test_merge_conflict_names_path() {
        let (_guard, dir) = tempdir();
        let first = write_config(&dir, "kptn.yaml", "tasks:\n  a:\n    file: one.py\n");
        let second = write_config(&dir, "other.yaml", "tasks:\n  a:\n    file: two.py\n");

        let error = Catalog::load(&[first, second]).unwrap_err();
        assert!(error.to_string().contains("tasks.a.file"));
    }

    #[test]
    fn test_missing_config_is_error() {
        let error = Catalog::load(&[Utf8PathBuf::from("/nonexistent/kptn.yaml")]).unwrap_err();
        assert!(matches!(error, Error::ConfigNotFound { .. }));
    }

    #[test]
    fn test_task_args_merge_graph_overrides() {
        let document = json!({
            "tasks": {
                "a": {"file": "a.py", "args": {"foo": "base", "bar": 1}}
            },
            "graphs": {
                "base": {"tasks": {"a": null}},
                "child": {
                    "extends": [{"graph": "base", "args": {"a": {"foo": "override"}}}]
                }
            }
        });
        let catalog = Catalog::from_merged_document(document).unwrap();
        let args = catalog.task_args("child", "a").unwrap().unwrap();
        assert_eq!(args["foo"], json!("override"));
        assert_eq!(args["bar"], json!(1));
    }

    #[test]
    fn test_extends_only_graph_resolves_inherited_deps() {
        let document = json!({
            "tasks": {},
            "graphs": {
                "basic": {"tasks": {"a": null, "b": "a", "c": "b"}},
                "extends_only": {"extends": "basic"}
            }
        });
        let catalog = Catalog::from_merged_document(document).unwrap();
        assert_eq!(catalog.dep_list("extends_only", "a").unwrap(), Vec::<String>::new());
        assert_eq!(catalog.dep_list("extends_only", "b").unwrap(), vec!["a"]);
    }
}
