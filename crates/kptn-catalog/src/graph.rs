//! Graph definitions, dependency-spec normalisation, and `extends`
//! flattening.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::Error;

/// One entry in a graph's task map: `null`, a single dependency name, a list
/// of names, or a structured `{deps, args}` object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DepSpec {
    One(String),
    Many(Vec<String>),
    Structured {
        #[serde(default)]
        deps: Option<Box<DepSpec>>,
        #[serde(default)]
        args: Option<IndexMap<String, serde_json::Value>>,
    },
    Null,
}

impl Default for DepSpec {
    fn default() -> Self {
        DepSpec::Null
    }
}

impl DepSpec {
    /// Normalised dependency list: `null -> []`, string -> `[string]`, lists
    /// with empty strings removed.
    pub fn deps(&self) -> Vec<String> {
        match self {
            DepSpec::Null => Vec::new(),
            DepSpec::One(name) => {
                let trimmed = name.trim();
                if trimmed.is_empty() {
                    Vec::new()
                } else {
                    vec![trimmed.to_string()]
                }
            }
            DepSpec::Many(names) => names
                .iter()
                .map(|name| name.trim())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            DepSpec::Structured { deps, .. } => {
                deps.as_deref().map(DepSpec::deps).unwrap_or_default()
            }
        }
    }

    /// Per-task argument overrides carried by a structured spec.
    pub fn args(&self) -> Option<&IndexMap<String, serde_json::Value>> {
        match self {
            DepSpec::Structured { args, .. } => args.as_ref(),
            _ => None,
        }
    }
}

/// An `extends` entry: a parent graph name, optionally with per-task
/// argument overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ExtendsEntry {
    Name(String),
    WithArgs {
        graph: String,
        #[serde(default)]
        args: IndexMap<String, IndexMap<String, serde_json::Value>>,
    },
}

impl ExtendsEntry {
    fn graph(&self) -> &str {
        match self {
            ExtendsEntry::Name(name) => name,
            ExtendsEntry::WithArgs { graph, .. } => graph,
        }
    }
}

/// `extends` may be a single graph name or a list of entries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ExtendsSpec {
    One(String),
    Many(Vec<ExtendsEntry>),
}

impl ExtendsSpec {
    fn entries(&self) -> Vec<ExtendsEntry> {
        match self {
            ExtendsSpec::One(name) => vec![ExtendsEntry::Name(name.clone())],
            ExtendsSpec::Many(entries) => entries.clone(),
        }
    }
}

/// A graph as written in YAML. `extends`-only graphs are legal.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub extends: Option<ExtendsSpec>,
    #[serde(default)]
    pub tasks: IndexMap<String, DepSpec>,
}

/// A graph after `extends` flattening: the full task map plus any per-task
/// argument overrides contributed by structured specs and extends entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatGraph {
    pub tasks: IndexMap<String, DepSpec>,
    pub arg_overrides: IndexMap<String, IndexMap<String, serde_json::Value>>,
}

impl FlatGraph {
    pub fn dep_list(&self, task_name: &str) -> Option<Vec<String>> {
        self.tasks.get(task_name).map(DepSpec::deps)
    }
}

/// Flatten one graph: post-order DFS over its parents with cycle detection.
/// Parents merge first (first occurrence wins within one level); the child's
/// own tasks override.
pub fn flatten_graph(
    graphs: &IndexMap<String, GraphDefinition>,
    name: &str,
) -> Result<FlatGraph, Error> {
    let mut visiting = Vec::new();
    let flat = flatten_inner(graphs, name, &mut visiting)?;
    validate_dependencies(name, &flat)?;
    Ok(flat)
}

fn flatten_inner(
    graphs: &IndexMap<String, GraphDefinition>,
    name: &str,
    visiting: &mut Vec<String>,
) -> Result<FlatGraph, Error> {
    if visiting.iter().any(|seen| seen == name) {
        return Err(Error::ExtendsCycle {
            graph: name.to_string(),
        });
    }
    let graph = graphs.get(name).ok_or_else(|| {
        let mut available: Vec<&str> = graphs.keys().map(String::as_str).collect();
        available.sort_unstable();
        Error::UnknownGraph {
            name: name.to_string(),
            available: available.join(", "),
        }
    })?;

    visiting.push(name.to_string());
    let mut flat = FlatGraph::default();

    if let Some(extends) = &graph.extends {
        for entry in extends.entries() {
            let parent = flatten_inner(graphs, entry.graph(), visiting)?;
            for (task, spec) in parent.tasks {
                if !flat.tasks.contains_key(&task) {
                    flat.tasks.insert(task, spec);
                }
            }
            for (task, overrides) in parent.arg_overrides {
                flat.arg_overrides.entry(task).or_insert(overrides);
            }
            if let ExtendsEntry::WithArgs { args, .. } = entry {
                for (task, overrides) in args {
                    merge_overrides(&mut flat.arg_overrides, task, overrides);
                }
            }
        }
    }

    for (task, spec) in &graph.tasks {
        if let Some(overrides) = spec.args() {
            merge_overrides(&mut flat.arg_overrides, task.clone(), overrides.clone());
        }
        flat.tasks.insert(task.clone(), spec.clone());
    }

    visiting.pop();
    Ok(flat)
}

fn merge_overrides(
    target: &mut IndexMap<String, IndexMap<String, serde_json::Value>>,
    task: String,
    overrides: IndexMap<String, serde_json::Value>,
) {
    let entry = target.entry(task).or_default();
    for (key, value) in overrides {
        entry.insert(key, value);
    }
}

fn validate_dependencies(graph_name: &str, flat: &FlatGraph) -> Result<(), Error> {
    for (task, spec) in &flat.tasks {
        for dep in spec.deps() {
            if !flat.tasks.contains_key(&dep) {
                return Err(Error::UnknownDependency {
                    graph: graph_name.to_string(),
                    task: task.clone(),
                    dep,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn graphs(yaml: &str) -> IndexMap<String, GraphDefinition> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_dep_spec_normalisation() {
        assert_eq!(DepSpec::Null.deps(), Vec::<String>::new());
        assert_eq!(DepSpec::One("a".to_string()).deps(), vec!["a"]);
        assert_eq!(
            DepSpec::Many(vec!["a".to_string(), "".to_string(), "b".to_string()]).deps(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_flatten_merges_and_overrides() {
        let graphs = graphs(
            "base:\n  tasks:\n    a:\n    b: a\nother:\n  tasks:\n    b:\n    c: b\nchild:\n  extends: [base, other]\n  tasks:\n    d: [b, c]\n",
        );

        let flat = flatten_graph(&graphs, "child").unwrap();
        let keys: Vec<&str> = flat.tasks.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
        // First occurrence wins; 'b' stays from the base graph.
        assert_eq!(flat.tasks["b"], DepSpec::One("a".to_string()));
        assert_eq!(flat.dep_list("d"), Some(vec!["b".to_string(), "c".to_string()]));
    }

    #[test]
    fn test_flatten_allows_extends_only() {
        let graphs = graphs("base:\n  tasks:\n    a:\n    b: a\nchild:\n  extends: base\n");
        let flat = flatten_graph(&graphs, "child").unwrap();
        let keys: Vec<&str> = flat.tasks.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_flatten_is_idempotent_on_flat_graphs() {
        let graphs = graphs("flat:\n  tasks:\n    a:\n    b: a\n");
        let once = flatten_graph(&graphs, "flat").unwrap();

        let mut reconstructed = IndexMap::new();
        reconstructed.insert(
            "flat".to_string(),
            GraphDefinition {
                extends: None,
                tasks: once.tasks.clone(),
            },
        );
        let twice = flatten_graph(&reconstructed, "flat").unwrap();
        assert_eq!(once.tasks, twice.tasks);
    }

    #[test]
    fn test_flatten_detects_cycles() {
        let graphs = graphs(
            "one:\n  extends: two\n  tasks:\n    a:\ntwo:\n  extends: one\n  tasks:\n    b:\n",
        );
        let error = flatten_graph(&graphs, "one").unwrap_err();
        assert!(matches!(error, Error::ExtendsCycle { .. }));
        assert!(error.to_string().contains("Cycle detected in graph inheritance"));
    }

    #[test]
    fn test_flatten_rejects_unknown_dependencies() {
        let graphs = graphs("base:\n  tasks:\n    a: missing\n");
        let error = flatten_graph(&graphs, "base").unwrap_err();
        assert!(error.to_string().contains("unknown task 'missing'"));
    }

    #[test]
    fn test_extends_args_override_reaches_flat_graph() {
        let graphs = graphs(
            "base:\n  tasks:\n    a:\nchild:\n  extends:\n    - graph: base\n      args:\n        a:\n          foo: override\n",
        );
        let flat = flatten_graph(&graphs, "child").unwrap();
        assert_eq!(flat.arg_overrides["a"]["foo"], json!("override"));
    }

    #[test]
    fn test_structured_dep_spec_contributes_overrides() {
        let graphs = graphs(
            "pipe:\n  tasks:\n    a:\n      deps: []\n      args:\n        x: 1\n    b: a\n",
        );
        let flat = flatten_graph(&graphs, "pipe").unwrap();
        assert_eq!(flat.dep_list("a"), Some(Vec::new()));
        assert_eq!(flat.dep_list("b"), Some(vec!["a".to_string()]));
        assert_eq!(flat.arg_overrides["a"]["x"], json!(1));
    }

    #[test]
    fn test_unknown_graph_lists_available() {
        let graphs = graphs("base:\n  tasks:\n    a:\n");
        let error = flatten_graph(&graphs, "nope").unwrap_err();
        assert!(error.to_string().contains("base"));
    }
}
