//! Task specs as written in the `tasks` block of `kptn.yaml`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Implementation language of a task, chosen by its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLanguage {
    Python,
    R,
    DuckdbSql,
}

impl TaskLanguage {
    /// Human label used in "<Kind> code changed" decision reasons.
    pub fn kind_label(&self) -> &'static str {
        match self {
            TaskLanguage::Python => "Python",
            TaskLanguage::R => "R",
            TaskLanguage::DuckdbSql => "DuckDB SQL",
        }
    }

    /// Identifier handed to runtime-config factories as `task_lang`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskLanguage::Python => "python",
            TaskLanguage::R => "r",
            TaskLanguage::DuckdbSql => "duckdb_sql",
        }
    }
}

/// Split a `file: "path[:func]"` entry into its path and optional function.
pub fn parse_file_spec(file_spec: &str) -> (String, Option<String>) {
    let spec = file_spec.trim();
    match spec.rsplit_once(':') {
        Some((path, func)) if !func.trim().is_empty() => {
            (path.trim().to_string(), Some(func.trim().to_string()))
        }
        Some((path, _)) => (path.trim().to_string(), None),
        None => (spec.to_string(), None),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeSpec {
    pub cpu: Option<serde_json::Value>,
    pub memory: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub mode: Option<String>,
}

/// One task's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// `path[:func]`; the extension picks the language.
    pub file: Option<String>,
    /// Store the task's returned data in the cache for consumers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_result: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_flow: Option<bool>,
    /// Comma-separated key spec turning this into a mapped task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_over: Option<String>,
    /// Keyword under which consumers receive one element of this task's list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterable_item: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_size: Option<usize>,
    /// Static kwargs; `{ref: "<dep>"}` values alias a dependency's data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<IndexMap<String, serde_json::Value>>,
    /// Output globs and/or `duckdb://` targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSpec>,
    /// Custom log path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_args: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_args: Option<String>,
}

impl TaskDefinition {
    /// The script path, without any `:func` suffix.
    pub fn file_path(&self, task_name: &str) -> Result<String, Error> {
        let file = self.file.as_deref().ok_or_else(|| Error::MissingFile {
            task: task_name.to_string(),
        })?;
        Ok(parse_file_spec(file).0)
    }

    /// The declared function name, if the `file` entry carries one.
    pub fn function_name(&self, task_name: &str) -> Result<Option<String>, Error> {
        let file = self.file.as_deref().ok_or_else(|| Error::MissingFile {
            task: task_name.to_string(),
        })?;
        Ok(parse_file_spec(file).1)
    }

    pub fn language(&self, task_name: &str) -> Result<TaskLanguage, Error> {
        let path = self.file_path(task_name)?;
        let suffix = std::path::Path::new(&path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match suffix.as_str() {
            "py" | "pyw" => Ok(TaskLanguage::Python),
            "r" => Ok(TaskLanguage::R),
            "sql" => Ok(TaskLanguage::DuckdbSql),
            _ => Err(Error::UnsupportedExtension {
                task: task_name.to_string(),
                file: path,
                suffix,
            }),
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.map_over.is_some()
    }

    pub fn returns_list(&self) -> bool {
        self.iterable_item.is_some()
    }

    pub fn should_cache_result(&self) -> bool {
        self.cache_result == Some(true)
    }

    pub fn on_main_flow(&self) -> bool {
        self.main_flow == Some(true)
    }

    /// `(prefix_args, cli_args)` for R script invocation.
    pub fn cli_args(&self) -> (String, String) {
        (
            self.prefix_args.clone().unwrap_or_default(),
            self.cli_args.clone().unwrap_or_default(),
        )
    }
}
