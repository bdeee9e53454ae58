//! kptn-config: pipeline settings and the runtime-config resolver.
//!
//! The `settings` block of `kptn.yaml` (with its environment overrides) lives
//! here, together with [`PipelineOptions`] — the per-run identity every other
//! subsystem is handed — and the resolver that turns the `config` block into
//! materialised runtime values.

mod registry;
mod runtime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

pub use crate::{
    registry::{Factory, FactoryRegistry, RuntimeValue, TaskInfo},
    runtime::RuntimeConfig,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("configuration setting '{setting}' {reason}")]
    InvalidDirSetting { setting: String, reason: String },
    #[error(
        "multiple graphs found ({graphs}) in {path}. Please specify the pipeline name explicitly."
    )]
    AmbiguousPipeline { graphs: String, path: String },
    #[error("config block must decode to a mapping")]
    ConfigBlockNotMapping,
    #[error("config include '{0}' did not decode to a mapping")]
    IncludeNotMapping(String),
    #[error("config include '{include}' not found at {resolved}")]
    IncludeNotFound { include: String, resolved: String },
    #[error("include must be a string or list of strings")]
    InvalidInclude,
    #[error("alias '{0}' is not a valid identifier")]
    InvalidAlias(String),
    #[error("config entry defines conflicting 'alias' and 'parameter_name' values")]
    ConflictingAlias,
    #[error("config entry cannot define both 'value' and 'function'")]
    EntryValueAndFunction,
    #[error("config entry must define either 'value' or 'function'")]
    EntryMissingValue,
    #[error("config entry 'function' must be a 'module:attr' reference, got {0}")]
    MalformedCallable(String),
    #[error("config entry mapping contains unsupported keys: {0}")]
    UnsupportedEntryKeys(String),
    #[error("no factory registered for '{0}'")]
    UnknownFactory(String),
    #[error("factory '{key}' failed: {message}")]
    FactoryFailed { key: String, message: String },
    #[error("resource values are only supported as whole config entries (offending key: {0})")]
    NestedResource(String),
    #[error("DuckDB config mapping must define a 'function' entry")]
    DuckdbEntryMissingFunction,
    #[error("alias definitions are not supported {0}")]
    AliasNotSupported(&'static str),
}

impl Error {
    pub(crate) fn io(path: impl AsRef<Utf8Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_string(),
            source,
        }
    }
}

/// A directory setting that may be written as a single string or a list.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DirSetting {
    #[default]
    Unset,
    One(String),
    Many(Vec<String>),
}

impl DirSetting {
    /// Normalise to a list, rejecting blank entries and empty lists.
    pub fn normalise(&self, setting_name: &str) -> Result<Vec<String>, Error> {
        let raw: Vec<&String> = match self {
            DirSetting::Unset => return Ok(Vec::new()),
            DirSetting::One(entry) => vec![entry],
            DirSetting::Many(entries) => entries.iter().collect(),
        };
        let mut normalised = Vec::with_capacity(raw.len());
        for entry in raw {
            let cleaned = entry.trim();
            if cleaned.is_empty() {
                return Err(Error::InvalidDirSetting {
                    setting: setting_name.to_string(),
                    reason: "contains an empty directory entry".to_string(),
                });
            }
            normalised.push(cleaned.to_string());
        }
        if normalised.is_empty() {
            return Err(Error::InvalidDirSetting {
                setting: setting_name.to_string(),
                reason: "must contain at least one directory".to_string(),
            });
        }
        Ok(normalised)
    }
}

/// How the outer dispatcher composes task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowType {
    #[default]
    Vanilla,
    Prefect,
    Stepfunctions,
}

impl FlowType {
    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "prefect" => FlowType::Prefect,
            "stepfunctions" => FlowType::Stepfunctions,
            _ => FlowType::Vanilla,
        }
    }
}

/// The `settings` block of `kptn.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    pub flow_type: Option<String>,
    pub db: Option<String>,
    pub flows_dir: Option<String>,
    #[serde(default)]
    pub py_tasks_dir: DirSetting,
    #[serde(default)]
    pub r_tasks_dir: DirSetting,
    pub duckdb_tasks_dir: Option<String>,
    pub storage_key: Option<String>,
    pub branch: Option<String>,
    pub cache_namespace: Option<String>,
}

impl Settings {
    /// Extract the `settings` block from a parsed `kptn.yaml` document.
    pub fn from_document(document: &serde_yaml::Value) -> Result<Self, Error> {
        match document.get("settings") {
            Some(block) => {
                serde_yaml::from_value(block.clone()).map_err(|error| Error::Parse {
                    path: "settings".to_string(),
                    message: error.to_string(),
                })
            }
            None => Ok(Settings::default()),
        }
    }

    /// Extract the `settings` block from a merged JSON document.
    pub fn from_json_document(document: &serde_json::Value) -> Result<Self, Error> {
        match document.get("settings") {
            Some(block) => {
                serde_json::from_value(block.clone()).map_err(|error| Error::Parse {
                    path: "settings".to_string(),
                    message: error.to_string(),
                })
            }
            None => Ok(Settings::default()),
        }
    }

    /// The effective flow type, honoring the `KPTN_FLOW_TYPE` environment
    /// override. Unknown values fall back to vanilla.
    pub fn effective_flow_type(&self) -> FlowType {
        if let Ok(env_value) = std::env::var("KPTN_FLOW_TYPE") {
            if !env_value.trim().is_empty() {
                return FlowType::parse(&env_value);
            }
        }
        self.flow_type
            .as_deref()
            .map(FlowType::parse)
            .unwrap_or_default()
    }
}

/// Per-run identity: which pipeline, which storage key, where the config and
/// task sources live, and whether the run is scoped to a subset.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub pipeline_name: String,
    pub storage_key: String,
    pub branch: String,
    pub subset_mode: bool,
    pub tasks_config_path: Utf8PathBuf,
    pub py_tasks_dirs: Vec<Utf8PathBuf>,
    pub r_tasks_dirs: Vec<Utf8PathBuf>,
}

impl PipelineOptions {
    /// Build options from a config path, deriving the pipeline name from the
    /// config's graphs when exactly one exists and resolving task directories
    /// from the settings block.
    pub fn from_config_path(
        tasks_config_path: &Utf8Path,
        pipeline_name: Option<&str>,
    ) -> Result<Self, Error> {
        let document = read_yaml_document(tasks_config_path)?;
        let settings = Settings::from_document(&document)?;
        let config_dir = tasks_config_path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."));

        let pipeline_name = match pipeline_name {
            Some(name) => name.to_string(),
            None => derive_pipeline_name(&document, tasks_config_path)?,
        };

        let resolve_dirs = |setting: &DirSetting, name: &str| -> Result<Vec<Utf8PathBuf>, Error> {
            Ok(setting
                .normalise(name)?
                .into_iter()
                .map(|entry| {
                    let path = Utf8Path::new(&entry);
                    if path.is_absolute() {
                        path.to_path_buf()
                    } else {
                        config_dir.join(path)
                    }
                })
                .collect())
        };

        Ok(PipelineOptions {
            pipeline_name,
            storage_key: settings.storage_key.clone().unwrap_or_default(),
            branch: settings.branch.clone().unwrap_or_default(),
            subset_mode: false,
            tasks_config_path: tasks_config_path.to_path_buf(),
            py_tasks_dirs: resolve_dirs(&settings.py_tasks_dir, "py_tasks_dir")?,
            r_tasks_dirs: resolve_dirs(&settings.r_tasks_dir, "r_tasks_dir")?,
        })
    }

    /// The key namespacing all cached state: the explicit storage key, or the
    /// branch when none is set.
    pub fn storage_key(&self) -> &str {
        if self.storage_key.is_empty() {
            &self.branch
        } else {
            &self.storage_key
        }
    }

    /// Where output files land: `$SCRATCH_DIR/<storage_key>` when the
    /// environment provides a scratch root, else `scratch/<storage_key>`
    /// under the config directory.
    pub fn scratch_dir(&self) -> Utf8PathBuf {
        let storage_key = self.storage_key();
        if let Ok(root) = std::env::var("SCRATCH_DIR") {
            if !root.trim().is_empty() {
                return Utf8PathBuf::from(root).join(storage_key);
            }
        }
        let base = self
            .tasks_config_path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        base.join("scratch").join(storage_key)
    }
}

pub(crate) fn read_yaml_document(path: &Utf8Path) -> Result<serde_yaml::Value, Error> {
    let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_yaml::from_str(&contents).map_err(|error| Error::Parse {
        path: path.to_string(),
        message: error.to_string(),
    })
}

fn derive_pipeline_name(
    document: &serde_yaml::Value,
    path: &Utf8Path,
) -> Result<String, Error> {
    let graphs = document
        .get("graphs")
        .and_then(serde_yaml::Value::as_mapping)
        .cloned()
        .unwrap_or_default();
    let names: Vec<String> = graphs
        .keys()
        .filter_map(|key| key.as_str().map(str::to_string))
        .collect();
    match names.as_slice() {
        [single] => Ok(single.clone()),
        [] => Ok(String::new()),
        many => {
            let mut sorted = many.to_vec();
            sorted.sort();
            Err(Error::AmbiguousPipeline {
                graphs: sorted.join(", "),
                path: path.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_dir_setting_accepts_string_or_list() {
        let one = DirSetting::One("src".to_string());
        assert_eq!(one.normalise("py_tasks_dir").unwrap(), vec!["src"]);

        let many = DirSetting::Many(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(many.normalise("py_tasks_dir").unwrap(), vec!["a", "b"]);

        assert_eq!(
            DirSetting::Unset.normalise("py_tasks_dir").unwrap(),
            Vec::<String>::new()
        );
    }

    #[test]
    fn test_dir_setting_rejects_blank_entries() {
        let bad = DirSetting::Many(vec!["src".to_string(), "  ".to_string()]);
        assert!(bad.normalise("r_tasks_dir").is_err());
        assert!(DirSetting::Many(Vec::new()).normalise("r_tasks_dir").is_err());
    }

    #[test]
    fn test_flow_type_parse_falls_back_to_vanilla() {
        assert_eq!(FlowType::parse("prefect"), FlowType::Prefect);
        assert_eq!(FlowType::parse("StepFunctions"), FlowType::Stepfunctions);
        assert_eq!(FlowType::parse("dask"), FlowType::Vanilla);
    }

    #[test]
    fn test_pipeline_name_derivation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(dir.path().join("kptn.yaml"))?;
        std::fs::write(
            &path,
            "settings:\n  storage_key: main\ngraphs:\n  only_flow:\n    tasks:\n      a:\n",
        )?;

        let options = PipelineOptions::from_config_path(&path, None)?;
        assert_eq!(options.pipeline_name, "only_flow");
        assert_eq!(options.storage_key(), "main");
        Ok(())
    }

    #[test]
    fn test_multiple_graphs_require_explicit_name() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(dir.path().join("kptn.yaml"))?;
        std::fs::write(
            &path,
            "graphs:\n  one:\n    tasks: {a: }\n  two:\n    tasks: {b: }\n",
        )?;

        let error = PipelineOptions::from_config_path(&path, None).unwrap_err();
        assert!(error.to_string().contains("one, two"));

        let explicit = PipelineOptions::from_config_path(&path, Some("two"))?;
        assert_eq!(explicit.pipeline_name, "two");
        Ok(())
    }

    #[test]
    fn test_storage_key_falls_back_to_branch() {
        let options = PipelineOptions {
            branch: "feature-x".to_string(),
            ..Default::default()
        };
        assert_eq!(options.storage_key(), "feature-x");
    }

    #[test]
    fn test_task_dirs_resolve_relative_to_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(dir.path().join("kptn.yaml"))?;
        std::fs::write(
            &path,
            "settings:\n  py_tasks_dir: py_tasks\n  r_tasks_dir: [r_tasks, shared]\ngraphs:\n  flow:\n    tasks: {a: }\n",
        )?;

        let options = PipelineOptions::from_config_path(&path, None)?;
        let base = path.parent().unwrap();
        assert_eq!(options.py_tasks_dirs, vec![base.join("py_tasks")]);
        assert_eq!(
            options.r_tasks_dirs,
            vec![base.join("r_tasks"), base.join("shared")]
        );
        Ok(())
    }
}
