//! kptn-decider: JSON request/response wrapper around `evaluate_submission`,
//! usable from an AWS Lambda or in-process by external schedulers.

use std::collections::{BTreeMap, HashMap, HashSet};

use camino::Utf8PathBuf;
use kptn_cache::TaskStateCache;
use kptn_config::PipelineOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task_name is required")]
    MissingTaskName,
    #[error("TASKS_CONFIG_PATH is required")]
    MissingConfigPath,
    #[error("PIPELINE_NAME is required")]
    MissingPipelineName,
    #[error("pipeline_config must be a mapping if provided")]
    InvalidOverrides,
    #[error("malformed decision request: {0}")]
    InvalidEvent(String),
    #[error(transparent)]
    Cache(#[from] kptn_cache::Error),
    #[error(transparent)]
    Config(#[from] kptn_config::Error),
}

/// The task selection filter: a list, a comma-separated string, or a map of
/// name to selected.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TaskList {
    Names(Vec<String>),
    Csv(String),
    Selection(HashMap<String, bool>),
}

impl TaskList {
    /// The selected task names; an empty set means "no filter".
    pub fn selected(&self) -> HashSet<String> {
        match self {
            TaskList::Names(names) => names
                .iter()
                .map(|name| name.trim())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            TaskList::Csv(text) => text
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            TaskList::Selection(map) => map
                .iter()
                .filter(|(_, selected)| **selected)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }
}

/// A decision request. Unknown fields are ignored so the schema can grow;
/// a `state` payload merges in first, with top-level fields winning.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionRequest {
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub task_list: Option<TaskList>,
    #[serde(default)]
    pub ignore_cache: Option<bool>,
    #[serde(default)]
    pub execution_mode: Option<String>,
    #[serde(default, rename = "TASKS_CONFIG_PATH")]
    pub tasks_config_path: Option<String>,
    #[serde(default, rename = "PIPELINE_NAME")]
    pub pipeline_name: Option<String>,
    #[serde(default)]
    pub pipeline_config: Option<serde_json::Value>,
    #[serde(default)]
    pub parameters: Option<BTreeMap<String, serde_json::Value>>,
}

impl DecisionRequest {
    /// Parse an event, merging any `state` payload underneath the top-level
    /// fields.
    pub fn from_event(event: &serde_json::Value) -> Result<Self, Error> {
        let merged = match event {
            serde_json::Value::Object(map) => {
                let mut base = match map.get("state") {
                    Some(serde_json::Value::Object(state)) => state.clone(),
                    _ => serde_json::Map::new(),
                };
                for (key, value) in map {
                    if key == "state" {
                        continue;
                    }
                    base.insert(key.clone(), value.clone());
                }
                serde_json::Value::Object(base)
            }
            other => other.clone(),
        };
        serde_json::from_value(merged).map_err(|error| Error::InvalidEvent(error.to_string()))
    }

    pub fn task_name(&self) -> Result<&str, Error> {
        self.task_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(Error::MissingTaskName)
    }

    /// Build pipeline options from the request, applying `pipeline_config`
    /// overrides. Fails before any store access when the preconditions are
    /// missing.
    pub fn pipeline_options(&self) -> Result<PipelineOptions, Error> {
        let config_path = self
            .tasks_config_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .ok_or(Error::MissingConfigPath)?;
        let pipeline_name = self
            .pipeline_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(Error::MissingPipelineName)?;

        let mut options = PipelineOptions::from_config_path(
            &Utf8PathBuf::from(config_path),
            Some(pipeline_name),
        )?;

        match &self.pipeline_config {
            None | Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::Object(overrides)) => {
                if let Some(subset) = overrides.get("SUBSET_MODE").and_then(|v| v.as_bool()) {
                    options.subset_mode = subset;
                }
                if let Some(storage_key) = overrides.get("STORAGE_KEY").and_then(|v| v.as_str()) {
                    options.storage_key = storage_key.to_string();
                }
                if let Some(branch) = overrides.get("BRANCH").and_then(|v| v.as_str()) {
                    options.branch = branch.to_string();
                }
            }
            Some(_) => return Err(Error::InvalidOverrides),
        }
        Ok(options)
    }
}

/// The wire response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub task_name: String,
    pub should_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
}

/// Decide whether a task should run. A non-empty `task_list` that omits the
/// task short-circuits without consulting the cache.
pub async fn decide_task_execution(
    cache: &TaskStateCache,
    event: &serde_json::Value,
) -> Result<DecisionResponse, Error> {
    let request = DecisionRequest::from_event(event)?;
    let task_name = request.task_name()?.to_string();

    if let Some(task_list) = &request.task_list {
        let selected = task_list.selected();
        if !selected.is_empty() && !selected.contains(&task_name) {
            return Ok(DecisionResponse {
                task_name,
                should_run: false,
                reason: Some("Task not selected".to_string()),
                array_size: None,
                execution_mode: None,
            });
        }
    }

    let parameters = request.parameters.clone().unwrap_or_default();
    let ignore_cache = request.ignore_cache.unwrap_or(false);
    let decision = cache
        .evaluate_submission(&task_name, &parameters, ignore_cache)
        .await?;

    Ok(DecisionResponse {
        task_name,
        should_run: decision.should_run,
        reason: decision.reason,
        array_size: decision.array_size,
        execution_mode: request.execution_mode.clone(),
    })
}
