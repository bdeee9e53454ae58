//! kptn-cache: the task state cache.
//!
//! Binds the catalog, the fingerprinting engine, the state store and the
//! runtime config into the decision procedure (`evaluate_submission`), the
//! state transitions (`set_initial_state` / `set_final_state`), and the
//! mapped-task coordinator the executors drive.

pub mod batch;
mod dep_data;
mod handles;
mod outcome;
pub mod parallel;
mod sql;
mod task_handle;
pub mod vanilla;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use kptn_catalog::{Catalog, TaskDefinition, TaskLanguage};
use kptn_config::{FactoryRegistry, PipelineOptions, RuntimeConfig, Settings, TaskInfo};
use kptn_hash::{CodeHashEntry, DuckdbEngine, OutputContext, PyFunctionAnalyzer};
use kptn_store::{StateStore, TaskState, TaskStateUpdate, TaskStatus};
use thiserror::Error;
use tracing::{debug, info};

pub use crate::{
    dep_data::{fetch_cached_dep_data, DependencyData},
    handles::{DuckdbResource, DuckdbSqlHandle, RScriptHandle},
    outcome::{combine_statuses, overall_status, SubtaskOutcome},
    task_handle::{
        arg_data, plan_call, FnTaskHandle, ParamKind, ParamSpec, TaskArgs, TaskHandle,
        TaskRegistry,
    },
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Catalog(#[from] kptn_catalog::Error),
    #[error(transparent)]
    Config(#[from] kptn_config::Error),
    #[error(transparent)]
    Store(#[from] kptn_store::Error),
    #[error(transparent)]
    Hash(#[from] kptn_hash::Error),
    #[error("Task '{task}' callable is missing required arguments: {missing}")]
    MissingArguments { task: String, missing: String },
    #[error("Task '{task}' path parameter '{param}' must be bound to a string value")]
    PathParamNotString { task: String, param: String },
    #[error("no task callable registered for Python task '{task}'")]
    NoHandle { task: String },
    #[error("task '{task}' failed: {message}")]
    TaskFailed { task: String, message: String },
    #[error("task '{task}' subtasks failed:\n{messages}")]
    SubtaskErrors { task: String, messages: String },
    #[error("mapped task '{task}' finished with status {status}")]
    MappedTaskFailed { task: String, status: TaskStatus },
    #[error("Task {task} is not a mapped task and cannot be run as a batch array subtask")]
    NotMapped { task: String },
    #[error("AWS_BATCH_JOB_ARRAY_INDEX is not set; not running as a batch array task")]
    BatchIndexMissing,
    #[error("Invalid AWS_BATCH_JOB_ARRAY_INDEX value: {0}")]
    BatchIndexInvalid(String),
    #[error("Batch array index {index} out of bounds for task_size {size}")]
    BatchIndexOutOfBounds { index: usize, size: usize },
    #[error("Task {task} has no items to map over")]
    EmptyIterable { task: String },
}

/// Outcome of evaluating whether a task should be submitted for execution.
#[derive(Debug, Clone)]
pub struct TaskSubmissionDecision {
    pub task_name: String,
    pub task: TaskDefinition,
    pub cached_state: Option<TaskState>,
    pub should_run: bool,
    pub reason: Option<String>,
    /// For mapped tasks that should run: the iterable length, when the
    /// dependency data makes it knowable.
    pub array_size: Option<usize>,
}

/// The decision engine and execution coordinator. Constructed explicitly
/// from its parts and passed by handle; holds no global state.
pub struct TaskStateCache {
    options: PipelineOptions,
    catalog: Catalog,
    store: Arc<dyn StateStore>,
    factories: FactoryRegistry,
    tasks: TaskRegistry,
    settings: Settings,
    analyzer: Mutex<PyFunctionAnalyzer>,
    /// Whether each task had cached state when its run started; consumed by
    /// `set_final_state` to decide output hashing.
    prior_runs: Mutex<HashMap<String, bool>>,
    duckdb_tasks_dir: Utf8PathBuf,
}

impl TaskStateCache {
    pub fn new(
        options: PipelineOptions,
        catalog: Catalog,
        store: Arc<dyn StateStore>,
        factories: FactoryRegistry,
        tasks: TaskRegistry,
    ) -> Result<Self, Error> {
        let settings = Settings::from_json_document(catalog.document())?;
        let tasks_root = options
            .tasks_config_path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."));
        let duckdb_tasks_dir = match &settings.duckdb_tasks_dir {
            Some(dir) => {
                let dir_path = Utf8Path::new(dir);
                if dir_path.is_absolute() {
                    dir_path.to_path_buf()
                } else {
                    tasks_root.join(dir_path)
                }
            }
            None => tasks_root.clone(),
        };

        let mut py_roots: Vec<Utf8PathBuf> = options.py_tasks_dirs.clone();
        for base in catalog.base_dirs() {
            if !py_roots.contains(base) {
                py_roots.push(base.clone());
            }
        }
        if !py_roots.contains(&tasks_root) {
            py_roots.push(tasks_root);
        }

        Ok(Self {
            options,
            catalog,
            store,
            factories,
            tasks,
            settings,
            analyzer: Mutex::new(PyFunctionAnalyzer::new(py_roots)),
            prior_runs: Mutex::new(HashMap::new()),
            duckdb_tasks_dir,
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subset_mode(&self) -> bool {
        self.options.subset_mode
    }

    pub fn pipeline_name(&self) -> &str {
        &self.options.pipeline_name
    }

    pub fn get_task(&self, name: &str) -> Result<&TaskDefinition, Error> {
        Ok(self.catalog.get_task(name)?)
    }

    pub fn task_language(&self, name: &str) -> Result<TaskLanguage, Error> {
        Ok(self.get_task(name)?.language(name)?)
    }

    /// Names of a task's dependencies within the active pipeline.
    pub fn dep_list(&self, task_name: &str) -> Result<Vec<String>, Error> {
        Ok(self.catalog.dep_list(self.pipeline_name(), task_name)?)
    }

    /// Cached states of a task's dependencies.
    pub async fn dep_states(
        &self,
        task_name: &str,
    ) -> Result<Vec<(String, Option<TaskState>)>, Error> {
        let mut states = Vec::new();
        for dep in self.dep_list(task_name)? {
            let state = self.fetch_state(&dep).await?;
            states.push((dep, state));
        }
        Ok(states)
    }

    /// A task's static args within the active pipeline, graph overrides
    /// applied.
    pub fn task_args(
        &self,
        task_name: &str,
    ) -> Result<Option<indexmap::IndexMap<String, serde_json::Value>>, Error> {
        Ok(self.catalog.task_args(self.pipeline_name(), task_name)?)
    }

    pub async fn fetch_state(&self, task_name: &str) -> Result<Option<TaskState>, Error> {
        Ok(self
            .store
            .get_task(task_name, true, self.subset_mode())
            .await?)
    }

    pub async fn delete_state(&self, task_name: &str) -> Result<(), Error> {
        Ok(self.store.delete_task(task_name).await?)
    }

    // ------------------------------------------------------------------
    // Mapped-task helpers
    // ------------------------------------------------------------------

    pub fn is_mapped_task(&self, task_name: &str) -> Result<bool, Error> {
        Ok(self.get_task(task_name)?.is_mapped())
    }

    pub fn get_map_over_key(&self, task_name: &str) -> Result<Option<String>, Error> {
        Ok(self.get_task(task_name)?.map_over.clone())
    }

    /// Number of elements a mapped task will iterate over, when its
    /// dependency data is cached.
    pub async fn get_map_over_count(&self, task_name: &str) -> Result<Option<usize>, Error> {
        if !self.is_mapped_task(task_name)? {
            return Ok(None);
        }
        let dep_data = fetch_cached_dep_data(self, task_name).await?;
        Ok(dep_data.map_over_count)
    }

    /// The subtask key for one set of kwargs: the map_over value, comma-joined
    /// across multi-key specs. `None` when any key is missing.
    pub fn get_key_value(
        &self,
        task_name: &str,
        kwargs: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Option<String>, Error> {
        let Some(key_name) = self.get_map_over_key(task_name)? else {
            return Ok(None);
        };
        let keys: Vec<&str> = key_name.split(',').map(str::trim).collect();
        let mut parts = Vec::with_capacity(keys.len());
        for key in keys {
            match kwargs.get(key) {
                Some(value) => parts.push(dep_data::value_to_key_string(value)),
                None => return Ok(None),
            }
        }
        Ok(Some(parts.join(",")))
    }

    pub fn has_mapped_task_deps(&self, task_name: &str) -> Result<bool, Error> {
        for dep in self.dep_list(task_name)? {
            if self.task_returns_list(&dep)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn task_returns_list(&self, task_name: &str) -> Result<bool, Error> {
        Ok(self.get_task(task_name)?.returns_list())
    }

    // ------------------------------------------------------------------
    // Fingerprinting
    // ------------------------------------------------------------------

    /// Build the code hash entries for a task, by language.
    pub fn build_code_hashes(
        &self,
        task_name: &str,
    ) -> Result<(Vec<CodeHashEntry>, TaskLanguage), Error> {
        let task = self.get_task(task_name)?;
        let language = task.language(task_name)?;
        let file_path = task.file_path(task_name)?;

        let entries = match language {
            TaskLanguage::R => {
                let search_dirs = self.r_search_dirs(task_name);
                let (paths, base_dir) =
                    kptn_hash::locate_r_scripts(task_name, &file_path, &search_dirs)?;
                info!("Building R code hashes for {task_name}, paths: {paths:?}");
                kptn_hash::hash_r_files(&paths, &base_dir)?
            }
            TaskLanguage::Python => {
                let search_dirs = self.py_search_dirs(task_name);
                let script = kptn_hash::locate_py_script(task_name, &file_path, &search_dirs)?;
                info!("Building Python code hashes for {task_name}, path: {script}");
                let function_name = self.py_func_name(task_name)?;
                let mut analyzer = self
                    .analyzer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                kptn_hash::py_code_hashes_or_file(
                    &mut analyzer,
                    task_name,
                    &script,
                    &function_name,
                )?
            }
            TaskLanguage::DuckdbSql => {
                let script = self.resolve_sql_path(task_name, &file_path)?;
                let digest = kptn_hash::hash_file(&script)?;
                let tasks_root = self.tasks_root();
                let relative = script
                    .strip_prefix(&tasks_root)
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or_else(|_| script.clone());
                vec![CodeHashEntry::new(relative.as_str(), digest)]
            }
        };
        Ok((entries, language))
    }

    /// The entry function name of a Python task: the `file` spec's suffix, or
    /// the task name.
    pub fn py_func_name(&self, task_name: &str) -> Result<String, Error> {
        let task = self.get_task(task_name)?;
        Ok(task
            .function_name(task_name)?
            .unwrap_or_else(|| task_name.to_string()))
    }

    fn tasks_root(&self) -> Utf8PathBuf {
        self.options
            .tasks_config_path
            .parent()
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| Utf8PathBuf::from("."))
    }

    fn r_search_dirs(&self, task_name: &str) -> Vec<Utf8PathBuf> {
        let mut dirs = Vec::new();
        if let Some(root) = self.catalog.task_root(task_name) {
            dirs.push(root.to_path_buf());
        }
        dirs.extend(self.catalog.base_dirs().iter().cloned());
        dirs.extend(self.options.r_tasks_dirs.iter().cloned());
        let tasks_root = self.tasks_root();
        if !dirs.contains(&tasks_root) {
            dirs.push(tasks_root);
        }
        dirs
    }

    fn py_search_dirs(&self, task_name: &str) -> Vec<Utf8PathBuf> {
        let mut dirs = Vec::new();
        if let Some(root) = self.catalog.task_root(task_name) {
            dirs.push(root.to_path_buf());
        }
        dirs.extend(self.catalog.base_dirs().iter().cloned());
        dirs.extend(self.options.py_tasks_dirs.iter().cloned());
        let tasks_root = self.tasks_root();
        if !dirs.contains(&tasks_root) {
            dirs.push(tasks_root);
        }
        dirs
    }

    fn resolve_sql_path(&self, task_name: &str, file_path: &str) -> Result<Utf8PathBuf, Error> {
        let mut search_dirs = vec![self.duckdb_tasks_dir.clone()];
        let tasks_root = self.tasks_root();
        if !search_dirs.contains(&tasks_root) {
            search_dirs.push(tasks_root);
        }
        Ok(kptn_hash::locate_sql_script(
            task_name, file_path, &search_dirs,
        )?)
    }

    /// Resolve the runtime config, optionally scoped to a task.
    pub fn runtime_config(&self, task_name: Option<&str>) -> Result<RuntimeConfig, Error> {
        let task_info = match task_name {
            Some(name) => Some(TaskInfo {
                task_name: Some(name.to_string()),
                task_lang: Some(self.task_language(name)?.as_str().to_string()),
            }),
            None => None,
        };
        Ok(RuntimeConfig::resolve(
            &self.catalog.config_block(),
            &self.tasks_root(),
            &self.factories,
            task_info.as_ref(),
        )?)
    }

    /// The DuckDB engine from a resolved runtime config, when one is
    /// registered under `duckdb`.
    pub fn duckdb_engine(&self, runtime: &RuntimeConfig) -> Option<Arc<dyn DuckdbEngine>> {
        runtime
            .resource::<DuckdbResource>("duckdb")
            .map(|resource| resource.0.clone())
    }

    /// Hash a task's declared outputs against the scratch directory and any
    /// DuckDB targets.
    pub fn hash_task_outputs(
        &self,
        task_name: &str,
        runtime: &RuntimeConfig,
    ) -> Result<Option<String>, Error> {
        let task = self.get_task(task_name)?;
        let Some(outputs) = &task.outputs else {
            return Ok(None);
        };
        let scratch = self.options.scratch_dir();
        let engine = self.duckdb_engine(runtime);
        let context = OutputContext {
            scratch_dir: Some(&scratch),
            duckdb: engine.as_deref(),
        };
        Ok(kptn_hash::hash_task_outputs(context, outputs)?)
    }

    /// Hash one subtask's outputs, placeholders resolved from its kwargs.
    pub fn hash_subtask_outputs(
        &self,
        task_name: &str,
        runtime: &RuntimeConfig,
        kwargs: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Option<String>, Error> {
        let task = self.get_task(task_name)?;
        let Some(outputs) = &task.outputs else {
            return Ok(None);
        };
        let scratch = self.options.scratch_dir();
        let engine = self.duckdb_engine(runtime);
        let context = OutputContext {
            scratch_dir: Some(&scratch),
            duckdb: engine.as_deref(),
        };
        Ok(kptn_hash::hash_subtask_outputs(context, outputs, kwargs)?)
    }

    /// Map each dependency to its current `outputs_version`. `None` when no
    /// dependency has one.
    pub fn input_hashes(
        dep_states: &[(String, Option<TaskState>)],
    ) -> Option<BTreeMap<String, String>> {
        let tree: BTreeMap<String, String> = dep_states
            .iter()
            .filter_map(|(dep, state)| {
                state
                    .as_ref()
                    .and_then(|state| state.outputs_version.clone())
                    .map(|version| (dep.clone(), version))
            })
            .collect();
        if tree.is_empty() {
            None
        } else {
            Some(tree)
        }
    }

    /// Map each dependency to its current `output_data_version`.
    pub fn input_data_hashes(
        dep_states: &[(String, Option<TaskState>)],
    ) -> Option<BTreeMap<String, String>> {
        let tree: BTreeMap<String, String> = dep_states
            .iter()
            .filter_map(|(dep, state)| {
                state
                    .as_ref()
                    .and_then(|state| state.output_data_version.clone())
                    .map(|version| (dep.clone(), version))
            })
            .collect();
        if tree.is_empty() {
            None
        } else {
            Some(tree)
        }
    }

    /// Canonical stored form of a hash tree; its digest is the version the
    /// cache compares.
    fn hash_tree_string(tree: &Option<BTreeMap<String, String>>) -> Option<String> {
        tree.as_ref()
            .and_then(|tree| serde_json::to_string(tree).ok())
    }

    fn hash_tree_digest(tree: &Option<BTreeMap<String, String>>) -> Option<String> {
        Self::hash_tree_string(tree).map(|text| kptn_hash::hash_bytes(text.as_bytes()))
    }

    // ------------------------------------------------------------------
    // Decision procedure
    // ------------------------------------------------------------------

    /// Decide whether a task must run. Never executes the task; the first
    /// matching reason wins.
    pub async fn evaluate_submission(
        &self,
        task_name: &str,
        parameters: &BTreeMap<String, serde_json::Value>,
        ignore_cache: bool,
    ) -> Result<TaskSubmissionDecision, Error> {
        debug!("evaluate_submission({task_name}, {parameters:?}, ignore_cache={ignore_cache})");
        let task = self.get_task(task_name)?.clone();
        let cached_state = self.fetch_state(task_name).await?;
        let (code_hashes, language) = self.build_code_hashes(task_name)?;

        let reason = if cached_state.is_none() {
            Some("No cached state".to_string())
        } else if ignore_cache {
            Some("ignore_cache is set".to_string())
        } else if self.subset_mode() {
            Some("Subset mode".to_string())
        } else if cached_state.as_ref().and_then(|state| state.status)
            == Some(TaskStatus::Failure)
        {
            Some("Task previously failed all subtasks".to_string())
        } else if self.code_changed(&code_hashes, cached_state.as_ref(), language) {
            Some(format!("{} code changed", language.kind_label()))
        } else {
            let dep_states = self.dep_states(task_name).await?;
            let cached = cached_state
                .as_ref()
                .expect("cached state present past the first rung");
            let input_tree = Self::input_hashes(&dep_states);
            let data_tree = Self::input_data_hashes(&dep_states);
            info!("{task_name} inputs_version_tree: {input_tree:?}");
            info!("task={task_name} data_version_tree={data_tree:?}");

            if Self::hash_tree_digest(&input_tree) != cached.inputs_version() {
                Some("Inputs changed".to_string())
            } else if Self::hash_tree_digest(&data_tree) != cached.input_data_version() {
                Some("Data changed".to_string())
            } else if cached.status == Some(TaskStatus::Incomplete) {
                Some("INCOMPLETE".to_string())
            } else if cached.end_time.is_none() {
                Some("Not finished".to_string())
            } else {
                None
            }
        };

        let should_run = reason.is_some();
        let array_size = if should_run && task.is_mapped() {
            self.get_map_over_count(task_name).await?
        } else {
            None
        };

        Ok(TaskSubmissionDecision {
            task_name: task_name.to_string(),
            task,
            cached_state,
            should_run,
            reason,
            array_size,
        })
    }

    fn code_changed(
        &self,
        code_hashes: &[CodeHashEntry],
        cached_state: Option<&TaskState>,
        language: TaskLanguage,
    ) -> bool {
        let Some(cached) = cached_state else {
            return true;
        };
        let latest_version = kptn_hash::code_version(code_hashes);
        let cached_version = cached.code_version();
        if latest_version != cached_version {
            info!(
                "{} code changed: {:?} (local={:?}) != {:?} (cached={:?})",
                language.kind_label(),
                code_hashes,
                latest_version,
                cached.code_hashes,
                cached_version,
            );
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    /// Write the minimal starting record and remember whether the task had
    /// prior runs. In subset mode, Python and DuckDB SQL tasks only create
    /// the record when none exists.
    pub async fn set_initial_state(&self, task_name: &str) -> Result<TaskState, Error> {
        let initial_state = TaskState {
            start_time: Some(kptn_store::now_iso()),
            ..Default::default()
        };
        let existing = self
            .store
            .get_task(task_name, false, self.subset_mode())
            .await?;
        self.prior_runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(task_name.to_string(), existing.is_some());

        let language = self.task_language(task_name)?;
        let create_only_if_missing = self.subset_mode()
            && matches!(language, TaskLanguage::Python | TaskLanguage::DuckdbSql);
        if existing.is_some() {
            // Refresh the start stamp without disturbing counters or status.
            if !create_only_if_missing {
                let update = TaskStateUpdate {
                    start_time: initial_state.start_time.clone(),
                    ..Default::default()
                };
                self.store.update_task(task_name, &update).await?;
            }
        } else {
            self.store.create_task(task_name, &initial_state, None).await?;
        }
        Ok(initial_state)
    }

    /// Recompute hashes and write terminal fields. Output hashing only
    /// happens when the task had prior runs, so a first completion never
    /// compares against itself.
    pub async fn set_final_state(
        &self,
        task_name: &str,
        status: Option<TaskStatus>,
    ) -> Result<(), Error> {
        let dep_states = self.dep_states(task_name).await?;
        let input_tree = Self::input_hashes(&dep_states);
        let data_tree = Self::input_data_hashes(&dep_states);

        let should_hash_outputs = self
            .prior_runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(task_name)
            .unwrap_or(false);
        let outputs_version = if should_hash_outputs {
            let runtime = self.runtime_config(Some(task_name))?;
            self.hash_task_outputs(task_name, &runtime)?
        } else {
            None
        };

        // This runs in the task's own process, which may not be the one that
        // made the decision; recompute code hashes so they are current.
        let (code_hashes, _) = self.build_code_hashes(task_name)?;

        let update = TaskStateUpdate {
            code_hashes: if code_hashes.is_empty() {
                None
            } else {
                serde_json::to_value(&code_hashes).ok()
            },
            outputs_version,
            input_hashes: Self::hash_tree_string(&input_tree),
            input_data_hashes: Self::hash_tree_string(&data_tree),
            status,
            ..Default::default()
        };
        // output_data_version was already written by set_task_ended.
        Ok(self.store.update_task(task_name, &update).await?)
    }

    // ------------------------------------------------------------------
    // Task handles
    // ------------------------------------------------------------------

    /// The executable handle for a task: the registered one when present,
    /// else a built-in R or DuckDB SQL runner derived from the catalog.
    pub fn task_handle(&self, task_name: &str) -> Result<Arc<dyn TaskHandle>, Error> {
        if let Some(handle) = self.tasks.get(task_name) {
            return Ok(handle);
        }
        let task = self.get_task(task_name)?;
        match task.language(task_name)? {
            TaskLanguage::R => {
                let file_path = task.file_path(task_name)?;
                let search_dirs = self.r_search_dirs(task_name);
                let (paths, _) = kptn_hash::locate_r_scripts(task_name, &file_path, &search_dirs)?;
                let script = paths
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Utf8PathBuf::from(file_path));
                let (prefix_args, cli_args) = task.cli_args();
                let log_path = task.logs.as_deref().map(Utf8PathBuf::from);
                Ok(Arc::new(RScriptHandle::new(
                    task_name, script, prefix_args, cli_args, log_path,
                )))
            }
            TaskLanguage::DuckdbSql => {
                let file_path = task.file_path(task_name)?;
                let script = self.resolve_sql_path(task_name, &file_path)?;
                let runtime = self.runtime_config(Some(task_name))?;
                let mut parameters = runtime.data_entries();
                parameters.remove("duckdb");
                Ok(Arc::new(DuckdbSqlHandle::new(task_name, script, parameters)))
            }
            TaskLanguage::Python => Err(Error::NoHandle {
                task: task_name.to_string(),
            }),
        }
    }
}
