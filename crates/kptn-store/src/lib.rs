//! kptn-store: the shared task-state store.
//!
//! One [`StateStore`] contract, two backends: DynamoDB for multi-writer cloud
//! pipelines and SQLite for single-node runs. Task records, taskdata bins,
//! subset bins and subtask bins all share the BIN_SIZE framing from [`bins`].

mod bins;
/// DynamoDB backend (single table, PK/SK layout).
pub mod dynamodb;
/// In-process store used as a test double and for ephemeral runs.
pub mod memory;
mod models;
/// SQLite backend (WAL-mode file next to kptn.yaml).
pub mod sqlite;

use async_trait::async_trait;
use camino::Utf8Path;
use thiserror::Error;

pub use crate::{
    bins::{bin_ids_for, bin_location, chunk_list, chunk_subtask_keys, BinKind, BIN_SIZE},
    dynamodb::DynamoStore,
    memory::MemoryStore,
    models::{Subtask, TaskCompletion, TaskState, TaskStateUpdate, TaskStatus},
    sqlite::SqliteStore,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("DynamoDB error for {context}: {message}")]
    Dynamo { context: String, message: String },
    #[error("failed to serialize stored payload")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid task status: {status}")]
    InvalidStatus { status: String },
    #[error("subtask index {index} out of range for bin {bin_id} of task '{task}'")]
    SubtaskIndexOutOfRange {
        task: String,
        bin_id: String,
        index: usize,
    },
    #[error("unsupported database type: {0}. Supported types are: dynamodb, sqlite")]
    UnsupportedDbType(String),
    #[error("unable to determine a writable database directory")]
    NoDatabaseDir,
}

impl Error {
    pub(crate) fn dynamo(context: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Error::Dynamo {
            context: context.into(),
            message: error.to_string(),
        }
    }
}

/// ISO-8601 timestamp for `start_time`/`end_time`/`updated_at` stamps.
pub fn now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// The DynamoDB table name: `DYNAMODB_TABLE_NAME`, defaulting to `tasks`.
pub fn table_name_from_env() -> String {
    std::env::var("DYNAMODB_TABLE_NAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "tasks".to_string())
}

/// Backend-agnostic CRUD over task records and their bins. Implementations
/// serialise updates per task record; callers must not cache `TaskState`
/// across operations.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upsert the task row. When `data` is given it is also stored as
    /// TASKDATABIN(s) and the taskdata counter reflects its length.
    async fn create_task(
        &self,
        task_name: &str,
        state: &TaskState,
        data: Option<&serde_json::Value>,
    ) -> Result<(), Error>;

    /// Fetch the task row with counters populated. With `include_data`, the
    /// `data` field is loaded from bins; in subset mode a SUBSETBIN is
    /// preferred when one exists.
    async fn get_task(
        &self,
        task_name: &str,
        include_data: bool,
        subset_mode: bool,
    ) -> Result<Option<TaskState>, Error>;

    /// All task rows for this store's pipeline.
    async fn get_tasks(&self) -> Result<Vec<TaskState>, Error>;

    /// Merge-update the provided columns and stamp `updated_at`.
    async fn update_task(&self, task_name: &str, update: &TaskStateUpdate) -> Result<(), Error>;

    /// Delete the task row and every bin it owns. Idempotent.
    async fn delete_task(&self, task_name: &str) -> Result<(), Error>;

    /// Store a payload as bins of the given kind. Lists are chunked; scalars
    /// land in bin "0".
    async fn create_taskdata(
        &self,
        task_name: &str,
        data: &serde_json::Value,
        kind: BinKind,
    ) -> Result<(), Error>;

    /// Reassemble a task's stored payload. Returns `Null` when no bins exist.
    async fn get_taskdata(
        &self,
        task_name: &str,
        subset_mode: bool,
    ) -> Result<serde_json::Value, Error>;

    /// Write one SUBTASKBIN per chunk of `keys`; each element is `{i, key}`.
    /// The subtask counter is updated unless suppressed.
    async fn create_subtasks(
        &self,
        task_name: &str,
        keys: &[String],
        update_count: bool,
    ) -> Result<(), Error>;

    /// Ordered subtasks reassembled from all SUBTASKBINs.
    async fn get_subtasks(&self, task_name: &str) -> Result<Vec<Subtask>, Error>;

    /// Stamp `startTime` on the element at the global index.
    async fn set_subtask_started(&self, task_name: &str, index: usize) -> Result<(), Error>;

    /// Stamp `endTime` (and `outputHash` when given) on the element at the
    /// global index.
    async fn set_subtask_ended(
        &self,
        task_name: &str,
        index: usize,
        output_hash: Option<&str>,
    ) -> Result<(), Error>;

    /// Write terminal fields. In subset mode with a result the payload goes
    /// to SUBSETBIN(s) and `end_time` is left untouched.
    async fn set_task_ended(
        &self,
        task_name: &str,
        completion: TaskCompletion,
    ) -> Result<(), Error>;

    /// Keep only the subtasks whose key is in `keys`, with time and hash
    /// fields reset, and rewrite the bins.
    async fn reset_subset_of_subtasks(
        &self,
        task_name: &str,
        keys: &[String],
    ) -> Result<(), Error>;

    /// Delete all bins of one kind for a task.
    async fn delete_bins(&self, task_name: &str, kind: BinKind) -> Result<(), Error>;

    /// Drop any cached subset payload for a task.
    async fn delete_subsetdata(&self, task_name: &str) -> Result<(), Error> {
        self.delete_bins(task_name, BinKind::Subset).await
    }
}

/// Which backend a pipeline stores its state in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Dynamodb,
    Sqlite,
}

impl DbType {
    /// Resolve the backend: the `KPTN_DB_TYPE` environment variable wins,
    /// then the `settings.db` config field, then DynamoDB. Unknown values
    /// fail loudly.
    pub fn resolve(configured: Option<&str>) -> Result<Self, Error> {
        Self::resolve_with(std::env::var("KPTN_DB_TYPE").ok().as_deref(), configured)
    }

    fn resolve_with(env_override: Option<&str>, configured: Option<&str>) -> Result<Self, Error> {
        let candidate = env_override
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or_else(|| configured.map(str::trim).filter(|value| !value.is_empty()));
        match candidate.map(str::to_lowercase).as_deref() {
            None | Some("dynamodb") => Ok(DbType::Dynamodb),
            Some("sqlite") => Ok(DbType::Sqlite),
            Some(other) => Err(Error::UnsupportedDbType(other.to_string())),
        }
    }
}

/// Construct the configured backend.
pub async fn init_store(
    db_type: DbType,
    table_name: &str,
    storage_key: &str,
    pipeline: &str,
    tasks_config_path: Option<&Utf8Path>,
) -> Result<Box<dyn StateStore>, Error> {
    match db_type {
        DbType::Dynamodb => Ok(Box::new(
            DynamoStore::new(table_name, storage_key, pipeline).await?,
        )),
        DbType::Sqlite => {
            let db_path = sqlite::resolve_db_path(tasks_config_path, storage_key, pipeline)?;
            Ok(Box::new(
                SqliteStore::new(&db_path, storage_key, pipeline).await?,
            ))
        }
    }
}
