//! SQLite backend: a WAL-mode database file living next to `kptn.yaml`.

use camino::{Utf8Path, Utf8PathBuf};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    QueryBuilder, Row, SqlitePool,
};

use crate::{
    bins, now_iso, BinKind, Error, StateStore, Subtask, TaskCompletion, TaskState,
    TaskStateUpdate, TaskStatus,
};

/// Determine the on-disk path for the database: the directory containing
/// `kptn.yaml` when known, else `./kptn.yaml`'s directory, else
/// `~/.kptn/cache/`. The filename joins the non-empty identifiers, falling
/// back to `cache.db`.
pub fn resolve_db_path(
    tasks_config_path: Option<&Utf8Path>,
    storage_key: &str,
    pipeline: &str,
) -> Result<Utf8PathBuf, Error> {
    let mut candidates: Vec<Utf8PathBuf> = Vec::new();
    if let Some(config_path) = tasks_config_path {
        candidates.push(config_path.to_path_buf());
    }
    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(cwd) = Utf8PathBuf::try_from(cwd) {
            candidates.push(cwd.join("kptn.yaml"));
        }
    }

    let default_dir = candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .and_then(|candidate| candidate.parent().map(Utf8Path::to_path_buf))
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| Utf8PathBuf::from(home).join(".kptn/cache"))
        })
        .ok_or(Error::NoDatabaseDir)?;

    std::fs::create_dir_all(&default_dir).map_err(|_| Error::NoDatabaseDir)?;

    let identifier_parts: Vec<&str> = [storage_key, pipeline]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect();
    let filename = if identifier_parts.is_empty() {
        "cache.db".to_string()
    } else {
        format!("{}.db", identifier_parts.join("_"))
    };
    Ok(default_dir.join(filename))
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    storage_key: String,
    pipeline: String,
}

impl SqliteStore {
    pub async fn new(
        db_path: &Utf8Path,
        storage_key: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_std_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;

        let store = Self {
            pool,
            storage_key: storage_key.into(),
            pipeline: pipeline.into(),
        };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_key TEXT NOT NULL,
                pipeline TEXT NOT NULL,
                task_id TEXT NOT NULL,
                code_hashes TEXT,
                input_hashes TEXT,
                input_data_hashes TEXT,
                outputs_version TEXT,
                output_data_version TEXT,
                status TEXT,
                start_time TEXT,
                end_time TEXT,
                subtask_count INTEGER DEFAULT 0,
                taskdata_count INTEGER DEFAULT 0,
                subset_count INTEGER DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(storage_key, pipeline, task_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS taskdata_bins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_key TEXT NOT NULL,
                pipeline TEXT NOT NULL,
                task_id TEXT NOT NULL,
                bin_type TEXT NOT NULL,
                bin_id TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(storage_key, pipeline, task_id, bin_type, bin_id),
                FOREIGN KEY(storage_key, pipeline, task_id)
                    REFERENCES tasks(storage_key, pipeline, task_id)
                    ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subtask_bins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_key TEXT NOT NULL,
                pipeline TEXT NOT NULL,
                task_id TEXT NOT NULL,
                bin_id TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(storage_key, pipeline, task_id, bin_id),
                FOREIGN KEY(storage_key, pipeline, task_id)
                    REFERENCES tasks(storage_key, pipeline, task_id)
                    ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_pipeline
             ON tasks(storage_key, pipeline)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_taskdata_bins_lookup
             ON taskdata_bins(storage_key, pipeline, task_id, bin_type)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_subtask_bins_lookup
             ON subtask_bins(storage_key, pipeline, task_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task_exists(&self, task_name: &str) -> Result<bool, Error> {
        let row = sqlx::query(
            "SELECT 1 FROM tasks WHERE storage_key = ? AND pipeline = ? AND task_id = ?",
        )
        .bind(&self.storage_key)
        .bind(&self.pipeline)
        .bind(task_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_task(&self, task_name: &str, state: &TaskState) -> Result<(), Error> {
        let now = now_iso();
        let code_hashes = state
            .code_hashes
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO tasks (
               storage_key, pipeline, task_id,
               code_hashes, input_hashes, input_data_hashes,
               outputs_version, output_data_version, status,
               start_time, end_time,
               subtask_count, taskdata_count, subset_count,
               created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.storage_key)
        .bind(&self.pipeline)
        .bind(task_name)
        .bind(code_hashes)
        .bind(&state.input_hashes)
        .bind(&state.input_data_hashes)
        .bind(&state.outputs_version)
        .bind(&state.output_data_version)
        .bind(state.status.map(|status| status.as_ref().to_string()))
        .bind(&state.start_time)
        .bind(&state.end_time)
        .bind(state.subtask_count.unwrap_or(0))
        .bind(state.taskdata_count.unwrap_or(0))
        .bind(state.subset_count.unwrap_or(0))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_state(row: &sqlx::sqlite::SqliteRow) -> Result<TaskState, Error> {
        let code_hashes: Option<String> = row.get("code_hashes");
        let status: Option<String> = row.get("status");
        Ok(TaskState {
            code_hashes: code_hashes
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            input_hashes: row.get("input_hashes"),
            input_data_hashes: row.get("input_data_hashes"),
            outputs_version: row.get("outputs_version"),
            output_data_version: row.get("output_data_version"),
            data: None,
            status: status.as_deref().map(str::parse).transpose()?,
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            updated_at: row.get("updated_at"),
            subtask_count: row.get("subtask_count"),
            taskdata_count: row.get("taskdata_count"),
            subset_count: row.get("subset_count"),
        })
    }

    async fn write_taskdata_bin(
        &self,
        task_name: &str,
        kind: BinKind,
        bin_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), Error> {
        let now = now_iso();
        sqlx::query(
            "INSERT INTO taskdata_bins (
               storage_key, pipeline, task_id, bin_type, bin_id, data, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(storage_key, pipeline, task_id, bin_type, bin_id)
             DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(&self.storage_key)
        .bind(&self.pipeline)
        .bind(task_name)
        .bind(kind.wire_name())
        .bind(bin_id)
        .bind(serde_json::to_string(payload)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_subtask_bin(
        &self,
        task_name: &str,
        bin_id: &str,
        subtasks: &[Subtask],
    ) -> Result<(), Error> {
        let now = now_iso();
        sqlx::query(
            "INSERT INTO subtask_bins (
               storage_key, pipeline, task_id, bin_id, data, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(storage_key, pipeline, task_id, bin_id)
             DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(&self.storage_key)
        .bind(&self.pipeline)
        .bind(task_name)
        .bind(bin_id)
        .bind(serde_json::to_string(subtasks)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read-modify-write one element of a subtask bin inside a transaction.
    async fn mutate_subtask(
        &self,
        task_name: &str,
        index: usize,
        apply: impl FnOnce(&mut Subtask),
    ) -> Result<(), Error> {
        let (bin_id, offset) = bins::bin_location(index);
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT data FROM subtask_bins
             WHERE storage_key = ? AND pipeline = ? AND task_id = ? AND bin_id = ?",
        )
        .bind(&self.storage_key)
        .bind(&self.pipeline)
        .bind(task_name)
        .bind(&bin_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::SubtaskIndexOutOfRange {
            task: task_name.to_string(),
            bin_id: bin_id.clone(),
            index,
        })?;

        let data: String = row.get("data");
        let mut subtasks: Vec<Subtask> = serde_json::from_str(&data)?;
        let subtask = subtasks
            .get_mut(offset)
            .ok_or_else(|| Error::SubtaskIndexOutOfRange {
                task: task_name.to_string(),
                bin_id: bin_id.clone(),
                index,
            })?;
        apply(subtask);

        sqlx::query(
            "UPDATE subtask_bins SET data = ?, updated_at = ?
             WHERE storage_key = ? AND pipeline = ? AND task_id = ? AND bin_id = ?",
        )
        .bind(serde_json::to_string(&subtasks)?)
        .bind(now_iso())
        .bind(&self.storage_key)
        .bind(&self.pipeline)
        .bind(task_name)
        .bind(&bin_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStore {
    async fn create_task(
        &self,
        task_name: &str,
        state: &TaskState,
        data: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        let mut state = state.clone();
        let payload = data.cloned().or_else(|| state.data.take());
        if let Some(serde_json::Value::Array(items)) = &payload {
            state.taskdata_count = Some(items.len() as i64);
        }

        if self.task_exists(task_name).await? {
            let update = TaskStateUpdate {
                code_hashes: state.code_hashes.clone(),
                input_hashes: state.input_hashes.clone(),
                input_data_hashes: state.input_data_hashes.clone(),
                outputs_version: state.outputs_version.clone(),
                output_data_version: state.output_data_version.clone(),
                status: state.status,
                start_time: state.start_time.clone(),
                end_time: state.end_time.clone(),
                subtask_count: state.subtask_count,
                taskdata_count: state.taskdata_count,
                subset_count: state.subset_count,
            };
            self.update_task(task_name, &update).await?;
        } else {
            self.insert_task(task_name, &state).await?;
        }

        if let Some(payload) = payload {
            self.create_taskdata(task_name, &payload, BinKind::Taskdata)
                .await?;
        }
        Ok(())
    }

    async fn get_task(
        &self,
        task_name: &str,
        include_data: bool,
        subset_mode: bool,
    ) -> Result<Option<TaskState>, Error> {
        let row = sqlx::query(
            "SELECT * FROM tasks WHERE storage_key = ? AND pipeline = ? AND task_id = ?",
        )
        .bind(&self.storage_key)
        .bind(&self.pipeline)
        .bind(task_name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut state = Self::row_to_state(&row)?;
        if include_data {
            let data = if subset_mode {
                let subset = self.get_taskdata(task_name, true).await?;
                if subset.is_null() {
                    self.get_taskdata(task_name, false).await?
                } else {
                    subset
                }
            } else {
                self.get_taskdata(task_name, false).await?
            };
            if !data.is_null() {
                state.data = Some(data);
            }
        }
        Ok(Some(state))
    }

    async fn get_tasks(&self) -> Result<Vec<TaskState>, Error> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE storage_key = ? AND pipeline = ?")
            .bind(&self.storage_key)
            .bind(&self.pipeline)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_state).collect()
    }

    async fn update_task(&self, task_name: &str, update: &TaskStateUpdate) -> Result<(), Error> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE tasks SET updated_at = ");
        builder.push_bind(now_iso());
        if let Some(code_hashes) = &update.code_hashes {
            builder.push(", code_hashes = ");
            builder.push_bind(serde_json::to_string(code_hashes)?);
        }
        if let Some(input_hashes) = &update.input_hashes {
            builder.push(", input_hashes = ");
            builder.push_bind(input_hashes.clone());
        }
        if let Some(input_data_hashes) = &update.input_data_hashes {
            builder.push(", input_data_hashes = ");
            builder.push_bind(input_data_hashes.clone());
        }
        if let Some(outputs_version) = &update.outputs_version {
            builder.push(", outputs_version = ");
            builder.push_bind(outputs_version.clone());
        }
        if let Some(output_data_version) = &update.output_data_version {
            builder.push(", output_data_version = ");
            builder.push_bind(output_data_version.clone());
        }
        if let Some(status) = update.status {
            builder.push(", status = ");
            builder.push_bind(status.as_ref().to_string());
        }
        if let Some(start_time) = &update.start_time {
            builder.push(", start_time = ");
            builder.push_bind(start_time.clone());
        }
        if let Some(end_time) = &update.end_time {
            builder.push(", end_time = ");
            builder.push_bind(end_time.clone());
        }
        if let Some(subtask_count) = update.subtask_count {
            builder.push(", subtask_count = ");
            builder.push_bind(subtask_count);
        }
        if let Some(taskdata_count) = update.taskdata_count {
            builder.push(", taskdata_count = ");
            builder.push_bind(taskdata_count);
        }
        if let Some(subset_count) = update.subset_count {
            builder.push(", subset_count = ");
            builder.push_bind(subset_count);
        }
        builder.push(" WHERE storage_key = ");
        builder.push_bind(&self.storage_key);
        builder.push(" AND pipeline = ");
        builder.push_bind(&self.pipeline);
        builder.push(" AND task_id = ");
        builder.push_bind(task_name);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_task(&self, task_name: &str) -> Result<(), Error> {
        // Bins go with the row via ON DELETE CASCADE.
        sqlx::query("DELETE FROM tasks WHERE storage_key = ? AND pipeline = ? AND task_id = ?")
            .bind(&self.storage_key)
            .bind(&self.pipeline)
            .bind(task_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_taskdata(
        &self,
        task_name: &str,
        data: &serde_json::Value,
        kind: BinKind,
    ) -> Result<(), Error> {
        match data {
            serde_json::Value::Array(items) => {
                for (bin_id, chunk) in bins::chunk_list(items) {
                    let payload = serde_json::Value::Array(chunk.to_vec());
                    self.write_taskdata_bin(task_name, kind, &bin_id, &payload)
                        .await?;
                }
            }
            scalar => {
                self.write_taskdata_bin(task_name, kind, "0", scalar).await?;
            }
        }
        Ok(())
    }

    async fn get_taskdata(
        &self,
        task_name: &str,
        subset_mode: bool,
    ) -> Result<serde_json::Value, Error> {
        let kind = if subset_mode {
            BinKind::Subset
        } else {
            BinKind::Taskdata
        };
        let rows = sqlx::query(
            "SELECT data FROM taskdata_bins
             WHERE storage_key = ? AND pipeline = ? AND task_id = ? AND bin_type = ?
             ORDER BY CAST(bin_id AS INTEGER)",
        )
        .bind(&self.storage_key)
        .bind(&self.pipeline)
        .bind(task_name)
        .bind(kind.wire_name())
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        if rows.len() == 1 {
            let data: String = rows[0].get("data");
            return Ok(serde_json::from_str(&data)?);
        }
        let mut combined = Vec::new();
        for row in rows {
            let data: String = row.get("data");
            let value: serde_json::Value = serde_json::from_str(&data)?;
            match value {
                serde_json::Value::Array(items) => combined.extend(items),
                other => combined.push(other),
            }
        }
        Ok(serde_json::Value::Array(combined))
    }

    async fn create_subtasks(
        &self,
        task_name: &str,
        keys: &[String],
        update_count: bool,
    ) -> Result<(), Error> {
        if update_count {
            let update = TaskStateUpdate {
                subtask_count: Some(keys.len() as i64),
                ..Default::default()
            };
            self.update_task(task_name, &update).await?;
        }
        for (bin_id, subtasks) in bins::chunk_subtask_keys(keys) {
            self.write_subtask_bin(task_name, &bin_id, &subtasks).await?;
        }
        Ok(())
    }

    async fn get_subtasks(&self, task_name: &str) -> Result<Vec<Subtask>, Error> {
        let rows = sqlx::query(
            "SELECT data FROM subtask_bins
             WHERE storage_key = ? AND pipeline = ? AND task_id = ?
             ORDER BY CAST(bin_id AS INTEGER)",
        )
        .bind(&self.storage_key)
        .bind(&self.pipeline)
        .bind(task_name)
        .fetch_all(&self.pool)
        .await?;

        let mut subtasks = Vec::new();
        for row in rows {
            let data: String = row.get("data");
            let mut chunk: Vec<Subtask> = serde_json::from_str(&data)?;
            subtasks.append(&mut chunk);
        }
        Ok(subtasks)
    }

    async fn set_subtask_started(&self, task_name: &str, index: usize) -> Result<(), Error> {
        let timestamp = now_iso();
        self.mutate_subtask(task_name, index, |subtask| {
            subtask.start_time = Some(timestamp);
        })
        .await
    }

    async fn set_subtask_ended(
        &self,
        task_name: &str,
        index: usize,
        output_hash: Option<&str>,
    ) -> Result<(), Error> {
        let timestamp = now_iso();
        let output_hash = output_hash.map(str::to_string);
        self.mutate_subtask(task_name, index, |subtask| {
            subtask.end_time = Some(timestamp);
            if output_hash.is_some() {
                subtask.output_hash = output_hash;
            }
        })
        .await
    }

    async fn set_task_ended(
        &self,
        task_name: &str,
        completion: TaskCompletion,
    ) -> Result<(), Error> {
        let timestamp = now_iso();

        if completion.subset_mode {
            if let Some(result) = &completion.result {
                let mut update = TaskStateUpdate::default();
                if let serde_json::Value::Array(items) = result {
                    update.subset_count = Some(items.len() as i64);
                }
                self.update_task(task_name, &update).await?;
                self.create_taskdata(task_name, result, BinKind::Subset)
                    .await?;
                return Ok(());
            }
        }

        let mut update = TaskStateUpdate {
            end_time: Some(timestamp),
            outputs_version: completion.outputs_version.clone(),
            output_data_version: completion.result_hash.clone(),
            status: completion.status,
            ..Default::default()
        };
        match &completion.result {
            Some(serde_json::Value::Array(items)) => {
                update.taskdata_count = Some(items.len() as i64)
            }
            Some(_) => update.taskdata_count = Some(1),
            None => {}
        }
        self.update_task(task_name, &update).await?;

        if let Some(result) = &completion.result {
            self.create_taskdata(task_name, result, BinKind::Taskdata)
                .await?;
        }
        Ok(())
    }

    async fn reset_subset_of_subtasks(
        &self,
        task_name: &str,
        keys: &[String],
    ) -> Result<(), Error> {
        let existing = self.get_subtasks(task_name).await?;
        let wanted: std::collections::HashSet<&str> =
            keys.iter().map(String::as_str).collect();
        let kept: Vec<String> = existing
            .into_iter()
            .filter(|subtask| wanted.contains(subtask.key.as_str()))
            .map(|subtask| subtask.key)
            .collect();

        self.delete_bins(task_name, BinKind::Subtask).await?;
        self.create_subtasks(task_name, &kept, true).await
    }

    async fn delete_bins(&self, task_name: &str, kind: BinKind) -> Result<(), Error> {
        match kind {
            BinKind::Subtask => {
                sqlx::query(
                    "DELETE FROM subtask_bins
                     WHERE storage_key = ? AND pipeline = ? AND task_id = ?",
                )
                .bind(&self.storage_key)
                .bind(&self.pipeline)
                .bind(task_name)
                .execute(&self.pool)
                .await?;
            }
            BinKind::Taskdata | BinKind::Subset => {
                sqlx::query(
                    "DELETE FROM taskdata_bins
                     WHERE storage_key = ? AND pipeline = ? AND task_id = ? AND bin_type = ?",
                )
                .bind(&self.storage_key)
                .bind(&self.pipeline)
                .bind(task_name)
                .bind(kind.wire_name())
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = Utf8PathBuf::try_from(dir.path().join("test.db")).unwrap();
        let store = SqliteStore::new(&db_path, "main", "pipeline").await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_task_round_trip() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        let state = TaskState {
            start_time: Some("2024-01-01T00:00:00".to_string()),
            ..Default::default()
        };
        store.create_task("A", &state, None).await?;

        let fetched = store.get_task("A", false, false).await?.unwrap();
        assert_eq!(fetched.start_time, state.start_time);
        assert_eq!(fetched.status, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_missing_task_is_none() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        assert_eq!(store.get_task("ghost", false, false).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_task_ended_round_trips_terminal_fields() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        store.create_task("A", &TaskState::default(), None).await?;
        store
            .set_task_ended(
                "A",
                TaskCompletion {
                    result: Some(json!(["x", "y"])),
                    result_hash: Some("datahash".to_string()),
                    outputs_version: Some("outhash".to_string()),
                    status: Some(TaskStatus::Success),
                    subset_mode: false,
                },
            )
            .await?;

        let fetched = store.get_task("A", true, false).await?.unwrap();
        assert_eq!(fetched.status, Some(TaskStatus::Success));
        assert_eq!(fetched.outputs_version.as_deref(), Some("outhash"));
        assert_eq!(fetched.output_data_version.as_deref(), Some("datahash"));
        assert!(fetched.end_time.is_some());
        assert_eq!(fetched.taskdata_count, Some(2));
        assert_eq!(fetched.data, Some(json!(["x", "y"])));
        Ok(())
    }

    #[tokio::test]
    async fn test_taskdata_bin_round_trip_preserves_order() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        store.create_task("big", &TaskState::default(), None).await?;

        let items: Vec<serde_json::Value> = (0..3000).map(|i| json!(i)).collect();
        store
            .create_taskdata("big", &serde_json::Value::Array(items.clone()), BinKind::Taskdata)
            .await?;

        let rows = sqlx::query(
            "SELECT bin_id FROM taskdata_bins
             WHERE task_id = 'big' AND bin_type = 'TASKDATABIN' ORDER BY CAST(bin_id AS INTEGER)",
        )
        .fetch_all(&store.pool)
        .await?;
        let bin_ids: Vec<String> = rows.iter().map(|row| row.get("bin_id")).collect();
        assert_eq!(bin_ids, vec!["0", "1", "2", "3", "4", "5"]);

        let data = store.get_taskdata("big", false).await?;
        assert_eq!(data, serde_json::Value::Array(items));
        Ok(())
    }

    #[tokio::test]
    async fn test_scalar_taskdata_lands_in_bin_zero() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        store.create_task("s", &TaskState::default(), None).await?;
        store
            .create_taskdata("s", &json!({"answer": 42}), BinKind::Taskdata)
            .await?;
        assert_eq!(store.get_taskdata("s", false).await?, json!({"answer": 42}));
        Ok(())
    }

    #[tokio::test]
    async fn test_subtask_lifecycle_across_bins() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        store.create_task("m", &TaskState::default(), None).await?;

        let keys: Vec<String> = (0..502).map(|i| format!("key{i}")).collect();
        store.create_subtasks("m", &keys, true).await?;

        let fetched = store.get_task("m", false, false).await?.unwrap();
        assert_eq!(fetched.subtask_count, Some(502));

        store.set_subtask_started("m", 501).await?;
        store.set_subtask_ended("m", 501, Some("hash501")).await?;

        let subtasks = store.get_subtasks("m").await?;
        assert_eq!(subtasks.len(), 502);
        assert_eq!(subtasks[501].i, 501);
        assert!(subtasks[501].start_time.is_some());
        assert!(subtasks[501].end_time.is_some());
        assert_eq!(subtasks[501].output_hash.as_deref(), Some("hash501"));
        assert!(subtasks[500].start_time.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_subset_keeps_only_named_keys() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        store.create_task("m", &TaskState::default(), None).await?;
        let keys: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        store.create_subtasks("m", &keys, true).await?;
        store.set_subtask_ended("m", 1, Some("old")).await?;

        store
            .reset_subset_of_subtasks("m", &["b".to_string(), "d".to_string()])
            .await?;

        let subtasks = store.get_subtasks("m").await?;
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].key, "b");
        assert_eq!(subtasks[1].key, "d");
        assert!(subtasks.iter().all(|s| s.start_time.is_none()
            && s.end_time.is_none()
            && s.output_hash.is_none()));
        Ok(())
    }

    #[tokio::test]
    async fn test_subset_mode_prefers_subset_bin() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        store.create_task("t", &TaskState::default(), None).await?;
        store
            .create_taskdata("t", &json!(["full1", "full2"]), BinKind::Taskdata)
            .await?;
        store
            .create_taskdata("t", &json!(["subset1"]), BinKind::Subset)
            .await?;

        let with_subset = store.get_task("t", true, true).await?.unwrap();
        assert_eq!(with_subset.data, Some(json!(["subset1"])));

        let without = store.get_task("t", true, false).await?.unwrap();
        assert_eq!(without.data, Some(json!(["full1", "full2"])));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_task_cascades_and_is_idempotent() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        store.create_task("gone", &TaskState::default(), None).await?;
        store
            .create_taskdata("gone", &json!(["x"]), BinKind::Taskdata)
            .await?;
        store
            .create_subtasks("gone", &["k".to_string()], true)
            .await?;

        store.delete_task("gone").await?;
        store.delete_task("gone").await?;

        assert_eq!(store.get_task("gone", false, false).await?, None);
        assert_eq!(store.get_subtasks("gone").await?, Vec::new());
        assert!(store.get_taskdata("gone", false).await?.is_null());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_preserves_unset_columns() -> anyhow::Result<()> {
        let (_guard, store) = store().await;
        let state = TaskState {
            start_time: Some("2024-01-01T00:00:00".to_string()),
            ..Default::default()
        };
        store.create_task("A", &state, None).await?;
        store
            .update_task(
                "A",
                &TaskStateUpdate {
                    status: Some(TaskStatus::Incomplete),
                    ..Default::default()
                },
            )
            .await?;

        let fetched = store.get_task("A", false, false).await?.unwrap();
        assert_eq!(fetched.status, Some(TaskStatus::Incomplete));
        assert_eq!(fetched.start_time.as_deref(), Some("2024-01-01T00:00:00"));
        assert!(fetched.updated_at.is_some());
        Ok(())
    }

    #[test]
    fn test_db_path_uses_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let config = Utf8PathBuf::try_from(dir.path().join("kptn.yaml")).unwrap();
        std::fs::write(&config, "settings: {}\n").unwrap();

        let path = resolve_db_path(Some(&config), "main", "flow").unwrap();
        assert_eq!(path.file_name(), Some("main_flow.db"));
        assert_eq!(path.parent().map(Utf8Path::to_path_buf), config.parent().map(Utf8Path::to_path_buf));
    }
}
