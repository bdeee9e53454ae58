//! In-process store. Shares the bin framing with the real backends so the
//! chunk/unchunk contract is exercised even without a database; used as the
//! test double for the decision engine and executors.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{
    bins, now_iso, BinKind, Error, StateStore, Subtask, TaskCompletion, TaskState,
    TaskStateUpdate,
};

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<String, TaskState>,
    /// (task, bin kind wire name, bin id) -> JSON payload.
    data_bins: HashMap<(String, &'static str, String), serde_json::Value>,
    /// (task, bin id) -> subtask chunk.
    subtask_bins: HashMap<(String, String), Vec<Subtask>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn assemble_data(inner: &Inner, task_name: &str, kind: BinKind) -> serde_json::Value {
        let mut payloads: Vec<(usize, &serde_json::Value)> = inner
            .data_bins
            .iter()
            .filter(|((task, wire, _), _)| task == task_name && *wire == kind.wire_name())
            .filter_map(|((_, _, bin_id), payload)| {
                bin_id.parse::<usize>().ok().map(|id| (id, payload))
            })
            .collect();
        if payloads.is_empty() {
            return serde_json::Value::Null;
        }
        payloads.sort_by_key(|(id, _)| *id);
        if payloads.len() == 1 {
            return payloads[0].1.clone();
        }
        let mut combined = Vec::new();
        for (_, payload) in payloads {
            match payload {
                serde_json::Value::Array(items) => combined.extend(items.iter().cloned()),
                other => combined.push(other.clone()),
            }
        }
        serde_json::Value::Array(combined)
    }

    fn merge_update(state: &mut TaskState, update: &TaskStateUpdate) {
        if update.code_hashes.is_some() {
            state.code_hashes = update.code_hashes.clone();
        }
        if update.input_hashes.is_some() {
            state.input_hashes = update.input_hashes.clone();
        }
        if update.input_data_hashes.is_some() {
            state.input_data_hashes = update.input_data_hashes.clone();
        }
        if update.outputs_version.is_some() {
            state.outputs_version = update.outputs_version.clone();
        }
        if update.output_data_version.is_some() {
            state.output_data_version = update.output_data_version.clone();
        }
        if update.status.is_some() {
            state.status = update.status;
        }
        if update.start_time.is_some() {
            state.start_time = update.start_time.clone();
        }
        if update.end_time.is_some() {
            state.end_time = update.end_time.clone();
        }
        if update.subtask_count.is_some() {
            state.subtask_count = update.subtask_count;
        }
        if update.taskdata_count.is_some() {
            state.taskdata_count = update.taskdata_count;
        }
        if update.subset_count.is_some() {
            state.subset_count = update.subset_count;
        }
        state.updated_at = Some(now_iso());
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
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
        state.updated_at = Some(now_iso());
        self.lock().tasks.insert(task_name.to_string(), state);
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
        let inner = self.lock();
        let Some(mut state) = inner.tasks.get(task_name).cloned() else {
            return Ok(None);
        };
        if include_data {
            let data = if subset_mode {
                let subset = Self::assemble_data(&inner, task_name, BinKind::Subset);
                if subset.is_null() {
                    Self::assemble_data(&inner, task_name, BinKind::Taskdata)
                } else {
                    subset
                }
            } else {
                Self::assemble_data(&inner, task_name, BinKind::Taskdata)
            };
            if !data.is_null() {
                state.data = Some(data);
            }
        }
        Ok(Some(state))
    }

    async fn get_tasks(&self) -> Result<Vec<TaskState>, Error> {
        Ok(self.lock().tasks.values().cloned().collect())
    }

    async fn update_task(&self, task_name: &str, update: &TaskStateUpdate) -> Result<(), Error> {
        let mut inner = self.lock();
        let state = inner.tasks.entry(task_name.to_string()).or_default();
        Self::merge_update(state, update);
        Ok(())
    }

    async fn delete_task(&self, task_name: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.tasks.remove(task_name);
        inner
            .data_bins
            .retain(|(task, _, _), _| task != task_name);
        inner.subtask_bins.retain(|(task, _), _| task != task_name);
        Ok(())
    }

    async fn create_taskdata(
        &self,
        task_name: &str,
        data: &serde_json::Value,
        kind: BinKind,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        match data {
            serde_json::Value::Array(items) => {
                for (bin_id, chunk) in bins::chunk_list(items) {
                    inner.data_bins.insert(
                        (task_name.to_string(), kind.wire_name(), bin_id),
                        serde_json::Value::Array(chunk.to_vec()),
                    );
                }
            }
            scalar => {
                inner.data_bins.insert(
                    (task_name.to_string(), kind.wire_name(), "0".to_string()),
                    scalar.clone(),
                );
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
        Ok(Self::assemble_data(&self.lock(), task_name, kind))
    }

    async fn create_subtasks(
        &self,
        task_name: &str,
        keys: &[String],
        update_count: bool,
    ) -> Result<(), Error> {
        if update_count {
            self.update_task(
                task_name,
                &TaskStateUpdate {
                    subtask_count: Some(keys.len() as i64),
                    ..Default::default()
                },
            )
            .await?;
        }
        let mut inner = self.lock();
        for (bin_id, subtasks) in bins::chunk_subtask_keys(keys) {
            inner
                .subtask_bins
                .insert((task_name.to_string(), bin_id), subtasks);
        }
        Ok(())
    }

    async fn get_subtasks(&self, task_name: &str) -> Result<Vec<Subtask>, Error> {
        let inner = self.lock();
        let mut chunks: Vec<(usize, &Vec<Subtask>)> = inner
            .subtask_bins
            .iter()
            .filter(|((task, _), _)| task == task_name)
            .filter_map(|((_, bin_id), chunk)| {
                bin_id.parse::<usize>().ok().map(|id| (id, chunk))
            })
            .collect();
        chunks.sort_by_key(|(id, _)| *id);
        Ok(chunks
            .into_iter()
            .flat_map(|(_, chunk)| chunk.iter().cloned())
            .collect())
    }

    async fn set_subtask_started(&self, task_name: &str, index: usize) -> Result<(), Error> {
        let (bin_id, offset) = bins::bin_location(index);
        let mut inner = self.lock();
        let chunk = inner
            .subtask_bins
            .get_mut(&(task_name.to_string(), bin_id.clone()))
            .ok_or_else(|| Error::SubtaskIndexOutOfRange {
                task: task_name.to_string(),
                bin_id: bin_id.clone(),
                index,
            })?;
        let subtask = chunk
            .get_mut(offset)
            .ok_or_else(|| Error::SubtaskIndexOutOfRange {
                task: task_name.to_string(),
                bin_id,
                index,
            })?;
        subtask.start_time = Some(now_iso());
        Ok(())
    }

    async fn set_subtask_ended(
        &self,
        task_name: &str,
        index: usize,
        output_hash: Option<&str>,
    ) -> Result<(), Error> {
        let (bin_id, offset) = bins::bin_location(index);
        let mut inner = self.lock();
        let chunk = inner
            .subtask_bins
            .get_mut(&(task_name.to_string(), bin_id.clone()))
            .ok_or_else(|| Error::SubtaskIndexOutOfRange {
                task: task_name.to_string(),
                bin_id: bin_id.clone(),
                index,
            })?;
        let subtask = chunk
            .get_mut(offset)
            .ok_or_else(|| Error::SubtaskIndexOutOfRange {
                task: task_name.to_string(),
                bin_id,
                index,
            })?;
        subtask.end_time = Some(now_iso());
        if let Some(output_hash) = output_hash {
            subtask.output_hash = Some(output_hash.to_string());
        }
        Ok(())
    }

    async fn set_task_ended(
        &self,
        task_name: &str,
        completion: TaskCompletion,
    ) -> Result<(), Error> {
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
            end_time: Some(now_iso()),
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
        let wanted: std::collections::HashSet<&str> = keys.iter().map(String::as_str).collect();
        let kept: Vec<String> = existing
            .into_iter()
            .filter(|subtask| wanted.contains(subtask.key.as_str()))
            .map(|subtask| subtask.key)
            .collect();
        self.delete_bins(task_name, BinKind::Subtask).await?;
        self.create_subtasks(task_name, &kept, true).await
    }

    async fn delete_bins(&self, task_name: &str, kind: BinKind) -> Result<(), Error> {
        let mut inner = self.lock();
        match kind {
            BinKind::Subtask => {
                inner.subtask_bins.retain(|(task, _), _| task != task_name);
            }
            other => {
                inner
                    .data_bins
                    .retain(|(task, wire, _), _| task != task_name || *wire != other.wire_name());
            }
        }
        Ok(())
    }
}
