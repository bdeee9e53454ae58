//! Sequential task execution: the vanilla driver.
//!
//! Runs single tasks in-process and maps mapped tasks one subtask at a time,
//! honoring `bundle_size`/`group_size` chunking. The parallel driver reuses
//! the planning helpers here and changes only the dispatch.

use std::collections::BTreeMap;

use kptn_store::{Subtask, TaskCompletion, TaskStatus};
use tracing::{error, info};

use crate::{
    dep_data::{fetch_cached_dep_data, DependencyData},
    outcome::{combine_statuses, overall_status, SubtaskOutcome},
    task_handle::plan_call,
    Error, TaskStateCache,
};

/// One planned subtask invocation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubtaskPlan {
    pub index: usize,
    pub key: String,
    pub kwargs: BTreeMap<String, serde_json::Value>,
}

/// Build the kwargs for one subtask: map keys get the element at its global
/// index, full-length list args are indexed, everything else passes through,
/// and static args fill the gaps.
pub(crate) fn subtask_kwargs(
    cache: &TaskStateCache,
    task_name: &str,
    dep_data: &DependencyData,
    index: usize,
    key: &str,
) -> Result<BTreeMap<String, serde_json::Value>, Error> {
    let total = dep_data.subtask_keys.len();
    let map_over = cache.get_map_over_key(task_name)?.unwrap_or_default();
    let map_keys: Vec<&str> = map_over
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    let mut kwargs = BTreeMap::new();
    for (name, value) in &dep_data.data_args {
        match value {
            serde_json::Value::Array(items) if items.len() == total => {
                kwargs.insert(
                    name.clone(),
                    items.get(index).cloned().unwrap_or(serde_json::Value::Null),
                );
            }
            other => {
                kwargs.insert(name.clone(), other.clone());
            }
        }
    }

    // When the iterable is gone (a resumed run against refreshed deps), the
    // subtask's stored key still carries the values.
    for (position, map_key) in map_keys.iter().enumerate() {
        if !kwargs.contains_key(*map_key) {
            let part = key.split(',').nth(position).unwrap_or_default();
            kwargs.insert(map_key.to_string(), serde_json::json!(part));
        }
    }

    if let Some(static_args) = cache.task_args(task_name)? {
        for (name, value) in static_args {
            kwargs.entry(name).or_insert(value);
        }
    }
    Ok(kwargs)
}

/// Plan the candidate subtasks for a run: in subset mode the bins are reset
/// to the selected keys; otherwise an existing subtask set is reduced to its
/// incomplete elements, and a fresh set is created when none exists.
pub(crate) async fn plan_candidates(
    cache: &TaskStateCache,
    task_name: &str,
    dep_data: &DependencyData,
) -> Result<Vec<SubtaskPlan>, Error> {
    let keys = &dep_data.subtask_keys;

    let selected: Vec<(usize, String)> = if cache.subset_mode() {
        cache
            .store()
            .reset_subset_of_subtasks(task_name, keys)
            .await?;
        keys.iter().cloned().enumerate().collect()
    } else {
        let existing = cache.store().get_subtasks(task_name).await?;
        if existing.is_empty() {
            info!("Creating fresh subtasks for {task_name}");
            cache.store().create_subtasks(task_name, keys, true).await?;
            keys.iter().cloned().enumerate().collect()
        } else {
            let incomplete: Vec<&Subtask> = existing
                .iter()
                .filter(|subtask| subtask.end_time.is_none())
                .collect();
            info!(
                "Subtasks found for {task_name}; Incomplete subtasks: {}",
                incomplete.len()
            );
            incomplete
                .into_iter()
                .map(|subtask| (subtask.i, subtask.key.clone()))
                .collect()
        }
    };

    let mut plans = Vec::with_capacity(selected.len());
    for (index, key) in selected {
        let kwargs = subtask_kwargs(cache, task_name, dep_data, index, &key)?;
        plans.push(SubtaskPlan { index, key, kwargs });
    }
    Ok(plans)
}

/// Run one subtask: stamp start, invoke, hash its outputs, stamp end. A
/// failed subtask keeps its unset end time so a later run re-dispatches it.
pub(crate) async fn run_subtask(
    cache: &TaskStateCache,
    task_name: &str,
    handle: &std::sync::Arc<dyn crate::TaskHandle>,
    runtime: &kptn_config::RuntimeConfig,
    plan: &SubtaskPlan,
) -> SubtaskOutcome {
    if let Err(store_error) = cache.store().set_subtask_started(task_name, plan.index).await {
        return SubtaskOutcome::Err(store_error.to_string());
    }

    let bound = match plan_call(task_name, handle.params(), &plan.kwargs, runtime) {
        Ok(bound) => bound,
        Err(bind_error) => return SubtaskOutcome::Err(bind_error.to_string()),
    };

    match handle.invoke(bound).await {
        Ok(_) => {
            let output_hash = cache
                .hash_subtask_outputs(task_name, runtime, &plan.kwargs)
                .unwrap_or_else(|hash_error| {
                    error!("Hashing outputs of {task_name}[{}] failed: {hash_error}", plan.index);
                    None
                });
            match cache
                .store()
                .set_subtask_ended(task_name, plan.index, output_hash.as_deref())
                .await
            {
                Ok(()) => SubtaskOutcome::Ok(output_hash),
                Err(store_error) => SubtaskOutcome::Err(store_error.to_string()),
            }
        }
        Err(message) => {
            error!("Task execution failed: {message}");
            SubtaskOutcome::Err(message)
        }
    }
}

/// Hash the ordered per-subtask output hashes into the task's
/// `outputs_version`.
pub(crate) async fn fetch_and_hash_subtasks(
    cache: &TaskStateCache,
    task_name: &str,
) -> Result<Option<String>, Error> {
    let subtasks = cache.store().get_subtasks(task_name).await?;
    if subtasks.is_empty() {
        return Ok(None);
    }
    let hashes: Vec<serde_json::Value> = subtasks
        .iter()
        .map(|subtask| match &subtask.output_hash {
            Some(hash) => serde_json::json!(hash),
            None => serde_json::Value::Null,
        })
        .collect();
    Ok(kptn_hash::hash_value(&serde_json::Value::Array(hashes)))
}

/// Write the aggregated status. Subset runs never record INCOMPLETE/FAILURE;
/// a successful run also records the recomputed `outputs_version`.
pub(crate) async fn finish_mapped_task(
    cache: &TaskStateCache,
    task_name: &str,
    status: TaskStatus,
) -> Result<(), Error> {
    if status == TaskStatus::Success {
        let outputs_version = fetch_and_hash_subtasks(cache, task_name).await?;
        cache
            .store()
            .set_task_ended(
                task_name,
                TaskCompletion {
                    outputs_version,
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await?;
    } else if cache.subset_mode() {
        cache
            .store()
            .set_task_ended(task_name, TaskCompletion::default())
            .await?;
    } else {
        cache
            .store()
            .set_task_ended(
                task_name,
                TaskCompletion {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await?;
    }
    Ok(())
}

/// Chunk candidates into sequential execution units: bundles when
/// `bundle_size` is set, single-element units otherwise.
pub(crate) fn bundle_candidates(
    candidates: Vec<SubtaskPlan>,
    bundle_size: Option<usize>,
) -> Vec<Vec<SubtaskPlan>> {
    match bundle_size {
        Some(size) if size > 0 => candidates
            .chunks(size)
            .map(|chunk| chunk.to_vec())
            .collect(),
        _ => candidates.into_iter().map(|plan| vec![plan]).collect(),
    }
}

/// Run one unit sequentially. Errors accumulate across the bundle instead of
/// aborting it.
pub(crate) async fn run_unit(
    cache: &TaskStateCache,
    task_name: &str,
    handle: &std::sync::Arc<dyn crate::TaskHandle>,
    runtime: &kptn_config::RuntimeConfig,
    unit: &[SubtaskPlan],
) -> Vec<SubtaskOutcome> {
    let mut outcomes = Vec::with_capacity(unit.len());
    for plan in unit {
        outcomes.push(run_subtask(cache, task_name, handle, runtime, plan).await);
    }
    outcomes
}

/// Map a task over its dependency data sequentially. Returns the aggregated
/// status after recording it.
pub async fn map_task_vanilla(
    cache: &TaskStateCache,
    task_name: &str,
) -> Result<TaskStatus, Error> {
    let task = cache.get_task(task_name)?.clone();
    let dep_data = fetch_cached_dep_data(cache, task_name).await?;
    cache.set_initial_state(task_name).await?;

    let candidates = plan_candidates(cache, task_name, &dep_data).await?;
    let handle = cache.task_handle(task_name)?;
    let runtime = cache.runtime_config(Some(task_name))?;
    let units = bundle_candidates(candidates, task.bundle_size);

    let status = match task.group_size {
        Some(group_size) if group_size > 0 => {
            let mut group_statuses = Vec::new();
            for group in units.chunks(group_size) {
                let mut outcomes = Vec::new();
                for unit in group {
                    outcomes.extend(run_unit(cache, task_name, &handle, &runtime, unit).await);
                }
                group_statuses.push(overall_status(&outcomes));
            }
            combine_statuses(&group_statuses)
        }
        _ => {
            let mut outcomes = Vec::new();
            for unit in &units {
                outcomes.extend(run_unit(cache, task_name, &handle, &runtime, unit).await);
            }
            overall_status(&outcomes)
        }
    };

    finish_mapped_task(cache, task_name, status).await?;
    Ok(status)
}

/// Execute a single (non-mapped) task and record its result.
pub async fn run_single_task(
    cache: &TaskStateCache,
    task_name: &str,
    extra_kwargs: &BTreeMap<String, serde_json::Value>,
) -> Result<(), Error> {
    let dep_data = fetch_cached_dep_data(cache, task_name).await?;
    cache.set_initial_state(task_name).await?;

    let mut kwargs = dep_data.data_args.clone();
    for (name, value) in extra_kwargs {
        kwargs.insert(name.clone(), value.clone());
    }
    if let Some(static_args) = cache.task_args(task_name)? {
        for (name, value) in static_args {
            kwargs.entry(name).or_insert(value);
        }
    }

    let runtime = cache.runtime_config(Some(task_name))?;
    let handle = cache.task_handle(task_name)?;
    let bound = plan_call(task_name, handle.params(), &kwargs, &runtime)?;

    match handle.invoke(bound).await {
        Ok(result) => {
            let result_hash = result.as_ref().and_then(kptn_hash::hash_value);
            cache
                .store()
                .set_task_ended(
                    task_name,
                    TaskCompletion {
                        result,
                        result_hash,
                        subset_mode: cache.subset_mode(),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(())
        }
        Err(message) => {
            cache
                .store()
                .set_task_ended(
                    task_name,
                    TaskCompletion {
                        status: Some(TaskStatus::Failure),
                        ..Default::default()
                    },
                )
                .await?;
            cache
                .set_final_state(task_name, Some(TaskStatus::Failure))
                .await?;
            Err(Error::TaskFailed {
                task: task_name.to_string(),
                message,
            })
        }
    }
}

/// Run one pipeline task sequentially: clear or keep the cache per the
/// decision reason, execute, and finalise state.
pub async fn run_task_vanilla(
    cache: &TaskStateCache,
    task_name: &str,
    reason: &str,
) -> Result<(), Error> {
    let is_mapped = cache.is_mapped_task(task_name)?;

    // Inside an AWS Batch array job only the targeted subtask runs here.
    if std::env::var("AWS_BATCH_JOB_ARRAY_INDEX").is_ok() && is_mapped {
        info!("Detected AWS batch array worker; running subtask for {task_name}");
        return crate::batch::run_batch_array_subtask(cache, task_name).await;
    }

    if cache.subset_mode() {
        if cache.task_language(task_name)? == kptn_catalog::TaskLanguage::Python {
            info!("Clearing subset before running task {task_name}");
            cache.store().delete_subsetdata(task_name).await?;
        }
        // R tasks keep their cache in subset mode.
    } else if reason == "INCOMPLETE" && is_mapped {
        // Keep the cache so only incomplete subtasks re-run.
    } else {
        info!("Clearing cache before running task {task_name}");
        cache.delete_state(task_name).await?;
    }

    if is_mapped {
        info!("Running mapped task {task_name}");
        match map_task_vanilla(cache, task_name).await {
            Ok(TaskStatus::Success) => {}
            Ok(status) => {
                // The partial status is already stored; save code and data
                // hashes so a change to either re-runs every subtask.
                cache.set_final_state(task_name, None).await?;
                return Err(Error::MappedTaskFailed {
                    task: task_name.to_string(),
                    status,
                });
            }
            Err(map_error) => {
                cache.set_final_state(task_name, None).await?;
                return Err(map_error);
            }
        }
    } else {
        run_single_task(cache, task_name, &BTreeMap::new()).await?;
    }

    cache.set_final_state(task_name, Some(TaskStatus::Success)).await
}
