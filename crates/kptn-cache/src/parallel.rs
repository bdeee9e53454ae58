//! Parallel map dispatch: subtasks run concurrently, siblings never cancel
//! each other, and every future in a group is awaited before the group's
//! status is computed.

use std::sync::Arc;

use kptn_store::TaskStatus;
use tokio::task::JoinSet;
use tracing::info;

use crate::{
    dep_data::fetch_cached_dep_data,
    outcome::{combine_statuses, overall_status, SubtaskOutcome},
    vanilla::{bundle_candidates, finish_mapped_task, plan_candidates, run_unit, SubtaskPlan},
    Error, TaskStateCache,
};

async fn run_units_concurrently(
    cache: &Arc<TaskStateCache>,
    task_name: &str,
    handle: &Arc<dyn crate::TaskHandle>,
    runtime: &Arc<kptn_config::RuntimeConfig>,
    units: &[Vec<SubtaskPlan>],
) -> Vec<SubtaskOutcome> {
    let mut join_set = JoinSet::new();
    for unit in units {
        let cache = Arc::clone(cache);
        let task_name = task_name.to_string();
        let handle = Arc::clone(handle);
        let runtime = Arc::clone(runtime);
        let unit = unit.clone();
        join_set.spawn(async move {
            run_unit(&cache, &task_name, &handle, &runtime, &unit).await
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(unit_outcomes) => outcomes.extend(unit_outcomes),
            Err(join_error) => outcomes.push(SubtaskOutcome::Err(join_error.to_string())),
        }
    }
    outcomes
}

/// Map a task over its dependency data with concurrent subtask dispatch.
/// Returns the aggregated status after recording it.
pub async fn map_task_parallel(
    cache: &Arc<TaskStateCache>,
    task_name: &str,
) -> Result<TaskStatus, Error> {
    let task = cache.get_task(task_name)?.clone();
    let dep_data = fetch_cached_dep_data(cache, task_name).await?;
    cache.set_initial_state(task_name).await?;

    let candidates = plan_candidates(cache, task_name, &dep_data).await?;
    let handle = cache.task_handle(task_name)?;
    let runtime = Arc::new(cache.runtime_config(Some(task_name))?);
    let units = bundle_candidates(candidates, task.bundle_size);

    let status = match task.group_size {
        Some(group_size) if group_size > 0 => {
            let mut group_statuses = Vec::new();
            for group in units.chunks(group_size) {
                let outcomes =
                    run_units_concurrently(cache, task_name, &handle, &runtime, group).await;
                group_statuses.push(overall_status(&outcomes));
            }
            combine_statuses(&group_statuses)
        }
        _ => {
            let outcomes =
                run_units_concurrently(cache, task_name, &handle, &runtime, &units).await;
            overall_status(&outcomes)
        }
    };

    finish_mapped_task(cache, task_name, status).await?;
    Ok(status)
}

/// Run one pipeline task with parallel subtask dispatch for mapped tasks.
pub async fn run_task_parallel(
    cache: &Arc<TaskStateCache>,
    task_name: &str,
    reason: &str,
) -> Result<(), Error> {
    let is_mapped = cache.is_mapped_task(task_name)?;

    if std::env::var("AWS_BATCH_JOB_ARRAY_INDEX").is_ok() && is_mapped {
        info!("Detected AWS batch array worker; running subtask for {task_name}");
        return crate::batch::run_batch_array_subtask(cache, task_name).await;
    }

    if cache.subset_mode() {
        if cache.task_language(task_name)? == kptn_catalog::TaskLanguage::Python {
            cache.store().delete_subsetdata(task_name).await?;
        }
    } else if reason == "INCOMPLETE" && is_mapped {
        // Keep the cache so only incomplete subtasks re-run.
    } else {
        cache.delete_state(task_name).await?;
    }

    if is_mapped {
        match map_task_parallel(cache, task_name).await {
            Ok(TaskStatus::Success) => {}
            Ok(status) => {
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
        crate::vanilla::run_single_task(cache, task_name, &Default::default()).await?;
    }

    cache
        .set_final_state(task_name, Some(TaskStatus::Success))
        .await
}
