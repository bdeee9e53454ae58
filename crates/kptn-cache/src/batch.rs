//! AWS Batch array-job workers: one process runs exactly one subtask of a
//! mapped task, identified by `AWS_BATCH_JOB_ARRAY_INDEX`.

use kptn_store::{TaskCompletion, TaskStatus};
use tracing::{info, warn};

use crate::{
    dep_data::fetch_cached_dep_data,
    outcome::SubtaskOutcome,
    vanilla::{fetch_and_hash_subtasks, run_subtask, subtask_kwargs, SubtaskPlan},
    Error, TaskStateCache,
};

fn parse_batch_index() -> Result<usize, Error> {
    let value = std::env::var("AWS_BATCH_JOB_ARRAY_INDEX")
        .map_err(|_| Error::BatchIndexMissing)?;
    value
        .trim()
        .parse()
        .map_err(|_| Error::BatchIndexInvalid(value))
}

/// Execute the subtask selected by `AWS_BATCH_JOB_ARRAY_INDEX`.
pub async fn run_batch_array_subtask(
    cache: &TaskStateCache,
    task_name: &str,
) -> Result<(), Error> {
    let array_index = parse_batch_index()?;
    run_batch_array_subtask_at(cache, task_name, array_index).await
}

/// Execute one array-indexed subtask of a mapped task. The worker that
/// observes every subtask finished also writes the aggregated status and
/// `outputs_version`.
pub async fn run_batch_array_subtask_at(
    cache: &TaskStateCache,
    task_name: &str,
    array_index: usize,
) -> Result<(), Error> {
    if !cache.is_mapped_task(task_name)? {
        return Err(Error::NotMapped {
            task: task_name.to_string(),
        });
    }
    let dep_data = fetch_cached_dep_data(cache, task_name).await?;
    let task_size = dep_data.subtask_keys.len();
    if task_size == 0 {
        return Err(Error::EmptyIterable {
            task: task_name.to_string(),
        });
    }
    if array_index >= task_size {
        return Err(Error::BatchIndexOutOfBounds {
            index: array_index,
            size: task_size,
        });
    }

    if let Ok(expected) = std::env::var("ARRAY_SIZE") {
        match expected.trim().parse::<usize>() {
            Ok(expected_size) if expected_size != task_size => warn!(
                "ARRAY_SIZE ({expected_size}) does not match computed task_size ({task_size}) for {task_name}"
            ),
            Ok(_) => {}
            Err(_) => warn!("ARRAY_SIZE is not an int: {expected}"),
        }
    }
    if let Some(count) = dep_data.map_over_count {
        if count != task_size {
            warn!(
                "map_over_count ({count}) does not match task_size ({task_size}) for {task_name}"
            );
        }
    }

    let existing = cache
        .store()
        .get_task(task_name, false, cache.subset_mode())
        .await?;
    if existing.is_none() {
        info!("Creating initial task state for {task_name} (batch array)");
        cache.set_initial_state(task_name).await?;
    }

    let subtasks = cache.store().get_subtasks(task_name).await?;
    if subtasks.is_empty() {
        info!("Creating {task_size} subtasks for {task_name}");
        cache
            .store()
            .create_subtasks(task_name, &dep_data.subtask_keys, true)
            .await?;
    }

    let key = dep_data.subtask_keys[array_index].clone();
    let kwargs = subtask_kwargs(cache, task_name, &dep_data, array_index, &key)?;
    let plan = SubtaskPlan {
        index: array_index,
        key,
        kwargs,
    };

    info!("Running batch array subtask {array_index} of {task_size} for {task_name}");
    let handle = cache.task_handle(task_name)?;
    let runtime = cache.runtime_config(Some(task_name))?;
    let outcome = run_subtask(cache, task_name, &handle, &runtime, &plan).await;

    if let SubtaskOutcome::Err(message) = outcome {
        // Mark the overall task as failed so the decider reruns or surfaces it.
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
        return Err(Error::TaskFailed {
            task: task_name.to_string(),
            message,
        });
    }

    let updated_subtasks = cache.store().get_subtasks(task_name).await?;
    let all_finished = !updated_subtasks.is_empty()
        && updated_subtasks
            .iter()
            .all(|subtask| subtask.end_time.is_some());
    if all_finished {
        let outputs_version = fetch_and_hash_subtasks(cache, task_name).await?;
        cache
            .store()
            .set_task_ended(
                task_name,
                TaskCompletion {
                    outputs_version,
                    status: Some(TaskStatus::Success),
                    ..Default::default()
                },
            )
            .await?;
        cache
            .set_final_state(task_name, Some(TaskStatus::Success))
            .await?;
        info!("All {task_size} subtasks completed for {task_name}; marked SUCCESS");
    } else {
        info!("Subtask {array_index} complete for {task_name}; waiting for remaining subtasks");
    }
    Ok(())
}
