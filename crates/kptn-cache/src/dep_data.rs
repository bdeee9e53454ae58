//! Fetching cached dependency data and shaping it into task arguments.

use std::collections::BTreeMap;

use tracing::warn;

use crate::{Error, TaskStateCache};

/// One task's view of its dependencies' cached data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyData {
    /// Keyword arguments: for mapped tasks each map key holds the full list;
    /// other keys hold the dependency's data as-is.
    pub data_args: BTreeMap<String, serde_json::Value>,
    /// The raw iterable items the task maps over, in order.
    pub items: Vec<serde_json::Value>,
    /// String subtask keys: comma-joined across multi-key map_over specs.
    pub subtask_keys: Vec<String>,
    /// Length of the iterable, when the task is mapped and the data is known.
    pub map_over_count: Option<usize>,
}

/// A subtask key fragment: strings stay raw, everything else uses its JSON
/// form.
pub fn value_to_key_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Fetch cached data for each dependency of a task, delivered under the key
/// the argument plan resolves for it. Multi-key mapped tasks get their
/// dependency's tuple list unpacked key by key.
pub async fn fetch_cached_dep_data(
    cache: &TaskStateCache,
    task_name: &str,
) -> Result<DependencyData, Error> {
    let deps = cache.dep_list(task_name)?;
    let mut task = cache.get_task(task_name)?.clone();
    task.args = cache.task_args(task_name)?;
    let plan = cache
        .catalog()
        .argument_plan(cache.pipeline_name(), task_name)?;
    for message in &plan.errors {
        warn!("Task {task_name} configuration issue during argument resolution: {message}");
    }

    let mut dep_data = DependencyData::default();

    for dep_name in &deps {
        let dep = cache.get_task(dep_name)?;
        if !dep.should_cache_result() {
            continue;
        }
        let Some(state) = cache.fetch_state(dep_name).await? else {
            continue;
        };
        let Some(data) = state.data else {
            continue;
        };
        if data == serde_json::Value::String(String::new()) {
            continue;
        }
        let Some(key) = kptn_catalog::resolve_dependency_key(
            &task,
            dep_name,
            dep,
            &plan.alias_lookup,
        ) else {
            continue;
        };

        if task.is_mapped() && key.contains(',') {
            // The dependency's data is a list of tuples; unpack it into one
            // list per key and join the tuples into subtask key strings.
            let keys: Vec<&str> = key.split(',').map(str::trim).collect();
            let rows = data.as_array().cloned().unwrap_or_default();
            for (position, key_name) in keys.iter().enumerate() {
                let column: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| {
                        row.as_array()
                            .and_then(|tuple| tuple.get(position))
                            .cloned()
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect();
                dep_data
                    .data_args
                    .insert(key_name.to_string(), serde_json::Value::Array(column));
            }
            dep_data.subtask_keys = rows
                .iter()
                .map(|row| match row.as_array() {
                    Some(tuple) => tuple
                        .iter()
                        .map(value_to_key_string)
                        .collect::<Vec<_>>()
                        .join(","),
                    None => value_to_key_string(row),
                })
                .collect();
            dep_data.map_over_count = Some(dep_data.subtask_keys.len());
            dep_data.items = rows;
        } else {
            dep_data.data_args.insert(key.clone(), data.clone());
            if let serde_json::Value::Array(items) = data {
                dep_data.subtask_keys = items.iter().map(value_to_key_string).collect();
                if task.is_mapped() {
                    dep_data.map_over_count = Some(items.len());
                }
                dep_data.items = items;
            }
        }
    }

    Ok(dep_data)
}
