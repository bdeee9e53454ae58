//! End-to-end scenarios for the decision engine and the mapped-task
//! coordinator, run against the in-process store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camino::Utf8PathBuf;
use kptn_cache::{arg_data, vanilla, Error, TaskRegistry, TaskStateCache};
use kptn_catalog::Catalog;
use kptn_config::{FactoryRegistry, PipelineOptions};
use kptn_store::{MemoryStore, StateStore, TaskStateUpdate, TaskStatus};
use pretty_assertions::assert_eq;
use serde_json::json;

const PIPELINE_YAML: &str = r#"
settings:
  storage_key: main
  db: sqlite
  py_tasks_dir: py_tasks

tasks:
  alpha:
    file: py_tasks/alpha.py
    cache_result: true
  combo_list:
    file: py_tasks/combo_list.py
    cache_result: true
    iterable_item: item1,item2
  combo_process:
    file: py_tasks/combo_process.py
    map_over: item1,item2

graphs:
  flow:
    tasks:
      alpha:
      combo_list:
      combo_process: combo_list
"#;

struct Project {
    _guard: tempfile::TempDir,
    root: Utf8PathBuf,
    store: Arc<MemoryStore>,
}

fn project() -> Project {
    let guard = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::try_from(guard.path().to_path_buf()).unwrap();
    std::fs::write(root.join("kptn.yaml"), PIPELINE_YAML).unwrap();

    let py_dir = root.join("py_tasks");
    std::fs::create_dir_all(&py_dir).unwrap();
    std::fs::write(py_dir.join("alpha.py"), "def alpha():\n    return [1, 2]\n").unwrap();
    std::fs::write(
        py_dir.join("combo_list.py"),
        "def combo_list():\n    return [(\"T1\", \"1\"), (\"T2\", \"2\")]\n",
    )
    .unwrap();
    std::fs::write(
        py_dir.join("combo_process.py"),
        "def combo_process(item1, item2):\n    return None\n",
    )
    .unwrap();

    Project {
        _guard: guard,
        root,
        store: Arc::new(MemoryStore::new()),
    }
}

fn base_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register_fn("alpha", |_args| Ok(Some(json!([1, 2]))));
    registry.register_fn("combo_list", |_args| {
        Ok(Some(json!([["T1", "1"], ["T2", "2"]])))
    });
    registry.register_fn("combo_process", |_args| Ok(None));
    registry
}

fn build_cache(project: &Project, registry: TaskRegistry) -> TaskStateCache {
    let config_path = project.root.join("kptn.yaml");
    let catalog = Catalog::load(&[config_path.clone()]).unwrap();
    let options = PipelineOptions::from_config_path(&config_path, Some("flow")).unwrap();
    TaskStateCache::new(
        options,
        catalog,
        project.store.clone(),
        FactoryRegistry::new(),
        registry,
    )
    .unwrap()
}

fn no_params() -> BTreeMap<String, serde_json::Value> {
    BTreeMap::new()
}

#[tokio::test]
async fn test_first_run_requires_execution() {
    let project = project();
    let cache = build_cache(&project, base_registry());

    let decision = cache
        .evaluate_submission("alpha", &no_params(), false)
        .await
        .unwrap();
    assert!(decision.should_run);
    assert_eq!(decision.reason.as_deref(), Some("No cached state"));
    assert!(decision.cached_state.is_none());
}

#[tokio::test]
async fn test_decision_is_pure_without_intervening_writes() {
    let project = project();
    let cache = build_cache(&project, base_registry());

    let first = cache
        .evaluate_submission("alpha", &no_params(), false)
        .await
        .unwrap();
    let second = cache
        .evaluate_submission("alpha", &no_params(), false)
        .await
        .unwrap();
    assert_eq!(first.should_run, second.should_run);
    assert_eq!(first.reason, second.reason);
    assert_eq!(first.array_size, second.array_size);
}

#[tokio::test]
async fn test_pure_cache_hit_after_successful_run() {
    let project = project();
    let cache = build_cache(&project, base_registry());

    vanilla::run_task_vanilla(&cache, "alpha", "No cached state")
        .await
        .unwrap();

    let decision = cache
        .evaluate_submission("alpha", &no_params(), false)
        .await
        .unwrap();
    assert!(!decision.should_run);
    assert_eq!(decision.reason, None);
}

#[tokio::test]
async fn test_code_change_forces_rerun() {
    let project = project();
    let cache = build_cache(&project, base_registry());
    vanilla::run_task_vanilla(&cache, "alpha", "No cached state")
        .await
        .unwrap();

    std::fs::write(
        project.root.join("py_tasks/alpha.py"),
        "def alpha():\n    return [1, 2, 3]\n",
    )
    .unwrap();

    // A fresh cache sees the edited module.
    let cache = build_cache(&project, base_registry());
    let decision = cache
        .evaluate_submission("alpha", &no_params(), false)
        .await
        .unwrap();
    assert!(decision.should_run);
    assert_eq!(decision.reason.as_deref(), Some("Python code changed"));
}

#[tokio::test]
async fn test_ignore_cache_wins_over_cached_state() {
    let project = project();
    let cache = build_cache(&project, base_registry());
    vanilla::run_task_vanilla(&cache, "alpha", "No cached state")
        .await
        .unwrap();

    let decision = cache
        .evaluate_submission("alpha", &no_params(), true)
        .await
        .unwrap();
    assert!(decision.should_run);
    assert_eq!(decision.reason.as_deref(), Some("ignore_cache is set"));
}

#[tokio::test]
async fn test_previous_failure_forces_rerun() {
    let project = project();
    let cache = build_cache(&project, base_registry());
    vanilla::run_task_vanilla(&cache, "alpha", "No cached state")
        .await
        .unwrap();

    project
        .store
        .update_task(
            "alpha",
            &TaskStateUpdate {
                status: Some(TaskStatus::Failure),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let decision = cache
        .evaluate_submission("alpha", &no_params(), false)
        .await
        .unwrap();
    assert_eq!(
        decision.reason.as_deref(),
        Some("Task previously failed all subtasks")
    );
}

#[tokio::test]
async fn test_unfinished_task_must_rerun() {
    let project = project();
    let cache = build_cache(&project, base_registry());

    // Started but never ended.
    cache.set_initial_state("alpha").await.unwrap();
    cache.set_final_state("alpha", None).await.unwrap();

    let decision = cache
        .evaluate_submission("alpha", &no_params(), false)
        .await
        .unwrap();
    assert!(decision.should_run);
    assert_eq!(decision.reason.as_deref(), Some("Not finished"));
}

#[tokio::test]
async fn test_dependency_changes_are_detected_in_order() {
    let project = project();
    let cache = build_cache(&project, base_registry());
    vanilla::run_task_vanilla(&cache, "combo_list", "No cached state")
        .await
        .unwrap();
    vanilla::run_task_vanilla(&cache, "combo_process", "No cached state")
        .await
        .unwrap();

    let decision = cache
        .evaluate_submission("combo_process", &no_params(), false)
        .await
        .unwrap();
    assert!(!decision.should_run);

    // The dependency's data digest moves: "Data changed".
    project
        .store
        .update_task(
            "combo_list",
            &TaskStateUpdate {
                output_data_version: Some("different-data".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let decision = cache
        .evaluate_submission("combo_process", &no_params(), false)
        .await
        .unwrap();
    assert_eq!(decision.reason.as_deref(), Some("Data changed"));

    // An outputs_version appears too: "Inputs changed" fires first.
    project
        .store
        .update_task(
            "combo_list",
            &TaskStateUpdate {
                outputs_version: Some("different-outputs".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let decision = cache
        .evaluate_submission("combo_process", &no_params(), false)
        .await
        .unwrap();
    assert_eq!(decision.reason.as_deref(), Some("Inputs changed"));
}

#[tokio::test]
async fn test_mapped_task_decision_carries_array_size() {
    let project = project();
    let cache = build_cache(&project, base_registry());
    vanilla::run_task_vanilla(&cache, "combo_list", "No cached state")
        .await
        .unwrap();

    let decision = cache
        .evaluate_submission("combo_process", &no_params(), false)
        .await
        .unwrap();
    assert!(decision.should_run);
    assert_eq!(decision.reason.as_deref(), Some("No cached state"));
    assert_eq!(decision.array_size, Some(2));
}

#[tokio::test]
async fn test_mapped_task_failure_then_resume() {
    let project = project();

    // First attempt: the subtask for T2 fails.
    let fail_t2 = Arc::new(AtomicBool::new(true));
    let flag = fail_t2.clone();
    let mut registry = base_registry();
    registry.register_fn("combo_process", move |args| {
        let item = arg_data(&args, "item1").and_then(|v| v.as_str()).unwrap_or("");
        if item == "T2" && flag.load(Ordering::SeqCst) {
            Err("T2 exploded".to_string())
        } else {
            Ok(None)
        }
    });
    let cache = build_cache(&project, registry);
    vanilla::run_task_vanilla(&cache, "combo_list", "No cached state")
        .await
        .unwrap();

    let run = vanilla::run_task_vanilla(&cache, "combo_process", "No cached state").await;
    assert!(matches!(
        run,
        Err(Error::MappedTaskFailed {
            status: TaskStatus::Incomplete,
            ..
        })
    ));

    let state = project
        .store
        .get_task("combo_process", false, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Some(TaskStatus::Incomplete));
    assert_eq!(state.subtask_count, Some(2));

    let subtasks = project.store.get_subtasks("combo_process").await.unwrap();
    assert!(subtasks[0].end_time.is_some());
    assert!(subtasks[1].end_time.is_none());

    // The next submission re-dispatches only the incomplete element.
    let decision = cache
        .evaluate_submission("combo_process", &no_params(), false)
        .await
        .unwrap();
    assert_eq!(decision.reason.as_deref(), Some("INCOMPLETE"));

    fail_t2.store(false, Ordering::SeqCst);
    vanilla::run_task_vanilla(&cache, "combo_process", "INCOMPLETE")
        .await
        .unwrap();

    let state = project
        .store
        .get_task("combo_process", false, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Some(TaskStatus::Success));
    let subtasks = project.store.get_subtasks("combo_process").await.unwrap();
    assert!(subtasks.iter().all(|subtask| subtask.end_time.is_some()));

    // outputs_version digests the ordered per-subtask output hashes.
    let expected = kptn_hash::hash_value(&json!([null, null]));
    assert_eq!(state.outputs_version, expected);

    let decision = cache
        .evaluate_submission("combo_process", &no_params(), false)
        .await
        .unwrap();
    assert!(!decision.should_run);
}

#[tokio::test]
async fn test_multi_key_subtasks_receive_unpacked_kwargs() {
    let project = project();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let mut registry = base_registry();
    registry.register_fn("combo_process", move |args| {
        let item1 = arg_data(&args, "item1").cloned().unwrap_or_default();
        let item2 = arg_data(&args, "item2").cloned().unwrap_or_default();
        recorder.lock().unwrap().push((item1, item2));
        Ok(None)
    });
    let cache = build_cache(&project, registry);
    vanilla::run_task_vanilla(&cache, "combo_list", "No cached state")
        .await
        .unwrap();
    vanilla::run_task_vanilla(&cache, "combo_process", "No cached state")
        .await
        .unwrap();

    let mut calls = seen.lock().unwrap().clone();
    calls.sort_by_key(|(item1, _)| item1.to_string());
    assert_eq!(
        calls,
        vec![
            (json!("T1"), json!("1")),
            (json!("T2"), json!("2")),
        ]
    );

    let subtasks = project.store.get_subtasks("combo_process").await.unwrap();
    let keys: Vec<&str> = subtasks.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["T1,1", "T2,2"]);
}

#[tokio::test]
async fn test_single_task_failure_records_failure_status() {
    let project = project();
    let mut registry = base_registry();
    registry.register_fn("alpha", |_args| Err("alpha broke".to_string()));
    let cache = build_cache(&project, registry);

    let run = vanilla::run_task_vanilla(&cache, "alpha", "No cached state").await;
    assert!(matches!(run, Err(Error::TaskFailed { .. })));

    let state = project
        .store
        .get_task("alpha", false, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Some(TaskStatus::Failure));

    let cache = build_cache(&project, base_registry());
    let decision = cache
        .evaluate_submission("alpha", &no_params(), false)
        .await
        .unwrap();
    assert_eq!(
        decision.reason.as_deref(),
        Some("Task previously failed all subtasks")
    );
}

#[tokio::test]
async fn test_key_value_joins_multi_key_kwargs() {
    let project = project();
    let cache = build_cache(&project, base_registry());

    let mut kwargs = BTreeMap::new();
    kwargs.insert("item1".to_string(), json!("T1"));
    kwargs.insert("item2".to_string(), json!(1));
    assert_eq!(
        cache.get_key_value("combo_process", &kwargs).unwrap(),
        Some("T1,1".to_string())
    );

    kwargs.remove("item2");
    assert_eq!(cache.get_key_value("combo_process", &kwargs).unwrap(), None);
    assert_eq!(cache.get_key_value("alpha", &kwargs).unwrap(), None);
}

#[tokio::test]
async fn test_mapped_helpers() {
    let project = project();
    let cache = build_cache(&project, base_registry());

    assert!(cache.is_mapped_task("combo_process").unwrap());
    assert!(!cache.is_mapped_task("alpha").unwrap());
    assert!(cache.task_returns_list("combo_list").unwrap());
    assert!(cache.has_mapped_task_deps("combo_process").unwrap());
    assert_eq!(
        cache.get_map_over_key("combo_process").unwrap().as_deref(),
        Some("item1,item2")
    );

    // Count unknown until the dependency's data is cached.
    assert_eq!(cache.get_map_over_count("combo_process").await.unwrap(), None);
    vanilla::run_task_vanilla(&cache, "combo_list", "No cached state")
        .await
        .unwrap();
    assert_eq!(
        cache.get_map_over_count("combo_process").await.unwrap(),
        Some(2)
    );
}

#[tokio::test]
async fn test_parallel_map_matches_vanilla_result() {
    let project = project();
    let cache = Arc::new(build_cache(&project, base_registry()));
    vanilla::run_task_vanilla(cache.as_ref(), "combo_list", "No cached state")
        .await
        .unwrap();

    kptn_cache::parallel::run_task_parallel(&cache, "combo_process", "No cached state")
        .await
        .unwrap();

    let state = project
        .store
        .get_task("combo_process", false, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Some(TaskStatus::Success));
    let subtasks = project.store.get_subtasks("combo_process").await.unwrap();
    assert_eq!(subtasks.len(), 2);
    assert!(subtasks.iter().all(|subtask| subtask.end_time.is_some()));
}

#[tokio::test]
async fn test_batch_array_worker_runs_one_subtask() {
    let project = project();
    let cache = build_cache(&project, base_registry());
    vanilla::run_task_vanilla(&cache, "combo_list", "No cached state")
        .await
        .unwrap();

    // Worker for index 0 only.
    kptn_cache::batch::run_batch_array_subtask_at(&cache, "combo_process", 0)
        .await
        .unwrap();

    let subtasks = project.store.get_subtasks("combo_process").await.unwrap();
    assert_eq!(subtasks.len(), 2);
    assert!(subtasks[0].end_time.is_some());
    assert!(subtasks[1].end_time.is_none());

    let state = project
        .store
        .get_task("combo_process", false, false)
        .await
        .unwrap()
        .unwrap();
    // Not all subtasks finished: no aggregate status yet.
    assert_eq!(state.status, None);

    // The worker that finishes the last subtask writes the aggregate.
    kptn_cache::batch::run_batch_array_subtask_at(&cache, "combo_process", 1)
        .await
        .unwrap();

    let state = project
        .store
        .get_task("combo_process", false, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Some(TaskStatus::Success));
    assert!(state.outputs_version.is_some());
}

#[tokio::test]
async fn test_subset_mode_keeps_cache_intact_on_failure() {
    let project = project();

    // Seed a successful full run first.
    let cache = build_cache(&project, base_registry());
    vanilla::run_task_vanilla(&cache, "combo_list", "No cached state")
        .await
        .unwrap();
    vanilla::run_task_vanilla(&cache, "combo_process", "No cached state")
        .await
        .unwrap();

    // Subset run where everything fails must not overwrite SUCCESS.
    let mut registry = base_registry();
    registry.register_fn("combo_process", |_args| Err("subset boom".to_string()));
    let config_path = project.root.join("kptn.yaml");
    let catalog = Catalog::load(&[config_path.clone()]).unwrap();
    let mut options = PipelineOptions::from_config_path(&config_path, Some("flow")).unwrap();
    options.subset_mode = true;
    let subset_cache = TaskStateCache::new(
        options,
        catalog,
        project.store.clone(),
        FactoryRegistry::new(),
        registry,
    )
    .unwrap();

    let run = vanilla::map_task_vanilla(&subset_cache, "combo_process").await;
    assert_eq!(run.unwrap(), TaskStatus::Failure);

    let state = project
        .store
        .get_task("combo_process", false, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Some(TaskStatus::Success));
}

#[tokio::test]
async fn test_evaluate_in_subset_mode_always_runs() {
    let project = project();
    let cache = build_cache(&project, base_registry());
    vanilla::run_task_vanilla(&cache, "alpha", "No cached state")
        .await
        .unwrap();

    let config_path = project.root.join("kptn.yaml");
    let catalog = Catalog::load(&[config_path.clone()]).unwrap();
    let mut options = PipelineOptions::from_config_path(&config_path, Some("flow")).unwrap();
    options.subset_mode = true;
    let subset_cache = TaskStateCache::new(
        options,
        catalog,
        project.store.clone(),
        FactoryRegistry::new(),
        base_registry(),
    )
    .unwrap();

    let decision = subset_cache
        .evaluate_submission("alpha", &no_params(), false)
        .await
        .unwrap();
    assert_eq!(decision.reason.as_deref(), Some("Subset mode"));
}
