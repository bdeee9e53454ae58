//! Wire-level decider flow against an in-process cache.

use std::sync::Arc;

use camino::Utf8PathBuf;
use kptn_cache::{vanilla, TaskRegistry, TaskStateCache};
use kptn_catalog::Catalog;
use kptn_config::{FactoryRegistry, PipelineOptions};
use kptn_decider::decide_task_execution;
use kptn_store::MemoryStore;
use pretty_assertions::assert_eq;
use serde_json::json;

const PIPELINE_YAML: &str = r#"
settings:
  storage_key: main
  db: sqlite
  py_tasks_dir: py_tasks

tasks:
  items:
    file: py_tasks/items.py
    cache_result: true
    iterable_item: item
  process:
    file: py_tasks/process.py
    map_over: item

graphs:
  flow:
    tasks:
      items:
      process: items
"#;

async fn build_cache() -> (tempfile::TempDir, TaskStateCache) {
    let guard = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::try_from(guard.path().to_path_buf()).unwrap();
    std::fs::write(root.join("kptn.yaml"), PIPELINE_YAML).unwrap();
    let py_dir = root.join("py_tasks");
    std::fs::create_dir_all(&py_dir).unwrap();
    std::fs::write(
        py_dir.join("items.py"),
        "def items():\n    return [\"a\", \"b\", \"c\"]\n",
    )
    .unwrap();
    std::fs::write(py_dir.join("process.py"), "def process(item):\n    return None\n").unwrap();

    let mut registry = TaskRegistry::new();
    registry.register_fn("items", |_args| Ok(Some(json!(["a", "b", "c"]))));
    registry.register_fn("process", |_args| Ok(None));

    let config_path = root.join("kptn.yaml");
    let catalog = Catalog::load(&[config_path.clone()]).unwrap();
    let options = PipelineOptions::from_config_path(&config_path, Some("flow")).unwrap();
    let cache = TaskStateCache::new(
        options,
        catalog,
        Arc::new(MemoryStore::new()),
        FactoryRegistry::new(),
        registry,
    )
    .unwrap();
    (guard, cache)
}

#[tokio::test]
async fn test_unselected_task_short_circuits() {
    let (_guard, cache) = build_cache().await;
    let response = decide_task_execution(
        &cache,
        &json!({"task_name": "process", "task_list": "items,other"}),
    )
    .await
    .unwrap();

    assert!(!response.should_run);
    assert_eq!(response.reason.as_deref(), Some("Task not selected"));
    assert_eq!(response.array_size, None);
}

#[tokio::test]
async fn test_first_decision_carries_array_size_and_mode() {
    let (_guard, cache) = build_cache().await;
    vanilla::run_task_vanilla(&cache, "items", "No cached state")
        .await
        .unwrap();

    let response = decide_task_execution(
        &cache,
        &json!({
            "task_name": "process",
            "task_list": ["items", "process"],
            "execution_mode": "batch_array"
        }),
    )
    .await
    .unwrap();

    assert!(response.should_run);
    assert_eq!(response.reason.as_deref(), Some("No cached state"));
    assert_eq!(response.array_size, Some(3));
    assert_eq!(response.execution_mode.as_deref(), Some("batch_array"));

    let encoded = serde_json::to_value(&response).unwrap();
    assert_eq!(
        encoded,
        json!({
            "task_name": "process",
            "should_run": true,
            "reason": "No cached state",
            "array_size": 3,
            "execution_mode": "batch_array"
        })
    );
}

#[tokio::test]
async fn test_cache_hit_omits_reason_on_the_wire() {
    let (_guard, cache) = build_cache().await;
    vanilla::run_task_vanilla(&cache, "items", "No cached state")
        .await
        .unwrap();
    vanilla::run_task_vanilla(&cache, "process", "No cached state")
        .await
        .unwrap();

    let response = decide_task_execution(&cache, &json!({"task_name": "process"}))
        .await
        .unwrap();
    assert!(!response.should_run);

    let encoded = serde_json::to_value(&response).unwrap();
    assert_eq!(
        encoded,
        json!({"task_name": "process", "should_run": false})
    );
}

#[tokio::test]
async fn test_state_payload_supplies_fields() {
    let (_guard, cache) = build_cache().await;
    let response = decide_task_execution(
        &cache,
        &json!({"state": {"task_name": "process", "ignore_cache": true}}),
    )
    .await
    .unwrap();
    assert!(response.should_run);
    assert_eq!(response.reason.as_deref(), Some("No cached state"));
}
