//! Task callables as explicit, registered handles.
//!
//! A task's executable side is a [`TaskHandle`]: a polymorphic object with a
//! typed parameter descriptor list and an `invoke` capability. Handles are
//! registered by name; nothing is loaded dynamically at call time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use kptn_config::{RuntimeConfig, RuntimeValue};

use crate::Error;

/// Whether a parameter must be satisfied for the call to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Required,
    Optional,
}

/// One declared parameter of a task callable.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    /// Filesystem-path parameters must be bound to string values.
    pub path: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Required,
            path: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Optional,
            path: false,
        }
    }

    pub fn path(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ParamKind::Required,
            path: true,
        }
    }
}

/// Bound arguments delivered to a handle: explicit kwargs plus runtime-config
/// entries matched by parameter name.
pub type TaskArgs = BTreeMap<String, RuntimeValue>;

/// Read a plain-data argument out of bound args.
pub fn arg_data<'a>(args: &'a TaskArgs, name: &str) -> Option<&'a serde_json::Value> {
    args.get(name).and_then(RuntimeValue::as_data)
}

/// The executable side of a task.
#[async_trait]
pub trait TaskHandle: Send + Sync {
    /// Declared parameters; drives runtime-config binding.
    fn params(&self) -> &[ParamSpec] {
        &[]
    }

    /// Run the task. The returned value, if any, is stored as the task's
    /// cached data. Errors are user-task failures, not store errors.
    async fn invoke(&self, args: TaskArgs) -> Result<Option<serde_json::Value>, String>;
}

/// A handle backed by a closure; the usual way Python-equivalent tasks are
/// registered.
pub struct FnTaskHandle {
    params: Vec<ParamSpec>,
    func: Arc<
        dyn Fn(TaskArgs) -> Result<Option<serde_json::Value>, String> + Send + Sync,
    >,
}

impl FnTaskHandle {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(TaskArgs) -> Result<Option<serde_json::Value>, String> + Send + Sync + 'static,
    {
        Self {
            params: Vec::new(),
            func: Arc::new(func),
        }
    }

    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }
}

#[async_trait]
impl TaskHandle for FnTaskHandle {
    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    async fn invoke(&self, args: TaskArgs) -> Result<Option<serde_json::Value>, String> {
        (self.func)(args)
    }
}

/// Explicit name-to-handle registry.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handles: HashMap<String, Arc<dyn TaskHandle>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_name: impl Into<String>, handle: Arc<dyn TaskHandle>) {
        self.handles.insert(task_name.into(), handle);
    }

    pub fn register_fn<F>(&mut self, task_name: impl Into<String>, func: F)
    where
        F: Fn(TaskArgs) -> Result<Option<serde_json::Value>, String> + Send + Sync + 'static,
    {
        self.register(task_name, Arc::new(FnTaskHandle::new(func)));
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn TaskHandle>> {
        self.handles.get(task_name).cloned()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handles.keys().collect();
        names.sort();
        f.debug_struct("TaskRegistry").field("tasks", &names).finish()
    }
}

/// Bind a call: explicit kwargs pass through; each declared parameter not
/// already provided is looked up in the runtime config by name. Required
/// parameters still unbound afterwards are reported together.
pub fn plan_call(
    task_name: &str,
    params: &[ParamSpec],
    kwargs: &BTreeMap<String, serde_json::Value>,
    runtime: &RuntimeConfig,
) -> Result<TaskArgs, Error> {
    let mut bound: TaskArgs = kwargs
        .iter()
        .map(|(name, value)| (name.clone(), RuntimeValue::Data(value.clone())))
        .collect();

    let mut missing = Vec::new();
    for param in params {
        if !bound.contains_key(&param.name) {
            match runtime.get(&param.name) {
                Some(value) => {
                    bound.insert(param.name.clone(), value.clone());
                }
                None => {
                    if param.kind == ParamKind::Required {
                        missing.push(param.name.clone());
                    }
                }
            }
        }
        if param.path {
            if let Some(RuntimeValue::Data(value)) = bound.get(&param.name) {
                if !value.is_string() {
                    return Err(Error::PathParamNotString {
                        task: task_name.to_string(),
                        param: param.name.clone(),
                    });
                }
            }
        }
    }

    if !missing.is_empty() {
        missing.sort();
        return Err(Error::MissingArguments {
            task: task_name.to_string(),
            missing: missing.join(", "),
        });
    }
    Ok(bound)
}
