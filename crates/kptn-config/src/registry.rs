//! Named-factory registry for `module:attr` callable references.
//!
//! Config entries that name a callable are looked up here instead of loading
//! arbitrary code: registering a factory is explicit, and resolution of an
//! unregistered key fails loudly.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::Error;

/// Task metadata handed to factories that want it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInfo {
    pub task_name: Option<String>,
    pub task_lang: Option<String>,
}

/// A materialised runtime value: plain data, or an opaque shared resource
/// (e.g. a database connection) retrieved by type.
#[derive(Clone)]
pub enum RuntimeValue {
    Data(serde_json::Value),
    Resource(Arc<dyn Any + Send + Sync>),
}

impl RuntimeValue {
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            RuntimeValue::Data(value) => Some(value),
            RuntimeValue::Resource(_) => None,
        }
    }

    pub fn resource<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            RuntimeValue::Resource(handle) => handle.clone().downcast::<T>().ok(),
            RuntimeValue::Data(_) => None,
        }
    }
}

impl std::fmt::Debug for RuntimeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeValue::Data(value) => f.debug_tuple("Data").field(value).finish(),
            RuntimeValue::Resource(_) => f.write_str("Resource(..)"),
        }
    }
}

pub type Factory =
    Arc<dyn Fn(Option<&TaskInfo>) -> Result<RuntimeValue, String> + Send + Sync>;

/// Registry keyed by the same `module:attr` strings the YAML uses.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Factory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(Option<&TaskInfo>) -> Result<RuntimeValue, String> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    /// Convenience for factories returning plain data.
    pub fn register_data<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        self.register(key, move |_| Ok(RuntimeValue::Data(factory())));
    }

    /// Convenience for factories returning a shared resource handle.
    pub fn register_resource<T, F>(&mut self, key: impl Into<String>, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        self.register(key, move |_| {
            Ok(RuntimeValue::Resource(factory() as Arc<dyn Any + Send + Sync>))
        });
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn invoke(
        &self,
        key: &str,
        task_info: Option<&TaskInfo>,
    ) -> Result<RuntimeValue, Error> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| Error::UnknownFactory(key.to_string()))?;
        factory(task_info).map_err(|message| Error::FactoryFailed {
            key: key.to_string(),
            message,
        })
    }
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("FactoryRegistry").field("keys", &keys).finish()
    }
}
