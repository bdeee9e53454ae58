//! The runtime-config resolver.
//!
//! Turns the `config` block of merged YAML into a flat mapping of parameter
//! name to materialised value: plain data copied through, `include` files
//! deep-merged, `module:attr` references invoked through the factory
//! registry, and `{value|function, alias|parameter_name}` entries registered
//! under both their own key and their alias.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::{Error, FactoryRegistry, RuntimeValue, TaskInfo};

fn callable_pattern() -> Regex {
    Regex::new(r"^[A-Za-z_][\w.]*:[A-Za-z_][\w.]*$").unwrap()
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Intermediate resolution tree: nested structure that may hold resource
/// handles before collapsing to flat entries.
#[derive(Clone)]
enum Resolved {
    Data(serde_json::Value),
    Resource(std::sync::Arc<dyn std::any::Any + Send + Sync>),
    Map(BTreeMap<String, Resolved>),
    List(Vec<Resolved>),
}

impl Resolved {
    fn from_runtime_value(value: RuntimeValue) -> Self {
        match value {
            RuntimeValue::Data(data) => Resolved::Data(data),
            RuntimeValue::Resource(handle) => Resolved::Resource(handle),
        }
    }

    /// Collapse into a flat entry value. Maps and lists fold back into plain
    /// JSON; a resource buried inside one is a configuration error.
    fn into_runtime_value(self, key: &str) -> Result<RuntimeValue, Error> {
        match self {
            Resolved::Data(data) => Ok(RuntimeValue::Data(data)),
            Resolved::Resource(handle) => Ok(RuntimeValue::Resource(handle)),
            Resolved::Map(entries) => {
                let mut object = serde_json::Map::new();
                for (name, entry) in entries {
                    match entry.into_runtime_value(&name)? {
                        RuntimeValue::Data(data) => {
                            object.insert(name, data);
                        }
                        RuntimeValue::Resource(_) => {
                            return Err(Error::NestedResource(key.to_string()))
                        }
                    }
                }
                Ok(RuntimeValue::Data(serde_json::Value::Object(object)))
            }
            Resolved::List(entries) => {
                let mut items = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry.into_runtime_value(key)? {
                        RuntimeValue::Data(data) => items.push(data),
                        RuntimeValue::Resource(_) => {
                            return Err(Error::NestedResource(key.to_string()))
                        }
                    }
                }
                Ok(RuntimeValue::Data(serde_json::Value::Array(items)))
            }
        }
    }
}

struct ResolvedEntry {
    value: Resolved,
    aliases: Vec<(String, Resolved)>,
}

/// The resolved `config` block: parameter name to runtime value.
#[derive(Debug, Default)]
pub struct RuntimeConfig {
    entries: BTreeMap<String, RuntimeValue>,
}

impl RuntimeConfig {
    /// Resolve a config block. `base_dir` anchors relative `include` paths;
    /// `task_info` is forwarded to factories.
    pub fn resolve(
        config_block: &serde_json::Map<String, serde_json::Value>,
        base_dir: &Utf8Path,
        registry: &FactoryRegistry,
        task_info: Option<&TaskInfo>,
    ) -> Result<Self, Error> {
        let resolver = Resolver {
            base_dir: base_dir.to_path_buf(),
            registry,
            task_info,
            pattern: callable_pattern(),
        };
        let top =
            resolver.resolve_mapping(&serde_json::Value::Object(config_block.clone()))?;
        let Resolved::Map(map) = top.value else {
            return Err(Error::ConfigBlockNotMapping);
        };

        validate_duckdb_entry(&map)?;

        let mut entries = BTreeMap::new();
        for (key, resolved) in map {
            let value = resolved.into_runtime_value(&key)?;
            entries.insert(key, value);
        }
        Ok(RuntimeConfig { entries })
    }

    pub fn get(&self, name: &str) -> Option<&RuntimeValue> {
        self.entries.get(name)
    }

    pub fn data(&self, name: &str) -> Option<&serde_json::Value> {
        self.entries.get(name).and_then(RuntimeValue::as_data)
    }

    pub fn resource<T: std::any::Any + Send + Sync>(&self, name: &str) -> Option<std::sync::Arc<T>> {
        self.entries.get(name).and_then(RuntimeValue::resource)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Plain-data entries only, e.g. for binding named SQL parameters.
    pub fn data_entries(&self) -> BTreeMap<String, serde_json::Value> {
        self.entries
            .iter()
            .filter_map(|(key, value)| value.as_data().map(|data| (key.clone(), data.clone())))
            .collect()
    }
}

fn validate_duckdb_entry(map: &BTreeMap<String, Resolved>) -> Result<(), Error> {
    // A duckdb mapping that still carries alias keys after resolution never
    // named a function to call.
    if let Some(Resolved::Map(entry)) = map.get("duckdb") {
        let has_alias = entry.contains_key("alias") || entry.contains_key("parameter_name");
        if has_alias && !entry.contains_key("function") {
            return Err(Error::DuckdbEntryMissingFunction);
        }
    }
    Ok(())
}

struct Resolver<'a> {
    base_dir: Utf8PathBuf,
    registry: &'a FactoryRegistry,
    task_info: Option<&'a TaskInfo>,
    pattern: Regex,
}

impl Resolver<'_> {
    fn resolve_entry(&self, value: &serde_json::Value) -> Result<ResolvedEntry, Error> {
        match value {
            serde_json::Value::Object(map) => {
                if map.contains_key("value") || map.contains_key("function") {
                    self.resolve_config_entry(map)
                } else {
                    self.resolve_mapping(value)
                }
            }
            serde_json::Value::Array(items) => {
                let mut resolved_items = Vec::with_capacity(items.len());
                for item in items {
                    let entry = self.resolve_entry(item)?;
                    if !entry.aliases.is_empty() {
                        return Err(Error::AliasNotSupported("inside lists"));
                    }
                    resolved_items.push(entry.value);
                }
                Ok(ResolvedEntry {
                    value: Resolved::List(resolved_items),
                    aliases: Vec::new(),
                })
            }
            serde_json::Value::String(text) => {
                let trimmed = text.trim();
                if self.pattern.is_match(trimmed) {
                    let value = self.registry.invoke(trimmed, self.task_info)?;
                    Ok(ResolvedEntry {
                        value: Resolved::from_runtime_value(value),
                        aliases: Vec::new(),
                    })
                } else {
                    Ok(ResolvedEntry {
                        value: Resolved::Data(value.clone()),
                        aliases: Vec::new(),
                    })
                }
            }
            other => Ok(ResolvedEntry {
                value: Resolved::Data(other.clone()),
                aliases: Vec::new(),
            }),
        }
    }

    fn resolve_mapping(&self, value: &serde_json::Value) -> Result<ResolvedEntry, Error> {
        let serde_json::Value::Object(map) = value else {
            return Err(Error::ConfigBlockNotMapping);
        };

        let mut merged: BTreeMap<String, Resolved> = BTreeMap::new();
        if let Some(include_value) = map.get("include") {
            for include_path in normalise_includes(include_value)? {
                let raw = self.load_include(&include_path)?;
                let entry = self.resolve_entry(&raw)?;
                let Resolved::Map(included) = entry.value else {
                    return Err(Error::IncludeNotMapping(include_path));
                };
                merged = deep_merge(merged, included);
                for (alias, alias_value) in entry.aliases {
                    merged.insert(alias, alias_value);
                }
            }
        }

        let mut current: BTreeMap<String, Resolved> = BTreeMap::new();
        let mut aliases: Vec<(String, Resolved)> = Vec::new();
        for (key, raw_value) in map {
            if key == "include" {
                continue;
            }
            let entry = self.resolve_entry(raw_value)?;
            current.insert(key.clone(), entry.value);
            aliases.extend(entry.aliases);
        }

        let mut resolved = deep_merge(merged, current);
        for (alias, alias_value) in aliases {
            resolved.insert(alias, alias_value);
        }

        Ok(ResolvedEntry {
            value: Resolved::Map(resolved),
            aliases: Vec::new(),
        })
    }

    fn resolve_config_entry(
        &self,
        map: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ResolvedEntry, Error> {
        if map.contains_key("include") {
            return Err(Error::UnsupportedEntryKeys("include".to_string()));
        }

        let alias_name = coalesce_alias(map.get("alias"), map.get("parameter_name"))?;

        let has_value = map.contains_key("value");
        let has_function = map.contains_key("function");
        if has_value && has_function {
            return Err(Error::EntryValueAndFunction);
        }

        let resolved_value = if has_function {
            let function_spec = map
                .get("function")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| {
                    Error::MalformedCallable(
                        map.get("function")
                            .map(|value| value.to_string())
                            .unwrap_or_default(),
                    )
                })?;
            let trimmed = function_spec.trim();
            if !self.pattern.is_match(trimmed) {
                return Err(Error::MalformedCallable(trimmed.to_string()));
            }
            Resolved::from_runtime_value(self.registry.invoke(trimmed, self.task_info)?)
        } else if has_value {
            let entry = self.resolve_entry(&map["value"])?;
            if !entry.aliases.is_empty() {
                return Err(Error::AliasNotSupported("within config 'value' fields"));
            }
            entry.value
        } else {
            return Err(Error::EntryMissingValue);
        };

        let extra_keys: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|key| !matches!(*key, "value" | "function" | "alias" | "parameter_name"))
            .collect();
        if !extra_keys.is_empty() {
            let mut sorted = extra_keys;
            sorted.sort();
            return Err(Error::UnsupportedEntryKeys(sorted.join(", ")));
        }

        let aliases = match alias_name {
            Some(alias) => vec![(alias, resolved_value.clone())],
            None => Vec::new(),
        };
        Ok(ResolvedEntry {
            value: resolved_value,
            aliases,
        })
    }

    fn load_include(&self, include_entry: &str) -> Result<serde_json::Value, Error> {
        let entry_path = Utf8Path::new(include_entry);
        let resolved_path = if entry_path.is_absolute() {
            entry_path.to_path_buf()
        } else {
            self.base_dir.join(entry_path)
        };
        if !resolved_path.exists() {
            return Err(Error::IncludeNotFound {
                include: include_entry.to_string(),
                resolved: resolved_path.to_string(),
            });
        }

        let contents =
            std::fs::read_to_string(&resolved_path).map_err(|e| Error::io(&resolved_path, e))?;
        match resolved_path.extension().map(str::to_lowercase).as_deref() {
            Some("json") => serde_json::from_str(&contents).map_err(|error| Error::Parse {
                path: resolved_path.to_string(),
                message: error.to_string(),
            }),
            Some("yml") | Some("yaml") => {
                let yaml: serde_yaml::Value =
                    serde_yaml::from_str(&contents).map_err(|error| Error::Parse {
                        path: resolved_path.to_string(),
                        message: error.to_string(),
                    })?;
                serde_json::to_value(yaml).map_err(|error| Error::Parse {
                    path: resolved_path.to_string(),
                    message: error.to_string(),
                })
            }
            _ => Ok(serde_json::Value::String(contents)),
        }
    }
}

fn coalesce_alias(
    alias: Option<&serde_json::Value>,
    parameter_name: Option<&serde_json::Value>,
) -> Result<Option<String>, Error> {
    let normalise = |value: &serde_json::Value| -> Result<String, Error> {
        let text = value
            .as_str()
            .ok_or_else(|| Error::InvalidAlias(value.to_string()))?
            .trim()
            .to_string();
        if !is_identifier(&text) {
            return Err(Error::InvalidAlias(text));
        }
        Ok(text)
    };

    match (alias, parameter_name) {
        (Some(alias), Some(parameter)) => {
            let alias = normalise(alias)?;
            let parameter = normalise(parameter)?;
            if alias != parameter {
                return Err(Error::ConflictingAlias);
            }
            Ok(Some(alias))
        }
        (Some(alias), None) => Ok(Some(normalise(alias)?)),
        (None, Some(parameter)) => Ok(Some(normalise(parameter)?)),
        (None, None) => Ok(None),
    }
}

fn normalise_includes(include_value: &serde_json::Value) -> Result<Vec<String>, Error> {
    match include_value {
        serde_json::Value::String(text) => Ok(vec![text.clone()]),
        serde_json::Value::Array(items) => {
            let mut includes = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(text) => includes.push(text.to_string()),
                    None => return Err(Error::InvalidInclude),
                }
            }
            Ok(includes)
        }
        _ => Err(Error::InvalidInclude),
    }
}

fn deep_merge(
    first: BTreeMap<String, Resolved>,
    second: BTreeMap<String, Resolved>,
) -> BTreeMap<String, Resolved> {
    let mut merged = first;
    for (key, value) in second {
        match (merged.remove(&key), value) {
            (Some(Resolved::Map(existing)), Resolved::Map(incoming)) => {
                merged.insert(key, Resolved::Map(deep_merge(existing, incoming)));
            }
            (_, value) => {
                merged.insert(key, value);
            }
        }
    }
    merged
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn block(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test config must be an object"),
        }
    }

    fn resolve(
        value: serde_json::Value,
        registry: &FactoryRegistry,
    ) -> Result<RuntimeConfig, Error> {
        RuntimeConfig::resolve(&block(value), Utf8Path::new("."), registry, None)
    }

    #[test]
    fn test_scalars_copy_through() {
        let config = resolve(
            json!({"my_global": 42, "name": "bravo", "nested": {"a": 1}}),
            &FactoryRegistry::new(),
        )
        .unwrap();
        assert_eq!(config.data("my_global"), Some(&json!(42)));
        assert_eq!(config.data("nested"), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_callable_reference_goes_through_registry() {
        let mut registry = FactoryRegistry::new();
        registry.register_data("src.utils:get_engine", || json!("engine-handle"));
        let config = resolve(json!({"engine": "src.utils:get_engine"}), &registry).unwrap();
        assert_eq!(config.data("engine"), Some(&json!("engine-handle")));
    }

    #[test]
    fn test_unregistered_callable_is_hard_error() {
        let error = resolve(json!({"engine": "src.utils:get_engine"}), &FactoryRegistry::new())
            .unwrap_err();
        assert!(matches!(error, Error::UnknownFactory(_)));
    }

    #[test]
    fn test_entry_mapping_registers_alias_too() {
        let mut registry = FactoryRegistry::new();
        registry.register_data("db:get_conn", || json!("conn"));
        let config = resolve(
            json!({"duckdb": {"function": "db:get_conn", "parameter_name": "con"}}),
            &registry,
        )
        .unwrap();
        assert_eq!(config.data("duckdb"), Some(&json!("conn")));
        assert_eq!(config.data("con"), Some(&json!("conn")));
    }

    #[test]
    fn test_alias_must_be_identifier() {
        let error = resolve(
            json!({"x": {"value": 1, "alias": "not valid"}}),
            &FactoryRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(error, Error::InvalidAlias(_)));
    }

    #[test]
    fn test_value_and_function_conflict() {
        let error = resolve(
            json!({"x": {"value": 1, "function": "a:b"}}),
            &FactoryRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(error, Error::EntryValueAndFunction));
    }

    #[test]
    fn test_conflicting_alias_names_rejected() {
        let error = resolve(
            json!({"x": {"value": 1, "alias": "a", "parameter_name": "b"}}),
            &FactoryRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(error, Error::ConflictingAlias));
    }

    #[test]
    fn test_include_merges_and_loses_to_explicit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let base = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
        std::fs::write(
            base.join("defaults.json"),
            r#"{"year": 2020, "region": "us-east-2"}"#,
        )?;

        let config = RuntimeConfig::resolve(
            &block(json!({"include": ["defaults.json"], "year": 2022})),
            &base,
            &FactoryRegistry::new(),
            None,
        )?;
        assert_eq!(config.data("year"), Some(&json!(2022)));
        assert_eq!(config.data("region"), Some(&json!("us-east-2")));
        Ok(())
    }

    #[test]
    fn test_yaml_include_resolves_callables() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let base = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
        std::fs::write(base.join("extra.yaml"), "engine: src.db:engine\n")?;

        let mut registry = FactoryRegistry::new();
        registry.register_data("src.db:engine", || json!("included-engine"));
        let config = RuntimeConfig::resolve(
            &block(json!({"include": "extra.yaml"})),
            &base,
            &registry,
            None,
        )?;
        assert_eq!(config.data("engine"), Some(&json!("included-engine")));
        Ok(())
    }

    #[test]
    fn test_missing_include_is_error() {
        let error = resolve(json!({"include": "gone.yaml"}), &FactoryRegistry::new()).unwrap_err();
        assert!(matches!(error, Error::IncludeNotFound { .. }));
    }

    #[test]
    fn test_resource_entries_are_typed_handles() {
        struct Engine;
        let mut registry = FactoryRegistry::new();
        registry.register_resource("db:engine", || std::sync::Arc::new(Engine));

        let config = resolve(json!({"duckdb": "db:engine"}), &registry).unwrap();
        assert!(config.resource::<Engine>("duckdb").is_some());
        assert_eq!(config.data_entries().len(), 0);
    }

    #[test]
    fn test_nested_resource_is_rejected() {
        struct Engine;
        let mut registry = FactoryRegistry::new();
        registry.register_resource("db:engine", || std::sync::Arc::new(Engine));

        let error = resolve(json!({"outer": {"inner": "db:engine"}}), &registry).unwrap_err();
        assert!(matches!(error, Error::NestedResource(_)));
    }

    #[test]
    fn test_duckdb_mapping_without_function_is_rejected() {
        let error = resolve(
            json!({"duckdb": {"parameter_name": "con"}}),
            &FactoryRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(error, Error::DuckdbEntryMissingFunction));
    }

    #[test]
    fn test_task_info_reaches_factories() {
        let mut registry = FactoryRegistry::new();
        registry.register("ctx:lang", |info: Option<&TaskInfo>| {
            Ok(crate::RuntimeValue::Data(json!(info
                .and_then(|i| i.task_lang.clone())
                .unwrap_or_default())))
        });
        let info = TaskInfo {
            task_name: Some("t".to_string()),
            task_lang: Some("r".to_string()),
        };
        let config = RuntimeConfig::resolve(
            &block(json!({"lang": "ctx:lang"})),
            Utf8Path::new("."),
            &registry,
            Some(&info),
        )
        .unwrap();
        assert_eq!(config.data("lang"), Some(&json!("r")));
    }
}
