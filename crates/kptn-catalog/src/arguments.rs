//! Argument plans: which keywords a task will receive, and under which name
//! each dependency's cached data is delivered.

use indexmap::IndexMap;

use crate::TaskDefinition;

/// What the coordinator will supply to a task callable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskArgumentPlan {
    /// Keywords the task can expect (static args, map_over keys, dep data).
    pub expected_kwargs: Vec<String>,
    /// Dependency name -> kwarg alias from `args: {x: {ref: "<dep>"}}`.
    pub alias_lookup: IndexMap<String, String>,
    /// Configuration issues found while planning; logged, not fatal.
    pub errors: Vec<String>,
}

/// Infer the keyword arguments kptn will provide to a task.
pub fn build_task_argument_plan(
    task_spec: &TaskDefinition,
    dependencies: &[String],
) -> TaskArgumentPlan {
    let mut plan = TaskArgumentPlan::default();

    let mut push_expected = |plan: &mut TaskArgumentPlan, name: &str| {
        let name = name.trim();
        if !name.is_empty() && !plan.expected_kwargs.iter().any(|existing| existing == name) {
            plan.expected_kwargs.push(name.to_string());
        }
    };

    if let Some(args) = &task_spec.args {
        for (arg_name, arg_value) in args {
            push_expected(&mut plan, arg_name);
            if let Some(ref_target) = arg_value.get("ref") {
                match ref_target.as_str() {
                    Some(target) => {
                        plan.alias_lookup
                            .insert(target.to_string(), arg_name.clone());
                    }
                    None => plan.errors.push(format!(
                        "args.{arg_name} has unsupported ref target {ref_target}"
                    )),
                }
            }
        }
    }

    for (ref_target, arg_name) in &plan.alias_lookup.clone() {
        if !dependencies.iter().any(|dep| dep == ref_target) {
            plan.errors.push(format!(
                "args.{arg_name} references '{ref_target}', but it is not listed as a dependency"
            ));
        }
    }

    if let Some(map_over) = &task_spec.map_over {
        for part in map_over.split(',') {
            push_expected(&mut plan, part);
        }
    }

    plan
}

/// The keyword under which a dependency's cached data reaches the consumer:
/// the dep's `iterable_item` when the consumer maps over it, else the
/// consumer's alias for it, else the dependency name. Dependencies that don't
/// cache their result deliver nothing.
pub fn resolve_dependency_key(
    task_spec: &TaskDefinition,
    dep_name: &str,
    dep_spec: &TaskDefinition,
    alias_lookup: &IndexMap<String, String>,
) -> Option<String> {
    if !dep_spec.should_cache_result() {
        return None;
    }
    if task_spec.is_mapped() {
        if let Some(iterable_item) = &dep_spec.iterable_item {
            if !iterable_item.is_empty() {
                return Some(iterable_item.clone());
            }
        }
    }
    if let Some(alias) = alias_lookup.get(dep_name) {
        if !alias.is_empty() {
            return Some(alias.clone());
        }
    }
    Some(dep_name.to_string())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn task(yaml: &str) -> TaskDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_plan_collects_static_args_and_map_keys() {
        let spec = task("file: t.py\nmap_over: item1,item2\nargs:\n  year: 2022\n");
        let plan = build_task_argument_plan(&spec, &[]);
        assert_eq!(plan.expected_kwargs, vec!["year", "item1", "item2"]);
        assert!(plan.errors.is_empty());
    }

    #[test]
    fn test_ref_args_build_alias_lookup() {
        let spec = task("file: t.py\nargs:\n  rows:\n    ref: producer\n");
        let plan = build_task_argument_plan(&spec, &["producer".to_string()]);
        assert_eq!(plan.alias_lookup.get("producer"), Some(&"rows".to_string()));
        assert!(plan.errors.is_empty());
    }

    #[test]
    fn test_ref_to_non_dependency_is_recorded() {
        let spec = task("file: t.py\nargs:\n  rows:\n    ref: stranger\n");
        let plan = build_task_argument_plan(&spec, &["producer".to_string()]);
        assert_eq!(plan.errors.len(), 1);
        assert!(plan.errors[0].contains("stranger"));
    }

    #[test]
    fn test_dependency_key_prefers_iterable_item_for_mapped_consumers() {
        let consumer = task("file: t.py\nmap_over: item\n");
        let dep = task("file: d.py\ncache_result: true\niterable_item: item\n");
        let key = resolve_dependency_key(&consumer, "dep", &dep, &IndexMap::new());
        assert_eq!(key, Some("item".to_string()));
    }

    #[test]
    fn test_dependency_key_falls_back_to_alias_then_name() {
        let consumer = task("file: t.py\n");
        let dep = task("file: d.py\ncache_result: true\n");

        let mut aliases = IndexMap::new();
        aliases.insert("dep".to_string(), "rows".to_string());
        assert_eq!(
            resolve_dependency_key(&consumer, "dep", &dep, &aliases),
            Some("rows".to_string())
        );
        assert_eq!(
            resolve_dependency_key(&consumer, "dep", &dep, &IndexMap::new()),
            Some("dep".to_string())
        );
    }

    #[test]
    fn test_uncached_dependency_delivers_nothing() {
        let consumer = task("file: t.py\n");
        let dep = task("file: d.py\n");
        assert_eq!(
            resolve_dependency_key(&consumer, "dep", &dep, &IndexMap::new()),
            None
        );
    }

    #[test]
    fn test_ref_target_must_be_string() {
        let mut spec = task("file: t.py\n");
        let mut args = IndexMap::new();
        args.insert("rows".to_string(), json!({"ref": 7}));
        spec.args = Some(args);
        let plan = build_task_argument_plan(&spec, &[]);
        assert_eq!(plan.errors.len(), 1);
    }
}
