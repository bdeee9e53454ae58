//! Built-in handles for R script and DuckDB SQL tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use kptn_config::RuntimeValue;
use kptn_hash::DuckdbEngine;
use tracing::{debug, info};

use crate::{
    sql,
    task_handle::{ParamSpec, TaskArgs, TaskHandle},
};

/// Concrete resource wrapper so a DuckDB engine can travel through the
/// runtime config's typed resource slot.
pub struct DuckdbResource(pub Arc<dyn DuckdbEngine>);

impl DuckdbResource {
    pub fn engine(args: &TaskArgs) -> Option<Arc<dyn DuckdbEngine>> {
        args.get("duckdb")
            .and_then(RuntimeValue::resource::<DuckdbResource>)
            .map(|resource| resource.0.clone())
    }
}

/// Runs a task's R script as a subprocess, with the subtask kwargs exported
/// as environment variables.
pub struct RScriptHandle {
    task_name: String,
    script_path: Utf8PathBuf,
    prefix_args: String,
    cli_args: String,
    log_path: Option<Utf8PathBuf>,
}

impl RScriptHandle {
    pub fn new(
        task_name: impl Into<String>,
        script_path: Utf8PathBuf,
        prefix_args: String,
        cli_args: String,
        log_path: Option<Utf8PathBuf>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            script_path,
            prefix_args,
            cli_args,
            log_path,
        }
    }

    fn env_pairs(args: &TaskArgs) -> Vec<(String, String)> {
        args.iter()
            .filter_map(|(name, value)| {
                value.as_data().map(|data| {
                    let text = match data {
                        serde_json::Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    (name.clone(), text)
                })
            })
            .collect()
    }
}

#[async_trait]
impl TaskHandle for RScriptHandle {
    async fn invoke(&self, args: TaskArgs) -> Result<Option<serde_json::Value>, String> {
        let env = Self::env_pairs(&args);
        info!(
            "Calling R script {} for task {} with env {:?}",
            self.script_path, self.task_name, env
        );

        let mut command = tokio::process::Command::new("Rscript");
        for part in self.prefix_args.split_whitespace() {
            command.arg(part);
        }
        command.arg(self.script_path.as_str());
        for part in self.cli_args.split_whitespace() {
            command.arg(part);
        }
        command.envs(env);

        if let Some(log_path) = &self.log_path {
            let log_file = std::fs::File::create(log_path)
                .map_err(|error| format!("unable to open log file {log_path}: {error}"))?;
            let stderr_file = log_file
                .try_clone()
                .map_err(|error| format!("unable to open log file {log_path}: {error}"))?;
            command.stdout(log_file).stderr(stderr_file);
        }

        let status = command
            .status()
            .await
            .map_err(|error| format!("failed to launch Rscript: {error}"))?;
        if !status.success() {
            return Err(format!(
                "R script {} for task {} exited with {status}",
                self.script_path, self.task_name
            ));
        }
        Ok(None)
    }
}

/// Runs a task's DuckDB SQL script statement by statement against the
/// `duckdb` engine from the runtime config.
pub struct DuckdbSqlHandle {
    task_name: String,
    script_path: Utf8PathBuf,
    /// Runtime-config data entries, offered to statements as named
    /// parameters.
    parameters: BTreeMap<String, serde_json::Value>,
    params: Vec<ParamSpec>,
}

impl DuckdbSqlHandle {
    pub fn new(
        task_name: impl Into<String>,
        script_path: Utf8PathBuf,
        parameters: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            script_path,
            parameters,
            params: vec![ParamSpec::required("duckdb")],
        }
    }
}

#[async_trait]
impl TaskHandle for DuckdbSqlHandle {
    fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    async fn invoke(&self, args: TaskArgs) -> Result<Option<serde_json::Value>, String> {
        let engine = DuckdbResource::engine(&args).ok_or_else(|| {
            format!(
                "Task '{}' requires a DuckDB connection named 'duckdb' in the runtime configuration",
                self.task_name
            )
        })?;

        let script = std::fs::read_to_string(&self.script_path)
            .map_err(|error| format!("unable to read {}: {error}", self.script_path))?;
        let script_dir = self
            .script_path
            .parent()
            .map(|parent| parent.to_string())
            .unwrap_or_else(|| ".".to_string());

        let previous_search_path = engine
            .query_scalar("SELECT current_setting('file_search_path')")
            .ok()
            .flatten();

        info!(
            "Executing DuckDB SQL script {} for task {}",
            self.script_path, self.task_name
        );
        engine.execute(
            &format!("SET file_search_path = '{}'", script_dir.replace('\'', "''")),
            &[],
        )?;

        let mut result = Ok(None);
        for statement in sql::split_statements(&script) {
            let params = sql::statement_parameters(&statement, &self.parameters);
            debug!("Executing statement with params {:?}", params.keys());
            let params: Vec<(String, serde_json::Value)> = params.into_iter().collect();
            if let Err(error) = engine.execute(&statement, &params) {
                result = Err(error);
                break;
            }
        }

        let restore = match previous_search_path {
            Some(previous) => engine.execute(
                &format!("SET file_search_path = '{}'", previous.replace('\'', "''")),
                &[],
            ),
            None => engine.execute("RESET file_search_path", &[]),
        };
        if let Err(error) = restore {
            debug!("Failed to restore file_search_path: {error}");
        }

        result
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingEngine {
        statements: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl DuckdbEngine for RecordingEngine {
        fn query_scalar(&self, _sql: &str) -> Result<Option<String>, String> {
            Ok(None)
        }

        fn execute(
            &self,
            sql: &str,
            params: &[(String, serde_json::Value)],
        ) -> Result<(), String> {
            self.statements.lock().unwrap().push((
                sql.to_string(),
                params.iter().map(|(name, _)| name.clone()).collect(),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sql_handle_executes_each_statement() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let script = Utf8PathBuf::try_from(dir.path().join("load.sql"))?;
        std::fs::write(
            &script,
            "CREATE TABLE t (y INT);\nINSERT INTO t VALUES (:year);\n",
        )?;

        let mut parameters = BTreeMap::new();
        parameters.insert("year".to_string(), json!(2022));
        let handle = DuckdbSqlHandle::new("load", script, parameters);

        let engine = Arc::new(RecordingEngine::default());
        let mut args = TaskArgs::new();
        args.insert(
            "duckdb".to_string(),
            RuntimeValue::Resource(Arc::new(DuckdbResource(engine.clone()))),
        );
        handle.invoke(args).await.unwrap();

        let statements = engine.statements.lock().unwrap();
        // search path set + 2 statements + search path reset
        assert_eq!(statements.len(), 4);
        assert!(statements[0].0.starts_with("SET file_search_path"));
        assert_eq!(statements[1].0, "CREATE TABLE t (y INT)");
        assert_eq!(statements[2].1, vec!["year"]);
        assert_eq!(statements[3].0, "RESET file_search_path");
        Ok(())
    }

    #[tokio::test]
    async fn test_sql_handle_requires_engine() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let script = Utf8PathBuf::try_from(dir.path().join("load.sql"))?;
        std::fs::write(&script, "SELECT 1;")?;

        let handle = DuckdbSqlHandle::new("load", script, BTreeMap::new());
        let error = handle.invoke(TaskArgs::new()).await.unwrap_err();
        assert!(error.contains("DuckDB connection named 'duckdb'"));
        Ok(())
    }
}
