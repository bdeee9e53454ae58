//! Persistent task records and their wire forms.

use serde::{Deserialize, Serialize};

/// Aggregate outcome of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(rename = "INCOMPLETE")]
    Incomplete,
}

impl AsRef<str> for TaskStatus {
    fn as_ref(&self) -> &str {
        match self {
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Incomplete => "INCOMPLETE",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILURE" => Ok(TaskStatus::Failure),
            "INCOMPLETE" => Ok(TaskStatus::Incomplete),
            other => Err(crate::Error::InvalidStatus {
                status: other.to_string(),
            }),
        }
    }
}

/// The per-task record. All timestamps are ISO-8601 strings; the three
/// `*_version` digests are computed from the stored hash material rather than
/// persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Ordered list of `{name, hash}` entries for the task's code closure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_hashes: Option<serde_json::Value>,
    /// Canonical JSON of `{dependency -> outputs_version}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_hashes: Option<String>,
    /// Canonical JSON of `{dependency -> output_data_version}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_data_hashes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_data_version: Option<String>,
    /// Cached task data, populated on request from TASKDATABIN/SUBSETBIN.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taskdata_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subset_count: Option<i64>,
}

impl TaskState {
    pub fn code_version(&self) -> Option<String> {
        self.code_hashes.as_ref().and_then(kptn_hash::hash_value)
    }

    pub fn inputs_version(&self) -> Option<String> {
        self.input_hashes
            .as_deref()
            .map(|text| kptn_hash::hash_bytes(text.as_bytes()))
    }

    pub fn input_data_version(&self) -> Option<String> {
        self.input_data_hashes
            .as_deref()
            .map(|text| kptn_hash::hash_bytes(text.as_bytes()))
    }
}

/// One element of a mapped task, addressed by global index `i`. Serialised
/// with the camelCase field names the bins store on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub i: usize,
    pub key: String,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none", default)]
    pub start_time: Option<String>,
    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none", default)]
    pub end_time: Option<String>,
    #[serde(rename = "outputHash", skip_serializing_if = "Option::is_none", default)]
    pub output_hash: Option<String>,
}

impl Subtask {
    pub fn new(i: usize, key: impl Into<String>) -> Self {
        Self {
            i,
            key: key.into(),
            start_time: None,
            end_time: None,
            output_hash: None,
        }
    }
}

/// Partial update applied by `update_task`. Unset fields are left untouched;
/// the store stamps `updated_at` on every write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStateUpdate {
    pub code_hashes: Option<serde_json::Value>,
    pub input_hashes: Option<String>,
    pub input_data_hashes: Option<String>,
    pub outputs_version: Option<String>,
    pub output_data_version: Option<String>,
    pub status: Option<TaskStatus>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub subtask_count: Option<i64>,
    pub taskdata_count: Option<i64>,
    pub subset_count: Option<i64>,
}

/// Terminal fields written by `set_task_ended`.
#[derive(Debug, Clone, Default)]
pub struct TaskCompletion {
    pub result: Option<serde_json::Value>,
    pub result_hash: Option<String>,
    pub outputs_version: Option<String>,
    pub status: Option<TaskStatus>,
    pub subset_mode: bool,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [TaskStatus::Success, TaskStatus::Failure, TaskStatus::Incomplete] {
            let parsed: TaskStatus = status.as_ref().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("RUNNING".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_code_version_tracks_code_hashes() {
        let mut state = TaskState::default();
        assert_eq!(state.code_version(), None);

        state.code_hashes = Some(json!([{"name": "a.fn", "hash": "deadbeef"}]));
        let first = state.code_version();
        assert!(first.is_some());

        state.code_hashes = Some(json!([{"name": "a.fn", "hash": "cafef00d"}]));
        assert_ne!(state.code_version(), first);
    }

    #[test]
    fn test_subtask_serialises_with_camel_case_fields() {
        let subtask = Subtask {
            i: 3,
            key: "T1,1".to_string(),
            start_time: Some("2024-01-01T00:00:00".to_string()),
            end_time: None,
            output_hash: None,
        };
        let encoded = serde_json::to_value(&subtask).unwrap();
        assert_eq!(
            encoded,
            json!({"i": 3, "key": "T1,1", "startTime": "2024-01-01T00:00:00"})
        );
    }
}
