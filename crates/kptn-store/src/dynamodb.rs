//! DynamoDB backend: single-table layout shared by every writer.
//!
//! The task row lives under `PK = BRANCH#<storage_key>`,
//! `SK = PIPELINE#<pipeline>#TASK#<task>`. Each bin gets its own partition
//! (`...#<bin_type>#<bin_id>` with a `BIN#<bin_id>` sort key) so per-subtask
//! updates spread across partitions instead of throttling one.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, StreamSpecification, StreamViewType, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use tracing::debug;

use crate::{
    bins, now_iso, BinKind, Error, StateStore, Subtask, TaskCompletion, TaskState,
    TaskStateUpdate, TaskStatus,
};

/// Max number of items in one BatchWriteItem request.
const DDB_MAX_BATCH_SIZE: usize = 25;

#[derive(Debug, Clone)]
pub struct DynamoStore {
    client: Client,
    table_name: String,
    storage_key: String,
    pipeline: String,
}

fn attr_s(value: impl Into<String>) -> AttributeValue {
    AttributeValue::S(value.into())
}

fn attr_n(value: i64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn get_s(item: &HashMap<String, AttributeValue>, name: &str) -> Option<String> {
    item.get(name).and_then(|value| value.as_s().ok()).cloned()
}

fn get_n(item: &HashMap<String, AttributeValue>, name: &str) -> Option<i64> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|value| value.parse().ok())
}

fn subtask_to_attr(subtask: &Subtask) -> AttributeValue {
    let mut entry = HashMap::new();
    entry.insert("i".to_string(), attr_n(subtask.i as i64));
    entry.insert("key".to_string(), attr_s(subtask.key.clone()));
    if let Some(start_time) = &subtask.start_time {
        entry.insert("startTime".to_string(), attr_s(start_time.clone()));
    }
    if let Some(end_time) = &subtask.end_time {
        entry.insert("endTime".to_string(), attr_s(end_time.clone()));
    }
    if let Some(output_hash) = &subtask.output_hash {
        entry.insert("outputHash".to_string(), attr_s(output_hash.clone()));
    }
    AttributeValue::M(entry)
}

fn attr_to_subtask(value: &AttributeValue) -> Option<Subtask> {
    let entry = value.as_m().ok()?;
    Some(Subtask {
        i: get_n(entry, "i")? as usize,
        key: get_s(entry, "key")?,
        start_time: get_s(entry, "startTime"),
        end_time: get_s(entry, "endTime"),
        output_hash: get_s(entry, "outputHash"),
    })
}

impl DynamoStore {
    /// Build a store from the standard AWS config chain. When
    /// `LOCAL_DYNAMODB=true` the client targets the local endpoint and the
    /// table is created on demand.
    pub async fn new(
        table_name: impl Into<String>,
        storage_key: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Result<Self, Error> {
        let local = std::env::var("LOCAL_DYNAMODB").as_deref() == Ok("true");
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if local {
            loader = loader.endpoint_url("http://dynamodb:8001");
        }
        let config = loader.load().await;
        let store = Self {
            client: Client::new(&config),
            table_name: table_name.into(),
            storage_key: storage_key.into(),
            pipeline: pipeline.into(),
        };
        if local {
            store.ensure_table().await?;
        }
        Ok(store)
    }

    pub fn with_client(
        client: Client,
        table_name: impl Into<String>,
        storage_key: impl Into<String>,
        pipeline: impl Into<String>,
    ) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            storage_key: storage_key.into(),
            pipeline: pipeline.into(),
        }
    }

    async fn ensure_table(&self) -> Result<(), Error> {
        let key_schema = |name: &str, key_type: KeyType| {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(|e| Error::dynamo("create_table key schema", e))
        };
        let attribute = |name: &str| {
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(|e| Error::dynamo("create_table attribute", e))
        };

        let result = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .key_schema(key_schema("PK", KeyType::Hash)?)
            .key_schema(key_schema("SK", KeyType::Range)?)
            .attribute_definitions(attribute("PK")?)
            .attribute_definitions(attribute("SK")?)
            .billing_mode(BillingMode::PayPerRequest)
            .stream_specification(
                StreamSpecification::builder()
                    .stream_enabled(true)
                    .stream_view_type(StreamViewType::NewAndOldImages)
                    .build()
                    .map_err(|e| Error::dynamo("create_table stream specification", e))?,
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                let in_use = error
                    .as_service_error()
                    .is_some_and(|service| service.is_resource_in_use_exception());
                if in_use {
                    Ok(())
                } else {
                    Err(Error::dynamo("create_table", error))
                }
            }
        }
    }

    fn task_pk(&self) -> String {
        format!("BRANCH#{}", self.storage_key)
    }

    fn task_sk(&self, task_name: &str) -> String {
        format!("PIPELINE#{}#TASK#{}", self.pipeline, task_name)
    }

    fn bin_pk(&self, task_name: &str, kind: BinKind, bin_id: &str) -> String {
        format!(
            "BRANCH#{}#PIPELINE#{}#TASK#{}#{}#{}",
            self.storage_key,
            self.pipeline,
            task_name,
            kind.wire_name(),
            bin_id
        )
    }

    fn bin_sk(bin_id: &str) -> String {
        format!("BIN#{bin_id}")
    }

    fn state_attributes(state: &TaskState) -> Result<HashMap<String, AttributeValue>, Error> {
        let mut item = HashMap::new();
        if let Some(code_hashes) = &state.code_hashes {
            item.insert(
                "code_hashes".to_string(),
                attr_s(serde_json::to_string(code_hashes)?),
            );
        }
        if let Some(input_hashes) = &state.input_hashes {
            item.insert("input_hashes".to_string(), attr_s(input_hashes.clone()));
        }
        if let Some(input_data_hashes) = &state.input_data_hashes {
            item.insert(
                "input_data_hashes".to_string(),
                attr_s(input_data_hashes.clone()),
            );
        }
        if let Some(outputs_version) = &state.outputs_version {
            item.insert("outputs_version".to_string(), attr_s(outputs_version.clone()));
        }
        if let Some(output_data_version) = &state.output_data_version {
            item.insert(
                "output_data_version".to_string(),
                attr_s(output_data_version.clone()),
            );
        }
        if let Some(status) = state.status {
            item.insert("status".to_string(), attr_s(status.as_ref()));
        }
        if let Some(start_time) = &state.start_time {
            item.insert("start_time".to_string(), attr_s(start_time.clone()));
        }
        if let Some(end_time) = &state.end_time {
            item.insert("end_time".to_string(), attr_s(end_time.clone()));
        }
        if let Some(subtask_count) = state.subtask_count {
            item.insert("subtask_count".to_string(), attr_n(subtask_count));
        }
        if let Some(taskdata_count) = state.taskdata_count {
            item.insert("taskdata_count".to_string(), attr_n(taskdata_count));
        }
        if let Some(subset_count) = state.subset_count {
            item.insert("subset_count".to_string(), attr_n(subset_count));
        }
        Ok(item)
    }

    fn item_to_state(item: &HashMap<String, AttributeValue>) -> Result<TaskState, Error> {
        let status = match get_s(item, "status") {
            Some(text) => Some(text.parse::<TaskStatus>()?),
            None => None,
        };
        Ok(TaskState {
            code_hashes: get_s(item, "code_hashes")
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            input_hashes: get_s(item, "input_hashes"),
            input_data_hashes: get_s(item, "input_data_hashes"),
            outputs_version: get_s(item, "outputs_version"),
            output_data_version: get_s(item, "output_data_version"),
            data: None,
            status,
            start_time: get_s(item, "start_time"),
            end_time: get_s(item, "end_time"),
            updated_at: get_s(item, "UpdatedAt"),
            subtask_count: get_n(item, "subtask_count"),
            taskdata_count: get_n(item, "taskdata_count"),
            subset_count: get_n(item, "subset_count"),
        })
    }

    async fn get_task_row(&self, task_name: &str) -> Result<Option<TaskState>, Error> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", attr_s(self.task_pk()))
            .key("SK", attr_s(self.task_sk(task_name)))
            .send()
            .await
            .map_err(|e| Error::dynamo(format!("get_task {task_name}"), e))?;
        result.item().map(Self::item_to_state).transpose()
    }

    async fn apply_update(
        &self,
        task_name: &str,
        fields: Vec<(&'static str, AttributeValue)>,
    ) -> Result<(), Error> {
        let mut expression_parts = vec!["#UpdatedAt = :UpdatedAt".to_string()];
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", attr_s(self.task_pk()))
            .key("SK", attr_s(self.task_sk(task_name)))
            .expression_attribute_names("#UpdatedAt", "UpdatedAt")
            .expression_attribute_values(":UpdatedAt", attr_s(now_iso()));
        for (name, value) in fields {
            expression_parts.push(format!("#{name} = :{name}"));
            request = request
                .expression_attribute_names(format!("#{name}"), name)
                .expression_attribute_values(format!(":{name}"), value);
        }
        request
            .update_expression(format!("SET {}", expression_parts.join(", ")))
            .send()
            .await
            .map_err(|e| Error::dynamo(format!("update_task {task_name}"), e))?;
        Ok(())
    }

    async fn get_bin_item(
        &self,
        task_name: &str,
        kind: BinKind,
        bin_id: &str,
    ) -> Result<Option<HashMap<String, AttributeValue>>, Error> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", attr_s(self.bin_pk(task_name, kind, bin_id)))
            .key("SK", attr_s(Self::bin_sk(bin_id)))
            .send()
            .await
            .map_err(|e| Error::dynamo(format!("get bin {kind}#{bin_id} of {task_name}"), e))?;
        Ok(result.item().cloned())
    }

    async fn put_bin_item(
        &self,
        task_name: &str,
        kind: BinKind,
        bin_id: &str,
        payload_attr: (&'static str, AttributeValue),
    ) -> Result<(), Error> {
        let timestamp = now_iso();
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item("PK", attr_s(self.bin_pk(task_name, kind, bin_id)))
            .item("SK", attr_s(Self::bin_sk(bin_id)))
            .item(payload_attr.0, payload_attr.1)
            .item("CreatedAt", attr_s(timestamp.clone()))
            .item("UpdatedAt", attr_s(timestamp))
            .send()
            .await
            .map_err(|e| Error::dynamo(format!("put bin {kind}#{bin_id} of {task_name}"), e))?;
        Ok(())
    }

    /// Delete the named bins in batches of at most 25.
    async fn batch_delete_bins(
        &self,
        task_name: &str,
        kind: BinKind,
        bin_ids: &[String],
    ) -> Result<(), Error> {
        debug!("Deleting {} bins {:?} for {task_name}", kind, bin_ids);
        for chunk in bin_ids.chunks(DDB_MAX_BATCH_SIZE) {
            let mut requests = Vec::with_capacity(chunk.len());
            for bin_id in chunk {
                let delete = aws_sdk_dynamodb::types::DeleteRequest::builder()
                    .key("PK", attr_s(self.bin_pk(task_name, kind, bin_id)))
                    .key("SK", attr_s(Self::bin_sk(bin_id)))
                    .build()
                    .map_err(|e| Error::dynamo("batch delete build", e))?;
                requests.push(WriteRequest::builder().delete_request(delete).build());
            }
            self.client
                .batch_write_item()
                .request_items(&self.table_name, requests)
                .send()
                .await
                .map_err(|e| Error::dynamo(format!("batch delete bins of {task_name}"), e))?;
        }
        Ok(())
    }

    fn update_fields(update: &TaskStateUpdate) -> Result<Vec<(&'static str, AttributeValue)>, Error> {
        let mut fields = Vec::new();
        if let Some(code_hashes) = &update.code_hashes {
            fields.push(("code_hashes", attr_s(serde_json::to_string(code_hashes)?)));
        }
        if let Some(input_hashes) = &update.input_hashes {
            fields.push(("input_hashes", attr_s(input_hashes.clone())));
        }
        if let Some(input_data_hashes) = &update.input_data_hashes {
            fields.push(("input_data_hashes", attr_s(input_data_hashes.clone())));
        }
        if let Some(outputs_version) = &update.outputs_version {
            fields.push(("outputs_version", attr_s(outputs_version.clone())));
        }
        if let Some(output_data_version) = &update.output_data_version {
            fields.push(("output_data_version", attr_s(output_data_version.clone())));
        }
        if let Some(status) = update.status {
            fields.push(("status", attr_s(status.as_ref())));
        }
        if let Some(start_time) = &update.start_time {
            fields.push(("start_time", attr_s(start_time.clone())));
        }
        if let Some(end_time) = &update.end_time {
            fields.push(("end_time", attr_s(end_time.clone())));
        }
        if let Some(subtask_count) = update.subtask_count {
            fields.push(("subtask_count", attr_n(subtask_count)));
        }
        if let Some(taskdata_count) = update.taskdata_count {
            fields.push(("taskdata_count", attr_n(taskdata_count)));
        }
        if let Some(subset_count) = update.subset_count {
            fields.push(("subset_count", attr_n(subset_count)));
        }
        Ok(fields)
    }

    async fn load_taskdata_bins(
        &self,
        task_name: &str,
        kind: BinKind,
        count: usize,
    ) -> Result<serde_json::Value, Error> {
        let bin_ids = bins::bin_ids_for(count);
        let mut payloads: Vec<serde_json::Value> = Vec::new();
        for bin_id in &bin_ids {
            let Some(item) = self.get_bin_item(task_name, kind, bin_id).await? else {
                continue;
            };
            if let Some(data) = get_s(&item, "data") {
                payloads.push(serde_json::from_str(&data)?);
            }
        }
        if payloads.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        if payloads.len() == 1 {
            let single = payloads.remove(0);
            return Ok(single);
        }
        let mut combined = Vec::new();
        for payload in payloads {
            match payload {
                serde_json::Value::Array(items) => combined.extend(items),
                other => combined.push(other),
            }
        }
        Ok(serde_json::Value::Array(combined))
    }
}

#[async_trait::async_trait]
impl StateStore for DynamoStore {
    async fn create_task(
        &self,
        task_name: &str,
        state: &TaskState,
        data: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        let mut state = state.clone();
        let payload = data.cloned().or_else(|| state.data.take());
        if let Some(serde_json::Value::Array(items)) = &payload {
            state.taskdata_count = Some(items.len() as i64);
        }

        let timestamp = now_iso();
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item("PK", attr_s(self.task_pk()))
            .item("SK", attr_s(self.task_sk(task_name)))
            .item("TaskId", attr_s(task_name))
            .item("CreatedAt", attr_s(timestamp.clone()))
            .item("UpdatedAt", attr_s(timestamp));
        for (name, value) in Self::state_attributes(&state)? {
            request = request.item(name, value);
        }
        request
            .send()
            .await
            .map_err(|e| Error::dynamo(format!("create_task {task_name}"), e))?;

        if let Some(payload) = payload {
            self.create_taskdata(task_name, &payload, BinKind::Taskdata)
                .await?;
        }
        Ok(())
    }

    async fn get_task(
        &self,
        task_name: &str,
        include_data: bool,
        subset_mode: bool,
    ) -> Result<Option<TaskState>, Error> {
        let Some(mut state) = self.get_task_row(task_name).await? else {
            return Ok(None);
        };
        if include_data {
            let taskdata_count = state.taskdata_count.unwrap_or(0).max(0) as usize;
            let data = if subset_mode {
                let subset_count = state.subset_count.unwrap_or(0).max(0) as usize;
                let subset = self
                    .load_taskdata_bins(task_name, BinKind::Subset, subset_count)
                    .await?;
                if subset.is_null() {
                    self.load_taskdata_bins(task_name, BinKind::Taskdata, taskdata_count)
                        .await?
                } else {
                    subset
                }
            } else {
                self.load_taskdata_bins(task_name, BinKind::Taskdata, taskdata_count)
                    .await?
            };
            if !data.is_null() {
                state.data = Some(data);
            }
        }
        Ok(Some(state))
    }

    async fn get_tasks(&self) -> Result<Vec<TaskState>, Error> {
        let result = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("PK = :pk AND begins_with(SK, :prefix)")
            .expression_attribute_values(":pk", attr_s(self.task_pk()))
            .expression_attribute_values(
                ":prefix",
                attr_s(format!("PIPELINE#{}#TASK#", self.pipeline)),
            )
            .send()
            .await
            .map_err(|e| Error::dynamo("get_tasks", e))?;
        result.items().iter().map(Self::item_to_state).collect()
    }

    async fn update_task(&self, task_name: &str, update: &TaskStateUpdate) -> Result<(), Error> {
        self.apply_update(task_name, Self::update_fields(update)?)
            .await
    }

    async fn delete_task(&self, task_name: &str) -> Result<(), Error> {
        let Some(state) = self.get_task_row(task_name).await? else {
            return Ok(());
        };
        for kind in [BinKind::Subtask, BinKind::Taskdata, BinKind::Subset] {
            let count = match kind {
                BinKind::Subtask => state.subtask_count,
                BinKind::Taskdata => state.taskdata_count,
                BinKind::Subset => state.subset_count,
            }
            .unwrap_or(0)
            .max(0) as usize;
            let bin_ids = bins::bin_ids_for(count);
            self.batch_delete_bins(task_name, kind, &bin_ids).await?;
        }

        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key("PK", attr_s(self.task_pk()))
            .key("SK", attr_s(self.task_sk(task_name)))
            .send()
            .await
            .map_err(|e| Error::dynamo(format!("delete_task {task_name}"), e))?;
        Ok(())
    }

    async fn create_taskdata(
        &self,
        task_name: &str,
        data: &serde_json::Value,
        kind: BinKind,
    ) -> Result<(), Error> {
        match data {
            serde_json::Value::Array(items) => {
                for (bin_id, chunk) in bins::chunk_list(items) {
                    let payload = serde_json::Value::Array(chunk.to_vec());
                    self.put_bin_item(
                        task_name,
                        kind,
                        &bin_id,
                        ("data", attr_s(serde_json::to_string(&payload)?)),
                    )
                    .await?;
                }
            }
            scalar => {
                self.put_bin_item(
                    task_name,
                    kind,
                    "0",
                    ("data", attr_s(serde_json::to_string(scalar)?)),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn get_taskdata(
        &self,
        task_name: &str,
        subset_mode: bool,
    ) -> Result<serde_json::Value, Error> {
        let Some(state) = self.get_task_row(task_name).await? else {
            return Ok(serde_json::Value::Null);
        };
        let (kind, count) = if subset_mode {
            (BinKind::Subset, state.subset_count)
        } else {
            (BinKind::Taskdata, state.taskdata_count)
        };
        self.load_taskdata_bins(task_name, kind, count.unwrap_or(0).max(0) as usize)
            .await
    }

    async fn create_subtasks(
        &self,
        task_name: &str,
        keys: &[String],
        update_count: bool,
    ) -> Result<(), Error> {
        if update_count {
            self.apply_update(task_name, vec![("subtask_count", attr_n(keys.len() as i64))])
                .await?;
        }
        for (bin_id, subtasks) in bins::chunk_subtask_keys(keys) {
            let items: Vec<AttributeValue> = subtasks.iter().map(subtask_to_attr).collect();
            self.put_bin_item(
                task_name,
                BinKind::Subtask,
                &bin_id,
                ("items", AttributeValue::L(items)),
            )
            .await?;
        }
        Ok(())
    }

    async fn get_subtasks(&self, task_name: &str) -> Result<Vec<Subtask>, Error> {
        let Some(state) = self.get_task_row(task_name).await? else {
            return Ok(Vec::new());
        };
        let count = state.subtask_count.unwrap_or(0).max(0) as usize;
        let mut subtasks = Vec::with_capacity(count);
        for bin_id in bins::bin_ids_for(count) {
            let Some(item) = self
                .get_bin_item(task_name, BinKind::Subtask, &bin_id)
                .await?
            else {
                continue;
            };
            if let Some(AttributeValue::L(items)) = item.get("items") {
                subtasks.extend(items.iter().filter_map(attr_to_subtask));
            }
        }
        Ok(subtasks)
    }

    async fn set_subtask_started(&self, task_name: &str, index: usize) -> Result<(), Error> {
        let (bin_id, offset) = bins::bin_location(index);
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", attr_s(self.bin_pk(task_name, BinKind::Subtask, &bin_id)))
            .key("SK", attr_s(Self::bin_sk(&bin_id)))
            .update_expression(format!("SET #items[{offset}].startTime = :update"))
            .expression_attribute_names("#items", "items")
            .expression_attribute_values(":update", attr_s(now_iso()))
            .send()
            .await
            .map_err(|e| Error::dynamo(format!("set_subtask_started {task_name}[{index}]"), e))?;
        Ok(())
    }

    async fn set_subtask_ended(
        &self,
        task_name: &str,
        index: usize,
        output_hash: Option<&str>,
    ) -> Result<(), Error> {
        let (bin_id, offset) = bins::bin_location(index);
        let mut expression = format!("SET #items[{offset}].endTime = :update");
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("PK", attr_s(self.bin_pk(task_name, BinKind::Subtask, &bin_id)))
            .key("SK", attr_s(Self::bin_sk(&bin_id)))
            .expression_attribute_names("#items", "items")
            .expression_attribute_values(":update", attr_s(now_iso()));
        if let Some(output_hash) = output_hash {
            expression.push_str(&format!(", #items[{offset}].outputHash = :hash"));
            request = request.expression_attribute_values(":hash", attr_s(output_hash));
        }
        request
            .update_expression(expression)
            .send()
            .await
            .map_err(|e| Error::dynamo(format!("set_subtask_ended {task_name}[{index}]"), e))?;
        Ok(())
    }

    async fn set_task_ended(
        &self,
        task_name: &str,
        completion: TaskCompletion,
    ) -> Result<(), Error> {
        if completion.subset_mode {
            if let Some(result) = &completion.result {
                let mut fields = Vec::new();
                if let serde_json::Value::Array(items) = result {
                    fields.push(("subset_count", attr_n(items.len() as i64)));
                }
                self.apply_update(task_name, fields).await?;
                self.create_taskdata(task_name, result, BinKind::Subset)
                    .await?;
                return Ok(());
            }
        }

        let mut fields = vec![("end_time", attr_s(now_iso()))];
        match &completion.result {
            Some(serde_json::Value::Array(items)) => {
                fields.push(("taskdata_count", attr_n(items.len() as i64)));
            }
            Some(_) => fields.push(("taskdata_count", attr_n(1))),
            None => {}
        }
        if let Some(outputs_version) = &completion.outputs_version {
            fields.push(("outputs_version", attr_s(outputs_version.clone())));
        }
        if let Some(result_hash) = &completion.result_hash {
            fields.push(("output_data_version", attr_s(result_hash.clone())));
        }
        if let Some(status) = completion.status {
            fields.push(("status", attr_s(status.as_ref())));
        }
        self.apply_update(task_name, fields).await?;

        if let Some(result) = &completion.result {
            self.create_taskdata(task_name, result, BinKind::Taskdata)
                .await?;
        }
        Ok(())
    }

    async fn reset_subset_of_subtasks(
        &self,
        task_name: &str,
        keys: &[String],
    ) -> Result<(), Error> {
        let existing = self.get_subtasks(task_name).await?;
        let wanted: std::collections::HashSet<&str> = keys.iter().map(String::as_str).collect();
        let kept: Vec<String> = existing
            .into_iter()
            .filter(|subtask| wanted.contains(subtask.key.as_str()))
            .map(|subtask| subtask.key)
            .collect();

        self.delete_bins(task_name, BinKind::Subtask).await?;
        self.create_subtasks(task_name, &kept, true).await
    }

    async fn delete_bins(&self, task_name: &str, kind: BinKind) -> Result<(), Error> {
        let Some(state) = self.get_task_row(task_name).await? else {
            return Ok(());
        };
        let count = match kind {
            BinKind::Subtask => state.subtask_count,
            BinKind::Taskdata => state.taskdata_count,
            BinKind::Subset => state.subset_count,
        }
        .unwrap_or(0)
        .max(0) as usize;
        self.batch_delete_bins(task_name, kind, &bins::bin_ids_for(count))
            .await
    }
}
