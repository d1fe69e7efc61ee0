//! AWS DynamoDB backend adapter.
//!
//! Identifier metadata comes from a live `DescribeTable` unless the request
//! carries `id_field`/`id_type` overrides. Filters compile to the
//! AND-conjunctive expression subset; batch writes page through
//! `BatchWriteItem` at the service's 25-request page size, table listing
//! through `ListTables` at its 100-name page size.

pub mod attr;
pub mod filter_impl;

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, DeleteRequest, KeySchemaElement, KeyType,
    PutRequest, ReturnValue, ScalarAttributeType, Select, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use serde_json::Value;

use crate::batch::{self, BatchPolicy, BatchRunner, RollbackJournal, StepControl};
use crate::config::ServiceConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{FieldType, IdField, Record, TableSchema};
use crate::options::{FieldProjection, RequestContext, RequestOptions};
use crate::parser::{combine_filters, parse_filter};
use crate::shaper;

use attr::{item_to_record, json_to_attr, key_attr, record_to_item};
use filter_impl::{CompiledExpression, DynamoFilterCompiler};

const BATCH_WRITE_PAGE: usize = 25;
const LIST_TABLES_PAGE: i32 = 100;

fn dynamo_err<E, R>(err: SdkError<E, R>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    match err.code() {
        Some("ResourceNotFoundException") => ApiError::NotFound(message),
        Some("ConditionalCheckFailedException") | Some("ValidationException") => {
            ApiError::BadRequest(message)
        }
        Some("ProvisionedThroughputExceededException") | Some("ThrottlingException") => {
            ApiError::Database(message)
        }
        _ => ApiError::Database(message),
    }
}

fn build_err(err: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(format!("Failed to build request: {}", err))
}

enum Undo {
    Remove(HashMap<String, AttributeValue>),
    Restore(HashMap<String, AttributeValue>),
}

#[derive(Clone, Copy, PartialEq)]
enum WriteMode {
    Replace,
    Patch,
}

pub struct DynamoBackend {
    client: Client,
    max_records: u64,
}

impl DynamoBackend {
    pub async fn connect(config: &ServiceConfig) -> ApiResult<DynamoBackend> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(DynamoBackend {
            client: Client::from_conf(builder.build()),
            max_records: config.max_records,
        })
    }

    /// Identifier metadata from a live DescribeTable, unless overridden.
    async fn table_ids(&self, table: &str, opts: &RequestOptions) -> ApiResult<Vec<IdField>> {
        if opts.id_field.is_some() {
            return Ok(super::effective_ids(&TableSchema::new(table), opts));
        }
        let schema = self.describe(table).await?;
        Ok(schema.id_fields)
    }

    async fn describe(&self, table: &str) -> ApiResult<TableSchema> {
        let resp = self
            .client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(dynamo_err)?;
        let description = resp
            .table()
            .ok_or_else(|| ApiError::NotFound(format!("Table '{}' not found.", table)))?;

        let attr_types: HashMap<&str, &ScalarAttributeType> = description
            .attribute_definitions()
            .iter()
            .map(|def| (def.attribute_name(), def.attribute_type()))
            .collect();

        let mut schema = TableSchema::new(table);
        for key in description.key_schema() {
            let name = key.attribute_name();
            let field_type = match attr_types.get(name) {
                Some(ScalarAttributeType::N) => FieldType::Integer,
                Some(ScalarAttributeType::B) => FieldType::Binary,
                _ => FieldType::String,
            };
            let mut id = IdField::new(name, field_type);
            id.key_type = Some(
                match key.key_type() {
                    KeyType::Range => "range",
                    _ => "hash",
                }
                .to_string(),
            );
            schema.id_fields.push(id);
        }
        Ok(schema)
    }

    fn key_from_id(
        &self,
        ids: &[IdField],
        id: &Value,
    ) -> ApiResult<HashMap<String, AttributeValue>> {
        if ids.is_empty() {
            return Err(ApiError::BadRequest(
                "Table has no identifier fields.".to_string(),
            ));
        }
        if ids.len() == 1 {
            let mut key = HashMap::new();
            key.insert(ids[0].name.clone(), key_attr(id, ids[0].field_type)?);
            return Ok(key);
        }
        let Value::Object(map) = id else {
            return Err(ApiError::BadRequest(format!(
                "Composite identifier requires an object value, got {}.",
                id
            )));
        };
        let mut key = HashMap::new();
        for field in ids {
            let value = map.get(&field.name).ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Identifier part '{}' missing from id value.",
                    field.name
                ))
            })?;
            key.insert(field.name.clone(), key_attr(value, field.field_type)?);
        }
        Ok(key)
    }

    fn key_from_record(
        &self,
        ids: &[IdField],
        record: &Record,
    ) -> ApiResult<HashMap<String, AttributeValue>> {
        let mut key = HashMap::new();
        for field in ids {
            let value = record.get(&field.name).filter(|v| !v.is_null()).ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Identifying field '{}' can not be empty for record.",
                    field.name
                ))
            })?;
            key.insert(field.name.clone(), key_attr(value, field.field_type)?);
        }
        Ok(key)
    }

    fn key_to_record(key: &HashMap<String, AttributeValue>) -> Record {
        item_to_record(key)
    }

    fn compile_filter(
        &self,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Option<CompiledExpression>> {
        let client = match opts.filter.as_deref() {
            Some(text) => parse_filter(text, &opts.params)?,
            None => None,
        };
        let combined = combine_filters(ctx.server_filters.as_ref(), client)?;
        match combined {
            Some(node) => Ok(Some(DynamoFilterCompiler::compile(&node)?)),
            None => Ok(None),
        }
    }

    async fn fetch_item(
        &self,
        table: &str,
        key: &HashMap<String, AttributeValue>,
    ) -> ApiResult<Option<Record>> {
        let resp = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(key.clone()))
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(resp.item().map(item_to_record))
    }

    async fn shape_response(
        &self,
        table: &str,
        key: &HashMap<String, AttributeValue>,
        opts: &RequestOptions,
        id_names: &[String],
    ) -> ApiResult<Record> {
        if opts.fields == FieldProjection::IdOnly {
            return Ok(Self::key_to_record(key));
        }
        let record = self
            .fetch_item(table, key)
            .await?
            .unwrap_or_else(|| Self::key_to_record(key));
        Ok(shaper::shape_outbound(record, &opts.fields, id_names))
    }

    async fn rollback(&self, table: &str, journal: &mut RollbackJournal<Undo>) {
        for undo in journal.drain_reversed() {
            let result = match undo {
                Undo::Remove(key) => self
                    .client
                    .delete_item()
                    .table_name(table)
                    .set_key(Some(key))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(dynamo_err),
                Undo::Restore(item) => self
                    .client
                    .put_item()
                    .table_name(table)
                    .set_item(Some(item))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(dynamo_err),
            };
            if let Err(err) = result {
                // The original failure is what surfaces to the caller.
                tracing::warn!("Rollback write on '{}' failed: {}", table, err);
            }
        }
    }

    /// One replace or patch write against an existing item, returning its
    /// previous attributes.
    async fn write_one(
        &self,
        table: &str,
        ids: &[IdField],
        key: HashMap<String, AttributeValue>,
        parsed: &Record,
        mode: WriteMode,
    ) -> ApiResult<HashMap<String, AttributeValue>> {
        let mut names: HashMap<String, String> = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            names.insert(format!("#k{}", i), id.name.clone());
        }
        let exists_condition = (0..ids.len())
            .map(|i| format!("attribute_exists(#k{})", i))
            .collect::<Vec<_>>()
            .join(" AND ");

        let previous = match mode {
            WriteMode::Replace => {
                let mut item = record_to_item(parsed)?;
                for (name, value) in &key {
                    item.insert(name.clone(), value.clone());
                }
                let resp = self
                    .client
                    .put_item()
                    .table_name(table)
                    .set_item(Some(item))
                    .condition_expression(&exists_condition)
                    .set_expression_attribute_names(Some(names))
                    .return_values(ReturnValue::AllOld)
                    .send()
                    .await
                    .map_err(|err| not_found_on_condition(err, &key))?;
                resp.attributes().cloned()
            }
            WriteMode::Patch => {
                if parsed.is_empty() {
                    return self
                        .fetch_item(table, &key)
                        .await?
                        .map(|r| record_to_item(&r))
                        .transpose()?
                        .ok_or_else(|| {
                            ApiError::NotFound("Record not found for patch.".to_string())
                        });
                }
                let mut values = HashMap::new();
                let mut assignments = Vec::with_capacity(parsed.len());
                for (i, (field, value)) in parsed.iter().enumerate() {
                    let name_key = format!("#a{}", i);
                    let value_key = format!(":a{}", i);
                    names.insert(name_key.clone(), field.clone());
                    values.insert(value_key.clone(), json_to_attr(value)?);
                    assignments.push(format!("{} = {}", name_key, value_key));
                }
                let resp = self
                    .client
                    .update_item()
                    .table_name(table)
                    .set_key(Some(key.clone()))
                    .update_expression(format!("SET {}", assignments.join(", ")))
                    .condition_expression(&exists_condition)
                    .set_expression_attribute_names(Some(names))
                    .set_expression_attribute_values(Some(values))
                    .return_values(ReturnValue::AllOld)
                    .send()
                    .await
                    .map_err(|err| not_found_on_condition(err, &key))?;
                resp.attributes().cloned()
            }
        };

        previous.ok_or_else(|| {
            ApiError::NotFound(format!(
                "Record with identifier '{:?}' not found.",
                Self::key_to_record(&key)
            ))
        })
    }

    async fn write_batch(
        &self,
        table: &str,
        items: Vec<(Value, Record)>,
        mode: WriteMode,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let ids = self.table_ids(table, opts).await?;
        let id_names: Vec<String> = ids.iter().map(|f| f.name.clone()).collect();
        let schema = TableSchema::new(table);

        let policy = BatchPolicy::resolve(items.len(), opts);
        let mut runner = BatchRunner::new(items.len(), policy);
        let mut journal = RollbackJournal::new();

        for (id, raw_record) in items {
            let result: ApiResult<Record> = async {
                let key = self.key_from_id(&ids, &id)?;
                let old = if ctx.record_filters.is_some() {
                    self.fetch_item(table, &key).await?
                } else {
                    None
                };
                let mut parsed =
                    shaper::parse_inbound(&raw_record, &schema, ctx, true, old.as_ref())?;
                shaper::strip_ids(&mut parsed, &id_names);

                let previous = self.write_one(table, &ids, key.clone(), &parsed, mode).await?;
                if policy.rollback {
                    journal.push(Undo::Restore(previous));
                }
                self.shape_response(table, &key, opts, &id_names).await
            }
            .await;

            match result {
                Ok(record) => runner.succeed(record),
                Err(err) => {
                    if runner.fail(err) == StepControl::Halt {
                        break;
                    }
                }
            }
        }

        let action = match mode {
            WriteMode::Replace => "updated",
            WriteMode::Patch => "patched",
        };
        match runner.finalize(action) {
            Ok(records) => Ok(records),
            Err(err) => {
                if policy.rollback && !journal.is_empty() {
                    self.rollback(table, &mut journal).await;
                    Err(batch::mark_rolled_back(err))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Scan ids matching the current filter (used by the by-filter writes).
    async fn ids_matching_filter(
        &self,
        table: &str,
        ids: &[IdField],
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Value>> {
        let (records, _) = self.scan_records(table, ids, opts, ctx, false).await?;
        Ok(records
            .iter()
            .map(|record| {
                if ids.len() == 1 {
                    record.get(&ids[0].name).cloned().unwrap_or(Value::Null)
                } else {
                    let mut map = serde_json::Map::new();
                    for id in ids {
                        map.insert(
                            id.name.clone(),
                            record.get(&id.name).cloned().unwrap_or(Value::Null),
                        );
                    }
                    Value::Object(map)
                }
            })
            .collect())
    }

    async fn scan_records(
        &self,
        table: &str,
        _ids: &[IdField],
        opts: &RequestOptions,
        ctx: &RequestContext,
        count_total: bool,
    ) -> ApiResult<(Vec<Record>, Option<u64>)> {
        let compiled = self.compile_filter(opts, ctx)?;
        let limit = opts.limit.unwrap_or(self.max_records).min(self.max_records) as usize;
        let mut skip = opts.offset as usize;

        let mut records = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let mut request = self.client.scan().table_name(table);
            if let Some(expr) = &compiled {
                request = request
                    .filter_expression(&expr.expression)
                    .set_expression_attribute_names(Some(expr.names.clone()))
                    .set_expression_attribute_values(Some(expr.values.clone()));
            }
            if let Some(key) = start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }
            let resp = request.send().await.map_err(dynamo_err)?;

            for item in resp.items() {
                if skip > 0 {
                    skip -= 1;
                    continue;
                }
                if records.len() < limit {
                    records.push(item_to_record(item));
                }
            }

            start_key = resp.last_evaluated_key().cloned();
            if start_key.is_none() || (records.len() >= limit && !count_total) {
                break;
            }
        }

        let count = if count_total {
            let mut total = 0u64;
            let mut start_key: Option<HashMap<String, AttributeValue>> = None;
            loop {
                let mut request = self.client.scan().table_name(table).select(Select::Count);
                if let Some(expr) = &compiled {
                    request = request
                        .filter_expression(&expr.expression)
                        .set_expression_attribute_names(Some(expr.names.clone()))
                        .set_expression_attribute_values(Some(expr.values.clone()));
                }
                if let Some(key) = start_key.take() {
                    request = request.set_exclusive_start_key(Some(key));
                }
                let resp = request.send().await.map_err(dynamo_err)?;
                total += resp.count() as u64;
                start_key = resp.last_evaluated_key().cloned();
                if start_key.is_none() {
                    break;
                }
            }
            Some(total)
        } else {
            None
        };

        Ok((records, count))
    }

    async fn batch_write(&self, table: &str, requests: Vec<WriteRequest>) -> ApiResult<()> {
        for page in requests.chunks(BATCH_WRITE_PAGE) {
            let mut pending = page.to_vec();
            // The service may return unprocessed entries under load.
            for _ in 0..3 {
                let resp = self
                    .client
                    .batch_write_item()
                    .request_items(table, pending.clone())
                    .send()
                    .await
                    .map_err(dynamo_err)?;
                match resp.unprocessed_items() {
                    Some(unprocessed) if !unprocessed.is_empty() => {
                        pending = unprocessed.get(table).cloned().unwrap_or_default();
                        if pending.is_empty() {
                            break;
                        }
                    }
                    _ => {
                        pending.clear();
                        break;
                    }
                }
            }
            if !pending.is_empty() {
                return Err(ApiError::Database(format!(
                    "Batch write left {} unprocessed requests.",
                    pending.len()
                )));
            }
        }
        Ok(())
    }
}

fn not_found_on_condition<E, R>(err: SdkError<E, R>, key: &HashMap<String, AttributeValue>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    if err.code() == Some("ConditionalCheckFailedException") {
        return ApiError::NotFound(format!(
            "Record with identifier '{:?}' not found.",
            item_to_record(key)
        ));
    }
    dynamo_err(err)
}

#[async_trait]
impl super::DbBackend for DynamoBackend {
    async fn health_check(&self) -> ApiResult<()> {
        self.client
            .list_tables()
            .limit(1)
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(())
    }

    async fn list_tables(&self) -> ApiResult<Vec<String>> {
        let mut names = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let mut request = self.client.list_tables().limit(LIST_TABLES_PAGE);
            if let Some(start_name) = start.take() {
                request = request.exclusive_start_table_name(start_name);
            }
            let resp = request.send().await.map_err(dynamo_err)?;
            names.extend(resp.table_names().iter().cloned());
            match resp.last_evaluated_table_name() {
                Some(last) => start = Some(last.to_string()),
                None => break,
            }
        }
        Ok(names)
    }

    async fn describe_table(&self, table: &str, opts: &RequestOptions) -> ApiResult<TableSchema> {
        if opts.id_field.is_some() {
            let mut schema = TableSchema::new(table);
            schema.id_fields = super::effective_ids(&schema, opts);
            return Ok(schema);
        }
        self.describe(table).await
    }

    async fn create_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        if table_schema.id_fields.is_empty() {
            return Err(ApiError::BadRequest(format!(
                "Table '{}' requires at least a hash key field.",
                table_schema.name
            )));
        }
        let mut attribute_definitions = Vec::new();
        let mut key_schema = Vec::new();
        for (index, id) in table_schema.id_fields.iter().enumerate() {
            let scalar = match id.field_type {
                FieldType::Integer | FieldType::Float | FieldType::Id | FieldType::Reference => {
                    ScalarAttributeType::N
                }
                FieldType::Binary => ScalarAttributeType::B,
                _ => ScalarAttributeType::S,
            };
            attribute_definitions.push(
                AttributeDefinition::builder()
                    .attribute_name(&id.name)
                    .attribute_type(scalar)
                    .build()
                    .map_err(build_err)?,
            );
            let key_type = match id.key_type.as_deref() {
                Some("range") => KeyType::Range,
                Some("hash") => KeyType::Hash,
                _ if index == 0 => KeyType::Hash,
                _ => KeyType::Range,
            };
            key_schema.push(
                KeySchemaElement::builder()
                    .attribute_name(&id.name)
                    .key_type(key_type)
                    .build()
                    .map_err(build_err)?,
            );
        }
        self.client
            .create_table()
            .table_name(&table_schema.name)
            .set_attribute_definitions(Some(attribute_definitions))
            .set_key_schema(Some(key_schema))
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(table_schema.clone())
    }

    async fn update_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        Err(ApiError::NotImplemented(format!(
            "Updating table '{}' is not supported on DynamoDB; keys are immutable.",
            table_schema.name
        )))
    }

    async fn delete_table(&self, table: &str) -> ApiResult<()> {
        self.client
            .delete_table()
            .table_name(table)
            .send()
            .await
            .map_err(dynamo_err)?;
        Ok(())
    }

    /// DynamoDB has no truncate; scan the keys and batch-delete them.
    async fn truncate_table(&self, table: &str) -> ApiResult<()> {
        let ids = self.describe(table).await?.id_fields;
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let mut request = self.client.scan().table_name(table);
            if let Some(key) = start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }
            let resp = request.send().await.map_err(dynamo_err)?;

            let mut deletes = Vec::new();
            for item in resp.items() {
                let mut key = HashMap::new();
                for id in &ids {
                    if let Some(value) = item.get(&id.name) {
                        key.insert(id.name.clone(), value.clone());
                    }
                }
                deletes.push(
                    WriteRequest::builder()
                        .delete_request(
                            DeleteRequest::builder()
                                .set_key(Some(key))
                                .build()
                                .map_err(build_err)?,
                        )
                        .build(),
                );
            }
            if !deletes.is_empty() {
                self.batch_write(table, deletes).await?;
            }

            start_key = resp.last_evaluated_key().cloned();
            if start_key.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn create_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        if records.is_empty() {
            return Err(ApiError::BadRequest(
                "There are no records in the request.".to_string(),
            ));
        }
        let ids = self.table_ids(table, opts).await?;
        let id_names: Vec<String> = ids.iter().map(|f| f.name.clone()).collect();
        let schema = TableSchema::new(table);
        let policy = BatchPolicy::resolve(records.len(), opts);

        // Native multi-item write: one paged call, no per-item recovery and
        // no overwrite guard.
        if policy.native_batch {
            let mut requests = Vec::with_capacity(records.len());
            let mut keys = Vec::with_capacity(records.len());
            for record in &records {
                let parsed = shaper::parse_inbound(record, &schema, ctx, false, None)?;
                keys.push(self.key_from_record(&ids, &parsed)?);
                requests.push(
                    WriteRequest::builder()
                        .put_request(
                            PutRequest::builder()
                                .set_item(Some(record_to_item(&parsed)?))
                                .build()
                                .map_err(build_err)?,
                        )
                        .build(),
                );
            }
            self.batch_write(table, requests).await?;
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                out.push(self.shape_response(table, &key, opts, &id_names).await?);
            }
            return Ok(out);
        }

        let mut runner = BatchRunner::new(records.len(), policy);
        let mut journal = RollbackJournal::new();
        for record in records {
            let result: ApiResult<Record> = async {
                let parsed = shaper::parse_inbound(&record, &schema, ctx, false, None)?;
                let key = self.key_from_record(&ids, &parsed)?;

                // Guard against accidental overwrite of an existing item.
                let mut names = HashMap::new();
                for (i, id) in ids.iter().enumerate() {
                    names.insert(format!("#k{}", i), id.name.clone());
                }
                let guard = (0..ids.len())
                    .map(|i| format!("attribute_not_exists(#k{})", i))
                    .collect::<Vec<_>>()
                    .join(" AND ");

                self.client
                    .put_item()
                    .table_name(table)
                    .set_item(Some(record_to_item(&parsed)?))
                    .condition_expression(guard)
                    .set_expression_attribute_names(Some(names))
                    .send()
                    .await
                    .map_err(|err| {
                        if err.code() == Some("ConditionalCheckFailedException") {
                            ApiError::BadRequest(format!(
                                "Record with identifier '{:?}' already exists.",
                                Self::key_to_record(&key)
                            ))
                        } else {
                            dynamo_err(err)
                        }
                    })?;

                if policy.rollback {
                    journal.push(Undo::Remove(key.clone()));
                }
                self.shape_response(table, &key, opts, &id_names).await
            }
            .await;

            match result {
                Ok(created) => runner.succeed(created),
                Err(err) => {
                    if runner.fail(err) == StepControl::Halt {
                        break;
                    }
                }
            }
        }

        match runner.finalize("created") {
            Ok(created) => Ok(created),
            Err(err) => {
                if policy.rollback && !journal.is_empty() {
                    self.rollback(table, &mut journal).await;
                    Err(batch::mark_rolled_back(err))
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn update_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let ids = self.table_ids(table, opts).await?;
        let id_names: Vec<String> = ids.iter().map(|f| f.name.clone()).collect();
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let id = shaper::extract_id(&record, &id_names)?;
            items.push((super::id_list_to_value(id), record));
        }
        self.write_batch(table, items, WriteMode::Replace, opts, ctx).await
    }

    async fn update_records_by_ids(
        &self,
        table: &str,
        record: Record,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let items = ids.into_iter().map(|id| (id, record.clone())).collect();
        self.write_batch(table, items, WriteMode::Replace, opts, ctx).await
    }

    async fn update_records_by_filter(
        &self,
        table: &str,
        record: Record,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let ids = self.table_ids(table, opts).await?;
        let matching = self.ids_matching_filter(table, &ids, opts, ctx).await?;
        let items = matching.into_iter().map(|id| (id, record.clone())).collect();
        self.write_batch(table, items, WriteMode::Replace, opts, ctx).await
    }

    async fn merge_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let ids = self.table_ids(table, opts).await?;
        let id_names: Vec<String> = ids.iter().map(|f| f.name.clone()).collect();
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let id = shaper::extract_id(&record, &id_names)?;
            items.push((super::id_list_to_value(id), record));
        }
        self.write_batch(table, items, WriteMode::Patch, opts, ctx).await
    }

    async fn merge_records_by_ids(
        &self,
        table: &str,
        record: Record,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let items = ids.into_iter().map(|id| (id, record.clone())).collect();
        self.write_batch(table, items, WriteMode::Patch, opts, ctx).await
    }

    async fn merge_records_by_filter(
        &self,
        table: &str,
        record: Record,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let ids = self.table_ids(table, opts).await?;
        let matching = self.ids_matching_filter(table, &ids, opts, ctx).await?;
        let items = matching.into_iter().map(|id| (id, record.clone())).collect();
        self.write_batch(table, items, WriteMode::Patch, opts, ctx).await
    }

    async fn delete_records_by_ids(
        &self,
        table: &str,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let id_fields = self.table_ids(table, opts).await?;
        let id_names: Vec<String> = id_fields.iter().map(|f| f.name.clone()).collect();

        let policy = BatchPolicy::resolve(ids.len(), opts);
        let mut runner = BatchRunner::new(ids.len(), policy);
        let mut journal = RollbackJournal::new();

        for id in ids {
            let result: ApiResult<Record> = async {
                let key = self.key_from_id(&id_fields, &id)?;
                let resp = self
                    .client
                    .delete_item()
                    .table_name(table)
                    .set_key(Some(key.clone()))
                    .return_values(ReturnValue::AllOld)
                    .send()
                    .await
                    .map_err(dynamo_err)?;
                let old = resp.attributes().cloned().ok_or_else(|| {
                    ApiError::NotFound(format!("Record with identifier '{}' not found.", id))
                })?;
                let old_record = item_to_record(&old);
                if let Some(spec) = &ctx.record_filters {
                    // Guard rejected: put the item back before failing.
                    if let Err(err) = shaper::enforce_record_filter(spec, &old_record, None) {
                        let _ = self
                            .client
                            .put_item()
                            .table_name(table)
                            .set_item(Some(old))
                            .send()
                            .await;
                        return Err(err);
                    }
                }
                if policy.rollback {
                    journal.push(Undo::Restore(old));
                }
                Ok(shaper::shape_outbound(old_record, &opts.fields, &id_names))
            }
            .await;

            match result {
                Ok(deleted) => runner.succeed(deleted),
                Err(err) => {
                    if runner.fail(err) == StepControl::Halt {
                        break;
                    }
                }
            }
        }

        match runner.finalize("deleted") {
            Ok(deleted) => Ok(deleted),
            Err(err) => {
                if policy.rollback && !journal.is_empty() {
                    self.rollback(table, &mut journal).await;
                    Err(batch::mark_rolled_back(err))
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn delete_records_by_filter(
        &self,
        table: &str,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let ids = self.table_ids(table, opts).await?;
        let matching = self.ids_matching_filter(table, &ids, opts, ctx).await?;
        self.delete_records_by_ids(table, matching, opts, ctx).await
    }

    async fn retrieve_records_by_ids(
        &self,
        table: &str,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let id_fields = self.table_ids(table, opts).await?;
        let id_names: Vec<String> = id_fields.iter().map(|f| f.name.clone()).collect();

        let mut records = Vec::new();
        for id in &ids {
            let key = self.key_from_id(&id_fields, id)?;
            if let Some(record) = self.fetch_item(table, &key).await? {
                records.push(record);
            }
        }
        if let Some(spec) = &ctx.server_filters {
            records.retain(|record| shaper::enforce_record_filter(spec, record, None).is_ok());
        }
        Ok(shaper::shape_many(records, &opts.fields, &id_names))
    }

    async fn retrieve_records_by_filter(
        &self,
        table: &str,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<(Vec<Record>, Option<u64>)> {
        let ids = self.table_ids(table, opts).await?;
        let id_names: Vec<String> = ids.iter().map(|f| f.name.clone()).collect();
        let (records, count) = self
            .scan_records(table, &ids, opts, ctx, opts.include_count)
            .await?;
        Ok((shaper::shape_many(records, &opts.fields, &id_names), count))
    }
}
