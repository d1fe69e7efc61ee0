//! MongoDB backend adapter.
//!
//! Collections are schemaless: records pass through the shaper untouched
//! apart from record-level access filters. Client-supplied `_id` strings of
//! exactly 24 hex characters convert to native object ids in both
//! directions.

pub mod filter_impl;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::ReturnDocument;
use mongodb::{Client, Database};
use serde_json::Value;

use crate::batch::{self, BatchPolicy, BatchRunner, RollbackJournal, StepControl};
use crate::config::ServiceConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{FieldType, IdField, Record, TableSchema};
use crate::options::{FieldProjection, RequestContext, RequestOptions};
use crate::parser::{combine_filters, parse_filter, FilterNode, SortOrder};
use crate::shaper;

use filter_impl::{parse_object_id, MongoFilterCompiler};

fn mongo_err(err: mongodb::error::Error) -> ApiError {
    ApiError::Database(err.to_string())
}

fn record_to_document(record: &Record) -> ApiResult<Document> {
    let mut document = bson::to_document(record)
        .map_err(|e| ApiError::BadRequest(format!("Record is not storable: {}", e)))?;
    if let Some(Bson::String(s)) = document.get("_id").cloned() {
        if let Some(oid) = parse_object_id(&s) {
            document.insert("_id", oid);
        }
    }
    Ok(document)
}

fn bson_to_json(bson: &Bson) -> Value {
    match bson {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(
            dt.try_to_rfc3339_string()
                .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        ),
        Bson::Document(d) => Value::Object(document_to_record(d)),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Null => Value::Null,
        other => serde_json::to_value(other).unwrap_or(Value::Null),
    }
}

fn document_to_record(document: &Document) -> Record {
    document
        .iter()
        .map(|(key, value)| (key.clone(), bson_to_json(value)))
        .collect()
}

fn id_to_bson(value: &Value) -> Bson {
    match value {
        Value::String(s) => parse_object_id(s)
            .map(Bson::ObjectId)
            .unwrap_or_else(|| Bson::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(Bson::Int64)
            .unwrap_or_else(|| Bson::Double(n.as_f64().unwrap_or_default())),
        Value::Bool(b) => Bson::Boolean(*b),
        other => bson::to_bson(other).unwrap_or(Bson::Null),
    }
}

/// A payload whose top-level keys already carry update operators is used
/// verbatim; anything else gets the full-field `$set` wrapper.
fn build_update_document(parsed: &Record) -> ApiResult<Document> {
    let has_operators = parsed.keys().any(|k| k.starts_with('$'));
    let document = record_to_document(parsed)?;
    if has_operators {
        Ok(document)
    } else {
        Ok(doc! { "$set": document })
    }
}

enum Undo {
    Remove(Bson),
    Restore(Document),
    Reinsert(Document),
}

#[derive(Clone, Copy, PartialEq)]
enum WriteMode {
    Replace,
    Patch,
}

pub struct MongoBackend {
    db: Database,
    max_records: u64,
}

impl MongoBackend {
    pub async fn connect(config: &ServiceConfig) -> ApiResult<MongoBackend> {
        let url = config.require_url()?;
        let database = config.database.as_deref().ok_or_else(|| {
            ApiError::Configuration(format!(
                "Service '{}' requires a 'database' name.",
                config.name
            ))
        })?;
        let client = Client::with_uri_str(url).await.map_err(mongo_err)?;
        Ok(MongoBackend {
            db: client.database(database),
            max_records: config.max_records,
        })
    }

    fn collection(&self, table: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(table)
    }

    fn table_schema(&self, table: &str, opts: &RequestOptions) -> TableSchema {
        let mut schema = TableSchema::new(table);
        schema.id_fields = match &opts.id_field {
            Some(_) => super::effective_ids(&schema, opts),
            None => vec![IdField::new("_id", FieldType::String)],
        };
        schema
    }

    fn compile_filter(
        &self,
        opts: &RequestOptions,
        ctx: &RequestContext,
        extra: Option<FilterNode>,
    ) -> ApiResult<Document> {
        let client = match opts.filter.as_deref() {
            Some(text) => parse_filter(text, &opts.params)?,
            None => None,
        };
        let mut combined = combine_filters(ctx.server_filters.as_ref(), client)?;
        if let Some(extra) = extra {
            combined = Some(match combined {
                Some(existing) => crate::parser::FilterNode::and(vec![existing, extra]),
                None => extra,
            });
        }
        match combined {
            Some(node) => MongoFilterCompiler::compile(&node),
            None => Ok(Document::new()),
        }
    }

    fn server_filter_doc(&self, ctx: &RequestContext) -> ApiResult<Option<Document>> {
        match ctx.server_filters.as_ref() {
            Some(spec) => match spec.compile()? {
                Some(node) => Ok(Some(MongoFilterCompiler::compile(&node)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    fn sort_doc(&self, opts: &RequestOptions) -> Document {
        let mut sort = Document::new();
        for spec in &opts.order {
            let direction = match spec.order {
                SortOrder::Ascending => 1,
                SortOrder::Descending => -1,
            };
            sort.insert(spec.field.clone(), direction);
        }
        sort
    }

    async fn assert_collection(&self, table: &str) -> ApiResult<()> {
        let names = self.db.list_collection_names().await.map_err(mongo_err)?;
        if names.iter().any(|n| n == table) {
            Ok(())
        } else {
            Err(ApiError::NotFound(format!("Table '{}' not found.", table)))
        }
    }

    async fn rollback(&self, table: &str, journal: &mut RollbackJournal<Undo>) {
        let coll = self.collection(table);
        for undo in journal.drain_reversed() {
            let result = match undo {
                Undo::Remove(id) => coll
                    .delete_one(doc! { "_id": id })
                    .await
                    .map(|_| ())
                    .map_err(mongo_err),
                Undo::Restore(old) => match old.get("_id").cloned() {
                    Some(id) => coll
                        .replace_one(doc! { "_id": id }, old)
                        .upsert(true)
                        .await
                        .map(|_| ())
                        .map_err(mongo_err),
                    None => Ok(()),
                },
                Undo::Reinsert(old) => coll.insert_one(old).await.map(|_| ()).map_err(mongo_err),
            };
            if let Err(err) = result {
                // The original failure is what surfaces to the caller.
                tracing::warn!("Rollback write on '{}' failed: {}", table, err);
            }
        }
    }

    async fn shape_response(
        &self,
        table: &str,
        id: &Bson,
        opts: &RequestOptions,
        id_names: &[String],
    ) -> ApiResult<Record> {
        if opts.fields == FieldProjection::IdOnly {
            let mut record = Record::new();
            record.insert(id_names[0].clone(), bson_to_json(id));
            return Ok(record);
        }
        let found = self
            .collection(table)
            .find_one(doc! { "_id": id.clone() })
            .await
            .map_err(mongo_err)?;
        let record = found.map(|d| document_to_record(&d)).unwrap_or_default();
        Ok(shaper::shape_outbound(record, &opts.fields, id_names))
    }

    async fn write_batch(
        &self,
        table: &str,
        items: Vec<(Value, Record)>,
        mode: WriteMode,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let schema = self.table_schema(table, opts);
        let id_names = schema.id_names();
        let coll = self.collection(table);

        let policy = BatchPolicy::resolve(items.len(), opts);
        let mut runner = BatchRunner::new(items.len(), policy);
        let mut journal = RollbackJournal::new();

        for (id, raw_record) in items {
            let result: ApiResult<Record> = async {
                let id_bson = id_to_bson(&id);
                let key = doc! { "_id": id_bson.clone() };

                let old = if ctx.record_filters.is_some() {
                    coll.find_one(key.clone()).await.map_err(mongo_err)?
                } else {
                    None
                };
                let old_record = old.as_ref().map(|d| document_to_record(d));
                let mut parsed =
                    shaper::parse_inbound(&raw_record, &schema, ctx, true, old_record.as_ref())?;
                shaper::strip_ids(&mut parsed, &id_names);

                match mode {
                    WriteMode::Replace => {
                        let document = record_to_document(&parsed)?;
                        let previous = coll
                            .find_one_and_replace(key.clone(), document)
                            .return_document(ReturnDocument::Before)
                            .await
                            .map_err(mongo_err)?;
                        match previous {
                            Some(before) => {
                                if policy.rollback {
                                    journal.push(Undo::Restore(before));
                                }
                            }
                            None => {
                                return Err(ApiError::NotFound(format!(
                                    "Record with identifier '{}' not found.",
                                    id
                                )))
                            }
                        }
                    }
                    WriteMode::Patch => {
                        let update = build_update_document(&parsed)?;
                        let previous = coll
                            .find_one_and_update(key.clone(), update)
                            .return_document(ReturnDocument::Before)
                            .await
                            .map_err(mongo_err)?;
                        match previous {
                            Some(before) => {
                                if policy.rollback {
                                    journal.push(Undo::Restore(before));
                                }
                            }
                            None => {
                                return Err(ApiError::NotFound(format!(
                                    "Record with identifier '{}' not found.",
                                    id
                                )))
                            }
                        }
                    }
                }

                self.shape_response(table, &id_bson, opts, &id_names).await
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

    async fn ids_matching_filter(
        &self,
        table: &str,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Value>> {
        let filter = self.compile_filter(opts, ctx, None)?;
        let mut cursor = self
            .collection(table)
            .find(filter)
            .projection(doc! { "_id": 1 })
            .await
            .map_err(mongo_err)?;
        let mut ids = Vec::new();
        while let Some(document) = cursor.try_next().await.map_err(mongo_err)? {
            if let Some(id) = document.get("_id") {
                ids.push(bson_to_json(id));
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl super::DbBackend for MongoBackend {
    async fn health_check(&self) -> ApiResult<()> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(mongo_err)?;
        Ok(())
    }

    async fn list_tables(&self) -> ApiResult<Vec<String>> {
        let mut names = self.db.list_collection_names().await.map_err(mongo_err)?;
        names.sort();
        Ok(names)
    }

    async fn describe_table(&self, table: &str, opts: &RequestOptions) -> ApiResult<TableSchema> {
        self.assert_collection(table).await?;
        Ok(self.table_schema(table, opts))
    }

    async fn create_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        self.db
            .create_collection(&table_schema.name)
            .await
            .map_err(mongo_err)?;
        Ok(TableSchema {
            id_fields: vec![IdField::new("_id", FieldType::String)],
            ..TableSchema::new(&table_schema.name)
        })
    }

    /// Collections carry no structural schema; the call validates existence
    /// and returns the current descriptor.
    async fn update_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        self.describe_table(&table_schema.name, &RequestOptions::default())
            .await
    }

    async fn delete_table(&self, table: &str) -> ApiResult<()> {
        self.assert_collection(table).await?;
        self.collection(table).drop().await.map_err(mongo_err)?;
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> ApiResult<()> {
        self.assert_collection(table).await?;
        self.collection(table)
            .delete_many(Document::new())
            .await
            .map_err(mongo_err)?;
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
        let schema = self.table_schema(table, opts);
        let id_names = schema.id_names();
        let coll = self.collection(table);
        let policy = BatchPolicy::resolve(records.len(), opts);

        // Native multi-item write: one call, no per-item recovery.
        if policy.native_batch {
            let mut documents = Vec::with_capacity(records.len());
            for record in &records {
                let parsed = shaper::parse_inbound(record, &schema, ctx, false, None)?;
                documents.push(record_to_document(&parsed)?);
            }
            let result = coll.insert_many(documents).await.map_err(mongo_err)?;
            let mut out = Vec::with_capacity(records.len());
            for index in 0..records.len() {
                let id = result
                    .inserted_ids
                    .get(&index)
                    .cloned()
                    .unwrap_or(Bson::Null);
                out.push(self.shape_response(table, &id, opts, &id_names).await?);
            }
            return Ok(out);
        }

        let mut runner = BatchRunner::new(records.len(), policy);
        let mut journal = RollbackJournal::new();
        for record in records {
            let result: ApiResult<Record> = async {
                let parsed = shaper::parse_inbound(&record, &schema, ctx, false, None)?;
                let document = record_to_document(&parsed)?;
                let inserted = coll.insert_one(document).await.map_err(mongo_err)?;
                if policy.rollback {
                    journal.push(Undo::Remove(inserted.inserted_id.clone()));
                }
                self.shape_response(table, &inserted.inserted_id, opts, &id_names)
                    .await
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
        let schema = self.table_schema(table, opts);
        let id_names = schema.id_names();
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
        let ids = self.ids_matching_filter(table, opts, ctx).await?;
        let items = ids.into_iter().map(|id| (id, record.clone())).collect();
        self.write_batch(table, items, WriteMode::Replace, opts, ctx).await
    }

    async fn merge_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let schema = self.table_schema(table, opts);
        let id_names = schema.id_names();
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
        let ids = self.ids_matching_filter(table, opts, ctx).await?;
        let items = ids.into_iter().map(|id| (id, record.clone())).collect();
        self.write_batch(table, items, WriteMode::Patch, opts, ctx).await
    }

    async fn delete_records_by_ids(
        &self,
        table: &str,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let schema = self.table_schema(table, opts);
        let id_names = schema.id_names();
        let coll = self.collection(table);

        let policy = BatchPolicy::resolve(ids.len(), opts);
        let mut runner = BatchRunner::new(ids.len(), policy);
        let mut journal = RollbackJournal::new();

        for id in ids {
            let result: ApiResult<Record> = async {
                let key = doc! { "_id": id_to_bson(&id) };
                let removed = coll
                    .find_one_and_delete(key)
                    .await
                    .map_err(mongo_err)?
                    .ok_or_else(|| {
                        ApiError::NotFound(format!("Record with identifier '{}' not found.", id))
                    })?;
                let old_record = document_to_record(&removed);
                if let Some(spec) = &ctx.record_filters {
                    // Guard rejected: put the record back before failing.
                    if let Err(err) = shaper::enforce_record_filter(spec, &old_record, None) {
                        let _ = coll.insert_one(removed).await;
                        return Err(err);
                    }
                }
                if policy.rollback {
                    journal.push(Undo::Reinsert(removed));
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
        let ids = self.ids_matching_filter(table, opts, ctx).await?;
        self.delete_records_by_ids(table, ids, opts, ctx).await
    }

    async fn retrieve_records_by_ids(
        &self,
        table: &str,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let schema = self.table_schema(table, opts);
        let id_names = schema.id_names();
        let id_values: Vec<Bson> = ids.iter().map(id_to_bson).collect();

        let mut filter = doc! { "_id": { "$in": id_values } };
        if let Some(server) = self.server_filter_doc(ctx)? {
            filter = doc! { "$and": [filter, server] };
        }
        let mut cursor = self.collection(table).find(filter).await.map_err(mongo_err)?;
        let mut records = Vec::new();
        while let Some(document) = cursor.try_next().await.map_err(mongo_err)? {
            records.push(document_to_record(&document));
        }
        Ok(shaper::shape_many(records, &opts.fields, &id_names))
    }

    async fn retrieve_records_by_filter(
        &self,
        table: &str,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<(Vec<Record>, Option<u64>)> {
        let schema = self.table_schema(table, opts);
        let id_names = schema.id_names();
        let filter = self.compile_filter(opts, ctx, None)?;
        let limit = opts.limit.unwrap_or(self.max_records).min(self.max_records);

        let mut find = self.collection(table).find(filter.clone()).limit(limit as i64);
        if opts.offset > 0 {
            find = find.skip(opts.offset);
        }
        let sort = self.sort_doc(opts);
        if !sort.is_empty() {
            find = find.sort(sort);
        }
        let mut cursor = find.await.map_err(mongo_err)?;
        let mut records = Vec::new();
        while let Some(document) = cursor.try_next().await.map_err(mongo_err)? {
            records.push(document_to_record(&document));
        }

        let count = if opts.include_count {
            Some(
                self.collection(table)
                    .count_documents(filter)
                    .await
                    .map_err(mongo_err)?,
            )
        } else {
            None
        };

        Ok((shaper::shape_many(records, &opts.fields, &id_names), count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_payload_set_wrapped() {
        let mut record = Record::new();
        record.insert("status".to_string(), json!("x"));
        let update = build_update_document(&record).unwrap();
        assert_eq!(update, doc! { "$set": { "status": "x" } });
    }

    #[test]
    fn test_merge_payload_with_operators_used_verbatim() {
        let mut record = Record::new();
        record.insert("$inc".to_string(), json!({"count": 1}));
        let update = build_update_document(&record).unwrap();
        assert!(update.contains_key("$inc"));
        assert!(!update.contains_key("$set"));
    }

    #[test]
    fn test_object_id_round_trip() {
        let mut record = Record::new();
        record.insert(
            "_id".to_string(),
            json!("507f1f77bcf86cd799439011"),
        );
        let document = record_to_document(&record).unwrap();
        assert!(matches!(document.get("_id"), Some(Bson::ObjectId(_))));

        let back = document_to_record(&document);
        assert_eq!(back["_id"], json!("507f1f77bcf86cd799439011"));
    }

    #[test]
    fn test_short_id_stays_string() {
        let mut record = Record::new();
        record.insert("_id".to_string(), json!("user-42"));
        let document = record_to_document(&record).unwrap();
        assert!(matches!(document.get("_id"), Some(Bson::String(_))));
    }

    #[test]
    fn test_id_to_bson_numbers() {
        assert_eq!(id_to_bson(&json!(7)), Bson::Int64(7));
        assert_eq!(id_to_bson(&json!("abc")), Bson::String("abc".to_string()));
    }
}
