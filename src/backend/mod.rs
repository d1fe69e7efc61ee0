//! Backend abstraction layer.
//!
//! One [`DbBackend`] capability trait covers every storage backend; shared
//! helper logic (record shaping, batch orchestration, filter parsing) lives
//! in free modules the implementations call into.
//!
//! ```text
//! http handlers
//!     ↓
//! DbBackend trait
//!     ├── sql/        (sqlx, sqlite + postgres dialects)
//!     ├── mongo/      (mongodb driver)
//!     ├── dynamodb/   (aws-sdk-dynamodb)
//!     ├── salesforce/ (REST + SOQL)
//!     └── sns/        (aws-sdk-sns, topics as tables)
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{Record, TableSchema};
use crate::options::{RequestContext, RequestOptions};
use crate::shaper;

pub mod dynamodb;
pub mod mongo;
pub mod salesforce;
pub mod sns;
pub mod sql;

/// Supported backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Sql,
    MongoDb,
    DynamoDb,
    Salesforce,
    Sns,
}

impl BackendType {
    pub fn from_str(s: &str) -> ApiResult<BackendType> {
        match s.to_lowercase().as_str() {
            "sql" | "sqlite" | "postgres" | "postgresql" => Ok(BackendType::Sql),
            "mongodb" | "mongo" => Ok(BackendType::MongoDb),
            "dynamodb" | "aws_dynamodb" => Ok(BackendType::DynamoDb),
            "salesforce" => Ok(BackendType::Salesforce),
            "sns" | "aws_sns" => Ok(BackendType::Sns),
            other => Err(ApiError::Configuration(format!(
                "Unsupported backend type '{}'.",
                other
            ))),
        }
    }
}

/// The uniform CRUD + query contract every backend adapter implements.
///
/// Filter text and bound parameters travel inside `opts`; access-control
/// filters and the caller identity inside `ctx`. Methods returning record
/// lists shape their output per `opts.fields`, always keeping identifiers.
#[async_trait]
pub trait DbBackend: Send + Sync {
    async fn health_check(&self) -> ApiResult<()>;

    // -- schema surface -----------------------------------------------------

    async fn list_tables(&self) -> ApiResult<Vec<String>>;

    async fn describe_table(&self, table: &str, opts: &RequestOptions) -> ApiResult<TableSchema>;

    async fn create_table(&self, schema: &TableSchema) -> ApiResult<TableSchema>;

    async fn update_table(&self, schema: &TableSchema) -> ApiResult<TableSchema>;

    async fn delete_table(&self, table: &str) -> ApiResult<()>;

    async fn truncate_table(&self, table: &str) -> ApiResult<()>;

    // -- record surface -----------------------------------------------------

    async fn create_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    /// Full-record replace; each record carries its own identifier.
    async fn update_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    /// Apply one template record to every listed id (full replace).
    async fn update_records_by_ids(
        &self,
        table: &str,
        record: Record,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    /// Apply one template record to every record matching `opts.filter`.
    async fn update_records_by_filter(
        &self,
        table: &str,
        record: Record,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    /// Partial-field update; each record carries its own identifier.
    async fn merge_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    async fn merge_records_by_ids(
        &self,
        table: &str,
        record: Record,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    async fn merge_records_by_filter(
        &self,
        table: &str,
        record: Record,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    /// Delete the given records; ids are extracted from each record.
    async fn delete_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let schema = self.describe_table(table, opts).await?;
        let id_names = schema.id_names();
        let mut ids = Vec::with_capacity(records.len());
        for record in &records {
            let id = shaper::extract_id(record, &id_names)?;
            ids.push(id_list_to_value(id));
        }
        self.delete_records_by_ids(table, ids, opts, ctx).await
    }

    async fn delete_records_by_ids(
        &self,
        table: &str,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    async fn delete_records_by_filter(
        &self,
        table: &str,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    async fn retrieve_records_by_ids(
        &self,
        table: &str,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>>;

    /// Fetch one record by id, raising `NotFound` when it does not exist.
    async fn retrieve_record(
        &self,
        table: &str,
        id: &Value,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Record> {
        let records = self
            .retrieve_records_by_ids(table, vec![id.clone()], opts, ctx)
            .await?;
        records.into_iter().next().ok_or_else(|| {
            ApiError::NotFound(format!("Record with identifier '{}' not found.", id))
        })
    }

    /// Filtered multi-record fetch. The second element is the total matching
    /// count when `opts.include_count` is set.
    async fn retrieve_records_by_filter(
        &self,
        table: &str,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<(Vec<Record>, Option<u64>)>;
}

/// Identifier metadata for a call, honoring the `id_field`/`id_type`
/// overrides from the request options.
pub(crate) fn effective_ids(
    table_schema: &TableSchema,
    opts: &RequestOptions,
) -> Vec<crate::models::IdField> {
    match &opts.id_field {
        Some(names) => names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let field_type = opts
                    .id_type
                    .as_ref()
                    .and_then(|types| types.get(i))
                    .copied()
                    .unwrap_or(crate::models::FieldType::String);
                crate::models::IdField::new(name, field_type)
            })
            .collect(),
        None => table_schema.id_fields.clone(),
    }
}

/// Coerce a client-supplied id (often a query-string string) to the
/// identifier's declared storage type.
pub(crate) fn coerce_to_type(value: &Value, field_type: crate::models::FieldType) -> Value {
    use crate::models::FieldType;
    match (field_type, value) {
        (FieldType::Id | FieldType::Integer | FieldType::Reference, Value::String(s)) => s
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| value.clone()),
        (FieldType::Float, Value::String(s)) => s
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

/// Collapse an extracted (possibly composite) id into one id value: a bare
/// scalar for single-field keys, an object map otherwise.
pub fn id_list_to_value(id: Vec<(String, Value)>) -> Value {
    if id.len() == 1 {
        id.into_iter().next().unwrap().1
    } else {
        Value::Object(id.into_iter().collect())
    }
}

/// Factory for creating backend instances from service configuration.
pub struct BackendFactory;

impl BackendFactory {
    pub async fn create(config: &ServiceConfig) -> ApiResult<Arc<dyn DbBackend>> {
        let backend = Self::create_backend(config).await?;
        Ok(Arc::from(backend))
    }

    pub async fn create_backend(config: &ServiceConfig) -> ApiResult<Box<dyn DbBackend>> {
        match BackendType::from_str(&config.backend_type)? {
            BackendType::Sql => Ok(Box::new(sql::SqlBackend::connect(config).await?)),
            BackendType::MongoDb => Ok(Box::new(mongo::MongoBackend::connect(config).await?)),
            BackendType::DynamoDb => Ok(Box::new(dynamodb::DynamoBackend::connect(config).await?)),
            BackendType::Salesforce => {
                Ok(Box::new(salesforce::SalesforceBackend::connect(config).await?))
            }
            BackendType::Sns => Ok(Box::new(sns::SnsBackend::connect(config).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_aliases() {
        assert_eq!(BackendType::from_str("sqlite").unwrap(), BackendType::Sql);
        assert_eq!(BackendType::from_str("Mongo").unwrap(), BackendType::MongoDb);
        assert_eq!(
            BackendType::from_str("aws_dynamodb").unwrap(),
            BackendType::DynamoDb
        );
        assert!(BackendType::from_str("redis").is_err());
    }

    #[test]
    fn test_id_list_to_value() {
        let single = id_list_to_value(vec![("id".to_string(), serde_json::json!(3))]);
        assert_eq!(single, serde_json::json!(3));
        let composite = id_list_to_value(vec![
            ("pk".to_string(), serde_json::json!("a")),
            ("sk".to_string(), serde_json::json!(1)),
        ]);
        assert_eq!(composite, serde_json::json!({"pk": "a", "sk": 1}));
    }
}
