//! AWS SNS backend adapter.
//!
//! The push service is folded into the common contract by treating topics
//! as tables: listing pages through `ListTopics` with its NextToken,
//! `create_records` publishes one message per record, and the schema
//! surface creates and deletes topics. Filtered record operations have no
//! meaning on a push channel and are rejected.

use async_trait::async_trait;
use aws_sdk_sns::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sns::Client;
use serde_json::Value;

use crate::config::ServiceConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{FieldInfo, FieldType, IdField, Record, TableSchema};
use crate::options::{RequestContext, RequestOptions};

fn sns_err<E, R>(err: SdkError<E, R>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    match err.code() {
        Some("NotFound") | Some("NotFoundException") => ApiError::NotFound(message),
        Some("InvalidParameter") | Some("InvalidParameterValue") => ApiError::BadRequest(message),
        _ => ApiError::Database(message),
    }
}

fn unsupported(operation: &str) -> ApiError {
    ApiError::BadRequest(format!(
        "{} is not supported for the push service.",
        operation
    ))
}

pub struct SnsBackend {
    client: Client,
}

impl SnsBackend {
    pub async fn connect(config: &ServiceConfig) -> ApiResult<SnsBackend> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_sns::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(SnsBackend {
            client: Client::from_conf(builder.build()),
        })
    }

    async fn topic_arns(&self) -> ApiResult<Vec<String>> {
        let mut arns = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut request = self.client.list_topics();
            if let Some(token) = next.take() {
                request = request.next_token(token);
            }
            let resp = request.send().await.map_err(sns_err)?;
            arns.extend(
                resp.topics()
                    .iter()
                    .filter_map(|t| t.topic_arn().map(String::from)),
            );
            match resp.next_token() {
                Some(token) => next = Some(token.to_string()),
                None => break,
            }
        }
        Ok(arns)
    }

    /// Accept either a full ARN or a bare topic name.
    async fn resolve_topic(&self, table: &str) -> ApiResult<String> {
        if table.starts_with("arn:") {
            return Ok(table.to_string());
        }
        self.topic_arns()
            .await?
            .into_iter()
            .find(|arn| arn.rsplit(':').next() == Some(table))
            .ok_or_else(|| ApiError::NotFound(format!("Topic '{}' not found.", table)))
    }

    fn topic_name(arn: &str) -> String {
        arn.rsplit(':').next().unwrap_or(arn).to_string()
    }
}

#[async_trait]
impl super::DbBackend for SnsBackend {
    async fn health_check(&self) -> ApiResult<()> {
        self.client.list_topics().send().await.map_err(sns_err)?;
        Ok(())
    }

    async fn list_tables(&self) -> ApiResult<Vec<String>> {
        Ok(self
            .topic_arns()
            .await?
            .iter()
            .map(|arn| Self::topic_name(arn))
            .collect())
    }

    async fn describe_table(&self, table: &str, _opts: &RequestOptions) -> ApiResult<TableSchema> {
        let arn = self.resolve_topic(table).await?;
        let attributes = self
            .client
            .get_topic_attributes()
            .topic_arn(&arn)
            .send()
            .await
            .map_err(sns_err)?;

        let mut schema = TableSchema::new(Self::topic_name(&arn));
        schema.id_fields = vec![IdField::new("TopicArn", FieldType::String)];
        if let Some(attrs) = attributes.attributes() {
            for name in attrs.keys() {
                schema.fields.push(FieldInfo::new(name, FieldType::String));
            }
        }
        Ok(schema)
    }

    async fn create_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        let resp = self
            .client
            .create_topic()
            .name(&table_schema.name)
            .send()
            .await
            .map_err(sns_err)?;
        let arn = resp.topic_arn().unwrap_or_default().to_string();
        let mut created = TableSchema::new(&table_schema.name);
        created.id_fields = vec![IdField::new("TopicArn", FieldType::String)];
        created.fields = vec![{
            let mut f = FieldInfo::new("TopicArn", FieldType::String);
            f.default = Some(Value::String(arn));
            f
        }];
        Ok(created)
    }

    async fn update_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        Err(unsupported(&format!(
            "Updating topic '{}'",
            table_schema.name
        )))
    }

    async fn delete_table(&self, table: &str) -> ApiResult<()> {
        let arn = self.resolve_topic(table).await?;
        self.client
            .delete_topic()
            .topic_arn(arn)
            .send()
            .await
            .map_err(sns_err)?;
        Ok(())
    }

    async fn truncate_table(&self, _table: &str) -> ApiResult<()> {
        Err(unsupported("Truncating a topic"))
    }

    /// Publishing is the only record write: one message per record. Records
    /// carry `message` (string or JSON-encoded object) and optional
    /// `subject`.
    async fn create_records(
        &self,
        table: &str,
        records: Vec<Record>,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let arn = self.resolve_topic(table).await?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let message = match record.get("message") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => Value::Object(record.clone()).to_string(),
            };
            let mut request = self.client.publish().topic_arn(&arn).message(message);
            if let Some(Value::String(subject)) = record.get("subject") {
                request = request.subject(subject);
            }
            let resp = request.send().await.map_err(sns_err)?;
            let mut published = Record::new();
            published.insert(
                "MessageId".to_string(),
                Value::String(resp.message_id().unwrap_or_default().to_string()),
            );
            out.push(published);
        }
        Ok(out)
    }

    async fn update_records(
        &self,
        _table: &str,
        _records: Vec<Record>,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        Err(unsupported("Updating records"))
    }

    async fn update_records_by_ids(
        &self,
        _table: &str,
        _record: Record,
        _ids: Vec<Value>,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        Err(unsupported("Updating records"))
    }

    async fn update_records_by_filter(
        &self,
        _table: &str,
        _record: Record,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        Err(unsupported("Updating records"))
    }

    async fn merge_records(
        &self,
        _table: &str,
        _records: Vec<Record>,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        Err(unsupported("Merging records"))
    }

    async fn merge_records_by_ids(
        &self,
        _table: &str,
        _record: Record,
        _ids: Vec<Value>,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        Err(unsupported("Merging records"))
    }

    async fn merge_records_by_filter(
        &self,
        _table: &str,
        _record: Record,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        Err(unsupported("Merging records"))
    }

    async fn delete_records_by_ids(
        &self,
        _table: &str,
        _ids: Vec<Value>,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        Err(unsupported("Deleting records"))
    }

    async fn delete_records_by_filter(
        &self,
        _table: &str,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        Err(unsupported("Deleting records"))
    }

    async fn retrieve_records_by_ids(
        &self,
        _table: &str,
        _ids: Vec<Value>,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        Err(unsupported("Retrieving records"))
    }

    async fn retrieve_records_by_filter(
        &self,
        _table: &str,
        _opts: &RequestOptions,
        _ctx: &RequestContext,
    ) -> ApiResult<(Vec<Record>, Option<u64>)> {
        Err(unsupported("Retrieving records"))
    }
}
