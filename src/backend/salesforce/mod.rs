//! Salesforce backend adapter over the REST data API.
//!
//! The session token is cached per adapter instance (one per configured
//! service, process-wide) with last-writer-wins refresh, which is safe
//! because token refresh is idempotent. A 401 on any call refreshes the
//! session once and retries the request. Structural DDL is not available on
//! this backend.

pub mod soql;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::batch::{self, BatchPolicy, BatchRunner, RollbackJournal, StepControl};
use crate::config::ServiceConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{FieldInfo, FieldType, IdField, Record, TableSchema, ValidationRule};
use crate::options::{FieldProjection, RequestContext, RequestOptions};
use crate::parser::{combine_filters, parse_filter, SortOrder};
use crate::shaper;

use soql::SoqlCompiler;

const DEFAULT_API_VERSION: &str = "v59.0";

#[derive(Debug, Clone)]
struct Session {
    access_token: String,
    instance_url: String,
}

enum Undo {
    Remove(String),
    Restore { id: String, fields: Record },
    Recreate(Record),
}

pub struct SalesforceBackend {
    http: reqwest::Client,
    login_url: String,
    username: String,
    password: String,
    client_id: String,
    client_secret: String,
    api_version: String,
    max_records: u64,
    session: RwLock<Option<Session>>,
    schema_cache: RwLock<HashMap<String, TableSchema>>,
}

impl SalesforceBackend {
    pub async fn connect(config: &ServiceConfig) -> ApiResult<SalesforceBackend> {
        let login_url = config
            .instance_url
            .clone()
            .ok_or_else(|| missing(config, "instance_url"))?;
        let username = config.username.clone().ok_or_else(|| missing(config, "username"))?;
        let mut password = config.password.clone().ok_or_else(|| missing(config, "password"))?;
        if let Some(token) = &config.security_token {
            password.push_str(token);
        }
        let backend = SalesforceBackend {
            http: reqwest::Client::new(),
            login_url,
            username,
            password,
            client_id: config.client_id.clone().ok_or_else(|| missing(config, "client_id"))?,
            client_secret: config
                .client_secret
                .clone()
                .ok_or_else(|| missing(config, "client_secret"))?,
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            max_records: config.max_records,
            session: RwLock::new(None),
            schema_cache: RwLock::new(HashMap::new()),
        };
        Ok(backend)
    }

    fn cached_session(&self) -> Option<Session> {
        self.session.read().expect("session cache poisoned").clone()
    }

    async fn login(&self) -> ApiResult<Session> {
        let response = self
            .http
            .post(format!("{}/services/oauth2/token", self.login_url))
            .form(&[
                ("grant_type", "password"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(transport_err)?;
        let status = response.status();
        let body: Value = response.json().await.map_err(transport_err)?;
        if !status.is_success() {
            return Err(ApiError::Internal(format!(
                "Salesforce login failed: {}",
                body["error_description"].as_str().unwrap_or("unknown error")
            )));
        }
        let session = Session {
            access_token: body["access_token"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            instance_url: body["instance_url"]
                .as_str()
                .unwrap_or(self.login_url.as_str())
                .to_string(),
        };
        *self.session.write().expect("session cache poisoned") = Some(session.clone());
        Ok(session)
    }

    async fn session(&self) -> ApiResult<Session> {
        match self.cached_session() {
            Some(session) => Ok(session),
            None => self.login().await,
        }
    }

    /// Perform one REST call, refreshing the session and retrying once on a
    /// 401.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ApiResult<(StatusCode, Value)> {
        let mut session = self.session().await?;
        for attempt in 0..2 {
            let url = format!(
                "{}/services/data/{}/{}",
                session.instance_url, self.api_version, path
            );
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&session.access_token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await.map_err(transport_err)?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                session = self.login().await?;
                continue;
            }
            let payload = if status == StatusCode::NO_CONTENT {
                Value::Null
            } else {
                response.json().await.unwrap_or(Value::Null)
            };
            return Ok((status, payload));
        }
        unreachable!("retry loop always returns");
    }

    fn check_status(status: StatusCode, payload: &Value, context: &str) -> ApiResult<()> {
        if status.is_success() {
            return Ok(());
        }
        let detail = match payload {
            Value::Array(errors) => errors
                .iter()
                .filter_map(|e| e["message"].as_str())
                .collect::<Vec<_>>()
                .join("; "),
            other => other["message"].as_str().unwrap_or("").to_string(),
        };
        let message = if detail.is_empty() {
            format!("{} failed with status {}.", context, status)
        } else {
            format!("{}: {}", context, detail)
        };
        Err(match status {
            StatusCode::NOT_FOUND => ApiError::NotFound(message),
            StatusCode::BAD_REQUEST => ApiError::BadRequest(message),
            s if s.is_client_error() => ApiError::BadRequest(message),
            _ => ApiError::Database(message),
        })
    }

    async fn table_schema(&self, table: &str) -> ApiResult<TableSchema> {
        if let Some(cached) = self
            .schema_cache
            .read()
            .expect("schema cache poisoned")
            .get(table)
        {
            return Ok(cached.clone());
        }
        let (status, payload) = self
            .call(Method::GET, &format!("sobjects/{}/describe", table), None)
            .await?;
        Self::check_status(status, &payload, "Describe")?;

        let mut schema = TableSchema::new(table);
        schema.id_fields = vec![IdField::new("Id", FieldType::String)];
        if let Some(fields) = payload["fields"].as_array() {
            for field in fields {
                let name = field["name"].as_str().unwrap_or_default().to_string();
                if name.is_empty() {
                    continue;
                }
                let field_type = match field["type"].as_str().unwrap_or("string") {
                    "id" => FieldType::Id,
                    "int" => FieldType::Integer,
                    "double" | "currency" | "percent" => FieldType::Float,
                    "boolean" => FieldType::Boolean,
                    "date" | "datetime" => FieldType::Datetime,
                    "base64" => FieldType::Binary,
                    "reference" => FieldType::Reference,
                    "textarea" => FieldType::Text,
                    _ => FieldType::String,
                };
                let mut info = FieldInfo::new(&name, field_type);
                info.allow_null = field["nillable"].as_bool().unwrap_or(true);
                // Formula and system fields are read-only through the API.
                if !field["updateable"].as_bool().unwrap_or(true)
                    && !field["createable"].as_bool().unwrap_or(true)
                {
                    info.validation.push(ValidationRule::ApiReadOnly {
                        on_fail: Some("ignore_field".to_string()),
                    });
                }
                if let Some(values) = field["picklistValues"].as_array() {
                    info.picklist = values
                        .iter()
                        .filter_map(|v| v["value"].as_str().map(|s| json!(s)))
                        .collect();
                }
                schema.fields.push(info);
            }
        }
        self.schema_cache
            .write()
            .expect("schema cache poisoned")
            .insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    fn field_list(&self, schema: &TableSchema, opts: &RequestOptions) -> String {
        match &opts.fields {
            FieldProjection::IdOnly => "Id".to_string(),
            FieldProjection::Some(fields) => {
                let mut list: Vec<String> = fields.clone();
                if !list.iter().any(|f| f.eq_ignore_ascii_case("Id")) {
                    list.push("Id".to_string());
                }
                list.join(", ")
            }
            FieldProjection::All => {
                if schema.fields.is_empty() {
                    "FIELDS(ALL)".to_string()
                } else {
                    schema
                        .fields
                        .iter()
                        .map(|f| f.name.clone())
                        .collect::<Vec<_>>()
                        .join(", ")
                }
            }
        }
    }

    fn where_clause(&self, opts: &RequestOptions, ctx: &RequestContext) -> ApiResult<String> {
        let client = match opts.filter.as_deref() {
            Some(text) => parse_filter(text, &opts.params)?,
            None => None,
        };
        let combined = combine_filters(ctx.server_filters.as_ref(), client)?;
        Ok(match combined {
            Some(node) => format!(" WHERE {}", SoqlCompiler::compile(&node)?),
            None => String::new(),
        })
    }

    /// Run a SOQL query, following `nextRecordsUrl` pagination until the
    /// requested number of rows is gathered.
    async fn query(&self, soql: &str, limit: usize) -> ApiResult<(Vec<Record>, u64)> {
        let encoded: String = url::form_urlencoded::byte_serialize(soql.as_bytes()).collect();
        let (status, mut payload) = self
            .call(Method::GET, &format!("query?q={}", encoded), None)
            .await?;
        Self::check_status(status, &payload, "Query")?;

        let total = payload["totalSize"].as_u64().unwrap_or_default();
        let mut records = Vec::new();
        loop {
            if let Some(batch_records) = payload["records"].as_array() {
                for record in batch_records {
                    if records.len() >= limit {
                        return Ok((records, total));
                    }
                    records.push(strip_attributes(record));
                }
            }
            let Some(next) = payload["nextRecordsUrl"].as_str() else {
                break;
            };
            // nextRecordsUrl is absolute under /services/data/{version}/.
            let path = next
                .rsplit_once(&format!("/services/data/{}/", self.api_version))
                .map(|(_, tail)| tail.to_string())
                .unwrap_or_else(|| next.to_string());
            let (status, next_payload) = self.call(Method::GET, &path, None).await?;
            Self::check_status(status, &next_payload, "Query")?;
            payload = next_payload;
        }
        Ok((records, total))
    }

    async fn fetch_by_id(
        &self,
        schema: &TableSchema,
        id: &str,
        opts: &RequestOptions,
    ) -> ApiResult<Option<Record>> {
        let soql = format!(
            "SELECT {} FROM {} WHERE Id = '{}'",
            self.field_list(schema, opts),
            schema.name,
            soql_escape(id)
        );
        let (mut records, _) = self.query(&soql, 1).await?;
        Ok(records.pop())
    }

    async fn rollback(&self, table: &str, journal: &mut RollbackJournal<Undo>) {
        for undo in journal.drain_reversed() {
            let result = match undo {
                Undo::Remove(id) => self
                    .call(Method::DELETE, &format!("sobjects/{}/{}", table, id), None)
                    .await
                    .map(|_| ()),
                Undo::Restore { id, fields } => self
                    .call(
                        Method::PATCH,
                        &format!("sobjects/{}/{}", table, id),
                        Some(&Value::Object(fields)),
                    )
                    .await
                    .map(|_| ()),
                Undo::Recreate(fields) => self
                    .call(
                        Method::POST,
                        &format!("sobjects/{}", table),
                        Some(&Value::Object(fields)),
                    )
                    .await
                    .map(|_| ()),
            };
            if let Err(err) = result {
                // The original failure is what surfaces to the caller.
                tracing::warn!("Rollback write on '{}' failed: {}", table, err);
            }
        }
    }

    fn id_from_value(id: &Value) -> ApiResult<String> {
        match id {
            Value::String(s) if !s.is_empty() => Ok(s.clone()),
            other => Err(ApiError::BadRequest(format!(
                "Salesforce identifiers are strings, got {}.",
                other
            ))),
        }
    }

    async fn write_batch(
        &self,
        table: &str,
        items: Vec<(Value, Record)>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let schema = self.table_schema(table).await?;
        let id_names = schema.id_names();

        let policy = BatchPolicy::resolve(items.len(), opts);
        let mut runner = BatchRunner::new(items.len(), policy);
        let mut journal = RollbackJournal::new();

        for (id, raw_record) in items {
            let result: ApiResult<Record> = async {
                let id = Self::id_from_value(&id)?;
                let old = if ctx.record_filters.is_some() || policy.rollback {
                    self.fetch_by_id(
                        &schema,
                        &id,
                        &RequestOptions {
                            fields: FieldProjection::All,
                            ..Default::default()
                        },
                    )
                    .await?
                } else {
                    None
                };
                let mut parsed =
                    shaper::parse_inbound(&raw_record, &schema, ctx, true, old.as_ref())?;
                shaper::strip_ids(&mut parsed, &id_names);

                let (status, payload) = self
                    .call(
                        Method::PATCH,
                        &format!("sobjects/{}/{}", table, id),
                        Some(&Value::Object(parsed.clone())),
                    )
                    .await?;
                Self::check_status(status, &payload, "Update")?;

                if policy.rollback {
                    if let Some(mut before) = old {
                        before.retain(|field, _| parsed.contains_key(field));
                        journal.push(Undo::Restore { id: id.clone(), fields: before });
                    }
                }

                if opts.fields == FieldProjection::IdOnly {
                    let mut out = Record::new();
                    out.insert("Id".to_string(), Value::String(id));
                    Ok(out)
                } else {
                    let full = self.fetch_by_id(&schema, &id, opts).await?.unwrap_or_default();
                    Ok(shaper::shape_outbound(full, &opts.fields, &id_names))
                }
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

        match runner.finalize("updated") {
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
        let schema = self.table_schema(table).await?;
        let soql = format!(
            "SELECT Id FROM {}{}",
            schema.name,
            self.where_clause(opts, ctx)?
        );
        let (records, _) = self.query(&soql, self.max_records as usize).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| r.get("Id").cloned())
            .collect())
    }
}

fn missing(config: &ServiceConfig, field: &str) -> ApiError {
    ApiError::Configuration(format!(
        "Service '{}' requires '{}'.",
        config.name, field
    ))
}

fn transport_err(err: reqwest::Error) -> ApiError {
    ApiError::Database(format!("Salesforce request failed: {}", err))
}

fn soql_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Query results carry an `attributes` envelope per record; drop it.
fn strip_attributes(value: &Value) -> Record {
    let mut record: Record = value.as_object().cloned().unwrap_or_default();
    record.remove("attributes");
    record
}

#[async_trait]
impl super::DbBackend for SalesforceBackend {
    async fn health_check(&self) -> ApiResult<()> {
        let (status, payload) = self.call(Method::GET, "sobjects", None).await?;
        Self::check_status(status, &payload, "Health check")
    }

    async fn list_tables(&self) -> ApiResult<Vec<String>> {
        let (status, payload) = self.call(Method::GET, "sobjects", None).await?;
        Self::check_status(status, &payload, "List tables")?;
        Ok(payload["sobjects"]
            .as_array()
            .map(|sobjects| {
                sobjects
                    .iter()
                    .filter_map(|s| s["name"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn describe_table(&self, table: &str, _opts: &RequestOptions) -> ApiResult<TableSchema> {
        self.table_schema(table).await
    }

    async fn create_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        Err(ApiError::NotImplemented(format!(
            "Creating table '{}' is not supported for Salesforce.",
            table_schema.name
        )))
    }

    async fn update_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        Err(ApiError::NotImplemented(format!(
            "Updating table '{}' is not supported for Salesforce.",
            table_schema.name
        )))
    }

    async fn delete_table(&self, table: &str) -> ApiResult<()> {
        Err(ApiError::NotImplemented(format!(
            "Deleting table '{}' is not supported for Salesforce.",
            table
        )))
    }

    async fn truncate_table(&self, table: &str) -> ApiResult<()> {
        Err(ApiError::NotImplemented(format!(
            "Truncating table '{}' is not supported for Salesforce.",
            table
        )))
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
        let schema = self.table_schema(table).await?;
        let id_names = schema.id_names();

        let policy = BatchPolicy::resolve(records.len(), opts);
        let mut runner = BatchRunner::new(records.len(), policy);
        let mut journal = RollbackJournal::new();

        for record in records {
            let result: ApiResult<Record> = async {
                let parsed = shaper::parse_inbound(&record, &schema, ctx, false, None)?;
                let (status, payload) = self
                    .call(
                        Method::POST,
                        &format!("sobjects/{}", table),
                        Some(&Value::Object(parsed)),
                    )
                    .await?;
                Self::check_status(status, &payload, "Create")?;
                let id = payload["id"].as_str().unwrap_or_default().to_string();
                if policy.rollback {
                    journal.push(Undo::Remove(id.clone()));
                }
                if opts.fields == FieldProjection::IdOnly {
                    let mut out = Record::new();
                    out.insert("Id".to_string(), Value::String(id));
                    Ok(out)
                } else {
                    let full = self.fetch_by_id(&schema, &id, opts).await?.unwrap_or_default();
                    Ok(shaper::shape_outbound(full, &opts.fields, &id_names))
                }
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
        let schema = self.table_schema(table).await?;
        let id_names = schema.id_names();
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let id = shaper::extract_id(&record, &id_names)?;
            items.push((super::id_list_to_value(id), record));
        }
        self.write_batch(table, items, opts, ctx).await
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
        self.write_batch(table, items, opts, ctx).await
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
        self.write_batch(table, items, opts, ctx).await
    }

    // Salesforce PATCH is already partial-update; merge and update share the
    // same wire operation.
    async fn merge_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        self.update_records(table, records, opts, ctx).await
    }

    async fn merge_records_by_ids(
        &self,
        table: &str,
        record: Record,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        self.update_records_by_ids(table, record, ids, opts, ctx).await
    }

    async fn merge_records_by_filter(
        &self,
        table: &str,
        record: Record,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        self.update_records_by_filter(table, record, opts, ctx).await
    }

    async fn delete_records_by_ids(
        &self,
        table: &str,
        ids: Vec<Value>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let schema = self.table_schema(table).await?;
        let id_names = schema.id_names();

        let policy = BatchPolicy::resolve(ids.len(), opts);
        let mut runner = BatchRunner::new(ids.len(), policy);
        let mut journal = RollbackJournal::new();

        for id in ids {
            let result: ApiResult<Record> = async {
                let id = Self::id_from_value(&id)?;
                let old = self
                    .fetch_by_id(
                        &schema,
                        &id,
                        &RequestOptions {
                            fields: FieldProjection::All,
                            ..Default::default()
                        },
                    )
                    .await?
                    .ok_or_else(|| {
                        ApiError::NotFound(format!("Record with identifier '{}' not found.", id))
                    })?;
                if let Some(spec) = &ctx.record_filters {
                    shaper::enforce_record_filter(spec, &old, None)?;
                }
                let (status, payload) = self
                    .call(Method::DELETE, &format!("sobjects/{}/{}", table, id), None)
                    .await?;
                Self::check_status(status, &payload, "Delete")?;
                if policy.rollback {
                    let mut fields = old.clone();
                    fields.remove("Id");
                    journal.push(Undo::Recreate(fields));
                }
                Ok(shaper::shape_outbound(old, &opts.fields, &id_names))
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
        let schema = self.table_schema(table).await?;
        let id_names = schema.id_names();
        let rendered = ids
            .iter()
            .map(|id| Self::id_from_value(id).map(|s| format!("'{}'", soql_escape(&s))))
            .collect::<ApiResult<Vec<_>>>()?
            .join(", ");
        let mut soql = format!(
            "SELECT {} FROM {} WHERE Id IN ({})",
            self.field_list(&schema, opts),
            schema.name,
            rendered
        );
        if let Some(server) = ctx.server_filters.as_ref() {
            if let Some(node) = server.compile()? {
                soql.push_str(&format!(" AND {}", SoqlCompiler::compile(&node)?));
            }
        }
        let (records, _) = self.query(&soql, ids.len()).await?;
        Ok(shaper::shape_many(records, &opts.fields, &id_names))
    }

    async fn retrieve_records_by_filter(
        &self,
        table: &str,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<(Vec<Record>, Option<u64>)> {
        let schema = self.table_schema(table).await?;
        let id_names = schema.id_names();
        let limit = opts.limit.unwrap_or(self.max_records).min(self.max_records);

        let mut soql = format!(
            "SELECT {} FROM {}{}",
            self.field_list(&schema, opts),
            schema.name,
            self.where_clause(opts, ctx)?
        );
        if !opts.order.is_empty() {
            let order = opts
                .order
                .iter()
                .map(|spec| {
                    let dir = match spec.order {
                        SortOrder::Ascending => "ASC",
                        SortOrder::Descending => "DESC",
                    };
                    format!("{} {}", spec.field, dir)
                })
                .collect::<Vec<_>>()
                .join(", ");
            soql.push_str(&format!(" ORDER BY {}", order));
        }
        soql.push_str(&format!(" LIMIT {}", limit));
        if opts.offset > 0 {
            soql.push_str(&format!(" OFFSET {}", opts.offset));
        }

        let (records, total) = self.query(&soql, limit as usize).await?;
        let count = opts.include_count.then_some(total);
        Ok((shaper::shape_many(records, &opts.fields, &id_names), count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_attributes() {
        let record = strip_attributes(&json!({
            "attributes": {"type": "Account", "url": "/services/..."},
            "Id": "001xx",
            "Name": "Acme"
        }));
        assert!(!record.contains_key("attributes"));
        assert_eq!(record["Name"], json!("Acme"));
    }

    #[test]
    fn test_soql_escape() {
        assert_eq!(soql_escape("O'Brien"), "O\\'Brien");
    }

    #[test]
    fn test_id_from_value() {
        assert!(SalesforceBackend::id_from_value(&json!("001xx")).is_ok());
        assert!(SalesforceBackend::id_from_value(&json!(5)).is_err());
    }
}
