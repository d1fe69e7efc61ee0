//! SQL backend adapter on top of sqlx's Any driver (SQLite and PostgreSQL
//! dialects). Identifier and field metadata come from live schema
//! introspection, cached per instance and invalidated on schema mutations.

pub mod filter_impl;
pub mod relations;
pub mod schema;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use sqlx::any::{install_default_drivers, AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool, Column, Row};

use crate::batch::{self, BatchPolicy, BatchRunner, StepControl};
use crate::config::ServiceConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::{FieldType, IdField, Record, TableSchema};
use crate::options::{FieldProjection, RequestContext, RequestOptions};
use crate::parser::{combine_filters, parse_filter, FilterNode, SortOrder};
use crate::shaper;

use filter_impl::{quote_ident, SqlDialect, SqlFilterCompiler};

pub use filter_impl::SqlDialect as Dialect;

/// Bind one JSON value as a query parameter.
pub(crate) fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    value: &Value,
) -> ApiResult<sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>> {
    Ok(match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => {
            return Err(ApiError::BadRequest(format!(
                "Value {} cannot be bound as a SQL parameter.",
                other
            )))
        }
    })
}

pub(crate) fn row_to_record(row: &AnyRow) -> Record {
    let mut record = Record::new();
    for (index, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), decode_column(row, index));
    }
    record
}

fn decode_column(row: &AnyRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(Value::String).unwrap_or(Value::Null);
    }
    Value::Null
}

use super::{coerce_to_type, effective_ids};

enum WriteConn {
    Tx(sqlx::Transaction<'static, sqlx::Any>),
    Pool(sqlx::pool::PoolConnection<sqlx::Any>),
}

impl WriteConn {
    fn conn(&mut self) -> &mut AnyConnection {
        match self {
            WriteConn::Tx(tx) => &mut *tx,
            WriteConn::Pool(conn) => &mut *conn,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum WriteMode {
    Replace,
    Patch,
}

pub struct SqlBackend {
    pool: AnyPool,
    dialect: SqlDialect,
    max_records: u64,
    schema_cache: RwLock<HashMap<String, TableSchema>>,
}

impl SqlBackend {
    pub async fn connect(config: &ServiceConfig) -> ApiResult<SqlBackend> {
        install_default_drivers();
        let url = config.require_url()?;
        let dialect = SqlDialect::from_url(url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .map_err(|e| ApiError::Database(format!("Failed to connect to '{}': {}", url, e)))?;
        Ok(SqlBackend {
            pool,
            dialect,
            max_records: config.max_records,
            schema_cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Raw parameterized query escape hatch.
    pub async fn raw_query(&self, sql: &str, params: &[Value]) -> ApiResult<Vec<Record>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param)?;
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_record).collect())
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
        let mut described = schema::describe(&self.pool, self.dialect, table).await?;
        described.relations = relations::discover(&self.pool, self.dialect, table).await?;
        self.schema_cache
            .write()
            .expect("schema cache poisoned")
            .insert(table.to_string(), described.clone());
        Ok(described)
    }

    fn invalidate(&self, table: &str) {
        self.schema_cache
            .write()
            .expect("schema cache poisoned")
            .remove(table);
    }

    fn compile_filter(
        &self,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<(String, Vec<Value>)> {
        let client = match opts.filter.as_deref() {
            Some(text) => parse_filter(text, &opts.params)?,
            None => None,
        };
        let combined = combine_filters(ctx.server_filters.as_ref(), client)?;
        self.clause_from_node(combined.as_ref())
    }

    fn clause_from_node(&self, node: Option<&FilterNode>) -> ApiResult<(String, Vec<Value>)> {
        match node {
            None => Ok((String::new(), Vec::new())),
            Some(node) => {
                let mut params = Vec::new();
                let compiler = SqlFilterCompiler::new(self.dialect);
                let clause = compiler.compile(node, &mut params)?;
                Ok((format!(" WHERE {}", clause), params))
            }
        }
    }

    fn order_clause(&self, opts: &RequestOptions) -> ApiResult<String> {
        if opts.order.is_empty() {
            return Ok(String::new());
        }
        let parts = opts
            .order
            .iter()
            .map(|spec| {
                quote_ident(&spec.field).map(|ident| {
                    let dir = match spec.order {
                        SortOrder::Ascending => "ASC",
                        SortOrder::Descending => "DESC",
                    };
                    format!("{} {}", ident, dir)
                })
            })
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }

    /// Split an id value into per-column parts matching the identifier
    /// metadata, coercing each to its declared type.
    fn id_parts(&self, ids: &[IdField], id: &Value) -> ApiResult<Vec<(String, Value)>> {
        if ids.is_empty() {
            return Err(ApiError::BadRequest(
                "Table has no identifier fields.".to_string(),
            ));
        }
        if ids.len() == 1 {
            return Ok(vec![(
                ids[0].name.clone(),
                coerce_to_type(id, ids[0].field_type),
            )]);
        }
        let Value::Object(map) = id else {
            return Err(ApiError::BadRequest(format!(
                "Composite identifier requires an object value, got {}.",
                id
            )));
        };
        ids.iter()
            .map(|field| {
                map.get(&field.name)
                    .map(|v| (field.name.clone(), coerce_to_type(v, field.field_type)))
                    .ok_or_else(|| {
                        ApiError::BadRequest(format!(
                            "Identifier part '{}' missing from id value.",
                            field.name
                        ))
                    })
            })
            .collect()
    }

    fn key_clause(&self, parts: &[(String, Value)], param_offset: usize) -> ApiResult<String> {
        let mut clauses = Vec::with_capacity(parts.len());
        for (i, (name, _)) in parts.iter().enumerate() {
            clauses.push(format!(
                "{} = {}",
                quote_ident(name)?,
                self.dialect.placeholder(param_offset + i + 1)
            ));
        }
        Ok(clauses.join(" AND "))
    }

    async fn fetch_by_key(
        &self,
        conn: &mut AnyConnection,
        table: &str,
        parts: &[(String, Value)],
    ) -> ApiResult<Option<Record>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {}",
            quote_ident(table)?,
            self.key_clause(parts, 0)?
        );
        let mut query = sqlx::query(&sql);
        for (_, value) in parts {
            query = bind_value(query, value)?;
        }
        let row = query.fetch_optional(&mut *conn).await?;
        Ok(row.map(|r| row_to_record(&r)))
    }

    async fn insert_one(
        &self,
        conn: &mut AnyConnection,
        table_schema: &TableSchema,
        ids: &[IdField],
        mut parsed: Record,
    ) -> ApiResult<Record> {
        let table = quote_ident(&table_schema.name)?;
        let id_names: Vec<String> = ids.iter().map(|f| f.name.clone()).collect();

        // String keys the database will not generate get a fresh UUID when
        // the client left them out.
        if let [id] = ids {
            let db_generated = table_schema
                .field(&id.name)
                .is_some_and(|f| f.auto_increment);
            if matches!(id.field_type, FieldType::String | FieldType::Text)
                && !db_generated
                && !parsed.contains_key(&id.name)
            {
                parsed.insert(
                    id.name.clone(),
                    Value::String(uuid::Uuid::new_v4().to_string()),
                );
            }
        }

        let columns: Vec<&String> = parsed.keys().collect();
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table)
        } else {
            let column_sql = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<ApiResult<Vec<_>>>()?
                .join(", ");
            let placeholders = (0..columns.len())
                .map(|i| self.dialect.placeholder(i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT INTO {} ({}) VALUES ({})", table, column_sql, placeholders)
        };

        // PostgreSQL reports generated keys through RETURNING; SQLite through
        // the statement result.
        match self.dialect {
            SqlDialect::Postgres => {
                let returning = id_names
                    .iter()
                    .map(|n| quote_ident(n))
                    .collect::<ApiResult<Vec<_>>>()?
                    .join(", ");
                let sql = format!("{} RETURNING {}", sql, returning);
                let mut query = sqlx::query(&sql);
                for value in parsed.values() {
                    query = bind_value(query, value)?;
                }
                let row = query.fetch_one(&mut *conn).await?;
                let returned = row_to_record(&row);
                let mut out = Record::new();
                for name in &id_names {
                    if let Some(value) = returned.get(name) {
                        out.insert(name.clone(), value.clone());
                    }
                }
                Ok(out)
            }
            SqlDialect::Sqlite => {
                let mut query = sqlx::query(&sql);
                for value in parsed.values() {
                    query = bind_value(query, value)?;
                }
                query.execute(&mut *conn).await?;
                let mut out = Record::new();
                for name in &id_names {
                    if let Some(value) = parsed.get(name) {
                        out.insert(name.clone(), value.clone());
                    }
                }
                if out.is_empty() && id_names.len() == 1 {
                    // Generated rowid, read on the same connection.
                    let row = sqlx::query("SELECT last_insert_rowid() AS id")
                        .fetch_one(&mut *conn)
                        .await?;
                    let generated: i64 = row.get("id");
                    out.insert(id_names[0].clone(), Value::from(generated));
                }
                Ok(out)
            }
        }
    }

    async fn write_one(
        &self,
        conn: &mut AnyConnection,
        table_schema: &TableSchema,
        parts: &[(String, Value)],
        parsed: &Record,
        mode: WriteMode,
    ) -> ApiResult<()> {
        let id_names: Vec<&String> = parts.iter().map(|(name, _)| name).collect();

        // Replace sets every declared mutable column; patch only what the
        // payload carried.
        let mut assignments: Vec<(String, Value)> = Vec::new();
        match mode {
            WriteMode::Patch => {
                for (name, value) in parsed {
                    if id_names.iter().any(|id| *id == name) {
                        continue;
                    }
                    assignments.push((name.clone(), value.clone()));
                }
            }
            WriteMode::Replace => {
                for field in &table_schema.fields {
                    if id_names.iter().any(|id| **id == field.name)
                        || field.auto_increment
                        || field.field_type == FieldType::TimestampOnCreate
                        || field.field_type == FieldType::UserIdOnCreate
                    {
                        continue;
                    }
                    let value = parsed.get(&field.name).cloned().unwrap_or(Value::Null);
                    if value.is_null() && !field.allow_null {
                        continue;
                    }
                    assignments.push((field.name.clone(), value));
                }
                if table_schema.fields.is_empty() {
                    for (name, value) in parsed {
                        if id_names.iter().any(|id| *id == name) {
                            continue;
                        }
                        assignments.push((name.clone(), value.clone()));
                    }
                }
            }
        }

        if assignments.is_empty() {
            return Ok(());
        }

        let set_sql = assignments
            .iter()
            .enumerate()
            .map(|(i, (name, _))| {
                quote_ident(name).map(|ident| {
                    format!("{} = {}", ident, self.dialect.placeholder(i + 1))
                })
            })
            .collect::<ApiResult<Vec<_>>>()?
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(&table_schema.name)?,
            set_sql,
            self.key_clause(parts, assignments.len())?
        );
        let mut query = sqlx::query(&sql);
        for (_, value) in &assignments {
            query = bind_value(query, value)?;
        }
        for (_, value) in parts {
            query = bind_value(query, value)?;
        }
        let result = query.execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound(format!(
                "Record with identifier '{}' not found.",
                parts
                    .iter()
                    .map(|(_, v)| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            )));
        }
        Ok(())
    }

    /// Shared batch driver for replace/patch writes.
    async fn write_batch(
        &self,
        table: &str,
        items: Vec<(Value, Record)>,
        mode: WriteMode,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let table_schema = self.table_schema(table).await?;
        let ids = effective_ids(&table_schema, opts);
        let id_names: Vec<String> = ids.iter().map(|f| f.name.clone()).collect();

        let policy = BatchPolicy::resolve(items.len(), opts);
        let mut runner = BatchRunner::new(items.len(), policy);
        let mut wc = if policy.rollback {
            WriteConn::Tx(self.pool.begin().await?)
        } else {
            WriteConn::Pool(self.pool.acquire().await?)
        };

        for (id, raw_record) in items {
            let result: ApiResult<Record> = async {
                let parts = self.id_parts(&ids, &id)?;
                let old = if ctx.record_filters.is_some() {
                    self.fetch_by_key(wc.conn(), table, &parts).await?
                } else {
                    None
                };
                let mut parsed = shaper::parse_inbound(
                    &raw_record,
                    &table_schema,
                    ctx,
                    true,
                    old.as_ref(),
                )?;
                shaper::strip_ids(&mut parsed, &id_names);
                self.write_one(wc.conn(), &table_schema, &parts, &parsed, mode)
                    .await?;
                if !table_schema.relations.is_empty() {
                    let key_record: Record = parts.iter().cloned().collect();
                    relations::apply_related_writes(
                        wc.conn(),
                        self.dialect,
                        &table_schema,
                        &key_record,
                        &raw_record,
                    )
                    .await?;
                }

                if opts.fields == FieldProjection::IdOnly {
                    Ok(parts.into_iter().collect())
                } else {
                    let full = self
                        .fetch_by_key(wc.conn(), table, &parts)
                        .await?
                        .unwrap_or_else(|| parts.iter().cloned().collect());
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

        let action = match mode {
            WriteMode::Replace => "updated",
            WriteMode::Patch => "patched",
        };
        let outcome = runner.finalize(action);
        self.finish_write(wc, policy, outcome).await
    }

    async fn finish_write(
        &self,
        wc: WriteConn,
        policy: BatchPolicy,
        outcome: ApiResult<Vec<Record>>,
    ) -> ApiResult<Vec<Record>> {
        match wc {
            WriteConn::Tx(tx) => match outcome {
                Ok(records) => {
                    tx.commit().await?;
                    Ok(records)
                }
                Err(err) => {
                    match tx.rollback().await {
                        Ok(()) => Err(batch::mark_rolled_back(err)),
                        Err(rollback_err) => {
                            // The original failure is what surfaces.
                            tracing::warn!("Transaction rollback failed: {}", rollback_err);
                            Err(err)
                        }
                    }
                }
            },
            WriteConn::Pool(_) => {
                debug_assert!(!policy.rollback);
                outcome
            }
        }
    }

    async fn ids_matching_filter(
        &self,
        table: &str,
        ids: &[IdField],
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Value>> {
        let (where_sql, params) = self.compile_filter(opts, ctx)?;
        let id_sql = ids
            .iter()
            .map(|f| quote_ident(&f.name))
            .collect::<ApiResult<Vec<_>>>()?
            .join(", ");
        let sql = format!("SELECT {} FROM {}{}", id_sql, quote_ident(table)?, where_sql);
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_value(query, param)?;
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let record = row_to_record(row);
                if ids.len() == 1 {
                    record.get(&ids[0].name).cloned().unwrap_or(Value::Null)
                } else {
                    Value::Object(record)
                }
            })
            .collect())
    }
}

#[async_trait]
impl super::DbBackend for SqlBackend {
    async fn health_check(&self) -> ApiResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn list_tables(&self) -> ApiResult<Vec<String>> {
        schema::table_names(&self.pool, self.dialect).await
    }

    async fn describe_table(&self, table: &str, _opts: &RequestOptions) -> ApiResult<TableSchema> {
        self.table_schema(table).await
    }

    async fn create_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        if schema::table_exists(&self.pool, self.dialect, &table_schema.name).await? {
            return Err(ApiError::BadRequest(format!(
                "Table '{}' already exists.",
                table_schema.name
            )));
        }
        schema::create_table(&self.pool, self.dialect, table_schema).await?;
        self.invalidate(&table_schema.name);
        self.table_schema(&table_schema.name).await
    }

    async fn update_table(&self, table_schema: &TableSchema) -> ApiResult<TableSchema> {
        let existing = self.table_schema(&table_schema.name).await?;
        schema::update_table(&self.pool, self.dialect, table_schema, &existing).await?;
        self.invalidate(&table_schema.name);
        self.table_schema(&table_schema.name).await
    }

    async fn delete_table(&self, table: &str) -> ApiResult<()> {
        if !schema::table_exists(&self.pool, self.dialect, table).await? {
            return Err(ApiError::NotFound(format!("Table '{}' not found.", table)));
        }
        schema::drop_table(&self.pool, table).await?;
        self.invalidate(table);
        Ok(())
    }

    async fn truncate_table(&self, table: &str) -> ApiResult<()> {
        if !schema::table_exists(&self.pool, self.dialect, table).await? {
            return Err(ApiError::NotFound(format!("Table '{}' not found.", table)));
        }
        schema::truncate(&self.pool, self.dialect, table).await
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
        let table_schema = self.table_schema(table).await?;
        let ids = effective_ids(&table_schema, opts);
        let id_names: Vec<String> = ids.iter().map(|f| f.name.clone()).collect();

        let policy = BatchPolicy::resolve(records.len(), opts);
        let mut runner = BatchRunner::new(records.len(), policy);
        let mut wc = if policy.rollback {
            WriteConn::Tx(self.pool.begin().await?)
        } else {
            WriteConn::Pool(self.pool.acquire().await?)
        };

        for record in records {
            let result: ApiResult<Record> = async {
                let parsed = shaper::parse_inbound(&record, &table_schema, ctx, false, None)?;
                let key = self.insert_one(wc.conn(), &table_schema, &ids, parsed).await?;
                if opts.fields == FieldProjection::IdOnly {
                    Ok(key)
                } else {
                    let parts: Vec<(String, Value)> = key.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    let full = self
                        .fetch_by_key(wc.conn(), table, &parts)
                        .await?
                        .unwrap_or(key);
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

        let outcome = runner.finalize("created");
        self.finish_write(wc, policy, outcome).await
    }

    async fn update_records(
        &self,
        table: &str,
        records: Vec<Record>,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let table_schema = self.table_schema(table).await?;
        let ids = effective_ids(&table_schema, opts);
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
        let table_schema = self.table_schema(table).await?;
        let ids = effective_ids(&table_schema, opts);
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
        let table_schema = self.table_schema(table).await?;
        let ids = effective_ids(&table_schema, opts);
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
        let table_schema = self.table_schema(table).await?;
        let ids = effective_ids(&table_schema, opts);
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
        let table_schema = self.table_schema(table).await?;
        let id_fields = effective_ids(&table_schema, opts);
        let id_names: Vec<String> = id_fields.iter().map(|f| f.name.clone()).collect();

        let policy = BatchPolicy::resolve(ids.len(), opts);
        let mut runner = BatchRunner::new(ids.len(), policy);
        let mut wc = if policy.rollback {
            WriteConn::Tx(self.pool.begin().await?)
        } else {
            WriteConn::Pool(self.pool.acquire().await?)
        };

        for id in ids {
            let result: ApiResult<Record> = async {
                let parts = self.id_parts(&id_fields, &id)?;
                let old = self
                    .fetch_by_key(wc.conn(), table, &parts)
                    .await?
                    .ok_or_else(|| {
                        ApiError::NotFound(format!("Record with identifier '{}' not found.", id))
                    })?;
                if let Some(spec) = &ctx.record_filters {
                    shaper::enforce_record_filter(spec, &old, None)?;
                }
                let sql = format!(
                    "DELETE FROM {} WHERE {}",
                    quote_ident(table)?,
                    self.key_clause(&parts, 0)?
                );
                let mut query = sqlx::query(&sql);
                for (_, value) in &parts {
                    query = bind_value(query, value)?;
                }
                query.execute(wc.conn()).await?;
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

        let outcome = runner.finalize("deleted");
        self.finish_write(wc, policy, outcome).await
    }

    async fn delete_records_by_filter(
        &self,
        table: &str,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<Vec<Record>> {
        let table_schema = self.table_schema(table).await?;
        let ids = effective_ids(&table_schema, opts);
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
        let table_schema = self.table_schema(table).await?;
        let id_fields = effective_ids(&table_schema, opts);
        let id_names: Vec<String> = id_fields.iter().map(|f| f.name.clone()).collect();

        let mut conn = self.pool.acquire().await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in &ids {
            let parts = self.id_parts(&id_fields, id)?;
            if let Some(record) = self.fetch_by_key(&mut conn, table, &parts).await? {
                records.push(record);
            }
        }
        drop(conn);
        if let Some(spec) = &ctx.server_filters {
            // Server-side filters bound reads as well as queries.
            records.retain(|record| shaper::enforce_record_filter(spec, record, None).is_ok());
        }
        relations::attach_related(
            &self.pool,
            self.dialect,
            &table_schema,
            &mut records,
            &opts.related,
        )
        .await?;
        Ok(shaper::shape_many(records, &opts.fields, &id_names))
    }

    async fn retrieve_records_by_filter(
        &self,
        table: &str,
        opts: &RequestOptions,
        ctx: &RequestContext,
    ) -> ApiResult<(Vec<Record>, Option<u64>)> {
        let table_schema = self.table_schema(table).await?;
        let ids = effective_ids(&table_schema, opts);
        let id_names: Vec<String> = ids.iter().map(|f| f.name.clone()).collect();

        let (where_sql, params) = self.compile_filter(opts, ctx)?;
        let order_sql = self.order_clause(opts)?;
        let limit = opts.limit.unwrap_or(self.max_records).min(self.max_records);
        let mut sql = format!(
            "SELECT * FROM {}{}{} LIMIT {}",
            quote_ident(table)?,
            where_sql,
            order_sql,
            limit
        );
        if opts.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", opts.offset));
        }
        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_value(query, param)?;
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut records: Vec<Record> = rows.iter().map(row_to_record).collect();

        relations::attach_related(
            &self.pool,
            self.dialect,
            &table_schema,
            &mut records,
            &opts.related,
        )
        .await?;

        let count = if opts.include_count {
            let count_sql = format!(
                "SELECT COUNT(*) AS total FROM {}{}",
                quote_ident(table)?,
                where_sql
            );
            let mut count_query = sqlx::query(&count_sql);
            for param in &params {
                count_query = bind_value(count_query, param)?;
            }
            let row = count_query.fetch_one(&self.pool).await?;
            Some(row.try_get::<i64, _>("total").unwrap_or_default() as u64)
        } else {
            None
        };

        Ok((shaper::shape_many(records, &opts.fields, &id_names), count))
    }
}
