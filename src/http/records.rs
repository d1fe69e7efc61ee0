use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::{json, Value};

use super::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::{extract_records, record_envelope, Record};
use crate::options::RequestOptions;

fn build_meta(
    records_len: usize,
    opts: &RequestOptions,
    count: Option<u64>,
) -> Option<Value> {
    let mut meta = serde_json::Map::new();
    if let Some(count) = count {
        meta.insert("count".to_string(), json!(count));
    }
    // A full page signals more rows past the requested window.
    if let Some(limit) = opts.limit {
        if records_len as u64 == limit {
            meta.insert("next".to_string(), json!(opts.offset + limit));
        }
    }
    if meta.is_empty() {
        None
    } else {
        Some(Value::Object(meta))
    }
}

fn single_template(records: &[Record]) -> ApiResult<Record> {
    records.first().cloned().ok_or_else(|| {
        ApiError::BadRequest("There are no records in the request.".to_string())
    })
}

pub async fn get_records(
    State(state): State<AppState>,
    Path((service, table)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let opts = RequestOptions::from_query(&query)?;
    let ctx = state.request_context();

    if !opts.ids.is_empty() {
        let records = backend
            .retrieve_records_by_ids(&table, opts.ids.clone(), &opts, &ctx)
            .await?;
        return Ok(Json(record_envelope(records, None)));
    }

    let (records, count) = backend.retrieve_records_by_filter(&table, &opts, &ctx).await?;
    let mut meta = build_meta(records.len(), &opts, count);
    if opts.include_schema {
        let schema = serde_json::to_value(backend.describe_table(&table, &opts).await?)?;
        meta = Some(match meta {
            Some(Value::Object(mut map)) => {
                map.insert("schema".to_string(), schema);
                Value::Object(map)
            }
            _ => json!({ "schema": schema }),
        });
    }
    Ok(Json(record_envelope(records, meta)))
}

pub async fn create_records(
    State(state): State<AppState>,
    Path((service, table)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let mut opts = RequestOptions::from_query(&query)?;
    opts.apply_payload_keys(&body)?;
    let ctx = state.request_context();

    let records = extract_records(&body)?;
    let created = backend.create_records(&table, records, &opts, &ctx).await?;
    Ok(Json(record_envelope(created, None)))
}

pub async fn update_records(
    State(state): State<AppState>,
    Path((service, table)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let mut opts = RequestOptions::from_query(&query)?;
    opts.apply_payload_keys(&body)?;
    let ctx = state.request_context();
    let records = extract_records(&body)?;

    let updated = if !opts.ids.is_empty() {
        let template = single_template(&records)?;
        backend
            .update_records_by_ids(&table, template, opts.ids.clone(), &opts, &ctx)
            .await?
    } else if opts.filter.is_some() {
        let template = single_template(&records)?;
        backend
            .update_records_by_filter(&table, template, &opts, &ctx)
            .await?
    } else {
        backend.update_records(&table, records, &opts, &ctx).await?
    };
    Ok(Json(record_envelope(updated, None)))
}

pub async fn merge_records(
    State(state): State<AppState>,
    Path((service, table)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let mut opts = RequestOptions::from_query(&query)?;
    opts.apply_payload_keys(&body)?;
    let ctx = state.request_context();
    let records = extract_records(&body)?;

    let merged = if !opts.ids.is_empty() {
        let template = single_template(&records)?;
        backend
            .merge_records_by_ids(&table, template, opts.ids.clone(), &opts, &ctx)
            .await?
    } else if opts.filter.is_some() {
        let template = single_template(&records)?;
        backend
            .merge_records_by_filter(&table, template, &opts, &ctx)
            .await?
    } else {
        backend.merge_records(&table, records, &opts, &ctx).await?
    };
    Ok(Json(record_envelope(merged, None)))
}

pub async fn delete_records(
    State(state): State<AppState>,
    Path((service, table)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let mut opts = RequestOptions::from_query(&query)?;
    if let Some(Json(body)) = &body {
        opts.apply_payload_keys(body)?;
    }
    let ctx = state.request_context();

    if !opts.ids.is_empty() {
        let deleted = backend
            .delete_records_by_ids(&table, opts.ids.clone(), &opts, &ctx)
            .await?;
        return Ok(Json(record_envelope(deleted, None)));
    }
    if opts.filter.is_some() {
        let deleted = backend.delete_records_by_filter(&table, &opts, &ctx).await?;
        return Ok(Json(record_envelope(deleted, None)));
    }
    if let Some(Json(body)) = &body {
        if let Ok(records) = extract_records(body) {
            if !records.is_empty() && records.iter().any(|r| !r.is_empty()) {
                let deleted = backend.delete_records(&table, records, &opts, &ctx).await?;
                return Ok(Json(record_envelope(deleted, None)));
            }
        }
    }
    // No ids, no filter, no records: only an explicit force empties a table.
    if opts.force {
        backend.truncate_table(&table).await?;
        return Ok(Json(json!({ "success": true })));
    }
    Err(ApiError::BadRequest(
        "Deleting all records requires 'force=true'.".to_string(),
    ))
}

pub async fn get_record(
    State(state): State<AppState>,
    Path((service, table, id)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let opts = RequestOptions::from_query(&query)?;
    let ctx = state.request_context();
    let record = backend
        .retrieve_record(&table, &Value::String(id), &opts, &ctx)
        .await?;
    Ok(Json(Value::Object(record)))
}

pub async fn update_record(
    State(state): State<AppState>,
    Path((service, table, id)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let opts = RequestOptions::from_query(&query)?;
    let ctx = state.request_context();
    let record = body
        .as_object()
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("Request body must be a record.".to_string()))?;
    let updated = backend
        .update_records_by_ids(&table, record, vec![Value::String(id)], &opts, &ctx)
        .await?;
    let record = updated.into_iter().next().unwrap_or_default();
    Ok(Json(Value::Object(record)))
}

pub async fn merge_record(
    State(state): State<AppState>,
    Path((service, table, id)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let opts = RequestOptions::from_query(&query)?;
    let ctx = state.request_context();
    let record = body
        .as_object()
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("Request body must be a record.".to_string()))?;
    let merged = backend
        .merge_records_by_ids(&table, record, vec![Value::String(id)], &opts, &ctx)
        .await?;
    let record = merged.into_iter().next().unwrap_or_default();
    Ok(Json(Value::Object(record)))
}

pub async fn delete_record(
    State(state): State<AppState>,
    Path((service, table, id)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let opts = RequestOptions::from_query(&query)?;
    let ctx = state.request_context();
    let deleted = backend
        .delete_records_by_ids(&table, vec![Value::String(id)], &opts, &ctx)
        .await?;
    let record = deleted.into_iter().next().unwrap_or_default();
    Ok(Json(Value::Object(record)))
}
