use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::{json, Value};

use super::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::TableSchema;
use crate::options::RequestOptions;

/// `GET /api/{service}` — list the service's tables. `names_only` collapses
/// the listing to a name array; `as_access_components` renders the access
/// component form used by role configuration.
pub async fn list_resources(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let opts = RequestOptions::from_query(&query)?;
    let names = backend.list_tables().await?;

    if opts.as_access_components {
        let mut components = vec!["".to_string(), "*".to_string()];
        components.extend(names);
        return Ok(Json(json!({ "resource": components })));
    }
    if opts.names_only {
        return Ok(Json(json!({ "resource": names })));
    }
    let resources: Vec<Value> = names.iter().map(|name| json!({ "name": name })).collect();
    Ok(Json(json!({ "resource": resources })))
}

/// `GET /api/{service}/_schema` — table listing for the admin surface.
pub async fn get_tables(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let opts = RequestOptions::from_query(&query)?;
    let names = backend.list_tables().await?;
    if opts.names_only {
        return Ok(Json(json!({ "resource": names })));
    }
    let resources: Vec<Value> = names.iter().map(|name| json!({ "name": name })).collect();
    Ok(Json(json!({ "resource": resources })))
}

fn schemas_from_body(body: &Value) -> ApiResult<Vec<TableSchema>> {
    let items: Vec<Value> = match body {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("table").or_else(|| map.get("resource")) {
            Some(Value::Array(items)) => items.clone(),
            Some(single) => vec![single.clone()],
            None => vec![body.clone()],
        },
        _ => {
            return Err(ApiError::BadRequest(
                "Request body must carry table definitions.".to_string(),
            ))
        }
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<TableSchema>(item)
                .map_err(|e| ApiError::BadRequest(format!("Invalid table definition: {}", e)))
        })
        .collect()
}

/// `POST /api/{service}/_schema` — create one or more tables.
pub async fn create_tables(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let mut created = Vec::new();
    for schema in schemas_from_body(&body)? {
        created.push(serde_json::to_value(backend.create_table(&schema).await?)?);
    }
    Ok(Json(json!({ "table": created })))
}

/// `PATCH /api/{service}/_schema` — update one or more tables.
pub async fn update_tables(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let mut updated = Vec::new();
    for schema in schemas_from_body(&body)? {
        updated.push(serde_json::to_value(backend.update_table(&schema).await?)?);
    }
    Ok(Json(json!({ "table": updated })))
}

/// `DELETE /api/{service}/_schema?names=a,b` — drop several tables. Each
/// drop reports individually; one failure does not stop the rest.
pub async fn delete_tables(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let names: Vec<String> = query
        .get("names")
        .or_else(|| query.get("ids"))
        .map(|raw| {
            raw.split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if names.is_empty() {
        return Err(ApiError::BadRequest(
            "No table names given to delete.".to_string(),
        ));
    }
    let mut results = Vec::with_capacity(names.len());
    for name in names {
        match backend.delete_table(&name).await {
            Ok(()) => results.push(json!({ "name": name, "success": true })),
            Err(err) => results.push(json!({ "name": name, "error": err.to_string() })),
        }
    }
    Ok(Json(json!({ "table": results })))
}

/// `GET /api/{service}/_schema/{table}` — full table descriptor.
pub async fn describe_table(
    State(state): State<AppState>,
    Path((service, table)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    let opts = RequestOptions::from_query(&query)?;
    let schema = backend.describe_table(&table, &opts).await?;
    Ok(Json(serde_json::to_value(schema)?))
}

/// `DELETE /api/{service}/_schema/{table}` — drop a table.
pub async fn delete_table(
    State(state): State<AppState>,
    Path((service, table)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let backend = state.service(&service)?;
    backend.delete_table(&table).await?;
    Ok(Json(json!({ "name": table, "success": true })))
}
