use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, patch, post, put},
    Router,
};

use crate::backend::{BackendFactory, DbBackend};
use crate::config::AppConfig;
use crate::error::ApiResult;
use crate::http::{records, tables, AppState};
use crate::logging;

/// Connect every configured service.
pub async fn connect_services(
    config: &AppConfig,
) -> ApiResult<HashMap<String, Arc<dyn DbBackend>>> {
    let mut services = HashMap::new();
    for service in &config.services {
        tracing::info!("Connecting service '{}' ({})", service.name, service.backend_type);
        let backend = BackendFactory::create(service).await?;
        services.insert(service.name.clone(), backend);
    }
    Ok(services)
}

/// Build the application router over the connected services.
pub fn build_router(services: HashMap<String, Arc<dyn DbBackend>>) -> Router {
    let state = AppState::new(services);

    Router::new()
        .route("/health", get(crate::http::health))
        // Admin schema surface.
        .route("/api/{service}", get(tables::list_resources))
        .route("/api/{service}/_schema", get(tables::get_tables))
        .route("/api/{service}/_schema", post(tables::create_tables))
        .route("/api/{service}/_schema", patch(tables::update_tables))
        .route("/api/{service}/_schema", delete(tables::delete_tables))
        .route("/api/{service}/_schema/{table}", get(tables::describe_table))
        .route("/api/{service}/_schema/{table}", delete(tables::delete_table))
        // Table-scoped record surface.
        .route("/api/{service}/{table}", get(records::get_records))
        .route("/api/{service}/{table}", post(records::create_records))
        .route("/api/{service}/{table}", put(records::update_records))
        .route("/api/{service}/{table}", patch(records::merge_records))
        .route("/api/{service}/{table}", delete(records::delete_records))
        .route("/api/{service}/{table}/{id}", get(records::get_record))
        .route("/api/{service}/{table}/{id}", put(records::update_record))
        .route("/api/{service}/{table}/{id}", patch(records::merge_record))
        .route("/api/{service}/{table}/{id}", delete(records::delete_record))
        .layer(middleware::from_fn(logging::logging_middleware))
        .with_state(state)
}
