//! HTTP resource layer: table-scoped verbs map onto the backend contract.

pub mod records;
pub mod tables;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::backend::DbBackend;
use crate::error::{ApiError, ApiResult};
use crate::options::RequestContext;

/// Shared router state: configured services by name.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<HashMap<String, Arc<dyn DbBackend>>>,
}

impl AppState {
    pub fn new(services: HashMap<String, Arc<dyn DbBackend>>) -> Self {
        Self {
            services: Arc::new(services),
        }
    }

    pub fn service(&self, name: &str) -> ApiResult<Arc<dyn DbBackend>> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("Service '{}' not found.", name)))
    }

    /// Caller context for this request. Session resolution and row-level
    /// access filters belong to the hosting platform; standalone deployments
    /// run anonymous.
    pub fn request_context(&self) -> RequestContext {
        RequestContext::anonymous()
    }
}

/// `GET /health` — ping every configured service.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let mut services = serde_json::Map::new();
    for (name, backend) in state.services.iter() {
        let status = match backend.health_check().await {
            Ok(()) => json!("ok"),
            Err(err) => json!({ "error": err.to_string() }),
        };
        services.insert(name.clone(), status);
    }
    Json(json!({ "services": services }))
}
