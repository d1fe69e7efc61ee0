pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod models;
pub mod options;
pub mod parser;
pub mod shaper;
pub mod startup;

// Re-export commonly used types for easier access
pub use backend::{BackendFactory, DbBackend};
pub use error::{ApiError, ApiResult};
pub use models::{Record, TableSchema};
pub use options::{RequestContext, RequestOptions};
