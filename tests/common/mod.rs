use serde_json::{json, Value};

use dbbridge::backend::sql::SqlBackend;
use dbbridge::backend::DbBackend;
use dbbridge::config::ServiceConfig;
use dbbridge::models::{FieldInfo, FieldType, IdField, Record, TableSchema};
use dbbridge::options::{RequestContext, RequestOptions};

/// In-memory SQLite backend for tests. One pooled connection, or every
/// pool member would see its own private database.
pub async fn setup_sql_backend() -> SqlBackend {
    let config = ServiceConfig::memory_sqlite("db");
    SqlBackend::connect(&config).await.expect("sqlite connect")
}

/// Create the `users` fixture table: auto-increment id, required name,
/// nullable age/email/status.
pub async fn create_users_table(backend: &SqlBackend) {
    let mut schema = TableSchema::new("users");
    schema.id_fields = vec![IdField::new("id", FieldType::Id)];
    let mut name = FieldInfo::new("name", FieldType::String);
    name.allow_null = false;
    name.required = true;
    schema.fields = vec![
        name,
        FieldInfo::new("age", FieldType::Integer),
        FieldInfo::new("email", FieldType::String),
        FieldInfo::new("status", FieldType::String),
        FieldInfo::new("owner_id", FieldType::Integer),
    ];
    backend.create_table(&schema).await.expect("create users table");
}

pub fn record(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// The three-user fixture from the retrieval scenarios: ages 18, 22, 30.
pub async fn seed_users(backend: &SqlBackend) {
    let records = vec![
        record(&[("name", json!("amy")), ("age", json!(18)), ("owner_id", json!(1))]),
        record(&[("name", json!("bob")), ("age", json!(22)), ("owner_id", json!(1))]),
        record(&[("name", json!("cal")), ("age", json!(30)), ("owner_id", json!(2))]),
    ];
    backend
        .create_records("users", records, &RequestOptions::default(), &RequestContext::anonymous())
        .await
        .expect("seed users");
}

pub fn opts_with_fields(fields: &str) -> RequestOptions {
    let mut opts = RequestOptions::default();
    opts.fields = dbbridge::options::FieldProjection::from_option(Some(fields));
    opts
}

pub fn opts_with_filter(filter: &str, fields: &str) -> RequestOptions {
    let mut opts = opts_with_fields(fields);
    opts.filter = Some(filter.to_string());
    opts
}
