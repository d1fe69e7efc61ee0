use std::collections::HashMap;
use std::sync::Arc;

use axum_test::TestServer;
use serde_json::json;

use dbbridge::backend::DbBackend;
use dbbridge::config::ServiceConfig;
use dbbridge::startup::build_router;

async fn setup_server() -> TestServer {
    let config = ServiceConfig::memory_sqlite("db");
    let backend = dbbridge::backend::BackendFactory::create(&config)
        .await
        .expect("sqlite backend");
    let mut services: HashMap<String, Arc<dyn DbBackend>> = HashMap::new();
    services.insert("db".to_string(), backend);
    TestServer::new(build_router(services)).expect("test server")
}

async fn create_todos_table(server: &TestServer) {
    let response = server
        .post("/api/db/_schema")
        .json(&json!({
            "table": [{
                "name": "todos",
                "id_fields": [{"name": "id", "type": "id"}],
                "fields": [
                    {"name": "title", "type": "string", "allow_null": false, "required": true},
                    {"name": "done", "type": "boolean"},
                    {"name": "priority", "type": "integer"}
                ]
            }]
        }))
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = setup_server().await;
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["services"]["db"], json!("ok"));
}

#[tokio::test]
async fn test_schema_create_and_list() {
    let server = setup_server().await;
    create_todos_table(&server).await;

    let response = server.get("/api/db/_schema").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["resource"][0]["name"], json!("todos"));

    let response = server.get("/api/db?names_only=true").await;
    let body: serde_json::Value = response.json();
    assert_eq!(body["resource"], json!(["todos"]));
}

#[tokio::test]
async fn test_record_crud_over_http() {
    let server = setup_server().await;
    create_todos_table(&server).await;

    // Create a batch.
    let response = server
        .post("/api/db/todos")
        .json(&json!({"record": [
            {"title": "write", "priority": 1},
            {"title": "review", "priority": 2}
        ]}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["record"][0]["id"], json!(1));
    assert_eq!(body["record"][1]["id"], json!(2));

    // Fetch with a filter and full projection.
    let response = server
        .get("/api/db/todos?filter=priority%20%3E%3D%202&fields=*")
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["record"].as_array().unwrap().len(), 1);
    assert_eq!(body["record"][0]["title"], json!("review"));

    // Single-record fetch.
    let response = server.get("/api/db/todos/1?fields=title").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["title"], json!("write"));
    assert_eq!(body["id"], json!(1));

    // Patch one field.
    let response = server
        .patch("/api/db/todos/1")
        .json(&json!({"done": true}))
        .await;
    response.assert_status_ok();

    let response = server.get("/api/db/todos/1?fields=*").await;
    let body: serde_json::Value = response.json();
    assert_eq!(body["done"], json!(1));
    assert_eq!(body["title"], json!("write"));

    // Delete by id list.
    let response = server.delete("/api/db/todos?ids=1,2").await;
    response.assert_status_ok();
    let response = server.get("/api/db/todos?fields=*").await;
    let body: serde_json::Value = response.json();
    assert!(body["record"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_bare_object_is_single_record() {
    let server = setup_server().await;
    create_todos_table(&server).await;

    let response = server
        .post("/api/db/todos")
        .json(&json!({"title": "solo"}))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["record"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_batch_error_context_shape() {
    let server = setup_server().await;
    create_todos_table(&server).await;

    let response = server
        .post("/api/db/todos?continue=true")
        .json(&json!({"record": [
            {"title": "ok"},
            {"title": null},
            {"title": "also ok"}
        ]}))
        .await;
    response.assert_status_bad_request();
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["context"]["error"], json!([1]));
    assert_eq!(
        body["error"]["context"]["record"].as_array().unwrap().len(),
        3
    );
}

#[tokio::test]
async fn test_delete_all_requires_force() {
    let server = setup_server().await;
    create_todos_table(&server).await;
    server
        .post("/api/db/todos")
        .json(&json!({"title": "keep me"}))
        .await
        .assert_status_ok();

    let response = server.delete("/api/db/todos").await;
    response.assert_status_bad_request();

    let response = server.delete("/api/db/todos?force=true").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["success"], json!(true));
}

#[tokio::test]
async fn test_unknown_service_and_table() {
    let server = setup_server().await;

    let response = server.get("/api/nope/things").await;
    response.assert_status_not_found();

    let response = server.get("/api/db/missing?fields=*").await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn test_meta_next_on_full_page() {
    let server = setup_server().await;
    create_todos_table(&server).await;
    server
        .post("/api/db/todos")
        .json(&json!({"record": [
            {"title": "a"}, {"title": "b"}, {"title": "c"}
        ]}))
        .await
        .assert_status_ok();

    let response = server.get("/api/db/todos?limit=2&include_count=true").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["record"].as_array().unwrap().len(), 2);
    assert_eq!(body["meta"]["count"], json!(3));
    assert_eq!(body["meta"]["next"], json!(2));
}

#[tokio::test]
async fn test_meta_schema_on_request() {
    let server = setup_server().await;
    create_todos_table(&server).await;

    let response = server.get("/api/db/todos?include_schema=true").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["meta"]["schema"]["name"], json!("todos"));
}

#[tokio::test]
async fn test_schema_delete_table() {
    let server = setup_server().await;
    create_todos_table(&server).await;

    let response = server.delete("/api/db/_schema/todos").await;
    response.assert_status_ok();

    let response = server.get("/api/db/_schema/todos").await;
    response.assert_status_not_found();
}
