mod common;

use serde_json::{json, Value};

use common::{create_users_table, opts_with_fields, opts_with_filter, record, seed_users, setup_sql_backend};
use dbbridge::backend::DbBackend;
use dbbridge::error::ApiError;
use dbbridge::options::{RequestContext, RequestOptions};
use dbbridge::parser::{FilterCombiner, FilterTriple, ServerFilterSpec};

#[tokio::test]
async fn test_create_returns_identifiers_by_default() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;

    let created = backend
        .create_records(
            "users",
            vec![record(&[("name", json!("amy")), ("age", json!(18))])],
            &RequestOptions::default(),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();

    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["id"], json!(1));
    assert!(!created[0].contains_key("name"));
}

#[tokio::test]
async fn test_filter_round_trip_by_id() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let opts = opts_with_filter("id = 2", "*");
    let (records, _) = backend
        .retrieve_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["name"], json!("bob"));
}

#[tokio::test]
async fn test_age_filter_scenario() {
    // Fixture of three users aged [18, 22, 30]: age >= 21 returns exactly
    // the two older ones, and no count appears unless requested.
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let opts = opts_with_filter("age >= 21", "*");
    let (records, count) = backend
        .retrieve_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    let names: Vec<&str> = records.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["bob", "cal"]);
    assert!(count.is_none());
}

#[tokio::test]
async fn test_include_count() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let mut opts = opts_with_filter("age >= 21", "*");
    opts.include_count = true;
    let (_, count) = backend
        .retrieve_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(count, Some(2));
}

#[tokio::test]
async fn test_projection_always_includes_id() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let opts = opts_with_fields("name");
    let records = backend
        .retrieve_records_by_ids("users", vec![json!("1")], &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["name"], json!("amy"));
    assert_eq!(records[0]["id"], json!(1));
    assert!(!records[0].contains_key("age"));
}

#[tokio::test]
async fn test_retrieve_record_not_found() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;

    let err = backend
        .retrieve_record(
            "users",
            &json!("99"),
            &RequestOptions::default(),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn test_unknown_table_is_not_found() {
    let backend = setup_sql_backend().await;
    let err = backend
        .describe_table("missing", &RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn test_merge_updates_only_given_fields() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    backend
        .merge_records_by_ids(
            "users",
            record(&[("status", json!("active"))]),
            vec![json!("1")],
            &RequestOptions::default(),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();

    let rec = backend
        .retrieve_record(
            "users",
            &json!("1"),
            &opts_with_fields("*"),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(rec["status"], json!("active"));
    // Unspecified fields are untouched.
    assert_eq!(rec["name"], json!("amy"));
    assert_eq!(rec["age"], json!(18));
}

#[tokio::test]
async fn test_update_replaces_unspecified_with_null() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    backend
        .update_records_by_ids(
            "users",
            record(&[("name", json!("amy2"))]),
            vec![json!("1")],
            &RequestOptions::default(),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();

    let rec = backend
        .retrieve_record(
            "users",
            &json!("1"),
            &opts_with_fields("*"),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(rec["name"], json!("amy2"));
    assert_eq!(rec["age"], Value::Null);
}

#[tokio::test]
async fn test_update_by_filter() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let mut opts = RequestOptions::default();
    opts.filter = Some("age >= 21".to_string());
    let updated = backend
        .merge_records_by_filter(
            "users",
            record(&[("status", json!("adult"))]),
            &opts,
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(updated.len(), 2);

    let (records, _) = backend
        .retrieve_records_by_filter(
            "users",
            &opts_with_filter("status = 'adult'", "name"),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_delete_returns_old_records() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let deleted = backend
        .delete_records_by_ids(
            "users",
            vec![json!("2")],
            &opts_with_fields("name"),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(deleted[0]["name"], json!("bob"));

    let (remaining, _) = backend
        .retrieve_records_by_filter(
            "users",
            &opts_with_fields("*"),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(remaining.len(), 2);
}

#[tokio::test]
async fn test_delete_by_filter_and_truncate() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let mut opts = RequestOptions::default();
    opts.filter = Some("age < 21".to_string());
    let deleted = backend
        .delete_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(deleted.len(), 1);

    backend.truncate_table("users").await.unwrap();
    let (remaining, _) = backend
        .retrieve_records_by_filter(
            "users",
            &opts_with_fields("*"),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn test_limit_and_offset() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let mut opts = opts_with_fields("name");
    opts.limit = Some(2);
    let (page, _) = backend
        .retrieve_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(page.len(), 2);

    opts.offset = 2;
    let (rest, _) = backend
        .retrieve_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
}

#[tokio::test]
async fn test_order_by() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let mut opts = opts_with_fields("name");
    opts.order = dbbridge::parser::parse_order("age desc");
    let (records, _) = backend
        .retrieve_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    let names: Vec<&str> = records.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["cal", "bob", "amy"]);
}

#[tokio::test]
async fn test_server_filters_narrow_client_queries() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed_users(&backend).await;

    let mut ctx = RequestContext::anonymous();
    ctx.server_filters = Some(ServerFilterSpec::new(
        vec![FilterTriple::new("owner_id", "=", json!(1))],
        FilterCombiner::And,
    ));

    // The client filter alone matches two users, but the server filter pins
    // the query to owner 1, leaving only bob.
    let opts = opts_with_filter("age >= 21", "name");
    let (records, _) = backend
        .retrieve_records_by_filter("users", &opts, &ctx)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["name"], json!("bob"));
}

#[tokio::test]
async fn test_record_filter_forbids_write() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;

    let mut ctx = RequestContext::anonymous();
    ctx.record_filters = Some(ServerFilterSpec::new(
        vec![FilterTriple::new("owner_id", "=", json!(1))],
        FilterCombiner::And,
    ));

    let err = backend
        .create_records(
            "users",
            vec![record(&[("name", json!("eve")), ("owner_id", json!(9))])],
            &RequestOptions::default(),
            &ctx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Forbidden(_)));

    // A record satisfying the guard goes through.
    backend
        .create_records(
            "users",
            vec![record(&[("name", json!("amy")), ("owner_id", json!(1))])],
            &RequestOptions::default(),
            &ctx,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_string_key_generated_when_missing() {
    let backend = setup_sql_backend().await;
    let mut schema = dbbridge::models::TableSchema::new("sessions");
    schema.id_fields = vec![dbbridge::models::IdField::new(
        "token",
        dbbridge::models::FieldType::String,
    )];
    schema.fields = vec![
        dbbridge::models::FieldInfo::new("token", dbbridge::models::FieldType::String),
        dbbridge::models::FieldInfo::new("user", dbbridge::models::FieldType::String),
    ];
    backend.create_table(&schema).await.unwrap();

    let created = backend
        .create_records(
            "sessions",
            vec![record(&[("user", json!("amy"))])],
            &RequestOptions::default(),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();
    let token = created[0]["token"].as_str().unwrap();
    assert!(!token.is_empty());

    // A client-supplied key is kept as-is.
    let created = backend
        .create_records(
            "sessions",
            vec![record(&[("token", json!("fixed")), ("user", json!("bob"))])],
            &RequestOptions::default(),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(created[0]["token"], json!("fixed"));
}

#[tokio::test]
async fn test_schema_lists_and_describes() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;

    let tables = backend.list_tables().await.unwrap();
    assert_eq!(tables, vec!["users".to_string()]);

    let schema = backend
        .describe_table("users", &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(schema.id_names(), vec!["id".to_string()]);
    let name_field = schema.field("name").unwrap();
    assert!(!name_field.allow_null);
    assert!(name_field.required);
}
