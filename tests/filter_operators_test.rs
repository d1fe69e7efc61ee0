mod common;

use serde_json::json;

use common::{create_users_table, opts_with_filter, record, setup_sql_backend};
use dbbridge::backend::sql::SqlBackend;
use dbbridge::backend::DbBackend;
use dbbridge::error::ApiError;
use dbbridge::options::RequestContext;
use dbbridge::parser::parse_order;

/// Fixture: amy 18 (no email), bob 22 (has email), cal 30 (no email).
async fn seed(backend: &SqlBackend) {
    let records = vec![
        record(&[("name", json!("amy")), ("age", json!(18))]),
        record(&[
            ("name", json!("bob")),
            ("age", json!(22)),
            ("email", json!("bob@example.com")),
        ]),
        record(&[("name", json!("cal")), ("age", json!(30))]),
    ];
    backend
        .create_records(
            "users",
            records,
            &Default::default(),
            &RequestContext::anonymous(),
        )
        .await
        .expect("seed users");
}

async fn names_for(backend: &SqlBackend, filter: &str) -> Vec<String> {
    let mut opts = opts_with_filter(filter, "name");
    opts.order = parse_order("name");
    let (records, _) = backend
        .retrieve_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap_or_else(|e| panic!("filter '{}' failed: {}", filter, e));
    records
        .iter()
        .filter_map(|r| r["name"].as_str().map(String::from))
        .collect()
}

#[tokio::test]
async fn test_equality_and_inequality() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed(&backend).await;

    assert_eq!(names_for(&backend, "age = 22").await, vec!["bob"]);
    assert_eq!(names_for(&backend, "age eq 22").await, vec!["bob"]);
    assert_eq!(names_for(&backend, "age != 22").await, vec!["amy", "cal"]);
    assert_eq!(names_for(&backend, "age <> 22").await, vec!["amy", "cal"]);
    assert_eq!(names_for(&backend, "age ne 22").await, vec!["amy", "cal"]);
}

#[tokio::test]
async fn test_ordering_operators() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed(&backend).await;

    assert_eq!(names_for(&backend, "age > 22").await, vec!["cal"]);
    assert_eq!(names_for(&backend, "age >= 22").await, vec!["bob", "cal"]);
    assert_eq!(names_for(&backend, "age < 22").await, vec!["amy"]);
    assert_eq!(names_for(&backend, "age lte 22").await, vec!["amy", "bob"]);
}

#[tokio::test]
async fn test_between_and_in() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed(&backend).await;

    assert_eq!(names_for(&backend, "age between 20 and 25").await, vec!["bob"]);
    assert_eq!(
        names_for(&backend, "name in ('amy', 'cal')").await,
        vec!["amy", "cal"]
    );
}

#[tokio::test]
async fn test_like_anchoring() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed(&backend).await;

    assert_eq!(names_for(&backend, "name like 'b%'").await, vec!["bob"]);
    assert_eq!(names_for(&backend, "name like '%l'").await, vec!["cal"]);
    assert_eq!(names_for(&backend, "name like '%a%'").await, vec!["amy", "cal"]);
}

#[tokio::test]
async fn test_contains_family() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed(&backend).await;

    assert_eq!(names_for(&backend, "name contains 'a'").await, vec!["amy", "cal"]);
    assert_eq!(names_for(&backend, "name not_contains 'a'").await, vec!["bob"]);
    assert_eq!(names_for(&backend, "name begins_with 'a'").await, vec!["amy"]);
    assert_eq!(names_for(&backend, "name ends_with 'l'").await, vec!["cal"]);
}

#[tokio::test]
async fn test_null_existence() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed(&backend).await;

    assert_eq!(names_for(&backend, "email = null").await, vec!["amy", "cal"]);
    assert_eq!(names_for(&backend, "email != null").await, vec!["bob"]);
}

#[tokio::test]
async fn test_logical_combinations() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed(&backend).await;

    assert_eq!(
        names_for(&backend, "age < 20 or age > 25").await,
        vec!["amy", "cal"]
    );
    assert_eq!(
        names_for(&backend, "age >= 18 and age <= 22").await,
        vec!["amy", "bob"]
    );
    assert_eq!(names_for(&backend, "not age = 22").await, vec!["amy", "cal"]);
    assert_eq!(
        names_for(&backend, "(name = 'amy' or name = 'bob') and age > 20").await,
        vec!["bob"]
    );
}

#[tokio::test]
async fn test_bound_parameters() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;
    seed(&backend).await;

    let mut opts = opts_with_filter("age >= :min", "name");
    opts.params
        .insert("min".to_string(), json!(21));
    opts.order = parse_order("name");
    let (records, _) = backend
        .retrieve_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_unsupported_operator_is_client_error() {
    let backend = setup_sql_backend().await;
    create_users_table(&backend).await;

    let opts = opts_with_filter("name regexp 'x'", "name");
    let err = backend
        .retrieve_records_by_filter("users", &opts, &RequestContext::anonymous())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}
