mod common;

use serde_json::{json, Value};

use common::{record, setup_sql_backend};
use dbbridge::backend::sql::SqlBackend;
use dbbridge::backend::DbBackend;
use dbbridge::models::RelationType;
use dbbridge::options::{
    FieldProjection, RelatedRequest, RelatedSpec, RequestContext, RequestOptions,
};

/// Foreign keys drive relation discovery, so the fixture tables are created
/// through the raw query escape hatch rather than the schema surface.
async fn setup_fixture(backend: &SqlBackend) {
    for ddl in [
        "CREATE TABLE owners (id INTEGER PRIMARY KEY AUTOINCREMENT, name VARCHAR(64))",
        "CREATE TABLE pets (id INTEGER PRIMARY KEY AUTOINCREMENT, name VARCHAR(64), \
         owner_id INTEGER REFERENCES owners(id))",
        "CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, label VARCHAR(32))",
        "CREATE TABLE pet_tags (pet_id INTEGER NOT NULL REFERENCES pets(id), \
         tag_id INTEGER NOT NULL REFERENCES tags(id), PRIMARY KEY (pet_id, tag_id))",
    ] {
        backend.raw_query(ddl, &[]).await.expect("fixture ddl");
    }

    let ctx = RequestContext::anonymous();
    let opts = RequestOptions::default();
    backend
        .create_records(
            "owners",
            vec![record(&[("name", json!("ann"))]), record(&[("name", json!("ben"))])],
            &opts,
            &ctx,
        )
        .await
        .unwrap();
    backend
        .create_records(
            "pets",
            vec![
                record(&[("name", json!("rex")), ("owner_id", json!(1))]),
                record(&[("name", json!("iggy")), ("owner_id", json!(1))]),
                record(&[("name", json!("moo")), ("owner_id", json!(2))]),
            ],
            &opts,
            &ctx,
        )
        .await
        .unwrap();
    backend
        .create_records(
            "tags",
            vec![
                record(&[("label", json!("small"))]),
                record(&[("label", json!("loud"))]),
            ],
            &opts,
            &ctx,
        )
        .await
        .unwrap();
}

fn related(name: &str) -> RelatedRequest {
    RelatedRequest::Some(vec![RelatedSpec {
        name: name.to_string(),
        fields: FieldProjection::All,
        order: None,
    }])
}

#[tokio::test]
async fn test_relations_discovered_from_foreign_keys() {
    let backend = setup_sql_backend().await;
    setup_fixture(&backend).await;

    let pets = backend
        .describe_table("pets", &RequestOptions::default())
        .await
        .unwrap();
    let belongs = pets.relation("owners_by_owner_id").unwrap();
    assert_eq!(belongs.rel_type, RelationType::BelongsTo);
    assert_eq!(belongs.ref_table, "owners");
    let many = pets.relation("tags_by_pet_tags").unwrap();
    assert_eq!(many.rel_type, RelationType::ManyMany);
    assert_eq!(many.junction_table.as_deref(), Some("pet_tags"));

    let owners = backend
        .describe_table("owners", &RequestOptions::default())
        .await
        .unwrap();
    let has_many = owners.relation("pets_by_owner_id").unwrap();
    assert_eq!(has_many.rel_type, RelationType::HasMany);
}

#[tokio::test]
async fn test_eager_load_belongs_to() {
    let backend = setup_sql_backend().await;
    setup_fixture(&backend).await;

    let mut opts = RequestOptions::default();
    opts.fields = FieldProjection::All;
    opts.related = related("owners_by_owner_id");
    let records = backend
        .retrieve_records_by_ids("pets", vec![json!("1")], &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    assert_eq!(records[0]["owners_by_owner_id"]["name"], json!("ann"));
}

#[tokio::test]
async fn test_eager_load_has_many() {
    let backend = setup_sql_backend().await;
    setup_fixture(&backend).await;

    let mut opts = RequestOptions::default();
    opts.fields = FieldProjection::All;
    opts.related = related("pets_by_owner_id");
    let records = backend
        .retrieve_records_by_ids("owners", vec![json!("1")], &opts, &RequestContext::anonymous())
        .await
        .unwrap();
    let pets = records[0]["pets_by_owner_id"].as_array().unwrap();
    assert_eq!(pets.len(), 2);
}

#[tokio::test]
async fn test_has_many_reassignment_on_update() {
    let backend = setup_sql_backend().await;
    setup_fixture(&backend).await;

    // Ann keeps only "moo"; her former pets are disassociated.
    backend
        .merge_records_by_ids(
            "owners",
            record(&[("pets_by_owner_id", json!([3]))]),
            vec![json!("1")],
            &RequestOptions::default(),
            &RequestContext::anonymous(),
        )
        .await
        .unwrap();

    let rows = backend
        .raw_query("SELECT id, owner_id FROM pets ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(rows[0]["owner_id"], Value::Null);
    assert_eq!(rows[1]["owner_id"], Value::Null);
    assert_eq!(rows[2]["owner_id"], json!(1));
}

#[tokio::test]
async fn test_many_many_junction_sync() {
    let backend = setup_sql_backend().await;
    setup_fixture(&backend).await;

    let ctx = RequestContext::anonymous();
    backend
        .merge_records_by_ids(
            "pets",
            record(&[("tags_by_pet_tags", json!([1, 2]))]),
            vec![json!("1")],
            &RequestOptions::default(),
            &ctx,
        )
        .await
        .unwrap();

    let mut opts = RequestOptions::default();
    opts.fields = FieldProjection::All;
    opts.related = related("tags_by_pet_tags");
    let records = backend
        .retrieve_records_by_ids("pets", vec![json!("1")], &opts, &ctx)
        .await
        .unwrap();
    assert_eq!(records[0]["tags_by_pet_tags"].as_array().unwrap().len(), 2);

    // Dropping a tag from the list removes its junction row.
    backend
        .merge_records_by_ids(
            "pets",
            record(&[("tags_by_pet_tags", json!([2]))]),
            vec![json!("1")],
            &RequestOptions::default(),
            &ctx,
        )
        .await
        .unwrap();
    let records = backend
        .retrieve_records_by_ids("pets", vec![json!("1")], &opts, &ctx)
        .await
        .unwrap();
    let tags = records[0]["tags_by_pet_tags"].as_array().unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0]["label"], json!("loud"));
}
