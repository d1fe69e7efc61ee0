//! Relationship discovery and handling for the SQL adapter.
//!
//! Relations are derived from foreign keys: a key on this table is a
//! `belongs_to`, a key on another table pointing here is a `has_many`, and a
//! two-key table pointing here and at a third table is a `many_many`
//! junction.

use serde_json::Value;
use sqlx::{AnyConnection, AnyPool, Row};

use super::filter_impl::{quote_ident, SqlDialect};
use super::schema;
use super::{bind_value, row_to_record};
use crate::error::{ApiError, ApiResult};
use crate::models::{Record, RelationInfo, RelationType, TableSchema};
use crate::options::{RelatedRequest, RelatedSpec};

pub async fn discover(
    pool: &AnyPool,
    dialect: SqlDialect,
    table: &str,
) -> ApiResult<Vec<RelationInfo>> {
    let mut relations = Vec::new();

    for fk in schema::foreign_keys(pool, dialect, table).await? {
        relations.push(RelationInfo {
            name: format!("{}_by_{}", fk.ref_table, fk.column),
            rel_type: RelationType::BelongsTo,
            ref_table: fk.ref_table,
            ref_field: fk.ref_column,
            field: fk.column,
            junction_table: None,
            junction_field: None,
            junction_ref_field: None,
        });
    }

    for other in schema::table_names(pool, dialect).await? {
        if other == table {
            continue;
        }
        let fks = schema::foreign_keys(pool, dialect, &other).await?;
        let pointing: Vec<_> = fks.iter().filter(|fk| fk.ref_table == table).collect();
        if pointing.is_empty() {
            continue;
        }

        for fk in &pointing {
            relations.push(RelationInfo {
                name: format!("{}_by_{}", other, fk.column),
                rel_type: RelationType::HasMany,
                ref_table: other.clone(),
                ref_field: fk.column.clone(),
                field: fk.ref_column.clone(),
                junction_table: None,
                junction_field: None,
                junction_ref_field: None,
            });
        }

        // A table holding exactly one key to us and one key elsewhere acts
        // as a junction for a many-to-many relation.
        if fks.len() == 2 && pointing.len() == 1 {
            let ours = pointing[0];
            if let Some(theirs) = fks.iter().find(|fk| fk.ref_table != table) {
                relations.push(RelationInfo {
                    name: format!("{}_by_{}", theirs.ref_table, other),
                    rel_type: RelationType::ManyMany,
                    ref_table: theirs.ref_table.clone(),
                    ref_field: theirs.ref_column.clone(),
                    field: ours.ref_column.clone(),
                    junction_table: Some(other.clone()),
                    junction_field: Some(ours.column.clone()),
                    junction_ref_field: Some(theirs.column.clone()),
                });
            }
        }
    }

    Ok(relations)
}

fn requested<'a>(
    relations: &'a [RelationInfo],
    related: &'a RelatedRequest,
) -> Vec<(&'a RelationInfo, Option<&'a RelatedSpec>)> {
    match related {
        RelatedRequest::None => Vec::new(),
        RelatedRequest::All => relations.iter().map(|r| (r, None)).collect(),
        RelatedRequest::Some(specs) => specs
            .iter()
            .filter_map(|spec| relations.iter().find(|r| r.name == spec.name).map(|r| (r, Some(spec))))
            .collect(),
    }
}

/// Eager-load requested relations into each parent record, keyed by the
/// relation name.
pub async fn attach_related(
    pool: &AnyPool,
    dialect: SqlDialect,
    table_schema: &TableSchema,
    records: &mut [Record],
    related: &RelatedRequest,
) -> ApiResult<()> {
    let wanted = requested(&table_schema.relations, related);
    if wanted.is_empty() {
        return Ok(());
    }

    for record in records.iter_mut() {
        for (relation, spec) in &wanted {
            let value = fetch_relation(pool, dialect, relation, *spec, record).await?;
            record.insert(relation.name.clone(), value);
        }
    }
    Ok(())
}

async fn fetch_relation(
    pool: &AnyPool,
    dialect: SqlDialect,
    relation: &RelationInfo,
    spec: Option<&RelatedSpec>,
    record: &Record,
) -> ApiResult<Value> {
    let order_sql = match spec.and_then(|s| s.order.as_deref()) {
        Some(order) => {
            let specs = crate::parser::parse_order(order);
            if specs.is_empty() {
                String::new()
            } else {
                let parts = specs
                    .iter()
                    .map(|s| {
                        quote_ident(&s.field).map(|ident| {
                            let dir = match s.order {
                                crate::parser::SortOrder::Ascending => "ASC",
                                crate::parser::SortOrder::Descending => "DESC",
                            };
                            format!("{} {}", ident, dir)
                        })
                    })
                    .collect::<ApiResult<Vec<_>>>()?;
                format!(" ORDER BY {}", parts.join(", "))
            }
        }
        None => String::new(),
    };

    match relation.rel_type {
        RelationType::BelongsTo => {
            let Some(fk_value) = record.get(&relation.field).filter(|v| !v.is_null()) else {
                return Ok(Value::Null);
            };
            let sql = format!(
                "SELECT * FROM {} WHERE {} = {}",
                quote_ident(&relation.ref_table)?,
                quote_ident(&relation.ref_field)?,
                dialect.placeholder(1)
            );
            let query = bind_value(sqlx::query(&sql), fk_value)?;
            let row = query.fetch_optional(pool).await?;
            Ok(row.map(|r| Value::Object(row_to_record(&r))).unwrap_or(Value::Null))
        }
        RelationType::HasMany => {
            let Some(local) = record.get(&relation.field).filter(|v| !v.is_null()) else {
                return Ok(Value::Array(Vec::new()));
            };
            let sql = format!(
                "SELECT * FROM {} WHERE {} = {}{}",
                quote_ident(&relation.ref_table)?,
                quote_ident(&relation.ref_field)?,
                dialect.placeholder(1),
                order_sql
            );
            let query = bind_value(sqlx::query(&sql), local)?;
            let rows = query.fetch_all(pool).await?;
            Ok(Value::Array(
                rows.iter().map(|r| Value::Object(row_to_record(r))).collect(),
            ))
        }
        RelationType::ManyMany => {
            let (Some(junction), Some(junction_field), Some(junction_ref_field)) = (
                relation.junction_table.as_deref(),
                relation.junction_field.as_deref(),
                relation.junction_ref_field.as_deref(),
            ) else {
                return Err(ApiError::Internal(format!(
                    "Relation '{}' is missing junction metadata.",
                    relation.name
                )));
            };
            let Some(local) = record.get(&relation.field).filter(|v| !v.is_null()) else {
                return Ok(Value::Array(Vec::new()));
            };
            let sql = format!(
                "SELECT r.* FROM {} r JOIN {} j ON r.{} = j.{} WHERE j.{} = {}{}",
                quote_ident(&relation.ref_table)?,
                quote_ident(junction)?,
                quote_ident(&relation.ref_field)?,
                quote_ident(junction_ref_field)?,
                quote_ident(junction_field)?,
                dialect.placeholder(1),
                order_sql
            );
            let query = bind_value(sqlx::query(&sql), local)?;
            let rows = query.fetch_all(pool).await?;
            Ok(Value::Array(
                rows.iter().map(|r| Value::Object(row_to_record(r))).collect(),
            ))
        }
    }
}

/// Apply relation payloads carried on an updated record: associate and
/// disassociate children, maintain junction rows. Runs on the batch's write
/// connection so the side-writes stay inside any enclosing transaction.
pub async fn apply_related_writes(
    conn: &mut AnyConnection,
    dialect: SqlDialect,
    table_schema: &TableSchema,
    record: &Record,
    raw_payload: &Record,
) -> ApiResult<()> {
    for relation in &table_schema.relations {
        let Some(payload) = raw_payload.get(&relation.name) else {
            continue;
        };
        match relation.rel_type {
            RelationType::BelongsTo => {
                // Association happens through the local fk column, which the
                // shaper already carried into the main write; nothing to do.
            }
            RelationType::HasMany => {
                let Some(parent_key) = record.get(&relation.field).filter(|v| !v.is_null()) else {
                    continue;
                };
                let Value::Array(children) = payload else {
                    return Err(ApiError::BadRequest(format!(
                        "Relation '{}' expects an array of child records.",
                        relation.name
                    )));
                };
                assign_children(conn, dialect, relation, parent_key, children).await?;
            }
            RelationType::ManyMany => {
                let Some(parent_key) = record.get(&relation.field).filter(|v| !v.is_null()) else {
                    continue;
                };
                let Value::Array(entries) = payload else {
                    return Err(ApiError::BadRequest(format!(
                        "Relation '{}' expects an array of related records or ids.",
                        relation.name
                    )));
                };
                sync_junction(conn, dialect, relation, parent_key, entries).await?;
            }
        }
    }
    Ok(())
}

/// Single-column primary key of a table, introspected on the write
/// connection.
async fn primary_key_column(
    conn: &mut AnyConnection,
    dialect: SqlDialect,
    table: &str,
) -> ApiResult<String> {
    let columns: Vec<String> = match dialect {
        SqlDialect::Sqlite => {
            let sql = format!("PRAGMA table_info({})", quote_ident(table)?);
            let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
            rows.iter()
                .filter(|row| row.get::<i64, _>("pk") > 0)
                .map(|row| row.get::<String, _>("name"))
                .collect()
        }
        SqlDialect::Postgres => {
            let rows = sqlx::query(
                "SELECT kcu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 WHERE tc.table_schema = 'public' AND tc.table_name = $1 \
                   AND tc.constraint_type = 'PRIMARY KEY'",
            )
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
            rows.iter()
                .map(|row| row.get::<String, _>("column_name"))
                .collect()
        }
    };
    match columns.as_slice() {
        [one] => Ok(one.clone()),
        _ => Err(ApiError::BadRequest(format!(
            "Relation writes require a single-field key on '{}'.",
            table
        ))),
    }
}

async fn assign_children(
    conn: &mut AnyConnection,
    dialect: SqlDialect,
    relation: &RelationInfo,
    parent_key: &Value,
    children: &[Value],
) -> ApiResult<()> {
    let child_id = primary_key_column(conn, dialect, &relation.ref_table).await?;
    let child_id = &child_id;

    let mut keep: Vec<Value> = Vec::with_capacity(children.len());
    for child in children {
        let id = match child {
            Value::Object(map) => map.get(child_id).cloned().ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Child records of '{}' must carry '{}'.",
                    relation.name, child_id
                ))
            })?,
            scalar => scalar.clone(),
        };
        keep.push(id);
    }

    // Point the listed children at the parent.
    for id in &keep {
        let sql = format!(
            "UPDATE {} SET {} = {} WHERE {} = {}",
            quote_ident(&relation.ref_table)?,
            quote_ident(&relation.ref_field)?,
            dialect.placeholder(1),
            quote_ident(child_id)?,
            dialect.placeholder(2),
        );
        let query = bind_value(bind_value(sqlx::query(&sql), parent_key)?, id)?;
        query.execute(&mut *conn).await?;
    }

    // Disassociate children no longer listed.
    let mut sql = format!(
        "UPDATE {} SET {} = NULL WHERE {} = {}",
        quote_ident(&relation.ref_table)?,
        quote_ident(&relation.ref_field)?,
        quote_ident(&relation.ref_field)?,
        dialect.placeholder(1),
    );
    if !keep.is_empty() {
        let placeholders = (0..keep.len())
            .map(|i| dialect.placeholder(i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(
            " AND {} NOT IN ({})",
            quote_ident(child_id)?,
            placeholders
        ));
    }
    let mut query = bind_value(sqlx::query(&sql), parent_key)?;
    for id in &keep {
        query = bind_value(query, id)?;
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

async fn sync_junction(
    conn: &mut AnyConnection,
    dialect: SqlDialect,
    relation: &RelationInfo,
    parent_key: &Value,
    entries: &[Value],
) -> ApiResult<()> {
    let (Some(junction), Some(junction_field), Some(junction_ref_field)) = (
        relation.junction_table.as_deref(),
        relation.junction_field.as_deref(),
        relation.junction_ref_field.as_deref(),
    ) else {
        return Err(ApiError::Internal(format!(
            "Relation '{}' is missing junction metadata.",
            relation.name
        )));
    };

    let mut wanted: Vec<Value> = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = match entry {
            Value::Object(map) => map.get(&relation.ref_field).cloned().ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Entries of '{}' must carry '{}'.",
                    relation.name, relation.ref_field
                ))
            })?,
            scalar => scalar.clone(),
        };
        wanted.push(id);
    }

    // Current associations.
    let sql = format!(
        "SELECT {} AS rid FROM {} WHERE {} = {}",
        quote_ident(junction_ref_field)?,
        quote_ident(junction)?,
        quote_ident(junction_field)?,
        dialect.placeholder(1),
    );
    let rows = bind_value(sqlx::query(&sql), parent_key)?
        .fetch_all(&mut *conn)
        .await?;
    let current: Vec<Value> = rows
        .iter()
        .map(|row| {
            let rec = row_to_record(row);
            rec.get("rid").cloned().unwrap_or(Value::Null)
        })
        .collect();

    let json_eq = |a: &Value, b: &Value| -> bool {
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            x == y
        } else {
            a == b
        }
    };

    // Insert missing pairs.
    for id in &wanted {
        if current.iter().any(|c| json_eq(c, id)) {
            continue;
        }
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {})",
            quote_ident(junction)?,
            quote_ident(junction_field)?,
            quote_ident(junction_ref_field)?,
            dialect.placeholder(1),
            dialect.placeholder(2),
        );
        let query = bind_value(bind_value(sqlx::query(&sql), parent_key)?, id)?;
        query.execute(&mut *conn).await?;
    }

    // Remove pairs no longer wanted.
    for id in &current {
        if wanted.iter().any(|w| json_eq(w, id)) {
            continue;
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = {} AND {} = {}",
            quote_ident(junction)?,
            quote_ident(junction_field)?,
            dialect.placeholder(1),
            quote_ident(junction_ref_field)?,
            dialect.placeholder(2),
        );
        let query = bind_value(bind_value(sqlx::query(&sql), parent_key)?, id)?;
        query.execute(&mut *conn).await?;
    }

    Ok(())
}
