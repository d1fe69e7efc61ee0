//! Live schema introspection and DDL for the SQL adapter.

use sqlx::{AnyPool, Row};

use super::filter_impl::{quote_ident, SqlDialect};
use crate::error::{ApiError, ApiResult};
use crate::models::{FieldInfo, FieldType, IdField, TableSchema};

/// One discovered foreign-key edge.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}

pub async fn table_names(pool: &AnyPool, dialect: SqlDialect) -> ApiResult<Vec<String>> {
    let sql = match dialect {
        SqlDialect::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        SqlDialect::Postgres => {
            "SELECT table_name AS name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' ORDER BY table_name"
        }
    };
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect())
}

pub async fn table_exists(pool: &AnyPool, dialect: SqlDialect, table: &str) -> ApiResult<bool> {
    Ok(table_names(pool, dialect).await?.iter().any(|t| t == table))
}

/// Introspect one table: columns, primary key, foreign keys.
pub async fn describe(
    pool: &AnyPool,
    dialect: SqlDialect,
    table: &str,
) -> ApiResult<TableSchema> {
    if !table_exists(pool, dialect, table).await? {
        return Err(ApiError::NotFound(format!("Table '{}' not found.", table)));
    }

    let mut schema = TableSchema::new(table);
    match dialect {
        SqlDialect::Sqlite => describe_sqlite(pool, table, &mut schema).await?,
        SqlDialect::Postgres => describe_postgres(pool, table, &mut schema).await?,
    }
    Ok(schema)
}

async fn describe_sqlite(pool: &AnyPool, table: &str, schema: &mut TableSchema) -> ApiResult<()> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table)?);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;

    let mut pk_columns: Vec<(i64, String, String)> = Vec::new();
    for row in rows {
        let name: String = row.get("name");
        let declared: String = row.get("type");
        let not_null: i64 = row.get("notnull");
        let default: Option<String> = row.get("dflt_value");
        let pk: i64 = row.get("pk");

        let mut field = FieldInfo::new(&name, field_type_from_sql(&declared));
        field.allow_null = not_null == 0 && pk == 0;
        field.required = not_null != 0 && pk == 0 && default.is_none();
        if pk > 0 {
            pk_columns.push((pk, name, declared));
        } else {
            schema.fields.push(field);
        }
    }

    pk_columns.sort_by_key(|(order, _, _)| *order);
    // A lone INTEGER primary key is a rowid alias and auto-increments.
    let rowid_alias = pk_columns.len() == 1 && pk_columns[0].2.to_uppercase().contains("INT");
    for (_, name, declared) in &pk_columns {
        let field_type = field_type_from_sql(declared);
        schema.id_fields.push(IdField::new(name, field_type));
        let mut field = FieldInfo::new(name, field_type);
        field.allow_null = false;
        field.auto_increment = rowid_alias;
        schema.fields.insert(0, field);
    }
    Ok(())
}

async fn describe_postgres(pool: &AnyPool, table: &str, schema: &mut TableSchema) -> ApiResult<()> {
    let rows = sqlx::query(
        "SELECT column_name, data_type, is_nullable, column_default \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = $1 \
         ORDER BY ordinal_position",
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    let pk_rows = sqlx::query(
        "SELECT kcu.column_name \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name \
          AND tc.table_schema = kcu.table_schema \
         WHERE tc.table_schema = 'public' AND tc.table_name = $1 \
           AND tc.constraint_type = 'PRIMARY KEY' \
         ORDER BY kcu.ordinal_position",
    )
    .bind(table)
    .fetch_all(pool)
    .await?;
    let pk_names: Vec<String> = pk_rows
        .iter()
        .map(|row| row.get::<String, _>("column_name"))
        .collect();

    for row in rows {
        let name: String = row.get("column_name");
        let declared: String = row.get("data_type");
        let nullable: String = row.get("is_nullable");
        let default: Option<String> = row.get("column_default");

        let field_type = field_type_from_sql(&declared);
        let mut field = FieldInfo::new(&name, field_type);
        field.allow_null = nullable == "YES";
        field.auto_increment = default
            .as_deref()
            .is_some_and(|d| d.starts_with("nextval"));
        field.required = !field.allow_null && !field.auto_increment && default.is_none();
        if pk_names.contains(&name) {
            field.allow_null = false;
            schema.id_fields.push(IdField::new(&name, field_type));
        }
        schema.fields.push(field);
    }
    Ok(())
}

pub async fn foreign_keys(
    pool: &AnyPool,
    dialect: SqlDialect,
    table: &str,
) -> ApiResult<Vec<ForeignKey>> {
    match dialect {
        SqlDialect::Sqlite => {
            let sql = format!("PRAGMA foreign_key_list({})", quote_ident(table)?);
            let rows = sqlx::query(&sql).fetch_all(pool).await?;
            Ok(rows
                .iter()
                .map(|row| ForeignKey {
                    table: table.to_string(),
                    column: row.get("from"),
                    ref_table: row.get("table"),
                    ref_column: row.get("to"),
                })
                .collect())
        }
        SqlDialect::Postgres => {
            let rows = sqlx::query(
                "SELECT kcu.column_name, ccu.table_name AS ref_table, \
                        ccu.column_name AS ref_column \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 JOIN information_schema.constraint_column_usage ccu \
                   ON tc.constraint_name = ccu.constraint_name \
                  AND tc.table_schema = ccu.table_schema \
                 WHERE tc.table_schema = 'public' AND tc.table_name = $1 \
                   AND tc.constraint_type = 'FOREIGN KEY'",
            )
            .bind(table)
            .fetch_all(pool)
            .await?;
            Ok(rows
                .iter()
                .map(|row| ForeignKey {
                    table: table.to_string(),
                    column: row.get("column_name"),
                    ref_table: row.get("ref_table"),
                    ref_column: row.get("ref_column"),
                })
                .collect())
        }
    }
}

pub async fn create_table(
    pool: &AnyPool,
    dialect: SqlDialect,
    schema: &TableSchema,
) -> ApiResult<()> {
    if schema.id_fields.is_empty() && schema.fields.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "Table '{}' defines no fields.",
            schema.name
        )));
    }

    let mut columns: Vec<String> = Vec::new();
    let single_auto_id = schema.id_fields.len() == 1
        && schema
            .field(&schema.id_fields[0].name)
            .map_or(true, |f| f.auto_increment || f.field_type == FieldType::Id);

    for id in &schema.id_fields {
        let ident = quote_ident(&id.name)?;
        if single_auto_id {
            let column = match dialect {
                SqlDialect::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", ident),
                SqlDialect::Postgres => format!("{} BIGSERIAL PRIMARY KEY", ident),
            };
            columns.push(column);
        } else {
            columns.push(format!(
                "{} {} NOT NULL",
                ident,
                sql_type(dialect, id.field_type, None)
            ));
        }
    }

    for field in &schema.fields {
        if schema.id_fields.iter().any(|id| id.name == field.name) {
            continue;
        }
        let mut column = format!(
            "{} {}",
            quote_ident(&field.name)?,
            sql_type(dialect, field.field_type, field.size)
        );
        if !field.allow_null {
            column.push_str(" NOT NULL");
        }
        if let Some(default) = &field.default {
            column.push_str(&format!(" DEFAULT {}", sql_literal(default)?));
        }
        columns.push(column);
    }

    if !single_auto_id && !schema.id_fields.is_empty() {
        let keys = schema
            .id_fields
            .iter()
            .map(|id| quote_ident(&id.name))
            .collect::<ApiResult<Vec<_>>>()?
            .join(", ");
        columns.push(format!("PRIMARY KEY ({})", keys));
    }

    let sql = format!(
        "CREATE TABLE {} ({})",
        quote_ident(&schema.name)?,
        columns.join(", ")
    );
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// Additive table update: new declared fields become new columns. Changing
/// or dropping existing columns is not supported through this surface.
pub async fn update_table(
    pool: &AnyPool,
    dialect: SqlDialect,
    schema: &TableSchema,
    existing: &TableSchema,
) -> ApiResult<()> {
    for field in &schema.fields {
        if existing.field(&field.name).is_some() {
            continue;
        }
        let mut column = format!(
            "{} {}",
            quote_ident(&field.name)?,
            sql_type(dialect, field.field_type, field.size)
        );
        if let Some(default) = &field.default {
            column.push_str(&format!(" DEFAULT {}", sql_literal(default)?));
        }
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(&schema.name)?,
            column
        );
        sqlx::query(&sql).execute(pool).await?;
    }
    Ok(())
}

pub async fn drop_table(pool: &AnyPool, table: &str) -> ApiResult<()> {
    let sql = format!("DROP TABLE {}", quote_ident(table)?);
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

pub async fn truncate(pool: &AnyPool, dialect: SqlDialect, table: &str) -> ApiResult<()> {
    let sql = match dialect {
        SqlDialect::Sqlite => format!("DELETE FROM {}", quote_ident(table)?),
        SqlDialect::Postgres => format!("TRUNCATE TABLE {}", quote_ident(table)?),
    };
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

fn sql_type(dialect: SqlDialect, field_type: FieldType, size: Option<u32>) -> String {
    match field_type {
        FieldType::Id | FieldType::Integer | FieldType::Reference => "INTEGER".to_string(),
        FieldType::UserId | FieldType::UserIdOnCreate | FieldType::UserIdOnUpdate => {
            "INTEGER".to_string()
        }
        FieldType::Float => "DOUBLE PRECISION".to_string(),
        FieldType::Boolean => "BOOLEAN".to_string(),
        FieldType::Datetime
        | FieldType::TimestampOnCreate
        | FieldType::TimestampOnUpdate => "TIMESTAMP".to_string(),
        FieldType::Text => "TEXT".to_string(),
        FieldType::Binary => match dialect {
            SqlDialect::Sqlite => "BLOB".to_string(),
            SqlDialect::Postgres => "BYTEA".to_string(),
        },
        FieldType::String => format!("VARCHAR({})", size.unwrap_or(255)),
    }
}

pub fn field_type_from_sql(declared: &str) -> FieldType {
    let upper = declared.to_uppercase();
    if upper.contains("INT") {
        FieldType::Integer
    } else if upper.contains("BOOL") {
        FieldType::Boolean
    } else if upper.contains("REAL")
        || upper.contains("FLOA")
        || upper.contains("DOUB")
        || upper.contains("NUMERIC")
        || upper.contains("DECIMAL")
    {
        FieldType::Float
    } else if upper.contains("TIMESTAMP") || upper.contains("DATE") || upper.contains("TIME") {
        FieldType::Datetime
    } else if upper.contains("BLOB") || upper.contains("BYTEA") {
        FieldType::Binary
    } else if upper == "TEXT" {
        FieldType::Text
    } else {
        FieldType::String
    }
}

fn sql_literal(value: &serde_json::Value) -> ApiResult<String> {
    Ok(match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unsupported default value {}.",
                other
            )))
        }
    })
}
