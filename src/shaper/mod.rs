//! Record shaping shared by every backend adapter.
//!
//! Inbound: match client fields against declared metadata, inject
//! auto-managed values, run declarative validation, enforce record-level
//! access filters. Outbound: trim records to the requested projection while
//! always keeping identifier fields.

pub mod record_filter;
pub mod validation;

use chrono::Utc;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::models::{FieldType, Record, TableSchema};
use crate::options::{FieldProjection, RequestContext};
use validation::RuleOutcome;

pub use record_filter::enforce_record_filter;

/// Parse one inbound record into the fields that actually reach the backend.
///
/// When the table declares no field metadata (schemaless backends), client
/// fields pass through untouched apart from the record-level filter.
pub fn parse_inbound(
    record: &Record,
    schema: &TableSchema,
    ctx: &RequestContext,
    for_update: bool,
    old_record: Option<&Record>,
) -> ApiResult<Record> {
    let parsed = if schema.fields.is_empty() {
        record.clone()
    } else {
        let mut out = Record::new();
        for field in &schema.fields {
            match field.field_type {
                FieldType::TimestampOnCreate => {
                    if !for_update {
                        out.insert(field.name.clone(), Value::String(now_string()));
                    }
                    continue;
                }
                FieldType::TimestampOnUpdate => {
                    out.insert(field.name.clone(), Value::String(now_string()));
                    continue;
                }
                FieldType::UserIdOnCreate => {
                    if !for_update {
                        if let Some(user_id) = &ctx.user_id {
                            out.insert(field.name.clone(), user_id.clone());
                        }
                    }
                    continue;
                }
                FieldType::UserIdOnUpdate => {
                    if let Some(user_id) = &ctx.user_id {
                        out.insert(field.name.clone(), user_id.clone());
                    }
                    continue;
                }
                _ => {}
            }

            if field.auto_increment {
                // Never trust client-supplied values for generated keys.
                continue;
            }

            // Exact, case-sensitive key match.
            match record.get(&field.name) {
                Some(value) => {
                    if value.is_null() && !field.allow_null {
                        return Err(ApiError::BadRequest(format!(
                            "Field '{}' can not be NULL.",
                            field.name
                        )));
                    }
                    match validation::run_rules(field, value, for_update)? {
                        RuleOutcome::Pass => {
                            out.insert(field.name.clone(), value.clone());
                        }
                        RuleOutcome::DropField => {}
                    }
                }
                None => {
                    if !for_update && field.required {
                        match &field.default {
                            Some(default) => {
                                out.insert(field.name.clone(), default.clone());
                            }
                            None => {
                                return Err(ApiError::BadRequest(format!(
                                    "Required field '{}' can not be empty.",
                                    field.name
                                )))
                            }
                        }
                    }
                }
            }
        }
        out
    };

    if let Some(spec) = &ctx.record_filters {
        enforce_record_filter(spec, &parsed, if for_update { old_record } else { None })?;
    }

    Ok(parsed)
}

fn now_string() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Trim an outbound record to the requested projection. Identifier fields
/// are always present regardless of the projection.
pub fn shape_outbound(record: Record, projection: &FieldProjection, id_names: &[String]) -> Record {
    match projection {
        FieldProjection::All => record,
        FieldProjection::IdOnly => {
            let mut out = Record::new();
            for id in id_names {
                if let Some(value) = record.get(id) {
                    out.insert(id.clone(), value.clone());
                }
            }
            out
        }
        FieldProjection::Some(fields) => {
            let mut out = Record::new();
            for field in fields {
                if let Some(value) = record.get(field) {
                    out.insert(field.clone(), value.clone());
                }
            }
            for id in id_names {
                if !out.contains_key(id) {
                    if let Some(value) = record.get(id) {
                        out.insert(id.clone(), value.clone());
                    }
                }
            }
            out
        }
    }
}

pub fn shape_many(
    records: Vec<Record>,
    projection: &FieldProjection,
    id_names: &[String],
) -> Vec<Record> {
    records
        .into_iter()
        .map(|r| shape_outbound(r, projection, id_names))
        .collect()
}

/// Pull the identifier value(s) out of a record, erroring when any part of
/// the (possibly composite) key is missing.
pub fn extract_id(record: &Record, id_names: &[String]) -> ApiResult<Vec<(String, Value)>> {
    if id_names.is_empty() {
        return Err(ApiError::BadRequest(
            "No identifier fields are defined for this table.".to_string(),
        ));
    }
    let mut id = Vec::with_capacity(id_names.len());
    for name in id_names {
        match record.get(name) {
            Some(value) if !value.is_null() => id.push((name.clone(), value.clone())),
            _ => {
                return Err(ApiError::BadRequest(format!(
                    "Identifying field '{}' can not be empty for record.",
                    name
                )))
            }
        }
    }
    Ok(id)
}

/// Remove identifier fields from a merge payload; key fields are immutable
/// within a write and must not be sent as field-level changes.
pub fn strip_ids(record: &mut Record, id_names: &[String]) {
    for name in id_names {
        record.remove(name);
    }
}
