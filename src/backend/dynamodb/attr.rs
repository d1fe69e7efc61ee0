//! Conversion between JSON records and DynamoDB typed attribute maps.

use std::collections::HashMap;

use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use base64::Engine;
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::models::{FieldType, Record};

pub fn json_to_attr(value: &Value) -> ApiResult<AttributeValue> {
    Ok(match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(
            items
                .iter()
                .map(json_to_attr)
                .collect::<ApiResult<Vec<_>>>()?,
        ),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), json_to_attr(v)?)))
                .collect::<ApiResult<HashMap<_, _>>>()?,
        ),
    })
}

pub fn attr_to_json(attr: &AttributeValue) -> Value {
    match attr {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => number_from_text(n),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(items) => Value::Array(items.iter().map(attr_to_json).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attr_to_json(v)))
                .collect(),
        ),
        AttributeValue::Ss(items) => {
            Value::Array(items.iter().map(|s| Value::String(s.clone())).collect())
        }
        AttributeValue::Ns(items) => Value::Array(items.iter().map(|n| number_from_text(n)).collect()),
        AttributeValue::B(blob) => Value::String(
            base64::engine::general_purpose::STANDARD.encode(blob.as_ref()),
        ),
        AttributeValue::Bs(blobs) => Value::Array(
            blobs
                .iter()
                .map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b.as_ref())))
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn number_from_text(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    raw.parse::<f64>()
        .ok()
        .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

pub fn record_to_item(record: &Record) -> ApiResult<HashMap<String, AttributeValue>> {
    record
        .iter()
        .map(|(k, v)| Ok((k.clone(), json_to_attr(v)?)))
        .collect()
}

pub fn item_to_record(item: &HashMap<String, AttributeValue>) -> Record {
    item.iter()
        .map(|(k, v)| (k.clone(), attr_to_json(v)))
        .collect()
}

/// Type an identifier value per the key's declared storage type: `N` keys
/// must travel as numeric attribute text, `B` keys as base64 blobs.
pub fn key_attr(value: &Value, field_type: FieldType) -> ApiResult<AttributeValue> {
    match field_type {
        FieldType::Integer | FieldType::Float | FieldType::Id | FieldType::Reference => {
            let text = match value {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                other => {
                    return Err(ApiError::BadRequest(format!(
                        "Numeric key value expected, got {}.",
                        other
                    )))
                }
            };
            Ok(AttributeValue::N(text))
        }
        FieldType::Binary => {
            let Value::String(s) = value else {
                return Err(ApiError::BadRequest(
                    "Binary key values must be base64 strings.".to_string(),
                ));
            };
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(|e| ApiError::BadRequest(format!("Invalid base64 key value: {}", e)))?;
            Ok(AttributeValue::B(Blob::new(bytes)))
        }
        _ => match value {
            Value::String(s) => Ok(AttributeValue::S(s.clone())),
            other => Ok(AttributeValue::S(other.to_string())),
        },
    }
}
