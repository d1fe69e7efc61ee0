use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ApiError, ApiResult};

/// A record is an ordered field-name → value mapping. Values are scalars,
/// arrays, or null; nested objects only appear for related-record payloads.
pub type Record = Map<String, Value>;

/// Declared storage type of a field.
///
/// The `*OnCreate`/`*OnUpdate` variants are auto-managed: the shaper injects
/// the current time or session user id and never trusts client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Id,
    #[default]
    String,
    Text,
    Integer,
    Float,
    Boolean,
    Datetime,
    Binary,
    Reference,
    TimestampOnCreate,
    TimestampOnUpdate,
    UserId,
    UserIdOnCreate,
    UserIdOnUpdate,
}

impl FieldType {
    pub fn is_auto_managed(&self) -> bool {
        matches!(
            self,
            FieldType::TimestampOnCreate
                | FieldType::TimestampOnUpdate
                | FieldType::UserIdOnCreate
                | FieldType::UserIdOnUpdate
        )
    }
}

/// A declarative validation rule attached to a field.
///
/// `on_fail` is either absent (reject the record), the literal
/// `"ignore_field"` (drop the field and keep going), or a custom message to
/// reject with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    ApiReadOnly {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    CreateOnly {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    NotNull {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    NotEmpty {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    NotZero {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    Email {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    Url {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    Int {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    Match {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    Picklist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
    MultiPicklist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_fail: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

/// Declared metadata for one field of a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_true")]
    pub allow_null: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub picklist: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            allow_null: true,
            auto_increment: false,
            size: None,
            picklist: Vec::new(),
            validation: Vec::new(),
            default: None,
        }
    }
}

/// One identifier field. Composite keys are expressed as multiple entries in
/// `TableSchema::id_fields`, each with its own storage type. `key_type`
/// carries backend-specific key roles (DynamoDB hash/range).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
}

impl IdField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            key_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    BelongsTo,
    HasMany,
    ManyMany,
}

/// A relationship discovered from (or declared alongside) the table schema.
///
/// For `many_many`, `junction_table` names the join table and
/// `junction_field`/`junction_ref_field` its two foreign-key columns (local
/// side, related side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub rel_type: RelationType,
    pub ref_table: String,
    pub ref_field: String,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub junction_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub junction_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub junction_ref_field: Option<String>,
}

/// Resolved descriptor for one table: name, identifier field(s), declared
/// fields, relations. Resolved lazily and cached per adapter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub id_fields: Vec<IdField>,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<RelationInfo>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_fields: Vec::new(),
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn id_names(&self) -> Vec<String> {
        self.id_fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationInfo> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// Unwrap an inbound payload into a batch of records.
///
/// Accepted shapes: `{"record": [...]}` (explicit batch), a JSON array, or a
/// bare object which counts as exactly one record.
pub fn extract_records(payload: &Value) -> ApiResult<Vec<Record>> {
    let as_record = |v: &Value| -> ApiResult<Record> {
        v.as_object().cloned().ok_or_else(|| {
            ApiError::BadRequest("Record payload entries must be objects.".to_string())
        })
    };

    match payload {
        Value::Array(items) => items.iter().map(as_record).collect(),
        Value::Object(map) => match map.get("record") {
            Some(Value::Array(items)) => items.iter().map(as_record).collect(),
            Some(other) => Ok(vec![as_record(other)?]),
            None => Ok(vec![map.clone()]),
        },
        _ => Err(ApiError::BadRequest(
            "There are no record sets in the request.".to_string(),
        )),
    }
}

/// Build the uniform `{record: [...], meta: {...}}` response envelope.
pub fn record_envelope(records: Vec<Record>, meta: Option<Value>) -> Value {
    let mut body = json!({ "record": records });
    if let Some(meta) = meta {
        body["meta"] = meta;
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_records_wrapped() {
        let payload = json!({"record": [{"a": 1}, {"a": 2}]});
        let records = extract_records(&payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["a"], json!(2));
    }

    #[test]
    fn test_extract_records_bare_object_is_single() {
        let payload = json!({"name": "one", "age": 3});
        let records = extract_records(&payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], json!("one"));
    }

    #[test]
    fn test_extract_records_array() {
        let payload = json!([{"a": 1}]);
        assert_eq!(extract_records(&payload).unwrap().len(), 1);
    }

    #[test]
    fn test_extract_records_rejects_scalars() {
        assert!(extract_records(&json!("nope")).is_err());
        assert!(extract_records(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_field_info_deserialize_defaults() {
        let f: FieldInfo = serde_json::from_value(json!({"name": "age", "type": "integer"})).unwrap();
        assert_eq!(f.field_type, FieldType::Integer);
        assert!(f.allow_null);
        assert!(!f.auto_increment);
    }

    #[test]
    fn test_validation_rule_deserialize() {
        let r: ValidationRule =
            serde_json::from_value(json!({"rule": "not_null", "on_fail": "ignore_field"})).unwrap();
        assert_eq!(
            r,
            ValidationRule::NotNull {
                on_fail: Some("ignore_field".to_string())
            }
        );
    }

    #[test]
    fn test_envelope_meta() {
        let body = record_envelope(vec![Record::new()], Some(json!({"count": 1})));
        assert_eq!(body["meta"]["count"], json!(1));
        assert!(body["record"].is_array());
    }
}
