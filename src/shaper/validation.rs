use email_address::EmailAddress;
use regex::Regex;
use serde_json::Value;
use std::str::FromStr;

use crate::error::{ApiError, ApiResult};
use crate::models::{FieldInfo, ValidationRule};

/// Outcome of running one rule against one field value.
pub enum RuleOutcome {
    Pass,
    /// `on_fail: ignore_field` — drop the field and keep processing.
    DropField,
}

fn fail(on_fail: &Option<String>, default_msg: String) -> ApiResult<RuleOutcome> {
    match on_fail.as_deref() {
        Some("ignore_field") => Ok(RuleOutcome::DropField),
        Some(message) => Err(ApiError::BadRequest(message.to_string())),
        None => Err(ApiError::BadRequest(default_msg)),
    }
}

/// Run every declared rule for a field, in order. The first failing rule
/// decides the outcome: reject the record, or silently drop the field.
pub fn run_rules(field: &FieldInfo, value: &Value, for_update: bool) -> ApiResult<RuleOutcome> {
    for rule in &field.validation {
        match apply_rule(rule, field, value, for_update)? {
            RuleOutcome::Pass => continue,
            RuleOutcome::DropField => return Ok(RuleOutcome::DropField),
        }
    }
    Ok(RuleOutcome::Pass)
}

fn apply_rule(
    rule: &ValidationRule,
    field: &FieldInfo,
    value: &Value,
    for_update: bool,
) -> ApiResult<RuleOutcome> {
    let name = &field.name;
    match rule {
        ValidationRule::ApiReadOnly { on_fail } => fail(
            on_fail,
            format!("Field '{}' is read only.", name),
        ),
        ValidationRule::CreateOnly { on_fail } => {
            if for_update {
                fail(
                    on_fail,
                    format!("Field '{}' may only be set upon creation.", name),
                )
            } else {
                Ok(RuleOutcome::Pass)
            }
        }
        ValidationRule::NotNull { on_fail } => {
            if value.is_null() {
                fail(on_fail, format!("Field '{}' value can not be null.", name))
            } else {
                Ok(RuleOutcome::Pass)
            }
        }
        ValidationRule::NotEmpty { on_fail } => {
            let empty = match value {
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                _ => false,
            };
            if empty {
                fail(on_fail, format!("Field '{}' value can not be empty.", name))
            } else {
                Ok(RuleOutcome::Pass)
            }
        }
        ValidationRule::NotZero { on_fail } => {
            let zero = match value {
                Value::Number(n) => n.as_f64() == Some(0.0),
                Value::String(s) => s == "0",
                _ => false,
            };
            if zero {
                fail(on_fail, format!("Field '{}' value can not be zero.", name))
            } else {
                Ok(RuleOutcome::Pass)
            }
        }
        ValidationRule::Email { on_fail } => {
            let ok = value
                .as_str()
                .is_some_and(|s| EmailAddress::from_str(s).is_ok());
            if ok {
                Ok(RuleOutcome::Pass)
            } else {
                fail(
                    on_fail,
                    format!("Field '{}' value must be a valid email address.", name),
                )
            }
        }
        ValidationRule::Url { on_fail } => {
            let ok = value.as_str().is_some_and(|s| url::Url::parse(s).is_ok());
            if ok {
                Ok(RuleOutcome::Pass)
            } else {
                fail(
                    on_fail,
                    format!("Field '{}' value must be a valid URL.", name),
                )
            }
        }
        ValidationRule::Int { min, max, on_fail } => {
            let parsed = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse::<i64>().ok(),
                _ => None,
            };
            let Some(i) = parsed else {
                return fail(
                    on_fail,
                    format!("Field '{}' value must be an integer.", name),
                );
            };
            if min.is_some_and(|m| i < m) || max.is_some_and(|m| i > m) {
                fail(
                    on_fail,
                    format!("Field '{}' value is out of the allowed range.", name),
                )
            } else {
                Ok(RuleOutcome::Pass)
            }
        }
        ValidationRule::Match { pattern, on_fail } => {
            let regex = Regex::new(pattern).map_err(|e| {
                ApiError::Configuration(format!(
                    "Invalid validation pattern for field '{}': {}",
                    name, e
                ))
            })?;
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if regex.is_match(&text) {
                Ok(RuleOutcome::Pass)
            } else {
                fail(
                    on_fail,
                    format!("Field '{}' value is in an invalid format.", name),
                )
            }
        }
        ValidationRule::Picklist { on_fail } => {
            if field.picklist.is_empty() {
                return Err(ApiError::Configuration(format!(
                    "Field '{}' has a picklist rule but no picklist values.",
                    name
                )));
            }
            if field.picklist.contains(value) {
                Ok(RuleOutcome::Pass)
            } else {
                fail(
                    on_fail,
                    format!("Field '{}' value is not in the allowed list.", name),
                )
            }
        }
        ValidationRule::MultiPicklist { min, max, on_fail } => {
            if field.picklist.is_empty() {
                return Err(ApiError::Configuration(format!(
                    "Field '{}' has a multi_picklist rule but no picklist values.",
                    name
                )));
            }
            let selections: Vec<Value> = match value {
                Value::Array(items) => items.clone(),
                Value::String(s) => s
                    .split(',')
                    .map(|p| Value::String(p.trim().to_string()))
                    .collect(),
                other => vec![other.clone()],
            };
            if min.is_some_and(|m| selections.len() < m)
                || max.is_some_and(|m| selections.len() > m)
            {
                return fail(
                    on_fail,
                    format!(
                        "Field '{}' has an invalid number of selections.",
                        name
                    ),
                );
            }
            if selections.iter().all(|s| field.picklist.contains(s)) {
                Ok(RuleOutcome::Pass)
            } else {
                fail(
                    on_fail,
                    format!("Field '{}' contains values not in the allowed list.", name),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldType;
    use serde_json::json;

    fn field_with(rules: Vec<ValidationRule>) -> FieldInfo {
        let mut f = FieldInfo::new("f", FieldType::String);
        f.validation = rules;
        f
    }

    #[test]
    fn test_not_null_throws_with_field_name() {
        let field = field_with(vec![ValidationRule::NotNull { on_fail: None }]);
        let err = run_rules(&field, &Value::Null, false).unwrap_err();
        match err {
            ApiError::BadRequest(msg) => assert!(msg.contains("'f'")),
            other => panic!("Expected BadRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_not_null_ignore_field_drops() {
        let field = field_with(vec![ValidationRule::NotNull {
            on_fail: Some("ignore_field".to_string()),
        }]);
        assert!(matches!(
            run_rules(&field, &Value::Null, false).unwrap(),
            RuleOutcome::DropField
        ));
    }

    #[test]
    fn test_custom_message() {
        let field = field_with(vec![ValidationRule::NotEmpty {
            on_fail: Some("give me something".to_string()),
        }]);
        let err = run_rules(&field, &json!(""), false).unwrap_err();
        assert!(err.to_string().contains("give me something"));
    }

    #[test]
    fn test_create_only_passes_on_create() {
        let field = field_with(vec![ValidationRule::CreateOnly { on_fail: None }]);
        assert!(matches!(
            run_rules(&field, &json!("x"), false).unwrap(),
            RuleOutcome::Pass
        ));
        assert!(run_rules(&field, &json!("x"), true).is_err());
    }

    #[test]
    fn test_email_rule() {
        let field = field_with(vec![ValidationRule::Email { on_fail: None }]);
        assert!(matches!(
            run_rules(&field, &json!("a@example.com"), false).unwrap(),
            RuleOutcome::Pass
        ));
        assert!(run_rules(&field, &json!("not-an-email"), false).is_err());
    }

    #[test]
    fn test_int_range() {
        let field = field_with(vec![ValidationRule::Int {
            min: Some(1),
            max: Some(10),
            on_fail: None,
        }]);
        assert!(matches!(
            run_rules(&field, &json!(5), false).unwrap(),
            RuleOutcome::Pass
        ));
        assert!(run_rules(&field, &json!(11), false).is_err());
        assert!(run_rules(&field, &json!("nope"), false).is_err());
    }

    #[test]
    fn test_match_rule() {
        let field = field_with(vec![ValidationRule::Match {
            pattern: "^[A-Z]{2}-\\d+$".to_string(),
            on_fail: None,
        }]);
        assert!(matches!(
            run_rules(&field, &json!("AB-12"), false).unwrap(),
            RuleOutcome::Pass
        ));
        assert!(run_rules(&field, &json!("nope"), false).is_err());
    }

    #[test]
    fn test_picklist() {
        let mut field = field_with(vec![ValidationRule::Picklist { on_fail: None }]);
        field.picklist = vec![json!("red"), json!("blue")];
        assert!(matches!(
            run_rules(&field, &json!("red"), false).unwrap(),
            RuleOutcome::Pass
        ));
        assert!(run_rules(&field, &json!("green"), false).is_err());
    }

    #[test]
    fn test_multi_picklist_cardinality() {
        let mut field = field_with(vec![ValidationRule::MultiPicklist {
            min: Some(1),
            max: Some(2),
            on_fail: None,
        }]);
        field.picklist = vec![json!("a"), json!("b"), json!("c")];
        assert!(matches!(
            run_rules(&field, &json!(["a", "b"]), false).unwrap(),
            RuleOutcome::Pass
        ));
        assert!(run_rules(&field, &json!(["a", "b", "c"]), false).is_err());
        assert!(run_rules(&field, &json!(["z"]), false).is_err());
    }

    #[test]
    fn test_rules_run_in_order() {
        // not_empty(ignore) runs before email(throw): empty value drops the
        // field before the email rule can reject the record.
        let field = field_with(vec![
            ValidationRule::NotEmpty {
                on_fail: Some("ignore_field".to_string()),
            },
            ValidationRule::Email { on_fail: None },
        ]);
        assert!(matches!(
            run_rules(&field, &json!(""), false).unwrap(),
            RuleOutcome::DropField
        ));
    }
}
