use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::models::Record;
use crate::parser::{FilterCombiner, FilterTriple, ServerFilterSpec};

/// Enforce a record-level access filter against a parsed record.
///
/// Fields absent from the parsed record fall back to `old_record` when the
/// write is an update (partial payloads must not dodge the guard). An
/// AND-combined spec rejects on the first failing clause; an OR-combined
/// spec rejects only when every branch fails.
pub fn enforce_record_filter(
    spec: &ServerFilterSpec,
    record: &Record,
    old_record: Option<&Record>,
) -> ApiResult<()> {
    if spec.filters.is_empty() {
        return Ok(());
    }

    let mut any_passed = false;
    for triple in &spec.filters {
        let actual = record
            .get(&triple.name)
            .or_else(|| old_record.and_then(|old| old.get(&triple.name)));
        let passed = clause_matches(triple, actual)?;
        match spec.combiner {
            FilterCombiner::And => {
                if !passed {
                    return Err(forbidden(&triple.name));
                }
            }
            FilterCombiner::Or => {
                if passed {
                    any_passed = true;
                }
            }
        }
    }

    if spec.combiner == FilterCombiner::Or && !any_passed {
        return Err(ApiError::Forbidden(
            "Record does not satisfy any of the required access conditions.".to_string(),
        ));
    }
    Ok(())
}

fn forbidden(field: &str) -> ApiError {
    ApiError::Forbidden(format!(
        "Record value for field '{}' violates an access condition.",
        field
    ))
}

fn clause_matches(triple: &FilterTriple, actual: Option<&Value>) -> ApiResult<bool> {
    let actual = actual.unwrap_or(&Value::Null);
    let expected = &triple.value;
    Ok(match triple.op.as_str() {
        "=" | "==" | "eq" => json_eq(actual, expected),
        "!=" | "<>" | "ne" => !json_eq(actual, expected),
        ">" | "gt" => json_cmp(actual, expected).is_some_and(|o| o == std::cmp::Ordering::Greater),
        ">=" | "gte" => json_cmp(actual, expected)
            .is_some_and(|o| o != std::cmp::Ordering::Less),
        "<" | "lt" => json_cmp(actual, expected).is_some_and(|o| o == std::cmp::Ordering::Less),
        "<=" | "lte" => json_cmp(actual, expected)
            .is_some_and(|o| o != std::cmp::Ordering::Greater),
        "in" => expected
            .as_array()
            .is_some_and(|list| list.iter().any(|v| json_eq(actual, v))),
        "contains" => match (actual, expected) {
            (Value::String(a), Value::String(e)) => a.contains(e.as_str()),
            (Value::Array(a), e) => a.iter().any(|v| json_eq(v, e)),
            _ => false,
        },
        other => {
            return Err(ApiError::Configuration(format!(
                "Record filter uses unsupported operator '{}'.",
                other
            )))
        }
    })
}

fn json_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn json_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_and_all_must_pass() {
        let spec = ServerFilterSpec::new(
            vec![
                FilterTriple::new("owner_id", "=", json!(7)),
                FilterTriple::new("status", "!=", json!("locked")),
            ],
            FilterCombiner::And,
        );
        let ok = record(&[("owner_id", json!(7)), ("status", json!("open"))]);
        assert!(enforce_record_filter(&spec, &ok, None).is_ok());

        let bad = record(&[("owner_id", json!(8)), ("status", json!("open"))]);
        assert!(matches!(
            enforce_record_filter(&spec, &bad, None),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn test_or_needs_one_branch() {
        let spec = ServerFilterSpec::new(
            vec![
                FilterTriple::new("owner_id", "=", json!(7)),
                FilterTriple::new("public", "=", json!(true)),
            ],
            FilterCombiner::Or,
        );
        let ok = record(&[("owner_id", json!(99)), ("public", json!(true))]);
        assert!(enforce_record_filter(&spec, &ok, None).is_ok());

        let bad = record(&[("owner_id", json!(99)), ("public", json!(false))]);
        assert!(enforce_record_filter(&spec, &bad, None).is_err());
    }

    #[test]
    fn test_old_record_fallback_on_update() {
        let spec = ServerFilterSpec::new(
            vec![FilterTriple::new("owner_id", "=", json!(7))],
            FilterCombiner::And,
        );
        let partial = record(&[("status", json!("open"))]);
        let old = record(&[("owner_id", json!(7))]);
        assert!(enforce_record_filter(&spec, &partial, Some(&old)).is_ok());
        assert!(enforce_record_filter(&spec, &partial, None).is_err());
    }

    #[test]
    fn test_numeric_coercion() {
        let spec = ServerFilterSpec::new(
            vec![FilterTriple::new("owner_id", ">=", json!(5))],
            FilterCombiner::And,
        );
        let rec = record(&[("owner_id", json!(5.0))]);
        assert!(enforce_record_filter(&spec, &rec, None).is_ok());
    }
}
