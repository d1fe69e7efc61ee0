use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;

use super::attr::json_to_attr;
use crate::error::{ApiError, ApiResult};
use crate::parser::{CompareOp, FilterNode, FilterValue};

/// A compiled DynamoDB filter expression with its attribute name and value
/// substitution maps.
#[derive(Debug, Clone, Default)]
pub struct CompiledExpression {
    pub expression: String,
    pub names: HashMap<String, String>,
    pub values: HashMap<String, AttributeValue>,
}

/// Compiles a filter AST into a DynamoDB filter expression.
///
/// Only conjunctive filters translate: OR and NOT have no counterpart in
/// the supported expression subset and are rejected with a client error.
pub struct DynamoFilterCompiler;

impl DynamoFilterCompiler {
    pub fn compile(node: &FilterNode) -> ApiResult<CompiledExpression> {
        let mut out = CompiledExpression::default();
        out.expression = Self::compile_node(node, &mut out.names, &mut out.values)?;
        Ok(out)
    }

    fn compile_node(
        node: &FilterNode,
        names: &mut HashMap<String, String>,
        values: &mut HashMap<String, AttributeValue>,
    ) -> ApiResult<String> {
        match node {
            FilterNode::And(nodes) => {
                let parts = nodes
                    .iter()
                    .map(|n| Self::compile_node(n, names, values))
                    .collect::<ApiResult<Vec<_>>>()?;
                Ok(parts.join(" AND "))
            }
            FilterNode::Or(_) => Err(ApiError::BadRequest(
                "OR filter combinations are not supported on DynamoDB.".to_string(),
            )),
            FilterNode::Not(_) => Err(ApiError::BadRequest(
                "NOT filter negation is not supported on DynamoDB.".to_string(),
            )),
            FilterNode::Compare { field, op, value } => {
                Self::compare(field, *op, value, names, values)
            }
        }
    }

    fn compare(
        field: &str,
        op: CompareOp,
        value: &FilterValue,
        names: &mut HashMap<String, String>,
        values: &mut HashMap<String, AttributeValue>,
    ) -> ApiResult<String> {
        let name_key = format!("#n{}", names.len());
        names.insert(name_key.clone(), field.to_string());

        let mut push_value = |values: &mut HashMap<String, AttributeValue>,
                              v: &FilterValue|
         -> ApiResult<String> {
            let value_key = format!(":v{}", values.len());
            values.insert(value_key.clone(), json_to_attr(&v.to_json())?);
            Ok(value_key)
        };

        match op {
            CompareOp::Eq | CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
                let vk = push_value(values, value)?;
                let symbol = match op {
                    CompareOp::Eq => "=",
                    CompareOp::Gt => ">",
                    CompareOp::Gte => ">=",
                    CompareOp::Lt => "<",
                    CompareOp::Lte => "<=",
                    _ => unreachable!(),
                };
                Ok(format!("{} {} {}", name_key, symbol, vk))
            }
            CompareOp::Ne => {
                let vk = push_value(values, value)?;
                Ok(format!("{} <> {}", name_key, vk))
            }
            CompareOp::In => {
                let FilterValue::List(items) = value else {
                    return Err(ApiError::BadRequest("IN requires a value list.".to_string()));
                };
                let keys = items
                    .iter()
                    .map(|item| push_value(values, item))
                    .collect::<ApiResult<Vec<_>>>()?;
                Ok(format!("{} IN ({})", name_key, keys.join(", ")))
            }
            CompareOp::Between => {
                let FilterValue::List(bounds) = value else {
                    return Err(ApiError::BadRequest(
                        "BETWEEN requires two bounds.".to_string(),
                    ));
                };
                if bounds.len() != 2 {
                    return Err(ApiError::BadRequest(
                        "BETWEEN requires exactly two bounds.".to_string(),
                    ));
                }
                let low = push_value(values, &bounds[0])?;
                let high = push_value(values, &bounds[1])?;
                Ok(format!("{} BETWEEN {} AND {}", name_key, low, high))
            }
            CompareOp::Contains => {
                let vk = push_value(values, value)?;
                Ok(format!("contains({}, {})", name_key, vk))
            }
            CompareOp::NotContains => {
                let vk = push_value(values, value)?;
                Ok(format!("NOT contains({}, {})", name_key, vk))
            }
            CompareOp::StartsWith => {
                let vk = push_value(values, value)?;
                Ok(format!("begins_with({}, {})", name_key, vk))
            }
            CompareOp::EndsWith => Err(ApiError::BadRequest(
                "ENDS_WITH filters are not supported on DynamoDB.".to_string(),
            )),
            CompareOp::Like => {
                let FilterValue::Str(pattern) = value else {
                    return Err(ApiError::BadRequest(
                        "LIKE requires a string pattern.".to_string(),
                    ));
                };
                let leading = pattern.starts_with('%');
                let trailing = pattern.ends_with('%') && pattern.len() > 1;
                let inner = pattern.trim_matches('%');
                if inner.contains('%') {
                    return Err(ApiError::BadRequest(format!(
                        "LIKE pattern '{}' with embedded wildcards is not supported.",
                        pattern
                    )));
                }
                let vk = push_value(values, &FilterValue::Str(inner.to_string()))?;
                match (leading, trailing) {
                    (true, true) => Ok(format!("contains({}, {})", name_key, vk)),
                    (false, true) => Ok(format!("begins_with({}, {})", name_key, vk)),
                    (true, false) => Err(ApiError::BadRequest(format!(
                        "Right-anchored LIKE pattern '{}' is not supported on DynamoDB.",
                        pattern
                    ))),
                    (false, false) => Ok(format!("{} = {}", name_key, vk)),
                }
            }
            CompareOp::IsNull => Ok(format!("attribute_not_exists({})", name_key)),
            CompareOp::IsNotNull => Ok(format!("attribute_exists({})", name_key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_filter;

    fn compile(input: &str) -> ApiResult<CompiledExpression> {
        let node = parse_filter(input, &serde_json::Map::new())?.unwrap();
        DynamoFilterCompiler::compile(&node)
    }

    #[test]
    fn test_conjunction_flattens() {
        let out = compile("a = 1 and b > 2 and c begins_with 'x'").unwrap();
        assert_eq!(out.expression, "#n0 = :v0 AND #n1 > :v1 AND begins_with(#n2, :v2)");
        assert_eq!(out.names["#n0"], "a");
        assert_eq!(out.values[":v0"], AttributeValue::N("1".to_string()));
    }

    #[test]
    fn test_or_rejected() {
        let err = compile("a = 1 || b = 2").unwrap_err();
        match err {
            ApiError::BadRequest(msg) => assert!(msg.contains("OR")),
            other => panic!("Expected BadRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_or_after_between_rejected() {
        assert!(compile("a between 1 and 10 or b = 2").is_err());
    }

    #[test]
    fn test_not_rejected() {
        assert!(compile("not a = 1").is_err());
    }

    #[test]
    fn test_like_translations() {
        let out = compile("name like '%ab%'").unwrap();
        assert_eq!(out.expression, "contains(#n0, :v0)");
        let out = compile("name like 'ab%'").unwrap();
        assert_eq!(out.expression, "begins_with(#n0, :v0)");
        assert!(compile("name like '%ab'").is_err());
    }

    #[test]
    fn test_null_existence() {
        let out = compile("deleted_at = null").unwrap();
        assert_eq!(out.expression, "attribute_not_exists(#n0)");
        assert!(out.values.is_empty());
        let out = compile("deleted_at != null").unwrap();
        assert_eq!(out.expression, "attribute_exists(#n0)");
    }

    #[test]
    fn test_between_and_in() {
        let out = compile("age between 18 and 30").unwrap();
        assert_eq!(out.expression, "#n0 BETWEEN :v0 AND :v1");
        let out = compile("color in ('red', 'blue')").unwrap();
        assert_eq!(out.expression, "#n0 IN (:v0, :v1)");
    }
}
