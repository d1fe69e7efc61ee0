use crate::error::{ApiError, ApiResult};
use crate::parser::{CompareOp, FilterNode, FilterValue};

/// Compile a filter AST into a SOQL WHERE fragment. SOQL takes inline
/// literals, so values are escaped here rather than bound.
pub struct SoqlCompiler;

impl SoqlCompiler {
    pub fn compile(node: &FilterNode) -> ApiResult<String> {
        match node {
            FilterNode::And(nodes) => Self::join(nodes, " AND "),
            FilterNode::Or(nodes) => Self::join(nodes, " OR "),
            FilterNode::Not(inner) => Ok(format!("(NOT {})", Self::compile(inner)?)),
            FilterNode::Compare { field, op, value } => Self::compare(field, *op, value),
        }
    }

    fn join(nodes: &[FilterNode], sep: &str) -> ApiResult<String> {
        let parts = nodes
            .iter()
            .map(Self::compile)
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(format!("({})", parts.join(sep)))
    }

    fn compare(field: &str, op: CompareOp, value: &FilterValue) -> ApiResult<String> {
        check_field(field)?;
        Ok(match op {
            CompareOp::Eq => format!("{} = {}", field, literal(value)?),
            CompareOp::Ne => format!("{} != {}", field, literal(value)?),
            CompareOp::Gt => format!("{} > {}", field, literal(value)?),
            CompareOp::Gte => format!("{} >= {}", field, literal(value)?),
            CompareOp::Lt => format!("{} < {}", field, literal(value)?),
            CompareOp::Lte => format!("{} <= {}", field, literal(value)?),
            // SOQL has native null equality.
            CompareOp::IsNull => format!("{} = null", field),
            CompareOp::IsNotNull => format!("{} != null", field),
            CompareOp::In => {
                let FilterValue::List(items) = value else {
                    return Err(ApiError::BadRequest("IN requires a value list.".to_string()));
                };
                let rendered = items
                    .iter()
                    .map(literal)
                    .collect::<ApiResult<Vec<_>>>()?
                    .join(", ");
                format!("{} IN ({})", field, rendered)
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
                format!(
                    "({} >= {} AND {} <= {})",
                    field,
                    literal(&bounds[0])?,
                    field,
                    literal(&bounds[1])?
                )
            }
            CompareOp::Like => format!("{} LIKE {}", field, literal(value)?),
            CompareOp::Contains => {
                format!("{} LIKE {}", field, like_literal(value, "%", "%")?)
            }
            CompareOp::NotContains => {
                format!("(NOT {} LIKE {})", field, like_literal(value, "%", "%")?)
            }
            CompareOp::StartsWith => format!("{} LIKE {}", field, like_literal(value, "", "%")?),
            CompareOp::EndsWith => format!("{} LIKE {}", field, like_literal(value, "%", "")?),
        })
    }
}

fn check_field(field: &str) -> ApiResult<()> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!(
            "Invalid field name '{}'.",
            field
        )))
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "\\'")
}

fn literal(value: &FilterValue) -> ApiResult<String> {
    Ok(match value {
        FilterValue::Str(s) => format!("'{}'", escape(s)),
        FilterValue::Int(i) => i.to_string(),
        FilterValue::Float(f) => f.to_string(),
        FilterValue::Bool(b) => b.to_string(),
        FilterValue::Null => "null".to_string(),
        FilterValue::List(_) => {
            return Err(ApiError::BadRequest(
                "A value list is only usable with IN or BETWEEN.".to_string(),
            ))
        }
    })
}

fn like_literal(value: &FilterValue, prefix: &str, suffix: &str) -> ApiResult<String> {
    let FilterValue::Str(s) = value else {
        return Err(ApiError::BadRequest(
            "LIKE-style operators require a string value.".to_string(),
        ));
    };
    Ok(format!("'{}{}{}'", prefix, escape(s), suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_filter;

    fn compile(input: &str) -> String {
        let node = parse_filter(input, &serde_json::Map::new()).unwrap().unwrap();
        SoqlCompiler::compile(&node).unwrap()
    }

    #[test]
    fn test_simple_compare() {
        assert_eq!(compile("Name = 'Acme'"), "Name = 'Acme'");
        assert_eq!(compile("Amount >= 100"), "Amount >= 100");
    }

    #[test]
    fn test_logical_tree() {
        assert_eq!(
            compile("Name = 'a' and (Amount > 5 or Amount < 1)"),
            "(Name = 'a' AND (Amount > 5 OR Amount < 1))"
        );
    }

    #[test]
    fn test_not() {
        assert_eq!(compile("not Name = 'a'"), "(NOT Name = 'a')");
    }

    #[test]
    fn test_quote_escaping() {
        assert_eq!(compile("Name = 'O\\'Brien'"), "Name = 'O\\'Brien'");
    }

    #[test]
    fn test_in_and_between() {
        assert_eq!(
            compile("StageName in ('Won', 'Lost')"),
            "StageName IN ('Won', 'Lost')"
        );
        assert_eq!(
            compile("Amount between 1 and 10"),
            "(Amount >= 1 AND Amount <= 10)"
        );
    }

    #[test]
    fn test_like_family() {
        assert_eq!(compile("Name contains 'mid'"), "Name LIKE '%mid%'");
        assert_eq!(compile("Name begins_with 'A'"), "Name LIKE 'A%'");
        assert_eq!(compile("Name ends_with 'Inc'"), "Name LIKE '%Inc'");
        assert_eq!(compile("Name like 'A%'"), "Name LIKE 'A%'");
    }

    #[test]
    fn test_null_comparison() {
        assert_eq!(compile("CloseDate = null"), "CloseDate = null");
        assert_eq!(compile("CloseDate != null"), "CloseDate != null");
    }

    #[test]
    fn test_hostile_field_rejected() {
        let node = crate::parser::FilterNode::compare(
            "Name; DROP",
            CompareOp::Eq,
            FilterValue::Int(1),
        );
        assert!(SoqlCompiler::compile(&node).is_err());
    }
}
