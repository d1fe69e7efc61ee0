use bson::{doc, Bson, Document};

use crate::error::{ApiError, ApiResult};
use crate::parser::{CompareOp, FilterNode, FilterValue};

/// Compile a filter AST into MongoDB query criteria.
pub struct MongoFilterCompiler;

impl MongoFilterCompiler {
    pub fn compile(node: &FilterNode) -> ApiResult<Document> {
        match node {
            FilterNode::And(nodes) => {
                let clauses = nodes
                    .iter()
                    .map(Self::compile)
                    .collect::<ApiResult<Vec<_>>>()?;
                Ok(doc! { "$and": clauses })
            }
            FilterNode::Or(nodes) => {
                let clauses = nodes
                    .iter()
                    .map(Self::compile)
                    .collect::<ApiResult<Vec<_>>>()?;
                Ok(doc! { "$or": clauses })
            }
            // $not only applies to operator expressions; $nor negates a
            // whole sub-clause.
            FilterNode::Not(inner) => Ok(doc! { "$nor": [Self::compile(inner)?] }),
            FilterNode::Compare { field, op, value } => Self::compare(field, *op, value),
        }
    }

    fn compare(field: &str, op: CompareOp, value: &FilterValue) -> ApiResult<Document> {
        let bson = value_to_bson(field, value);
        Ok(match op {
            CompareOp::Eq => doc! { field: { "$eq": bson } },
            CompareOp::Ne => doc! { field: { "$ne": bson } },
            CompareOp::Gt => doc! { field: { "$gt": bson } },
            CompareOp::Gte => doc! { field: { "$gte": bson } },
            CompareOp::Lt => doc! { field: { "$lt": bson } },
            CompareOp::Lte => doc! { field: { "$lte": bson } },
            CompareOp::IsNull => doc! { field: { "$eq": Bson::Null } },
            CompareOp::IsNotNull => doc! { field: { "$ne": Bson::Null } },
            CompareOp::In => {
                let FilterValue::List(items) = value else {
                    return Err(ApiError::BadRequest("IN requires a value list.".to_string()));
                };
                let values: Vec<Bson> = items.iter().map(|v| value_to_bson(field, v)).collect();
                doc! { field: { "$in": values } }
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
                doc! { field: {
                    "$gte": value_to_bson(field, &bounds[0]),
                    "$lte": value_to_bson(field, &bounds[1]),
                } }
            }
            CompareOp::Contains => doc! { field: { "$regex": escape(value, op)? } },
            CompareOp::NotContains => {
                doc! { field: { "$not": { "$regex": escape(value, op)? } } }
            }
            CompareOp::StartsWith => {
                doc! { field: { "$regex": format!("^{}", escape(value, op)?) } }
            }
            CompareOp::EndsWith => {
                doc! { field: { "$regex": format!("{}$", escape(value, op)?) } }
            }
            CompareOp::Like => {
                let FilterValue::Str(pattern) = value else {
                    return Err(ApiError::BadRequest(
                        "LIKE requires a string pattern.".to_string(),
                    ));
                };
                doc! { field: { "$regex": like_to_regex(pattern)? } }
            }
        })
    }
}

fn escape(value: &FilterValue, op: CompareOp) -> ApiResult<String> {
    match value {
        FilterValue::Str(s) => Ok(regex::escape(s)),
        other => Err(ApiError::BadRequest(format!(
            "{} requires a string value, got {:?}.",
            op.as_str(),
            other
        ))),
    }
}

/// `%X%` matches anywhere, `X%` anchors left, `%X` anchors right; embedded
/// wildcards are not translatable.
fn like_to_regex(pattern: &str) -> ApiResult<String> {
    let leading = pattern.starts_with('%');
    let trailing = pattern.ends_with('%') && pattern.len() > 1;
    let inner = pattern.trim_matches('%');
    if inner.contains('%') {
        return Err(ApiError::BadRequest(format!(
            "LIKE pattern '{}' with embedded wildcards is not supported.",
            pattern
        )));
    }
    let escaped = regex::escape(inner);
    Ok(match (leading, trailing) {
        (true, true) => escaped,
        (false, true) => format!("^{}", escaped),
        (true, false) => format!("{}$", escaped),
        (false, false) => format!("^{}$", escaped),
    })
}

/// Convert a filter value, coercing 24-hex-char strings aimed at `_id` into
/// native object ids.
fn value_to_bson(field: &str, value: &FilterValue) -> Bson {
    if field == "_id" {
        if let FilterValue::Str(s) = value {
            if let Some(oid) = parse_object_id(s) {
                return Bson::ObjectId(oid);
            }
        }
    }
    match value {
        FilterValue::Str(s) => Bson::String(s.clone()),
        FilterValue::Int(i) => Bson::Int64(*i),
        FilterValue::Float(f) => Bson::Double(*f),
        FilterValue::Bool(b) => Bson::Boolean(*b),
        FilterValue::Null => Bson::Null,
        FilterValue::List(items) => {
            Bson::Array(items.iter().map(|v| value_to_bson(field, v)).collect())
        }
    }
}

/// A client-supplied string converts to a native id only when it is exactly
/// 24 hex characters.
pub fn parse_object_id(s: &str) -> Option<bson::oid::ObjectId> {
    if s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        bson::oid::ObjectId::parse_str(s).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_filter;

    fn compile(input: &str) -> Document {
        let node = parse_filter(input, &serde_json::Map::new()).unwrap().unwrap();
        MongoFilterCompiler::compile(&node).unwrap()
    }

    #[test]
    fn test_simple_compare() {
        assert_eq!(compile("age >= 21"), doc! { "age": { "$gte": 21_i64 } });
    }

    #[test]
    fn test_or_produces_dollar_or() {
        let result = compile("a = 1 or b = 2");
        let branches = result.get_array("$or").unwrap();
        assert_eq!(branches.len(), 2);
    }

    #[test]
    fn test_and_produces_dollar_and() {
        let result = compile("a = 1 and b = 2 and c = 3");
        assert_eq!(result.get_array("$and").unwrap().len(), 3);
    }

    #[test]
    fn test_not_wraps_in_nor() {
        let result = compile("not a = 1");
        assert!(result.contains_key("$nor"));
    }

    #[test]
    fn test_between() {
        assert_eq!(
            compile("age between 18 and 30"),
            doc! { "age": { "$gte": 18_i64, "$lte": 30_i64 } }
        );
    }

    #[test]
    fn test_in() {
        assert_eq!(
            compile("color in ('red', 'blue')"),
            doc! { "color": { "$in": ["red", "blue"] } }
        );
    }

    #[test]
    fn test_like_anchoring() {
        assert_eq!(
            compile("name like '%ab%'"),
            doc! { "name": { "$regex": "ab" } }
        );
        assert_eq!(
            compile("name like 'ab%'"),
            doc! { "name": { "$regex": "^ab" } }
        );
        // right-anchored patterns translate to an end-anchored regex
        assert_eq!(
            compile("name like '%ab'"),
            doc! { "name": { "$regex": "ab$" } }
        );
    }

    #[test]
    fn test_like_escapes_regex_metacharacters() {
        assert_eq!(
            compile("name like '%a.b%'"),
            doc! { "name": { "$regex": "a\\.b" } }
        );
    }

    #[test]
    fn test_embedded_wildcard_rejected() {
        let node = parse_filter("name like 'a%b'", &serde_json::Map::new())
            .unwrap()
            .unwrap();
        assert!(MongoFilterCompiler::compile(&node).is_err());
    }

    #[test]
    fn test_null_existence() {
        assert_eq!(
            compile("deleted_at = null"),
            doc! { "deleted_at": { "$eq": Bson::Null } }
        );
        assert_eq!(
            compile("deleted_at != null"),
            doc! { "deleted_at": { "$ne": Bson::Null } }
        );
    }

    #[test]
    fn test_object_id_coercion_in_filter() {
        let result = compile("_id = '507f1f77bcf86cd799439011'");
        let inner = result.get_document("_id").unwrap();
        assert!(matches!(inner.get("$eq"), Some(Bson::ObjectId(_))));
        // 23 chars: stays a string
        let result = compile("_id = '507f1f77bcf86cd79943901'");
        let inner = result.get_document("_id").unwrap();
        assert!(matches!(inner.get("$eq"), Some(Bson::String(_))));
    }
}
