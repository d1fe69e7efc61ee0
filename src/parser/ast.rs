use serde_json::Value;

use crate::error::{ApiError, ApiResult};

/// Comparison operators shared by every backend compiler.
///
/// `Like` keeps its raw `%` pattern; the per-backend compilers decide whether
/// that maps to contains/begins-with/ends-with or a native LIKE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Between,
    Like,
    Contains,
    StartsWith,
    EndsWith,
    NotContains,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    /// Map a word operator from the filter grammar. Symbols (`=`, `>=`, ...)
    /// are handled by the tokenizer.
    pub fn from_keyword(word: &str) -> Option<CompareOp> {
        match word.to_lowercase().as_str() {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "gte" | "ge" => Some(CompareOp::Gte),
            "lt" => Some(CompareOp::Lt),
            "lte" | "le" => Some(CompareOp::Lte),
            "in" => Some(CompareOp::In),
            "between" => Some(CompareOp::Between),
            "like" => Some(CompareOp::Like),
            "contains" => Some(CompareOp::Contains),
            "begins_with" | "starts_with" => Some(CompareOp::StartsWith),
            "ends_with" => Some(CompareOp::EndsWith),
            "not_contains" => Some(CompareOp::NotContains),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::In => "in",
            CompareOp::Between => "between",
            CompareOp::Like => "like",
            CompareOp::Contains => "contains",
            CompareOp::StartsWith => "begins_with",
            CompareOp::EndsWith => "ends_with",
            CompareOp::NotContains => "not_contains",
            CompareOp::IsNull => "is null",
            CompareOp::IsNotNull => "is not null",
        }
    }
}

/// A typed right-hand value from the filter grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    List(Vec<FilterValue>),
}

impl FilterValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FilterValue::Null)
    }

    pub fn to_json(&self) -> Value {
        match self {
            FilterValue::Str(s) => Value::String(s.clone()),
            FilterValue::Int(i) => Value::Number((*i).into()),
            FilterValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FilterValue::Bool(b) => Value::Bool(*b),
            FilterValue::Null => Value::Null,
            FilterValue::List(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
        }
    }

    /// Convert a bound-parameter value into a filter value.
    pub fn from_json(value: &Value) -> ApiResult<FilterValue> {
        match value {
            Value::String(s) => Ok(FilterValue::Str(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(FilterValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(FilterValue::Float(f))
                } else {
                    Err(ApiError::BadRequest(format!(
                        "Unsupported numeric parameter value '{}'.",
                        n
                    )))
                }
            }
            Value::Bool(b) => Ok(FilterValue::Bool(*b)),
            Value::Null => Ok(FilterValue::Null),
            Value::Array(items) => Ok(FilterValue::List(
                items
                    .iter()
                    .map(FilterValue::from_json)
                    .collect::<ApiResult<Vec<_>>>()?,
            )),
            Value::Object(_) => Err(ApiError::BadRequest(
                "Object values are not usable in filter comparisons.".to_string(),
            )),
        }
    }
}

/// Parsed filter expression tree.
///
/// `And`/`Or` hold flattened conjunct/disjunct lists rather than binary
/// nodes, which keeps the per-backend compilers simple (DynamoDB joins one
/// conjunctive clause set, SQL emits one parenthesized chain).
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Compare {
        field: String,
        op: CompareOp,
        value: FilterValue,
    },
}

impl FilterNode {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: FilterValue) -> FilterNode {
        FilterNode::Compare {
            field: field.into(),
            op,
            value,
        }
    }

    /// Conjoin a list of nodes, flattening nested `And`s and dropping the
    /// wrapper for a single conjunct.
    pub fn and(nodes: Vec<FilterNode>) -> FilterNode {
        let mut flat = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                FilterNode::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.into_iter().next().unwrap()
        } else {
            FilterNode::And(flat)
        }
    }

    pub fn or(nodes: Vec<FilterNode>) -> FilterNode {
        let mut flat = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                FilterNode::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.into_iter().next().unwrap()
        } else {
            FilterNode::Or(flat)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_and_flattens() {
        let a = FilterNode::compare("a", CompareOp::Eq, FilterValue::Int(1));
        let b = FilterNode::compare("b", CompareOp::Eq, FilterValue::Int(2));
        let c = FilterNode::compare("c", CompareOp::Eq, FilterValue::Int(3));
        let node = FilterNode::and(vec![FilterNode::and(vec![a.clone(), b.clone()]), c.clone()]);
        assert_eq!(node, FilterNode::And(vec![a, b, c]));
    }

    #[test]
    fn test_single_conjunct_unwraps() {
        let a = FilterNode::compare("a", CompareOp::Eq, FilterValue::Int(1));
        assert_eq!(FilterNode::and(vec![a.clone()]), a);
    }

    #[test]
    fn test_filter_value_from_json() {
        assert_eq!(FilterValue::from_json(&json!(5)).unwrap(), FilterValue::Int(5));
        assert_eq!(
            FilterValue::from_json(&json!("x")).unwrap(),
            FilterValue::Str("x".to_string())
        );
        assert!(FilterValue::from_json(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_keyword_mapping() {
        assert_eq!(CompareOp::from_keyword("GTE"), Some(CompareOp::Gte));
        assert_eq!(CompareOp::from_keyword("begins_with"), Some(CompareOp::StartsWith));
        assert_eq!(CompareOp::from_keyword("bogus"), None);
    }
}
