use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::parser::ast::{CompareOp, FilterNode, FilterValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterCombiner {
    #[default]
    And,
    Or,
}

/// One declarative server-side filter clause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterTriple {
    pub name: String,
    #[serde(rename = "operator")]
    pub op: String,
    pub value: Value,
}

impl FilterTriple {
    pub fn new(name: impl Into<String>, op: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            value,
        }
    }

    fn compile(&self) -> ApiResult<FilterNode> {
        let op = match self.op.as_str() {
            "=" | "==" => CompareOp::Eq,
            "!=" | "<>" => CompareOp::Ne,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Gte,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Lte,
            word => CompareOp::from_keyword(word).ok_or_else(|| {
                ApiError::Configuration(format!(
                    "Server-side filter uses unsupported operator '{}'.",
                    word
                ))
            })?,
        };
        let value = FilterValue::from_json(&self.value)?;
        // Same null normalization the client grammar gets.
        let (op, value) = match (op, &value) {
            (CompareOp::Eq, FilterValue::Null) => (CompareOp::IsNull, FilterValue::Null),
            (CompareOp::Ne, FilterValue::Null) => (CompareOp::IsNotNull, FilterValue::Null),
            _ => (op, value),
        };
        Ok(FilterNode::compare(self.name.clone(), op, value))
    }
}

/// Access-control-derived filter clauses merged with every client filter.
///
/// The combiner joins the server clauses among themselves; the client filter
/// is always AND-joined to the result, so a client filter can narrow but
/// never widen what the server filters admit.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerFilterSpec {
    pub filters: Vec<FilterTriple>,
    #[serde(default)]
    pub combiner: FilterCombiner,
}

impl ServerFilterSpec {
    pub fn new(filters: Vec<FilterTriple>, combiner: FilterCombiner) -> Self {
        Self { filters, combiner }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn compile(&self) -> ApiResult<Option<FilterNode>> {
        if self.filters.is_empty() {
            return Ok(None);
        }
        let clauses = self
            .filters
            .iter()
            .map(|f| f.compile())
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(Some(match self.combiner {
            FilterCombiner::And => FilterNode::and(clauses),
            FilterCombiner::Or => FilterNode::or(clauses),
        }))
    }
}

/// Combine the compiled server-side filter with the client filter. The
/// combined criteria is what actually reaches the backend.
pub fn combine_filters(
    server: Option<&ServerFilterSpec>,
    client: Option<FilterNode>,
) -> ApiResult<Option<FilterNode>> {
    let server_node = match server {
        Some(spec) => spec.compile()?,
        None => None,
    };
    Ok(match (server_node, client) {
        (Some(s), Some(c)) => Some(FilterNode::and(vec![s, c])),
        (Some(s), None) => Some(s),
        (None, Some(c)) => Some(c),
        (None, None) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::filter_parser::parse_filter;
    use serde_json::json;

    #[test]
    fn test_compile_and_combiner() {
        let spec = ServerFilterSpec::new(
            vec![
                FilterTriple::new("owner_id", "=", json!(7)),
                FilterTriple::new("tenant", "=", json!("acme")),
            ],
            FilterCombiner::And,
        );
        match spec.compile().unwrap().unwrap() {
            FilterNode::And(clauses) => assert_eq!(clauses.len(), 2),
            other => panic!("Expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_client_filter_is_anded_in() {
        let spec = ServerFilterSpec::new(
            vec![FilterTriple::new("owner_id", "=", json!(7))],
            FilterCombiner::Or,
        );
        let client = parse_filter("age > 21", &serde_json::Map::new()).unwrap();
        match combine_filters(Some(&spec), client).unwrap().unwrap() {
            FilterNode::And(clauses) => assert_eq!(clauses.len(), 2),
            other => panic!("Client filter must AND with server filters, got {:?}", other),
        }
    }

    #[test]
    fn test_null_value_normalizes() {
        let spec = ServerFilterSpec::new(
            vec![FilterTriple::new("deleted_at", "=", Value::Null)],
            FilterCombiner::And,
        );
        assert_eq!(
            spec.compile().unwrap().unwrap(),
            FilterNode::compare("deleted_at", CompareOp::IsNull, FilterValue::Null)
        );
    }

    #[test]
    fn test_bad_operator_is_config_error() {
        let spec = ServerFilterSpec::new(
            vec![FilterTriple::new("a", "matches", json!(1))],
            FilterCombiner::And,
        );
        assert!(matches!(
            spec.compile().unwrap_err(),
            ApiError::Configuration(_)
        ));
    }
}
