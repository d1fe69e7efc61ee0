use serde_json::{Map, Value};

use crate::error::{ApiError, ApiResult};
use crate::parser::ast::{CompareOp, FilterNode, FilterValue};
use crate::parser::token::{tokenize, Sym, Token};

/// Hook for resolving bare (unquoted, non-numeric) value tokens before they
/// fall back to literal strings. The hosting platform wires its own
/// substitution service in; the default resolves nothing.
pub trait LookupResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<Value>;
}

/// Parse a textual filter into an AST. Empty or whitespace-only input is no
/// filter at all.
pub fn parse_filter(input: &str, params: &Map<String, Value>) -> ApiResult<Option<FilterNode>> {
    parse_filter_with_lookup(input, params, None)
}

pub fn parse_filter_with_lookup(
    input: &str,
    params: &Map<String, Value>,
    lookup: Option<&dyn LookupResolver>,
) -> ApiResult<Option<FilterNode>> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        params,
        lookup,
        input,
    };
    let node = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ApiError::BadRequest(format!(
            "Unexpected trailing input in filter: {}",
            input
        )));
    }
    Ok(Some(node))
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a Map<String, Value>,
    lookup: Option<&'a dyn LookupResolver>,
    input: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_symbol(&mut self, sym: Sym) -> ApiResult<()> {
        match self.next() {
            Some(Token::Symbol(s)) if s == sym => Ok(()),
            other => Err(ApiError::BadRequest(format!(
                "Malformed filter '{}': expected {:?}, found {:?}.",
                self.input, sym, other
            ))),
        }
    }

    // Precedence: or < and < not < comparison.
    fn parse_or(&mut self) -> ApiResult<FilterNode> {
        let mut nodes = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            nodes.push(self.parse_and()?);
        }
        Ok(FilterNode::or(nodes))
    }

    fn parse_and(&mut self) -> ApiResult<FilterNode> {
        let mut nodes = vec![self.parse_unary()?];
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            nodes.push(self.parse_unary()?);
        }
        Ok(FilterNode::and(nodes))
    }

    fn parse_unary(&mut self) -> ApiResult<FilterNode> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            return Ok(FilterNode::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ApiResult<FilterNode> {
        if matches!(self.peek(), Some(Token::Symbol(Sym::LParen))) {
            self.next();
            let node = self.parse_or()?;
            self.expect_symbol(Sym::RParen)?;
            return Ok(node);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ApiResult<FilterNode> {
        let field = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(ApiError::BadRequest(format!(
                    "Malformed filter '{}': expected a field name, found {:?}.",
                    self.input, other
                )))
            }
        };

        let op = match self.next() {
            Some(Token::Symbol(Sym::Eq)) => CompareOp::Eq,
            Some(Token::Symbol(Sym::Ne)) => CompareOp::Ne,
            Some(Token::Symbol(Sym::Gt)) => CompareOp::Gt,
            Some(Token::Symbol(Sym::Gte)) => CompareOp::Gte,
            Some(Token::Symbol(Sym::Lt)) => CompareOp::Lt,
            Some(Token::Symbol(Sym::Lte)) => CompareOp::Lte,
            Some(Token::Ident(word)) => CompareOp::from_keyword(&word).ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Unsupported comparison operator '{}' in filter.",
                    word
                ))
            })?,
            other => {
                return Err(ApiError::BadRequest(format!(
                    "Malformed filter '{}': expected an operator after '{}', found {:?}.",
                    self.input, field, other
                )))
            }
        };

        match op {
            CompareOp::In => {
                self.expect_symbol(Sym::LParen)?;
                let mut values = vec![self.parse_value()?];
                while matches!(self.peek(), Some(Token::Symbol(Sym::Comma))) {
                    self.next();
                    values.push(self.parse_value()?);
                }
                self.expect_symbol(Sym::RParen)?;
                Ok(FilterNode::compare(field, CompareOp::In, FilterValue::List(values)))
            }
            CompareOp::Between => {
                let low = self.parse_value()?;
                match self.next() {
                    Some(Token::And) => {}
                    other => {
                        return Err(ApiError::BadRequest(format!(
                            "Malformed filter '{}': BETWEEN requires 'and', found {:?}.",
                            self.input, other
                        )))
                    }
                }
                let high = self.parse_value()?;
                Ok(FilterNode::compare(
                    field,
                    CompareOp::Between,
                    FilterValue::List(vec![low, high]),
                ))
            }
            _ => {
                let value = self.parse_value()?;
                // Equality against null has no native semantics on several
                // backends; normalize to explicit null-existence operators.
                let (op, value) = match (op, &value) {
                    (CompareOp::Eq, FilterValue::Null) => (CompareOp::IsNull, FilterValue::Null),
                    (CompareOp::Ne, FilterValue::Null) => (CompareOp::IsNotNull, FilterValue::Null),
                    _ => (op, value),
                };
                Ok(FilterNode::compare(field, op, value))
            }
        }
    }

    fn parse_value(&mut self) -> ApiResult<FilterValue> {
        match self.next() {
            Some(Token::Str(s)) => Ok(FilterValue::Str(s)),
            Some(Token::Number(raw)) => Ok(type_number(&raw)),
            Some(Token::Param(name)) => match self.params.get(&name) {
                Some(value) => FilterValue::from_json(value),
                None => Err(ApiError::BadRequest(format!(
                    "Filter references unknown parameter ':{}'.",
                    name
                ))),
            },
            Some(Token::Ident(word)) => match word.to_lowercase().as_str() {
                "true" => Ok(FilterValue::Bool(true)),
                "false" => Ok(FilterValue::Bool(false)),
                "null" => Ok(FilterValue::Null),
                _ => {
                    if let Some(resolved) = self.lookup.and_then(|l| l.resolve(&word)) {
                        return FilterValue::from_json(&resolved);
                    }
                    // Unquoted bare tokens fall back to literal strings.
                    Ok(FilterValue::Str(word))
                }
            },
            other => Err(ApiError::BadRequest(format!(
                "Malformed filter '{}': expected a value, found {:?}.",
                self.input, other
            ))),
        }
    }
}

/// Numeric literals keep int typing only when the text survives an exact
/// round trip through integer parsing; everything else becomes a float.
fn type_number(raw: &str) -> FilterValue {
    if let Ok(i) = raw.parse::<i64>() {
        if i.to_string() == raw {
            return FilterValue::Int(i);
        }
    }
    match raw.parse::<f64>() {
        Ok(f) => FilterValue::Float(f),
        Err(_) => FilterValue::Str(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(input: &str) -> FilterNode {
        parse_filter(input, &Map::new()).unwrap().unwrap()
    }

    #[test]
    fn test_simple_equality() {
        assert_eq!(
            parse("name = 'john'"),
            FilterNode::compare("name", CompareOp::Eq, FilterValue::Str("john".to_string()))
        );
    }

    #[test]
    fn test_word_operators() {
        assert_eq!(
            parse("age gte 21"),
            FilterNode::compare("age", CompareOp::Gte, FilterValue::Int(21))
        );
        assert_eq!(
            parse("name begins_with 'jo'"),
            FilterNode::compare("name", CompareOp::StartsWith, FilterValue::Str("jo".to_string()))
        );
    }

    #[test]
    fn test_empty_filter_is_none() {
        assert!(parse_filter("   ", &Map::new()).unwrap().is_none());
    }

    #[test]
    fn test_and_precedence_over_or() {
        // a = 1 or b = 2 and c = 3  →  Or(a, And(b, c))
        match parse("a = 1 or b = 2 and c = 3") {
            FilterNode::Or(branches) => {
                assert_eq!(branches.len(), 2);
                assert!(matches!(branches[1], FilterNode::And(_)));
            }
            other => panic!("Expected Or at top level, got {:?}", other),
        }
    }

    #[test]
    fn test_parentheses_override_precedence() {
        match parse("(a = 1 or b = 2) and c = 3") {
            FilterNode::And(conjuncts) => {
                assert_eq!(conjuncts.len(), 2);
                assert!(matches!(conjuncts[0], FilterNode::Or(_)));
            }
            other => panic!("Expected And at top level, got {:?}", other),
        }
    }

    #[test]
    fn test_not() {
        match parse("not active = true") {
            FilterNode::Not(inner) => assert_eq!(
                *inner,
                FilterNode::compare("active", CompareOp::Eq, FilterValue::Bool(true))
            ),
            other => panic!("Expected Not, got {:?}", other),
        }
    }

    #[test]
    fn test_and_flattens_into_clause_set() {
        match parse("a = 1 and b = 2 and c = 3") {
            FilterNode::And(conjuncts) => assert_eq!(conjuncts.len(), 3),
            other => panic!("Expected flat And, got {:?}", other),
        }
    }

    #[test]
    fn test_between() {
        assert_eq!(
            parse("age between 18 and 30"),
            FilterNode::compare(
                "age",
                CompareOp::Between,
                FilterValue::List(vec![FilterValue::Int(18), FilterValue::Int(30)])
            )
        );
    }

    #[test]
    fn test_between_binds_tighter_than_conjunction() {
        match parse("a between 1 and 10 or b = 2") {
            FilterNode::Or(branches) => {
                assert_eq!(branches.len(), 2);
                assert!(matches!(
                    branches[0],
                    FilterNode::Compare { op: CompareOp::Between, .. }
                ));
            }
            other => panic!("Expected Or, got {:?}", other),
        }
    }

    #[test]
    fn test_in_list() {
        assert_eq!(
            parse("color in ('red', 'blue')"),
            FilterNode::compare(
                "color",
                CompareOp::In,
                FilterValue::List(vec![
                    FilterValue::Str("red".to_string()),
                    FilterValue::Str("blue".to_string())
                ])
            )
        );
    }

    #[test]
    fn test_null_equality_normalizes() {
        assert_eq!(
            parse("deleted_at = null"),
            FilterNode::compare("deleted_at", CompareOp::IsNull, FilterValue::Null)
        );
        assert_eq!(
            parse("deleted_at != null"),
            FilterNode::compare("deleted_at", CompareOp::IsNotNull, FilterValue::Null)
        );
    }

    #[test]
    fn test_number_typing_round_trip() {
        assert_eq!(
            parse("n = 42"),
            FilterNode::compare("n", CompareOp::Eq, FilterValue::Int(42))
        );
        assert_eq!(
            parse("n = 4.5"),
            FilterNode::compare("n", CompareOp::Eq, FilterValue::Float(4.5))
        );
        // leading zeros fail the int round trip
        assert_eq!(
            parse("n = 007"),
            FilterNode::compare("n", CompareOp::Eq, FilterValue::Float(7.0))
        );
    }

    #[test]
    fn test_bound_parameter() {
        let mut params = Map::new();
        params.insert("min".to_string(), json!(21));
        let node = parse_filter("age >= :min", &params).unwrap().unwrap();
        assert_eq!(
            node,
            FilterNode::compare("age", CompareOp::Gte, FilterValue::Int(21))
        );
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let err = parse_filter("age >= :min", &Map::new()).unwrap_err();
        assert!(err.to_string().contains(":min"));
    }

    #[test]
    fn test_bare_token_falls_back_to_string() {
        assert_eq!(
            parse("status = open"),
            FilterNode::compare("status", CompareOp::Eq, FilterValue::Str("open".to_string()))
        );
    }

    struct FixedLookup;
    impl LookupResolver for FixedLookup {
        fn resolve(&self, token: &str) -> Option<Value> {
            (token == "current_region").then(|| json!("eu-west-1"))
        }
    }

    #[test]
    fn test_lookup_substitution() {
        let node = parse_filter_with_lookup("region = current_region", &Map::new(), Some(&FixedLookup))
            .unwrap()
            .unwrap();
        assert_eq!(
            node,
            FilterNode::compare("region", CompareOp::Eq, FilterValue::Str("eu-west-1".to_string()))
        );
    }

    #[test]
    fn test_unsupported_operator_is_client_error() {
        let err = parse_filter("a regexp 'x'", &Map::new()).unwrap_err();
        match err {
            ApiError::BadRequest(msg) => assert!(msg.contains("regexp")),
            other => panic!("Expected BadRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(parse_filter("a = 1 b = 2", &Map::new()).is_err());
    }
}
