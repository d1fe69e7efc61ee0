use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::parser::{CompareOp, FilterNode, FilterValue};

/// Placeholder syntax differs between engines: PostgreSQL numbers its
/// parameters (`$1`), SQLite takes positional `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    pub fn from_url(url: &str) -> ApiResult<SqlDialect> {
        if url.starts_with("sqlite:") {
            Ok(SqlDialect::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(SqlDialect::Postgres)
        } else {
            Err(ApiError::Configuration(format!(
                "Unrecognized SQL connection URL '{}'.",
                url
            )))
        }
    }

    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Sqlite => "?".to_string(),
            SqlDialect::Postgres => format!("${}", index),
        }
    }
}

/// Reject anything that is not a plain identifier before it is interpolated
/// into SQL; values always travel as bound parameters.
pub fn quote_ident(name: &str) -> ApiResult<String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().unwrap().is_ascii_digit();
    if !valid {
        return Err(ApiError::BadRequest(format!(
            "Invalid field or table name '{}'.",
            name
        )));
    }
    Ok(format!("\"{}\"", name))
}

/// Compiles a filter AST into a parameterized WHERE clause.
pub struct SqlFilterCompiler {
    dialect: SqlDialect,
}

impl SqlFilterCompiler {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    /// Returns the clause text; bound values are appended to `params` in
    /// placeholder order.
    pub fn compile(&self, node: &FilterNode, params: &mut Vec<Value>) -> ApiResult<String> {
        match node {
            FilterNode::And(nodes) => self.join(nodes, " AND ", params),
            FilterNode::Or(nodes) => self.join(nodes, " OR ", params),
            FilterNode::Not(inner) => {
                let inner_sql = self.compile(inner, params)?;
                Ok(format!("NOT ({})", inner_sql))
            }
            FilterNode::Compare { field, op, value } => self.compare(field, *op, value, params),
        }
    }

    fn join(
        &self,
        nodes: &[FilterNode],
        sep: &str,
        params: &mut Vec<Value>,
    ) -> ApiResult<String> {
        let parts = nodes
            .iter()
            .map(|n| self.compile(n, params))
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(format!("({})", parts.join(sep)))
    }

    fn push(&self, params: &mut Vec<Value>, value: Value) -> String {
        params.push(value);
        self.dialect.placeholder(params.len())
    }

    fn compare(
        &self,
        field: &str,
        op: CompareOp,
        value: &FilterValue,
        params: &mut Vec<Value>,
    ) -> ApiResult<String> {
        let ident = quote_ident(field)?;
        match op {
            CompareOp::Eq
            | CompareOp::Ne
            | CompareOp::Gt
            | CompareOp::Gte
            | CompareOp::Lt
            | CompareOp::Lte => {
                let ph = self.push(params, value.to_json());
                Ok(format!("{} {} {}", ident, sql_op(op), ph))
            }
            CompareOp::IsNull => Ok(format!("{} IS NULL", ident)),
            CompareOp::IsNotNull => Ok(format!("{} IS NOT NULL", ident)),
            CompareOp::In => {
                let FilterValue::List(items) = value else {
                    return Err(ApiError::BadRequest(
                        "IN requires a value list.".to_string(),
                    ));
                };
                if items.is_empty() {
                    return Err(ApiError::BadRequest(
                        "IN requires at least one value.".to_string(),
                    ));
                }
                let placeholders = items
                    .iter()
                    .map(|item| self.push(params, item.to_json()))
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(format!("{} IN ({})", ident, placeholders))
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
                let low = self.push(params, bounds[0].to_json());
                let high = self.push(params, bounds[1].to_json());
                Ok(format!("{} BETWEEN {} AND {}", ident, low, high))
            }
            CompareOp::Like => {
                let pattern = string_value(value, "LIKE")?;
                let ph = self.push(params, Value::String(pattern));
                Ok(format!("{} LIKE {}", ident, ph))
            }
            CompareOp::Contains => {
                let text = string_value(value, "CONTAINS")?;
                let ph = self.push(params, Value::String(format!("%{}%", text)));
                Ok(format!("{} LIKE {}", ident, ph))
            }
            CompareOp::NotContains => {
                let text = string_value(value, "NOT_CONTAINS")?;
                let ph = self.push(params, Value::String(format!("%{}%", text)));
                Ok(format!("{} NOT LIKE {}", ident, ph))
            }
            CompareOp::StartsWith => {
                let text = string_value(value, "BEGINS_WITH")?;
                let ph = self.push(params, Value::String(format!("{}%", text)));
                Ok(format!("{} LIKE {}", ident, ph))
            }
            CompareOp::EndsWith => {
                let text = string_value(value, "ENDS_WITH")?;
                let ph = self.push(params, Value::String(format!("%{}", text)));
                Ok(format!("{} LIKE {}", ident, ph))
            }
        }
    }
}

fn sql_op(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "!=",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
        _ => unreachable!("handled separately"),
    }
}

fn string_value(value: &FilterValue, op: &str) -> ApiResult<String> {
    match value {
        FilterValue::Str(s) => Ok(s.clone()),
        other => Err(ApiError::BadRequest(format!(
            "{} requires a string value, got {:?}.",
            op, other
        ))),
    }
}
