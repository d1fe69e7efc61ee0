use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{ApiError, ApiResult};
use crate::models::FieldType;
use crate::parser::{parse_order, ServerFilterSpec, SortSpec};

/// Requested output projection. `None` in the request means identifiers only.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldProjection {
    #[default]
    IdOnly,
    All,
    Some(Vec<String>),
}

impl FieldProjection {
    pub fn from_option(fields: Option<&str>) -> FieldProjection {
        match fields {
            None => FieldProjection::IdOnly,
            Some(s) if s.trim() == "*" => FieldProjection::All,
            Some(s) => {
                let list: Vec<String> = s
                    .split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect();
                if list.is_empty() {
                    FieldProjection::IdOnly
                } else {
                    FieldProjection::Some(list)
                }
            }
        }
    }
}

/// Eager-load request for one relation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedSpec {
    pub name: String,
    pub fields: FieldProjection,
    pub order: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum RelatedRequest {
    #[default]
    None,
    All,
    Some(Vec<RelatedSpec>),
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Every option a service call recognizes, with its default. Constructed
/// once per request from the query string, then optionally overlaid with
/// payload keys of the same names.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub fields: FieldProjection,
    pub ids: Vec<Value>,
    pub filter: Option<String>,
    pub params: Map<String, Value>,
    pub id_field: Option<Vec<String>>,
    pub id_type: Option<Vec<FieldType>>,
    pub limit: Option<u64>,
    pub offset: u64,
    pub order: Vec<SortSpec>,
    pub include_count: bool,
    pub include_schema: bool,
    pub rollback: bool,
    pub continue_on_error: bool,
    pub force: bool,
    pub use_native_batch: bool,
    pub related: RelatedRequest,
    pub names_only: bool,
    pub as_access_components: bool,
}

impl RequestOptions {
    pub fn from_query(query: &HashMap<String, String>) -> ApiResult<RequestOptions> {
        let mut opts = RequestOptions {
            fields: FieldProjection::from_option(query.get("fields").map(String::as_str)),
            ..Default::default()
        };

        if let Some(ids) = query.get("ids") {
            opts.ids = ids
                .split(',')
                .map(|id| Value::String(id.trim().to_string()))
                .filter(|id| id.as_str().is_some_and(|s| !s.is_empty()))
                .collect();
        }
        opts.filter = query.get("filter").cloned();
        if let Some(raw) = query.get("params") {
            let parsed: Value = serde_json::from_str(raw).map_err(|_| {
                ApiError::BadRequest("The 'params' option must be a JSON object.".to_string())
            })?;
            opts.params = parsed
                .as_object()
                .cloned()
                .ok_or_else(|| {
                    ApiError::BadRequest("The 'params' option must be a JSON object.".to_string())
                })?;
        }
        if let Some(raw) = query.get("id_field") {
            opts.id_field = Some(
                raw.split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect(),
            );
        }
        if let Some(raw) = query.get("id_type") {
            opts.id_type = Some(parse_id_types(raw)?);
        }
        if let Some(raw) = query.get("limit").or_else(|| query.get("top")) {
            let limit: u64 = raw.parse().map_err(|_| {
                ApiError::BadRequest(format!("Invalid 'limit' value '{}'.", raw))
            })?;
            if limit > 0 {
                opts.limit = Some(limit);
            }
        }
        if let Some(raw) = query.get("offset").or_else(|| query.get("skip")) {
            opts.offset = raw.parse().map_err(|_| {
                ApiError::BadRequest(format!("Invalid 'offset' value '{}'.", raw))
            })?;
        }
        if let Some(raw) = query.get("order").or_else(|| query.get("sort")) {
            opts.order = parse_order(raw);
        }
        opts.include_count = query.get("include_count").is_some_and(|v| parse_bool(v));
        opts.include_schema = query.get("include_schema").is_some_and(|v| parse_bool(v));
        opts.rollback = query.get("rollback").is_some_and(|v| parse_bool(v));
        opts.continue_on_error = query.get("continue").is_some_and(|v| parse_bool(v));
        opts.force = query.get("force").is_some_and(|v| parse_bool(v));
        opts.use_native_batch = query.get("batch").is_some_and(|v| parse_bool(v));
        opts.names_only = query.get("names_only").is_some_and(|v| parse_bool(v));
        opts.as_access_components = query
            .get("as_access_components")
            .is_some_and(|v| parse_bool(v));
        if let Some(raw) = query.get("related") {
            opts.related = parse_related(raw);
        }

        Ok(opts)
    }

    /// Payload keys of the same names override query-string values, matching
    /// the uniform call shape the resource layer presents.
    pub fn apply_payload_keys(&mut self, payload: &Value) -> ApiResult<()> {
        let Some(map) = payload.as_object() else {
            return Ok(());
        };

        if let Some(ids) = map.get("ids") {
            self.ids = match ids {
                Value::Array(items) => items.clone(),
                Value::String(s) => s
                    .split(',')
                    .map(|id| Value::String(id.trim().to_string()))
                    .collect(),
                other => vec![other.clone()],
            };
        }
        if let Some(Value::String(filter)) = map.get("filter") {
            self.filter = Some(filter.clone());
        }
        if let Some(Value::Object(params)) = map.get("params") {
            self.params = params.clone();
        }
        if let Some(Value::String(fields)) = map.get("fields") {
            self.fields = FieldProjection::from_option(Some(fields));
        }
        if let Some(Value::String(raw)) = map.get("id_field") {
            self.id_field = Some(raw.split(',').map(|f| f.trim().to_string()).collect());
        }
        if let Some(Value::String(raw)) = map.get("id_type") {
            self.id_type = Some(parse_id_types(raw)?);
        }
        if let Some(rollback) = map.get("rollback") {
            self.rollback = value_truthy(rollback);
        }
        if let Some(cont) = map.get("continue") {
            self.continue_on_error = value_truthy(cont);
        }
        if let Some(batch) = map.get("batch") {
            self.use_native_batch = value_truthy(batch);
        }
        if let Some(related) = map.get("related") {
            self.related = match related {
                Value::String(s) => parse_related(s),
                Value::Array(items) => {
                    let mut specs = Vec::new();
                    for item in items {
                        let Some(obj) = item.as_object() else {
                            return Err(ApiError::BadRequest(
                                "Entries of 'related' must be names or objects.".to_string(),
                            ));
                        };
                        let name = obj
                            .get("name")
                            .and_then(Value::as_str)
                            .ok_or_else(|| {
                                ApiError::BadRequest(
                                    "Related specs require a 'name'.".to_string(),
                                )
                            })?
                            .to_string();
                        specs.push(RelatedSpec {
                            name,
                            fields: match obj.get("fields").and_then(Value::as_str) {
                                Some(f) => FieldProjection::from_option(Some(f)),
                                None => FieldProjection::All,
                            },
                            order: obj.get("order").and_then(Value::as_str).map(String::from),
                        });
                    }
                    RelatedRequest::Some(specs)
                }
                _ => RelatedRequest::None,
            };
        }
        Ok(())
    }
}

fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => parse_bool(s),
        Value::Number(n) => n.as_i64().is_some_and(|i| i != 0),
        _ => false,
    }
}

fn parse_id_types(raw: &str) -> ApiResult<Vec<FieldType>> {
    raw.split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| {
            serde_json::from_value::<FieldType>(Value::String(t.to_string())).map_err(|_| {
                ApiError::BadRequest(format!("Unknown identifier type '{}'.", t))
            })
        })
        .collect()
}

fn parse_related(raw: &str) -> RelatedRequest {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return RelatedRequest::None;
    }
    if trimmed == "*" {
        return RelatedRequest::All;
    }
    RelatedRequest::Some(
        trimmed
            .split(',')
            .map(|name| RelatedSpec {
                name: name.trim().to_string(),
                fields: FieldProjection::All,
                order: None,
            })
            .filter(|spec| !spec.name.is_empty())
            .collect(),
    )
}

/// Caller identity and access-control filters resolved by the hosting
/// platform before the service method runs.
///
/// `server_filters` are merged into every query; `record_filters` guard
/// individual writes (evaluated against the parsed record).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user_id: Option<Value>,
    pub server_filters: Option<ServerFilterSpec>,
    pub record_filters: Option<ServerFilterSpec>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: Value) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let opts = RequestOptions::from_query(&HashMap::new()).unwrap();
        assert_eq!(opts.fields, FieldProjection::IdOnly);
        assert!(!opts.rollback);
        assert!(!opts.continue_on_error);
        assert_eq!(opts.limit, None);
        assert_eq!(opts.offset, 0);
    }

    #[test]
    fn test_fields_star_and_list() {
        let opts = RequestOptions::from_query(&query(&[("fields", "*")])).unwrap();
        assert_eq!(opts.fields, FieldProjection::All);
        let opts = RequestOptions::from_query(&query(&[("fields", "name, age")])).unwrap();
        assert_eq!(
            opts.fields,
            FieldProjection::Some(vec!["name".to_string(), "age".to_string()])
        );
    }

    #[test]
    fn test_limit_aliases() {
        let opts = RequestOptions::from_query(&query(&[("top", "25"), ("skip", "50")])).unwrap();
        assert_eq!(opts.limit, Some(25));
        assert_eq!(opts.offset, 50);
    }

    #[test]
    fn test_zero_limit_means_unlimited() {
        let opts = RequestOptions::from_query(&query(&[("limit", "0")])).unwrap();
        assert_eq!(opts.limit, None);
    }

    #[test]
    fn test_ids_comma_list() {
        let opts = RequestOptions::from_query(&query(&[("ids", "1, 2,3")])).unwrap();
        assert_eq!(opts.ids, vec![json!("1"), json!("2"), json!("3")]);
    }

    #[test]
    fn test_flags() {
        let opts = RequestOptions::from_query(&query(&[
            ("rollback", "true"),
            ("continue", "1"),
            ("include_count", "yes"),
        ]))
        .unwrap();
        assert!(opts.rollback);
        assert!(opts.continue_on_error);
        assert!(opts.include_count);
    }

    #[test]
    fn test_id_type_parsing() {
        let opts = RequestOptions::from_query(&query(&[("id_type", "string,integer")])).unwrap();
        assert_eq!(
            opts.id_type,
            Some(vec![FieldType::String, FieldType::Integer])
        );
        assert!(RequestOptions::from_query(&query(&[("id_type", "wat")])).is_err());
    }

    #[test]
    fn test_payload_overrides() {
        let mut opts = RequestOptions::from_query(&HashMap::new()).unwrap();
        opts.apply_payload_keys(&json!({
            "ids": [4, 5],
            "filter": "age > 1",
            "rollback": true,
            "related": [{"name": "orders", "fields": "total", "order": "total desc"}]
        }))
        .unwrap();
        assert_eq!(opts.ids, vec![json!(4), json!(5)]);
        assert_eq!(opts.filter.as_deref(), Some("age > 1"));
        assert!(opts.rollback);
        match &opts.related {
            RelatedRequest::Some(specs) => {
                assert_eq!(specs[0].name, "orders");
                assert_eq!(
                    specs[0].fields,
                    FieldProjection::Some(vec!["total".to_string()])
                );
            }
            other => panic!("Expected related specs, got {:?}", other),
        }
    }

    #[test]
    fn test_related_star() {
        let opts = RequestOptions::from_query(&query(&[("related", "*")])).unwrap();
        assert_eq!(opts.related, RelatedRequest::All);
    }
}
