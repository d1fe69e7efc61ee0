#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn from_str(s: &str) -> SortOrder {
        match s.to_lowercase().as_str() {
            "descending" | "desc" => SortOrder::Descending,
            _ => SortOrder::Ascending, // Default to ascending
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        SortSpec {
            field: field.into(),
            order,
        }
    }
}

/// Parse an `order`/`sort` option: a comma list of `field [asc|desc]`.
pub fn parse_order(order: &str) -> Vec<SortSpec> {
    order
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let mut pieces = part.split_whitespace();
            let field = pieces.next()?;
            let order = pieces
                .next()
                .map(SortOrder::from_str)
                .unwrap_or(SortOrder::Ascending);
            Some(SortSpec::new(field, order))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_order_from_str() {
        assert_eq!(SortOrder::from_str("ascending"), SortOrder::Ascending);
        assert_eq!(SortOrder::from_str("ASC"), SortOrder::Ascending);
        assert_eq!(SortOrder::from_str("descending"), SortOrder::Descending);
        assert_eq!(SortOrder::from_str("desc"), SortOrder::Descending);
        assert_eq!(SortOrder::from_str("invalid"), SortOrder::Ascending); // Default
    }

    #[test]
    fn test_parse_order_list() {
        let specs = parse_order("name desc, age");
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0], SortSpec::new("name", SortOrder::Descending));
        assert_eq!(specs[1], SortSpec::new("age", SortOrder::Ascending));
    }

    #[test]
    fn test_parse_order_empty() {
        assert!(parse_order("  ").is_empty());
    }
}
