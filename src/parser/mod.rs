pub mod ast;
pub mod filter_parser;
pub mod server_filter;
pub mod sort_parser;
pub mod token;

pub use ast::{CompareOp, FilterNode, FilterValue};
pub use filter_parser::{parse_filter, parse_filter_with_lookup, LookupResolver};
pub use server_filter::{combine_filters, FilterCombiner, FilterTriple, ServerFilterSpec};
pub use sort_parser::{parse_order, SortOrder, SortSpec};
