//! `snake_case` naming convention for tables and columns.
//!
//! Every identifier that reaches a schema goes through
//! [`normalize_identifier`]. Normalized identifiers never contain the path
//! separator, so `a__b` is always a path of two components.

use crate::schema::DataType;

/// Joins path components of flattened columns and child tables.
pub const PATH_SEPARATOR: &str = "__";

/// Load id of the package that produced a row.
pub const LOAD_ID_COLUMN: &str = "_load_id";
/// Unique (or content-derived) row identity.
pub const ROW_ID_COLUMN: &str = "_row_id";
/// `_row_id` of the parent row, on child tables.
pub const PARENT_ID_COLUMN: &str = "_parent_id";
/// Zero-based position in the parent list, on child tables.
pub const LIST_IDX_COLUMN: &str = "_list_idx";
/// `_row_id` of the root row, on descendants of merge tables.
pub const ROOT_ID_COLUMN: &str = "_root_id";
/// Column receiving scalar items and list elements.
pub const VALUE_COLUMN: &str = "value";

/// Table holding synced pipeline state documents.
pub const STATE_TABLE: &str = "_pipeline_state";

/// Normalize a single identifier to `snake_case`.
///
/// `camelCase` boundaries become underscores, ASCII letters are lower-cased,
/// every other character becomes `_`, underscore runs collapse to one and a
/// leading digit gets a `_` prefix. The result is never empty.
#[must_use]
pub fn normalize_identifier(ident: &str) -> String {
    let chars: Vec<char> = ident.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|j| chars[j]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }

    if out.is_empty() {
        return "_".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Append an already normalized component to a path.
#[must_use]
pub fn make_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}{PATH_SEPARATOR}{child}")
    }
}

/// Name of the variant column holding values of `data_type` that do not fit
/// `column`.
#[must_use]
pub fn variant_column(column: &str, data_type: DataType) -> String {
    format!("{column}{PATH_SEPARATOR}v_{}", data_type.as_str())
}
