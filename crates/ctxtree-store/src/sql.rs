//! SQL fragments shared by the backends
//!
//! SQLite JSON functions take a `$."key"[0]` string. Postgres `#>`,
//! `jsonb_set` and `#-` take a `text[]` whose elements are keys or decimal
//! array indexes.

use ctxtree_core::{CtxError, JsonPath, RecordFilter, Result, Segment};

/// `WHERE` clause matching one record key; parameters 1 to 4 in key order.
#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
pub const SQLITE_KEY_WHERE: &str =
    "WHERE kind = ?1 AND project_id = ?2 AND task_tree_id = ?3 AND task_id = ?4";

#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
pub const POSTGRES_KEY_WHERE: &str =
    "WHERE kind = $1 AND project_id = $2 AND task_tree_id = $3 AND task_id = $4";

/// `$."a"."b"[0]`. Keys are always quoted; SQLite has no escape for `"`
/// inside a quoted key, so such keys are rejected.
#[cfg_attr(not(feature = "sqlite"), allow(dead_code))]
pub fn sqlite_path(path: &JsonPath) -> Result<String> {
    let mut out = String::from("$");
    for segment in path.segments() {
        match segment {
            Segment::Key(key) => {
                if key.contains('"') {
                    return Err(CtxError::InvalidPath {
                        expr: path.to_string(),
                        reason: "keys containing '\"' are not addressable on sqlite".into(),
                    });
                }
                out.push_str(".\"");
                out.push_str(key);
                out.push('"');
            }
            Segment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    Ok(out)
}

/// `{a,b,0}` as a parameter vector.
#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
pub fn postgres_path(path: &JsonPath) -> Vec<String> {
    path.segments()
        .iter()
        .map(|segment| match segment {
            Segment::Key(key) => key.clone(),
            Segment::Index(index) => index.to_string(),
        })
        .collect()
}

/// `WHERE` clause for a filter plus its text parameters, in order.
/// `placeholder(n)` renders the n-th (1-based) parameter marker.
pub fn filter_clause(
    filter: &RecordFilter,
    placeholder: impl Fn(usize) -> String,
) -> (String, Vec<String>) {
    let columns = [
        ("kind", filter.kind.map(|kind| kind.as_str().to_string())),
        ("project_id", filter.project_id.clone()),
        ("task_tree_id", filter.task_tree_id.clone()),
        ("task_id", filter.task_id.clone()),
    ];
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    for (column, value) in columns {
        if let Some(value) = value {
            values.push(value);
            clauses.push(format!("{} = {}", column, placeholder(values.len())));
        }
    }
    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}
