//! JSON path expressions
//!
//! A path addresses a value inside one stored JSON document. The syntax is
//! the familiar dotted/bracket form:
//!
//! ```text
//! theme                 key
//! limits.retries        nested key
//! steps[2].name         array index, then key
//! labels["team.core"]   quoted key (may contain dots or brackets)
//! $                     the document root (also the empty string)
//! ```
//!
//! Backends never see this syntax; the storage layer compiles a parsed
//! [`JsonPath`] into whatever its engine understands.

use std::fmt;
use std::iter::Peekable;
use std::str::{Chars, FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CtxError, Result};

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    /// The container type this segment navigates into.
    pub fn container(&self) -> JsonType {
        match self {
            Segment::Key(_) => JsonType::Object,
            Segment::Index(_) => JsonType::Array,
        }
    }
}

/// Coarse JSON type, as reported by both backends' type-inspection functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsonType {
    Object,
    Array,
    String,
    Number,
    Bool,
    Null,
}

impl JsonType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Object(_) => JsonType::Object,
            Value::Array(_) => JsonType::Array,
            Value::String(_) => JsonType::String,
            Value::Number(_) => JsonType::Number,
            Value::Bool(_) => JsonType::Bool,
            Value::Null => JsonType::Null,
        }
    }

    /// Parse a type name from SQLite `json_type` or Postgres `jsonb_typeof`.
    pub fn from_backend_name(name: &str) -> Option<Self> {
        match name {
            "object" => Some(JsonType::Object),
            "array" => Some(JsonType::Array),
            "text" | "string" => Some(JsonType::String),
            "integer" | "real" | "number" => Some(JsonType::Number),
            "true" | "false" | "boolean" => Some(JsonType::Bool),
            "null" => Some(JsonType::Null),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JsonType::Object => "object",
            JsonType::Array => "array",
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Bool => "boolean",
            JsonType::Null => "null",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, JsonType::Object | JsonType::Array)
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed path expression. The empty path is the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

/// Outcome of walking a path through an in-memory value.
#[derive(Debug, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a Value),
    /// The segment at `depth` does not exist in its container.
    Missing { depth: usize },
    /// The value reached before `depth` is not the container the segment needs.
    Blocked { depth: usize, found: JsonType },
}

impl JsonPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Single-key path.
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Key(key.into())],
        }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn child(mut self, key: impl Into<String>) -> Self {
        self.segments.push(Segment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.segments.push(Segment::Index(index));
        self
    }

    /// Append every segment of `other`.
    pub fn join(mut self, other: &JsonPath) -> Self {
        self.segments.extend(other.segments.iter().cloned());
        self
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The first `depth` segments.
    pub fn prefix(&self, depth: usize) -> JsonPath {
        JsonPath {
            segments: self.segments[..depth.min(self.segments.len())].to_vec(),
        }
    }

    pub fn parent(&self) -> Option<JsonPath> {
        if self.segments.is_empty() {
            None
        } else {
            Some(self.prefix(self.segments.len() - 1))
        }
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Parse a dotted/bracket expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let body = match expr.strip_prefix('$') {
            Some(rest) => rest.strip_prefix('.').unwrap_or(rest),
            None => expr,
        };
        if body.is_empty() {
            return Ok(Self::root());
        }

        let mut parser = Parser {
            expr,
            chars: body.chars().peekable(),
        };
        let mut segments = Vec::new();
        let mut expect_key = true;

        while let Some(c) = parser.chars.peek().copied() {
            match c {
                '[' => {
                    if expect_key && !segments.is_empty() {
                        return Err(parser.error("expected key after '.'"));
                    }
                    segments.push(parser.bracket()?);
                    expect_key = false;
                }
                '.' => {
                    if expect_key {
                        return Err(parser.error("empty key"));
                    }
                    parser.chars.next();
                    expect_key = true;
                }
                _ => {
                    if !expect_key {
                        return Err(parser.error(&format!("unexpected character {c:?}")));
                    }
                    let key = parser.bare_key();
                    if key.is_empty() {
                        return Err(parser.error(&format!("unexpected character {c:?}")));
                    }
                    segments.push(Segment::Key(key));
                    expect_key = false;
                }
            }
        }

        if expect_key {
            return Err(parser.error("trailing '.'"));
        }
        Ok(Self { segments })
    }

    /// Walk the path through `value`.
    pub fn lookup<'a>(&self, value: &'a Value) -> Lookup<'a> {
        let mut current = value;
        for (depth, segment) in self.segments.iter().enumerate() {
            let next = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key),
                (Segment::Index(index), Value::Array(items)) => items.get(*index),
                (_, other) => {
                    return Lookup::Blocked {
                        depth,
                        found: JsonType::of(other),
                    }
                }
            };
            match next {
                Some(found) => current = found,
                None => return Lookup::Missing { depth },
            }
        }
        Lookup::Found(current)
    }

    /// Walk the path and turn misses into `PathNotFound` / `TypeMismatch`.
    pub fn resolve<'a>(&self, value: &'a Value) -> Result<&'a Value> {
        match self.lookup(value) {
            Lookup::Found(found) => Ok(found),
            Lookup::Missing { .. } => Err(CtxError::PathNotFound(self.to_string())),
            Lookup::Blocked { depth, found } => Err(self.mismatch_at(depth, found)),
        }
    }

    /// The error for a non-container value sitting where segment `depth` needs one.
    pub fn mismatch_at(&self, depth: usize, found: JsonType) -> CtxError {
        let expected = self
            .segments
            .get(depth)
            .map(|segment| segment.container().as_str())
            .unwrap_or("container");
        CtxError::TypeMismatch {
            path: self.prefix(depth).to_string(),
            expected,
            found: found.as_str(),
        }
    }
}

impl FromStr for JsonPath {
    type Err = CtxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("$");
        }
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(key) if is_bare_key(key) => {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(key)?;
                }
                Segment::Key(key) => {
                    f.write_str("[\"")?;
                    for c in key.chars() {
                        if c == '"' || c == '\\' {
                            f.write_str("\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                    f.write_str("\"]")?;
                }
                Segment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

/// Keys that round-trip through the dotted form without quoting.
pub fn is_bare_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

struct Parser<'a> {
    expr: &'a str,
    chars: Peekable<Chars<'a>>,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> CtxError {
        CtxError::InvalidPath {
            expr: self.expr.to_string(),
            reason: reason.to_string(),
        }
    }

    fn bare_key(&mut self) -> String {
        let mut key = String::new();
        while let Some(&c) = self.chars.peek() {
            if matches!(c, '.' | '[' | ']') {
                break;
            }
            key.push(c);
            self.chars.next();
        }
        key
    }

    fn bracket(&mut self) -> Result<Segment> {
        self.chars.next();
        let segment = match self.chars.peek().copied() {
            Some(quote @ ('"' | '\'')) => {
                self.chars.next();
                let mut key = String::new();
                loop {
                    match self.chars.next() {
                        None => return Err(self.error("unterminated quoted key")),
                        Some('\\') => match self.chars.next() {
                            Some(escaped) => key.push(escaped),
                            None => return Err(self.error("dangling escape")),
                        },
                        Some(c) if c == quote => break,
                        Some(c) => key.push(c),
                    }
                }
                Segment::Key(key)
            }
            Some(c) if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&d) = self.chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    self.chars.next();
                }
                let index = digits
                    .parse()
                    .map_err(|_| self.error("array index out of range"))?;
                Segment::Index(index)
            }
            _ => return Err(self.error("expected index or quoted key after '['")),
        };
        match self.chars.next() {
            Some(']') => Ok(segment),
            _ => Err(self.error("missing ']'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn key(k: &str) -> Segment {
        Segment::Key(k.to_string())
    }

    #[rstest]
    #[case("", vec![])]
    #[case("$", vec![])]
    #[case("theme", vec![key("theme")])]
    #[case("limits.retries", vec![key("limits"), key("retries")])]
    #[case("steps[2].name", vec![key("steps"), Segment::Index(2), key("name")])]
    #[case("labels[\"team.core\"]", vec![key("labels"), key("team.core")])]
    #[case("labels['a]b']", vec![key("labels"), key("a]b")])]
    #[case("[0][1]", vec![Segment::Index(0), Segment::Index(1)])]
    #[case("$.a.b", vec![key("a"), key("b")])]
    fn test_parse_valid(#[case] expr: &str, #[case] expected: Vec<Segment>) {
        let path = JsonPath::parse(expr).unwrap();
        assert_eq!(path.segments(), expected.as_slice());
    }

    #[rstest]
    #[case(".a")]
    #[case("a.")]
    #[case("a..b")]
    #[case("a[")]
    #[case("a[x]")]
    #[case("a[0]b")]
    #[case("a.[0]")]
    #[case("a[\"unterminated]")]
    #[case("a]")]
    fn test_parse_invalid(#[case] expr: &str) {
        let err = JsonPath::parse(expr).unwrap_err();
        assert!(matches!(err, CtxError::InvalidPath { .. }), "{expr}: {err}");
    }

    #[test]
    fn test_display_round_trip() {
        for expr in ["a.b[3]", "labels[\"team.core\"].owner", "$"] {
            let path = JsonPath::parse(expr).unwrap();
            assert_eq!(JsonPath::parse(&path.to_string()).unwrap(), path);
        }
        assert_eq!(JsonPath::root().child("a").index(0).to_string(), "a[0]");
    }

    #[test]
    fn test_lookup_distinguishes_null_from_missing() {
        let doc = json!({"a": {"b": null}, "list": [1, 2]});

        let present = JsonPath::parse("a.b").unwrap();
        assert_eq!(present.lookup(&doc), Lookup::Found(&Value::Null));

        let absent = JsonPath::parse("a.c").unwrap();
        assert_eq!(absent.lookup(&doc), Lookup::Missing { depth: 1 });
        assert!(matches!(
            absent.resolve(&doc),
            Err(CtxError::PathNotFound(_))
        ));
    }

    #[test]
    fn test_lookup_blocked_by_scalar() {
        let doc = json!({"theme": "dark"});
        let path = JsonPath::parse("theme.color").unwrap();
        assert_eq!(
            path.lookup(&doc),
            Lookup::Blocked {
                depth: 1,
                found: JsonType::String
            }
        );
        match path.resolve(&doc).unwrap_err() {
            CtxError::TypeMismatch {
                path,
                expected,
                found,
            } => {
                assert_eq!(path, "theme");
                assert_eq!(expected, "object");
                assert_eq!(found, "string");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_index_into_object_is_mismatch() {
        let doc = json!({"a": {"b": 1}});
        let path = JsonPath::parse("a[0]").unwrap();
        assert!(matches!(
            path.resolve(&doc),
            Err(CtxError::TypeMismatch { expected: "array", .. })
        ));
    }

    #[test]
    fn test_backend_type_names() {
        assert_eq!(JsonType::from_backend_name("text"), Some(JsonType::String));
        assert_eq!(JsonType::from_backend_name("integer"), Some(JsonType::Number));
        assert_eq!(JsonType::from_backend_name("boolean"), Some(JsonType::Bool));
        assert_eq!(JsonType::from_backend_name("false"), Some(JsonType::Bool));
        assert_eq!(JsonType::from_backend_name("blob"), None);
    }
}
