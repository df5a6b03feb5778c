use crate::error::{Result, TetherError};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Segment marking "every element of the array at this position".
pub const WILDCARD: &str = "$";

/// One segment of a declared foreign key path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Field(String),
    Wildcard,
}

/// A dotted, array-aware field path such as `author`, `favoriteBooks.$` or `items.$.book`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for part in raw.split('.') {
            if part.is_empty() {
                return Err(TetherError::Configuration(format!(
                    "Invalid field path '{raw}': empty segment"
                )));
            }
            if part == WILDCARD {
                segments.push(PathSegment::Wildcard);
            } else if part.starts_with('$') {
                return Err(TetherError::Configuration(format!(
                    "Invalid field path '{raw}': '{part}' is not a field name"
                )));
            } else {
                segments.push(PathSegment::Field(part.to_string()));
            }
        }
        match segments.first() {
            Some(PathSegment::Field(_)) => Ok(FieldPath { segments }),
            _ => Err(TetherError::Configuration(format!(
                "Invalid field path '{raw}': must start with a field name"
            ))),
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn wildcard_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, PathSegment::Wildcard))
            .count()
    }

    /// Whether the path traverses an array (contains a wildcard segment)
    pub fn is_array(&self) -> bool {
        self.wildcard_count() > 0
    }

    pub fn ends_with_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(PathSegment::Wildcard))
    }

    /// The path as a filter query key: wildcards dropped, since queries match array elements implicitly.
    pub fn query_path(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                PathSegment::Field(name) => Some(name.as_str()),
                PathSegment::Wildcard => None,
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Split around the first wildcard: `items.$.book` -> (`items`, Some(`book`)), `tags.$` -> (`tags`, None)
    pub fn split_at_wildcard(&self) -> Option<(String, Option<String>)> {
        let pos = self
            .segments
            .iter()
            .position(|s| matches!(s, PathSegment::Wildcard))?;
        let prefix = join_segments(&self.segments[..pos]);
        let rest = &self.segments[pos + 1..];
        let rest = if rest.is_empty() {
            None
        } else {
            Some(join_segments(rest))
        };
        Some((prefix, rest))
    }

    /// Collect every value present at this path. Wildcards fan out over arrays; missing values are skipped.
    pub fn values_in<'v>(&self, doc: &'v Value) -> Vec<&'v Value> {
        let mut out = Vec::new();
        collect_values(doc, &self.segments, &mut out);
        out
    }
}

fn join_segments(segments: &[PathSegment]) -> String {
    segments
        .iter()
        .map(|s| match s {
            PathSegment::Field(name) => name.as_str(),
            PathSegment::Wildcard => WILDCARD,
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn collect_values<'v>(value: &'v Value, segments: &[PathSegment], out: &mut Vec<&'v Value>) {
    let Some((head, tail)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match head {
        PathSegment::Field(name) => {
            if let Some(next) = value.as_object().and_then(|obj| obj.get(name)) {
                collect_values(next, tail, out);
            }
        }
        PathSegment::Wildcard => {
            if let Some(items) = value.as_array() {
                for item in items {
                    collect_values(item, tail, out);
                }
            }
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_segments(&self.segments))
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One step of the traversal position inside a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackItem {
    Field(String),
    Index(usize),
}

/// Traversal position used to recognise foreign key locations
pub type Stack = Vec<StackItem>;

/// Turn a traversal stack into a foreign key name; array indices become wildcards.
pub fn stack_to_key(stack: &[StackItem]) -> String {
    stack
        .iter()
        .map(|item| match item {
            StackItem::Field(name) => name.as_str(),
            StackItem::Index(_) => WILDCARD,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Same as [`stack_to_key`] with array positions removed, for comparison against query paths.
pub fn stack_to_query_path(stack: &[StackItem]) -> String {
    stack
        .iter()
        .filter_map(|item| match item {
            StackItem::Field(name) => Some(name.as_str()),
            StackItem::Index(_) => None,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Push a possibly dotted filter key (`a.0.b`) onto a stack.
pub fn push_dotted(stack: &mut Stack, key: &str) {
    for part in key.split('.') {
        match part.parse::<usize>() {
            Ok(index) => stack.push(StackItem::Index(index)),
            Err(_) if part == WILDCARD => stack.push(StackItem::Index(0)),
            Err(_) => stack.push(StackItem::Field(part.to_string())),
        }
    }
}
