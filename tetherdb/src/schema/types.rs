use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level schema: collection name -> collection definition.
///
/// ```yaml
/// Author:
///   foreign:
///     favoriteBooks.$: { collection: Book, onDelete: PULL }
/// Book:
///   foreign:
///     author: { collection: Author, onDelete: REMOVE }
/// ```
pub type Schema = BTreeMap<String, CollectionDefinition>;

/// Definition of a single collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionDefinition {
    /// Primary key field; the store's native identity field when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    /// Foreign key declarations keyed by field path (`a.b`, `list.$`, `list.$.ref`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub foreign: BTreeMap<String, ForeignKeyDefinition>,
}

/// A single foreign key declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ForeignKeyDefinition {
    pub collection: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub on_insert: InsertPolicy,
    #[serde(default)]
    pub on_delete: DeletePolicy,
}

impl ForeignKeyDefinition {
    pub fn new(collection: impl Into<String>) -> Self {
        ForeignKeyDefinition {
            collection: collection.into(),
            nullable: false,
            optional: false,
            on_insert: InsertPolicy::default(),
            on_delete: DeletePolicy::default(),
        }
    }

    pub fn on_delete(mut self, policy: DeletePolicy) -> Self {
        self.on_delete = policy;
        self
    }

    pub fn on_insert(mut self, policy: InsertPolicy) -> Self {
        self.on_insert = policy;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }
}

/// What happens to foreign key values when a document is inserted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsertPolicy {
    Bypass,
    #[default]
    Verify,
}

/// What happens to referencing documents when a referenced document is deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletePolicy {
    Bypass,
    #[default]
    Reject,
    #[serde(alias = "DELETE")]
    Remove,
    Nullify,
    Unset,
    Pull,
}

impl DeletePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletePolicy::Bypass => "BYPASS",
            DeletePolicy::Reject => "REJECT",
            DeletePolicy::Remove => "REMOVE",
            DeletePolicy::Nullify => "NULLIFY",
            DeletePolicy::Unset => "UNSET",
            DeletePolicy::Pull => "PULL",
        }
    }
}
