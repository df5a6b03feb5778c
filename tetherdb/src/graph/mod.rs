//! Dependency graph compiled from a [`Schema`].
//!
//! Every declared foreign key is recorded twice: once under the owning
//! collection's `foreign_keys`, and once, mirrored, under the target
//! collection's `references[owner][key]`. Delete propagation walks the
//! mirrored side; normalization and selection walk the declared side.

mod path;

pub use path::{
    push_dotted, stack_to_key, stack_to_query_path, FieldPath, PathSegment, Stack, StackItem,
    WILDCARD,
};

use crate::backend::ID_FIELD;
use crate::error::{Result, TetherError};
use crate::schema::{DeletePolicy, InsertPolicy, Schema};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The store's native identity field, used when a collection declares no primary key.
pub const DEFAULT_PRIMARY_KEY: &str = ID_FIELD;

static DEFAULT_CONFIG: Lazy<CollectionConfig> = Lazy::new(CollectionConfig::default);

/// Compiled, read-only view of every collection's keys and relationships
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Graph {
    collections: BTreeMap<String, CollectionConfig>,
}

impl Graph {
    /// Config for a collection. Collections absent from the schema get the implicit default
    /// (native primary key, no foreign keys, no references).
    pub fn collection(&self, name: &str) -> &CollectionConfig {
        self.collections.get(name).unwrap_or(&DEFAULT_CONFIG)
    }

    /// Config for a collection only if the schema declared it
    pub fn get(&self, name: &str) -> Option<&CollectionConfig> {
        self.collections.get(name)
    }

    pub fn collections(&self) -> impl Iterator<Item = (&String, &CollectionConfig)> {
        self.collections.iter()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionConfig {
    pub primary_key: String,
    pub foreign_keys: BTreeMap<String, ForeignKeyConfig>,
    /// Referencing collection -> foreign key name -> config
    pub references: BTreeMap<String, BTreeMap<String, ForeignKeyConfig>>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        CollectionConfig {
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            foreign_keys: BTreeMap::new(),
            references: BTreeMap::new(),
        }
    }
}

impl CollectionConfig {
    pub fn foreign_key(&self, key: &str) -> Option<&ForeignKeyConfig> {
        self.foreign_keys.get(key)
    }

    /// Foreign key at a document traversal position. A field holding a whole array of keys
    /// (`favoriteBooks`) resolves to its element-wise declaration (`favoriteBooks.$`).
    pub fn foreign_key_at(&self, stack: &[StackItem]) -> Option<&ForeignKeyConfig> {
        if stack.is_empty() {
            return None;
        }
        let key = stack_to_key(stack);
        self.foreign_keys
            .get(&key)
            .or_else(|| self.foreign_keys.get(&format!("{key}.{WILDCARD}")))
    }

    /// Primary key value of a document
    pub fn key_of<'v>(&self, doc: &'v Value) -> Option<&'v Value> {
        self.primary_key
            .split('.')
            .try_fold(doc, |value, part| value.get(part))
    }

    /// `{primaryKey: key}`
    pub fn key_filter(&self, key: Value) -> Value {
        let mut filter = Map::new();
        filter.insert(self.primary_key.clone(), key);
        Value::Object(filter)
    }

    /// `{primaryKey: {$in: keys}}`
    pub fn keys_filter(&self, keys: Vec<Value>) -> Value {
        let mut within = Map::new();
        within.insert("$in".to_string(), Value::Array(keys));
        self.key_filter(Value::Object(within))
    }

    /// Foreign key addressed by a filter query position, where array levels are implicit.
    pub fn foreign_key_for_query(&self, stack: &[StackItem]) -> Option<&ForeignKeyConfig> {
        if stack.is_empty() {
            return None;
        }
        let query_path = stack_to_query_path(stack);
        self.foreign_keys
            .values()
            .find(|fk| fk.path.query_path() == query_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyConfig {
    pub path: FieldPath,
    /// Target collection
    pub collection: String,
    pub nullable: bool,
    pub optional: bool,
    pub on_insert: InsertPolicy,
    pub on_delete: DeletePolicy,
}

impl ForeignKeyConfig {
    /// Whether a nullish value at this key is legal and should not be followed.
    /// `None` is a missing field, `Some(Null)` an explicit null.
    pub fn permits_nullish(&self, value: Option<&Value>) -> bool {
        match value {
            None => self.optional,
            Some(Value::Null) => self.nullable,
            Some(_) => false,
        }
    }
}

/// Compile a schema into its bidirectional dependency graph.
pub fn build_graph(schema: &Schema) -> Result<Graph> {
    let mut collections: BTreeMap<String, CollectionConfig> = BTreeMap::new();

    for (name, definition) in schema {
        let mut config = CollectionConfig::default();
        if let Some(primary) = &definition.primary {
            if primary.is_empty() {
                return Err(TetherError::Configuration(format!(
                    "Collection '{name}' declares an empty primary key"
                )));
            }
            config.primary_key = primary.clone();
        }

        for (raw_path, fk) in &definition.foreign {
            let path = FieldPath::parse(raw_path)?;
            let location = format!("{name}.{raw_path}");

            if !schema.contains_key(&fk.collection) {
                return Err(TetherError::Configuration(format!(
                    "Foreign key '{location}' targets unknown collection '{}'",
                    fk.collection
                )));
            }
            if path.wildcard_count() > 1 {
                return Err(TetherError::Configuration(format!(
                    "Foreign key '{location}' has more than one array wildcard; only a single level is supported"
                )));
            }
            check_delete_policy(&location, &path, fk.on_delete, fk.nullable, fk.optional)?;

            config.foreign_keys.insert(
                path.to_string(),
                ForeignKeyConfig {
                    path,
                    collection: fk.collection.clone(),
                    nullable: fk.nullable,
                    optional: fk.optional,
                    on_insert: fk.on_insert,
                    on_delete: fk.on_delete,
                },
            );
        }

        collections.insert(name.clone(), config);
    }

    // Mirror every foreign key onto its target
    let mut mirrored: Vec<(String, String, String, ForeignKeyConfig)> = Vec::new();
    for (owner, config) in &collections {
        for (key, fk) in &config.foreign_keys {
            mirrored.push((fk.collection.clone(), owner.clone(), key.clone(), fk.clone()));
        }
    }
    let edge_count = mirrored.len();
    for (target, owner, key, fk) in mirrored {
        if let Some(target_config) = collections.get_mut(&target) {
            target_config
                .references
                .entry(owner)
                .or_default()
                .insert(key, fk);
        }
    }

    log::debug!(
        "Compiled dependency graph: {} collections, {} foreign keys",
        collections.len(),
        edge_count
    );

    Ok(Graph { collections })
}

fn check_delete_policy(
    location: &str,
    path: &FieldPath,
    policy: DeletePolicy,
    nullable: bool,
    optional: bool,
) -> Result<()> {
    let problem = match policy {
        DeletePolicy::Nullify if !nullable => Some("NULLIFY requires nullable: true"),
        DeletePolicy::Unset if !optional => Some("UNSET requires optional: true"),
        DeletePolicy::Unset if path.ends_with_wildcard() => {
            Some("UNSET needs a field to remove, not an array element")
        }
        DeletePolicy::Pull if !path.is_array() => {
            Some("PULL is only legal on array paths (containing '$')")
        }
        _ => None,
    };
    match problem {
        Some(message) => Err(TetherError::Configuration(format!(
            "Foreign key '{location}': {message}"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;
    use pretty_assertions::assert_eq;

    fn library_schema() -> Schema {
        parse_schema_str(
            r#"
Author:
  foreign:
    favoriteBooks.$: { collection: Book, onDelete: PULL }
Book:
  foreign:
    author: { collection: Author, onDelete: DELETE }
    editor: { collection: Author, onDelete: NULLIFY, nullable: true }
Shelf:
  primary: code
  foreign:
    slots.$.book: { collection: Book, onDelete: UNSET, optional: true, onInsert: BYPASS }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let graph = build_graph(&library_schema()).unwrap();
        assert_eq!(graph.collection("Author").primary_key, "_id");
        assert_eq!(graph.collection("Shelf").primary_key, "code");

        let author = graph.collection("Book").foreign_key("author").unwrap();
        assert_eq!(author.on_insert, InsertPolicy::Verify);
        assert_eq!(author.on_delete, DeletePolicy::Remove);
        assert!(!author.nullable);
        assert!(!author.optional);
    }

    #[test]
    fn test_references_are_mirrored() {
        let graph = build_graph(&library_schema()).unwrap();

        // Every declared key has exactly one mirrored entry with identical metadata
        for (owner, config) in graph.collections() {
            for (key, fk) in &config.foreign_keys {
                let target = graph.get(&fk.collection).unwrap();
                assert_eq!(target.references[owner][key], *fk);
            }
        }

        let author_refs = &graph.collection("Author").references;
        assert_eq!(
            author_refs["Book"].keys().collect::<Vec<_>>(),
            vec!["author", "editor"]
        );
        let book_refs = &graph.collection("Book").references;
        assert!(book_refs["Author"].contains_key("favoriteBooks.$"));
        assert!(book_refs["Shelf"].contains_key("slots.$.book"));
        assert!(graph.collection("Shelf").references.is_empty());
    }

    #[test]
    fn test_unknown_collection_gets_default() {
        let graph = build_graph(&library_schema()).unwrap();
        assert!(graph.get("Reader").is_none());
        let config = graph.collection("Reader");
        assert_eq!(config.primary_key, DEFAULT_PRIMARY_KEY);
        assert!(config.foreign_keys.is_empty());
    }

    #[test]
    fn test_dangling_target_rejected() {
        let schema = parse_schema_str("Book:\n  foreign:\n    author: { collection: Writer }").unwrap();
        let err = build_graph(&schema).unwrap_err();
        assert!(matches!(err, TetherError::Configuration(ref m) if m.contains("Writer")));
    }

    #[test]
    fn test_policy_constraints() {
        let cases = [
            "author: { collection: Author, onDelete: NULLIFY }",
            "author: { collection: Author, onDelete: UNSET }",
            "author: { collection: Author, onDelete: PULL }",
            "authors.$: { collection: Author, onDelete: UNSET, optional: true }",
            "shelves.$.rows.$: { collection: Author }",
        ];
        for case in cases {
            let schema = parse_schema_str(&format!(
                "Author: {{}}\nBook:\n  foreign:\n    {case}"
            ))
            .unwrap();
            assert!(
                matches!(build_graph(&schema), Err(TetherError::Configuration(_))),
                "expected configuration error for {case}"
            );
        }

        let legal = parse_schema_str(
            "Author: {}\nBook:\n  foreign:\n    authors.$: { collection: Author, onDelete: PULL }\n    editor: { collection: Author, onDelete: UNSET, optional: true }",
        )
        .unwrap();
        assert!(build_graph(&legal).is_ok());
    }

    #[test]
    fn test_foreign_key_lookups() {
        let graph = build_graph(&library_schema()).unwrap();
        let author = graph.collection("Author");
        let stack = vec![StackItem::Field("favoriteBooks".into())];
        assert_eq!(
            author.foreign_key_at(&stack).unwrap().path.to_string(),
            "favoriteBooks.$"
        );
        assert!(author.foreign_key_for_query(&stack).is_some());

        let shelf = graph.collection("Shelf");
        let query_stack = vec![
            StackItem::Field("slots".into()),
            StackItem::Field("book".into()),
        ];
        assert!(shelf.foreign_key_for_query(&query_stack).is_some());
        assert!(shelf.foreign_key_at(&query_stack).is_none());
        assert!(shelf.foreign_key_at(&[]).is_none());
    }

    #[test]
    fn test_key_helpers() {
        let graph = build_graph(&library_schema()).unwrap();
        let shelf = graph.collection("Shelf");
        let doc = serde_json::json!({ "_id": "x", "code": "S-1" });
        assert_eq!(shelf.key_of(&doc), Some(&serde_json::json!("S-1")));
        assert_eq!(
            shelf.keys_filter(vec![serde_json::json!("S-1")]),
            serde_json::json!({ "code": { "$in": ["S-1"] } })
        );
        assert_eq!(graph.collection("Book").key_of(&serde_json::json!({})), None);
    }

    #[test]
    fn test_permits_nullish() {
        let graph = build_graph(&library_schema()).unwrap();
        let editor = graph.collection("Book").foreign_key("editor").unwrap();
        assert!(editor.permits_nullish(Some(&serde_json::Value::Null)));
        assert!(!editor.permits_nullish(None));
        assert!(!editor.permits_nullish(Some(&serde_json::json!("a1"))));
    }
}
