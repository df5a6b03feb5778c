//! Selectors: small expressions projecting a value out of documents,
//! crossing foreign keys on the way.
//!
//! A selector runs against a [`Selectable`]. Field and filter steps keep a
//! set of foreign documents lazy, so a chain of them compiles down to a
//! single store query; map, index and predicate steps materialize it.

mod lazy;
mod parser;

pub use lazy::{LazyDocuments, Selectable};
pub use parser::{parse_selector, SelectArg};

use crate::error::{Result, TetherError};
use crate::graph::{Stack, StackItem};
use crate::store::Context;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

type PredicateFn = dyn Fn(Value, usize) -> BoxFuture<'static, Result<bool>> + Send + Sync;

/// Caller-supplied, possibly asynchronous, element test: `(item, index) -> keep?`
#[derive(Clone)]
pub struct Predicate(Arc<PredicateFn>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value, usize) -> BoxFuture<'static, Result<bool>> + Send + Sync + 'static,
    {
        Predicate(Arc::new(f))
    }

    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Value, usize) -> bool + Send + Sync + 'static,
    {
        Predicate::new(move |value, index| {
            let keep = f(&value, index);
            async move { Ok(keep) }.boxed()
        })
    }

    pub async fn test(&self, value: Value, index: usize) -> Result<bool> {
        (self.0)(value, index).await
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

#[derive(Debug, Clone)]
pub enum Selector {
    /// The value itself; materializes a lazy set
    Identity,
    Field(String, Box<Selector>),
    Index(usize, Box<Selector>),
    /// `$`
    Map(Box<Selector>),
    /// `$$`
    FlatMap(Box<Selector>),
    /// Narrow a lazy set with a store-side filter
    Filter(Value, Box<Selector>),
    Predicate(Predicate, Box<Selector>),
    Tuple(Vec<Selector>),
    Object {
        fields: Vec<(String, Selector)>,
        /// Applied to every input field not listed in `fields`
        wildcard: Option<Box<Selector>>,
    },
}

impl Selector {
    pub fn field(name: impl Into<String>, next: Selector) -> Self {
        Selector::Field(name.into(), Box::new(next))
    }

    pub fn index(index: usize, next: Selector) -> Self {
        Selector::Index(index, Box::new(next))
    }

    pub fn map(next: Selector) -> Self {
        Selector::Map(Box::new(next))
    }

    pub fn flat_map(next: Selector) -> Self {
        Selector::FlatMap(Box::new(next))
    }

    pub fn filter(query: Value, next: Selector) -> Self {
        Selector::Filter(query, Box::new(next))
    }

    pub fn predicate(predicate: Predicate, next: Selector) -> Self {
        Selector::Predicate(predicate, Box::new(next))
    }

    /// `a.b.c` as nested field selectors
    pub fn path(path: &str) -> Self {
        path.rsplit('.')
            .filter(|part| !part.is_empty())
            .fold(Selector::Identity, |next, part| Selector::field(part, next))
    }

    fn kind(&self) -> &'static str {
        match self {
            Selector::Identity => "identity",
            Selector::Field(..) => "field",
            Selector::Index(..) => "index",
            Selector::Map(_) => "map ($)",
            Selector::FlatMap(_) => "flat-map ($$)",
            Selector::Filter(..) => "filter",
            Selector::Predicate(..) => "predicate",
            Selector::Tuple(_) => "tuple",
            Selector::Object { .. } => "object",
        }
    }

    /// Run against every document of `collection`, starting from an unfiltered lazy set.
    pub async fn select_in(&self, ctx: Context<'_>, collection: &str) -> Result<Value> {
        let all = LazyDocuments::new(collection, Vec::new());
        select(ctx, self, Selectable::Lazy(all), collection, Vec::new()).await
    }
}

/// Evaluate `selector` on `value`, read as documents of `collection` at position `stack`.
pub fn select<'a>(
    ctx: Context<'a>,
    selector: &'a Selector,
    value: Selectable,
    collection: &'a str,
    stack: Stack,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        match selector {
            Selector::Identity => value.materialize(ctx).await,

            Selector::Field(name, next) => {
                if value.is_arrayish() {
                    let items = select_each(ctx, selector, value, collection, stack).await?;
                    return Ok(Value::Array(items));
                }
                let mut object = match value {
                    Selectable::Value(Value::Object(object)) => object,
                    other => return Err(primitive_error(selector, &other)),
                };
                let extracted = object.remove(name.as_str());
                select_field(ctx, name, extracted, next, collection, stack).await
            }

            Selector::Index(index, next) => {
                let stack = element_stack(is_root(&value, &stack), &stack, *index);
                let item = match value {
                    Selectable::Value(Value::Array(mut items)) if *index < items.len() => {
                        items.swap_remove(*index)
                    }
                    Selectable::Value(Value::Array(_)) => Value::Null,
                    Selectable::Lazy(lazy) => {
                        lazy.fetch_one(ctx, *index).await?.unwrap_or(Value::Null)
                    }
                    Selectable::Value(other) => {
                        return Err(TetherError::Shape(format!(
                            "Can't resolve index {index} in non-array value {other}"
                        )));
                    }
                };
                select(ctx, next, Selectable::Value(item), collection, stack).await
            }

            Selector::Map(next) => {
                let items = select_each(ctx, next, value, collection, stack).await?;
                Ok(Value::Array(items))
            }

            Selector::FlatMap(next) => {
                let items = select_each(ctx, next, value, collection, stack).await?;
                let mut flat = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Array(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                Ok(Value::Array(flat))
            }

            Selector::Filter(query, next) => match value {
                Selectable::Lazy(lazy) => {
                    let narrowed = lazy.extend(query.clone());
                    select(ctx, next, Selectable::Lazy(narrowed), collection, stack).await
                }
                Selectable::Value(_) => Err(TetherError::Shape(
                    "Can't apply a filter query to a non-lazy set of documents".into(),
                )),
            },

            Selector::Predicate(predicate, next) => {
                let Value::Array(items) = value.materialize(ctx).await? else {
                    return Err(TetherError::Shape(
                        "Can't apply a predicate filter to a non-array value".into(),
                    ));
                };
                let verdicts = try_join_all(
                    items
                        .iter()
                        .enumerate()
                        .map(|(index, item)| predicate.test(item.clone(), index)),
                )
                .await?;
                let kept: Vec<Value> = items
                    .into_iter()
                    .zip(verdicts)
                    .filter_map(|(item, keep)| keep.then_some(item))
                    .collect();
                select(ctx, next, Selectable::Value(Value::Array(kept)), collection, stack).await
            }

            Selector::Tuple(selectors) => {
                let results = try_join_all(selectors.iter().map(|child| {
                    select(ctx, child, value.clone(), collection, stack.clone())
                }))
                .await?;
                Ok(Value::Array(results))
            }

            Selector::Object { fields, wildcard } => {
                if value.is_arrayish() {
                    let items = select_each(ctx, selector, value, collection, stack).await?;
                    return Ok(Value::Array(items));
                }
                let object = match value {
                    Selectable::Value(Value::Object(object)) => object,
                    other => return Err(primitive_error(selector, &other)),
                };

                let mut selections: Vec<(&str, Option<Value>, &Selector)> = fields
                    .iter()
                    .map(|(name, next)| (name.as_str(), object.get(name).cloned(), next))
                    .collect();
                if let Some(wildcard) = wildcard {
                    for (name, field_value) in &object {
                        if !fields.iter().any(|(listed, _)| listed == name) {
                            let extracted = Some(field_value.clone());
                            selections.push((name.as_str(), extracted, &**wildcard));
                        }
                    }
                }

                let results = try_join_all(selections.into_iter().map(|(name, extracted, next)| {
                    let stack = stack.clone();
                    let name = name.to_string();
                    async move {
                        let selected =
                            select_field(ctx, &name, extracted, next, collection, stack).await?;
                        Ok::<_, TetherError>((name, selected))
                    }
                }))
                .await?;
                Ok(Value::Object(results.into_iter().collect::<Map<_, _>>()))
            }
        }
    }
    .boxed()
}

/// Apply `selector` to every element, concurrently, keeping order.
async fn select_each<'a>(
    ctx: Context<'a>,
    selector: &'a Selector,
    value: Selectable,
    collection: &'a str,
    stack: Stack,
) -> Result<Vec<Value>> {
    let root = is_root(&value, &stack);
    let Value::Array(items) = value.materialize(ctx).await? else {
        return Err(TetherError::Shape(format!(
            "Can't map a {} selector over a non-array value",
            selector.kind()
        )));
    };
    try_join_all(items.into_iter().enumerate().map(|(index, item)| {
        let stack = element_stack(root, &stack, index);
        select(ctx, selector, Selectable::Value(item), collection, stack)
    }))
    .await
}

/// Continue with the value found in field `name`, crossing into the foreign collection
/// when the field is a foreign key.
async fn select_field<'a>(
    ctx: Context<'a>,
    name: &str,
    extracted: Option<Value>,
    next: &'a Selector,
    collection: &'a str,
    mut stack: Stack,
) -> Result<Value> {
    stack.push(StackItem::Field(name.to_string()));
    let config = ctx.graph.collection(collection);
    let Some(fk) = config.foreign_key_at(&stack) else {
        let value = extracted.unwrap_or(Value::Null);
        return select(ctx, next, Selectable::Value(value), collection, stack).await;
    };

    if matches!(extracted, None | Some(Value::Null)) && fk.permits_nullish(extracted.as_ref()) {
        return Ok(Value::Null);
    }

    let target = ctx.graph.collection(&fk.collection);
    let crossed = match extracted.unwrap_or(Value::Null) {
        Value::Array(keys) => Selectable::Lazy(LazyDocuments::new(
            fk.collection.clone(),
            vec![target.keys_filter(keys)],
        )),
        key => {
            let found = ctx
                .backend
                .find_one(&fk.collection, &target.key_filter(key), &Default::default())
                .await?;
            Selectable::Value(found.unwrap_or(Value::Null))
        }
    };
    select(ctx, next, crossed, &fk.collection, Vec::new()).await
}

/// Elements of a lazy set, or of an array at the root, are whole documents
fn is_root(value: &Selectable, stack: &[StackItem]) -> bool {
    matches!(value, Selectable::Lazy(_)) || stack.is_empty()
}

fn element_stack(root: bool, stack: &[StackItem], index: usize) -> Stack {
    if root {
        return Vec::new();
    }
    let mut stack = stack.to_vec();
    stack.push(StackItem::Index(index));
    stack
}

fn primitive_error(selector: &Selector, value: &Selectable) -> TetherError {
    let shown = match value {
        Selectable::Value(value) => value.to_string(),
        Selectable::Lazy(lazy) => format!("<lazy {}>", lazy.collection()),
    };
    match selector {
        Selector::Field(name, _) => {
            TetherError::Shape(format!("Can't resolve field '{name}' in primitive value {shown}"))
        }
        other => TetherError::Shape(format!(
            "Can't resolve {} selector in primitive value {shown}",
            other.kind()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DocumentBackend, MemoryBackend, StoreOptions};
    use crate::graph::{build_graph, Graph};
    use crate::schema::parse_schema_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SCHEMA: &str = r#"
Author:
  foreign:
    favoriteBooks.$: { collection: Book, onDelete: PULL }
Book:
  foreign:
    author: { collection: Author, optional: true, nullable: true }
"#;

    async fn library() -> (Graph, MemoryBackend) {
        let graph = build_graph(&parse_schema_str(SCHEMA).unwrap()).unwrap();
        let backend = MemoryBackend::new();
        let none = StoreOptions::new();
        backend
            .insert_many(
                "Author",
                vec![
                    json!({ "_id": "a1", "name": "Herbert", "favoriteBooks": ["b1", "b3"] }),
                    json!({ "_id": "a2", "name": "Austen", "favoriteBooks": [] }),
                ],
                &none,
            )
            .await
            .unwrap();
        backend
            .insert_many(
                "Book",
                vec![
                    json!({ "_id": "b1", "title": "Dune", "author": "a1", "pages": 412 }),
                    json!({ "_id": "b2", "title": "Emma", "author": "a2", "pages": 474 }),
                    json!({ "_id": "b3", "title": "Anonymous", "author": null, "pages": 90 }),
                    json!({ "_id": "b4", "title": "Orphan", "pages": 12 }),
                ],
                &none,
            )
            .await
            .unwrap();
        (graph, backend)
    }

    #[tokio::test]
    async fn test_field_crosses_foreign_keys() {
        let (graph, backend) = library().await;
        let ctx = Context::new(&backend, &graph);

        let titles = Selector::path("title").select_in(ctx, "Book").await.unwrap();
        assert_eq!(titles, json!(["Dune", "Emma", "Anonymous", "Orphan"]));

        let names = Selector::path("author.name");
        let book = Selectable::Value(json!({ "author": "a2" }));
        let name = select(ctx, &names, book, "Book", Vec::new()).await.unwrap();
        assert_eq!(name, json!("Austen"));

        // Array foreign key: lazy set of Books, then a field of each
        let favorites = Selector::path("favoriteBooks.title");
        let author = Selectable::Value(json!({ "_id": "a1", "favoriteBooks": ["b1", "b3"] }));
        let titles = select(ctx, &favorites, author, "Author", Vec::new()).await.unwrap();
        assert_eq!(titles, json!(["Dune", "Anonymous"]));
    }

    #[tokio::test]
    async fn test_optional_null_short_circuits() {
        let (graph, backend) = library().await;
        let ctx = Context::new(&backend, &graph);
        let selector = Selector::field(
            "author",
            Selector::Object {
                fields: vec![("name".into(), Selector::Identity)],
                wildcard: None,
            },
        );

        for book in [json!({ "author": null }), json!({ "title": "Orphan" })] {
            let selected = select(ctx, &selector, book.into(), "Book", Vec::new()).await.unwrap();
            assert_eq!(selected, Value::Null);
        }
    }

    #[tokio::test]
    async fn test_filter_matches_predicate() {
        let (graph, backend) = library().await;
        let ctx = Context::new(&backend, &graph);

        let store_side = Selector::filter(
            json!({ "pages": { "$gt": 100 } }),
            Selector::map(Selector::Identity),
        );
        let client_side = Selector::predicate(
            Predicate::sync(|book, _| book["pages"].as_i64().unwrap_or(0) > 100),
            Selector::map(Selector::Identity),
        );
        let filtered = store_side.select_in(ctx, "Book").await.unwrap();
        let predicated = client_side.select_in(ctx, "Book").await.unwrap();
        assert_eq!(filtered, predicated);
        assert_eq!(filtered.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_index_map_flat_map_tuple() {
        let (graph, backend) = library().await;
        let ctx = Context::new(&backend, &graph);

        let second = Selector::index(1, Selector::path("title"));
        assert_eq!(second.select_in(ctx, "Book").await.unwrap(), json!("Emma"));
        let past_end = Selector::index(9, Selector::Identity);
        assert_eq!(past_end.select_in(ctx, "Book").await.unwrap(), Value::Null);

        let favorites = Selector::flat_map(Selector::field(
            "favoriteBooks",
            Selector::map(Selector::path("_id")),
        ));
        assert_eq!(
            favorites.select_in(ctx, "Author").await.unwrap(),
            json!(["b1", "b3"])
        );

        let pair = Selector::index(
            0,
            Selector::Tuple(vec![Selector::path("name"), Selector::path("favoriteBooks.pages")]),
        );
        assert_eq!(
            pair.select_in(ctx, "Author").await.unwrap(),
            json!(["Herbert", [412, 90]])
        );
    }

    #[tokio::test]
    async fn test_object_with_wildcard() {
        let (graph, backend) = library().await;
        let ctx = Context::new(&backend, &graph);
        let selector = Selector::Object {
            fields: vec![("author".into(), Selector::path("name"))],
            wildcard: Some(Box::new(Selector::Identity)),
        };
        let book = json!({ "_id": "b1", "title": "Dune", "author": "a1" });
        let selected = select(ctx, &selector, book.into(), "Book", Vec::new()).await.unwrap();
        assert_eq!(selected, json!({ "_id": "b1", "title": "Dune", "author": "Herbert" }));
    }

    #[tokio::test]
    async fn test_shape_errors() {
        let (graph, backend) = library().await;
        let ctx = Context::new(&backend, &graph);

        let title = Selector::path("title");
        let err = select(ctx, &title, json!(3).into(), "Book", Vec::new()).await;
        assert!(matches!(err, Err(TetherError::Shape(_))));

        let index_of_object = Selector::index(0, Selector::Identity);
        let err = select(ctx, &index_of_object, json!({}).into(), "Book", Vec::new()).await;
        assert!(matches!(err, Err(TetherError::Shape(_))));

        let filter_on_array = Selector::filter(json!({}), Selector::Identity);
        let err = select(ctx, &filter_on_array, json!([]).into(), "Book", Vec::new()).await;
        assert!(matches!(err, Err(TetherError::Shape(_))));

        let map_of_scalar = Selector::map(Selector::Identity);
        let err = select(ctx, &map_of_scalar, json!("x").into(), "Book", Vec::new()).await;
        assert!(matches!(err, Err(TetherError::Shape(_))));
    }
}
