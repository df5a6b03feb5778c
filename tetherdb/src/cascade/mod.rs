//! Delete propagation across inbound references.
//!
//! A delete runs in two phases. Planning walks the reference graph from the
//! collection being deleted, queueing updates and dependent deletions on a
//! [`RemoveScheduler`] and collecting the documents behind every `REJECT` key.
//! Once the whole tree is planned, a `REJECT` referrer that is not itself
//! scheduled for deletion fails the delete. Nothing is written before that;
//! then the queued tasks run in order and the base deletion goes last.

use crate::backend::{with_option, DeleteResult, StoreOptions};
use crate::error::{Result, TetherError};
use crate::graph::ForeignKeyConfig;
use crate::schema::DeletePolicy;
use crate::store::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier used for filtered positional updates on array foreign keys
const ARRAY_FILTER_IDENT: &str = "ref";

/// Referencing documents: referencing collection -> foreign key -> documents
pub type References = BTreeMap<String, BTreeMap<String, Vec<Value>>>;

/// Keys already scheduled for deletion during one top-level delete, per collection.
#[derive(Debug, Default)]
pub struct DeletedKeys {
    keys: BTreeMap<String, BTreeSet<String>>,
}

impl DeletedKeys {
    pub fn contains(&self, collection: &str, key: &Value) -> bool {
        self.keys
            .get(collection)
            .is_some_and(|keys| keys.contains(&key.to_string()))
    }

    /// Record a key; false if it was already recorded.
    pub fn insert(&mut self, collection: &str, key: &Value) -> bool {
        self.keys
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string())
    }

    pub fn len(&self) -> usize {
        self.keys.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The base deletion of one (sub-)propagation
#[derive(Debug, Clone, PartialEq)]
pub struct Remover {
    pub collection: String,
    /// `None` when every matched key was already scheduled
    pub filter: Option<Value>,
    pub options: StoreOptions,
}

impl Remover {
    pub async fn run(self, ctx: Context<'_>) -> Result<DeleteResult> {
        match self.filter {
            Some(filter) => {
                ctx.backend
                    .delete_many(&self.collection, &filter, &self.options)
                    .await
            }
            None => Ok(DeleteResult::empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CascadeTask {
    Update {
        collection: String,
        filter: Value,
        update: Value,
        array_filters: Vec<Value>,
    },
    Remove(Remover),
}

impl CascadeTask {
    async fn run(self, ctx: Context<'_>) -> Result<()> {
        match self {
            CascadeTask::Update {
                collection,
                filter,
                update,
                array_filters,
            } => {
                let options = if array_filters.is_empty() {
                    StoreOptions::new()
                } else {
                    with_option(&StoreOptions::new(), "arrayFilters", Value::Array(array_filters))
                };
                ctx.backend
                    .update_many(&collection, &filter, &update, &options)
                    .await?;
            }
            CascadeTask::Remove(remover) => {
                remover.run(ctx).await?;
            }
        }
        Ok(())
    }
}

/// Documents found through a `REJECT` key while planning
#[derive(Debug, Clone, PartialEq)]
pub struct RejectCheck {
    /// Collection being deleted from
    pub collection: String,
    /// Referencing collection and foreign key
    pub owner: String,
    pub foreign_key: String,
    /// Primary keys of the referencing documents; `None` for documents without one
    pub referrers: Vec<Option<Value>>,
}

impl RejectCheck {
    /// Referrers that survive the delete
    fn blocking(&self, deleted: &DeletedKeys) -> usize {
        self.referrers
            .iter()
            .filter(|key| match key {
                Some(key) => !deleted.contains(&self.owner, key),
                None => true,
            })
            .count()
    }
}

/// Ordered side effects of a planned delete, and the `REJECT` checks it is subject to
#[derive(Debug, Default)]
pub struct RemoveScheduler {
    tasks: Vec<CascadeTask>,
    rejects: Vec<RejectCheck>,
}

impl RemoveScheduler {
    pub fn push(&mut self, task: CascadeTask) {
        self.tasks.push(task);
    }

    pub fn push_reject(&mut self, check: RejectCheck) {
        self.rejects.push(check);
    }

    /// Fail if any `REJECT` referrer is left alive by the completed plan.
    pub fn check_rejects(&self, deleted: &DeletedKeys) -> Result<()> {
        for check in &self.rejects {
            let blocking = check.blocking(deleted);
            if blocking > 0 {
                return Err(TetherError::ReferentialIntegrity(format!(
                    "Cannot delete from '{}': {blocking} document(s) in '{}' still reference it through '{}'",
                    check.collection, check.owner, check.foreign_key
                )));
            }
        }
        Ok(())
    }

    pub fn tasks(&self) -> &[CascadeTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Execute every task in order, stopping at the first failure.
    /// Rejects are not checked here.
    pub async fn run(self, ctx: Context<'_>) -> Result<()> {
        for task in self.tasks {
            task.run(ctx).await?;
        }
        Ok(())
    }
}

/// Plan the deletion of the documents of `collection` matching `query`.
///
/// Returns the base deletion, to be run after every task queued on `scheduler`.
/// `REJECT` referrers are only recorded here; [`RemoveScheduler::check_rejects`]
/// judges them against the keys deleted by the finished plan.
pub fn propagate_delete<'a, 'p>(
    ctx: Context<'a>,
    collection: &'a str,
    query: Value,
    single: bool,
    options: StoreOptions,
    scheduler: &'p mut RemoveScheduler,
    deleted: &'p mut DeletedKeys,
) -> BoxFuture<'p, Result<Remover>>
where
    'a: 'p,
{
    async move {
        let config = ctx.graph.collection(collection);
        let find_options = if single {
            with_option(&StoreOptions::new(), "limit", Value::from(1))
        } else {
            StoreOptions::new()
        };
        let docs = ctx.backend.find(collection, &query, &find_options).await?;
        let keys: Vec<Value> = docs
            .iter()
            .filter_map(|doc| config.key_of(doc))
            .filter(|key| deleted.insert(collection, key))
            .cloned()
            .collect();

        if keys.is_empty() {
            return Ok(Remover {
                collection: collection.to_string(),
                filter: None,
                options,
            });
        }
        log::debug!("Planning delete of {} documents from '{collection}'", keys.len());

        for (owner, foreign_keys) in &config.references {
            for (name, fk) in foreign_keys {
                let referencing = referencing_filter(fk, &keys);
                match fk.on_delete {
                    DeletePolicy::Bypass => {}
                    DeletePolicy::Reject => {
                        let owner_config = ctx.graph.collection(owner);
                        let referrers: Vec<Option<Value>> = ctx
                            .backend
                            .find(owner, &referencing, &StoreOptions::new())
                            .await?
                            .iter()
                            .map(|doc| owner_config.key_of(doc).cloned())
                            .collect();
                        if !referrers.is_empty() {
                            scheduler.push_reject(RejectCheck {
                                collection: collection.to_string(),
                                owner: owner.clone(),
                                foreign_key: name.clone(),
                                referrers,
                            });
                        }
                    }
                    DeletePolicy::Remove => {
                        let remover = propagate_delete(
                            ctx,
                            owner,
                            referencing,
                            false,
                            StoreOptions::new(),
                            &mut *scheduler,
                            &mut *deleted,
                        )
                        .await?;
                        scheduler.push(CascadeTask::Remove(remover));
                    }
                    DeletePolicy::Nullify => {
                        scheduler.push(update_task(owner, fk, &keys, "$set", Value::Null));
                    }
                    DeletePolicy::Unset => {
                        scheduler.push(update_task(owner, fk, &keys, "$unset", json!("")));
                    }
                    DeletePolicy::Pull => {
                        scheduler.push(pull_task(owner, fk, &keys)?);
                    }
                }
            }
        }

        Ok(Remover {
            collection: collection.to_string(),
            filter: Some(config.keys_filter(keys)),
            options,
        })
    }
    .boxed()
}

/// Plan, then commit, a delete with all its cascades. Returns the base deletion's result.
pub async fn cascade_delete(
    ctx: Context<'_>,
    collection: &str,
    query: Value,
    single: bool,
    options: StoreOptions,
) -> Result<DeleteResult> {
    let mut scheduler = RemoveScheduler::default();
    let mut deleted = DeletedKeys::default();
    let remover = propagate_delete(
        ctx,
        collection,
        query,
        single,
        options,
        &mut scheduler,
        &mut deleted,
    )
    .await?;
    log::debug!(
        "Delete on '{collection}' planned: {} keys, {} cascade tasks",
        deleted.len(),
        scheduler.len()
    );
    scheduler.check_rejects(&deleted)?;
    scheduler.run(ctx).await?;
    remover.run(ctx).await
}

/// Every document referencing one of `keys` in `collection`, grouped by referencing
/// collection and foreign key. Collections and keys with no match are left out.
pub async fn find_references(
    ctx: Context<'_>,
    collection: &str,
    keys: Vec<Value>,
) -> Result<References> {
    let config = ctx.graph.collection(collection);
    let mut references = References::new();
    for (owner, foreign_keys) in &config.references {
        for (name, fk) in foreign_keys {
            let docs = ctx
                .backend
                .find(owner, &referencing_filter(fk, &keys), &StoreOptions::new())
                .await?;
            if !docs.is_empty() {
                references
                    .entry(owner.clone())
                    .or_default()
                    .insert(name.clone(), docs);
            }
        }
    }
    Ok(references)
}

/// `{queryPath: {$in: keys}}`; array levels are matched element-wise by the store
fn referencing_filter(fk: &ForeignKeyConfig, keys: &[Value]) -> Value {
    let mut filter = Map::new();
    filter.insert(fk.path.query_path(), json!({ "$in": keys }));
    Value::Object(filter)
}

fn update_task(
    owner: &str,
    fk: &ForeignKeyConfig,
    keys: &[Value],
    operator: &str,
    value: Value,
) -> CascadeTask {
    let ident = ARRAY_FILTER_IDENT;
    let (field, array_filters) = match fk.path.split_at_wildcard() {
        None => (fk.path.to_string(), Vec::new()),
        Some((prefix, None)) => (
            format!("{prefix}.$[{ident}]"),
            vec![json!({ ident: { "$in": keys } })],
        ),
        Some((prefix, Some(rest))) => (
            format!("{prefix}.$[{ident}].{rest}"),
            vec![json!({ format!("{ident}.{rest}"): { "$in": keys } })],
        ),
    };
    let mut fields = Map::new();
    fields.insert(field, value);
    let mut update = Map::new();
    update.insert(operator.to_string(), Value::Object(fields));
    CascadeTask::Update {
        collection: owner.to_string(),
        filter: referencing_filter(fk, keys),
        update: Value::Object(update),
        array_filters,
    }
}

fn pull_task(owner: &str, fk: &ForeignKeyConfig, keys: &[Value]) -> Result<CascadeTask> {
    let pull = match fk.path.split_at_wildcard() {
        Some((prefix, None)) => json!({ prefix: { "$in": keys } }),
        Some((prefix, Some(rest))) => json!({ prefix: { rest: { "$in": keys } } }),
        None => {
            return Err(TetherError::Configuration(format!(
                "PULL on '{owner}.{}' needs an array path",
                fk.path
            )));
        }
    };
    Ok(CascadeTask::Update {
        collection: owner.to_string(),
        filter: referencing_filter(fk, keys),
        update: json!({ "$pull": pull }),
        array_filters: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DocumentBackend, MemoryBackend};
    use crate::graph::{build_graph, Graph};
    use crate::schema::parse_schema_str;
    use pretty_assertions::assert_eq;

    fn graph(schema: &str) -> Graph {
        build_graph(&parse_schema_str(schema).unwrap()).unwrap()
    }

    async fn seed(backend: &MemoryBackend, collection: &str, docs: Vec<Value>) {
        backend
            .insert_many(collection, docs, &StoreOptions::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reject_anywhere_prevents_every_mutation() {
        let graph = graph(
            r#"
A: {}
B:
  foreign:
    a: { collection: A, onDelete: REMOVE }
C:
  foreign:
    a: { collection: A, onDelete: REJECT }
"#,
        );
        let backend = MemoryBackend::new();
        seed(&backend, "A", vec![json!({ "_id": "a1" })]).await;
        seed(&backend, "B", vec![json!({ "_id": "b1", "a": "a1" })]).await;
        seed(&backend, "C", vec![json!({ "_id": "c1", "a": "a1" })]).await;
        let ctx = Context::new(&backend, &graph);

        let err = cascade_delete(ctx, "A", json!({ "_id": "a1" }), false, StoreOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(backend.documents("A").len(), 1);
        assert_eq!(backend.documents("B").len(), 1);
        assert_eq!(backend.documents("C").len(), 1);
    }

    #[tokio::test]
    async fn test_reference_cycle_terminates() {
        let graph = graph(
            r#"
A:
  foreign:
    b: { collection: B, onDelete: REMOVE }
B:
  foreign:
    a: { collection: A, onDelete: REMOVE }
"#,
        );
        let backend = MemoryBackend::new();
        seed(&backend, "A", vec![json!({ "_id": "a1", "b": "b1" })]).await;
        seed(&backend, "B", vec![json!({ "_id": "b1", "a": "a1" })]).await;
        let ctx = Context::new(&backend, &graph);

        let mut scheduler = RemoveScheduler::default();
        let mut deleted = DeletedKeys::default();
        let remover = propagate_delete(
            ctx,
            "A",
            json!({ "_id": "a1" }),
            false,
            StoreOptions::new(),
            &mut scheduler,
            &mut deleted,
        )
        .await
        .unwrap();
        // a1 and b1 once each; the walk back into A finds nothing new
        assert_eq!(deleted.len(), 2);
        assert_eq!(
            scheduler.tasks(),
            &[
                CascadeTask::Remove(Remover {
                    collection: "A".into(),
                    filter: None,
                    options: StoreOptions::new(),
                }),
                CascadeTask::Remove(Remover {
                    collection: "B".into(),
                    filter: Some(json!({ "_id": { "$in": ["b1"] } })),
                    options: StoreOptions::new(),
                }),
            ]
        );

        scheduler.run(ctx).await.unwrap();
        let result = remover.run(ctx).await.unwrap();
        assert_eq!(result.deleted_count, 1);
        assert!(backend.documents("A").is_empty());
        assert!(backend.documents("B").is_empty());
    }

    #[tokio::test]
    async fn test_self_reference_tree() {
        let graph = graph("Node:\n  foreign:\n    parent: { collection: Node, onDelete: REMOVE, optional: true }");
        let backend = MemoryBackend::new();
        seed(
            &backend,
            "Node",
            vec![
                json!({ "_id": "n1" }),
                json!({ "_id": "n2", "parent": "n1" }),
                json!({ "_id": "n3", "parent": "n2" }),
                json!({ "_id": "n4" }),
            ],
        )
        .await;
        let ctx = Context::new(&backend, &graph);

        cascade_delete(ctx, "Node", json!({ "_id": "n1" }), false, StoreOptions::new())
            .await
            .unwrap();
        assert_eq!(backend.documents("Node"), vec![json!({ "_id": "n4" })]);
    }

    #[tokio::test]
    async fn test_nullify_unset_and_pull() {
        let graph = graph(
            r#"
Author: {}
Book:
  foreign:
    editor: { collection: Author, onDelete: NULLIFY, nullable: true }
    translator: { collection: Author, onDelete: UNSET, optional: true }
    coAuthors.$: { collection: Author, onDelete: PULL }
    credits.$.author: { collection: Author, onDelete: NULLIFY, nullable: true }
    reviews.$.author: { collection: Author, onDelete: PULL }
"#,
        );
        let backend = MemoryBackend::new();
        seed(&backend, "Author", vec![json!({ "_id": "a1" }), json!({ "_id": "a2" })]).await;
        seed(
            &backend,
            "Book",
            vec![json!({
                "_id": "b1",
                "editor": "a1",
                "translator": "a1",
                "coAuthors": ["a1", "a2"],
                "credits": [{ "author": "a1", "role": "x" }, { "author": "a2", "role": "y" }],
                "reviews": [{ "author": "a1" }, { "author": "a2" }]
            })],
        )
        .await;
        let ctx = Context::new(&backend, &graph);

        let result = cascade_delete(ctx, "Author", json!({ "_id": "a1" }), false, StoreOptions::new())
            .await
            .unwrap();
        assert_eq!(result.deleted_count, 1);
        assert_eq!(
            backend.documents("Book"),
            vec![json!({
                "_id": "b1",
                "editor": null,
                "coAuthors": ["a2"],
                "credits": [{ "author": null, "role": "x" }, { "author": "a2", "role": "y" }],
                "reviews": [{ "author": "a2" }]
            })]
        );
    }

    #[tokio::test]
    async fn test_pull_and_remove_scenario() {
        let graph = graph(
            r#"
Author:
  foreign:
    favoriteBooks.$: { collection: Book, onDelete: PULL }
Book:
  foreign:
    author: { collection: Author, onDelete: DELETE, optional: true }
"#,
        );
        let backend = MemoryBackend::new();
        seed(&backend, "Book", vec![json!({ "_id": "b1", "title": "X" }), json!({ "_id": "b2", "author": "a1" })]).await;
        seed(&backend, "Author", vec![json!({ "_id": "a1", "name": "Y", "favoriteBooks": ["b1", "b2"] })]).await;
        let ctx = Context::new(&backend, &graph);

        cascade_delete(ctx, "Book", json!({ "_id": "b1" }), false, StoreOptions::new())
            .await
            .unwrap();
        assert_eq!(backend.documents("Author")[0]["favoriteBooks"], json!(["b2"]));

        cascade_delete(ctx, "Author", json!({ "_id": "a1" }), false, StoreOptions::new())
            .await
            .unwrap();
        assert!(backend.documents("Author").is_empty());
        assert!(backend.documents("Book").is_empty());
    }

    #[tokio::test]
    async fn test_single_deletes_one_match() {
        let graph = graph("Tag: {}");
        let backend = MemoryBackend::new();
        seed(&backend, "Tag", vec![json!({ "_id": "t1", "k": 1 }), json!({ "_id": "t2", "k": 1 })]).await;
        let ctx = Context::new(&backend, &graph);

        let result = cascade_delete(ctx, "Tag", json!({ "k": 1 }), true, StoreOptions::new())
            .await
            .unwrap();
        assert_eq!(result.deleted_count, 1);
        assert_eq!(backend.documents("Tag"), vec![json!({ "_id": "t2", "k": 1 })]);

        let nothing = cascade_delete(ctx, "Tag", json!({ "k": 2 }), false, StoreOptions::new())
            .await
            .unwrap();
        assert_eq!(nothing, DeleteResult::empty());
    }

    #[tokio::test]
    async fn test_find_references() {
        let graph = graph(
            r#"
Author: {}
Book:
  foreign:
    author: { collection: Author }
    editor: { collection: Author, nullable: true, onDelete: NULLIFY }
"#,
        );
        let backend = MemoryBackend::new();
        seed(
            &backend,
            "Book",
            vec![
                json!({ "_id": "b1", "author": "a1", "editor": "a2" }),
                json!({ "_id": "b2", "author": "a2" }),
            ],
        )
        .await;
        let ctx = Context::new(&backend, &graph);

        let references = find_references(ctx, "Author", vec![json!("a2")]).await.unwrap();
        assert_eq!(references["Book"]["author"], vec![json!({ "_id": "b2", "author": "a2" })]);
        assert_eq!(references["Book"]["editor"].len(), 1);

        let none = find_references(ctx, "Author", vec![json!("a9")]).await.unwrap();
        assert!(none.is_empty());
    }

    async fn delete_author_reviewed_through(shelf: &str) -> Result<DeleteResult> {
        let graph = graph(&format!(
            r#"
Author: {{}}
{shelf}:
  foreign:
    author: {{ collection: Author, onDelete: REMOVE }}
Review:
  foreign:
    book: {{ collection: {shelf}, onDelete: REMOVE }}
    author: {{ collection: Author, onDelete: REJECT }}
"#
        ));
        let backend = MemoryBackend::new();
        seed(&backend, "Author", vec![json!({ "_id": "a1" })]).await;
        seed(&backend, shelf, vec![json!({ "_id": "b1", "author": "a1" })]).await;
        seed(&backend, "Review", vec![json!({ "_id": "r1", "book": "b1", "author": "a1" })]).await;
        let ctx = Context::new(&backend, &graph);

        let result = cascade_delete(ctx, "Author", json!({ "_id": "a1" }), false, StoreOptions::new()).await;
        if result.is_ok() {
            assert!(backend.documents("Author").is_empty());
            assert!(backend.documents(shelf).is_empty());
            assert!(backend.documents("Review").is_empty());
        }
        result
    }

    #[tokio::test]
    async fn test_reject_referrer_removed_by_the_same_delete() {
        // r1 goes with b1 either way, whichever branch is walked first
        let book = delete_author_reviewed_through("Book").await.unwrap();
        let volume = delete_author_reviewed_through("Volume").await.unwrap();
        assert_eq!(book, volume);
        assert_eq!(book.deleted_count, 1);
    }

    #[tokio::test]
    async fn test_reject_referrer_outside_the_plan_blocks() {
        let graph = graph(
            r#"
Author: {}
Book:
  foreign:
    author: { collection: Author, onDelete: REMOVE }
Review:
  foreign:
    book: { collection: Book, onDelete: REMOVE }
    author: { collection: Author, onDelete: REJECT }
"#,
        );
        let backend = MemoryBackend::new();
        seed(&backend, "Author", vec![json!({ "_id": "a1" })]).await;
        seed(&backend, "Book", vec![json!({ "_id": "b1", "author": "a1" }), json!({ "_id": "b2" })]).await;
        seed(
            &backend,
            "Review",
            vec![
                json!({ "_id": "r1", "book": "b1", "author": "a1" }),
                json!({ "_id": "r2", "book": "b2", "author": "a1" }),
            ],
        )
        .await;
        let ctx = Context::new(&backend, &graph);

        let err = cascade_delete(ctx, "Author", json!({ "_id": "a1" }), false, StoreOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("1 document(s) in 'Review'"));
        assert_eq!(backend.documents("Author").len(), 1);
        assert_eq!(backend.documents("Book").len(), 2);
        assert_eq!(backend.documents("Review").len(), 2);
    }
}
