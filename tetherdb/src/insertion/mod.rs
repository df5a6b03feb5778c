//! Nested inserts.
//!
//! An insertion document may hold a whole document wherever a foreign key is
//! declared. Such documents are inserted first, into the target collection,
//! and replaced by their primary key. Everything inserted along the way is
//! recorded in a [`DependencyCollector`] so a failure can be compensated.

use crate::backend::{StoreOptions, ID_FIELD};
use crate::error::{Result, TetherError};
use crate::graph::{stack_to_key, CollectionConfig, Stack, StackItem};
use crate::store::Context;
use crate::validation::verify_insertion_doc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Primary keys inserted during one top-level call, per collection.
#[derive(Debug, Default)]
pub struct DependencyCollector {
    dependencies: Mutex<BTreeMap<String, Vec<Value>>>,
}

impl DependencyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, collection: &str, keys: impl IntoIterator<Item = Value>) {
        self.dependencies
            .lock()
            .entry(collection.to_string())
            .or_default()
            .extend(keys);
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.lock().values().all(Vec::is_empty)
    }

    /// Keys recorded so far for a collection
    pub fn keys(&self, collection: &str) -> Vec<Value> {
        self.dependencies
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Delete every recorded document, draining the collector.
    pub async fn delete(&self, ctx: Context<'_>) -> Result<()> {
        let dependencies = std::mem::take(&mut *self.dependencies.lock());
        for (collection, keys) in dependencies {
            if keys.is_empty() {
                continue;
            }
            let config = ctx.graph.collection(&collection);
            log::debug!(
                "Compensating insert: deleting {} documents from '{collection}'",
                keys.len()
            );
            ctx.backend
                .delete_many(&collection, &config.keys_filter(keys), &StoreOptions::new())
                .await?;
        }
        Ok(())
    }

    /// Undo the call's inserts after `error`, then hand the original error back.
    /// A failing compensation is logged and otherwise ignored.
    pub async fn rollback(&self, ctx: Context<'_>, error: TetherError) -> TetherError {
        if let Err(compensation) = self.delete(ctx).await {
            log::warn!("Failed to roll back nested insert after '{error}': {compensation}");
        }
        error
    }
}

/// Replace nested documents at foreign key positions by the keys of freshly inserted ones.
pub fn normalize_insertion_doc<'a>(
    ctx: Context<'a>,
    collection: &'a str,
    doc: Value,
    dependencies: &'a DependencyCollector,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        let config = ctx.graph.collection(collection);
        walk(ctx, config, doc, Vec::new(), dependencies).await
    }
    .boxed()
}

fn walk<'a>(
    ctx: Context<'a>,
    config: &'a CollectionConfig,
    value: Value,
    stack: Stack,
    dependencies: &'a DependencyCollector,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        if value.is_object() && !stack.is_empty() {
            if let Some(fk) = config.foreign_key(&stack_to_key(&stack)) {
                let inserted = insert_safely(
                    ctx,
                    &fk.collection,
                    value,
                    dependencies,
                    false,
                    &StoreOptions::new(),
                )
                .await?;
                let target = ctx.graph.collection(&fk.collection);
                return target.key_of(&inserted).cloned().ok_or_else(|| {
                    TetherError::Store(format!(
                        "Inserted document in '{}' has no primary key '{}'",
                        fk.collection, target.primary_key
                    ))
                });
            }
        }
        match value {
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, child) in map {
                    let mut stack = stack.clone();
                    stack.push(StackItem::Field(key.clone()));
                    out.insert(key, walk(ctx, config, child, stack, dependencies).await?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let mut stack = stack.clone();
                    stack.push(StackItem::Index(index));
                    out.push(walk(ctx, config, item, stack, dependencies).await?);
                }
                Ok(Value::Array(out))
            }
            other => Ok(other),
        }
    }
    .boxed()
}

/// A document whose collection declares its own primary key must carry it:
/// the backend only assigns `_id`, and compensation deletes by primary key.
fn require_primary_key(config: &CollectionConfig, collection: &str, doc: &Value) -> Result<()> {
    if config.primary_key == ID_FIELD || config.key_of(doc).is_some() {
        return Ok(());
    }
    Err(TetherError::Shape(format!(
        "Document for '{collection}' has no primary key '{}'",
        config.primary_key
    )))
}

/// Normalize, verify, insert and read back one document, registering its key.
/// `options` go to the backend insert; nested documents are inserted without them.
/// Errors are returned as-is; compensation is left to the top-level caller.
pub fn insert_safely<'a>(
    ctx: Context<'a>,
    collection: &'a str,
    doc: Value,
    dependencies: &'a DependencyCollector,
    skip_normalization: bool,
    options: &'a StoreOptions,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        let config = ctx.graph.collection(collection);
        let doc = if skip_normalization {
            doc
        } else {
            normalize_insertion_doc(ctx, collection, doc, dependencies).await?
        };
        require_primary_key(config, collection, &doc)?;
        verify_insertion_doc(ctx, collection, &doc).await?;

        let result = ctx.backend.insert_one(collection, doc, options).await?;
        if !result.acknowledged {
            return Err(TetherError::Store(format!(
                "Insert in '{collection}' was not acknowledged"
            )));
        }
        let mut by_id = Map::new();
        by_id.insert(ID_FIELD.to_string(), result.inserted_id);
        let inserted = ctx
            .backend
            .find_one(collection, &Value::Object(by_id), &StoreOptions::new())
            .await?
            .ok_or_else(|| {
                TetherError::Store(format!("Inserted document vanished from '{collection}'"))
            })?;

        dependencies.add(collection, config.key_of(&inserted).cloned());
        Ok(inserted)
    }
    .boxed()
}

/// Same as [`insert_safely`] for a batch, inserted with a single `insert_many`.
pub async fn insert_many_safely(
    ctx: Context<'_>,
    collection: &str,
    docs: Vec<Value>,
    dependencies: &DependencyCollector,
    skip_normalization: bool,
    options: &StoreOptions,
) -> Result<Vec<Value>> {
    let config = ctx.graph.collection(collection);
    let mut normalized = Vec::with_capacity(docs.len());
    for doc in docs {
        let doc = if skip_normalization {
            doc
        } else {
            normalize_insertion_doc(ctx, collection, doc, dependencies).await?
        };
        require_primary_key(config, collection, &doc)?;
        verify_insertion_doc(ctx, collection, &doc).await?;
        normalized.push(doc);
    }

    let result = ctx
        .backend
        .insert_many(collection, normalized, options)
        .await?;
    if !result.acknowledged {
        return Err(TetherError::Store(format!(
            "Insert in '{collection}' was not acknowledged"
        )));
    }
    let mut within = Map::new();
    within.insert("$in".to_string(), Value::Array(result.inserted_ids.clone()));
    let mut by_ids = Map::new();
    by_ids.insert(ID_FIELD.to_string(), Value::Object(within));
    let found = ctx
        .backend
        .find(collection, &Value::Object(by_ids), &StoreOptions::new())
        .await?;

    // Keep the order of the input documents
    let inserted: Vec<Value> = result
        .inserted_ids
        .iter()
        .filter_map(|id| found.iter().find(|doc| doc.get(ID_FIELD) == Some(id)).cloned())
        .collect();
    dependencies.add(
        collection,
        inserted.iter().filter_map(|doc| config.key_of(doc).cloned()),
    );
    Ok(inserted)
}
