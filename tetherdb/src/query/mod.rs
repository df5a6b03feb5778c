//! Rewrites augmented filter queries into plain ones.
//!
//! At a foreign key position, `$in` and `$nin` may hold a sub-query on the
//! target collection (or an array mixing keys and sub-queries). Each
//! sub-query is resolved to the primary keys of the matching foreign
//! documents so the backend only ever sees plain key lists.

use crate::backend::StoreOptions;
use crate::error::{Result, TetherError};
use crate::graph::{push_dotted, stack_to_key, CollectionConfig, ForeignKeyConfig, Stack, StackItem};
use crate::store::Context;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{Map, Value};

/// Normalize an augmented filter query against `collection`.
pub fn normalize_filter_query<'a>(
    ctx: Context<'a>,
    collection: &'a str,
    query: &'a Value,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        let config = ctx.graph.collection(collection);
        let normalized = walk(ctx, collection, config, query, Vec::new()).await?;
        if normalized != *query {
            log::debug!("Normalized filter query on '{collection}': {normalized}");
        }
        Ok(normalized)
    }
    .boxed()
}

/// Primary keys of the documents of `collection` matching an augmented query.
pub fn primary_keys<'a>(
    ctx: Context<'a>,
    collection: &'a str,
    query: &'a Value,
) -> BoxFuture<'a, Result<Vec<Value>>> {
    async move {
        let config = ctx.graph.collection(collection);
        let normalized = normalize_filter_query(ctx, collection, query).await?;
        let docs = ctx
            .backend
            .find(collection, &normalized, &StoreOptions::new())
            .await?;
        Ok(docs
            .iter()
            .filter_map(|doc| config.key_of(doc).cloned())
            .collect())
    }
    .boxed()
}

fn walk<'a>(
    ctx: Context<'a>,
    collection: &'a str,
    config: &'a CollectionConfig,
    value: &'a Value,
    stack: Stack,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        match value {
            Value::Object(map) => {
                let entries = map.iter().map(|(key, child)| {
                    let stack = stack.clone();
                    async move {
                        let normalized =
                            walk_entry(ctx, collection, config, key, child, stack).await?;
                        Ok::<_, TetherError>((key.clone(), normalized))
                    }
                });
                let entries = try_join_all(entries).await?;
                Ok(Value::Object(entries.into_iter().collect::<Map<_, _>>()))
            }
            Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| walk(ctx, collection, config, item, stack.clone()));
                Ok(Value::Array(try_join_all(items).await?))
            }
            other => Ok(other.clone()),
        }
    }
    .boxed()
}

async fn walk_entry<'a>(
    ctx: Context<'a>,
    collection: &'a str,
    config: &'a CollectionConfig,
    key: &'a str,
    child: &'a Value,
    mut stack: Stack,
) -> Result<Value> {
    match key {
        // Raw expressions are handed to the store untouched
        "$expr" => Ok(child.clone()),
        "$and" | "$or" | "$nor" | "$not" => walk(ctx, collection, config, child, stack).await,
        "$elemMatch" => {
            stack.push(StackItem::Index(0));
            walk(ctx, collection, config, child, stack).await
        }
        "$in" | "$nin" => match config.foreign_key_for_query(&stack) {
            Some(fk) => resolve_membership(ctx, collection, fk, &stack, child).await,
            None => Ok(child.clone()),
        },
        op if op.starts_with('$') => Ok(child.clone()),
        field => {
            push_dotted(&mut stack, field);
            walk(ctx, collection, config, child, stack).await
        }
    }
}

/// Turn the operand of `$in`/`$nin` at a foreign key into a plain list of keys.
async fn resolve_membership<'a>(
    ctx: Context<'a>,
    collection: &str,
    fk: &'a ForeignKeyConfig,
    stack: &[StackItem],
    operand: &'a Value,
) -> Result<Value> {
    match operand {
        Value::Object(_) => Ok(Value::Array(
            primary_keys(ctx, &fk.collection, operand).await?,
        )),
        Value::Array(items) => {
            let resolved = items.iter().map(|item| async move {
                if item.is_object() {
                    primary_keys(ctx, &fk.collection, item).await
                } else {
                    Ok(vec![item.clone()])
                }
            });
            let resolved = try_join_all(resolved).await?;
            Ok(Value::Array(resolved.into_iter().flatten().collect()))
        }
        _ => Err(TetherError::Shape(format!(
            "Invalid query selector for foreign key '{}' in collection '{collection}': \
             $in and $nin must hold arrays or foreign filter queries",
            stack_to_key(stack)
        ))),
    }
}
