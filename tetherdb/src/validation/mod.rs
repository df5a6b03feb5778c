use crate::backend::{with_option, StoreOptions};
use crate::error::{Result, TetherError};
use crate::graph::ForeignKeyConfig;
use crate::schema::InsertPolicy;
use crate::store::Context;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Dangling foreign key values: collection -> foreign key -> values with no target document
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DanglingKeys {
    #[serde(flatten)]
    pub collections: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
}

impl DanglingKeys {
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Total number of dangling values reported
    pub fn len(&self) -> usize {
        self.collections
            .values()
            .flat_map(|keys| keys.values())
            .map(Vec::len)
            .sum()
    }
}

/// Check a plain insertion document before it reaches the store.
/// Every foreign key with `onInsert: VERIFY` must resolve to an existing document;
/// a null is only accepted when the key is nullable. Missing fields are not checked.
pub async fn verify_insertion_doc(ctx: Context<'_>, collection: &str, doc: &Value) -> Result<()> {
    let config = ctx.graph.collection(collection);
    let mut errors = Vec::new();

    for (name, fk) in &config.foreign_keys {
        if fk.on_insert == InsertPolicy::Bypass {
            continue;
        }
        let mut keys = Vec::new();
        for value in fk.path.values_in(doc) {
            if value.is_null() {
                if !fk.nullable {
                    errors.push(format!("Foreign key '{name}' is null but not nullable"));
                }
                continue;
            }
            if !keys.contains(value) {
                keys.push(value.clone());
            }
        }
        if keys.is_empty() {
            continue;
        }
        let missing = missing_keys(ctx, fk, keys).await?;
        if !missing.is_empty() {
            errors.push(format!(
                "Foreign key '{name}' references missing documents in '{}': {}",
                fk.collection,
                Value::Array(missing)
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(TetherError::ReferentialIntegrity(format!(
            "Invalid insertion in '{collection}': {}",
            errors.join("; ")
        )))
    }
}

/// Keys (in input order) that have no document in the foreign key's target collection
async fn missing_keys(ctx: Context<'_>, fk: &ForeignKeyConfig, keys: Vec<Value>) -> Result<Vec<Value>> {
    let target = ctx.graph.collection(&fk.collection);
    let found = ctx
        .backend
        .find(&fk.collection, &target.keys_filter(keys.clone()), &StoreOptions::new())
        .await?;
    let found: Vec<&Value> = found.iter().filter_map(|doc| target.key_of(doc)).collect();
    Ok(keys.into_iter().filter(|key| !found.iter().any(|f| *f == key)).collect())
}

/// Scan every collection declaring foreign keys for values pointing at nothing.
/// Documents are read `batch_size` at a time; the scan stops once `limit` values are found.
pub async fn find_dangling_keys(
    ctx: Context<'_>,
    batch_size: usize,
    limit: Option<usize>,
) -> Result<DanglingKeys> {
    let batch_size = batch_size.max(1);
    let mut report = DanglingKeys::default();
    let mut total = 0;

    for (collection, config) in ctx.graph.collections() {
        if config.foreign_keys.is_empty() {
            continue;
        }
        let mut seen: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        let mut skip = 0;
        loop {
            let options = with_option(
                &with_option(&StoreOptions::new(), "skip", Value::from(skip)),
                "limit",
                Value::from(batch_size),
            );
            let batch = ctx
                .backend
                .find(collection, &Value::Object(Default::default()), &options)
                .await?;
            if batch.is_empty() {
                break;
            }
            skip += batch.len();

            for (name, fk) in &config.foreign_keys {
                let seen = seen.entry(name.as_str()).or_default();
                let mut keys = Vec::new();
                for value in batch.iter().flat_map(|doc| fk.path.values_in(doc)) {
                    if value.is_null() || !seen.insert(value.to_string()) {
                        continue;
                    }
                    keys.push(value.clone());
                }
                if keys.is_empty() {
                    continue;
                }
                let mut missing = missing_keys(ctx, fk, keys).await?;
                if let Some(limit) = limit {
                    missing.truncate(limit.saturating_sub(total));
                }
                if missing.is_empty() {
                    continue;
                }
                total += missing.len();
                report
                    .collections
                    .entry(collection.clone())
                    .or_default()
                    .entry(name.clone())
                    .or_default()
                    .extend(missing);
                if limit.is_some_and(|limit| total >= limit) {
                    log::debug!("Dangling key scan stopped after {total} values");
                    return Ok(report);
                }
            }

            if batch.len() < batch_size {
                break;
            }
        }
    }

    log::debug!("Dangling key scan found {total} values");
    Ok(report)
}
