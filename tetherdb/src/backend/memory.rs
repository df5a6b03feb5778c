use super::filter::{matches, resolve_path, sort_order};
use super::update::apply_update;
use super::{
    DeleteResult, DocumentBackend, InsertManyResult, InsertOneResult, StoreOptions, UpdateResult,
    ID_FIELD,
};
use crate::error::{Result, TetherError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;

/// An in-process document store. Documents keep insertion order; `_id` values are ULIDs
/// unless the caller supplies one.
#[derive(Default)]
pub struct MemoryBackend {
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every document in a collection
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn matching_indices(docs: &[Value], filter: &Value) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for (i, doc) in docs.iter().enumerate() {
            if matches(doc, filter)? {
                out.push(i);
            }
        }
        Ok(out)
    }

    fn prepare_insert(docs: &[Value], mut doc: Value) -> Result<(Value, Value)> {
        let Value::Object(map) = &mut doc else {
            return Err(TetherError::Store("Only objects can be inserted".into()));
        };
        let id = map
            .entry(ID_FIELD)
            .or_insert_with(|| Value::String(ulid::Ulid::new().to_string().to_lowercase()))
            .clone();
        let duplicate = docs
            .iter()
            .any(|existing| existing.get(ID_FIELD) == Some(&id));
        if duplicate {
            return Err(TetherError::Store(format!("Duplicate key: {ID_FIELD} = {id}")));
        }
        Ok((doc, id))
    }

    fn update(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: &StoreOptions,
        single: bool,
    ) -> Result<UpdateResult> {
        let array_filters = match options.get("arrayFilters") {
            Some(Value::Array(filters)) => filters.clone(),
            Some(_) => return Err(TetherError::Store("'arrayFilters' must be an array".into())),
            None => Vec::new(),
        };
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        let mut indices = Self::matching_indices(docs, filter)?;
        if single {
            indices.truncate(1);
        }

        // Apply to copies first so a failing update leaves nothing half-written
        let mut updated = Vec::with_capacity(indices.len());
        let mut modified = 0;
        for &i in &indices {
            let mut copy = docs[i].clone();
            if apply_update(&mut copy, update, &array_filters)? {
                modified += 1;
            }
            if copy.get(ID_FIELD) != docs[i].get(ID_FIELD) {
                return Err(TetherError::Store(format!("'{ID_FIELD}' is immutable")));
            }
            updated.push((i, copy));
        }
        for (i, copy) in updated {
            docs[i] = copy;
        }

        Ok(UpdateResult {
            acknowledged: true,
            matched_count: indices.len() as u64,
            modified_count: modified,
        })
    }

    fn delete(&self, collection: &str, filter: &Value, single: bool) -> Result<DeleteResult> {
        let mut collections = self.collections.lock();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(DeleteResult::empty());
        };
        let mut indices = Self::matching_indices(docs, filter)?;
        if single {
            indices.truncate(1);
        }
        for &i in indices.iter().rev() {
            docs.remove(i);
        }
        Ok(DeleteResult {
            acknowledged: true,
            deleted_count: indices.len() as u64,
        })
    }
}

fn option_usize(options: &StoreOptions, key: &str) -> Result<Option<usize>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| TetherError::Store(format!("'{key}' must be a non-negative integer"))),
    }
}

fn sort_documents(docs: &mut [Value], sort: &Value) -> Result<()> {
    let Value::Object(order) = sort else {
        return Err(TetherError::Store("'sort' must be an object".into()));
    };
    let keys: Vec<(String, bool)> = order
        .iter()
        .map(|(field, direction)| (field.clone(), direction.as_i64().unwrap_or(1) < 0))
        .collect();
    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let left = resolve_path(a, field).first().copied().unwrap_or(&Value::Null);
            let right = resolve_path(b, field).first().copied().unwrap_or(&Value::Null);
            let ordering = sort_order(left, right);
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering.is_ne() {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(())
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        options: &StoreOptions,
    ) -> Result<Vec<Value>> {
        let mut found = {
            let collections = self.collections.lock();
            let docs = collections.get(collection).map(Vec::as_slice).unwrap_or(&[]);
            let mut found = Vec::new();
            for doc in docs {
                if matches(doc, filter)? {
                    found.push(doc.clone());
                }
            }
            found
        };
        if let Some(sort) = options.get("sort") {
            sort_documents(&mut found, sort)?;
        }
        let skip = option_usize(options, "skip")?.unwrap_or(0);
        let limit = option_usize(options, "limit")?.filter(|&n| n > 0);
        let found = found.into_iter().skip(skip);
        Ok(match limit {
            Some(limit) => found.take(limit).collect(),
            None => found.collect(),
        })
    }

    async fn count(&self, collection: &str, filter: &Value, options: &StoreOptions) -> Result<u64> {
        Ok(self.find(collection, filter, options).await?.len() as u64)
    }

    async fn insert_one(
        &self,
        collection: &str,
        doc: Value,
        _options: &StoreOptions,
    ) -> Result<InsertOneResult> {
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        let (doc, id) = Self::prepare_insert(docs, doc)?;
        docs.push(doc);
        Ok(InsertOneResult {
            acknowledged: true,
            inserted_id: id,
        })
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Value>,
        _options: &StoreOptions,
    ) -> Result<InsertManyResult> {
        let mut collections = self.collections.lock();
        let existing = collections.entry(collection.to_string()).or_default();
        // All-or-nothing: validate the whole batch before touching the collection
        let mut staged: Vec<Value> = Vec::with_capacity(docs.len());
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            let (doc, id) = {
                let (doc, id) = Self::prepare_insert(existing, doc)?;
                if staged.iter().any(|d| d.get(ID_FIELD) == Some(&id)) {
                    return Err(TetherError::Store(format!("Duplicate key: {ID_FIELD} = {id}")));
                }
                (doc, id)
            };
            staged.push(doc);
            ids.push(id);
        }
        existing.extend(staged);
        Ok(InsertManyResult {
            acknowledged: true,
            inserted_ids: ids,
        })
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: &StoreOptions,
    ) -> Result<UpdateResult> {
        self.update(collection, filter, update, options, true)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: &StoreOptions,
    ) -> Result<UpdateResult> {
        self.update(collection, filter, update, options, false)
    }

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Value,
        doc: Value,
        _options: &StoreOptions,
    ) -> Result<UpdateResult> {
        let Value::Object(mut replacement) = doc else {
            return Err(TetherError::Store("Replacement must be an object".into()));
        };
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(TetherError::Store(
                "Replacement document must not contain update operators".into(),
            ));
        }
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        let Some(&i) = Self::matching_indices(docs, filter)?.first() else {
            return Ok(UpdateResult {
                acknowledged: true,
                ..UpdateResult::default()
            });
        };
        let id = docs[i].get(ID_FIELD).cloned().unwrap_or(Value::Null);
        if let Some(given) = replacement.get(ID_FIELD) {
            if *given != id {
                return Err(TetherError::Store(format!("'{ID_FIELD}' is immutable")));
            }
        }
        replacement.insert(ID_FIELD.to_string(), id);
        let replacement = Value::Object(replacement);
        let modified = docs[i] != replacement;
        docs[i] = replacement;
        Ok(UpdateResult {
            acknowledged: true,
            matched_count: 1,
            modified_count: modified as u64,
        })
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Value,
        _options: &StoreOptions,
    ) -> Result<DeleteResult> {
        self.delete(collection, filter, true)
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Value,
        _options: &StoreOptions,
    ) -> Result<DeleteResult> {
        self.delete(collection, filter, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::with_option;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_ids() {
        let backend = MemoryBackend::new();
        let none = StoreOptions::new();
        let result = backend
            .insert_one("Book", json!({ "title": "Dune" }), &none)
            .await
            .unwrap();
        assert!(result.inserted_id.is_string());

        let explicit = backend
            .insert_one("Book", json!({ "_id": "b2", "title": "Emma" }), &none)
            .await
            .unwrap();
        assert_eq!(explicit.inserted_id, json!("b2"));

        let duplicate = backend
            .insert_one("Book", json!({ "_id": "b2" }), &none)
            .await;
        assert!(duplicate.is_err());
        assert_eq!(backend.documents("Book").len(), 2);
    }

    #[tokio::test]
    async fn test_insert_many_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        let none = StoreOptions::new();
        let result = backend
            .insert_many(
                "Book",
                vec![json!({ "_id": "b1" }), json!({ "_id": "b1" })],
                &none,
            )
            .await;
        assert!(result.is_err());
        assert!(backend.documents("Book").is_empty());
    }

    #[tokio::test]
    async fn test_find_options() {
        let backend = MemoryBackend::new();
        let none = StoreOptions::new();
        for (id, pages) in [("b1", 300), ("b2", 100), ("b3", 200)] {
            backend
                .insert_one("Book", json!({ "_id": id, "pages": pages }), &none)
                .await
                .unwrap();
        }
        let sorted = with_option(&none, "sort", json!({ "pages": -1 }));
        let options = with_option(&with_option(&sorted, "skip", json!(1)), "limit", json!(1));
        let found = backend.find("Book", &json!({}), &options).await.unwrap();
        assert_eq!(found, vec![json!({ "_id": "b3", "pages": 200 })]);

        let first = backend.find_one("Book", &json!({ "pages": { "$lt": 250 } }), &none).await.unwrap();
        assert_eq!(first.unwrap()["_id"], "b2");
        assert_eq!(backend.count("Book", &json!({}), &none).await.unwrap(), 3);
        assert!(backend.find("Nothing", &json!({}), &none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_replace_delete() {
        let backend = MemoryBackend::new();
        let none = StoreOptions::new();
        backend
            .insert_many(
                "Book",
                vec![json!({ "_id": "b1", "n": 1 }), json!({ "_id": "b2", "n": 1 })],
                &none,
            )
            .await
            .unwrap();

        let one = backend
            .update_one("Book", &json!({ "n": 1 }), &json!({ "$set": { "n": 2 } }), &none)
            .await
            .unwrap();
        assert_eq!((one.matched_count, one.modified_count), (1, 1));

        let many = backend
            .update_many("Book", &json!({}), &json!({ "$set": { "n": 2 } }), &none)
            .await
            .unwrap();
        assert_eq!((many.matched_count, many.modified_count), (2, 1));

        let replaced = backend
            .replace_one("Book", &json!({ "_id": "b1" }), json!({ "title": "Dune" }), &none)
            .await
            .unwrap();
        assert_eq!(replaced.matched_count, 1);
        assert_eq!(backend.documents("Book")[0], json!({ "_id": "b1", "title": "Dune" }));

        let id_change = backend
            .update_one("Book", &json!({ "_id": "b1" }), &json!({ "$set": { "_id": "zz" } }), &none)
            .await;
        assert!(id_change.is_err());

        let deleted = backend.delete_many("Book", &json!({}), &none).await.unwrap();
        assert_eq!(deleted.deleted_count, 2);
        let nothing = backend.delete_one("Book", &json!({}), &none).await.unwrap();
        assert_eq!(nothing.deleted_count, 0);
    }
}
