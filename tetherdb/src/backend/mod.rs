//! Boundary to the underlying document store.
//!
//! Everything above this trait deals in augmented queries and documents;
//! everything passed through it is plain. Options are an opaque bag handed
//! to the backend verbatim.

pub mod filter;
pub mod memory;
pub mod update;

pub use memory::MemoryBackend;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Identity field the backend assigns on insert and reads documents back by
pub const ID_FIELD: &str = "_id";

/// Backend-specific options (`skip`, `limit`, `sort`, `arrayFilters`, ...), forwarded untouched.
pub type StoreOptions = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub acknowledged: bool,
    pub inserted_id: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    pub acknowledged: bool,
    pub inserted_ids: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub acknowledged: bool,
    pub matched_count: u64,
    pub modified_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteResult {
    pub acknowledged: bool,
    pub deleted_count: u64,
}

impl DeleteResult {
    pub fn empty() -> Self {
        DeleteResult {
            acknowledged: true,
            deleted_count: 0,
        }
    }
}

/// The operations this layer consumes from a document store client.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn find(&self, collection: &str, filter: &Value, options: &StoreOptions)
        -> Result<Vec<Value>>;

    async fn find_one(
        &self,
        collection: &str,
        filter: &Value,
        options: &StoreOptions,
    ) -> Result<Option<Value>> {
        let options = with_option(options, "limit", Value::from(1));
        Ok(self.find(collection, filter, &options).await?.into_iter().next())
    }

    async fn count(&self, collection: &str, filter: &Value, options: &StoreOptions) -> Result<u64>;

    async fn insert_one(
        &self,
        collection: &str,
        doc: Value,
        options: &StoreOptions,
    ) -> Result<InsertOneResult>;

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Value>,
        options: &StoreOptions,
    ) -> Result<InsertManyResult>;

    async fn update_one(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: &StoreOptions,
    ) -> Result<UpdateResult>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: &StoreOptions,
    ) -> Result<UpdateResult>;

    async fn replace_one(
        &self,
        collection: &str,
        filter: &Value,
        doc: Value,
        options: &StoreOptions,
    ) -> Result<UpdateResult>;

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Value,
        options: &StoreOptions,
    ) -> Result<DeleteResult>;

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Value,
        options: &StoreOptions,
    ) -> Result<DeleteResult>;
}

/// Copy of `options` with one entry overridden
pub fn with_option(options: &StoreOptions, key: &str, value: Value) -> StoreOptions {
    let mut options = options.clone();
    options.insert(key.to_string(), value);
    options
}
