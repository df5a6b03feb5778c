use crate::backend::{with_option, StoreOptions};
use crate::error::Result;
use crate::query::normalize_filter_query;
use crate::store::Context;
use serde_json::{json, Value};

/// Documents of a collection matching a conjunction of filters, not fetched yet.
/// Extending returns a new set; every fetch goes back to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct LazyDocuments {
    collection: String,
    queries: Vec<Value>,
}

impl LazyDocuments {
    pub fn new(collection: impl Into<String>, queries: Vec<Value>) -> Self {
        LazyDocuments {
            collection: collection.into(),
            queries,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The combined filter: `{}` or `{$and: [...]}`
    pub fn query(&self) -> Value {
        if self.queries.is_empty() {
            json!({})
        } else {
            json!({ "$and": self.queries })
        }
    }

    pub fn extend(&self, query: Value) -> Self {
        let mut queries = self.queries.clone();
        queries.push(query);
        LazyDocuments::new(self.collection.clone(), queries)
    }

    pub async fn fetch(&self, ctx: Context<'_>) -> Result<Vec<Value>> {
        self.find(ctx, &StoreOptions::new()).await
    }

    /// Fetch only the document at `index`
    pub async fn fetch_one(&self, ctx: Context<'_>, index: usize) -> Result<Option<Value>> {
        let options = with_option(
            &with_option(&StoreOptions::new(), "skip", Value::from(index)),
            "limit",
            Value::from(1),
        );
        Ok(self.find(ctx, &options).await?.into_iter().next())
    }

    async fn find(&self, ctx: Context<'_>, options: &StoreOptions) -> Result<Vec<Value>> {
        let query = self.query();
        let normalized = normalize_filter_query(ctx, &self.collection, &query).await?;
        ctx.backend.find(&self.collection, &normalized, options).await
    }
}

/// A value a selector can run on: already materialized, or still lazy.
#[derive(Debug, Clone, PartialEq)]
pub enum Selectable {
    Value(Value),
    Lazy(LazyDocuments),
}

impl Selectable {
    pub async fn materialize(self, ctx: Context<'_>) -> Result<Value> {
        match self {
            Selectable::Value(value) => Ok(value),
            Selectable::Lazy(lazy) => Ok(Value::Array(lazy.fetch(ctx).await?)),
        }
    }

    /// Arrays and lazy sets; the kinds selectors distribute over
    pub fn is_arrayish(&self) -> bool {
        matches!(self, Selectable::Lazy(_) | Selectable::Value(Value::Array(_)))
    }
}

impl From<Value> for Selectable {
    fn from(value: Value) -> Self {
        Selectable::Value(value)
    }
}

impl From<LazyDocuments> for Selectable {
    fn from(lazy: LazyDocuments) -> Self {
        Selectable::Lazy(lazy)
    }
}
