use crate::backend::{
    DeleteResult, DocumentBackend, MemoryBackend, StoreOptions, UpdateResult,
};
use crate::cascade::{self, References};
use crate::error::{Result, TetherError};
use crate::graph::{build_graph, Graph};
use crate::insertion::{
    insert_many_safely, insert_safely, normalize_insertion_doc, DependencyCollector,
};
use crate::query::normalize_filter_query;
use crate::schema::{parse_schema, parse_schema_str, Schema};
use crate::selector::{select, Selectable, Selector};
use crate::validation::{self, verify_insertion_doc, DanglingKeys};
use parking_lot::RwLock;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// What every operation needs: the backend to talk to and the graph to follow.
/// Handed down explicitly through normalization, cascades and selectors.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub backend: &'a dyn DocumentBackend,
    pub graph: &'a Graph,
}

impl<'a> Context<'a> {
    pub fn new(backend: &'a dyn DocumentBackend, graph: &'a Graph) -> Self {
        Context { backend, graph }
    }
}

/// Per-call flags. `backend` is forwarded to the backend untouched.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    /// Treat the filter (or insertion document) as plain
    pub skip_normalization: bool,
    /// Delete only the matched documents, ignoring inbound references
    pub skip_cascade: bool,
    /// Delete at most one match
    pub single_match: bool,
    /// Update every match instead of the first one
    pub multi: bool,
    pub backend: StoreOptions,
}

impl OperationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_normalization(mut self) -> Self {
        self.skip_normalization = true;
        self
    }

    pub fn skip_cascade(mut self) -> Self {
        self.skip_cascade = true;
        self
    }

    pub fn single_match(mut self) -> Self {
        self.single_match = true;
        self
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    /// Add one backend option (`limit`, `sort`, `arrayFilters`, ...)
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.backend.insert(key.to_string(), value);
        self
    }
}

/// The main entry point.
/// Owns the backend and the compiled graph, and hands out collection handles.
pub struct Store {
    backend: Arc<dyn DocumentBackend>,
    graph: RwLock<Arc<Graph>>,
}

impl Store {
    pub fn new(backend: Arc<dyn DocumentBackend>, graph: Graph) -> Self {
        Store {
            backend,
            graph: RwLock::new(Arc::new(graph)),
        }
    }

    /// A store over a fresh [`MemoryBackend`] with no schema
    pub fn in_memory() -> Self {
        Store::new(Arc::new(MemoryBackend::new()), Graph::default())
    }

    pub fn with_schema(backend: Arc<dyn DocumentBackend>, schema: &Schema) -> Result<Self> {
        Ok(Store::new(backend, build_graph(schema)?))
    }

    /// Compile `schema` and swap it in. On error the current graph stays.
    pub fn load_schema(&self, schema: &Schema) -> Result<()> {
        let graph = build_graph(schema)?;
        log::info!("Loaded schema with {} collections", graph.len());
        *self.graph.write() = Arc::new(graph);
        Ok(())
    }

    pub fn load_schema_str(&self, content: &str) -> Result<()> {
        self.load_schema(&parse_schema_str(content)?)
    }

    pub fn load_schema_file(&self, path: &Path) -> Result<()> {
        self.load_schema(&parse_schema(path)?)
    }

    /// Snapshot of the current graph. Operations hold one for their whole duration.
    pub fn graph(&self) -> Arc<Graph> {
        self.graph.read().clone()
    }

    pub fn backend(&self) -> &dyn DocumentBackend {
        self.backend.as_ref()
    }

    pub fn collection(&self, name: &str) -> Collection<'_> {
        Collection {
            store: self,
            name: name.to_string(),
        }
    }

    /// Foreign key values across the whole store that point at nothing
    pub async fn find_dangling_keys(
        &self,
        batch_size: usize,
        limit: Option<usize>,
    ) -> Result<DanglingKeys> {
        let graph = self.graph();
        let ctx = Context::new(self.backend(), &graph);
        validation::find_dangling_keys(ctx, batch_size, limit).await
    }
}

/// A handle to one collection of a store.
pub struct Collection<'a> {
    store: &'a Store,
    name: String,
}

impl<'a> Collection<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn normalized(&self, ctx: Context<'_>, query: Value, options: &OperationOptions) -> Result<Value> {
        if options.skip_normalization {
            Ok(query)
        } else {
            normalize_filter_query(ctx, &self.name, &query).await
        }
    }

    fn key_filter(&self, graph: &Graph, key: Value) -> Value {
        graph.collection(&self.name).key_filter(key)
    }

    fn keys_filter(&self, graph: &Graph, keys: Vec<Value>) -> Value {
        graph.collection(&self.name).keys_filter(keys)
    }

    // Reads

    pub async fn find(&self, query: Value, options: &OperationOptions) -> Result<Vec<Value>> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let query = self.normalized(ctx, query, options).await?;
        ctx.backend.find(&self.name, &query, &options.backend).await
    }

    pub async fn find_one(&self, query: Value, options: &OperationOptions) -> Result<Option<Value>> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let query = self.normalized(ctx, query, options).await?;
        ctx.backend.find_one(&self.name, &query, &options.backend).await
    }

    pub async fn find_by_key(&self, key: Value, options: &OperationOptions) -> Result<Option<Value>> {
        let filter = self.key_filter(&self.store.graph(), key);
        self.find_one(filter, &options.clone().skip_normalization()).await
    }

    pub async fn find_by_keys(&self, keys: Vec<Value>, options: &OperationOptions) -> Result<Vec<Value>> {
        let filter = self.keys_filter(&self.store.graph(), keys);
        self.find(filter, &options.clone().skip_normalization()).await
    }

    pub async fn count(&self, query: Value, options: &OperationOptions) -> Result<u64> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let query = self.normalized(ctx, query, options).await?;
        ctx.backend.count(&self.name, &query, &options.backend).await
    }

    pub async fn count_by_keys(&self, keys: Vec<Value>, options: &OperationOptions) -> Result<u64> {
        let filter = self.keys_filter(&self.store.graph(), keys);
        self.count(filter, &options.clone().skip_normalization()).await
    }

    pub async fn has(&self, query: Value, options: &OperationOptions) -> Result<bool> {
        let options = options.clone().with("limit", Value::from(1));
        Ok(self.count(query, &options).await? > 0)
    }

    pub async fn has_key(&self, key: Value) -> Result<bool> {
        let filter = self.key_filter(&self.store.graph(), key);
        self.has(filter, &OperationOptions::new().skip_normalization()).await
    }

    /// Whether every key exists, or with `some` whether at least one does
    pub async fn has_keys(&self, keys: Vec<Value>, some: bool) -> Result<bool> {
        let mut distinct: Vec<Value> = Vec::with_capacity(keys.len());
        for key in keys {
            if !distinct.contains(&key) {
                distinct.push(key);
            }
        }
        let expected = distinct.len() as u64;
        let mut options = OperationOptions::new();
        if some {
            options = options.with("limit", Value::from(1));
        }
        let count = self.count_by_keys(distinct, &options).await?;
        Ok(if some { count > 0 } else { count == expected })
    }

    /// Documents in other collections referencing any of `keys` here
    pub async fn find_references(&self, keys: Vec<Value>) -> Result<References> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        cascade::find_references(ctx, &self.name, keys).await
    }

    // Inserts

    /// Insert one document, nested documents first. Returns it as stored.
    pub async fn insert(&self, doc: Value, options: &OperationOptions) -> Result<Value> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let dependencies = DependencyCollector::new();
        let inserted = insert_safely(
            ctx,
            &self.name,
            doc,
            &dependencies,
            options.skip_normalization,
            &options.backend,
        )
        .await;
        match inserted {
            Ok(inserted) => Ok(inserted),
            Err(e) => Err(dependencies.rollback(ctx, e).await),
        }
    }

    pub async fn insert_many(&self, docs: Vec<Value>, options: &OperationOptions) -> Result<Vec<Value>> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let dependencies = DependencyCollector::new();
        let inserted = insert_many_safely(
            ctx,
            &self.name,
            docs,
            &dependencies,
            options.skip_normalization,
            &options.backend,
        )
        .await;
        match inserted {
            Ok(inserted) => Ok(inserted),
            Err(e) => Err(dependencies.rollback(ctx, e).await),
        }
    }

    // Replacements

    /// Replace the first match. Nested documents in `doc` are inserted like on insert.
    pub async fn replace_one(
        &self,
        query: Value,
        doc: Value,
        options: &OperationOptions,
    ) -> Result<UpdateResult> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let query = self.normalized(ctx, query, options).await?;
        self.replace_matching(ctx, &query, doc, options).await
    }

    pub async fn replace_by_key(
        &self,
        key: Value,
        doc: Value,
        options: &OperationOptions,
    ) -> Result<UpdateResult> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let filter = self.key_filter(&graph, key);
        self.replace_matching(ctx, &filter, doc, options).await
    }

    /// Replace the first match; returns the document as it was before.
    pub async fn find_one_and_replace(
        &self,
        query: Value,
        doc: Value,
        options: &OperationOptions,
    ) -> Result<Option<Value>> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let query = self.normalized(ctx, query, options).await?;
        self.find_and_replace(ctx, &query, doc, options).await
    }

    pub async fn find_by_key_and_replace(
        &self,
        key: Value,
        doc: Value,
        options: &OperationOptions,
    ) -> Result<Option<Value>> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let filter = self.key_filter(&graph, key);
        self.find_and_replace(ctx, &filter, doc, options).await
    }

    // Updates

    /// Update the first match, or every match with `multi`. Update operators are
    /// passed through as-is.
    pub async fn update(
        &self,
        query: Value,
        update: Value,
        options: &OperationOptions,
    ) -> Result<UpdateResult> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let query = self.normalized(ctx, query, options).await?;
        if options.multi {
            ctx.backend
                .update_many(&self.name, &query, &update, &options.backend)
                .await
        } else {
            ctx.backend
                .update_one(&self.name, &query, &update, &options.backend)
                .await
        }
    }

    pub async fn update_by_key(
        &self,
        key: Value,
        update: Value,
        options: &OperationOptions,
    ) -> Result<UpdateResult> {
        let filter = self.key_filter(&self.store.graph(), key);
        self.update(filter, update, &options.clone().skip_normalization())
            .await
    }

    pub async fn update_by_keys(
        &self,
        keys: Vec<Value>,
        update: Value,
        options: &OperationOptions,
    ) -> Result<UpdateResult> {
        let filter = self.keys_filter(&self.store.graph(), keys);
        self.update(filter, update, &options.clone().skip_normalization().multi())
            .await
    }

    /// Update the first match; returns the document as it was before.
    pub async fn find_one_and_update(
        &self,
        query: Value,
        update: Value,
        options: &OperationOptions,
    ) -> Result<Option<Value>> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let query = self.normalized(ctx, query, options).await?;
        let Some(before) = ctx.backend.find_one(&self.name, &query, &options.backend).await? else {
            return Ok(None);
        };
        let filter = self.matched_filter(&graph, &before)?;
        ctx.backend
            .update_one(&self.name, &filter, &update, &options.backend)
            .await?;
        Ok(Some(before))
    }

    pub async fn find_by_key_and_update(
        &self,
        key: Value,
        update: Value,
        options: &OperationOptions,
    ) -> Result<Option<Value>> {
        let filter = self.key_filter(&self.store.graph(), key);
        self.find_one_and_update(filter, update, &options.clone().skip_normalization())
            .await
    }

    /// Update every document with one of `keys`; returns them as they were before.
    pub async fn find_by_keys_and_update(
        &self,
        keys: Vec<Value>,
        update: Value,
        options: &OperationOptions,
    ) -> Result<Vec<Value>> {
        let docs = self.find_by_keys(keys.clone(), options).await?;
        self.update_by_keys(keys, update, options).await?;
        Ok(docs)
    }

    // Deletes

    /// Delete every match (or one, with `single_match`) and apply the delete
    /// policies of every inbound reference. Returns the result of the base deletion.
    pub async fn delete(&self, query: Value, options: &OperationOptions) -> Result<DeleteResult> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let query = self.normalized(ctx, query, options).await?;
        if options.skip_cascade {
            return if options.single_match {
                ctx.backend.delete_one(&self.name, &query, &options.backend).await
            } else {
                ctx.backend.delete_many(&self.name, &query, &options.backend).await
            };
        }
        cascade::cascade_delete(
            ctx,
            &self.name,
            query,
            options.single_match,
            options.backend.clone(),
        )
        .await
    }

    pub async fn delete_by_key(&self, key: Value, options: &OperationOptions) -> Result<DeleteResult> {
        let filter = self.key_filter(&self.store.graph(), key);
        self.delete(filter, &options.clone().skip_normalization().single_match())
            .await
    }

    pub async fn delete_by_keys(
        &self,
        keys: Vec<Value>,
        options: &OperationOptions,
    ) -> Result<DeleteResult> {
        let filter = self.keys_filter(&self.store.graph(), keys);
        self.delete(filter, &options.clone().skip_normalization())
            .await
    }

    /// Delete every document of the collection, with cascades
    pub async fn drop(&self, options: &OperationOptions) -> Result<DeleteResult> {
        self.delete(Value::Object(Default::default()), &options.clone().skip_normalization())
            .await
    }

    /// Delete the first match; returns it.
    pub async fn find_one_and_delete(
        &self,
        query: Value,
        options: &OperationOptions,
    ) -> Result<Option<Value>> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        let query = self.normalized(ctx, query, options).await?;
        let Some(found) = ctx.backend.find_one(&self.name, &query, &options.backend).await? else {
            return Ok(None);
        };
        let filter = self.matched_filter(&graph, &found)?;
        self.delete(filter, &options.clone().skip_normalization().single_match())
            .await?;
        Ok(Some(found))
    }

    pub async fn find_by_key_and_delete(
        &self,
        key: Value,
        options: &OperationOptions,
    ) -> Result<Option<Value>> {
        let filter = self.key_filter(&self.store.graph(), key);
        self.find_one_and_delete(filter, &options.clone().skip_normalization())
            .await
    }

    /// Delete every document with one of `keys`; returns them.
    pub async fn find_by_keys_and_delete(
        &self,
        keys: Vec<Value>,
        options: &OperationOptions,
    ) -> Result<Vec<Value>> {
        let docs = self.find_by_keys(keys.clone(), options).await?;
        self.delete_by_keys(keys, options).await?;
        Ok(docs)
    }

    // Selection

    /// Run a selector over the whole collection, fetching only what it crosses into.
    pub async fn select(&self, selector: &Selector) -> Result<Value> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        selector.select_in(ctx, &self.name).await
    }

    /// Run a selector over a value already read from this collection
    pub async fn select_from(&self, selector: &Selector, value: impl Into<Selectable>) -> Result<Value> {
        let graph = self.store.graph();
        let ctx = Context::new(self.store.backend(), &graph);
        select(ctx, selector, value.into(), &self.name, Vec::new()).await
    }

    // Helpers

    /// `query` is already plain. Whatever `doc` inserted is rolled back on failure.
    async fn replace_matching(
        &self,
        ctx: Context<'_>,
        query: &Value,
        doc: Value,
        options: &OperationOptions,
    ) -> Result<UpdateResult> {
        let dependencies = DependencyCollector::new();
        let result = async {
            let doc = if options.skip_normalization {
                doc
            } else {
                normalize_insertion_doc(ctx, &self.name, doc, &dependencies).await?
            };
            verify_insertion_doc(ctx, &self.name, &doc).await?;
            ctx.backend
                .replace_one(&self.name, query, doc, &options.backend)
                .await
        }
        .await;
        match result {
            Ok(result) => Ok(result),
            Err(e) => Err(dependencies.rollback(ctx, e).await),
        }
    }

    async fn find_and_replace(
        &self,
        ctx: Context<'_>,
        query: &Value,
        doc: Value,
        options: &OperationOptions,
    ) -> Result<Option<Value>> {
        let Some(before) = ctx.backend.find_one(&self.name, query, &options.backend).await? else {
            return Ok(None);
        };
        let filter = self.matched_filter(ctx.graph, &before)?;
        self.replace_matching(ctx, &filter, doc, options).await?;
        Ok(Some(before))
    }

    /// Filter on the primary key of a document that was just read
    fn matched_filter(&self, graph: &Graph, doc: &Value) -> Result<Value> {
        let config = graph.collection(&self.name);
        let key = config.key_of(doc).cloned().ok_or_else(|| {
            TetherError::Store(format!(
                "Document in '{}' has no primary key '{}'",
                self.name, config.primary_key
            ))
        })?;
        Ok(config.key_filter(key))
    }
}
