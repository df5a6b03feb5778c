pub mod backend;
pub mod cascade;
pub mod error;
pub mod graph;
pub mod insertion;
pub mod query;
pub mod schema;
pub mod selector;
pub mod store;
pub mod validation;

pub use backend::{DocumentBackend, MemoryBackend, StoreOptions};
pub use error::{Result, TetherError};
pub use graph::{build_graph, Graph};
pub use schema::Schema;
pub use selector::{parse_selector, Predicate, SelectArg, Selector};
pub use store::{Collection, Context, OperationOptions, Store};
