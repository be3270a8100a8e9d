//! Persistence backends behind the `Store` capability.

pub mod flat_file;
pub mod mapping;
pub mod relational;
pub mod schema;
pub mod traits;

pub use flat_file::FlatFileStore;
pub use relational::{RelationalStore, TableRows, encode_snapshot};
pub use traits::{BackendHealth, BackendKind, Statement, Store};
