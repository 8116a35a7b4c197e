//! Embedded persistence layer: typed records over SQLite with
//! unit-of-work contexts, chained saves and a load-once storage facade.
//! This crate is the single source of truth for persistence invariants.

pub mod context;
pub mod logging;
pub mod model;
pub mod query;
pub mod storage;
pub mod store;

pub use context::{Context, Fetched, SaveError, SaveResult, Task};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::{
    AttrKind, AttrMap, AttributeDef, EntityDef, EntityId, Model, ModelViolation, Record,
    RecordError, Value,
};
pub use query::{CompareOp, FetchRequest, Predicate, QueryError, QueryResult, SortSpec};
pub use storage::{Storage, StorageConfig};
pub use store::{
    FileProtection, LoadError, LoadResult, MissingFilePolicy, StoreDescriptor, StoreOptions,
    STORE_FILE_EXT,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
