//! Durable store configuration and SQLite binding.
//!
//! # Responsibility
//! - Resolve and configure the physical backing file for a named store.
//! - Attach the store: open the connection, synchronize the schema with
//!   the model, seed permanent-id allocation.
//!
//! # Invariants
//! - A `StoreDescriptor` is immutable after construction.
//! - No entity data is read or written before schema synchronization
//!   succeeds.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod descriptor;
mod engine;

pub use descriptor::{FileProtection, MissingFilePolicy, StoreDescriptor, StoreOptions, STORE_FILE_EXT};
pub(crate) use engine::Store;

pub type LoadResult<T> = Result<T, LoadError>;

/// Failure attaching or addressing the durable store.
#[derive(Debug)]
pub enum LoadError {
    Db(rusqlite::Error),
    Io(std::io::Error),
    /// The on-disk schema differs from the model and auto-migration is
    /// either disabled or unable to reconcile it.
    SchemaMismatch { entity: String, detail: String },
    AlreadyLoaded,
    /// The facade has not completed a successful `load` yet.
    NotLoaded,
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::SchemaMismatch { entity, detail } => {
                write!(f, "schema mismatch for entity `{entity}`: {detail}")
            }
            Self::AlreadyLoaded => write!(f, "store is already loaded or loading"),
            Self::NotLoaded => write!(f, "store has not been loaded"),
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LoadError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(value)
    }
}

impl From<std::io::Error> for LoadError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
