//! Tablebase — embedded table query-and-cache engine
//!
//! Materializes a tabular source exactly once into an embedded database file
//! (SQLite or DuckDB), then answers repeated filtered/sorted/paged/decimated
//! sub-queries against that materialization. Derived result tables are cached
//! under a content-addressed key so identical requests — even from different
//! callers — never rebuild the same table twice.

pub mod adapter;
pub mod config;
pub mod data;
pub mod decimate;
pub mod fetch;
pub mod filter;
pub mod lock;
pub mod monitor;
pub mod processor;
pub mod request;

// Re-export main types
pub use config::TableCacheConfig;
pub use data::{ColumnDef, DataSet, DataType, Value};
pub use decimate::DecimateKey;
pub use fetch::{CsvFetcher, DataFetcher, MemoryFetcher};
pub use filter::{CompareOp, Filter, FilterValue};
pub use processor::{ColumnSpec, TableCache, TablePage};
pub use request::{BackendKind, ColumnSelection, DecimateSpec, Page, SortDirection, SortTerm, TableRequest};

use std::path::PathBuf;

/// Engine error type
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("no backend adapter claims file: {}", path.display())]
    UnsupportedBackend { path: PathBuf },

    #[error("data access error: {message}")]
    DataAccess {
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("query translation error: {0}")]
    QueryTranslation(String),

    #[error("timed out waiting for build lock: {key}")]
    LockTimeout { key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TableError {
    /// A `DataAccess` error with no underlying cause.
    pub fn data_access(message: impl Into<String>) -> Self {
        TableError::DataAccess {
            message: message.into(),
            cause: None,
        }
    }

    /// A `DataAccess` error wrapping an engine-level cause.
    pub fn data_access_with(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TableError::DataAccess {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// The root-cause message when one exists and is distinct from the
    /// primary message. Callers report both levels.
    pub fn root_cause(&self) -> Option<String> {
        match self {
            TableError::DataAccess {
                cause: Some(cause), ..
            } => Some(cause.to_string()),
            TableError::Io(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TableError>;
