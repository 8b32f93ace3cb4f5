//! Table request specification
//!
//! A `TableRequest` is the immutable-per-call description of what a caller
//! wants: which source, which columns, filtered and sorted how, which page.
//! Derivation always works on value-semantic clones; a caller's request is
//! never mutated behind its back.

use crate::filter::Filter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Embedded engine choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Sqlite,
    DuckDb,
}

/// Requested column set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnSelection {
    /// All visible columns
    All,
    /// An explicit inclusion list, in order
    Columns(Vec<String>),
}

impl ColumnSelection {
    pub fn is_all(&self) -> bool {
        matches!(self, ColumnSelection::All)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One term of a sort specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortTerm {
    pub column: String,
    pub direction: SortDirection,
}

impl SortTerm {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Paging window. `size: None` requests all rows from `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub start: usize,
    pub size: Option<usize>,
}

impl Page {
    /// The whole result, unpaged
    pub const ALL: Page = Page {
        start: 0,
        size: None,
    };

    pub fn new(start: usize, size: usize) -> Self {
        Self {
            start,
            size: Some(size),
        }
    }

    pub fn is_all(&self) -> bool {
        self.start == 0 && self.size.is_none()
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::ALL
    }
}

/// Spatial decimation: bin two numeric columns onto a grid of roughly
/// `cells` cells and attach the grid-cell key to every row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecimateSpec {
    pub x_col: String,
    pub y_col: String,
    /// Target cell count for the grid
    pub cells: usize,
    /// When set, the derived table holds one aggregated row per occupied
    /// cell (representative point + population) instead of one row per
    /// source row.
    pub aggregate: bool,
}

impl DecimateSpec {
    pub fn new(x_col: impl Into<String>, y_col: impl Into<String>, cells: usize) -> Self {
        Self {
            x_col: x_col.into(),
            y_col: y_col.into(),
            cells,
            aggregate: false,
        }
    }

    pub fn aggregated(mut self) -> Self {
        self.aggregate = true;
        self
    }
}

/// A tabular data request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRequest {
    /// Source locator: a file path, or whatever the installed fetcher accepts
    pub source: String,
    /// Stable caller-assigned identifier, used in log lines
    pub request_id: String,
    /// Backend hint; existing files and the configured default win otherwise
    pub backend: Option<BackendKind>,
    /// Requested columns
    pub columns: ColumnSelection,
    /// Structured filter predicates, AND-combined
    pub filters: Vec<Filter>,
    /// Raw backend filter expression, AND-combined with `filters`
    pub sql_filter: Option<String>,
    /// Sort specification, in precedence order
    pub sort: Vec<SortTerm>,
    /// Paging window
    pub page: Page,
    /// Optional spatial decimation
    pub decimate: Option<DecimateSpec>,
}

impl TableRequest {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let request_id = format!("req_{}", digest_hex(&source, 8));
        Self {
            source,
            request_id,
            backend: None,
            columns: ColumnSelection::All,
            filters: Vec::new(),
            sql_filter: None,
            sort: Vec::new(),
            page: Page::ALL,
            decimate: None,
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = ColumnSelection::Columns(columns);
        self
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_sql_filter(mut self, expr: impl Into<String>) -> Self {
        self.sql_filter = Some(expr.into());
        self
    }

    pub fn with_sort(mut self, sort: Vec<SortTerm>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_page(mut self, page: Page) -> Self {
        self.page = page;
        self
    }

    pub fn with_decimate(mut self, decimate: DecimateSpec) -> Self {
        self.decimate = Some(decimate);
        self
    }

    /// Whether this request needs a derived table at all, or can read the
    /// effective table directly.
    pub fn needs_derive(&self) -> bool {
        !self.filters.is_empty()
            || self.sql_filter.is_some()
            || !self.sort.is_empty()
            || !self.columns.is_all()
            || self.decimate.is_some()
    }
}

/// Hex SHA-256 digest of a string, truncated to `len` characters.
pub fn digest_hex(input: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(len);
    for byte in digest.iter() {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

/// Deterministic digest of any serializable parameter block. Canonical form
/// is serde_json over the concrete type; struct fields serialize in
/// declaration order, so identical parameters always digest identically.
pub fn digest_params<T: Serialize>(params: &T, len: usize) -> String {
    let json = serde_json::to_string(params).expect("parameter block serializes");
    digest_hex(&json, len)
}
