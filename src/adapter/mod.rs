//! Backend adapters
//!
//! A `DbAdapter` owns everything engine-specific: which files it claims, how
//! a connection is opened and tuned, custom function registration, the SQL
//! dialect for the four query fragments, create-table-as semantics, catalog
//! enumeration, and the sibling files the engine leaves next to a database.
//!
//! Fragment rendering lives here as default trait methods; engines override
//! only the pieces where dialects actually diverge.

mod duck;
mod sqlite;

pub use duck::DuckDbAdapter;
pub use sqlite::SqliteAdapter;

use crate::config::TableCacheConfig;
use crate::data::{ColumnDef, DataSet, DataType, Value};
use crate::filter::{CompareOp, Filter, FilterValue};
use crate::request::{BackendKind, Page, TableRequest};
use crate::{Result, TableError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Table namespace
// ============================================================================

/// Primary data table of the base set
pub const DATA_TABLE: &str = "DATA";
/// Column definitions / descriptions sidecar
pub const DD_TABLE: &str = "DATA_DD";
/// Key/value table attributes sidecar
pub const META_TABLE: &str = "DATA_META";
/// Per-column display hints sidecar
pub const AUX_TABLE: &str = "DATA_AUX";
/// Hidden ordinal column giving every table a deterministic row order
pub const ROW_IDX: &str = "ROW_IDX";

/// The four tables created once per ingested source
pub const BASE_TABLES: [&str; 4] = [DATA_TABLE, DD_TABLE, META_TABLE, AUX_TABLE];

/// Name for the derived table cached under the given digest
pub fn derived_table_name(digest: &str) -> String {
    format!("DATA_{}", digest)
}

/// Whether a table name denotes a cached derived table (as opposed to the
/// base set). Derived digests are lowercase hex, so the uppercase sidecar
/// suffixes never collide.
pub fn is_derived_name(name: &str) -> bool {
    match name.strip_prefix("DATA_") {
        Some(suffix) => {
            !suffix.is_empty()
                && suffix
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

// ============================================================================
// SQL building blocks
// ============================================================================

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, escaping embedded quotes
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn render_value(value: &FilterValue) -> Result<String> {
    match value {
        FilterValue::Null => Ok("NULL".to_string()),
        FilterValue::Int(v) => Ok(v.to_string()),
        FilterValue::Float(v) => Ok(format!("{:?}", v)),
        FilterValue::Text(s) => Ok(quote_literal(s)),
        FilterValue::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        FilterValue::List(_) => Err(TableError::QueryTranslation(
            "list literal outside IN".to_string(),
        )),
    }
}

// ============================================================================
// Connection abstraction
// ============================================================================

/// A live engine connection. Implementations wrap the concrete driver and
/// normalize row values into the crate's `Value` model.
pub trait DbConn: Send {
    /// Execute one statement, returning the affected row count
    fn execute(&mut self, sql: &str) -> Result<usize>;

    /// Run a query and materialize every row
    fn query(&mut self, sql: &str) -> Result<DataSet>;

    /// Run a query expected to yield a single integer
    fn query_i64(&mut self, sql: &str) -> Result<i64>;

    /// Bulk-insert rows through a prepared statement. Runs in the caller's
    /// transaction scope; callers wanting atomicity wrap it themselves.
    fn insert_rows(&mut self, table: &str, columns: &[ColumnDef], rows: &[Vec<Value>])
        -> Result<()>;
}

/// Build a result dataset from raw column names and rows, inferring each
/// column's type from its first non-null value (Text when a column is all
/// null).
pub(crate) fn assemble_dataset(names: Vec<String>, rows: Vec<Vec<Value>>) -> DataSet {
    let columns = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let data_type = rows
                .iter()
                .find_map(|r| r.get(i).and_then(Value::data_type))
                .unwrap_or(DataType::Text);
            ColumnDef::new(name, data_type)
        })
        .collect();
    let mut out = DataSet::new(columns);
    out.rows = rows;
    out
}

/// Run statements atomically: an aborted build rolls back and leaves no
/// table, so a table's existence implies its completeness.
pub fn execute_in_txn(conn: &mut dyn DbConn, statements: &[String]) -> Result<()> {
    conn.execute("BEGIN")?;
    for sql in statements {
        if let Err(e) = conn.execute(sql) {
            let _ = conn.execute("ROLLBACK");
            return Err(e);
        }
    }
    conn.execute("COMMIT")?;
    Ok(())
}

// ============================================================================
// Adapter contract
// ============================================================================

pub trait DbAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> BackendKind;

    /// File extensions this adapter owns; the first is used for new files
    fn extensions(&self) -> &'static [&'static str];

    /// Whether this adapter owns the given file, by naming convention
    fn claims(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions().iter().any(|s| ext.eq_ignore_ascii_case(s)))
            .unwrap_or(false)
    }

    /// Open (creating if absent) the database file and apply engine tuning.
    /// Custom function registration happens here; a registration failure is
    /// logged and non-fatal.
    fn open(&self, path: &Path, config: &TableCacheConfig) -> Result<Box<dyn DbConn>>;

    /// Engine column type for a crate data type
    fn sql_type(&self, data_type: DataType) -> &'static str;

    /// Catalog query returning one row per live table, column 0 = name
    fn table_names_sql(&self) -> &'static str;

    fn table_names(&self, conn: &mut dyn DbConn) -> Result<Vec<String>> {
        let result = conn.query(self.table_names_sql())?;
        Ok(result
            .rows
            .iter()
            .filter_map(|r| r.first().and_then(|v| v.as_str().map(str::to_string)))
            .collect())
    }

    /// CREATE TABLE ... AS for this engine. Some engines need an explicit
    /// with-data clause; both of ours persist immediately.
    fn create_table_as(&self, table: &str, select: &str) -> String {
        format!("CREATE TABLE {} AS {}", quote_ident(table), select)
    }

    /// Files the engine drops next to the database; deleted with it
    fn sibling_files(&self, path: &Path) -> Vec<PathBuf>;

    // ---- request fragments ------------------------------------------------

    /// `SELECT ...` list over resolved column names
    fn select_part(&self, columns: &[String]) -> String {
        let list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        format!("SELECT {}", list.join(", "))
    }

    fn from_part(&self, table: &str) -> String {
        format!("FROM {}", quote_ident(table))
    }

    /// `WHERE ...` combining structured predicates and the raw filter
    fn where_part(&self, req: &TableRequest) -> Result<String> {
        let mut terms = Vec::with_capacity(req.filters.len() + 1);
        for filter in &req.filters {
            terms.push(self.render_filter(filter)?);
        }
        if let Some(raw) = &req.sql_filter {
            terms.push(format!("({})", raw));
        }
        if terms.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!("WHERE {}", terms.join(" AND ")))
        }
    }

    /// `LIMIT ... OFFSET ...` for a paging window
    fn paging_part(&self, page: &Page) -> String {
        match (page.start, page.size) {
            (0, None) => String::new(),
            (start, Some(size)) => format!("LIMIT {} OFFSET {}", size, start),
            (start, None) => self.open_ended_offset(start),
        }
    }

    /// Offset with no upper bound; dialects disagree here
    fn open_ended_offset(&self, start: usize) -> String;

    /// One predicate in this engine's dialect
    fn render_filter(&self, filter: &Filter) -> Result<String> {
        let col = quote_ident(&filter.column);
        match filter.op {
            CompareOp::Eq
            | CompareOp::NotEq
            | CompareOp::Lt
            | CompareOp::LtEq
            | CompareOp::Gt
            | CompareOp::GtEq => {
                if matches!(filter.value, FilterValue::Null | FilterValue::List(_)) {
                    return Err(TableError::QueryTranslation(format!(
                        "comparison against {:?} on column {}",
                        filter.value, filter.column
                    )));
                }
                let sym = match filter.op {
                    CompareOp::Eq => "=",
                    CompareOp::NotEq => "!=",
                    CompareOp::Lt => "<",
                    CompareOp::LtEq => "<=",
                    CompareOp::Gt => ">",
                    CompareOp::GtEq => ">=",
                    _ => unreachable!(),
                };
                Ok(format!("{} {} {}", col, sym, render_value(&filter.value)?))
            }
            CompareOp::Like => match &filter.value {
                FilterValue::Text(pat) => Ok(format!("{} LIKE {}", col, quote_literal(pat))),
                other => Err(TableError::QueryTranslation(format!(
                    "LIKE needs a string pattern, got {:?}",
                    other
                ))),
            },
            CompareOp::ILike => match &filter.value {
                FilterValue::Text(pat) => Ok(self.render_ilike(&col, pat)),
                other => Err(TableError::QueryTranslation(format!(
                    "ILIKE needs a string pattern, got {:?}",
                    other
                ))),
            },
            CompareOp::In => match &filter.value {
                FilterValue::List(items) if !items.is_empty() => {
                    let rendered: Result<Vec<String>> = items.iter().map(render_value).collect();
                    Ok(format!("{} IN ({})", col, rendered?.join(", ")))
                }
                _ => Err(TableError::QueryTranslation(format!(
                    "IN needs a non-empty list on column {}",
                    filter.column
                ))),
            },
            CompareOp::IsNull => Ok(format!("{} IS NULL", col)),
            CompareOp::IsNotNull => Ok(format!("{} IS NOT NULL", col)),
        }
    }

    /// Case-insensitive LIKE; engines without native ILIKE lower both sides
    fn render_ilike(&self, quoted_col: &str, pattern: &str) -> String {
        format!("{} ILIKE {}", quoted_col, quote_literal(pattern))
    }
}

// ============================================================================
// Adapter registry
// ============================================================================

/// Registry of the adapters this process can use, probed in registration
/// order; the first adapter claiming a file wins.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn DbAdapter>>,
}

impl AdapterRegistry {
    /// Registry with the built-in engines
    pub fn new() -> Self {
        Self {
            adapters: vec![Arc::new(SqliteAdapter), Arc::new(DuckDbAdapter)],
        }
    }

    /// Adapter owning an existing or prospective file path
    pub fn for_path(&self, path: &Path) -> Result<Arc<dyn DbAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.claims(path))
            .cloned()
            .ok_or_else(|| TableError::UnsupportedBackend {
                path: path.to_path_buf(),
            })
    }

    /// Adapter for a backend kind
    pub fn by_kind(&self, kind: BackendKind) -> Arc<dyn DbAdapter> {
        self.adapters
            .iter()
            .find(|a| a.kind() == kind)
            .cloned()
            .expect("built-in adapter registered")
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DbAdapter>> {
        self.adapters.iter()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;

    #[test]
    fn test_registry_claims_by_extension() {
        let reg = AdapterRegistry::new();
        assert_eq!(reg.for_path(Path::new("/x/t.sqlite")).unwrap().name(), "sqlite");
        assert_eq!(reg.for_path(Path::new("/x/t.duckdb")).unwrap().name(), "duckdb");
        assert!(matches!(
            reg.for_path(Path::new("/x/t.parquet")),
            Err(TableError::UnsupportedBackend { .. })
        ));
    }

    #[test]
    fn test_derived_name_predicate() {
        assert!(is_derived_name("DATA_0a1b2c3d4e5f6789"));
        assert!(!is_derived_name("DATA"));
        assert!(!is_derived_name("DATA_DD"));
        assert!(!is_derived_name("DATA_META"));
        assert!(!is_derived_name("DATA_AUX"));
        assert!(!is_derived_name("OTHER"));
    }

    #[test]
    fn test_where_part_combines_filters() {
        let reg = AdapterRegistry::new();
        let adapter = reg.by_kind(BackendKind::Sqlite);
        let req = TableRequest::new("cars.csv")
            .with_filters(vec![Filter::parse("\"gear\" > 3").unwrap()])
            .with_sql_filter("\"hp\" < 200");
        assert_eq!(
            adapter.where_part(&req).unwrap(),
            "WHERE \"gear\" > 3 AND (\"hp\" < 200)"
        );
    }

    #[test]
    fn test_untranslatable_predicates() {
        let reg = AdapterRegistry::new();
        let adapter = reg.by_kind(BackendKind::Sqlite);
        let bad = Filter::new("x", CompareOp::Like, FilterValue::Int(3));
        assert!(matches!(
            adapter.render_filter(&bad),
            Err(TableError::QueryTranslation(_))
        ));
    }

    #[test]
    fn test_quote_escaping() {
        assert_eq!(quote_ident("sepal.width"), "\"sepal.width\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
