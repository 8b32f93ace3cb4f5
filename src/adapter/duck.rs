//! DuckDB backend adapter

use super::{quote_ident, DbAdapter, DbConn};
use crate::config::TableCacheConfig;
use crate::data::{ColumnDef, DataSet, DataType, Value};
use crate::decimate::{DECIMATE_KEY_MACRO, LG_MACRO};
use crate::request::BackendKind;
use crate::{Result, TableError};
use duckdb::{params_from_iter, Connection};
use std::path::{Path, PathBuf};

/// Adapter for DuckDB database files
pub struct DuckDbAdapter;

impl DbAdapter for DuckDbAdapter {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::DuckDb
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["duckdb"]
    }

    fn open(&self, path: &Path, config: &TableCacheConfig) -> Result<Box<dyn DbConn>> {
        let conn = Connection::open(path).map_err(|e| open_err(path, e))?;

        if let Some(limit) = &config.duckdb_memory_limit {
            conn.execute_batch(&format!("SET memory_limit = '{}'", limit))
                .map_err(|e| open_err(path, e))?;
        }

        // DuckDB has no scalar-function registration hook here; the binning
        // function is installed as a macro rendered from the same canonical
        // form the host implementation uses.
        let macros = format!("{};\n{};", DECIMATE_KEY_MACRO, LG_MACRO);
        if let Err(e) = conn.execute_batch(&macros) {
            log::warn!("duckdb: macro registration failed: {}", e);
        }

        Ok(Box::new(DuckConn { conn }))
    }

    fn sql_type(&self, data_type: DataType) -> &'static str {
        match data_type {
            DataType::Int64 => "BIGINT",
            DataType::Float64 => "DOUBLE",
            DataType::Text => "VARCHAR",
            DataType::Bool => "BOOLEAN",
        }
    }

    fn table_names_sql(&self) -> &'static str {
        "SELECT table_name FROM information_schema.tables WHERE table_schema = 'main' ORDER BY table_name"
    }

    fn create_table_as(&self, table: &str, select: &str) -> String {
        format!("CREATE TABLE {} AS ({})", quote_ident(table), select)
    }

    fn sibling_files(&self, path: &Path) -> Vec<PathBuf> {
        [".wal", ".tmp"]
            .iter()
            .map(|suffix| append_suffix(path, suffix))
            .collect()
    }

    fn open_ended_offset(&self, start: usize) -> String {
        // DuckDB accepts a bare OFFSET
        format!("OFFSET {}", start)
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn open_err(path: &Path, e: duckdb::Error) -> TableError {
    TableError::data_access_with(format!("duckdb open failed: {}", path.display()), e)
}

fn db_err(op: &str, e: duckdb::Error) -> TableError {
    TableError::data_access_with(format!("duckdb {} failed", op), e)
}

struct DuckConn {
    conn: Connection,
}

impl DbConn for DuckConn {
    fn execute(&mut self, sql: &str) -> Result<usize> {
        self.conn.execute(sql, []).map_err(|e| db_err("execute", e))
    }

    fn query(&mut self, sql: &str) -> Result<DataSet> {
        let mut stmt = self.conn.prepare(sql).map_err(|e| db_err("prepare", e))?;
        let mut rows = stmt.query([]).map_err(|e| db_err("query", e))?;

        let (names, width) = {
            let stmt = rows.as_ref().ok_or_else(|| {
                TableError::data_access("duckdb query returned no statement handle")
            })?;
            let count = stmt.column_count();
            let names: Vec<String> = (0..count)
                .map(|i| {
                    stmt.column_name(i)
                        .map(|n| n.to_string())
                        .unwrap_or_else(|_| format!("col{}", i))
                })
                .collect();
            (names, count)
        };

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| db_err("query", e))? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_value_ref(
                    row.get_ref(i).map_err(|e| db_err("read", e))?,
                ));
            }
            out.push(values);
        }
        Ok(super::assemble_dataset(names, out))
    }

    fn query_i64(&mut self, sql: &str) -> Result<i64> {
        self.conn
            .query_row(sql, [], |row| row.get(0))
            .map_err(|e| db_err("count", e))
    }

    fn insert_rows(
        &mut self,
        table: &str,
        columns: &[ColumnDef],
        rows: &[Vec<Value>],
    ) -> Result<()> {
        let cols: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let marks: Vec<&str> = (0..columns.len()).map(|_| "?").collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            cols.join(", "),
            marks.join(", ")
        );
        let mut stmt = self.conn.prepare(&sql).map_err(|e| db_err("prepare", e))?;
        for row in rows {
            stmt.execute(params_from_iter(row.iter().map(to_sql_value)))
                .map_err(|e| db_err("insert", e))?;
        }
        Ok(())
    }
}

/// Normalize a DuckDB value; integer widths collapse to `Int64`, floats to
/// `Float64` (matching the column types this engine ever creates).
fn from_value_ref(value: duckdb::types::ValueRef<'_>) -> Value {
    use duckdb::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(v) => Value::Bool(v),
        ValueRef::TinyInt(v) => Value::Int64(v as i64),
        ValueRef::SmallInt(v) => Value::Int64(v as i64),
        ValueRef::Int(v) => Value::Int64(v as i64),
        ValueRef::BigInt(v) => Value::Int64(v),
        ValueRef::UTinyInt(v) => Value::Int64(v as i64),
        ValueRef::USmallInt(v) => Value::Int64(v as i64),
        ValueRef::UInt(v) => Value::Int64(v as i64),
        ValueRef::UBigInt(v) => Value::Int64(v as i64),
        ValueRef::Float(v) => Value::Float64(v as f64),
        ValueRef::Double(v) => Value::Float64(v),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        _ => Value::Null,
    }
}

fn to_sql_value(value: &Value) -> duckdb::types::Value {
    match value {
        Value::Null => duckdb::types::Value::Null,
        Value::Int64(v) => duckdb::types::Value::BigInt(*v),
        Value::Float64(v) => duckdb::types::Value::Double(*v),
        Value::Text(s) => duckdb::types::Value::Text(s.clone()),
        Value::Bool(b) => duckdb::types::Value::Boolean(*b),
    }
}
