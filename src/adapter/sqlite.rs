//! SQLite backend adapter (rusqlite)

use super::{quote_ident, DbAdapter, DbConn};
use crate::config::TableCacheConfig;
use crate::data::{ColumnDef, DataSet, DataType, Value};
use crate::decimate::DecimateKey;
use crate::request::BackendKind;
use crate::{Result, TableError};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Adapter for SQLite database files
pub struct SqliteAdapter;

impl SqliteAdapter {
    fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
        let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

        // decimate_key: the registered closure calls the host implementation
        // directly, so the engine path and host path are one function.
        conn.create_scalar_function("decimate_key", 8, flags, |ctx| {
            let x: Option<f64> = ctx.get(0)?;
            let y: Option<f64> = ctx.get(1)?;
            let x_min: Option<f64> = ctx.get(2)?;
            let y_min: Option<f64> = ctx.get(3)?;
            let n_x: Option<i64> = ctx.get(4)?;
            let n_y: Option<i64> = ctx.get(5)?;
            let x_unit: Option<f64> = ctx.get(6)?;
            let y_unit: Option<f64> = ctx.get(7)?;
            // null in, null out
            match (x, y, x_min, y_min, n_x, n_y, x_unit, y_unit) {
                (
                    Some(x),
                    Some(y),
                    Some(x_min),
                    Some(y_min),
                    Some(n_x),
                    Some(n_y),
                    Some(x_unit),
                    Some(y_unit),
                ) => {
                    let grid = DecimateKey::new(x_min, y_min, n_x, n_y, x_unit, y_unit);
                    Ok(Some(grid.key(x, y)))
                }
                _ => Ok(None),
            }
        })?;

        conn.create_scalar_function("lg", 1, flags, |ctx| {
            let val: Option<f64> = ctx.get(0)?;
            Ok(val.map(f64::log10))
        })?;

        Ok(())
    }
}

impl DbAdapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["sqlite", "db"]
    }

    fn open(&self, path: &Path, config: &TableCacheConfig) -> Result<Box<dyn DbConn>> {
        let conn = Connection::open(path).map_err(|e| open_err(path, e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| open_err(path, e))?;

        // cache tuning; the file is a disposable artifact, not a durability
        // domain. journal_mode reports the resulting mode as a row.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| open_err(path, e))?;
        conn.pragma_update(None, "synchronous", "OFF")
            .map_err(|e| open_err(path, e))?;
        conn.pragma_update(None, "cache_size", -config.sqlite_cache_kb)
            .map_err(|e| open_err(path, e))?;

        if let Err(e) = Self::register_functions(&conn) {
            log::warn!("sqlite: custom function registration failed: {}", e);
        }

        Ok(Box::new(SqliteConn { conn }))
    }

    fn sql_type(&self, data_type: DataType) -> &'static str {
        match data_type {
            DataType::Int64 => "INTEGER",
            DataType::Float64 => "DOUBLE",
            DataType::Text => "TEXT",
            DataType::Bool => "BOOLEAN",
        }
    }

    fn table_names_sql(&self) -> &'static str {
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
    }

    fn sibling_files(&self, path: &Path) -> Vec<PathBuf> {
        ["-journal", "-wal", "-shm"]
            .iter()
            .map(|suffix| append_suffix(path, suffix))
            .collect()
    }

    fn open_ended_offset(&self, start: usize) -> String {
        // SQLite requires a LIMIT before OFFSET; -1 means unbounded
        format!("LIMIT -1 OFFSET {}", start)
    }

    fn render_ilike(&self, quoted_col: &str, pattern: &str) -> String {
        // no native ILIKE; lower both sides
        format!(
            "lower({}) LIKE lower({})",
            quoted_col,
            super::quote_literal(pattern)
        )
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn open_err(path: &Path, e: rusqlite::Error) -> TableError {
    TableError::data_access_with(format!("sqlite open failed: {}", path.display()), e)
}

fn db_err(op: &str, e: rusqlite::Error) -> TableError {
    TableError::data_access_with(format!("sqlite {} failed", op), e)
}

struct SqliteConn {
    conn: Connection,
}

impl DbConn for SqliteConn {
    fn execute(&mut self, sql: &str) -> Result<usize> {
        self.conn.execute(sql, []).map_err(|e| db_err("execute", e))
    }

    fn query(&mut self, sql: &str) -> Result<DataSet> {
        let mut stmt = self.conn.prepare(sql).map_err(|e| db_err("prepare", e))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let width = names.len();

        let mut out = Vec::new();
        let mut rows = stmt.query([]).map_err(|e| db_err("query", e))?;
        while let Some(row) = rows.next().map_err(|e| db_err("query", e))? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let value = match row.get_ref(i).map_err(|e| db_err("read", e))? {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(v) => Value::Int64(v),
                    rusqlite::types::ValueRef::Real(v) => Value::Float64(v),
                    rusqlite::types::ValueRef::Text(t) => {
                        Value::Text(String::from_utf8_lossy(t).into_owned())
                    }
                    rusqlite::types::ValueRef::Blob(_) => Value::Null,
                };
                values.push(value);
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
        let marks: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
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

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Int64(v) => rusqlite::types::Value::Integer(*v),
        Value::Float64(v) => rusqlite::types::Value::Real(*v),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
    }
}
