//! Source data fetching
//!
//! Ingestion delegates to a `DataFetcher`: the engine hands it a source
//! locator and gets back a fully typed dataset. The engine itself never
//! parses source formats; it only materializes whatever the fetcher returns.

use crate::data::{ColumnDef, DataSet, DataType, Value};
use crate::{Result, TableError};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The data-fetch collaborator used during ingestion
pub trait DataFetcher: Send + Sync {
    /// Fetch the full dataset for a source locator
    fn fetch(&self, source: &str) -> Result<DataSet>;
}

/// Fetcher reading delimiter-separated files with header row and inferred
/// column types.
pub struct CsvFetcher;

impl CsvFetcher {
    /// Infer a column type from raw cell text: all-int, all-float, bool, or
    /// text. Empty cells are nulls and don't vote.
    fn infer_type(cells: &[&str]) -> DataType {
        let mut any = false;
        let mut all_int = true;
        let mut all_float = true;
        let mut all_bool = true;
        for cell in cells {
            if cell.is_empty() {
                continue;
            }
            any = true;
            all_int = all_int && cell.parse::<i64>().is_ok();
            all_float = all_float && cell.parse::<f64>().is_ok();
            all_bool = all_bool
                && (cell.eq_ignore_ascii_case("true") || cell.eq_ignore_ascii_case("false"));
        }
        if !any {
            DataType::Text
        } else if all_int {
            DataType::Int64
        } else if all_float {
            DataType::Float64
        } else if all_bool {
            DataType::Bool
        } else {
            DataType::Text
        }
    }

    fn parse_cell(cell: &str, data_type: DataType) -> Value {
        if cell.is_empty() {
            return Value::Null;
        }
        match data_type {
            DataType::Int64 => cell
                .parse::<i64>()
                .map(Value::Int64)
                .unwrap_or(Value::Null),
            DataType::Float64 => cell
                .parse::<f64>()
                .map(Value::Float64)
                .unwrap_or(Value::Null),
            DataType::Bool => Value::Bool(cell.eq_ignore_ascii_case("true")),
            DataType::Text => Value::Text(cell.to_string()),
        }
    }
}

impl DataFetcher for CsvFetcher {
    fn fetch(&self, source: &str) -> Result<DataSet> {
        let path = Path::new(source);
        let mut reader = csv::Reader::from_path(path).map_err(|e| {
            TableError::data_access_with(format!("cannot read source: {}", source), e)
        })?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| TableError::data_access_with("malformed CSV header", e))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut records: Vec<csv::StringRecord> = Vec::new();
        for record in reader.records() {
            records.push(
                record.map_err(|e| TableError::data_access_with("malformed CSV record", e))?,
            );
        }

        let columns: Vec<ColumnDef> = headers
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let cells: Vec<&str> = records
                    .iter()
                    .map(|r| r.get(i).unwrap_or("").trim())
                    .collect();
                ColumnDef::new(name.clone(), Self::infer_type(&cells))
            })
            .collect();

        let mut out = DataSet::new(columns.clone());
        out.title = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string());
        for record in &records {
            let row: Vec<Value> = columns
                .iter()
                .enumerate()
                .map(|(i, col)| Self::parse_cell(record.get(i).unwrap_or("").trim(), col.data_type))
                .collect();
            out.push_row(row);
        }
        Ok(out)
    }
}

/// In-memory fetcher with an instrumented fetch counter. Primarily for
/// tests asserting the ingest-at-most-once property.
pub struct MemoryFetcher {
    dataset: DataSet,
    fetches: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new(dataset: DataSet) -> Self {
        Self {
            dataset,
            fetches: AtomicUsize::new(0),
        }
    }

    /// How many times `fetch` has run
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl DataFetcher for MemoryFetcher {
    fn fetch(&self, _source: &str) -> Result<DataSet> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.dataset.clone())
    }
}
