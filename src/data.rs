//! Dynamic value model for ingestion payloads and page results

use serde::{Deserialize, Serialize};

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int64,
    Float64,
    Text,
    Bool,
}

impl DataType {
    /// Whether values of this type order/compare numerically
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }

    /// Stable name stored in the DD sidecar table
    pub fn type_name(&self) -> &'static str {
        match self {
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Text => "text",
            DataType::Bool => "bool",
        }
    }

    /// Inverse of [`type_name`](Self::type_name)
    pub fn parse_name(name: &str) -> Option<DataType> {
        match name {
            "int64" => Some(DataType::Int64),
            "float64" => Some(DataType::Float64),
            "text" => Some(DataType::Text),
            "bool" => Some(DataType::Bool),
            _ => None,
        }
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int64(i64),
    Float64(f64),
    Text(String),
    Bool(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value, when it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The type this value carries, if not null
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Text(_) => Some(DataType::Text),
            Value::Bool(_) => Some(DataType::Bool),
        }
    }
}

/// Column definition with the descriptive fields kept in the DD sidecar table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Data type
    pub data_type: DataType,
    /// Measurement units (optional)
    pub units: Option<String>,
    /// Human-readable description (optional)
    pub description: Option<String>,
}

impl ColumnDef {
    /// Create a new column definition
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            units: None,
            description: None,
        }
    }

    /// Set units
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Set description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A fully materialized table fragment: the ingestion payload returned by a
/// `DataFetcher`, and the row content of a page result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSet {
    /// Table title (optional)
    pub title: Option<String>,
    /// Column definitions, in order
    pub columns: Vec<ColumnDef>,
    /// Row-major values; each row has one value per column
    pub rows: Vec<Vec<Value>>,
    /// Key/value table attributes
    pub attributes: Vec<(String, String)>,
}

impl DataSet {
    /// Create an empty dataset with the given columns
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self {
            title: None,
            columns,
            rows: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Cell lookup by (row, column name)
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Append a row; must match the column count
    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Attribute lookup by key
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_col_set() -> DataSet {
        let mut ds = DataSet::new(vec![
            ColumnDef::new("ra", DataType::Float64).units("deg"),
            ColumnDef::new("dec", DataType::Float64).units("deg"),
        ]);
        ds.push_row(vec![Value::Float64(149.5), Value::Float64(2.1)]);
        ds.push_row(vec![Value::Float64(150.2), Value::Float64(1.8)]);
        ds
    }

    #[test]
    fn test_cell_lookup() {
        let ds = two_col_set();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(1, "dec"), Some(&Value::Float64(1.8)));
        assert_eq!(ds.get(0, "missing"), None);
    }

    #[test]
    fn test_value_views() {
        assert_eq!(Value::Int64(3).as_f64(), Some(3.0));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Text("a".into()).as_str(), Some("a"));
        assert!(DataType::Float64.is_numeric());
        assert!(!DataType::Text.is_numeric());
    }
}
