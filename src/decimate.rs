//! Spatial decimation: 2D grid binning
//!
//! `DecimateKey` maps a point to its grid-cell identifier. The same binning
//! runs in two places: inside the embedded engine (a scalar function on
//! SQLite, a SQL macro on DuckDB) and in host code. The two paths must agree
//! bit-for-bit on every input — the SQL renderings below are the single
//! canonical engine-side form of `key()`, and the conformance tests compare
//! them row-for-row. Any change here must keep all three in lockstep.

use serde::{Deserialize, Serialize};

/// Grid descriptor and binning function.
///
/// Cell index is `floor((v - min) / unit)` clamped to `[0, n)`; the key is
/// `"ix,iy"`. Units must be positive: callers bump degenerate ranges via
/// [`DecimateKey::grid_for`] before constructing one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecimateKey {
    pub x_min: f64,
    pub y_min: f64,
    pub n_x: i64,
    pub n_y: i64,
    pub x_unit: f64,
    pub y_unit: f64,
}

impl DecimateKey {
    pub fn new(x_min: f64, y_min: f64, n_x: i64, n_y: i64, x_unit: f64, y_unit: f64) -> Self {
        debug_assert!(x_unit > 0.0 && y_unit > 0.0, "cell units must be positive");
        debug_assert!(n_x > 0 && n_y > 0, "grid must have at least one cell");
        Self {
            x_min,
            y_min,
            n_x,
            n_y,
            x_unit,
            y_unit,
        }
    }

    /// Build a grid covering `[x_min, x_max] x [y_min, y_max]` with roughly
    /// `cells` cells.
    ///
    /// Degenerate ranges (min == max) get a unit of `|min|`, or 1 when min is
    /// zero. Units are then widened by `unit / 1000 / n` so values exactly at
    /// the max land inside the last cell instead of being clamped into it.
    pub fn grid_for(x_min: f64, x_max: f64, y_min: f64, y_max: f64, cells: usize) -> Self {
        let n_x = (cells.max(1) as f64).sqrt() as i64;
        let n_y = (cells.max(1) as f64).sqrt() as i64;
        let n_x = n_x.max(1);
        let n_y = n_y.max(1);

        let mut x_unit = (x_max - x_min) / n_x as f64;
        let mut y_unit = (y_max - y_min) / n_y as f64;

        if x_unit == 0.0 {
            x_unit = if x_min.abs() > 0.0 { x_min.abs() } else { 1.0 };
        }
        if y_unit == 0.0 {
            y_unit = if y_min.abs() > 0.0 { y_min.abs() } else { 1.0 };
        }

        x_unit += x_unit / 1000.0 / n_x as f64;
        y_unit += y_unit / 1000.0 / n_y as f64;

        Self::new(x_min, y_min, n_x, n_y, x_unit, y_unit)
    }

    /// The grid-cell key for a point. Host-side call site of the algorithm.
    pub fn key(&self, x: f64, y: f64) -> String {
        let ix = cell_index(x, self.x_min, self.x_unit, self.n_x);
        let iy = cell_index(y, self.y_min, self.y_unit, self.n_y);
        format!("{},{}", ix, iy)
    }

    /// Render the engine-side call for this grid against two column
    /// expressions. Float literals use the shortest round-trip form, which
    /// both engines parse back to the identical double.
    pub fn sql_call(&self, x_expr: &str, y_expr: &str) -> String {
        format!(
            "decimate_key({}, {}, {:?}, {:?}, {}, {}, {:?}, {:?})",
            x_expr, y_expr, self.x_min, self.y_min, self.n_x, self.n_y, self.x_unit, self.y_unit
        )
    }
}

/// Shared index computation: floor first, then clamp.
fn cell_index(v: f64, min: f64, unit: f64, n: i64) -> i64 {
    let scaled = ((v - min) / unit).floor();
    if scaled < 0.0 {
        0
    } else if scaled >= n as f64 {
        n - 1
    } else {
        scaled as i64
    }
}

/// DuckDB registration of `key()`: identical arithmetic, rendered once here.
pub const DECIMATE_KEY_MACRO: &str = "CREATE OR REPLACE MACRO decimate_key(x_val, y_val, x_min, y_min, n_x, n_y, x_unit, y_unit) AS \
CAST(CAST(LEAST(GREATEST(FLOOR((x_val - x_min) / x_unit), 0), n_x - 1) AS BIGINT) AS VARCHAR) \
|| ',' || \
CAST(CAST(LEAST(GREATEST(FLOOR((y_val - y_min) / y_unit), 0), n_y - 1) AS BIGINT) AS VARCHAR)";

/// DuckDB alias for the log10 helper registered as a UDF on SQLite.
pub const LG_MACRO: &str = "CREATE OR REPLACE MACRO lg(val) AS log10(val)";
