//! Engine-path vs host-path decimation key conformance
//!
//! The grid-cell key attached by the engine (SQLite scalar function, DuckDB
//! macro) must equal the key the host implementation computes for the same
//! row — exact string equality, zero mismatches.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tablebase::{
    BackendKind, ColumnDef, DataSet, DataType, DecimateKey, DecimateSpec, Filter, MemoryFetcher,
    SortTerm, TableCache, TableCacheConfig, TableRequest, Value,
};
use tempfile::TempDir;

const X_MIN: f64 = 149.41147;
const X_MAX: f64 = 150.82684;
const Y_MIN: f64 = 1.498815;
const Y_MAX: f64 = 2.91273;

/// Random sky points plus boundary rows exactly at the grid corners
fn sky_dataset(n: usize, seed: u64) -> DataSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ds = DataSet::new(vec![
        ColumnDef::new("ra", DataType::Float64).units("deg"),
        ColumnDef::new("dec", DataType::Float64).units("deg"),
    ]);
    ds.push_row(vec![Value::Float64(X_MIN), Value::Float64(Y_MIN)]);
    ds.push_row(vec![Value::Float64(X_MAX), Value::Float64(Y_MAX)]);
    ds.push_row(vec![Value::Float64(X_MIN), Value::Float64(Y_MAX)]);
    ds.push_row(vec![Value::Float64(X_MAX), Value::Float64(Y_MIN)]);
    for _ in 0..n {
        ds.push_row(vec![
            Value::Float64(rng.gen_range(X_MIN..=X_MAX)),
            Value::Float64(rng.gen_range(Y_MIN..=Y_MAX)),
        ]);
    }
    ds
}

fn f64_cell(v: &Value) -> f64 {
    v.as_f64().expect("numeric cell")
}

fn str_cell(v: &Value) -> &str {
    v.as_str().expect("text cell")
}

fn run_conformance(backend: BackendKind, n: usize) {
    let dir = TempDir::new().unwrap();
    let config = TableCacheConfig::new(dir.path());
    let cache = TableCache::new(config, Arc::new(MemoryFetcher::new(sky_dataset(n, 42)))).unwrap();

    let req = TableRequest::new("sky")
        .with_backend(backend)
        .with_decimate(DecimateSpec::new("ra", "dec", 100_000));
    let page = cache.get_page(&req).unwrap();

    assert_eq!(page.total_rows, n + 4);
    let grid_json = page
        .data
        .attribute("decimate.grid")
        .expect("grid recorded with decimation result");
    let grid: DecimateKey = serde_json::from_str(grid_json).unwrap();
    assert_eq!(grid.n_x, 316);
    assert_eq!(grid.n_y, 316);

    let ra = page.data.column_index("ra").unwrap();
    let dec = page.data.column_index("dec").unwrap();
    let key = page.data.column_index("decimate_key").unwrap();

    let mut mismatches = 0;
    for row in &page.data.rows {
        let host = grid.key(f64_cell(&row[ra]), f64_cell(&row[dec]));
        if host != str_cell(&row[key]) {
            mismatches += 1;
        }
    }
    assert_eq!(mismatches, 0, "engine and host keys diverged");

    // corner rows land in the corner cells
    assert_eq!(str_cell(&page.data.rows[0][key]), "0,0");
    assert_eq!(
        str_cell(&page.data.rows[1][key]),
        format!("{},{}", grid.n_x - 1, grid.n_y - 1)
    );
}

#[test]
fn test_sqlite_engine_keys_match_host() {
    run_conformance(BackendKind::Sqlite, 10_000);
}

#[test]
fn test_duckdb_engine_keys_match_host() {
    run_conformance(BackendKind::DuckDb, 10_000);
}

#[test]
fn test_decimation_identical_across_backends() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let data = sky_dataset(2_000, 7);
    let cache_a = TableCache::new(
        TableCacheConfig::new(dir_a.path()),
        Arc::new(MemoryFetcher::new(data.clone())),
    )
    .unwrap();
    let cache_b = TableCache::new(
        TableCacheConfig::new(dir_b.path()),
        Arc::new(MemoryFetcher::new(data)),
    )
    .unwrap();

    let make = |backend| {
        TableRequest::new("sky")
            .with_backend(backend)
            .with_decimate(DecimateSpec::new("ra", "dec", 10_000))
            .with_sort(vec![SortTerm::asc("decimate_key")])
    };
    let a = cache_a.get_page(&make(BackendKind::Sqlite)).unwrap();
    let b = cache_b.get_page(&make(BackendKind::DuckDb)).unwrap();

    assert_eq!(a.data.len(), b.data.len());
    let key_a = a.data.column_index("decimate_key").unwrap();
    let key_b = b.data.column_index("decimate_key").unwrap();
    for (ra, rb) in a.data.rows.iter().zip(&b.data.rows) {
        assert_eq!(str_cell(&ra[key_a]), str_cell(&rb[key_b]));
    }
}

#[test]
fn test_decimation_over_prefiltered_selection() {
    // chained derivation: the grid covers only the filtered subset
    let dir = TempDir::new().unwrap();
    let cache = TableCache::new(
        TableCacheConfig::new(dir.path()),
        Arc::new(MemoryFetcher::new(sky_dataset(2_000, 11))),
    )
    .unwrap();

    let req = TableRequest::new("sky")
        .with_filters(vec![Filter::parse("\"dec\" > 2").unwrap()])
        .with_decimate(DecimateSpec::new("ra", "dec", 10_000));
    let page = cache.get_page(&req).unwrap();

    let grid: DecimateKey =
        serde_json::from_str(page.data.attribute("decimate.grid").unwrap()).unwrap();
    assert!(grid.y_min > 2.0);

    let dec = page.data.column_index("dec").unwrap();
    let ra = page.data.column_index("ra").unwrap();
    let key = page.data.column_index("decimate_key").unwrap();
    for row in &page.data.rows {
        assert!(f64_cell(&row[dec]) > 2.0);
        assert_eq!(
            grid.key(f64_cell(&row[ra]), f64_cell(&row[dec])),
            str_cell(&row[key])
        );
    }
}

#[test]
fn test_aggregated_decimation_cells() {
    for backend in [BackendKind::Sqlite, BackendKind::DuckDb] {
        let dir = TempDir::new().unwrap();
        let n = 2_000;
        let cache = TableCache::new(
            TableCacheConfig::new(dir.path()),
            Arc::new(MemoryFetcher::new(sky_dataset(n, 3))),
        )
        .unwrap();

        let req = TableRequest::new("sky")
            .with_backend(backend)
            .with_decimate(DecimateSpec::new("ra", "dec", 100).aggregated());
        let page = cache.get_page(&req).unwrap();

        // one row per occupied cell, populations summing to the source size
        let grid: DecimateKey =
            serde_json::from_str(page.data.attribute("decimate.grid").unwrap()).unwrap();
        assert!(page.total_rows <= (grid.n_x * grid.n_y) as usize);
        let points = page.data.column_index("points").unwrap();
        let total: i64 = page
            .data
            .rows
            .iter()
            .map(|r| match &r[points] {
                Value::Int64(v) => *v,
                other => panic!("unexpected population value {:?}", other),
            })
            .sum();
        assert_eq!(total, (n + 4) as i64);

        // every key is unique
        let key = page.data.column_index("decimate_key").unwrap();
        let mut keys: Vec<&str> = page.data.rows.iter().map(|r| str_cell(&r[key])).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), page.data.len());
    }
}
