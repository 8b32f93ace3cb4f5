//! Ingest round-trips, filtered/sorted reads, paging, column edits

use std::io::Write;
use std::sync::Arc;
use tablebase::{
    BackendKind, ColumnDef, ColumnSpec, CsvFetcher, DataSet, DataType, Filter, MemoryFetcher,
    Page, SortTerm, TableCache, TableCacheConfig, TableError, TableRequest, Value,
};
use tempfile::TempDir;

fn cars_dataset() -> DataSet {
    let mut ds = DataSet::new(vec![
        ColumnDef::new("model", DataType::Text),
        ColumnDef::new("hp", DataType::Int64),
        ColumnDef::new("disp", DataType::Float64),
        ColumnDef::new("gear", DataType::Int64),
    ]);
    ds.title = Some("cars".to_string());
    let rows = [
        ("Mazda RX4", 110, 160.0, 4),
        ("Datsun 710", 93, 108.0, 4),
        ("Hornet 4 Drive", 110, 258.0, 3),
        ("Valiant", 105, 225.0, 3),
        ("Duster 360", 245, 360.0, 3),
        ("Merc 240D", 62, 146.7, 4),
        ("Merc 450SE", 180, 275.8, 3),
        ("Porsche 914-2", 91, 120.3, 5),
        ("Lotus Europa", 113, 95.1, 5),
        ("Maserati Bora", 335, 301.0, 5),
    ];
    for (model, hp, disp, gear) in rows {
        ds.push_row(vec![
            Value::Text(model.to_string()),
            Value::Int64(hp),
            Value::Float64(disp),
            Value::Int64(gear),
        ]);
    }
    ds
}

fn new_cache(dir: &TempDir) -> TableCache {
    let config = TableCacheConfig::new(dir.path());
    TableCache::new(config, Arc::new(MemoryFetcher::new(cars_dataset()))).unwrap()
}

fn cell_key(v: &Value) -> String {
    match v {
        Value::Float64(f) => format!("{:?}", f),
        Value::Int64(i) => format!("{:?}", *i as f64),
        other => format!("{:?}", other),
    }
}

#[test]
fn test_roundtrip_row_count_and_columns() {
    for backend in [BackendKind::Sqlite, BackendKind::DuckDb] {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir);
        let req = TableRequest::new("cars").with_backend(backend);

        let page = cache.get_page(&req).unwrap();
        assert_eq!(page.total_rows, 10);
        assert_eq!(page.data.len(), 10);
        let names: Vec<&str> = page.data.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["model", "hp", "disp", "gear"]);

        // unfiltered read reproduces ingestion order
        assert_eq!(
            page.data.get(0, "model"),
            Some(&Value::Text("Mazda RX4".to_string()))
        );
        assert_eq!(
            page.data.get(9, "model"),
            Some(&Value::Text("Maserati Bora".to_string()))
        );
        assert_eq!(page.data.title.as_deref(), Some("cars"));
        assert_eq!(page.data.attribute("row_count"), Some("10"));
    }
}

#[test]
fn test_filter_and_sort_identical_across_backends() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let cache_a = new_cache(&dir_a);
    let cache_b = new_cache(&dir_b);

    let make = |backend| {
        TableRequest::new("cars")
            .with_backend(backend)
            .with_columns(vec!["model".into(), "hp".into(), "gear".into()])
            .with_filters(vec![Filter::parse("\"gear\" > 3").unwrap()])
            .with_sort(vec![SortTerm::desc("hp")])
    };

    let a = cache_a.get_page(&make(BackendKind::Sqlite)).unwrap();
    let b = cache_b.get_page(&make(BackendKind::DuckDb)).unwrap();

    assert_eq!(a.total_rows, 6);
    assert_eq!(a.total_rows, b.total_rows);
    assert_eq!(a.data.columns.len(), b.data.columns.len());
    for (ra, rb) in a.data.rows.iter().zip(&b.data.rows) {
        for (va, vb) in ra.iter().zip(rb) {
            assert_eq!(cell_key(va), cell_key(vb));
        }
    }
    // highest hp among gear > 3 comes first
    assert_eq!(
        a.data.get(0, "model"),
        Some(&Value::Text("Maserati Bora".to_string()))
    );
}

#[test]
fn test_paging_concatenation_matches_single_page() {
    for backend in [BackendKind::Sqlite, BackendKind::DuckDb] {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir);
        let base = TableRequest::new("cars")
            .with_backend(backend)
            .with_sort(vec![SortTerm::asc("hp")]);

        let whole = cache
            .get_page(&base.clone().with_page(Page::new(0, 9)))
            .unwrap();
        let mut stitched: Vec<Vec<Value>> = Vec::new();
        for start in [0, 3, 6] {
            let part = cache
                .get_page(&base.clone().with_page(Page::new(start, 3)))
                .unwrap();
            assert_eq!(part.total_rows, 10);
            stitched.extend(part.data.rows);
        }
        assert_eq!(stitched, whole.data.rows);
    }
}

#[test]
fn test_total_count_is_independent_of_page_size() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let req = TableRequest::new("cars")
        .with_filters(vec![Filter::parse("\"gear\" > 3").unwrap()])
        .with_page(Page::new(0, 2));

    let page = cache.get_page(&req).unwrap();
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.total_rows, 6);
}

#[test]
fn test_open_ended_offset() {
    for backend in [BackendKind::Sqlite, BackendKind::DuckDb] {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir);
        let req = TableRequest::new("cars")
            .with_backend(backend)
            .with_sort(vec![SortTerm::asc("hp")])
            .with_page(Page {
                start: 8,
                size: None,
            });

        let page = cache.get_page(&req).unwrap();
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.total_rows, 10);
    }
}

#[test]
fn test_raw_sql_filter() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let req = TableRequest::new("cars").with_sql_filter("\"hp\" > 100 AND \"gear\" = 3");

    let page = cache.get_page(&req).unwrap();
    assert_eq!(page.total_rows, 4);
}

#[test]
fn test_unknown_columns_are_translation_errors() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);

    let bad_select = TableRequest::new("cars").with_columns(vec!["nope".into()]);
    assert!(matches!(
        cache.get_page(&bad_select),
        Err(TableError::QueryTranslation(_))
    ));

    let bad_sort = TableRequest::new("cars").with_sort(vec![SortTerm::asc("nope")]);
    assert!(matches!(
        cache.get_page(&bad_sort),
        Err(TableError::QueryTranslation(_))
    ));

    let bad_filter =
        TableRequest::new("cars").with_filters(vec![Filter::parse("\"nope\" > 1").unwrap()]);
    assert!(matches!(
        cache.get_page(&bad_filter),
        Err(TableError::QueryTranslation(_))
    ));
}

#[test]
fn test_column_add_update_delete() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let req = TableRequest::new("cars");

    // add a computed column
    cache
        .add_or_update_column(&req, ColumnSpec::new("hp2", "\"hp\" * 2"))
        .unwrap();
    let page = cache.get_page(&req).unwrap();
    assert!(page.data.column_index("hp2").is_some());
    assert_eq!(page.data.get(0, "hp2"), Some(&Value::Int64(220)));

    // replace its expression
    cache
        .add_or_update_column(&req, ColumnSpec::new("hp2", "\"hp\" * 3"))
        .unwrap();
    let page = cache.get_page(&req).unwrap();
    assert_eq!(page.data.get(0, "hp2"), Some(&Value::Int64(330)));

    // edits flow into further derivations; hp * 3 > 600 means hp > 200
    let filtered = req
        .clone()
        .with_filters(vec![Filter::parse("\"hp2\" > 600").unwrap()]);
    let page = cache.get_page(&filtered).unwrap();
    assert_eq!(page.total_rows, 2);

    // delete it again
    cache.delete_column(&req, "hp2").unwrap();
    let page = cache.get_page(&req).unwrap();
    assert!(page.data.column_index("hp2").is_none());

    // deleting an unknown column is a translation error
    assert!(matches!(
        cache.delete_column(&req, "hp2"),
        Err(TableError::QueryTranslation(_))
    ));
}

#[test]
fn test_csv_source_end_to_end() {
    let dir = TempDir::new().unwrap();
    let csv_path = dir.path().join("stars.csv");
    let mut f = std::fs::File::create(&csv_path).unwrap();
    writeln!(f, "ra,dec,mag").unwrap();
    for i in 0..50 {
        writeln!(f, "{},{},{}", 149.0 + i as f64 * 0.01, 2.0, 10 + i).unwrap();
    }
    drop(f);

    let cache = TableCache::new(
        TableCacheConfig::new(dir.path().join("work")),
        Arc::new(CsvFetcher),
    )
    .unwrap();
    let req = TableRequest::new(csv_path.to_str().unwrap())
        .with_filters(vec![Filter::parse("\"mag\" < 20").unwrap()]);

    let page = cache.get_page(&req).unwrap();
    assert_eq!(page.total_rows, 10);
    assert_eq!(page.data.columns[0].data_type, DataType::Float64);
    assert_eq!(page.data.columns[2].data_type, DataType::Int64);
    assert_eq!(page.data.title.as_deref(), Some("stars"));

    // missing source surfaces the fetch failure with its root cause
    let missing = TableRequest::new(dir.path().join("gone.csv").to_str().unwrap());
    let err = cache.get_page(&missing).unwrap_err();
    assert!(matches!(err, TableError::DataAccess { .. }));
    assert!(err.root_cause().is_some());
}

#[test]
fn test_registered_log_function() {
    // lg() is a registered UDF on SQLite and a macro on DuckDB
    for backend in [BackendKind::Sqlite, BackendKind::DuckDb] {
        let dir = TempDir::new().unwrap();
        let cache = new_cache(&dir);
        let req = TableRequest::new("cars").with_backend(backend);

        cache
            .add_or_update_column(&req, ColumnSpec::new("ldisp", "lg(\"disp\")"))
            .unwrap();
        let page = cache.get_page(&req).unwrap();
        let got = page
            .data
            .get(0, "ldisp")
            .and_then(Value::as_f64)
            .expect("computed log column");
        assert!((got - 160.0f64.log10()).abs() < 1e-12, "{:?}: {}", backend, got);
    }
}

#[test]
fn test_caller_request_is_never_mutated() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let req = TableRequest::new("cars").with_sort(vec![SortTerm::asc("hp")]);
    let snapshot = req.clone();
    let _ = cache.get_page(&req).unwrap();
    assert_eq!(req, snapshot);
}
