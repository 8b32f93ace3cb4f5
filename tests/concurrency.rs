//! At-most-once build guarantees under concurrent identical requests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tablebase::{
    ColumnDef, DataFetcher, DataSet, DataType, Filter, MemoryFetcher, SortTerm, TableCache,
    TableCacheConfig, TableRequest, Value,
};
use tempfile::TempDir;

fn numbers_dataset(n: i64) -> DataSet {
    let mut ds = DataSet::new(vec![
        ColumnDef::new("n", DataType::Int64),
        ColumnDef::new("sq", DataType::Int64),
    ]);
    for i in 0..n {
        ds.push_row(vec![Value::Int64(i), Value::Int64(i * i)]);
    }
    ds
}

/// Fetcher that takes a while, to widen the double-ingest window
struct SlowFetcher {
    inner: MemoryFetcher,
    delay: Duration,
}

impl DataFetcher for SlowFetcher {
    fn fetch(&self, source: &str) -> tablebase::Result<DataSet> {
        thread::sleep(self.delay);
        self.inner.fetch(source)
    }
}

#[test]
fn test_concurrent_requests_ingest_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(SlowFetcher {
        inner: MemoryFetcher::new(numbers_dataset(100)),
        delay: Duration::from_millis(50),
    });
    let cache = Arc::new(
        TableCache::new(TableCacheConfig::new(dir.path()), fetcher.clone()).unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            cache.get_page(&TableRequest::new("numbers")).unwrap()
        }));
    }
    for h in handles {
        let page = h.join().unwrap();
        assert_eq!(page.total_rows, 100);
    }

    // every request saw the data; exactly one built it
    assert_eq!(fetcher.inner.fetch_count(), 1);
}

#[test]
fn test_concurrent_identical_derives_build_once() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(
        TableCache::new(
            TableCacheConfig::new(dir.path()),
            Arc::new(MemoryFetcher::new(numbers_dataset(500))),
        )
        .unwrap(),
    );

    let req = TableRequest::new("numbers")
        .with_filters(vec![Filter::parse("\"n\" >= 250").unwrap()])
        .with_sort(vec![SortTerm::desc("sq")]);

    let failures = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let req = req.clone();
        let failures = failures.clone();
        handles.push(thread::spawn(move || {
            let page = cache.get_page(&req).unwrap();
            if page.total_rows != 250 || page.data.get(0, "n") != Some(&Value::Int64(499)) {
                failures.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(failures.load(Ordering::SeqCst), 0);

    // identical derive keys resolved to one cached table
    assert_eq!(cache.clear_derived(&req).unwrap(), 1);
    // and the lock table kept no bookkeeping around
    assert_eq!(cache.locks().entry_count(), 0);
}

#[test]
fn test_distinct_derives_do_not_collide() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(
        TableCache::new(
            TableCacheConfig::new(dir.path()),
            Arc::new(MemoryFetcher::new(numbers_dataset(100))),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for cutoff in [10, 20, 30, 40] {
        let cache = cache.clone();
        handles.push(thread::spawn(move || {
            let req = TableRequest::new("numbers")
                .with_filters(vec![Filter::parse(&format!("\"n\" < {}", cutoff)).unwrap()]);
            let page = cache.get_page(&req).unwrap();
            assert_eq!(page.total_rows, cutoff as usize);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // four distinct filters, four distinct cached tables
    let req = TableRequest::new("numbers");
    assert_eq!(cache.clear_derived(&req).unwrap(), 4);
}
