//! Query processor: ingest once, derive on demand, page out
//!
//! `TableCache` is the crate facade. A request resolves to one database file,
//! the source is ingested into the base table set at most once, and every
//! filtered/sorted/decimated/column-edited view becomes a derived table named
//! by a digest of the parameters that produced it. Build locks guarantee a
//! single builder per artifact; everyone else reuses what the builder left.

use crate::adapter::{
    derived_table_name, execute_in_txn, is_derived_name, quote_ident, quote_literal,
    AdapterRegistry, DbAdapter, AUX_TABLE, BASE_TABLES, DATA_TABLE, DD_TABLE, META_TABLE,
    ROW_IDX,
};
use crate::config::TableCacheConfig;
use crate::data::{ColumnDef, DataSet, DataType, Value};
use crate::decimate::DecimateKey;
use crate::fetch::DataFetcher;
use crate::filter::Filter;
use crate::lock::{KeyedGuard, KeyedLock};
use crate::monitor::{DbMonitor, HandleRef};
use crate::request::{
    digest_hex, digest_params, ColumnSelection, DecimateSpec, SortDirection, SortTerm,
    TableRequest,
};
use crate::{Result, TableError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// META key holding the serialized column-edit list
const EDITS_KEY: &str = "column_edits";
/// META key prefix for per-table decimation grids
const GRID_KEY_PREFIX: &str = "decimate:";
/// Name of the generated grid-cell column
pub const DECIMATE_KEY_COL: &str = "decimate_key";

/// A page of results: rows plus the total match count, which can exceed the
/// page size.
#[derive(Debug, Clone)]
pub struct TablePage {
    /// Rows, column descriptors, title and attributes for the window
    pub data: DataSet,
    /// Total rows in the queried table, ignoring paging
    pub total_rows: usize,
}

/// A column add/update: a name and the SQL expression computing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    /// Engine SQL expression over existing columns
    pub expr: String,
    pub data_type: Option<DataType>,
    pub description: Option<String>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expr: expr.into(),
            data_type: None,
            description: None,
        }
    }
}

/// One recorded column edit; the effective table replays these in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum ColumnEdit {
    Upsert(ColumnSpec),
    Delete { name: String },
}

/// Parameter block identifying one derived table
#[derive(Serialize)]
struct DeriveParams<'a> {
    parent: &'a str,
    columns: &'a ColumnSelection,
    filters: &'a [Filter],
    sql_filter: &'a Option<String>,
    sort: &'a [SortTerm],
    decimate: &'a Option<DecimateSpec>,
}

/// The embedded table query-and-cache engine
pub struct TableCache {
    config: TableCacheConfig,
    adapters: AdapterRegistry,
    fetcher: Arc<dyn DataFetcher>,
    monitor: DbMonitor,
    locks: KeyedLock,
}

impl TableCache {
    pub fn new(config: TableCacheConfig, fetcher: Arc<dyn DataFetcher>) -> Result<Self> {
        std::fs::create_dir_all(&config.work_dir)?;
        let monitor = DbMonitor::new(config.idle_timeout);
        Ok(Self {
            config,
            adapters: AdapterRegistry::new(),
            fetcher,
            monitor,
            locks: KeyedLock::new(),
        })
    }

    /// The lifecycle monitor owning this engine's open handles
    pub fn monitor(&self) -> &DbMonitor {
        &self.monitor
    }

    /// The build-lock table (exposed for instrumentation)
    pub fn locks(&self) -> &KeyedLock {
        &self.locks
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Fetch one page of results for a request, materializing the source and
    /// any derived tables it needs along the way.
    pub fn get_page(&self, request: &TableRequest) -> Result<TablePage> {
        // value-semantics: work on a clone, never the caller's request
        let req = request.clone();
        let started = Instant::now();

        let entry = self.resolve(&req)?;
        self.ensure_ingested(&entry, &req)?;

        let parent = self.effective_table(&entry)?;
        let table = if req.needs_derive() {
            self.derive(&entry, &req, &parent)?
        } else {
            parent
        };

        let (mut data, total_rows) = self.read_page(&entry, &req, &table)?;
        self.attach_metadata(&entry, &req, &table, &mut data)?;

        log::info!(
            "[{}] page start={} rows={} total={} table={} in {} ms",
            req.request_id,
            req.page.start,
            data.len(),
            total_rows,
            table,
            started.elapsed().as_millis()
        );
        Ok(TablePage { data, total_rows })
    }

    /// Add a computed column, or replace the expression of a previously
    /// added one. Subsequent derivations for this source chain from the
    /// edited table.
    pub fn add_or_update_column(&self, request: &TableRequest, spec: ColumnSpec) -> Result<()> {
        let req = request.clone();
        let entry = self.resolve(&req)?;
        self.ensure_ingested(&entry, &req)?;

        let mut edits = self.load_edits(&entry)?;
        edits.retain(|e| !matches!(e, ColumnEdit::Upsert(s) if s.name == spec.name));
        self.upsert_dd_row(&entry, &spec)?;
        edits.push(ColumnEdit::Upsert(spec));
        self.store_edits(&entry, &edits)
    }

    /// Remove a column from the effective table
    pub fn delete_column(&self, request: &TableRequest, name: &str) -> Result<()> {
        let req = request.clone();
        let entry = self.resolve(&req)?;
        self.ensure_ingested(&entry, &req)?;

        let current = self.effective_table(&entry)?;
        let columns = self.visible_columns(&entry, &current)?;
        if !columns.iter().any(|c| c == name) {
            return Err(TableError::QueryTranslation(format!(
                "unknown column: {}",
                name
            )));
        }

        let mut edits = self.load_edits(&entry)?;
        edits.push(ColumnEdit::Delete {
            name: name.to_string(),
        });
        self.delete_dd_row(&entry, name)?;
        self.store_edits(&entry, &edits)
    }

    /// Drop every derived table for a source, keeping the base set intact.
    /// Returns the number of tables dropped.
    pub fn clear_derived(&self, request: &TableRequest) -> Result<usize> {
        let entry = self.resolve(request)?;
        let mut dropped = 0;
        for name in entry.table_names() {
            if is_derived_name(&name) {
                entry
                    .conn()
                    .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))?;
                entry.untrack_table(&name);
                dropped += 1;
            }
        }
        log::info!(
            "cleared {} derived tables from {}",
            dropped,
            entry.path().display()
        );
        Ok(dropped)
    }

    /// Close a source's database, optionally deleting the file and the
    /// sibling files the engine left next to it.
    pub fn close(&self, request: &TableRequest, delete_file: bool) {
        let (adapter, path) = self.locate(request);
        self.monitor.close(&path, adapter, delete_file);
    }

    /// Run a lifecycle sweep: close idle handles, retry parked deletions
    pub fn sweep(&self) -> usize {
        self.monitor.sweep()
    }

    // ========================================================================
    // Resolve
    // ========================================================================

    /// Database file and adapter for a request. Each (source, backend) pair
    /// maps to exactly one file path: an explicit hint names the backend;
    /// otherwise an already-materialized file wins, then the configured
    /// default.
    fn locate(&self, req: &TableRequest) -> (Arc<dyn DbAdapter>, PathBuf) {
        let stem = format!("tbl_{}", digest_hex(&req.source, 16));
        let file_for = |adapter: &Arc<dyn DbAdapter>| {
            self.config
                .work_dir
                .join(format!("{}.{}", stem, adapter.extensions()[0]))
        };

        if let Some(kind) = req.backend {
            let adapter = self.adapters.by_kind(kind);
            let path = file_for(&adapter);
            return (adapter, path);
        }
        for adapter in self.adapters.iter() {
            let candidate = file_for(adapter);
            if candidate.exists() {
                return (adapter.clone(), candidate);
            }
        }
        let adapter = self.adapters.by_kind(self.config.default_backend);
        let path = file_for(&adapter);
        (adapter, path)
    }

    fn resolve(&self, req: &TableRequest) -> Result<HandleRef> {
        let (adapter, path) = self.locate(req);
        self.monitor.checkout(&path, adapter, &self.config)
    }

    fn lock(&self, key: &str) -> Result<KeyedGuard<'_>> {
        match self.config.lock_timeout {
            Some(timeout) => self.locks.acquire_timeout(key, timeout),
            None => Ok(self.locks.acquire(key)),
        }
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Create the base table set for a source, exactly once per database
    fn ensure_ingested(&self, entry: &HandleRef, req: &TableRequest) -> Result<()> {
        if entry.has_table(DATA_TABLE) {
            return Ok(());
        }
        let key = format!("ingest:{}", entry.path().display());
        let _guard = self.lock(&key)?;
        if entry.has_table(DATA_TABLE) {
            // another request ingested while we waited
            return Ok(());
        }

        let started = Instant::now();
        let dataset = self.fetcher.fetch(&req.source)?;
        self.create_base_set(entry, req, &dataset)?;
        log::info!(
            "[{}] ingested {} rows x {} cols from {} in {} ms",
            req.request_id,
            dataset.len(),
            dataset.columns.len(),
            req.source,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    fn create_base_set(
        &self,
        entry: &HandleRef,
        req: &TableRequest,
        dataset: &DataSet,
    ) -> Result<()> {
        let adapter = entry.adapter().clone();
        let mut conn = entry.conn();
        let conn = conn.as_mut();

        conn.execute("BEGIN")?;
        let built = (|| -> Result<()> {
            // DATA, with the hidden ordinal giving a deterministic row order
            let mut data_cols: Vec<String> = dataset
                .columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), adapter.sql_type(c.data_type)))
                .collect();
            data_cols.push(format!(
                "{} {}",
                quote_ident(ROW_IDX),
                adapter.sql_type(DataType::Int64)
            ));
            conn.execute(&format!(
                "CREATE TABLE {} ({})",
                quote_ident(DATA_TABLE),
                data_cols.join(", ")
            ))?;

            conn.execute(&format!(
                "CREATE TABLE {} (\"cname\" {t}, \"type\" {t}, \"units\" {t}, \"description\" {t})",
                quote_ident(DD_TABLE),
                t = adapter.sql_type(DataType::Text)
            ))?;
            conn.execute(&format!(
                "CREATE TABLE {} (\"key\" {t}, \"value\" {t})",
                quote_ident(META_TABLE),
                t = adapter.sql_type(DataType::Text)
            ))?;
            conn.execute(&format!(
                "CREATE TABLE {} (\"cname\" {t}, \"hints\" {t})",
                quote_ident(AUX_TABLE),
                t = adapter.sql_type(DataType::Text)
            ))?;

            // sidecar contents
            let dd_cols = sidecar_columns(&["cname", "type", "units", "description"]);
            let dd_rows: Vec<Vec<Value>> = dataset
                .columns
                .iter()
                .map(|c| {
                    vec![
                        Value::Text(c.name.clone()),
                        Value::Text(c.data_type.type_name().to_string()),
                        opt_text(&c.units),
                        opt_text(&c.description),
                    ]
                })
                .collect();
            conn.insert_rows(DD_TABLE, &dd_cols, &dd_rows)?;

            let meta_cols = sidecar_columns(&["key", "value"]);
            let mut meta_rows: Vec<Vec<Value>> = vec![
                meta_row("source", &req.source),
                meta_row("row_count", &dataset.len().to_string()),
            ];
            let title = dataset.title.clone().unwrap_or_else(|| req.source.clone());
            meta_rows.push(meta_row("title", &title));
            for (k, v) in &dataset.attributes {
                meta_rows.push(meta_row(k, v));
            }
            conn.insert_rows(META_TABLE, &meta_cols, &meta_rows)?;

            let aux_cols = sidecar_columns(&["cname", "hints"]);
            let aux_rows: Vec<Vec<Value>> = dataset
                .columns
                .iter()
                .map(|c| {
                    vec![
                        Value::Text(c.name.clone()),
                        Value::Text("{}".to_string()),
                    ]
                })
                .collect();
            conn.insert_rows(AUX_TABLE, &aux_cols, &aux_rows)?;

            // data rows, ordinal appended
            let mut insert_cols = dataset.columns.clone();
            insert_cols.push(ColumnDef::new(ROW_IDX, DataType::Int64));
            let rows: Vec<Vec<Value>> = dataset
                .rows
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    let mut full = row.clone();
                    full.push(Value::Int64(i as i64));
                    full
                })
                .collect();
            conn.insert_rows(DATA_TABLE, &insert_cols, &rows)?;
            Ok(())
        })();

        match built {
            Ok(()) => {
                conn.execute("COMMIT")?;
                for table in BASE_TABLES {
                    entry.track_table(table);
                }
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK");
                Err(e)
            }
        }
    }

    // ========================================================================
    // Derive
    // ========================================================================

    /// Resolve (building if necessary) the derived table for this request's
    /// filter/sort/column/decimation parameters against `parent`.
    fn derive(&self, entry: &HandleRef, req: &TableRequest, parent: &str) -> Result<String> {
        let params = DeriveParams {
            parent,
            columns: &req.columns,
            filters: &req.filters,
            sql_filter: &req.sql_filter,
            sort: &req.sort,
            decimate: &req.decimate,
        };
        let table = derived_table_name(&digest_params(&params, 16));
        if entry.has_table(&table) {
            return Ok(table);
        }

        let key = format!("derive:{}:{}", entry.path().display(), table);
        let _guard = self.lock(&key)?;
        if entry.has_table(&table) {
            return Ok(table);
        }

        let started = Instant::now();
        let grid = match &req.decimate {
            Some(_) => Some(self.grid_for(entry, req, parent)?),
            None => None,
        };
        let mut statements = Vec::new();
        let select = self.render_derive_select(entry, req, parent, grid.as_ref())?;
        statements.push(entry.adapter().create_table_as(&table, &select));
        if let Some(grid) = &grid {
            statements.push(grid_meta_insert(&table, grid)?);
        }
        execute_in_txn(entry.conn().as_mut(), &statements)?;
        entry.track_table(&table);

        log::info!(
            "[{}] built {} from {} in {} ms",
            req.request_id,
            table,
            parent,
            started.elapsed().as_millis()
        );
        Ok(table)
    }

    /// SELECT statement materializing the derived table
    fn render_derive_select(
        &self,
        entry: &HandleRef,
        req: &TableRequest,
        parent: &str,
        grid: Option<&DecimateKey>,
    ) -> Result<String> {
        let adapter = entry.adapter().clone();
        let available = self.visible_columns(entry, parent)?;

        let selected: Vec<String> = match &req.columns {
            ColumnSelection::All => available.clone(),
            ColumnSelection::Columns(cols) => {
                for col in cols {
                    if !available.iter().any(|c| c == col) {
                        return Err(TableError::QueryTranslation(format!(
                            "unknown column: {}",
                            col
                        )));
                    }
                }
                cols.clone()
            }
        };

        for filter in &req.filters {
            if !available.iter().any(|c| *c == filter.column) {
                return Err(TableError::QueryTranslation(format!(
                    "unknown filter column: {}",
                    filter.column
                )));
            }
        }
        for term in &req.sort {
            let generated = req.decimate.is_some() && term.column == DECIMATE_KEY_COL;
            if !generated && !available.iter().any(|c| *c == term.column) {
                return Err(TableError::QueryTranslation(format!(
                    "unknown sort column: {}",
                    term.column
                )));
            }
        }

        let where_part = adapter.where_part(req)?;
        let from_part = adapter.from_part(parent);

        if let Some(spec) = &req.decimate {
            for col in [&spec.x_col, &spec.y_col] {
                if !available.iter().any(|c| c == col) {
                    return Err(TableError::QueryTranslation(format!(
                        "unknown decimation column: {}",
                        col
                    )));
                }
            }
            let grid = grid.expect("grid computed for decimation request");
            let call = grid.sql_call(&quote_ident(&spec.x_col), &quote_ident(&spec.y_col));

            if spec.aggregate {
                // one row per occupied cell: representative point + population
                let inner = format!(
                    "SELECT {call} AS {key}, min({x}) AS {x}, min({y}) AS {y}, count(*) AS \"points\" {from} {where_p} GROUP BY 1",
                    call = call,
                    key = quote_ident(DECIMATE_KEY_COL),
                    x = quote_ident(&spec.x_col),
                    y = quote_ident(&spec.y_col),
                    from = from_part,
                    where_p = where_part,
                )
                .trim()
                .to_string();
                return Ok(format!(
                    "SELECT *, row_number() OVER (ORDER BY {key}) - 1 AS {row_idx} FROM ({inner}) AS cells",
                    key = quote_ident(DECIMATE_KEY_COL),
                    row_idx = quote_ident(ROW_IDX),
                    inner = inner,
                ));
            }

            let mut list: Vec<String> = selected.iter().map(|c| quote_ident(c)).collect();
            list.push(format!("{} AS {}", call, quote_ident(DECIMATE_KEY_COL)));
            let order = window_order(req, Some(&call));
            list.push(format!(
                "row_number() OVER ({}) - 1 AS {}",
                order,
                quote_ident(ROW_IDX)
            ));
            let sql = format!(
                "SELECT {} {} {}",
                list.join(", "),
                from_part,
                where_part
            );
            return Ok(sql.trim().to_string());
        }

        let mut list: Vec<String> = selected.iter().map(|c| quote_ident(c)).collect();
        let order = window_order(req, None);
        list.push(format!(
            "row_number() OVER ({}) - 1 AS {}",
            order,
            quote_ident(ROW_IDX)
        ));
        let sql = format!("SELECT {} {} {}", list.join(", "), from_part, where_part);
        Ok(sql.trim().to_string())
    }

    /// Grid descriptor for a decimation over `parent` with the request's
    /// filters applied, from a min/max stats query.
    fn grid_for(
        &self,
        entry: &HandleRef,
        req: &TableRequest,
        parent: &str,
    ) -> Result<DecimateKey> {
        let spec = req.decimate.as_ref().expect("decimation requested");
        let adapter = entry.adapter().clone();
        let where_part = adapter.where_part(req)?;
        let sql = format!(
            "SELECT min({x}), max({x}), min({y}), max({y}) {} {}",
            adapter.from_part(parent),
            where_part,
            x = quote_ident(&spec.x_col),
            y = quote_ident(&spec.y_col),
        );
        let stats = entry.conn().query(sql.trim())?;
        let cell = |i: usize| -> f64 {
            stats
                .rows
                .first()
                .and_then(|r| r.get(i))
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        };
        Ok(DecimateKey::grid_for(
            cell(0),
            cell(1),
            cell(2),
            cell(3),
            spec.cells,
        ))
    }

    // ========================================================================
    // Column edits
    // ========================================================================

    /// The table this source's derivations chain from: base DATA, or the
    /// column-edited derivation of it.
    fn effective_table(&self, entry: &HandleRef) -> Result<String> {
        let edits = self.load_edits(entry)?;
        if edits.is_empty() {
            return Ok(DATA_TABLE.to_string());
        }

        let table = derived_table_name(&digest_params(&("edits", &edits), 16));
        if entry.has_table(&table) {
            return Ok(table);
        }

        let key = format!("derive:{}:{}", entry.path().display(), table);
        let _guard = self.lock(&key)?;
        if entry.has_table(&table) {
            return Ok(table);
        }

        // replay edits over the base column list
        let mut columns: Vec<(String, Option<String>)> = self
            .visible_columns(entry, DATA_TABLE)?
            .into_iter()
            .map(|c| (c, None))
            .collect();
        for edit in &edits {
            match edit {
                ColumnEdit::Upsert(spec) => {
                    let rendered = format!("({}) AS {}", spec.expr, quote_ident(&spec.name));
                    match columns.iter_mut().find(|(name, _)| *name == spec.name) {
                        Some(slot) => slot.1 = Some(rendered),
                        None => columns.push((spec.name.clone(), Some(rendered))),
                    }
                }
                ColumnEdit::Delete { name } => {
                    columns.retain(|(c, _)| c != name);
                }
            }
        }

        let mut list: Vec<String> = columns
            .into_iter()
            .map(|(name, rendered)| rendered.unwrap_or_else(|| quote_ident(&name)))
            .collect();
        list.push(quote_ident(ROW_IDX));
        let select = format!(
            "SELECT {} {}",
            list.join(", "),
            entry.adapter().from_part(DATA_TABLE)
        );
        let ddl = entry.adapter().create_table_as(&table, &select);
        execute_in_txn(entry.conn().as_mut(), &[ddl])?;
        entry.track_table(&table);
        Ok(table)
    }

    fn load_edits(&self, entry: &HandleRef) -> Result<Vec<ColumnEdit>> {
        let sql = format!(
            "SELECT \"value\" FROM {} WHERE \"key\" = {}",
            quote_ident(META_TABLE),
            quote_literal(EDITS_KEY)
        );
        let result = entry.conn().query(&sql)?;
        match result.rows.first().and_then(|r| r.first()) {
            Some(Value::Text(json)) => serde_json::from_str(json)
                .map_err(|e| TableError::data_access_with("corrupt column edit list", e)),
            _ => Ok(Vec::new()),
        }
    }

    fn store_edits(&self, entry: &HandleRef, edits: &[ColumnEdit]) -> Result<()> {
        let json = serde_json::to_string(edits)
            .map_err(|e| TableError::data_access_with("edit serialization failed", e))?;
        let statements = vec![
            format!(
                "DELETE FROM {} WHERE \"key\" = {}",
                quote_ident(META_TABLE),
                quote_literal(EDITS_KEY)
            ),
            format!(
                "INSERT INTO {} (\"key\", \"value\") VALUES ({}, {})",
                quote_ident(META_TABLE),
                quote_literal(EDITS_KEY),
                quote_literal(&json)
            ),
        ];
        execute_in_txn(entry.conn().as_mut(), &statements)
    }

    fn upsert_dd_row(&self, entry: &HandleRef, spec: &ColumnSpec) -> Result<()> {
        let type_name = spec
            .data_type
            .map(|t| t.type_name().to_string())
            .unwrap_or_default();
        let statements = vec![
            format!(
                "DELETE FROM {} WHERE \"cname\" = {}",
                quote_ident(DD_TABLE),
                quote_literal(&spec.name)
            ),
            format!(
                "INSERT INTO {} (\"cname\", \"type\", \"units\", \"description\") VALUES ({}, {}, '', {})",
                quote_ident(DD_TABLE),
                quote_literal(&spec.name),
                quote_literal(&type_name),
                quote_literal(spec.description.as_deref().unwrap_or("")),
            ),
        ];
        execute_in_txn(entry.conn().as_mut(), &statements)
    }

    fn delete_dd_row(&self, entry: &HandleRef, name: &str) -> Result<()> {
        entry.conn().execute(&format!(
            "DELETE FROM {} WHERE \"cname\" = {}",
            quote_ident(DD_TABLE),
            quote_literal(name)
        ))?;
        Ok(())
    }

    // ========================================================================
    // Page + metadata
    // ========================================================================

    /// Columns of a table, minus the hidden ordinal
    fn visible_columns(&self, entry: &HandleRef, table: &str) -> Result<Vec<String>> {
        let probe = format!("SELECT * FROM {} LIMIT 0", quote_ident(table));
        let result = entry.conn().query(&probe)?;
        Ok(result
            .columns
            .into_iter()
            .map(|c| c.name)
            .filter(|name| name != ROW_IDX)
            .collect())
    }

    /// One page window plus the table's total row count
    fn read_page(
        &self,
        entry: &HandleRef,
        req: &TableRequest,
        table: &str,
    ) -> Result<(DataSet, usize)> {
        let adapter = entry.adapter().clone();
        let columns = self.visible_columns(entry, table)?;
        let sql = format!(
            "{} {} ORDER BY {} ASC {}",
            adapter.select_part(&columns),
            adapter.from_part(table),
            quote_ident(ROW_IDX),
            adapter.paging_part(&req.page)
        );
        let data = entry.conn().query(sql.trim())?;

        let total = entry
            .conn()
            .query_i64(&format!("SELECT count(*) FROM {}", quote_ident(table)))?;
        Ok((data, total.max(0) as usize))
    }

    /// Enrich a page with DD column descriptors and META attributes
    fn attach_metadata(
        &self,
        entry: &HandleRef,
        req: &TableRequest,
        table: &str,
        data: &mut DataSet,
    ) -> Result<()> {
        let dd = entry.conn().query(&format!(
            "SELECT \"cname\", \"type\", \"units\", \"description\" FROM {}",
            quote_ident(DD_TABLE)
        ))?;
        for row in &dd.rows {
            let Some(Value::Text(cname)) = row.first() else {
                continue;
            };
            if let Some(idx) = data.column_index(cname) {
                let col = &mut data.columns[idx];
                if let Some(Value::Text(t)) = row.get(1) {
                    if let Some(dt) = DataType::parse_name(t) {
                        col.data_type = dt;
                    }
                }
                if let Some(Value::Text(u)) = row.get(2) {
                    if !u.is_empty() {
                        col.units = Some(u.clone());
                    }
                }
                if let Some(Value::Text(d)) = row.get(3) {
                    if !d.is_empty() {
                        col.description = Some(d.clone());
                    }
                }
            }
        }

        let meta = entry.conn().query(&format!(
            "SELECT \"key\", \"value\" FROM {}",
            quote_ident(META_TABLE)
        ))?;
        for row in &meta.rows {
            let (Some(Value::Text(key)), Some(Value::Text(value))) = (row.first(), row.get(1))
            else {
                continue;
            };
            match key.as_str() {
                "title" => data.title = Some(value.clone()),
                EDITS_KEY => {}
                k if k.starts_with(GRID_KEY_PREFIX) => {
                    // only the grid for the table being read
                    if req.decimate.is_some() && k == format!("{}{}", GRID_KEY_PREFIX, table) {
                        data.attributes
                            .push(("decimate.grid".to_string(), value.clone()));
                    }
                }
                _ => data.attributes.push((key.clone(), value.clone())),
            }
        }
        Ok(())
    }
}

impl Drop for TableCache {
    fn drop(&mut self) {
        self.monitor.close_all();
    }
}

/// ORDER BY clause for the ordinal window: the request's sort terms with the
/// parent ordinal as final tie-break. Sorting on the generated decimation
/// column substitutes the generating expression, since a window cannot
/// reference a select-list alias.
fn window_order(req: &TableRequest, decimate_call: Option<&str>) -> String {
    let mut terms = Vec::with_capacity(req.sort.len() + 1);
    for t in &req.sort {
        let expr = match decimate_call {
            Some(call) if t.column == DECIMATE_KEY_COL => call.to_string(),
            _ => quote_ident(&t.column),
        };
        let dir = match t.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        terms.push(format!("{} {}", expr, dir));
    }
    terms.push(format!("{} ASC", quote_ident(ROW_IDX)));
    format!("ORDER BY {}", terms.join(", "))
}

/// META insert recording the grid used for a decimation table, so cache hits
/// can report the same grid the builder used.
fn grid_meta_insert(table: &str, grid: &DecimateKey) -> Result<String> {
    let json = serde_json::to_string(grid)
        .map_err(|e| TableError::data_access_with("grid serialization failed", e))?;
    Ok(format!(
        "INSERT INTO {} (\"key\", \"value\") VALUES ({}, {})",
        quote_ident(META_TABLE),
        quote_literal(&format!("{}{}", GRID_KEY_PREFIX, table)),
        quote_literal(&json),
    ))
}

fn sidecar_columns(names: &[&str]) -> Vec<ColumnDef> {
    names
        .iter()
        .map(|n| ColumnDef::new(*n, DataType::Text))
        .collect()
}

fn opt_text(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s.clone()),
        None => Value::Text(String::new()),
    }
}

fn meta_row(key: &str, value: &str) -> Vec<Value> {
    vec![Value::Text(key.to_string()), Value::Text(value.to_string())]
}
