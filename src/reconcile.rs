//! Schema reconciliation against the embedded columnar store.
//!
//! Grounded on `ducklake_common`'s DDL-generation helpers and connection
//! handling, narrowed to the closed type set and additive-only evolution
//! this engine needs — no DuckLake catalog attachment, no compaction.

use std::collections::HashMap;
use std::sync::Mutex;

use duckdb::Connection;
use tracing::{debug, info};

use crate::error::{AppendError, CloseError, IngestError, ReconcileError};
use crate::inference::ColumnType;
use crate::metrics::Metrics;

pub const RESERVED_ID: &str = "_id";
pub const RESERVED_TS: &str = "_ts";

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// The columns and inferred types observed while decoding one batch for one
/// table. Only the diff against the store's existing columns matters for
/// DDL; reserved columns are always present and first.
#[derive(Debug, Clone)]
pub struct BatchSchema {
    pub ordered_names: Vec<String>,
    pub types: HashMap<String, ColumnType>,
}

impl BatchSchema {
    pub fn new() -> Self {
        let mut types = HashMap::new();
        types.insert(RESERVED_ID.to_string(), ColumnType::Text);
        types.insert(RESERVED_TS.to_string(), ColumnType::Timestamp);
        Self {
            ordered_names: vec![RESERVED_ID.to_string(), RESERVED_TS.to_string()],
            types,
        }
    }

    /// Records a non-reserved field's inferred type, preserving first-seen
    /// order. Reserved columns are never passed here — they're seeded by
    /// `new`.
    pub fn observe_field(&mut self, name: &str, ty: ColumnType) {
        if !self.types.contains_key(name) {
            self.ordered_names.push(name.to_string());
        }
        self.types.insert(name.to_string(), ty);
    }

    fn column(&self, name: &str) -> Column {
        Column {
            name: name.to_string(),
            ty: self.types[name],
            nullable: !(name == RESERVED_ID || name == RESERVED_TS),
        }
    }

    pub fn columns_in_order(&self) -> Vec<Column> {
        self.ordered_names.iter().map(|n| self.column(n)).collect()
    }
}

impl Default for BatchSchema {
    fn default() -> Self {
        Self::new()
    }
}

/// Quotes a SQL identifier: strips control bytes (NUL, CR, LF, ^Z) and
/// doubles embedded quote characters. Deliberately narrow — this is not the
/// product's general SQL renderer.
pub fn quote_identifier(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(*c, '\0' | '\r' | '\n' | '\u{1A}'))
        .collect();
    format!("\"{}\"", cleaned.replace('"', "\"\""))
}

fn sql_type_to_column_type(sql_type: &str) -> ColumnType {
    let upper = sql_type.to_uppercase();
    if upper.starts_with("BOOL") {
        ColumnType::Bool
    } else if upper.starts_with("DOUBLE") || upper.starts_with("FLOAT") || upper.starts_with("DECIMAL") {
        ColumnType::Double
    } else if upper.starts_with("TIMESTAMP") {
        ColumnType::Timestamp
    } else if upper.starts_with("DATE") {
        ColumnType::Date
    } else if upper.starts_with("JSON") {
        ColumnType::Json
    } else {
        ColumnType::Text
    }
}

fn column_def_ddl(column: &Column) -> String {
    let nullability = if column.nullable { "" } else { " NOT NULL" };
    format!(
        "{} {}{}",
        quote_identifier(&column.name),
        column.ty.as_sql(),
        nullability
    )
}

/// Storage-agnostic seam so the reconciler and row builder are testable
/// without a real DuckDB file.
pub trait ColumnStore: Send + Sync {
    fn describe(&self, table: &str) -> Result<Option<Vec<Column>>, ReconcileError>;
    fn create_table(&self, table: &str, schema: &BatchSchema) -> Result<(), ReconcileError>;
    fn add_columns(&self, table: &str, additions: &[Column]) -> Result<(), ReconcileError>;

    /// Appends `rows` to `table` through a scoped appender: acquired at the
    /// start of this call, flushed (or dropped on error) before it returns —
    /// the bulk-append resource never outlives one drain of one table.
    fn append_rows(
        &self,
        table: &str,
        rows: &[crate::row_builder::AppendableRow],
    ) -> Result<(), crate::error::IngestError>;
}

pub struct DuckDbStore {
    conn: Mutex<Connection>,
}

impl DuckDbStore {
    pub fn open(path: &str) -> Result<Self, duckdb::Error> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, duckdb::Error> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        let conn = self.conn.lock().expect("duckdb connection mutex poisoned");
        f(&conn)
    }
}

impl ColumnStore for DuckDbStore {
    fn describe(&self, table: &str) -> Result<Option<Vec<Column>>, ReconcileError> {
        let conn = self.conn.lock().expect("duckdb connection mutex poisoned");

        let exists: i64 = conn
            .query_row(
                "SELECT count(*) FROM information_schema.tables WHERE table_name = ?",
                [table],
                |row| row.get(0),
            )
            .map_err(|source| ReconcileError::Describe {
                table: table.to_string(),
                source,
            })?;

        if exists == 0 {
            return Ok(None);
        }

        let mut stmt = conn
            .prepare(
                "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
                 WHERE table_name = ? ORDER BY ordinal_position",
            )
            .map_err(|source| ReconcileError::Describe {
                table: table.to_string(),
                source,
            })?;

        let rows = stmt
            .query_map([table], |row| {
                let name: String = row.get(0)?;
                let data_type: String = row.get(1)?;
                let is_nullable: String = row.get(2)?;
                Ok(Column {
                    name,
                    ty: sql_type_to_column_type(&data_type),
                    nullable: is_nullable.eq_ignore_ascii_case("YES"),
                })
            })
            .map_err(|source| ReconcileError::Describe {
                table: table.to_string(),
                source,
            })?;

        let columns = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ReconcileError::Describe {
                table: table.to_string(),
                source,
            })?;

        Ok(Some(columns))
    }

    fn create_table(&self, table: &str, schema: &BatchSchema) -> Result<(), ReconcileError> {
        let columns = schema.columns_in_order();
        let defs: Vec<String> = columns.iter().map(column_def_ddl).collect();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(table),
            defs.join(", ")
        );
        debug!(%table, %ddl, "issuing create-table DDL");

        let conn = self.conn.lock().expect("duckdb connection mutex poisoned");
        conn.execute(&ddl, [])
            .map_err(|source| ReconcileError::Create {
                table: table.to_string(),
                source,
            })?;
        info!(%table, columns = columns.len(), "table created");
        Metrics::ddl_issued();
        Ok(())
    }

    fn add_columns(&self, table: &str, additions: &[Column]) -> Result<(), ReconcileError> {
        let conn = self.conn.lock().expect("duckdb connection mutex poisoned");
        for column in additions {
            let ddl = format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_identifier(table),
                column_def_ddl(column)
            );
            debug!(%table, column = %column.name, %ddl, "issuing add-column DDL");
            conn.execute(&ddl, [])
                .map_err(|source| ReconcileError::Alter {
                    table: table.to_string(),
                    column: column.name.clone(),
                    source,
                })?;
        }
        if !additions.is_empty() {
            info!(%table, added = additions.len(), "columns added");
            Metrics::ddl_issued();
        }
        Ok(())
    }

    fn append_rows(
        &self,
        table: &str,
        rows: &[crate::row_builder::AppendableRow],
    ) -> Result<(), IngestError> {
        if rows.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().expect("duckdb connection mutex poisoned");
        let mut appender = conn
            .appender(table)
            .map_err(|source| AppendError::Open {
                table: table.to_string(),
                source,
            })?;

        for row in rows {
            appender
                .append_row(duckdb::params_from_iter(row.values.iter()))
                .map_err(|source| AppendError::Row {
                    table: table.to_string(),
                    sequence: row.sequence,
                    source,
                })?;
        }

        appender.flush().map_err(|source| CloseError::Flush {
            table: table.to_string(),
            source,
        })?;

        debug!(%table, rows = rows.len(), "rows appended");
        Metrics::rows_appended(rows.len());
        Ok(())
    }
}

/// Per-table cached column list, owned exclusively by the orchestrator task
/// — no locking, per the spec's concurrency model.
#[derive(Debug, Default)]
pub struct SchemaCache {
    cache: HashMap<String, Vec<Column>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self, table: &str) {
        self.cache.remove(table);
    }

    pub fn set(&mut self, table: &str, columns: Vec<Column>) {
        self.cache.insert(table.to_string(), columns);
    }

    pub fn get(&self, table: &str) -> Option<&Vec<Column>> {
        self.cache.get(table)
    }

    /// Drops every table's cached columns. Called once on entry into
    /// Recovering (spec §3: "the cache is never consulted across the
    /// restart of a batch that failed partway") — a failed reconcile can
    /// leave a table's entry stale relative to the store (e.g. an
    /// `ALTER TABLE ADD COLUMN` that partially applied before a later one
    /// in the same batch failed), so nothing cached before a recovery may
    /// be trusted after it.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

/// Reconciles one table against a per-batch schema: consults the cache for
/// the table's existing columns first (falling back to a live `describe`
/// when the table hasn't been reconciled yet this run), creates the table
/// if absent, otherwise issues additive DDL for newly observed columns,
/// then invalidates and refreshes the cache before serving the batch
/// (resolves the spec's invalidate-vs-refresh ordering open question as
/// invalidate-then-refresh-then-serve). Callers must `clear()` the cache
/// before reusing it past a failed batch — see `SchemaCache::clear`.
pub fn reconcile(
    store: &dyn ColumnStore,
    cache: &mut SchemaCache,
    table: &str,
    batch_schema: &BatchSchema,
) -> Result<Vec<Column>, ReconcileError> {
    let existing = match cache.get(table) {
        Some(columns) => Some(columns.clone()),
        None => store.describe(table)?,
    };

    match existing {
        None => {
            store.create_table(table, batch_schema)?;
        }
        Some(existing) => {
            let additions: Vec<Column> = batch_schema
                .ordered_names
                .iter()
                .filter(|name| !existing.iter().any(|c| &c.name == *name))
                .map(|name| Column {
                    name: name.clone(),
                    ty: batch_schema.types[name],
                    nullable: true,
                })
                .collect();

            if !additions.is_empty() {
                store.add_columns(table, &additions)?;
            }
        }
    }

    cache.invalidate(table);
    let refreshed = store
        .describe(table)?
        .ok_or_else(|| ReconcileError::MissingAfterReconcile {
            table: table.to_string(),
        })?;
    cache.set(table, refreshed.clone());
    Ok(refreshed)
}

/// Wraps a store and counts `describe` calls, so tests can prove the
/// cache is actually consulted rather than left write-only.
#[cfg(test)]
struct CountingStore {
    inner: DuckDbStore,
    describe_calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl CountingStore {
    fn new(inner: DuckDbStore) -> Self {
        Self {
            inner,
            describe_calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn describe_call_count(&self) -> usize {
        self.describe_calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ColumnStore for CountingStore {
    fn describe(&self, table: &str) -> Result<Option<Vec<Column>>, ReconcileError> {
        self.describe_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.describe(table)
    }

    fn create_table(&self, table: &str, schema: &BatchSchema) -> Result<(), ReconcileError> {
        self.inner.create_table(table, schema)
    }

    fn add_columns(&self, table: &str, additions: &[Column]) -> Result<(), ReconcileError> {
        self.inner.add_columns(table, additions)
    }

    fn append_rows(
        &self,
        table: &str,
        rows: &[crate::row_builder::AppendableRow],
    ) -> Result<(), IngestError> {
        self.inner.append_rows(table, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_doubles_embedded_quotes_and_strips_control_bytes() {
        let quoted = quote_identifier("weird\"name\0\r\n");
        assert_eq!(quoted, "\"weird\"\"name\"");
    }

    #[test]
    fn create_on_first_message_has_reserved_columns_first() {
        let mut schema = BatchSchema::new();
        schema.observe_field("price", ColumnType::Double);
        schema.observe_field("region", ColumnType::Text);

        let columns = schema.columns_in_order();
        assert_eq!(columns[0].name, RESERVED_ID);
        assert_eq!(columns[1].name, RESERVED_TS);
        assert_eq!(columns[2].name, "price");
        assert_eq!(columns[3].name, "region");
    }

    #[test]
    fn reconcile_against_in_memory_store_creates_then_evolves() {
        let store = DuckDbStore::open_in_memory().unwrap();
        let mut cache = SchemaCache::new();

        let mut first = BatchSchema::new();
        first.observe_field("a", ColumnType::Double);
        let after_create = reconcile(&store, &mut cache, "sales", &first).unwrap();
        assert_eq!(after_create.len(), 3);

        let mut second = BatchSchema::new();
        second.observe_field("a", ColumnType::Double);
        second.observe_field("b", ColumnType::Text);
        second.observe_field("c", ColumnType::Bool);
        let after_evolve = reconcile(&store, &mut cache, "sales", &second).unwrap();

        let names: Vec<&str> = after_evolve.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["_id", "_ts", "a", "b", "c"]);
    }

    #[test]
    fn reconcile_consults_warm_cache_instead_of_requerying_store() {
        let store = CountingStore::new(DuckDbStore::open_in_memory().unwrap());
        let mut cache = SchemaCache::new();

        let mut schema = BatchSchema::new();
        schema.observe_field("a", ColumnType::Double);
        reconcile(&store, &mut cache, "sales", &schema).unwrap();
        let calls_after_first = store.describe_call_count();

        // Same table, same schema: the "does it exist / what does it
        // have" lookup should come from the warm cache, so only the
        // mandatory invalidate-then-refresh `describe` fires.
        reconcile(&store, &mut cache, "sales", &schema).unwrap();
        let calls_after_second = store.describe_call_count();

        assert_eq!(calls_after_second - calls_after_first, 1);
    }

    #[test]
    fn cleared_cache_falls_back_to_live_describe() {
        let store = CountingStore::new(DuckDbStore::open_in_memory().unwrap());
        let mut cache = SchemaCache::new();

        let mut schema = BatchSchema::new();
        schema.observe_field("a", ColumnType::Double);
        reconcile(&store, &mut cache, "sales", &schema).unwrap();
        let calls_after_first = store.describe_call_count();

        cache.clear();
        reconcile(&store, &mut cache, "sales", &schema).unwrap();
        let calls_after_second = store.describe_call_count();

        // With the cache cleared (as happens entering Recovering), the
        // initial existing-columns lookup must hit the store again.
        assert_eq!(calls_after_second - calls_after_first, 2);
    }

    #[test]
    fn schema_survives_reopening_the_on_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.duckdb");
        let path = path.to_str().unwrap();

        {
            let store = DuckDbStore::open(path).unwrap();
            let mut cache = SchemaCache::new();
            let mut schema = BatchSchema::new();
            schema.observe_field("price", ColumnType::Double);
            reconcile(&store, &mut cache, "sales", &schema).unwrap();
        }

        let reopened = DuckDbStore::open(path).unwrap();
        let columns = reopened.describe("sales").unwrap().unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["_id", "_ts", "price"]);
    }
}
