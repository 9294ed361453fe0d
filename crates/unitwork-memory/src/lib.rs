//! In-memory relational store for unitwork.
//!
//! `MemoryStore` keeps tables of rows keyed by storage column and implements
//! all three collaborator traits: [`QueryExecutor`] by interpreting
//! [`FetchPlan`]s directly, [`WriteExecutor`] by applying each batch
//! atomically, and [`IdGenerator`] with per-entity counters.
//!
//! It enforces what a relational store would: primary keys are unique,
//! foreign keys and link rows point at existing rows, and rows that are
//! still referenced cannot be deleted. Updates and deletes that address no
//! row fail with [`WriteErrorKind::Missing`].
//!
//! The store is cheap to clone; clones share the same tables, so one store
//! can serve as both executors of a session while the test keeps a handle
//! for assertions and failure injection.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new(registry.clone());
//! store.insert_row("teams", [("id", Value::BigInt(1)), ("name", "Avengers".into())]);
//!
//! let mut session = Session::new(registry, store.clone(), store.clone());
//! let team = session.get(&cx, "Team", 1_i64).await?;
//!
//! store.fail_next_write(WriteErrorKind::Io, "connection reset");
//! assert!(session.flush(&cx).await.is_err());
//! ```

mod fetch;
mod write;

use asupersync::{Cx, Outcome};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use unitwork_core::{
    Error, IdGenerator, MetadataRegistry, QueryError, QueryErrorKind, Result, Row, Value,
    WriteCommand, WriteError, WriteErrorKind, WriteExecutor, WriteResult,
};
use unitwork_query::{FetchPlan, QueryExecutor};

/// One stored row, keyed by storage column.
pub type StoredRow = BTreeMap<String, Value>;

/// All tables of the store, entity tables and link tables alike.
pub(crate) type Tables = BTreeMap<String, Vec<StoredRow>>;

/// Executor call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// `fetch` calls, including failed ones.
    pub fetches: usize,
    /// `execute` calls, including failed ones.
    pub write_batches: usize,
    /// Commands of successfully applied batches.
    pub commands: usize,
}

#[derive(Debug, Default)]
struct StoreInner {
    tables: Tables,
    stats: StoreStats,
    /// Last value handed out per sequence entity.
    sequences: HashMap<String, i64>,
    fail_write: Option<(WriteErrorKind, String)>,
    fail_fetch: Option<String>,
}

/// In-memory relational store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    registry: Arc<MetadataRegistry>,
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            registry,
            inner: Arc::new(Mutex::new(StoreInner::default())),
        }
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a fixture row without any integrity checks.
    pub fn insert_row<K, V, I>(&self, table: &str, columns: I)
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let row: StoredRow = columns
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Snapshot of a table's rows in insertion order.
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, Vec::len)
    }

    /// Delete fixture rows behind the session's back. Returns how many went.
    pub fn delete_where(&self, table: &str, column: &str, value: &Value) -> usize {
        let mut inner = self.lock();
        let Some(rows) = inner.tables.get_mut(table) else {
            return 0;
        };
        let before = rows.len();
        rows.retain(|row| !row.get(column).is_some_and(|v| fetch::same(v, value)));
        before - rows.len()
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats
    }

    /// Make the next `execute` call fail with `kind` without applying anything.
    pub fn fail_next_write(&self, kind: WriteErrorKind, message: impl Into<String>) {
        self.lock().fail_write = Some((kind, message.into()));
    }

    /// Make the next `fetch` call fail.
    pub fn fail_next_fetch(&self, message: impl Into<String>) {
        self.lock().fail_fetch = Some(message.into());
    }

    /// Run `plan` against the current tables.
    pub fn fetch_sync(&self, plan: &FetchPlan) -> Result<Vec<Row>> {
        let mut inner = self.lock();
        inner.stats.fetches += 1;
        if let Some(message) = inner.fail_fetch.take() {
            tracing::debug!(message = %message, "Injected fetch failure");
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                message,
                source: None,
            }));
        }
        let rows = fetch::run(&self.registry, &inner.tables, plan)?;
        tracing::trace!(plan = %plan, rows = rows.len(), "Fetched");
        Ok(rows)
    }

    /// Apply `commands` as one atomic batch.
    pub fn execute_sync(&self, commands: &[WriteCommand]) -> Result<Vec<WriteResult>> {
        let mut inner = self.lock();
        inner.stats.write_batches += 1;
        if let Some((kind, message)) = inner.fail_write.take() {
            tracing::debug!(kind = ?kind, message = %message, "Injected write failure");
            return Err(Error::Write(WriteError {
                kind,
                message,
                command_index: None,
                retryable: kind == WriteErrorKind::Io,
                source: None,
            }));
        }
        let mut tables = inner.tables.clone();
        let results = write::apply(&self.registry, &mut tables, commands)?;
        inner.tables = tables;
        inner.stats.commands += commands.len();
        tracing::debug!(commands = commands.len(), "Applied write batch");
        Ok(results)
    }

    /// Reserve the next identifier of a sequence entity.
    pub fn next_id_sync(&self, entity: &str) -> Result<Value> {
        let meta = self.registry.get(entity)?;
        let field = meta
            .generated_id_field()
            .or_else(|| meta.fields.iter().find(|f| f.id))
            .ok_or_else(|| Error::missing_identifier(&meta.name, "id"))?;
        let mut inner = self.lock();
        let stored_max = inner
            .tables
            .get(&meta.table)
            .into_iter()
            .flatten()
            .filter_map(|row| row.get(&field.column).and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        let last = inner.sequences.entry(meta.name.clone()).or_insert(0);
        *last = (*last).max(stored_max) + 1;
        Ok(Value::BigInt(*last))
    }
}

impl QueryExecutor for MemoryStore {
    fn fetch(&self, _cx: &Cx, plan: &FetchPlan) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.fetch_sync(plan);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

impl WriteExecutor for MemoryStore {
    fn execute(
        &self,
        _cx: &Cx,
        commands: &[WriteCommand],
    ) -> impl Future<Output = Outcome<Vec<WriteResult>, Error>> + Send {
        let result = self.execute_sync(commands);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

impl IdGenerator for MemoryStore {
    fn next_id(&self, _cx: &Cx, entity: &str) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let result = self.next_id_sync(entity);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}
