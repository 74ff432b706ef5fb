//! In-process backend.
//!
//! [`MemoryDatabase`] models the parts of a PostgreSQL server the tenancy
//! layer depends on: schemas with tables and routines, a per-connection
//! `search_path` with transaction-local and session-level settings, and
//! transactions with savepoints whose changes become visible at commit.
//! Concurrent `CREATE SCHEMA` of the same name fails at commit with a
//! duplicate-object error, as it does on the server.
//!
//! Statements follow a small grammar:
//!
//! ```text
//! INSERT INTO <table> VALUES (<value>, ...)
//! SELECT * FROM <table>
//! SELECT count(*) FROM <table>
//! DELETE FROM <table>
//! SELECT current_schema()
//! ```
//!
//! Values are `$n` parameters, integers, decimals, `'text'`, `NULL`, `true`
//! and `false`. Unqualified table names resolve through the connection's
//! search path.
//!
//! Faults can be injected at fixed points to exercise recovery paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::{AssertScope, ConnectionManager, SessionConnection};
use crate::error::{DbError, DbResult};
use crate::provision::SchemaObject;
use crate::tenant::{validate_identifier, SchemaName, SearchPath};
use crate::value::{Row, Value};

/// Points at which a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Opening a connection.
    Connect,
    /// Calling a schema's assertion procedure.
    AssertProcedure,
    /// The assertion procedure returns success without changing the path.
    SilentProcedure,
    /// Setting the search path directly.
    DirectAssert,
    /// `CREATE SCHEMA`.
    CreateSchema,
    /// Resetting the search path. Also breaks the connection.
    Reset,
    /// Committing a transaction.
    Commit,
}

impl FaultPoint {
    fn default_error(self) -> DbError {
        match self {
            Self::Connect => DbError::transient("connection refused"),
            Self::AssertProcedure => {
                DbError::undefined("procedure does not exist").with_sqlstate("42883")
            }
            Self::SilentProcedure => DbError::other("procedure ignored"),
            Self::DirectAssert => DbError::other("could not set search_path"),
            Self::CreateSchema => DbError::transient("could not serialize access")
                .with_sqlstate("40001"),
            Self::Reset => DbError::transient("connection reset by peer"),
            Self::Commit => DbError::transient("could not serialize access due to concurrent update")
                .with_sqlstate("40001"),
        }
    }
}

#[derive(Debug)]
struct Fault {
    error: DbError,
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct TableData {
    columns: Arc<[String]>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Default)]
struct SchemaData {
    tables: BTreeMap<String, TableData>,
    routines: BTreeSet<String>,
    procedures: BTreeMap<String, Vec<String>>,
}

type Catalog = BTreeMap<String, SchemaData>;

/// Schemas touched by a transaction: `Some` holds the new contents.
type Overlay = BTreeMap<String, Option<SchemaData>>;

#[derive(Debug, Clone)]
enum Op {
    CreateSchema(String),
    CreateTable {
        schema: String,
        name: String,
        columns: Arc<[String]>,
    },
    CreateRoutine {
        schema: String,
        name: String,
    },
    CreateProcedure {
        schema: String,
        name: String,
        path: Vec<String>,
    },
    Insert {
        schema: String,
        table: String,
        row: Vec<Value>,
    },
    Delete {
        schema: String,
        table: String,
    },
}

impl Op {
    fn schema(&self) -> &str {
        match self {
            Self::CreateSchema(schema)
            | Self::CreateTable { schema, .. }
            | Self::CreateRoutine { schema, .. }
            | Self::CreateProcedure { schema, .. }
            | Self::Insert { schema, .. }
            | Self::Delete { schema, .. } => schema,
        }
    }
}

fn staged<'a>(
    catalog: &Catalog,
    overlay: &'a mut Overlay,
    schema: &str,
) -> &'a mut Option<SchemaData> {
    overlay
        .entry(schema.to_string())
        .or_insert_with(|| catalog.get(schema).cloned())
}

fn undefined_schema(schema: &str) -> DbError {
    DbError::undefined(format!("schema \"{}\" does not exist", schema)).with_sqlstate("3F000")
}

fn undefined_table(table: &str) -> DbError {
    DbError::undefined(format!("relation \"{}\" does not exist", table)).with_sqlstate("42P01")
}

/// Apply one operation to `overlay`, reading untouched schemas from `catalog`.
/// Returns the number of affected rows.
fn apply(catalog: &Catalog, overlay: &mut Overlay, op: &Op) -> DbResult<u64> {
    let entry = staged(catalog, overlay, op.schema());

    if let Op::CreateSchema(name) = op {
        if entry.is_some() {
            return Err(DbError::duplicate(format!("schema \"{}\" already exists", name))
                .with_sqlstate("42P06"));
        }
        *entry = Some(SchemaData::default());
        return Ok(0);
    }

    let data = entry.as_mut().ok_or_else(|| undefined_schema(op.schema()))?;
    match op {
        Op::CreateSchema(_) => Ok(0),
        Op::CreateTable { name, columns, .. } => {
            if data.tables.contains_key(name) {
                return Err(DbError::duplicate(format!("relation \"{}\" already exists", name))
                    .with_sqlstate("42P07"));
            }
            data.tables.insert(
                name.clone(),
                TableData {
                    columns: Arc::clone(columns),
                    rows: Vec::new(),
                },
            );
            Ok(0)
        }
        Op::CreateRoutine { name, .. } => {
            if !data.routines.insert(name.clone()) {
                return Err(DbError::duplicate(format!("function \"{}\" already exists", name))
                    .with_sqlstate("42723"));
            }
            Ok(0)
        }
        Op::CreateProcedure { name, path, .. } => {
            if data.procedures.contains_key(name) {
                return Err(DbError::duplicate(format!("procedure \"{}\" already exists", name))
                    .with_sqlstate("42723"));
            }
            data.procedures.insert(name.clone(), path.clone());
            Ok(0)
        }
        Op::Insert { table, row, .. } => {
            let target = data.tables.get_mut(table).ok_or_else(|| undefined_table(table))?;
            if target.columns.len() != row.len() {
                return Err(DbError::other(format!(
                    "INSERT has {} values but \"{}\" has {} columns",
                    row.len(),
                    table,
                    target.columns.len()
                )));
            }
            target.rows.push(row.clone());
            Ok(1)
        }
        Op::Delete { table, .. } => {
            let target = data.tables.get_mut(table).ok_or_else(|| undefined_table(table))?;
            let n = target.rows.len() as u64;
            target.rows.clear();
            Ok(n)
        }
    }
}

fn merge(catalog: &mut Catalog, overlay: Overlay) {
    for (name, data) in overlay {
        match data {
            Some(data) => {
                catalog.insert(name, data);
            }
            None => {
                catalog.remove(&name);
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    catalog: Mutex<Catalog>,
    faults: Mutex<HashMap<FaultPoint, Fault>>,
    shared_schema: SchemaName,
    next_id: AtomicU64,
    opened: AtomicU64,
    open: AtomicU64,
}

/// An in-process database shared by all of its connections.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<Shared>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// Create a database with an empty `public` schema.
    pub fn new() -> Self {
        Self::with_shared_schema(SchemaName::public())
    }

    /// Create a database whose default search path is `shared`.
    pub fn with_shared_schema(shared: SchemaName) -> Self {
        let mut catalog = Catalog::new();
        catalog.insert(shared.as_str().to_string(), SchemaData::default());
        Self {
            inner: Arc::new(Shared {
                catalog: Mutex::new(catalog),
                faults: Mutex::new(HashMap::new()),
                shared_schema: shared,
                next_id: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                open: AtomicU64::new(0),
            }),
        }
    }

    /// Open a connection.
    pub fn connect(&self) -> DbResult<MemoryConnection> {
        if let Some(e) = self.take_fault(FaultPoint::Connect) {
            return Err(e);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.opened.fetch_add(1, Ordering::Relaxed);
        self.inner.open.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryConnection {
            id,
            db: self.clone(),
            session_path: self.default_path(),
            txn: None,
            closed: false,
        })
    }

    fn default_path(&self) -> Vec<String> {
        vec![self.inner.shared_schema.as_str().to_string()]
    }

    /// Create an empty schema outside any connection.
    pub fn create_schema(&self, schema: &SchemaName) {
        self.inner
            .catalog
            .lock()
            .entry(schema.as_str().to_string())
            .or_default();
    }

    /// Create a table outside any connection.
    pub fn create_table(&self, schema: &SchemaName, name: &str, definition: &str) -> DbResult<()> {
        validate_identifier(name).map_err(|e| DbError::other(e.to_string()))?;
        self.commit_ops(&[Op::CreateTable {
            schema: schema.as_str().to_string(),
            name: name.to_string(),
            columns: parse_columns(definition)?,
        }])
        .map(|_| ())
    }

    /// Check if a schema exists.
    pub fn has_schema(&self, schema: &str) -> bool {
        self.inner.catalog.lock().contains_key(schema)
    }

    /// Check if a table exists.
    pub fn has_table(&self, schema: &str, table: &str) -> bool {
        self.inner
            .catalog
            .lock()
            .get(schema)
            .is_some_and(|s| s.tables.contains_key(table))
    }

    /// Check if an assertion procedure exists.
    pub fn has_procedure(&self, schema: &str, name: &str) -> bool {
        self.inner
            .catalog
            .lock()
            .get(schema)
            .is_some_and(|s| s.procedures.contains_key(name))
    }

    /// Number of committed rows in a table; zero if it does not exist.
    pub fn table_rows(&self, schema: &str, table: &str) -> usize {
        self.inner
            .catalog
            .lock()
            .get(schema)
            .and_then(|s| s.tables.get(table))
            .map_or(0, |t| t.rows.len())
    }

    /// All schema names, sorted.
    pub fn schemas(&self) -> Vec<String> {
        self.inner.catalog.lock().keys().cloned().collect()
    }

    /// Total connections opened.
    pub fn connections_opened(&self) -> u64 {
        self.inner.opened.load(Ordering::Relaxed)
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> u64 {
        self.inner.open.load(Ordering::Relaxed)
    }

    /// Fail every time `point` is reached.
    pub fn fail(&self, point: FaultPoint) {
        self.fail_with(point, point.default_error(), None);
    }

    /// Fail the next `times` times `point` is reached.
    pub fn fail_times(&self, point: FaultPoint, times: u32) {
        self.fail_with(point, point.default_error(), Some(times));
    }

    /// Fail at `point` with `error`, `times` times or indefinitely.
    pub fn fail_with(&self, point: FaultPoint, error: DbError, times: Option<u32>) {
        if times == Some(0) {
            return;
        }
        self.inner.faults.lock().insert(
            point,
            Fault {
                error,
                remaining: times,
            },
        );
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    fn take_fault(&self, point: FaultPoint) -> Option<DbError> {
        let mut faults = self.inner.faults.lock();
        let fault = faults.get_mut(&point)?;
        let error = fault.error.clone();
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(&point);
            }
        }
        Some(error)
    }

    fn commit_ops(&self, ops: &[Op]) -> DbResult<u64> {
        let mut catalog = self.inner.catalog.lock();
        let mut overlay = Overlay::new();
        let mut affected = 0;
        for op in ops {
            affected += apply(&catalog, &mut overlay, op)?;
        }
        merge(&mut catalog, overlay);
        Ok(affected)
    }
}

#[derive(Debug, Clone)]
struct Savepoint {
    name: String,
    ops: usize,
    local_path: Option<Vec<String>>,
    session_path: Vec<String>,
}

#[derive(Debug, Default)]
struct Txn {
    ops: Vec<Op>,
    overlay: Overlay,
    savepoints: Vec<Savepoint>,
    local_path: Option<Vec<String>>,
    session_path_at_begin: Vec<String>,
    aborted: bool,
}

/// A connection to a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    db: MemoryDatabase,
    session_path: Vec<String>,
    txn: Option<Txn>,
    closed: bool,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.db.inner.open.fetch_sub(1, Ordering::Relaxed);
    }
}

impl MemoryConnection {
    fn effective_path(&self) -> &[String] {
        self.txn
            .as_ref()
            .and_then(|t| t.local_path.as_deref())
            .unwrap_or(&self.session_path)
    }

    fn check_usable(&self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::closed("connection is closed"));
        }
        if self.txn.as_ref().is_some_and(|t| t.aborted) {
            return Err(DbError::other(
                "current transaction is aborted, commands ignored until end of transaction block",
            )
            .with_sqlstate("25P02"));
        }
        Ok(())
    }

    /// Mark the open transaction aborted when `result` is an error.
    fn track<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if result.is_err() {
            if let Some(txn) = self.txn.as_mut() {
                txn.aborted = true;
            }
        }
        result
    }

    fn with_schema<R>(&self, schema: &str, f: impl FnOnce(Option<&SchemaData>) -> R) -> R {
        if let Some(entry) = self.txn.as_ref().and_then(|t| t.overlay.get(schema)) {
            return f(entry.as_ref());
        }
        let catalog = self.db.inner.catalog.lock();
        f(catalog.get(schema))
    }

    fn schema_visible(&self, schema: &str) -> bool {
        self.with_schema(schema, |s| s.is_some())
    }

    fn resolve_table(&self, table: &TableRef) -> DbResult<String> {
        match &table.schema {
            Some(schema) => Ok(schema.clone()),
            None => self
                .effective_path()
                .iter()
                .find(|schema| {
                    self.with_schema(schema, |s| s.is_some_and(|s| s.tables.contains_key(&table.name)))
                })
                .cloned()
                .ok_or_else(|| undefined_table(&table.name)),
        }
    }

    fn run(&mut self, op: Op) -> DbResult<u64> {
        match self.txn.as_mut() {
            Some(txn) => {
                let catalog = self.db.inner.catalog.lock();
                let affected = apply(&catalog, &mut txn.overlay, &op)?;
                txn.ops.push(op);
                Ok(affected)
            }
            None => self.db.commit_ops(&[op]),
        }
    }

    fn set_path(&mut self, path: Vec<String>, scope: AssertScope) {
        match (scope, self.txn.as_mut()) {
            (AssertScope::Transaction, Some(txn)) => txn.local_path = Some(path),
            // A transaction-local setting outside a transaction has no effect.
            (AssertScope::Transaction, None) => {}
            (AssertScope::Session, Some(txn)) => {
                txn.local_path = None;
                self.session_path = path;
            }
            (AssertScope::Session, None) => self.session_path = path,
        }
    }

    fn end_transaction(&mut self, commit: bool) -> DbResult<()> {
        let Some(txn) = self.txn.take() else {
            return Err(DbError::other("there is no transaction in progress").with_sqlstate("25P01"));
        };
        if !commit || txn.aborted {
            self.session_path = txn.session_path_at_begin;
            if commit {
                return Err(DbError::other("transaction was aborted and has been rolled back")
                    .with_sqlstate("25P02"));
            }
            return Ok(());
        }
        if let Some(e) = self.db.take_fault(FaultPoint::Commit) {
            self.session_path = txn.session_path_at_begin;
            return Err(e);
        }
        match self.db.commit_ops(&txn.ops) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.session_path = txn.session_path_at_begin;
                Err(e)
            }
        }
    }

    fn statement(&mut self, sql: &str, params: &[Value]) -> DbResult<Outcome> {
        match parse_statement(sql)? {
            Statement::CurrentSchema => Ok(Outcome::Rows(vec![Row::new(
                Arc::from(vec!["current_schema".to_string()]),
                vec![Value::from(self.current_schema_name())],
            )])),
            Statement::Insert { table, values } => {
                let schema = self.resolve_table(&table)?;
                let row = values
                    .into_iter()
                    .map(|expr| expr.eval(params))
                    .collect::<DbResult<Vec<_>>>()?;
                let affected = self.run(Op::Insert {
                    schema,
                    table: table.name,
                    row,
                })?;
                Ok(Outcome::Affected(affected))
            }
            Statement::Delete(table) => {
                let schema = self.resolve_table(&table)?;
                let affected = self.run(Op::Delete {
                    schema,
                    table: table.name,
                })?;
                Ok(Outcome::Affected(affected))
            }
            Statement::SelectAll(table) => {
                let schema = self.resolve_table(&table)?;
                self.with_schema(&schema, |s| {
                    let data = s
                        .and_then(|s| s.tables.get(&table.name))
                        .ok_or_else(|| undefined_table(&table.name))?;
                    Ok(Outcome::Rows(
                        data.rows
                            .iter()
                            .map(|row| Row::new(Arc::clone(&data.columns), row.clone()))
                            .collect(),
                    ))
                })
            }
            Statement::Count(table) => {
                let schema = self.resolve_table(&table)?;
                let count = self.with_schema(&schema, |s| {
                    s.and_then(|s| s.tables.get(&table.name))
                        .map(|t| t.rows.len() as i64)
                        .ok_or_else(|| undefined_table(&table.name))
                })?;
                Ok(Outcome::Rows(vec![Row::new(
                    Arc::from(vec!["count".to_string()]),
                    vec![Value::Int(count)],
                )]))
            }
        }
    }

    fn current_schema_name(&self) -> Option<String> {
        self.effective_path()
            .iter()
            .find(|schema| self.schema_visible(schema))
            .cloned()
    }
}

enum Outcome {
    Affected(u64),
    Rows(Vec<Row>),
}

#[async_trait]
impl SessionConnection for MemoryConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    async fn begin(&mut self) -> DbResult<()> {
        tokio::task::yield_now().await;
        self.check_usable()?;
        if self.txn.is_some() {
            return Err(DbError::other("there is already a transaction in progress"));
        }
        self.txn = Some(Txn {
            session_path_at_begin: self.session_path.clone(),
            ..Txn::default()
        });
        trace!(connection = self.id, "BEGIN");
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        tokio::task::yield_now().await;
        if self.closed {
            return Err(DbError::closed("connection is closed"));
        }
        self.end_transaction(true)
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::closed("connection is closed"));
        }
        self.end_transaction(false)
    }

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        self.check_usable()?;
        let session_path = self.session_path.clone();
        let txn = self
            .txn
            .as_mut()
            .ok_or_else(|| DbError::other("SAVEPOINT can only be used in transaction blocks"))?;
        txn.savepoints.push(Savepoint {
            name: name.to_string(),
            ops: txn.ops.len(),
            local_path: txn.local_path.clone(),
            session_path,
        });
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        if self.closed {
            return Err(DbError::closed("connection is closed"));
        }
        let catalog_db = self.db.clone();
        let txn = self
            .txn
            .as_mut()
            .ok_or_else(|| DbError::other("ROLLBACK TO SAVEPOINT can only be used in transaction blocks"))?;
        let Some(pos) = txn.savepoints.iter().rposition(|s| s.name == name) else {
            txn.aborted = true;
            return Err(DbError::other(format!("savepoint \"{}\" does not exist", name))
                .with_sqlstate("3B001"));
        };
        txn.savepoints.truncate(pos + 1);
        let savepoint = txn.savepoints[pos].clone();

        txn.ops.truncate(savepoint.ops);
        txn.overlay.clear();
        {
            let catalog = catalog_db.inner.catalog.lock();
            for op in &txn.ops {
                apply(&catalog, &mut txn.overlay, op)?;
            }
        }
        txn.local_path = savepoint.local_path;
        txn.aborted = false;
        self.session_path = savepoint.session_path;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.check_usable()?;
        let txn = self
            .txn
            .as_mut()
            .ok_or_else(|| DbError::other("RELEASE SAVEPOINT can only be used in transaction blocks"))?;
        match txn.savepoints.iter().rposition(|s| s.name == name) {
            Some(pos) => {
                txn.savepoints.truncate(pos);
                Ok(())
            }
            None => {
                txn.aborted = true;
                Err(DbError::other(format!("savepoint \"{}\" does not exist", name))
                    .with_sqlstate("3B001"))
            }
        }
    }

    async fn set_search_path(&mut self, path: &SearchPath, scope: AssertScope) -> DbResult<()> {
        tokio::task::yield_now().await;
        self.check_usable()?;
        if let Some(e) = self.db.take_fault(FaultPoint::DirectAssert) {
            return self.track(Err(e));
        }
        let path = path.schemas().iter().map(|s| s.as_str().to_string()).collect();
        self.set_path(path, scope);
        Ok(())
    }

    async fn reset_search_path(&mut self) -> DbResult<()> {
        tokio::task::yield_now().await;
        if self.closed {
            return Err(DbError::closed("connection is closed"));
        }
        if let Some(e) = self.db.take_fault(FaultPoint::Reset) {
            self.closed = true;
            return Err(e);
        }
        self.session_path = self.db.default_path();
        if let Some(txn) = self.txn.as_mut() {
            txn.local_path = None;
        }
        Ok(())
    }

    async fn call_assert_procedure(
        &mut self,
        schema: &SchemaName,
        procedure: &str,
        scope: AssertScope,
    ) -> DbResult<()> {
        tokio::task::yield_now().await;
        self.check_usable()?;
        if let Some(e) = self.db.take_fault(FaultPoint::AssertProcedure) {
            return self.track(Err(e));
        }
        let path = self.with_schema(schema.as_str(), |s| {
            s.ok_or_else(|| undefined_schema(schema.as_str()))?
                .procedures
                .get(procedure)
                .cloned()
                .ok_or_else(|| {
                    DbError::undefined(format!("procedure {}.{}() does not exist", schema, procedure))
                        .with_sqlstate("42883")
                })
        });
        let path = self.track(path)?;
        if self.db.take_fault(FaultPoint::SilentProcedure).is_some() {
            return Ok(());
        }
        self.set_path(path, scope);
        Ok(())
    }

    async fn search_path(&mut self) -> DbResult<Vec<String>> {
        self.check_usable()?;
        Ok(self.effective_path().to_vec())
    }

    async fn current_schema(&mut self) -> DbResult<Option<String>> {
        self.check_usable()?;
        Ok(self.current_schema_name())
    }

    async fn schema_exists(&mut self, schema: &SchemaName) -> DbResult<bool> {
        tokio::task::yield_now().await;
        self.check_usable()?;
        Ok(self.schema_visible(schema.as_str()))
    }

    async fn list_schemas(&mut self, prefix: &str) -> DbResult<Vec<String>> {
        self.check_usable()?;
        let mut names: BTreeSet<String> = self
            .db
            .inner
            .catalog
            .lock()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        if let Some(txn) = self.txn.as_ref() {
            for (name, data) in &txn.overlay {
                if data.is_some() && name.starts_with(prefix) {
                    names.insert(name.clone());
                } else if data.is_none() {
                    names.remove(name);
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn create_schema(&mut self, schema: &SchemaName) -> DbResult<()> {
        tokio::task::yield_now().await;
        self.check_usable()?;
        if let Some(e) = self.db.take_fault(FaultPoint::CreateSchema) {
            return self.track(Err(e));
        }
        let result = self.run(Op::CreateSchema(schema.as_str().to_string()));
        self.track(result).map(|_| ())
    }

    async fn create_object(
        &mut self,
        schema: &SchemaName,
        object: &SchemaObject,
        path: &SearchPath,
    ) -> DbResult<()> {
        tokio::task::yield_now().await;
        self.check_usable()?;
        let schema = schema.as_str().to_string();
        let op = match object {
            SchemaObject::Table { name, definition } => parse_columns(definition).map(|columns| {
                Op::CreateTable {
                    schema,
                    name: name.clone(),
                    columns,
                }
            }),
            SchemaObject::Routine { name, .. } => Ok(Op::CreateRoutine {
                schema,
                name: name.clone(),
            }),
            SchemaObject::AssertProcedure { name } => Ok(Op::CreateProcedure {
                schema,
                name: name.clone(),
                path: path.schemas().iter().map(|s| s.as_str().to_string()).collect(),
            }),
        };
        let result = op.and_then(|op| self.run(op));
        self.track(result).map(|_| ())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<u64> {
        tokio::task::yield_now().await;
        self.check_usable()?;
        let result = self.statement(sql, params).and_then(|outcome| match outcome {
            Outcome::Affected(n) => Ok(n),
            Outcome::Rows(rows) => Ok(rows.len() as u64),
        });
        self.track(result)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        tokio::task::yield_now().await;
        self.check_usable()?;
        let result = self.statement(sql, params).map(|outcome| match outcome {
            Outcome::Affected(_) => Vec::new(),
            Outcome::Rows(rows) => rows,
        });
        self.track(result)
    }
}

/// Connection manager for a [`MemoryDatabase`].
#[derive(Debug, Clone)]
pub struct MemoryManager {
    db: MemoryDatabase,
}

impl MemoryManager {
    /// Create a manager.
    pub fn new(db: MemoryDatabase) -> Self {
        Self { db }
    }

    /// The database.
    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }
}

#[async_trait]
impl ConnectionManager for MemoryManager {
    type Connection = MemoryConnection;

    async fn connect(&self) -> DbResult<MemoryConnection> {
        self.db.connect()
    }

    async fn recycle(&self, conn: &mut MemoryConnection) -> DbResult<()> {
        if conn.closed {
            return Err(DbError::closed("connection is closed"));
        }
        if conn.txn.is_some() || conn.session_path != self.db.default_path() {
            debug!(connection = conn.id, path = ?conn.session_path, "Recycle found session state; resetting");
            conn.txn = None;
            conn.session_path = self.db.default_path();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TableRef {
    schema: Option<String>,
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Param(usize),
    Literal(Value),
}

impl Expr {
    fn eval(self, params: &[Value]) -> DbResult<Value> {
        match self {
            Self::Literal(value) => Ok(value),
            Self::Param(n) => params.get(n - 1).cloned().ok_or_else(|| {
                DbError::other(format!("there is no parameter ${}", n)).with_sqlstate("42P02")
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Insert { table: TableRef, values: Vec<Expr> },
    SelectAll(TableRef),
    Count(TableRef),
    Delete(TableRef),
    CurrentSchema,
}

fn unsupported(sql: &str) -> DbError {
    DbError::unsupported(format!("statement not supported by the memory backend: {}", sql))
}

/// Strip a sequence of keywords, case-insensitively, allowing any
/// whitespace between them.
fn strip_keywords<'a>(mut s: &'a str, keywords: &str) -> Option<&'a str> {
    for word in keywords.split(' ') {
        s = s.trim_start();
        let head = s.get(..word.len())?;
        if !head.eq_ignore_ascii_case(word) {
            return None;
        }
        s = &s[word.len()..];
    }
    Some(s)
}

fn parse_statement(sql: &str) -> DbResult<Statement> {
    let text = sql.trim().trim_end_matches(';').trim();

    if let Some(rest) = strip_keywords(text, "select current_schema") {
        let rest = rest.trim();
        if rest.is_empty() || rest == "()" {
            return Ok(Statement::CurrentSchema);
        }
    }

    if let Some(rest) = strip_keywords(text, "insert into") {
        let (table, rest) = parse_table(rest).ok_or_else(|| unsupported(sql))?;
        let rest = strip_keywords(rest, "values").ok_or_else(|| unsupported(sql))?;
        let inner = rest
            .trim()
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(|| unsupported(sql))?;
        let values = split_top_level(inner)
            .into_iter()
            .map(|v| parse_expr(v.trim()).ok_or_else(|| unsupported(sql)))
            .collect::<DbResult<Vec<_>>>()?;
        return Ok(Statement::Insert { table, values });
    }

    let table_only = |rest: &str| -> DbResult<TableRef> {
        match parse_table(rest) {
            Some((table, tail)) if tail.trim().is_empty() => Ok(table),
            _ => Err(unsupported(sql)),
        }
    };

    if let Some(rest) = strip_keywords(text, "select * from") {
        return table_only(rest).map(Statement::SelectAll);
    }
    if let Some(rest) = strip_keywords(text, "select count(*) from") {
        return table_only(rest).map(Statement::Count);
    }
    if let Some(rest) = strip_keywords(text, "delete from") {
        return table_only(rest).map(Statement::Delete);
    }

    Err(unsupported(sql))
}

/// Parse `name`, `schema.name` or their quoted forms. Returns the rest.
fn parse_table(s: &str) -> Option<(TableRef, &str)> {
    let s = s.trim_start();
    let end = s
        .find(|c: char| c.is_whitespace() || c == '(')
        .unwrap_or(s.len());
    let (token, rest) = s.split_at(end);
    if token.is_empty() {
        return None;
    }

    let parts: Vec<String> = token.split('.').map(unquote_ident).collect();
    let table = match parts.as_slice() {
        [name] => TableRef {
            schema: None,
            name: name.clone(),
        },
        [schema, name] => TableRef {
            schema: Some(schema.clone()),
            name: name.clone(),
        },
        _ => return None,
    };
    Some((table, rest))
}

fn unquote_ident(part: &str) -> String {
    match part.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => part.to_ascii_lowercase(),
    }
}

fn parse_expr(s: &str) -> Option<Expr> {
    if let Some(n) = s.strip_prefix('$') {
        return n.parse().ok().filter(|n| *n > 0).map(Expr::Param);
    }
    if let Some(inner) = s.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        return Some(Expr::Literal(Value::Text(inner.replace("''", "'"))));
    }
    let value = match s.to_ascii_lowercase().as_str() {
        "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => match other.parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(other.parse().ok()?),
        },
    };
    Some(Expr::Literal(value))
}

/// Split on commas outside quotes and parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

const CONSTRAINT_KEYWORDS: &[&str] = &["primary", "unique", "constraint", "foreign", "check", "exclude"];

/// Column names of a table definition such as `id bigint primary key, title text`.
fn parse_columns(definition: &str) -> DbResult<Arc<[String]>> {
    let columns: Vec<String> = split_top_level(definition)
        .into_iter()
        .filter_map(|part| part.split_whitespace().next())
        .filter(|word| !CONSTRAINT_KEYWORDS.contains(&word.to_ascii_lowercase().as_str()))
        .map(unquote_ident)
        .collect();
    if columns.is_empty() {
        return Err(DbError::other(format!("table definition has no columns: {}", definition)));
    }
    Ok(Arc::from(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schema(name: &str) -> SchemaName {
        SchemaName::parse(name).unwrap()
    }

    fn tenant_db() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        for name in ["client_1", "client_2"] {
            db.create_schema(&schema(name));
            db.create_table(&schema(name), "listings", "id bigint primary key, title text")
                .unwrap();
        }
        db
    }

    #[test]
    fn test_parse_statements() {
        assert_eq!(
            parse_statement("SELECT count(*) FROM listings;").unwrap(),
            Statement::Count(TableRef {
                schema: None,
                name: "listings".into()
            })
        );
        assert_eq!(
            parse_statement("insert into \"client_1\".listings values ($1, 'a, b')").unwrap(),
            Statement::Insert {
                table: TableRef {
                    schema: Some("client_1".into()),
                    name: "listings".into()
                },
                values: vec![Expr::Param(1), Expr::Literal(Value::Text("a, b".into()))],
            }
        );
        assert_eq!(parse_statement("select current_schema()").unwrap(), Statement::CurrentSchema);
        assert!(parse_statement("UPDATE listings SET title = 'x'").is_err());
    }

    #[test]
    fn test_parse_columns() {
        let columns = parse_columns("id bigint primary key, title text, PRIMARY KEY (id)").unwrap();
        assert_eq!(&*columns, &["id".to_string(), "title".to_string()]);
    }

    #[tokio::test]
    async fn test_unqualified_names_follow_search_path() {
        let db = tenant_db();
        let mut conn = db.connect().unwrap();

        let path = SearchPath::tenant(schema("client_2"), schema("public"));
        conn.set_search_path(&path, AssertScope::Session).await.unwrap();
        conn.execute("INSERT INTO listings VALUES (1, 'Loft')", &[]).await.unwrap();

        assert_eq!(db.table_rows("client_2", "listings"), 1);
        assert_eq!(db.table_rows("client_1", "listings"), 0);
        assert_eq!(conn.current_schema().await.unwrap().as_deref(), Some("client_2"));
    }

    #[tokio::test]
    async fn test_transaction_local_path_ends_with_transaction() {
        let db = tenant_db();
        let mut conn = db.connect().unwrap();
        let path = SearchPath::tenant(schema("client_1"), schema("public"));

        conn.set_search_path(&path, AssertScope::Transaction).await.unwrap();
        assert_eq!(conn.search_path().await.unwrap(), vec!["public".to_string()]);

        conn.begin().await.unwrap();
        conn.set_search_path(&path, AssertScope::Transaction).await.unwrap();
        assert_eq!(conn.current_schema().await.unwrap().as_deref(), Some("client_1"));
        conn.commit().await.unwrap();
        assert_eq!(conn.current_schema().await.unwrap().as_deref(), Some("public"));
    }

    #[tokio::test]
    async fn test_uncommitted_rows_are_private() {
        let db = tenant_db();
        let mut writer = db.connect().unwrap();
        let mut reader = db.connect().unwrap();

        writer.begin().await.unwrap();
        writer
            .execute("INSERT INTO client_1.listings VALUES ($1, $2)", &[1.into(), "a".into()])
            .await
            .unwrap();
        let seen = writer.query("SELECT count(*) FROM client_1.listings", &[]).await.unwrap();
        assert_eq!(seen[0].try_get::<i64>("count").unwrap(), 1);
        let other = reader.query("SELECT count(*) FROM client_1.listings", &[]).await.unwrap();
        assert_eq!(other[0].try_get::<i64>("count").unwrap(), 0);

        writer.rollback().await.unwrap();
        assert_eq!(db.table_rows("client_1", "listings"), 0);
    }

    #[tokio::test]
    async fn test_error_aborts_until_savepoint_rollback() {
        let db = tenant_db();
        let mut conn = db.connect().unwrap();

        conn.begin().await.unwrap();
        conn.savepoint("s").await.unwrap();
        assert!(conn.execute("SELECT * FROM missing", &[]).await.is_err());
        assert!(conn.current_schema().await.is_err());

        conn.rollback_to_savepoint("s").await.unwrap();
        assert!(conn.current_schema().await.is_ok());
        conn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_schema_creation_conflicts_at_commit() {
        let db = MemoryDatabase::new();
        let mut a = db.connect().unwrap();
        let mut b = db.connect().unwrap();
        let name = schema("client_9");

        a.begin().await.unwrap();
        b.begin().await.unwrap();
        a.create_schema(&name).await.unwrap();
        b.create_schema(&name).await.unwrap();
        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(err.is_duplicate());
        assert!(!b.in_transaction());
    }

    #[tokio::test]
    async fn test_connection_counts() {
        let db = MemoryDatabase::new();
        let a = db.connect().unwrap();
        let b = db.connect().unwrap();
        assert_ne!(a.connection_id(), b.connection_id());
        assert_eq!(db.open_connections(), 2);
        drop(a);
        assert_eq!(db.open_connections(), 1);
        assert_eq!(db.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_fault_counts_down() {
        let db = MemoryDatabase::new();
        db.fail_times(FaultPoint::Connect, 1);
        assert!(db.connect().is_err());
        assert!(db.connect().is_ok());
    }
}
