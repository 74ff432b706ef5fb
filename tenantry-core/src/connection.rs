//! Backend connection traits.
//!
//! A backend supplies two things: a [`ConnectionManager`] that opens and
//! recycles physical connections, and a [`SessionConnection`] for each of
//! them. Session state changes (`search_path`, transactions) are typed
//! operations here rather than SQL text, so the backend decides the exact
//! statements and the rest of the crate never formats them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DbResult;
use crate::provision::SchemaObject;
use crate::tenant::{SchemaName, SearchPath};
use crate::value::{Row, Value};

/// How long an asserted schema context lives on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertScope {
    /// The context is local to an explicit transaction and disappears at
    /// commit or rollback.
    #[default]
    Transaction,
    /// The context is set on the connection session and must be reset
    /// before the connection is reused.
    Session,
}

impl AssertScope {
    /// Whether the context is transaction-local.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Transaction)
    }
}

/// A physical database connection with session state.
#[async_trait]
pub trait SessionConnection: Send {
    /// Identifier of the physical connection, stable for its lifetime.
    fn connection_id(&self) -> u64;

    /// Whether the connection can no longer be used.
    fn is_closed(&self) -> bool;

    /// Whether an explicit transaction is open.
    fn in_transaction(&self) -> bool;

    /// Open a transaction.
    async fn begin(&mut self) -> DbResult<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> DbResult<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> DbResult<()>;

    /// Create a savepoint inside the open transaction.
    async fn savepoint(&mut self, name: &str) -> DbResult<()>;

    /// Roll back to a savepoint, clearing an aborted transaction state.
    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()>;

    /// Release a savepoint.
    async fn release_savepoint(&mut self, name: &str) -> DbResult<()>;

    /// Set the schema search path directly.
    async fn set_search_path(&mut self, path: &SearchPath, scope: AssertScope) -> DbResult<()>;

    /// Return the search path to the server default.
    async fn reset_search_path(&mut self) -> DbResult<()>;

    /// Call a tenant schema's assertion procedure.
    async fn call_assert_procedure(
        &mut self,
        schema: &SchemaName,
        procedure: &str,
        scope: AssertScope,
    ) -> DbResult<()>;

    /// The effective search path, as bare schema names.
    async fn search_path(&mut self) -> DbResult<Vec<String>>;

    /// The schema unqualified names currently resolve to first.
    async fn current_schema(&mut self) -> DbResult<Option<String>>;

    /// Catalog lookup for a schema.
    async fn schema_exists(&mut self, schema: &SchemaName) -> DbResult<bool>;

    /// Schemas whose name starts with `prefix`, sorted.
    async fn list_schemas(&mut self, prefix: &str) -> DbResult<Vec<String>>;

    /// Create an empty schema.
    async fn create_schema(&mut self, schema: &SchemaName) -> DbResult<()>;

    /// Create one object inside a schema. `path` is the search path the
    /// schema's assertion procedure must install.
    async fn create_object(
        &mut self,
        schema: &SchemaName,
        object: &SchemaObject,
        path: &SearchPath,
    ) -> DbResult<()>;

    /// Execute a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<u64>;

    /// Execute a query and return all rows.
    async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>>;
}

/// Opens and recycles physical connections for a pool.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    /// The connection type.
    type Connection: SessionConnection + 'static;

    /// Open a new physical connection.
    async fn connect(&self) -> DbResult<Self::Connection>;

    /// Check a connection before it is handed out again. An error closes it.
    async fn recycle(&self, conn: &mut Self::Connection) -> DbResult<()>;
}
