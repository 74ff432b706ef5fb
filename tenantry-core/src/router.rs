//! Tenant-scoped units of work.
//!
//! [`SchemaRouter::with_tenant`] is the only way to run statements for a
//! tenant. It checks out a connection, asserts the tenant's schema context,
//! hands the caller a [`TenantHandle`], and releases the connection on every
//! exit path: success, error, panic, timeout and cancellation.
//!
//! # Assertion
//!
//! The context is asserted inside the unit of work's transaction, in two
//! steps. The primary step calls the tenant schema's assertion procedure
//! under a savepoint. If the call fails, or if the path it leaves behind is
//! not exactly `<tenant schema>, <shared schema>`, the savepoint is rolled
//! back and the path is set directly, once. Each step is confirmed by
//! reading back `current_schema()` and the search path. If both steps fail
//! the unit of work never runs.
//!
//! With [`AssertScope::Transaction`] the context ends at commit or rollback.
//! With [`AssertScope::Session`] it stays on the connection until release
//! resets it.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use crate::config::TenancySettings;
use crate::connection::{AssertScope, ConnectionManager, SessionConnection};
use crate::error::{DbError, DbResult, RouterError};
use crate::guard::StatementGuard;
use crate::pool::{ContextState, PooledConnection, TenantPool};
use crate::registry::{Lookup, TenantRegistry};
use crate::tenant::{SchemaName, SearchPath, Tenant, TenantId};
use crate::value::{Row, Value};

/// A boxed future, as returned by units of work.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const ASSERT_SAVEPOINT: &str = "tenantry_assert";

/// Routing state of a checked-out connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteState {
    /// Checked out; no context asserted.
    Unbound,
    /// Context assertion in progress.
    Asserting(SchemaName),
    /// Context asserted and confirmed.
    Bound(SchemaName),
    /// Returned to the pool or discarded.
    Released,
}

/// Which assertion step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertStage {
    /// The tenant schema's assertion procedure.
    Procedure,
    /// The direct `search_path` assertion.
    Direct,
}

impl fmt::Display for AssertStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Procedure => write!(f, "procedure"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// A failed context assertion. Only ever logged.
#[derive(Debug, Clone)]
pub struct ContextFailure {
    /// Tenant being routed.
    pub tenant: TenantId,
    /// Target schema.
    pub schema: SchemaName,
    /// Failed step.
    pub stage: AssertStage,
    /// Connection the assertion ran on.
    pub connection: u64,
    /// Failure text.
    pub error: String,
}

impl ContextFailure {
    fn emit(&self, fatal: bool) {
        if fatal {
            error!(
                tenant = %self.tenant,
                schema = %self.schema,
                stage = %self.stage,
                connection = self.connection,
                error = %self.error,
                "Schema context assertion failed"
            );
        } else {
            warn!(
                tenant = %self.tenant,
                schema = %self.schema,
                stage = %self.stage,
                connection = self.connection,
                error = %self.error,
                "Schema context assertion failed; falling back"
            );
        }
    }
}

/// Statement access to one tenant's schema.
///
/// Handed to units of work by [`SchemaRouter::with_tenant`]. Statements are
/// checked by the [`StatementGuard`] before they reach the connection, so a
/// unit of work cannot change the schema context or end the transaction it
/// runs in.
pub struct TenantHandle<C: ConnectionManager> {
    conn: PooledConnection<C>,
    tenant: Tenant,
    guard: StatementGuard,
    state: RouteState,
}

impl<C: ConnectionManager> TenantHandle<C> {
    fn new(conn: PooledConnection<C>, tenant: Tenant, guard: StatementGuard) -> Self {
        Self {
            conn,
            tenant,
            guard,
            state: RouteState::Unbound,
        }
    }

    /// The tenant this handle is bound to.
    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    /// Routing state.
    pub fn state(&self) -> &RouteState {
        &self.state
    }

    /// Identifier of the physical connection.
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<u64> {
        self.guard.check(sql)?;
        self.conn.raw()?.execute(sql, params).await
    }

    /// Execute a query and return all rows.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        self.guard.check(sql)?;
        self.conn.raw()?.query(sql, params).await
    }

    /// Execute a query and return the first row, failing if there is none.
    pub async fn query_one(&mut self, sql: &str, params: &[Value]) -> DbResult<Row> {
        self.query_opt(sql, params)
            .await?
            .ok_or_else(|| DbError::other("query returned no rows"))
    }

    /// Execute a query and return the first row, if any.
    pub async fn query_opt(&mut self, sql: &str, params: &[Value]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// The schema unqualified names resolve to.
    pub async fn current_schema(&mut self) -> DbResult<Option<String>> {
        self.conn.current_schema().await
    }

    fn transition(&mut self, state: RouteState) {
        trace!(
            tenant = %self.tenant.id,
            connection = self.conn.id(),
            from = ?self.state,
            to = ?state,
            "Route state transition"
        );
        self.state = state;
    }
}

enum BindError {
    Database(DbError),
    Assert { primary: DbError, fallback: DbError },
}

/// Runs units of work inside a tenant's schema context.
pub struct SchemaRouter<C: ConnectionManager> {
    pool: TenantPool<C>,
    registry: TenantRegistry,
    guard: StatementGuard,
    procedure: String,
    scope: AssertScope,
    work_timeout: Option<Duration>,
}

impl<C: ConnectionManager> Clone for SchemaRouter<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            guard: self.guard.clone(),
            procedure: self.procedure.clone(),
            scope: self.scope,
            work_timeout: self.work_timeout,
        }
    }
}

impl<C: ConnectionManager> SchemaRouter<C> {
    /// Create a router.
    pub fn new(pool: TenantPool<C>, registry: TenantRegistry, settings: &TenancySettings) -> Self {
        Self {
            pool,
            registry,
            guard: StatementGuard::new(settings.assert_procedure.clone()),
            procedure: settings.assert_procedure.clone(),
            scope: settings.assert_scope,
            work_timeout: settings.work_timeout(),
        }
    }

    /// The pool this router checks connections out of.
    pub fn pool(&self) -> &TenantPool<C> {
        &self.pool
    }

    /// The registry tenants are resolved against.
    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// The assertion scope.
    pub fn scope(&self) -> AssertScope {
        self.scope
    }

    /// Run `work` inside the tenant's schema context.
    ///
    /// `Ok` commits; `Err` rolls back and is returned as
    /// [`RouterError::WorkFailed`]. A panic rolls back, releases the
    /// connection, and resumes. If a work timeout is configured and
    /// exceeded, the connection is discarded rather than returned.
    ///
    /// ```rust,ignore
    /// let count = router
    ///     .with_tenant(7, |tx| Box::pin(async move {
    ///         let row = tx.query_one("SELECT count(*) FROM listings", &[]).await?;
    ///         row.try_get::<i64>("count")
    ///     }))
    ///     .await?;
    /// ```
    pub async fn with_tenant<R, E, F>(
        &self,
        id: impl Into<TenantId>,
        work: F,
    ) -> Result<R, RouterError<E>>
    where
        F: for<'h> FnOnce(&'h mut TenantHandle<C>) -> BoxFuture<'h, Result<R, E>> + Send,
        R: Send,
        E: Send,
    {
        let id = id.into();
        let tenant = match self.registry.lookup(&id) {
            Lookup::Active(tenant) => tenant,
            Lookup::Retired(_) => {
                debug!(tenant = %id, "Rejected unit of work for retired tenant");
                return Err(RouterError::Retired(id));
            }
            Lookup::Unknown => {
                debug!(tenant = %id, "Rejected unit of work for unknown tenant");
                return Err(RouterError::UnknownTenant(id));
            }
        };

        let conn = self.pool.checkout().await.map_err(RouterError::Database)?;
        let mut handle = TenantHandle::new(conn, tenant, self.guard.clone());

        if let Err(e) = self.bind(&mut handle).await {
            self.finish(handle).await;
            return Err(match e {
                BindError::Database(e) => RouterError::Database(e),
                BindError::Assert { primary, fallback } => RouterError::AssertFailed {
                    tenant: id,
                    primary,
                    fallback,
                },
            });
        }

        let outcome = {
            let fut = AssertUnwindSafe(work(&mut handle)).catch_unwind();
            match self.work_timeout {
                Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
                None => Some(fut.await),
            }
        };

        match outcome {
            Some(Ok(Ok(value))) => {
                let committed = match handle.conn.raw() {
                    Ok(raw) => raw.commit().await,
                    Err(e) => Err(e),
                };
                self.finish(handle).await;
                committed.map(|()| value).map_err(RouterError::Database)
            }
            Some(Ok(Err(e))) => {
                self.rollback(&mut handle).await;
                self.finish(handle).await;
                Err(RouterError::WorkFailed(e))
            }
            Some(Err(panic)) => {
                warn!(tenant = %id, connection = handle.conn.id(), "Unit of work panicked");
                self.rollback(&mut handle).await;
                self.finish(handle).await;
                std::panic::resume_unwind(panic)
            }
            None => {
                let limit = self.work_timeout.unwrap_or_default();
                warn!(
                    tenant = %id,
                    connection = handle.conn.id(),
                    elapsed_ms = limit.as_millis() as u64,
                    "Unit of work timed out; discarding connection"
                );
                handle.transition(RouteState::Released);
                self.pool.discard(handle.conn);
                Err(RouterError::TimedOut {
                    tenant: id,
                    elapsed_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    /// Bind to a tenant and return the schema the connection resolved to.
    pub async fn probe(&self, id: impl Into<TenantId>) -> Result<String, RouterError<DbError>> {
        self.with_tenant(id, |tx| {
            Box::pin(async move {
                tx.current_schema()
                    .await?
                    .ok_or_else(|| DbError::mismatch("no current schema"))
            })
        })
        .await
    }

    async fn bind(&self, handle: &mut TenantHandle<C>) -> Result<(), BindError> {
        let schema = handle.tenant.schema.clone();
        let path = SearchPath::tenant(schema.clone(), self.pool.shared_schema().clone());
        let connection = handle.conn.id();

        handle.transition(RouteState::Asserting(schema.clone()));
        handle.conn.set_context(ContextState::Tenant(schema.clone()));

        let raw = handle.conn.raw().map_err(BindError::Database)?;
        raw.begin().await.map_err(BindError::Database)?;
        raw.savepoint(ASSERT_SAVEPOINT)
            .await
            .map_err(BindError::Database)?;

        match assert_by_procedure(raw, &schema, &self.procedure, &path, self.scope).await {
            Ok(()) => {
                raw.release_savepoint(ASSERT_SAVEPOINT)
                    .await
                    .map_err(BindError::Database)?;
            }
            Err(primary) => {
                ContextFailure {
                    tenant: handle.tenant.id.clone(),
                    schema: schema.clone(),
                    stage: AssertStage::Procedure,
                    connection,
                    error: primary.to_string(),
                }
                .emit(false);

                raw.rollback_to_savepoint(ASSERT_SAVEPOINT)
                    .await
                    .map_err(BindError::Database)?;

                if let Err(fallback) = assert_directly(raw, &schema, &path, self.scope).await {
                    ContextFailure {
                        tenant: handle.tenant.id.clone(),
                        schema: schema.clone(),
                        stage: AssertStage::Direct,
                        connection,
                        error: fallback.to_string(),
                    }
                    .emit(true);
                    return Err(BindError::Assert { primary, fallback });
                }
                debug!(tenant = %handle.tenant.id, schema = %schema, "Direct assertion succeeded");
            }
        }

        handle.transition(RouteState::Bound(schema));
        Ok(())
    }

    async fn rollback(&self, handle: &mut TenantHandle<C>) {
        let id = handle.conn.id();
        if let Ok(raw) = handle.conn.raw() {
            if raw.in_transaction() {
                if let Err(e) = raw.rollback().await {
                    debug!(connection = id, error = %e, "Rollback failed; release will discard");
                }
            }
        }
    }

    async fn finish(&self, mut handle: TenantHandle<C>) {
        handle.transition(RouteState::Released);
        self.pool.release(handle.conn).await;
    }
}

async fn assert_by_procedure<S: SessionConnection + ?Sized>(
    raw: &mut S,
    schema: &SchemaName,
    procedure: &str,
    path: &SearchPath,
    scope: AssertScope,
) -> DbResult<()> {
    raw.call_assert_procedure(schema, procedure, scope).await?;
    confirm(raw, schema, path).await
}

async fn assert_directly<S: SessionConnection + ?Sized>(
    raw: &mut S,
    schema: &SchemaName,
    path: &SearchPath,
    scope: AssertScope,
) -> DbResult<()> {
    raw.set_search_path(path, scope).await?;
    confirm(raw, schema, path).await
}

async fn confirm<S: SessionConnection + ?Sized>(
    raw: &mut S,
    schema: &SchemaName,
    path: &SearchPath,
) -> DbResult<()> {
    let current = raw.current_schema().await?;
    if current.as_deref() != Some(schema.as_str()) {
        return Err(DbError::mismatch(format!(
            "current schema is {:?}, expected {}",
            current, schema
        )));
    }
    let reported = raw.search_path().await?;
    if !path.matches(&reported) {
        return Err(DbError::mismatch(format!(
            "search path is {:?}, expected {}",
            reported, path
        )));
    }
    Ok(())
}
