//! Shared connection pool with fail-safe release.
//!
//! [`TenantPool`] wraps a `deadpool` managed pool. A checked-out
//! [`PooledConnection`] starts out untrusted: nothing is assumed about the
//! schema context it carries. It goes back to the free list only through
//! [`TenantPool::release`], which rolls back any open transaction, resets the
//! search path and verifies the reset. A connection that fails any of these
//! steps, or that is dropped without being released, is detached from the
//! pool and closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool::managed::{self, Metrics, Object, PoolError, RecycleError, RecycleResult};
use tracing::{debug, info, trace, warn};

use crate::config::{PoolSettings, TenancyConfig};
use crate::connection::{ConnectionManager, SessionConnection};
use crate::error::{DbError, DbResult};
use crate::tenant::{SchemaName, SearchPath};

/// Adapts a [`ConnectionManager`] to `deadpool`.
pub struct PoolManager<C> {
    inner: C,
}

impl<C: ConnectionManager> PoolManager<C> {
    /// Wrap a connection manager.
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    /// The wrapped manager.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: ConnectionManager> managed::Manager for PoolManager<C> {
    type Type = C::Connection;
    type Error = DbError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.inner.connect().await?;
        debug!(connection = conn.connection_id(), "Opened physical connection");
        Ok(conn)
    }

    async fn recycle(&self, conn: &mut Self::Type, _: &Metrics) -> RecycleResult<Self::Error> {
        if conn.is_closed() {
            return Err(RecycleError::Backend(DbError::closed("connection is closed")));
        }
        self.inner.recycle(conn).await.map_err(|e| {
            warn!(connection = conn.connection_id(), error = %e, "Recycle check failed");
            RecycleError::Backend(e)
        })
    }
}

type InnerPool<C> = managed::Pool<PoolManager<C>>;
type InnerObject<C> = Object<PoolManager<C>>;

/// What the pool knows about a checked-out connection's schema context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextState {
    /// Nothing is assumed; the context must be asserted before use.
    Untrusted,
    /// The search path was reset and verified.
    Neutral,
    /// A tenant context was asserted on this connection.
    Tenant(SchemaName),
}

/// How [`TenantPool::release`] disposed of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Reset, verified and returned to the free list.
    Returned,
    /// Detached from the pool and closed.
    Discarded,
}

/// A connection checked out of a [`TenantPool`].
///
/// Dropping it without [`TenantPool::release`] detaches the physical
/// connection from the pool, so a context that was never reset cannot be
/// handed to another caller.
pub struct PooledConnection<C: ConnectionManager> {
    object: Option<InnerObject<C>>,
    id: u64,
    context: ContextState,
    stats: Arc<AtomicPoolStats>,
}

impl<C: ConnectionManager> PooledConnection<C> {
    /// Identifier of the underlying physical connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The tracked schema context.
    pub fn context(&self) -> &ContextState {
        &self.context
    }

    /// The schema unqualified names resolve to on this connection.
    pub async fn current_schema(&mut self) -> DbResult<Option<String>> {
        self.raw()?.current_schema().await
    }

    /// The effective search path on this connection.
    pub async fn search_path(&mut self) -> DbResult<Vec<String>> {
        self.raw()?.search_path().await
    }

    pub(crate) fn raw(&mut self) -> DbResult<&mut C::Connection> {
        self.object
            .as_deref_mut()
            .ok_or_else(|| DbError::closed("connection already released"))
    }

    pub(crate) fn set_context(&mut self, context: ContextState) {
        self.context = context;
    }

    fn detach(&mut self) -> bool {
        match self.object.take() {
            Some(object) => {
                drop(Object::take(object));
                self.stats.record_discard();
                true
            }
            None => false,
        }
    }
}

impl<C: ConnectionManager> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("released", &self.object.is_none())
            .finish()
    }
}

impl<C: ConnectionManager> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.detach() {
            warn!(
                connection = self.id,
                context = ?self.context,
                "Connection dropped without release; detached from pool"
            );
        }
    }
}

/// The shared connection pool.
pub struct TenantPool<C: ConnectionManager> {
    inner: InnerPool<C>,
    shared: SchemaName,
    neutral: SearchPath,
    stats: Arc<AtomicPoolStats>,
}

impl<C: ConnectionManager> Clone for TenantPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
            neutral: self.neutral.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<C: ConnectionManager> TenantPool<C> {
    /// Create a pool.
    pub fn new(manager: C, settings: &PoolSettings, shared: SchemaName) -> DbResult<Self> {
        let inner = managed::Pool::builder(PoolManager::new(manager))
            .max_size(settings.max_connections)
            .wait_timeout(Some(settings.wait_timeout()))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| DbError::config(format!("failed to create pool: {}", e)))?;

        let stats = Arc::new(AtomicPoolStats::new());

        info!(
            max_connections = settings.max_connections,
            wait_timeout_ms = settings.wait_timeout_ms,
            shared_schema = %shared,
            "Tenant connection pool created"
        );

        Ok(Self {
            inner,
            neutral: SearchPath::neutral(shared.clone()),
            shared,
            stats,
        })
    }

    /// Create a pool from the loaded configuration.
    pub fn from_config(manager: C, config: &TenancyConfig) -> DbResult<Self> {
        let shared = config
            .tenancy
            .shared_schema()
            .map_err(|e| DbError::config(e.to_string()))?;
        Self::new(manager, &config.pool, shared)
    }

    /// Check out a connection, waiting up to the configured timeout.
    pub async fn checkout(&self) -> DbResult<PooledConnection<C>> {
        let started = Instant::now();
        let object = self.inner.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => {
                self.stats.record_timeout();
                DbError::timeout("timed out waiting for a pooled connection")
            }
            PoolError::Closed => DbError::closed("connection pool is closed"),
            PoolError::Backend(e) => e,
            other => DbError::pool(other.to_string()),
        })?;
        let waited = started.elapsed();
        self.stats.record_acquire(waited);

        let id = object.connection_id();
        trace!(connection = id, wait_ms = waited.as_millis() as u64, "Checked out connection");

        Ok(PooledConnection {
            object: Some(object),
            id,
            context: ContextState::Untrusted,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Reset a connection and return it to the pool.
    ///
    /// Any open transaction is rolled back, the search path is reset, and the
    /// reset is verified. If any step fails the connection is closed instead.
    pub async fn release(&self, mut conn: PooledConnection<C>) -> ReleaseOutcome {
        let id = conn.id;
        let result = match conn.object.as_deref_mut() {
            Some(raw) => self.reset(raw, &conn.context).await,
            None => return ReleaseOutcome::Discarded,
        };

        match result {
            Ok(()) => {
                conn.object = None;
                self.stats.record_release();
                trace!(connection = id, "Released connection to pool");
                ReleaseOutcome::Returned
            }
            Err(e) => {
                conn.detach();
                warn!(
                    connection = id,
                    context = ?conn.context,
                    error = %e,
                    "Reset failed on release; connection discarded"
                );
                ReleaseOutcome::Discarded
            }
        }
    }

    /// Close a connection without returning it to the pool.
    pub fn discard(&self, mut conn: PooledConnection<C>) {
        if conn.detach() {
            warn!(connection = conn.id, context = ?conn.context, "Connection discarded");
        }
    }

    async fn reset(&self, raw: &mut C::Connection, context: &ContextState) -> DbResult<()> {
        if raw.is_closed() {
            return Err(DbError::closed("connection is closed"));
        }
        if raw.in_transaction() {
            raw.rollback().await?;
        }
        raw.reset_search_path().await?;
        self.stats.record_reset();

        let current = raw.current_schema().await?;
        if current.as_deref() != Some(self.shared.as_str()) {
            return Err(DbError::mismatch(format!(
                "current schema after reset is {:?}, expected {}",
                current, self.shared
            )));
        }
        if let ContextState::Tenant(schema) = context {
            let path = raw.search_path().await?;
            if path.iter().any(|entry| schema == entry.as_str()) {
                return Err(DbError::mismatch(format!(
                    "search path {:?} still names {} after reset",
                    path, schema
                )));
            }
        }
        Ok(())
    }

    /// The shared schema.
    pub fn shared_schema(&self) -> &SchemaName {
        &self.shared
    }

    /// The neutral search path.
    pub fn neutral_path(&self) -> &SearchPath {
        &self.neutral
    }

    /// The connection manager.
    pub fn manager(&self) -> &C {
        self.inner.manager().inner()
    }

    /// Get the current pool status.
    pub fn status(&self) -> PoolStatus {
        let status = self.inner.status();
        PoolStatus {
            available: status.available as usize,
            size: status.size as usize,
            max_size: status.max_size as usize,
            waiting: status.waiting,
        }
    }

    /// Get a snapshot of the pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Check if the pool was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the pool. Idle connections are dropped; checked-out connections
    /// are closed when they come back.
    pub fn close(&self) {
        self.inner.close();
        info!("Tenant connection pool closed");
    }
}

/// Pool status information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of available (idle) connections.
    pub available: usize,
    /// Current total size of the pool.
    pub size: usize,
    /// Maximum size of the pool.
    pub max_size: usize,
    /// Number of tasks waiting for a connection.
    pub waiting: usize,
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total checkouts.
    pub connections_acquired: u64,
    /// Connections returned to the free list.
    pub connections_released: u64,
    /// Connections detached and closed.
    pub connections_discarded: u64,
    /// Search path resets issued.
    pub resets: u64,
    /// Checkouts that timed out.
    pub timeouts: u64,
    /// Total checkout wait time.
    pub total_wait_time_ms: u64,
    /// Longest checkout wait.
    pub max_wait_time_ms: u64,
}

impl PoolStats {
    /// Average checkout wait time.
    pub fn avg_wait_time(&self) -> Duration {
        if self.connections_acquired == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.total_wait_time_ms / self.connections_acquired)
        }
    }
}

/// Lock-free pool counters.
#[derive(Debug, Default)]
pub struct AtomicPoolStats {
    connections_acquired: AtomicU64,
    connections_released: AtomicU64,
    connections_discarded: AtomicU64,
    resets: AtomicU64,
    timeouts: AtomicU64,
    total_wait_time_ms: AtomicU64,
    max_wait_time_ms: AtomicU64,
}

impl AtomicPoolStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a checkout.
    pub fn record_acquire(&self, wait_time: Duration) {
        self.connections_acquired.fetch_add(1, Ordering::Relaxed);

        let wait_ms = wait_time.as_millis() as u64;
        self.total_wait_time_ms.fetch_add(wait_ms, Ordering::Relaxed);
        self.max_wait_time_ms.fetch_max(wait_ms, Ordering::Relaxed);
    }

    /// Record a connection returned to the free list.
    pub fn record_release(&self) {
        self.connections_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a detached connection.
    pub fn record_discard(&self) {
        self.connections_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a search path reset.
    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a checkout timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot.
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_acquired: self.connections_acquired.load(Ordering::Relaxed),
            connections_released: self.connections_released.load(Ordering::Relaxed),
            connections_discarded: self.connections_discarded.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            max_wait_time_ms: self.max_wait_time_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AssertScope;
    use crate::memory::{FaultPoint, MemoryDatabase, MemoryManager};

    fn public() -> SchemaName {
        SchemaName::parse("public").unwrap()
    }

    fn pool(db: &MemoryDatabase, max: usize) -> TenantPool<MemoryManager> {
        let settings = PoolSettings {
            max_connections: max,
            wait_timeout_ms: 200,
        };
        TenantPool::new(MemoryManager::new(db.clone()), &settings, public()).unwrap()
    }

    fn tenant_path(db: &MemoryDatabase, name: &str) -> SearchPath {
        let schema = SchemaName::parse(name).unwrap();
        db.create_schema(&schema);
        SearchPath::tenant(schema, public())
    }

    #[tokio::test]
    async fn test_release_returns_connection() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 1);

        let conn = pool.checkout().await.unwrap();
        assert_eq!(conn.context(), &ContextState::Untrusted);
        let id = conn.id();
        assert_eq!(pool.release(conn).await, ReleaseOutcome::Returned);

        let conn = pool.checkout().await.unwrap();
        assert_eq!(conn.id(), id);
        pool.release(conn).await;

        let stats = pool.stats();
        assert_eq!(stats.connections_acquired, 2);
        assert_eq!(stats.connections_released, 2);
        assert_eq!(stats.connections_discarded, 0);
    }

    #[tokio::test]
    async fn test_release_resets_session_path() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 1);
        let path = tenant_path(&db, "client_1");

        let mut conn = pool.checkout().await.unwrap();
        conn.raw()
            .unwrap()
            .set_search_path(&path, AssertScope::Session)
            .await
            .unwrap();
        conn.set_context(ContextState::Tenant(SchemaName::parse("client_1").unwrap()));
        assert_eq!(pool.release(conn).await, ReleaseOutcome::Returned);

        let mut conn = pool.checkout().await.unwrap();
        assert_eq!(conn.current_schema().await.unwrap().as_deref(), Some("public"));
        assert_eq!(conn.search_path().await.unwrap(), vec!["public".to_string()]);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_release_rolls_back_open_transaction() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 1);

        let mut conn = pool.checkout().await.unwrap();
        conn.raw().unwrap().begin().await.unwrap();
        assert_eq!(pool.release(conn).await, ReleaseOutcome::Returned);

        let mut conn = pool.checkout().await.unwrap();
        assert!(!conn.raw().unwrap().in_transaction());
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_failed_reset_discards() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 1);
        let path = tenant_path(&db, "client_2");

        let mut conn = pool.checkout().await.unwrap();
        let first = conn.id();
        conn.raw()
            .unwrap()
            .set_search_path(&path, AssertScope::Session)
            .await
            .unwrap();
        db.fail(FaultPoint::Reset);
        assert_eq!(pool.release(conn).await, ReleaseOutcome::Discarded);
        assert_eq!(pool.stats().connections_discarded, 1);

        let conn = pool.checkout().await.unwrap();
        assert_ne!(conn.id(), first);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_drop_detaches() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 1);

        let conn = pool.checkout().await.unwrap();
        let first = conn.id();
        drop(conn);

        assert_eq!(pool.stats().connections_discarded, 1);
        assert_eq!(db.open_connections(), 0);

        let conn = pool.checkout().await.unwrap();
        assert_ne!(conn.id(), first);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_checkout_timeout() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 1);

        let held = pool.checkout().await.unwrap();
        let err = pool.checkout().await.unwrap_err();
        assert_eq!(err.kind, crate::error::DbErrorKind::Timeout);
        assert_eq!(pool.stats().timeouts, 1);
        pool.release(held).await;
    }

    #[tokio::test]
    async fn test_status_and_close() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, 3);

        let conn = pool.checkout().await.unwrap();
        let status = pool.status();
        assert_eq!(status.max_size, 3);
        assert_eq!(status.size, 1);
        assert_eq!(status.available, 0);
        pool.release(conn).await;
        assert_eq!(pool.status().available, 1);

        pool.close();
        assert!(pool.is_closed());
        let err = pool.checkout().await.unwrap_err();
        assert_eq!(err.kind, crate::error::DbErrorKind::Closed);
    }
}
