//! Connection manager for the shared pool.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, RecyclingMethod};
use tenantry_core::{ConnectionManager, DbResult, TenancyConfig};
use tokio_postgres::NoTls;
use tracing::debug;

use crate::config::PgConfig;
use crate::connection::PgSessionConnection;
use crate::error::{classify, PgResult};

/// Opens PostgreSQL connections for a [`tenantry_core::TenantPool`].
///
/// Connections are opened through `deadpool-postgres`, which gives each
/// one a prepared statement cache. Recycling cleans session state but keeps
/// prepared statements.
pub struct PgManager {
    inner: Manager,
    config: PgConfig,
}

impl std::fmt::Debug for PgManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgManager")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("default_schema", &self.config.default_schema)
            .finish()
    }
}

impl PgManager {
    /// Create a manager.
    pub fn new(config: PgConfig) -> Self {
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Clean,
        };
        let inner = Manager::from_config(config.to_pg_config(), NoTls, mgr_config);
        Self { inner, config }
    }

    /// Create a manager from a tenancy configuration.
    pub fn from_tenancy(config: &TenancyConfig) -> PgResult<Self> {
        Ok(Self::new(PgConfig::from_tenancy(config)?))
    }

    /// The connection configuration.
    pub fn config(&self) -> &PgConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionManager for PgManager {
    type Connection = PgSessionConnection;

    async fn connect(&self) -> DbResult<PgSessionConnection> {
        debug!(host = %self.config.host, database = %self.config.database, "Connecting to PostgreSQL");
        let client = deadpool::managed::Manager::create(&self.inner)
            .await
            .map_err(|e| classify(&e))?;
        PgSessionConnection::open(client).await
    }

    async fn recycle(&self, conn: &mut PgSessionConnection) -> DbResult<()> {
        conn.clean().await
    }
}
