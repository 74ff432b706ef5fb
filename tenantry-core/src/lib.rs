//! # tenantry-core
//!
//! Schema-per-tenant data access over a shared connection pool.
//!
//! Every tenant owns a schema named `<prefix><id>` (by default `client_<id>`).
//! Connections are shared across tenants, and the schema a statement runs
//! against is selected by the connection's `search_path`, which is mutable
//! session state. This crate keeps that state correct:
//!
//! - [`SchemaProvisioner`] creates tenant schemas idempotently and registers
//!   them in the [`TenantRegistry`]
//! - [`TenantPool`] wraps a `deadpool` pool and resets every connection
//!   before it goes back to the free list, closing it if the reset fails
//! - [`SchemaRouter`] runs a unit of work inside one tenant's schema context
//!   and releases the connection on every exit path
//! - [`SessionAuthenticator`] binds login sessions to a tenant
//!
//! Backends implement [`ConnectionManager`] and [`SessionConnection`]. The
//! [`memory`] backend runs in-process; `tenantry-postgres` talks to a server.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tenantry_core::prelude::*;
//! use tenantry_core::memory::{MemoryDatabase, MemoryManager};
//!
//! let tenancy = Tenancy::new(MemoryManager::new(MemoryDatabase::new()), TenancyConfig::default())?;
//! tenancy.provisioner().provision(7).await?;
//!
//! let schema = tenancy.router().probe(7).await?;
//! assert_eq!(schema, "client_7");
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod guard;
pub mod memory;
pub mod pool;
pub mod provision;
pub mod registry;
pub mod router;
pub mod session;
pub mod tenancy;
pub mod tenant;
pub mod value;

pub use config::{
    ConfigError, DatabaseSettings, PoolSettings, SessionSettings, TenancyConfig,
    TenancyConfigBuilder, TenancySettings,
};
pub use connection::{AssertScope, ConnectionManager, SessionConnection};
pub use error::{
    AuthError, DbError, DbErrorKind, DbResult, ProvisionError, RouterError, SessionError,
};
pub use guard::StatementGuard;
pub use pool::{
    ContextState, PoolStats, PoolStatus, PooledConnection, ReleaseOutcome, TenantPool,
};
pub use provision::{ProvisionOutcome, SchemaObject, SchemaProvisioner, SchemaTemplate};
pub use registry::{Lookup, TenantRegistry};
pub use router::{AssertStage, BoxFuture, ContextFailure, RouteState, SchemaRouter, TenantHandle};
pub use session::{
    CredentialVerifier, Credentials, Principal, SessionAuthenticator, SessionHandle,
    StaticDirectory, TenantDirectory,
};
pub use tenancy::Tenancy;
pub use tenant::{InvalidIdentifier, SchemaName, SearchPath, Tenant, TenantId, TenantStatus};
pub use value::{FromValue, Row, Value};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::TenancyConfig;
    pub use crate::connection::{AssertScope, ConnectionManager, SessionConnection};
    pub use crate::error::{AuthError, DbError, DbResult, ProvisionError, RouterError};
    pub use crate::pool::TenantPool;
    pub use crate::provision::{ProvisionOutcome, SchemaProvisioner, SchemaTemplate};
    pub use crate::router::{BoxFuture, SchemaRouter, TenantHandle};
    pub use crate::session::{Credentials, SessionAuthenticator, SessionHandle};
    pub use crate::tenancy::Tenancy;
    pub use crate::tenant::{SchemaName, Tenant, TenantId};
    pub use crate::value::{Row, Value};
}
