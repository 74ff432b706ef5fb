//! # tenantry-postgres
//!
//! PostgreSQL backend for `tenantry-core`.
//!
//! This crate provides:
//! - [`PgManager`], a connection manager built on `deadpool-postgres`
//! - [`PgSessionConnection`], which sets the search path with
//!   `set_config` and creates a plpgsql assertion procedure in each tenant
//!   schema
//! - SQLSTATE classification into [`tenantry_core::DbError`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use tenantry_core::TenancyConfig;
//!
//! let config = TenancyConfig::from_file("tenantry.toml")?;
//! let tenancy = tenantry_postgres::tenancy(config)?;
//! tenancy.start().await?;
//! tenancy.provisioner().provision(7).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod types;

pub use config::{PgConfig, SslMode};
pub use connection::PgSessionConnection;
pub use error::{classify, PgError, PgResult};
pub use manager::PgManager;

use tenantry_core::{DbError, DbResult, Tenancy, TenancyConfig};

/// Build a [`Tenancy`] over PostgreSQL from configuration.
///
/// No connection is opened until the first checkout.
pub fn tenancy(config: TenancyConfig) -> DbResult<Tenancy<PgManager>> {
    let manager = PgManager::from_tenancy(&config).map_err(DbError::from)?;
    Tenancy::new(manager, config)
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::PgConfig;
    pub use crate::connection::PgSessionConnection;
    pub use crate::error::{PgError, PgResult};
    pub use crate::manager::PgManager;
}
