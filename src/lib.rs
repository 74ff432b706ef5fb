//! # Tenantry
//!
//! Schema-per-tenant isolation over a shared PostgreSQL connection pool.
//!
//! Tenantry provides:
//! - Idempotent provisioning of one schema per tenant
//! - A shared pool whose connections are reset before every reuse
//! - Routing of a unit of work into exactly one tenant's schema, with a
//!   direct fallback when the tenant's assertion procedure fails
//! - Login sessions bound to a tenant
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tenantry::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TenancyConfig::from_file("tenantry.toml")?;
//!     let tenancy = tenantry::postgres::tenancy(config)?;
//!     tenancy.start().await?;
//!     tenancy.provisioner().provision(7).await?;
//!
//!     let orders = tenancy
//!         .router()
//!         .with_tenant(7, |db| {
//!             Box::pin(async move { db.query("SELECT * FROM orders", &[]).await })
//!         })
//!         .await?;
//!
//!     println!("{} orders", orders.len());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use tenantry_core::*;

/// PostgreSQL backend.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use tenantry_postgres::*;
}

/// Install a `tracing` subscriber that honours `RUST_LOG`.
///
/// Returns an error if a global subscriber is already set.
#[cfg(feature = "logging")]
#[cfg_attr(docsrs, doc(cfg(feature = "logging")))]
pub fn init_tracing(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}
