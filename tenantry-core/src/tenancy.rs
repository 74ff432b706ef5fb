//! Wiring of the tenancy components from one configuration.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::TenancyConfig;
use crate::connection::ConnectionManager;
use crate::error::{DbError, DbResult};
use crate::pool::TenantPool;
use crate::provision::{SchemaObject, SchemaProvisioner, SchemaTemplate};
use crate::registry::TenantRegistry;
use crate::router::SchemaRouter;
use crate::session::{CredentialVerifier, SessionAuthenticator, TenantDirectory};
use crate::tenant::Tenant;

/// The pool, registry, provisioner and router of one database, built from a
/// [`TenancyConfig`].
pub struct Tenancy<C: ConnectionManager> {
    config: TenancyConfig,
    pool: TenantPool<C>,
    registry: TenantRegistry,
    provisioner: SchemaProvisioner<C>,
    router: SchemaRouter<C>,
}

impl<C: ConnectionManager> Clone for Tenancy<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            provisioner: self.provisioner.clone(),
            router: self.router.clone(),
        }
    }
}

impl<C: ConnectionManager> Tenancy<C> {
    /// Build with a template holding only the assertion procedure.
    pub fn new(manager: C, config: TenancyConfig) -> DbResult<Self> {
        let template = SchemaTemplate::new(&config.tenancy.assert_procedure)
            .map_err(|e| DbError::config(e.to_string()))?;
        Self::with_template(manager, config, template)
    }

    /// Build with a custom schema template.
    pub fn with_template(
        manager: C,
        config: TenancyConfig,
        template: SchemaTemplate,
    ) -> DbResult<Self> {
        config
            .validate()
            .map_err(|e| DbError::config(e.to_string()))?;

        let procedure = &config.tenancy.assert_procedure;
        let has_procedure = template.objects().iter().any(|object| {
            matches!(object, SchemaObject::AssertProcedure { name } if name == procedure)
        });
        if !has_procedure {
            return Err(DbError::config(format!(
                "schema template does not create the assertion procedure {}",
                procedure
            )));
        }

        let pool = TenantPool::from_config(manager, &config)?;
        let registry = TenantRegistry::new();
        let provisioner =
            SchemaProvisioner::new(pool.clone(), registry.clone(), template, &config.tenancy);
        let router = SchemaRouter::new(pool.clone(), registry.clone(), &config.tenancy);

        Ok(Self {
            config,
            pool,
            registry,
            provisioner,
            router,
        })
    }

    /// Register the tenant schemas already in the catalog.
    pub async fn start(&self) -> DbResult<Vec<Tenant>> {
        let tenants = self.provisioner.discover().await?;
        info!(
            tenants = tenants.len(),
            scope = ?self.config.tenancy.assert_scope,
            "Tenancy started"
        );
        Ok(tenants)
    }

    /// Create a session authenticator using the configured session lifetime.
    ///
    /// With `session.purge_interval_secs` set, a purge task is spawned on the
    /// current runtime. Outside a runtime no task is spawned and purging is
    /// left to the caller.
    pub fn authenticator(
        &self,
        verifier: Arc<dyn CredentialVerifier>,
        directory: Arc<dyn TenantDirectory>,
    ) -> SessionAuthenticator<C> {
        let authenticator = SessionAuthenticator::new(
            self.router.clone(),
            verifier,
            directory,
            self.config.session.ttl(),
        );
        if let Some(every) = self.config.session.purge_interval() {
            if tokio::runtime::Handle::try_current().is_ok() {
                authenticator.spawn_purger(every);
                debug!(interval = ?every, "Session purger started");
            } else {
                warn!("No tokio runtime; expired sessions must be purged by the caller");
            }
        }
        authenticator
    }

    /// The configuration.
    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    /// The shared pool.
    pub fn pool(&self) -> &TenantPool<C> {
        &self.pool
    }

    /// The tenant registry.
    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// The schema provisioner.
    pub fn provisioner(&self) -> &SchemaProvisioner<C> {
        &self.provisioner
    }

    /// The schema router.
    pub fn router(&self) -> &SchemaRouter<C> {
        &self.router
    }

    /// Close the pool.
    pub fn shutdown(&self) {
        self.pool.close();
    }
}
