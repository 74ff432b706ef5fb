//! Tenant schema provisioning.
//!
//! Provisioning creates `<prefix><id>` and every object of a
//! [`SchemaTemplate`] in one transaction, so a tenant schema either exists
//! complete or not at all. All DDL is schema-qualified; provisioning never
//! changes the connection's search path.
//!
//! Provisioning is idempotent. A schema that is already in the catalog is
//! reported as [`ProvisionOutcome::AlreadyProvisioned`], including when a
//! concurrent provisioner wins the race between the catalog check and the
//! commit.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::TenancySettings;
use crate::connection::{ConnectionManager, SessionConnection};
use crate::error::{DbError, DbResult, ProvisionError};
use crate::pool::{PooledConnection, TenantPool};
use crate::registry::TenantRegistry;
use crate::tenant::{validate_identifier, InvalidIdentifier, SchemaName, SearchPath, Tenant, TenantId};

/// An object created inside every tenant schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaObject {
    /// `CREATE TABLE "<schema>"."<name>" (<definition>)`.
    Table {
        /// Table name.
        name: String,
        /// Column and constraint list.
        definition: String,
    },
    /// A routine created from a full `CREATE FUNCTION`/`CREATE PROCEDURE`
    /// statement. `{schema}` in the text is replaced by the quoted schema.
    Routine {
        /// Routine name.
        name: String,
        /// Statement text.
        definition: String,
    },
    /// The procedure that installs the tenant's search path. The backend
    /// generates its body.
    AssertProcedure {
        /// Procedure name.
        name: String,
    },
}

impl SchemaObject {
    /// The object name.
    pub fn name(&self) -> &str {
        match self {
            Self::Table { name, .. } | Self::Routine { name, .. } | Self::AssertProcedure { name } => {
                name
            }
        }
    }

    /// Replace `{schema}` in a routine definition.
    pub fn render_definition(definition: &str, schema: &SchemaName) -> String {
        definition.replace("{schema}", &schema.quoted())
    }
}

/// The set of objects created in each tenant schema.
///
/// A template always contains the assertion procedure the router calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTemplate {
    objects: Vec<SchemaObject>,
}

impl SchemaTemplate {
    /// Create a template holding only the assertion procedure.
    pub fn new(assert_procedure: &str) -> Result<Self, InvalidIdentifier> {
        validate_identifier(assert_procedure)?;
        Ok(Self {
            objects: vec![SchemaObject::AssertProcedure {
                name: assert_procedure.to_string(),
            }],
        })
    }

    /// Add a table.
    pub fn table(
        mut self,
        name: &str,
        definition: impl Into<String>,
    ) -> Result<Self, InvalidIdentifier> {
        validate_identifier(name)?;
        self.objects.push(SchemaObject::Table {
            name: name.to_string(),
            definition: definition.into(),
        });
        Ok(self)
    }

    /// Add a routine.
    pub fn routine(
        mut self,
        name: &str,
        definition: impl Into<String>,
    ) -> Result<Self, InvalidIdentifier> {
        validate_identifier(name)?;
        self.objects.push(SchemaObject::Routine {
            name: name.to_string(),
            definition: definition.into(),
        });
        Ok(self)
    }

    /// The objects, in creation order.
    pub fn objects(&self) -> &[SchemaObject] {
        &self.objects
    }
}

/// Successful provisioning outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The schema was created by this call.
    Created,
    /// The schema was already in place.
    AlreadyProvisioned,
}

/// Creates tenant schemas and registers tenants.
pub struct SchemaProvisioner<C: ConnectionManager> {
    pool: TenantPool<C>,
    registry: TenantRegistry,
    template: Arc<SchemaTemplate>,
    prefix: String,
    retries: u32,
    backoff: Duration,
}

impl<C: ConnectionManager> Clone for SchemaProvisioner<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            template: Arc::clone(&self.template),
            prefix: self.prefix.clone(),
            retries: self.retries,
            backoff: self.backoff,
        }
    }
}

impl<C: ConnectionManager> SchemaProvisioner<C> {
    /// Create a provisioner.
    pub fn new(
        pool: TenantPool<C>,
        registry: TenantRegistry,
        template: SchemaTemplate,
        settings: &TenancySettings,
    ) -> Self {
        Self {
            pool,
            registry,
            template: Arc::new(template),
            prefix: settings.schema_prefix.clone(),
            retries: settings.provision_retries,
            backoff: settings.provision_backoff(),
        }
    }

    /// The template applied to new schemas.
    pub fn template(&self) -> &SchemaTemplate {
        &self.template
    }

    /// Provision a tenant, treating an existing schema as success.
    pub async fn provision(
        &self,
        id: impl Into<TenantId>,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        match self.try_provision(id).await {
            Ok(()) => Ok(ProvisionOutcome::Created),
            Err(ProvisionError::AlreadyExists { .. }) => Ok(ProvisionOutcome::AlreadyProvisioned),
            Err(e) => Err(e),
        }
    }

    /// Provision a tenant, reporting an existing schema as
    /// [`ProvisionError::AlreadyExists`].
    pub async fn try_provision(&self, id: impl Into<TenantId>) -> Result<(), ProvisionError> {
        let tenant = Tenant::derive(&self.prefix, id)
            .map_err(|e| ProvisionError::InvalidTenant(e.to_string()))?;
        let schema = tenant.schema.to_string();

        if let Some(owner) = self
            .registry
            .owner_of(&tenant.schema)
            .filter(|owner| *owner != tenant.id)
        {
            warn!(tenant = %tenant.id, schema = %schema, owner = %owner, "Schema belongs to another tenant");
            return Err(ProvisionError::SchemaConflict { schema, owner });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&tenant).await {
                Ok(true) => {
                    self.registry.register(tenant.clone());
                    info!(tenant = %tenant.id, schema = %schema, "Tenant schema provisioned");
                    return Ok(());
                }
                Ok(false) => {
                    self.registry.register(tenant.clone());
                    debug!(tenant = %tenant.id, schema = %schema, "Tenant schema already exists");
                    return Err(ProvisionError::AlreadyExists { schema });
                }
                Err(e) if e.is_transient() && attempt <= self.retries => {
                    let delay = self.backoff.saturating_mul(1 << (attempt - 1).min(16));
                    warn!(
                        tenant = %tenant.id,
                        schema = %schema,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient provisioning failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(ProvisionError::Transient {
                        schema,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) if e.is_denied() => {
                    return Err(ProvisionError::Denied { schema, source: e });
                }
                Err(e) => return Err(ProvisionError::Database(e)),
            }
        }
    }

    /// One provisioning attempt. Returns `true` if the schema was created.
    async fn attempt(&self, tenant: &Tenant) -> DbResult<bool> {
        let mut conn = self.pool.checkout().await?;
        let result = self.create(&mut conn, tenant).await;
        self.pool.release(conn).await;
        result
    }

    async fn create(&self, conn: &mut PooledConnection<C>, tenant: &Tenant) -> DbResult<bool> {
        let raw = conn.raw()?;
        if raw.schema_exists(&tenant.schema).await? {
            return Ok(false);
        }

        let path = SearchPath::tenant(tenant.schema.clone(), self.pool.shared_schema().clone());

        raw.begin().await?;
        let result = create_objects(raw, &tenant.schema, &self.template, &path).await;
        let Err(e) = result else {
            return Ok(true);
        };

        if raw.in_transaction() {
            if let Err(rollback) = raw.rollback().await {
                debug!(schema = %tenant.schema, error = %rollback, "Rollback after failed provisioning failed");
            }
        }

        if e.is_duplicate() {
            if raw.schema_exists(&tenant.schema).await? {
                return Ok(false);
            }
            return Err(DbError::transient(format!(
                "concurrent provisioning of {} did not complete: {}",
                tenant.schema, e.message
            )));
        }
        Err(e)
    }

    /// Scan the catalog for tenant schemas and register them.
    ///
    /// The tenant id of a discovered schema is the schema name without the
    /// prefix.
    pub async fn discover(&self) -> DbResult<Vec<Tenant>> {
        let mut conn = self.pool.checkout().await?;
        let listed = match conn.raw() {
            Ok(raw) => raw.list_schemas(&self.prefix).await,
            Err(e) => Err(e),
        };
        self.pool.release(conn).await;

        let mut tenants = Vec::new();
        for name in listed? {
            let Some(id) = name.strip_prefix(&self.prefix).filter(|id| !id.is_empty()) else {
                continue;
            };
            let schema = match SchemaName::parse(name.clone()) {
                Ok(schema) => schema,
                Err(e) => {
                    warn!(schema = %name, error = %e, "Skipping schema with invalid name");
                    continue;
                }
            };
            let tenant = Tenant::new(TenantId::new(id), schema);
            self.registry.register(tenant.clone());
            tenants.push(tenant);
        }

        info!(count = tenants.len(), prefix = %self.prefix, "Discovered tenant schemas");
        Ok(tenants)
    }

    /// Soft-retire a tenant. Its schema is kept; the router stops routing to
    /// it. Returns `false` if the tenant is unknown.
    pub fn retire(&self, id: &TenantId) -> bool {
        let retired = self.registry.retire(id);
        if retired {
            info!(tenant = %id, "Tenant retired");
        }
        retired
    }
}

async fn create_objects<S: SessionConnection + ?Sized>(
    raw: &mut S,
    schema: &SchemaName,
    template: &SchemaTemplate,
    path: &SearchPath,
) -> DbResult<()> {
    raw.create_schema(schema).await?;
    for object in template.objects() {
        raw.create_object(schema, object, path).await?;
    }
    raw.commit().await
}
