//! Registry of provisioned tenants.
//!
//! The registry is the router's source of truth for which tenant ids exist.
//! It is filled by the provisioner, either as schemas are created or from a
//! catalog scan at startup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::tenant::{SchemaName, Tenant, TenantId, TenantStatus};

/// Outcome of looking a tenant up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The tenant is provisioned and routable.
    Active(Tenant),
    /// The tenant was retired.
    Retired(Tenant),
    /// The tenant was never provisioned.
    Unknown,
}

/// Thread-safe set of known tenants.
#[derive(Debug, Clone, Default)]
pub struct TenantRegistry {
    tenants: Arc<RwLock<HashMap<TenantId, Tenant>>>,
}

impl TenantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tenant. Returns `false` if it was already present, in
    /// which case the stored entry is kept unchanged.
    pub fn register(&self, tenant: Tenant) -> bool {
        let mut tenants = self.tenants.write();
        if tenants.contains_key(&tenant.id) {
            return false;
        }
        tenants.insert(tenant.id.clone(), tenant);
        true
    }

    /// Look a tenant up.
    pub fn lookup(&self, id: &TenantId) -> Lookup {
        match self.tenants.read().get(id) {
            Some(tenant) if tenant.is_active() => Lookup::Active(tenant.clone()),
            Some(tenant) => Lookup::Retired(tenant.clone()),
            None => Lookup::Unknown,
        }
    }

    /// Get a routable tenant.
    pub fn resolve(&self, id: &TenantId) -> Option<Tenant> {
        match self.lookup(id) {
            Lookup::Active(tenant) => Some(tenant),
            _ => None,
        }
    }

    /// Mark a tenant retired. Returns `false` if it is unknown.
    pub fn retire(&self, id: &TenantId) -> bool {
        match self.tenants.write().get_mut(id) {
            Some(tenant) => {
                tenant.status = TenantStatus::Retired;
                true
            }
            None => false,
        }
    }

    /// The id registered for `schema`, whatever its status.
    pub fn owner_of(&self, schema: &SchemaName) -> Option<TenantId> {
        self.tenants
            .read()
            .values()
            .find(|tenant| &tenant.schema == schema)
            .map(|tenant| tenant.id.clone())
    }

    /// Check if a tenant is registered, whatever its status.
    pub fn contains(&self, id: &TenantId) -> bool {
        self.tenants.read().contains_key(id)
    }

    /// Get the number of registered tenants.
    pub fn len(&self) -> usize {
        self.tenants.read().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered tenants, sorted by id.
    pub fn tenants(&self) -> Vec<Tenant> {
        let mut tenants: Vec<_> = self.tenants.read().values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        tenants
    }
}
