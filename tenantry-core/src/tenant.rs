//! Tenant identity, schema names and search paths.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Longest accepted tenant id.
pub const MAX_TENANT_ID_LEN: usize = 48;

/// A unique identifier for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a new tenant ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<uuid::Uuid> for TenantId {
    fn from(u: uuid::Uuid) -> Self {
        Self::new(u.simple().to_string())
    }
}

impl From<i64> for TenantId {
    fn from(i: i64) -> Self {
        Self::new(i.to_string())
    }
}

impl From<i32> for TenantId {
    fn from(i: i32) -> Self {
        Self::new(i.to_string())
    }
}

impl From<u64> for TenantId {
    fn from(i: u64) -> Self {
        Self::new(i.to_string())
    }
}

/// An identifier that cannot be used as a schema name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid identifier {name:?}: {reason}")]
pub struct InvalidIdentifier {
    /// The rejected input.
    pub name: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// A validated schema name.
///
/// Only lowercase ASCII letters, digits and underscores are accepted, the
/// first character is not a digit, and the name fits in
/// [`MAX_IDENTIFIER_LEN`] bytes. Names are still quoted whenever they are
/// rendered into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaName(String);

impl SchemaName {
    /// Validate a schema name.
    pub fn parse(name: impl Into<String>) -> Result<Self, InvalidIdentifier> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Self(name))
    }

    /// Derive the schema name of a tenant: `<prefix><id>`.
    ///
    /// The id must already be in canonical form: lowercase ASCII letters,
    /// digits and `_`. Nothing is rewritten, so distinct ids always map to
    /// distinct schemas and the id can be recovered from the schema name.
    pub fn for_tenant(prefix: &str, id: &TenantId) -> Result<Self, InvalidIdentifier> {
        let raw = id.as_str();
        let reject = |reason| InvalidIdentifier {
            name: raw.to_string(),
            reason,
        };
        if raw.is_empty() {
            return Err(reject("empty tenant id"));
        }
        if raw.len() > MAX_TENANT_ID_LEN {
            return Err(reject("tenant id longer than 48 characters"));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(reject(
                "tenant ids may only contain lowercase letters, digits and '_'",
            ));
        }

        Self::parse(format!("{}{}", prefix, raw))
    }

    /// The `public` schema.
    pub fn public() -> Self {
        Self("public".to_string())
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render as a quoted SQL identifier.
    pub fn quoted(&self) -> String {
        quote_ident(&self.0)
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SchemaName {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SchemaName> for String {
    fn from(value: SchemaName) -> Self {
        value.0
    }
}

impl PartialEq<str> for SchemaName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for SchemaName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Check that `name` is a plain lowercase identifier: letters, digits and
/// `_`, not starting with a digit, at most [`MAX_IDENTIFIER_LEN`] bytes.
pub fn validate_identifier(name: &str) -> Result<(), InvalidIdentifier> {
    let reject = |reason| InvalidIdentifier {
        name: name.to_string(),
        reason,
    };

    let Some(first) = name.chars().next() else {
        return Err(reject("empty"));
    };
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(reject("longer than 63 bytes"));
    }
    if first.is_ascii_digit() {
        return Err(reject("starts with a digit"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(reject("only lowercase letters, digits and '_' are allowed"));
    }
    Ok(())
}

/// Quote an identifier for SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// An ordered schema search path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchPath(Vec<SchemaName>);

impl SearchPath {
    /// The neutral path: the shared schema alone.
    pub fn neutral(shared: SchemaName) -> Self {
        Self(vec![shared])
    }

    /// The path of a bound tenant: tenant schema first, then the shared schema.
    pub fn tenant(schema: SchemaName, shared: SchemaName) -> Self {
        Self(vec![schema, shared])
    }

    /// The schemas, in resolution order.
    pub fn schemas(&self) -> &[SchemaName] {
        &self.0
    }

    /// The first schema of the path.
    pub fn first(&self) -> Option<&SchemaName> {
        self.0.first()
    }

    /// Render as a `search_path` setting value, e.g. `"client_7", "public"`.
    pub fn to_setting(&self) -> String {
        self.0
            .iter()
            .map(SchemaName::quoted)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Check whether a reported path (as returned by `SHOW search_path`)
    /// names exactly these schemas in this order.
    pub fn matches(&self, reported: &[String]) -> bool {
        self.0.len() == reported.len()
            && self
                .0
                .iter()
                .zip(reported)
                .all(|(expected, actual)| expected.as_str() == actual)
    }
}

impl fmt::Display for SearchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_setting())
    }
}

/// Split a `search_path` setting into bare schema names.
pub fn parse_search_path(setting: &str) -> Vec<String> {
    setting
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            match entry
                .strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
            {
                Some(inner) => inner.replace("\"\"", "\""),
                None => entry.to_string(),
            }
        })
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Lifecycle status of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    /// Routable.
    #[default]
    Active,
    /// Soft-retired; its schema is kept but no longer routed to.
    Retired,
}

/// A provisioned tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// The tenant identifier.
    pub id: TenantId,
    /// The tenant's schema.
    pub schema: SchemaName,
    /// Lifecycle status.
    #[serde(default)]
    pub status: TenantStatus,
}

impl Tenant {
    /// Create an active tenant.
    pub fn new(id: TenantId, schema: SchemaName) -> Self {
        Self {
            id,
            schema,
            status: TenantStatus::Active,
        }
    }

    /// Derive a tenant from its id and the schema prefix.
    pub fn derive(prefix: &str, id: impl Into<TenantId>) -> Result<Self, InvalidIdentifier> {
        let id = id.into();
        let schema = SchemaName::for_tenant(prefix, &id)?;
        Ok(Self::new(id, schema))
    }

    /// Check if the tenant may be routed to.
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}
