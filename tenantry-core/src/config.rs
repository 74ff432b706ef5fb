//! Configuration for the tenancy layer (`tenantry.toml`).
//!
//! ```toml
//! [database]
//! url = "${DATABASE_URL}"
//!
//! [tenancy]
//! schema_prefix = "client_"
//! shared_schema = "public"
//! assert_scope = "transaction"
//!
//! [pool]
//! max_connections = 16
//! wait_timeout_ms = 5000
//!
//! [session]
//! ttl_secs = 3600
//! purge_interval_secs = 300
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::AssertScope;
use crate::tenant::{InvalidIdentifier, SchemaName};

/// Longest accepted session lifetime (ten years).
pub const MAX_SESSION_TTL_SECS: u64 = 315_360_000;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid TOML for this schema.
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// A schema name in the configuration is invalid.
    #[error("invalid schema name: {0}")]
    Identifier(#[from] InvalidIdentifier),

    /// A value is out of range.
    #[error("invalid value for {field}: {message}")]
    Value {
        /// Field name.
        field: &'static str,
        /// Problem description.
        message: String,
    },
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TenancyConfig {
    /// Database connection settings.
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Schema routing settings.
    #[serde(default)]
    pub tenancy: TenancySettings,

    /// Connection pool settings.
    #[serde(default)]
    pub pool: PoolSettings,

    /// Session settings.
    #[serde(default)]
    pub session: SessionSettings,
}

impl TenancyConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string, expanding `${VAR}` references.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a builder.
    pub fn builder() -> TenancyConfigBuilder {
        TenancyConfigBuilder::default()
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tenancy.shared_schema()?;
        // Prefix must itself start a valid identifier.
        SchemaName::parse(format!("{}x", self.tenancy.schema_prefix))?;
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Value {
                field: "pool.max_connections",
                message: "must be at least 1".into(),
            });
        }
        if self.tenancy.assert_procedure.is_empty()
            || !self
                .tenancy
                .assert_procedure
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ConfigError::Value {
                field: "tenancy.assert_procedure",
                message: format!("{:?} is not a plain identifier", self.tenancy.assert_procedure),
            });
        }
        if self.session.ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(ConfigError::Value {
                field: "session.ttl_secs",
                message: format!("must be at most {}", MAX_SESSION_TTL_SECS),
            });
        }
        if self.session.purge_interval_secs == Some(0) {
            return Err(ConfigError::Value {
                field: "session.purge_interval_secs",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Database connection settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSettings {
    /// Connection URL (supports `${ENV_VAR}` interpolation).
    pub url: Option<String>,
}

/// Schema routing settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TenancySettings {
    /// Prefix of tenant schema names.
    #[serde(default = "default_schema_prefix")]
    pub schema_prefix: String,

    /// Shared schema searched after the tenant schema.
    #[serde(default = "default_shared_schema")]
    pub shared_schema: String,

    /// Name of the per-tenant assertion procedure.
    #[serde(default = "default_assert_procedure")]
    pub assert_procedure: String,

    /// How long an asserted context lives.
    #[serde(default)]
    pub assert_scope: AssertScope,

    /// Retries for transient provisioning failures.
    #[serde(default = "default_provision_retries")]
    pub provision_retries: u32,

    /// Initial provisioning backoff; doubles per retry.
    #[serde(default = "default_provision_backoff_ms")]
    pub provision_backoff_ms: u64,

    /// Upper bound for one unit of work.
    #[serde(default)]
    pub work_timeout_ms: Option<u64>,
}

impl Default for TenancySettings {
    fn default() -> Self {
        Self {
            schema_prefix: default_schema_prefix(),
            shared_schema: default_shared_schema(),
            assert_procedure: default_assert_procedure(),
            assert_scope: AssertScope::default(),
            provision_retries: default_provision_retries(),
            provision_backoff_ms: default_provision_backoff_ms(),
            work_timeout_ms: None,
        }
    }
}

impl TenancySettings {
    /// The shared schema as a validated name.
    pub fn shared_schema(&self) -> Result<SchemaName, InvalidIdentifier> {
        SchemaName::parse(self.shared_schema.clone())
    }

    /// Initial provisioning backoff.
    pub fn provision_backoff(&self) -> Duration {
        Duration::from_millis(self.provision_backoff_ms)
    }

    /// Upper bound for one unit of work.
    pub fn work_timeout(&self) -> Option<Duration> {
        self.work_timeout_ms.map(Duration::from_millis)
    }
}

fn default_schema_prefix() -> String { "client_".to_string() }
fn default_shared_schema() -> String { "public".to_string() }
fn default_assert_procedure() -> String { "assert_environment".to_string() }
fn default_provision_retries() -> u32 { 3 }
fn default_provision_backoff_ms() -> u64 { 50 }

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of physical connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum time a checkout waits for a free connection.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl PoolSettings {
    /// Maximum checkout wait.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

fn default_max_connections() -> usize { 10 }
fn default_wait_timeout_ms() -> u64 { 30_000 }

/// Session settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    /// Session lifetime in seconds.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Sweep expired sessions this often. Unset leaves purging to the caller.
    #[serde(default)]
    pub purge_interval_secs: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            purge_interval_secs: None,
        }
    }
}

impl SessionSettings {
    /// Session lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Interval of the background purge, if enabled.
    pub fn purge_interval(&self) -> Option<Duration> {
        self.purge_interval_secs.map(Duration::from_secs)
    }
}

fn default_session_ttl_secs() -> u64 { 86_400 }

/// Builder for [`TenancyConfig`].
#[derive(Debug, Default)]
pub struct TenancyConfigBuilder {
    config: TenancyConfig,
}

impl TenancyConfigBuilder {
    /// Set the database URL.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database.url = Some(url.into());
        self
    }

    /// Set the tenant schema prefix.
    pub fn schema_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.tenancy.schema_prefix = prefix.into();
        self
    }

    /// Set the shared schema.
    pub fn shared_schema(mut self, schema: impl Into<String>) -> Self {
        self.config.tenancy.shared_schema = schema.into();
        self
    }

    /// Set the assertion procedure name.
    pub fn assert_procedure(mut self, name: impl Into<String>) -> Self {
        self.config.tenancy.assert_procedure = name.into();
        self
    }

    /// Set the assertion scope.
    pub fn assert_scope(mut self, scope: AssertScope) -> Self {
        self.config.tenancy.assert_scope = scope;
        self
    }

    /// Set provisioning retries and initial backoff.
    pub fn provision_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.config.tenancy.provision_retries = retries;
        self.config.tenancy.provision_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Bound each unit of work.
    pub fn work_timeout(mut self, timeout: Duration) -> Self {
        self.config.tenancy.work_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.pool.max_connections = n;
        self
    }

    /// Set the checkout wait timeout.
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the session lifetime.
    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.config.session.ttl_secs = ttl.as_secs();
        self
    }

    /// Purge expired sessions in the background at this interval.
    pub fn session_purge_interval(mut self, every: Duration) -> Self {
        self.config.session.purge_interval_secs = Some(every.as_secs());
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<TenancyConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Expand environment variables in the format `${VAR_NAME}`.
///
/// Unset variables are left as written.
fn expand_env_vars(content: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
