//! PostgreSQL connection configuration.

use std::time::Duration;

use tenantry_core::{SchemaName, TenancyConfig};

use crate::error::{PgError, PgResult};

/// PostgreSQL connection configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Host.
    pub host: String,
    /// Port (default: 5432).
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Username.
    pub user: String,
    /// Password.
    pub password: Option<String>,
    /// SSL mode.
    pub ssl_mode: SslMode,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Statement timeout.
    pub statement_timeout: Option<Duration>,
    /// Application name (shown in pg_stat_activity).
    pub application_name: Option<String>,
    /// Session default search path: the shared schema.
    pub default_schema: SchemaName,
}

/// SSL mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Disable SSL.
    Disable,
    /// Prefer SSL but allow non-SSL.
    #[default]
    Prefer,
}

impl PgConfig {
    /// Create a new configuration from a database URL.
    pub fn from_url(url: &str) -> PgResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| PgError::config(format!("invalid database URL: {}", e)))?;

        if parsed.scheme() != "postgresql" && parsed.scheme() != "postgres" {
            return Err(PgError::config(format!(
                "invalid scheme: expected 'postgresql' or 'postgres', got '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| PgError::config("missing host in URL"))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(PgError::config("missing database name in URL"));
        }

        let user = if parsed.username().is_empty() {
            "postgres".to_string()
        } else {
            parsed.username().to_string()
        };

        let mut config = Self {
            host,
            port: parsed.port().unwrap_or(5432),
            database,
            user,
            password: parsed.password().map(String::from),
            ssl_mode: SslMode::Prefer,
            connect_timeout: Duration::from_secs(30),
            statement_timeout: None,
            application_name: None,
            default_schema: SchemaName::public(),
        };

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "sslmode" => {
                    config.ssl_mode = match value.as_ref() {
                        "disable" => SslMode::Disable,
                        "prefer" => SslMode::Prefer,
                        other => {
                            return Err(PgError::config(format!("unsupported sslmode: {}", other)));
                        }
                    };
                }
                "connect_timeout" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| PgError::config("invalid connect_timeout"))?;
                    config.connect_timeout = Duration::from_secs(secs);
                }
                "statement_timeout" => {
                    let ms: u64 = value
                        .parse()
                        .map_err(|_| PgError::config("invalid statement_timeout"))?;
                    config.statement_timeout = Some(Duration::from_millis(ms));
                }
                "application_name" => {
                    config.application_name = Some(value.into_owned());
                }
                other => {
                    return Err(PgError::config(format!("unknown URL parameter: {}", other)));
                }
            }
        }

        Ok(config)
    }

    /// Build from a tenancy configuration. The URL comes from
    /// `[database] url` and the session default schema from
    /// `[tenancy] shared_schema`.
    pub fn from_tenancy(config: &TenancyConfig) -> PgResult<Self> {
        let url = config
            .database
            .url
            .as_deref()
            .ok_or_else(|| PgError::config("database.url is not set"))?;
        let shared = config
            .tenancy
            .shared_schema()
            .map_err(|e| PgError::config(e.to_string()))?;
        Ok(Self::from_url(url)?.with_default_schema(shared))
    }

    /// Set the session default schema.
    pub fn with_default_schema(mut self, schema: SchemaName) -> Self {
        self.default_schema = schema;
        self
    }

    /// Convert to tokio-postgres config.
    ///
    /// The default schema and statement timeout are passed as startup
    /// options so that `SET ... TO DEFAULT` and `RESET ALL` return to them.
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.dbname(&self.database);
        config.user(&self.user);

        if let Some(ref password) = self.password {
            config.password(password);
        }

        if let Some(ref app_name) = self.application_name {
            config.application_name(app_name);
        }

        config.ssl_mode(match self.ssl_mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
        });
        config.connect_timeout(self.connect_timeout);
        config.options(&self.startup_options());

        config
    }

    fn startup_options(&self) -> String {
        let mut options = format!("-c search_path={}", self.default_schema.as_str());
        if let Some(timeout) = self.statement_timeout {
            options.push_str(&format!(" -c statement_timeout={}", timeout.as_millis()));
        }
        options
    }
}
