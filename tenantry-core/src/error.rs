//! Error types for tenant-isolated data access.
//!
//! Errors are split by the component that surfaces them:
//!
//! - [`DbError`]: a classified failure reported by a backend connection or the pool
//! - [`ProvisionError`]: schema provisioning failures, surfaced to registration
//! - [`RouterError`]: failures of a routed unit of work
//! - [`AuthError`]: session authentication failures
//! - [`SessionError`]: a unit of work routed through a session
//!
//! # Error Codes
//!
//! Every [`DbError`] carries a [`DbErrorKind`] with a stable code of the form
//! `T{number}`:
//! - 1xxx: database outcomes (transient, denied, duplicate, undefined, mismatch)
//! - 2xxx: pool outcomes (exhausted, timeout, closed)
//! - 3xxx: configuration and caller errors
//!
//! ```rust
//! use tenantry_core::{DbError, DbErrorKind};
//!
//! let err = DbError::transient("connection reset by peer");
//! assert_eq!(err.kind, DbErrorKind::Transient);
//! assert_eq!(err.kind.code(), "T1001");
//! assert!(err.is_transient());
//! ```

use std::fmt;
use thiserror::Error;

use crate::tenant::TenantId;

/// Result type for backend operations.
pub type DbResult<T> = Result<T, DbError>;

/// Classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    // Database outcomes (1xxx)
    /// Retryable failure: lost connection, serialization failure, deadlock (T1001).
    Transient = 1001,
    /// Insufficient privilege (T1002).
    Denied = 1002,
    /// Object already exists (T1003).
    DuplicateObject = 1003,
    /// Schema, table or routine does not exist (T1004).
    UndefinedObject = 1004,
    /// Schema context did not take effect as asserted (T1005).
    ContextMismatch = 1005,

    // Pool outcomes (2xxx)
    /// Connection pool failure (T2001).
    Pool = 2001,
    /// Timed out waiting for a connection or statement (T2002).
    Timeout = 2002,
    /// Pool or connection already closed (T2003).
    Closed = 2003,

    // Configuration and caller errors (3xxx)
    /// Invalid configuration (T3001).
    Config = 3001,
    /// Statement rejected by the statement guard (T3002).
    Forbidden = 3002,
    /// Statement not understood by the backend (T3003).
    Unsupported = 3003,

    /// Anything else (T9999).
    Other = 9999,
}

impl DbErrorKind {
    /// Get the error code string (e.g., "T1001").
    pub fn code(&self) -> String {
        format!("T{}", *self as u16)
    }

    /// Get a short description of the error kind.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "Transient database failure",
            Self::Denied => "Insufficient privilege",
            Self::DuplicateObject => "Object already exists",
            Self::UndefinedObject => "Object does not exist",
            Self::ContextMismatch => "Schema context mismatch",
            Self::Pool => "Connection pool failure",
            Self::Timeout => "Timed out",
            Self::Closed => "Closed",
            Self::Config => "Invalid configuration",
            Self::Forbidden => "Statement forbidden",
            Self::Unsupported => "Unsupported statement",
            Self::Other => "Database error",
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A classified backend failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    /// The error classification.
    pub kind: DbErrorKind,
    /// The error message.
    pub message: String,
    /// SQLSTATE reported by the server, when there was one.
    pub sqlstate: Option<String>,
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(f, "[{}] {} (SQLSTATE {})", self.kind.code(), self.message, state),
            None => write!(f, "[{}] {}", self.kind.code(), self.message),
        }
    }
}

impl DbError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sqlstate: None,
        }
    }

    /// Attach the SQLSTATE reported by the server.
    pub fn with_sqlstate(mut self, state: impl Into<String>) -> Self {
        self.sqlstate = Some(state.into());
        self
    }

    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Transient, message)
    }

    /// Create a privilege error.
    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Denied, message)
    }

    /// Create a duplicate-object error.
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::DuplicateObject, message)
    }

    /// Create an undefined-object error.
    pub fn undefined(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::UndefinedObject, message)
    }

    /// Create a context mismatch error.
    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::ContextMismatch, message)
    }

    /// Create a pool error.
    pub fn pool(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Pool, message)
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Timeout, message)
    }

    /// Create a closed error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Closed, message)
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Config, message)
    }

    /// Create a forbidden-statement error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Forbidden, message)
    }

    /// Create an unsupported-statement error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Unsupported, message)
    }

    /// Create an unclassified error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Other, message)
    }

    /// Check if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            DbErrorKind::Transient | DbErrorKind::Timeout | DbErrorKind::Pool
        )
    }

    /// Check if this is a privilege error.
    pub fn is_denied(&self) -> bool {
        self.kind == DbErrorKind::Denied
    }

    /// Check if this is a duplicate-object error.
    pub fn is_duplicate(&self) -> bool {
        self.kind == DbErrorKind::DuplicateObject
    }

    /// Check if this is an undefined-object error.
    pub fn is_undefined(&self) -> bool {
        self.kind == DbErrorKind::UndefinedObject
    }
}

/// Errors surfaced by the schema provisioner.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The schema already exists. Callers treat this as success.
    #[error("tenant schema {schema} already exists")]
    AlreadyExists {
        /// Schema name.
        schema: String,
    },

    /// The database role may not create schemas.
    #[error("insufficient privilege to provision {schema}: {source}")]
    Denied {
        /// Schema name.
        schema: String,
        /// Underlying failure.
        #[source]
        source: DbError,
    },

    /// Retryable failure; retries were exhausted.
    #[error("transient failure provisioning {schema} after {attempts} attempt(s): {source}")]
    Transient {
        /// Schema name.
        schema: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last underlying failure.
        #[source]
        source: DbError,
    },

    /// The schema is already registered to another tenant.
    #[error("tenant schema {schema} already belongs to tenant {owner}")]
    SchemaConflict {
        /// Schema name.
        schema: String,
        /// Tenant the schema is registered to.
        owner: TenantId,
    },

    /// The tenant identifier cannot be turned into a schema name.
    #[error("invalid tenant: {0}")]
    InvalidTenant(String),

    /// Any other database failure.
    #[error("provisioning failed: {0}")]
    Database(#[from] DbError),
}

impl ProvisionError {
    /// Check if this error means the schema is in place.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Check if this error may be retried by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Errors surfaced by a routed unit of work.
///
/// `E` is the error type of the caller's unit of work. The router never
/// inspects it.
#[derive(Error, Debug)]
pub enum RouterError<E> {
    /// The tenant was never provisioned. Nothing was checked out.
    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    /// The tenant was soft-retired. Nothing was checked out.
    #[error("tenant {0} is retired")]
    Retired(TenantId),

    /// Both the assertion procedure and the direct assertion failed.
    /// The unit of work never ran.
    #[error(
        "could not assert schema context for tenant {tenant}: procedure failed ({primary}); direct assertion failed ({fallback})"
    )]
    AssertFailed {
        /// Tenant being routed.
        tenant: TenantId,
        /// Failure of the assertion procedure.
        primary: DbError,
        /// Failure of the direct assertion.
        fallback: DbError,
    },

    /// The unit of work ran and returned an error. The connection was released.
    #[error("unit of work failed: {0}")]
    WorkFailed(#[source] E),

    /// The unit of work exceeded the configured limit. The connection was discarded.
    #[error("unit of work for tenant {tenant} timed out after {elapsed_ms}ms")]
    TimedOut {
        /// Tenant being routed.
        tenant: TenantId,
        /// Configured limit in milliseconds.
        elapsed_ms: u64,
    },

    /// Checkout, transaction control or commit failed.
    #[error("database error: {0}")]
    Database(#[source] DbError),
}

impl<E> RouterError<E> {
    /// Check if the tenant was unknown.
    pub fn is_unknown_tenant(&self) -> bool {
        matches!(self, Self::UnknownTenant(_))
    }

    /// Check if the schema assertion failed.
    pub fn is_assert_failed(&self) -> bool {
        matches!(self, Self::AssertFailed { .. })
    }

    /// Get the unit-of-work error, if that is what failed.
    pub fn into_work_error(self) -> Option<E> {
        match self {
            Self::WorkFailed(e) => Some(e),
            _ => None,
        }
    }

    /// Map the unit-of-work error type.
    pub fn map_work<F, O>(self, f: F) -> RouterError<O>
    where
        F: FnOnce(E) -> O,
    {
        match self {
            Self::UnknownTenant(id) => RouterError::UnknownTenant(id),
            Self::Retired(id) => RouterError::Retired(id),
            Self::AssertFailed {
                tenant,
                primary,
                fallback,
            } => RouterError::AssertFailed {
                tenant,
                primary,
                fallback,
            },
            Self::WorkFailed(e) => RouterError::WorkFailed(f(e)),
            Self::TimedOut { tenant, elapsed_ms } => RouterError::TimedOut { tenant, elapsed_ms },
            Self::Database(e) => RouterError::Database(e),
        }
    }
}

/// Errors surfaced by the session authenticator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The credentials were rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The principal has no tenant.
    #[error("principal {principal} has no tenant")]
    NoTenant {
        /// Principal identifier.
        principal: String,
    },

    /// No session exists for the token.
    #[error("session not found")]
    SessionNotFound,

    /// The session expired.
    #[error("session expired")]
    SessionExpired,

    /// The credential verifier or tenant directory failed.
    #[error("verifier error: {0}")]
    Verifier(String),
}

/// Errors surfaced by a unit of work routed through a session.
#[derive(Error, Debug)]
pub enum SessionError<E> {
    /// The session could not be validated. Nothing was checked out.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The routed unit of work failed.
    #[error(transparent)]
    Router(RouterError<E>),
}

impl<E> From<RouterError<E>> for SessionError<E> {
    fn from(err: RouterError<E>) -> Self {
        Self::Router(err)
    }
}
