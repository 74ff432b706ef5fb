//! Error types for the PostgreSQL backend.
//!
//! Driver errors are classified into [`DbError`] by SQLSTATE so the core
//! crate can decide what to retry and what to surface.

use thiserror::Error;
use tenantry_core::{DbError, DbErrorKind};

/// Result type for PostgreSQL setup operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors raised while configuring or connecting the backend.
#[derive(Error, Debug)]
pub enum PgError {
    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Type conversion error.
    #[error("type conversion error: {0}")]
    TypeConversion(String),
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a type conversion error.
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion(message.into())
    }
}

impl From<PgError> for DbError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::Postgres(e) => classify(&e),
            PgError::Config(msg) => DbError::config(msg),
            PgError::TypeConversion(msg) => DbError::unsupported(msg),
        }
    }
}

/// Map a SQLSTATE code to an error kind.
pub fn kind_for_sqlstate(code: &str) -> DbErrorKind {
    match code {
        // duplicate_schema, duplicate_table, duplicate_object,
        // duplicate_function, unique_violation
        "42P06" | "42P07" | "42710" | "42723" | "23505" => DbErrorKind::DuplicateObject,
        // insufficient_privilege
        "42501" => DbErrorKind::Denied,
        // invalid_schema_name, undefined_function, undefined_table
        "3F000" | "42883" | "42P01" => DbErrorKind::UndefinedObject,
        // serialization_failure, deadlock_detected
        "40001" | "40P01" => DbErrorKind::Transient,
        // connection exceptions, admin/crash shutdown, cannot_connect_now
        code if code.starts_with("08") || code.starts_with("57P0") => DbErrorKind::Transient,
        // too_many_connections
        "53300" => DbErrorKind::Transient,
        // query_canceled
        "57014" => DbErrorKind::Timeout,
        _ => DbErrorKind::Other,
    }
}

/// Classify a driver error.
pub fn classify(err: &tokio_postgres::Error) -> DbError {
    let message = match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    };

    if let Some(state) = err.code() {
        let code = state.code();
        return DbError::new(kind_for_sqlstate(code), message).with_sqlstate(code);
    }

    if err.is_closed() {
        return DbError::transient(message);
    }

    let io = std::error::Error::source(err)
        .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
    if io {
        DbError::transient(message)
    } else {
        DbError::other(message)
    }
}
