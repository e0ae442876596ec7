//! Error types for all strata operations.

use std::io;
use thiserror::Error;

/// Top-level error type for strata operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No row matched the given identity (or the stored version differed
    /// from the expected one on a read-modify-delete path).
    #[error("not found: no {table} row matches the given identity")]
    NotFound { table: String },

    /// A `create` hit an already-existing identity.
    #[error("precondition failed: {table} identity already exists")]
    Precondition { table: String },

    /// The item does not conform to its Resource schema.
    #[error("validation failed for resource '{resource}': {}", errors.join("; "))]
    Validation {
        resource: String,
        errors: Vec<String>,
    },

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Statement/query construction errors. These are build-time errors: they
/// are raised before any backend round trip happens.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("unknown join alias '{alias}' on table '{table}'")]
    UnknownAlias { table: String, alias: String },

    #[error("identity key '{0}' is missing from the item")]
    MissingIdentityKey(String),

    #[error("identity keys may not be modified: '{0}'")]
    IdentityKeyWrite(String),

    #[error("value for '{column}' does not fit column type {kind:?}")]
    TypeMismatch {
        column: String,
        kind: crate::resource::FieldKind,
    },

    #[error("invalid table URI: {0}")]
    InvalidUri(String),

    #[error("table '{table}' declares aggregations but the backend does not support them")]
    AggregationUnsupported { table: String },
}

/// Backend transport and storage errors. These propagate unchanged apart
/// from serialization conflicts, which drive transaction retry.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("relational error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupted store file '{path}': {reason}")]
    CorruptedStore { path: String, reason: String },

    #[error("attribute store error: {0}")]
    Attribute(String),

    #[error("transaction retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
