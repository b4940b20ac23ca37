use std::io;

use http::status::StatusCode;
use serde_json::Error as JsonError;
use sqlx::{error::ErrorKind as DatabaseErrorKind, Error as SqlxError};
use thiserror::Error;

use crate::{consistency::ConsistencyError, value::EntityId};

/// Raised by the SQLite trigger guarding the one-specialization-per-identity invariant.
pub(crate) const SPECIALIZATION_TRIGGER_MESSAGE: &str = "specialization conflict";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(
        "Could not uniquely identify type '{name}' among {root} and its descendants. \
         Candidates: [{}]",
        .candidates.join(", ")
    )]
    AmbiguousOrMissingType {
        name: String,
        root: String,
        candidates: Vec<String>,
    },
    #[error("Missing tree entry for mandatory relation '{field}' of {type_name}")]
    MissingTreeEntry { field: String, type_name: String },
    #[error(
        "Missing parameter '{field}' required by {type_name}. Available keys: [{}]",
        .available.join(", ")
    )]
    MissingParameter {
        field: String,
        type_name: String,
        available: Vec<String>,
    },
    #[error(transparent)]
    Consistency(Box<ConsistencyError>),
    #[error(
        "Identity {id} of {type_name} is claimed by more than one specialization: [{}]",
        .claimants.join(", ")
    )]
    SpecializationConflict {
        id: EntityId,
        type_name: String,
        claimants: Vec<String>,
    },
    #[error("Cannot coerce {value} into {kind} for field '{field}' of {type_name}")]
    Coercion {
        field: String,
        type_name: String,
        kind: String,
        value: String,
    },
    #[error("Unknown type: {0}")]
    UnknownType(String),
    #[error("{type_name} has no field '{field}'")]
    UnknownField { type_name: String, field: String },
    #[error("{0} has not been saved yet")]
    Unsaved(String),
    #[error("Type registry error: {0}")]
    Registry(String),
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl CatalogError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CatalogError::AmbiguousOrMissingType { .. } => StatusCode::BAD_REQUEST,
            CatalogError::MissingTreeEntry { .. } => StatusCode::BAD_REQUEST,
            CatalogError::MissingParameter { .. } => StatusCode::BAD_REQUEST,
            CatalogError::Consistency(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CatalogError::SpecializationConflict { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CatalogError::Coercion { .. } => StatusCode::BAD_REQUEST,
            CatalogError::UnknownType(_) => StatusCode::NOT_FOUND,
            CatalogError::UnknownField { .. } => StatusCode::BAD_REQUEST,
            CatalogError::Unsaved(_) => StatusCode::BAD_REQUEST,
            CatalogError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CatalogError::Integrity(_) => StatusCode::CONFLICT,
            CatalogError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CatalogError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CatalogError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The wrapped hook failure, if this is a consistency error.
    pub fn as_consistency(&self) -> Option<&ConsistencyError> {
        match self {
            CatalogError::Consistency(err) => Some(err),
            _ => None,
        }
    }

    /// Whether a concurrent writer most likely inserted the same row first.
    ///
    /// Callers should retry such a failure as a fetch.
    pub fn is_integrity(&self) -> bool {
        matches!(self, CatalogError::Integrity(_))
    }
}

impl From<ConsistencyError> for CatalogError {
    fn from(src: ConsistencyError) -> Self {
        CatalogError::Consistency(Box::new(src))
    }
}

impl From<SqlxError> for CatalogError {
    fn from(db_error: SqlxError) -> Self {
        if let Some(database_error) = db_error.as_database_error() {
            let is_unique = matches!(database_error.kind(), DatabaseErrorKind::UniqueViolation);
            if is_unique || database_error.message().contains(SPECIALIZATION_TRIGGER_MESSAGE) {
                return CatalogError::Integrity(database_error.message().to_string());
            }
        }
        CatalogError::Database(format!("{db_error}"))
    }
}

impl From<sqlx::migrate::MigrateError> for CatalogError {
    fn from(src: sqlx::migrate::MigrateError) -> Self {
        CatalogError::Database(format!("schema migration failed: {src}"))
    }
}

impl From<io::Error> for CatalogError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => CatalogError::Io(format!("not found: {x}")),
            _ => CatalogError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<toml::de::Error> for CatalogError {
    fn from(src: toml::de::Error) -> CatalogError {
        CatalogError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for CatalogError {
    fn from(src: toml::ser::Error) -> CatalogError {
        CatalogError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for CatalogError {
    fn from(src: JsonError) -> CatalogError {
        CatalogError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}
