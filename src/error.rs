//! Error types for ephys ingestion

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{EntityKey, EntityKind};

/// Errors that can occur while locating, decoding, or populating entities
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("No raw data file for subject {subject_id} at {session_time}")]
    NotFound {
        subject_id: String,
        session_time: String,
    },

    #[error("Multiple raw data files match subject {subject_id} at {session_time}: {matches:?}")]
    AmbiguousMatch {
        subject_id: String,
        session_time: String,
        matches: Vec<PathBuf>,
    },

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Ambiguous outcome: {set_columns} response columns set for trial {trial_index}")]
    AmbiguousOutcome {
        trial_index: usize,
        set_columns: usize,
    },

    #[error("Shape mismatch at {path}: {detail}")]
    ShapeMismatch { path: String, detail: String },

    #[error("Invalid trial: {0}")]
    InvalidTrial(String),

    #[error("Invalid channel index {0} (channels are numbered from 1)")]
    InvalidChannel(i64),

    #[error("Timestamps decrease at sample {index} of {path}")]
    NonMonotonicTimestamps { path: String, index: usize },

    #[error("Foreign key violation: {kind} {key} references missing {parent_kind} {parent_key}")]
    ForeignKeyViolation {
        kind: EntityKind,
        key: EntityKey,
        parent_kind: EntityKind,
        parent_key: EntityKey,
    },

    #[error("Duplicate key: {kind} {key}")]
    DuplicateKey { kind: EntityKind, key: EntityKey },

    #[error("Invalid container file: {0}")]
    Container(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Unsupported catalog schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// How a failure affects the surrounding batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No data exists for the key; nothing to ingest
    Unavailable,
    /// The raw data contradicts itself; the key is recorded as failed
    DataCondition,
    /// A referenced parent or reference row is missing
    ForeignKey,
    /// The key already exists; counted as skipped
    Duplicate,
    /// The catalog is unreachable; the batch aborts
    Fatal,
}

impl IngestError {
    /// Classify this error for the key-boundary propagation policy
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            IngestError::NotFound { .. } | IngestError::MissingField(_) => {
                FailureKind::Unavailable
            }
            IngestError::ForeignKeyViolation { .. } => FailureKind::ForeignKey,
            IngestError::DuplicateKey { .. } => FailureKind::Duplicate,
            IngestError::Storage(_) | IngestError::UnsupportedSchemaVersion { .. } => {
                FailureKind::Fatal
            }
            IngestError::AmbiguousMatch { .. }
            | IngestError::MalformedDescriptor(_)
            | IngestError::AmbiguousOutcome { .. }
            | IngestError::ShapeMismatch { .. }
            | IngestError::InvalidTrial(_)
            | IngestError::InvalidChannel(_)
            | IngestError::NonMonotonicTimestamps { .. }
            | IngestError::Container(_)
            | IngestError::Io(_)
            | IngestError::Json(_)
            | IngestError::Config(_) => FailureKind::DataCondition,
        }
    }

    /// Short machine-readable code used in reports and CLI output
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::NotFound { .. } => "NOT_FOUND",
            IngestError::AmbiguousMatch { .. } => "AMBIGUOUS_MATCH",
            IngestError::MissingField(_) => "MISSING_FIELD",
            IngestError::MalformedDescriptor(_) => "MALFORMED_DESCRIPTOR",
            IngestError::AmbiguousOutcome { .. } => "AMBIGUOUS_OUTCOME",
            IngestError::ShapeMismatch { .. } => "SHAPE_MISMATCH",
            IngestError::InvalidTrial(_) => "INVALID_TRIAL",
            IngestError::InvalidChannel(_) => "INVALID_CHANNEL",
            IngestError::NonMonotonicTimestamps { .. } => "NON_MONOTONIC_TIMESTAMPS",
            IngestError::ForeignKeyViolation { .. } => "FOREIGN_KEY_VIOLATION",
            IngestError::DuplicateKey { .. } => "DUPLICATE_KEY",
            IngestError::Container(_) => "CONTAINER_ERROR",
            IngestError::Io(_) => "IO_ERROR",
            IngestError::Json(_) => "JSON_ERROR",
            IngestError::Storage(_) => "STORAGE_ERROR",
            IngestError::UnsupportedSchemaVersion { .. } => "UNSUPPORTED_SCHEMA_VERSION",
            IngestError::Config(_) => "CONFIG_ERROR",
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.failure_kind() == FailureKind::Fatal
    }
}
