// 🚨 Error Taxonomy
// Fatal errors abort a run before any output exists; recoverable errors become issues

use thiserror::Error;

// ============================================================================
// FATAL ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Pseudonymous ids without a salt are a silent privacy regression
    #[error("salt is missing: refusing to derive pseudonymous identifiers")]
    SaltMissing,

    #[error("schema mismatch: {catalog} entry {entry_id} references unknown '{field_path}'")]
    SchemaMismatch {
        catalog: String,
        entry_id: String,
        field_path: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// ============================================================================
// RECOVERABLE ERRORS
// ============================================================================

/// A record (or one of its sections) is not shaped the way the schema expects.
/// The row is still emitted with the affected fields nulled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed record at row {row_id} ({application_id}): {section} is not {expected}")]
pub struct MalformedRecordError {
    pub row_id: usize,
    pub application_id: String,
    pub section: String,
    pub expected: String,
}

/// A value had the wrong JSON shape for the coercion a predicate asked for
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field {field_path} holds {found}, expected {expected}")]
pub struct ValueTypeError {
    pub field_path: String,
    pub expected: String,
    pub found: String,
}

/// A predicate failed for one row. The (rule, row) pair counts as failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("rule {rule_id} failed on row {row_id} ({application_id}): {source}")]
pub struct RuleEvaluationError {
    pub rule_id: String,
    pub row_id: usize,
    pub application_id: String,
    pub source: ValueTypeError,
}
