// Credit Curation - Core Library
// Flatten, validate, clean, de-duplicate and pseudonymize credit application records

pub mod error;
pub mod config;
pub mod logging;
pub mod values;
pub mod attributes;     // Schema dictionary
pub mod schema;         // Startup catalog check
pub mod temporal;       // Date of birth + timestamp parsing
pub mod flatten;        // Nested record → flat rows
pub mod rules;          // Rule catalog + engine
pub mod cleaning;       // raw_* → clean_* with flags
pub mod deduplication;  // Duplicate groups + canonical rows
pub mod privacy;        // Pseudonymous ids + log redaction
pub mod data_quality;   // Issue registry
pub mod pipeline;       // One run, end to end
pub mod assembly;       // Audit / analysis / spending tables
pub mod export;         // CSV output

// Re-export commonly used types
pub use error::{MalformedRecordError, PipelineError, Result, RuleEvaluationError, ValueTypeError};
pub use config::PipelineConfig;
pub use attributes::{AttributeDefinition, AttributeRegistry, AttributeType, FieldScope, PiiClass};
pub use schema::{CatalogMismatch, SchemaValidator};
pub use flatten::{FlatRow, Flattener, RawRecord, SpendingItemRow};
pub use rules::{Rule, RuleEngine, RuleEvaluation, RowOutcome};
pub use cleaning::{CleanedRow, CleanedSpendingItem, Cleaner, CleaningRule, Transform};
pub use deduplication::{
    CanonicalReason, Classification, DuplicateGroup, DuplicateResolver, Resolution,
};
pub use privacy::{redact_record, PseudoIdSource, PseudoIdentity, Pseudonymizer, Salt};
pub use data_quality::{Issue, IssueGroup, IssueReport, Severity, Stage, StageComparison};
pub use pipeline::{Pipeline, PipelineOutput};
pub use assembly::{Assembler, Datasets, PiiInventoryRecord, Table};
pub use export::Exporter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
