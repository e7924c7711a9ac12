// 📐 Shape Layer - Catalog Validation
// Checks, before any row is touched, that every catalog entry points at a declared
// field path (and every range nullification at a real rule).

use crate::attributes::{AttributeRegistry, FieldScope};
use crate::cleaning::Cleaner;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::rules::RuleEngine;

// ============================================================================
// VALIDATION RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogMismatch {
    /// Which catalog the bad entry lives in
    pub catalog: String,
    pub entry_id: String,

    /// The unresolved reference (a field path or a rule id)
    pub reference: String,
}

impl std::fmt::Display for CatalogMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: unknown '{}'", self.catalog, self.entry_id, self.reference)
    }
}

impl From<CatalogMismatch> for PipelineError {
    fn from(m: CatalogMismatch) -> Self {
        PipelineError::SchemaMismatch {
            catalog: m.catalog,
            entry_id: m.entry_id,
            field_path: m.reference,
        }
    }
}

pub type ValidationResult = std::result::Result<(), Vec<CatalogMismatch>>;

pub const RULE_CATALOG: &str = "rule catalog";
pub const CLEANING_CATALOG: &str = "cleaning catalog";
pub const NON_MATERIAL_FIELDS: &str = "non-material fields";
pub const DIRECT_PII_FIELDS: &str = "direct-PII fields";
pub const ANALYSIS_FIELDS: &str = "analysis fields";

// ============================================================================
// SCHEMA VALIDATOR
// ============================================================================

pub struct SchemaValidator<'a> {
    registry: &'a AttributeRegistry,
}

impl<'a> SchemaValidator<'a> {
    pub fn new(registry: &'a AttributeRegistry) -> Self {
        SchemaValidator { registry }
    }

    fn mismatch(catalog: &str, entry_id: &str, reference: &str) -> CatalogMismatch {
        CatalogMismatch {
            catalog: catalog.to_string(),
            entry_id: entry_id.to_string(),
            reference: reference.to_string(),
        }
    }

    /// Every field path a rule reads must be declared
    pub fn validate_rules(&self, engine: &RuleEngine) -> ValidationResult {
        let errors: Vec<CatalogMismatch> = engine
            .rules()
            .iter()
            .flat_map(|rule| {
                rule.inputs
                    .iter()
                    .filter(move |path| !self.registry.contains(path))
                    .map(move |path| Self::mismatch(RULE_CATALOG, &rule.id, path))
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Cleaned paths and aliases must be declared; range nullifications must
    /// name a rule that exists
    pub fn validate_cleaning(&self, cleaner: &Cleaner, engine: &RuleEngine) -> ValidationResult {
        let mut errors = Vec::new();

        for rule in cleaner.rules() {
            if !self.registry.contains(&rule.field_path) {
                errors.push(Self::mismatch(CLEANING_CATALOG, &rule.action_id, &rule.field_path));
            }
            if let Some(alias) = rule.transform.alias_path() {
                if !self.registry.contains(alias) {
                    errors.push(Self::mismatch(CLEANING_CATALOG, &rule.action_id, alias));
                }
            }
            if let Some(rule_id) = rule.transform.range_rule_id() {
                if engine.get(rule_id).is_none() {
                    errors.push(Self::mismatch(CLEANING_CATALOG, &rule.action_id, rule_id));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn validate_non_material_fields<'f>(
        &self,
        fields: impl IntoIterator<Item = &'f str>,
    ) -> ValidationResult {
        let errors: Vec<CatalogMismatch> = fields
            .into_iter()
            .filter(|path| !self.registry.contains(path))
            .map(|path| Self::mismatch(NON_MATERIAL_FIELDS, path, path))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Configured direct-PII paths must be declared. An analysis field must have an
    /// application clean column and must not be direct PII.
    pub fn validate_privacy_fields(&self, cleaner: &Cleaner, config: &PipelineConfig) -> ValidationResult {
        let mut errors: Vec<CatalogMismatch> = config
            .direct_pii_fields
            .iter()
            .filter(|path| !self.registry.contains(path))
            .map(|path| Self::mismatch(DIRECT_PII_FIELDS, path, path))
            .collect();

        let direct = self.registry.direct_pii_paths(&config.direct_pii_fields);
        for path in &config.analysis_fields {
            let cleaned = cleaner
                .rules_in(FieldScope::Application)
                .any(|r| &r.field_path == path);
            if !cleaned || direct.contains(path.as_str()) {
                errors.push(Self::mismatch(ANALYSIS_FIELDS, path, path));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Run every check; the first mismatch becomes the fatal error
    pub fn check(&self, engine: &RuleEngine, cleaner: &Cleaner, config: &PipelineConfig) -> Result<()> {
        self.validate_rules(engine)
            .and_then(|_| self.validate_cleaning(cleaner, engine))
            .and_then(|_| {
                self.validate_non_material_fields(config.non_material_fields.iter().map(String::as_str))
            })
            .and_then(|_| self.validate_privacy_fields(cleaner, config))
            .map_err(|mut errors| PipelineError::from(errors.remove(0)))
    }
}

// ============================================================================
// TESTS
// ============================================================================
