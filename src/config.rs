// ⚙️ Run Configuration
// Everything a run needs that is not data and not secret. The salt never lives here.

use crate::error::{PipelineError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How many example application ids an issue carries
    pub max_examples: usize,

    /// Field paths whose differences alone make a duplicate group `versioned`
    pub non_material_fields: Vec<String>,

    /// Field paths treated as direct PII on top of the schema's own classification.
    /// Their raw and clean columns never reach the analysis table.
    pub direct_pii_fields: Vec<String>,

    /// Field paths whose clean column is carried into the analysis table
    pub analysis_fields: Vec<String>,

    /// Reference date for age bands (YYYY-MM-DD)
    pub reference_date: String,

    /// Environment variable the CLI reads the salt from
    pub salt_env_var: String,

    /// Register unknown top-level keys as extra raw columns before flattening
    pub passthrough_unknown_fields: bool,

    /// Cap on the differing-field list kept per duplicate group
    pub max_difference_fields: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_examples: 5,
            non_material_fields: vec!["processing_timestamp".to_string(), "notes".to_string()],
            direct_pii_fields: [
                "applicant_info.full_name",
                "applicant_info.email",
                "applicant_info.ssn",
                "applicant_info.ip_address",
                "applicant_info.date_of_birth",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            analysis_fields: [
                "applicant_info.gender",
                "applicant_info.zip_code",
                "financials.annual_income",
                "financials.credit_history_months",
                "financials.debt_to_income",
                "financials.savings_balance",
                "decision.loan_approved",
                "decision.interest_rate",
                "decision.approved_amount",
                "decision.rejection_reason",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            reference_date: "2026-01-01".to_string(),
            salt_env_var: "CREDIT_CURATION_SALT".to_string(),
            passthrough_unknown_fields: true,
            max_difference_fields: 6,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file; missing keys take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a run meaningless
    pub fn validate(&self) -> Result<()> {
        if self.max_examples == 0 {
            return Err(PipelineError::Config(
                "max_examples must be at least 1".to_string(),
            ));
        }
        if self.salt_env_var.trim().is_empty() {
            return Err(PipelineError::Config(
                "salt_env_var must name an environment variable".to_string(),
            ));
        }
        self.reference_date()?;
        Ok(())
    }

    pub fn reference_date(&self) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(&self.reference_date, "%Y-%m-%d").map_err(|e| {
            PipelineError::Config(format!(
                "reference_date '{}' is not YYYY-MM-DD: {}",
                self.reference_date, e
            ))
        })
    }
}
