// 🔐 Privacy - Pseudonymous applicant ids and log-safe redaction
//
// Seed priority (first non-blank wins):
// 1. SSN
// 2. Email
// 3. Full name + date of birth + zip code
// 4. application_id + row_id (always available)
//
// Id = SHA-256(salt || "|" || seed), lowercase hex. The salt is handed in per run
// and never written to any output or log.

use crate::cleaning::CleanedRow;
use crate::error::{PipelineError, Result};
use crate::values::as_text;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

const SSN: &str = "applicant_info.ssn";
const EMAIL: &str = "applicant_info.email";
const FULL_NAME: &str = "applicant_info.full_name";
const DATE_OF_BIRTH: &str = "applicant_info.date_of_birth";
const ZIP_CODE: &str = "applicant_info.zip_code";

// ============================================================================
// SALT
// ============================================================================

/// Opaque secret bytes. Debug output never shows the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt(Vec<u8>);

impl Salt {
    /// `None` for an empty salt; an empty salt is as good as none
    pub fn new(bytes: impl Into<Vec<u8>>) -> Option<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            None
        } else {
            Some(Salt(bytes))
        }
    }

    /// Read the salt from an environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        std::env::var(var)
            .ok()
            .and_then(Salt::new)
            .ok_or(PipelineError::SaltMissing)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt([REDACTED])")
    }
}

// ============================================================================
// PSEUDO IDENTITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PseudoIdSource {
    Ssn,
    Email,
    NameDobZip,
    #[serde(rename = "application_id_row_id")]
    ApplicationRow,
}

impl PseudoIdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PseudoIdSource::Ssn => "ssn",
            PseudoIdSource::Email => "email",
            PseudoIdSource::NameDobZip => "name_dob_zip",
            PseudoIdSource::ApplicationRow => "application_id_row_id",
        }
    }

    /// Position in the seed priority chain (1 = preferred)
    pub fn path_number(&self) -> u8 {
        match self {
            PseudoIdSource::Ssn => 1,
            PseudoIdSource::Email => 2,
            PseudoIdSource::NameDobZip => 3,
            PseudoIdSource::ApplicationRow => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PseudoIdentity {
    pub application_id: String,
    pub row_id: usize,
    pub applicant_pseudo_id: String,
    pub pseudo_id_source: PseudoIdSource,
    pub fallback_used: bool,
}

// ============================================================================
// PSEUDONYMIZER
// ============================================================================

pub struct Pseudonymizer {
    salt: Salt,
}

impl Pseudonymizer {
    /// Refuses to exist without a salt
    pub fn new(salt: Option<Salt>) -> Result<Self> {
        match salt {
            Some(salt) => Ok(Pseudonymizer { salt }),
            None => Err(PipelineError::SaltMissing),
        }
    }

    /// Pick the seed for a row by walking the priority chain
    pub fn resolve_seed(row: &CleanedRow) -> (PseudoIdSource, String) {
        let text = |path: &str, value: &Value| as_text(path, value).ok().flatten();

        if let Some(ssn) = text(SSN, row.flat.raw(SSN)) {
            return (PseudoIdSource::Ssn, format!("ssn:{}", ssn));
        }

        if let Some(email) = text(EMAIL, row.value(EMAIL)) {
            return (PseudoIdSource::Email, format!("email:{}", email.to_lowercase()));
        }

        let name = text(FULL_NAME, row.flat.raw(FULL_NAME)).map(|n| n.to_lowercase());
        let dob = text(DATE_OF_BIRTH, row.value(DATE_OF_BIRTH))
            .or_else(|| text(DATE_OF_BIRTH, row.flat.raw(DATE_OF_BIRTH)));
        let zip = text(ZIP_CODE, row.value(ZIP_CODE));
        if name.is_some() || dob.is_some() || zip.is_some() {
            return (
                PseudoIdSource::NameDobZip,
                format!(
                    "name_dob_zip:{}|{}|{}",
                    name.unwrap_or_default(),
                    dob.unwrap_or_default(),
                    zip.unwrap_or_default()
                ),
            );
        }

        (
            PseudoIdSource::ApplicationRow,
            format!("application:{}|row:{}", row.flat.application_id, row.flat.row_id),
        )
    }

    /// Keyed one-way digest of a seed
    pub fn derive(&self, seed: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b"|");
        hasher.update(seed.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn pseudonymize(&self, row: &CleanedRow) -> PseudoIdentity {
        let (source, seed) = Self::resolve_seed(row);
        PseudoIdentity {
            application_id: row.flat.application_id.clone(),
            row_id: row.flat.row_id,
            applicant_pseudo_id: self.derive(&seed),
            pseudo_id_source: source,
            fallback_used: source != PseudoIdSource::Ssn,
        }
    }
}

// ============================================================================
// REDACTION (log-safe previews)
// ============================================================================

fn mask_scalar(key: &str, value: &Value) -> Value {
    let text = match value {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return value.clone(),
    };

    let key = key.to_lowercase();
    let masked = if key.contains("ssn") {
        let tail: String = text.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("***-**-{}", tail)
    } else if key.contains("email") {
        match text.split_once('@') {
            Some((local, domain)) => {
                let first: String = local.chars().take(1).collect();
                format!("{}***@{}", first, domain)
            }
            None => "[REDACTED_EMAIL]".to_string(),
        }
    } else if key.contains("ip_address") || key == "ip" {
        "[REDACTED_IP]".to_string()
    } else if key.contains("date_of_birth") {
        let year: String = text.chars().take(4).collect();
        if year.chars().count() == 4 {
            format!("{}-**-**", year)
        } else {
            "XXXX-**-**".to_string()
        }
    } else if key.contains("full_name") || key.ends_with("name") {
        "[REDACTED_NAME]".to_string()
    } else {
        return value.clone();
    };

    Value::String(masked)
}

/// Copy of a nested record with direct identifiers masked, for logging only
pub fn redact_record(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut out = Map::new();
            for (key, v) in obj {
                let redacted = match v {
                    Value::Object(_) | Value::Array(_) => redact_record(v),
                    _ => mask_scalar(key, v),
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_record).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeRegistry;
    use crate::cleaning::Cleaner;
    use crate::flatten::{Flattener, RawRecord};
    use serde_json::json;

    fn create_test_row(value: Value) -> CleanedRow {
        let flattener = Flattener::new(AttributeRegistry::credit_applications());
        let cleaner = Cleaner::credit_applications();
        let flat = flattener.flatten(&RawRecord::new(5, value)).row;
        cleaner.clean_row(&flat)
    }

    fn create_test_pseudonymizer() -> Pseudonymizer {
        Pseudonymizer::new(Salt::new("unit-test-salt")).unwrap()
    }

    #[test]
    fn test_missing_salt_refused() {
        assert!(matches!(Pseudonymizer::new(None), Err(PipelineError::SaltMissing)));
        assert!(Salt::new("").is_none());
    }

    #[test]
    fn test_salt_debug_is_redacted() {
        let salt = Salt::new("super-secret").unwrap();
        let shown = format!("{:?}", salt);

        assert!(!shown.contains("super-secret"));
        assert_eq!(shown, "Salt([REDACTED])");
    }

    #[test]
    fn test_ssn_seed_preferred() {
        let p = create_test_pseudonymizer();
        let row = create_test_row(json!({
            "_id": "app_001",
            "applicant_info": { "ssn": "123-45-6789", "email": "a@b.com" }
        }));

        let identity = p.pseudonymize(&row);

        assert_eq!(identity.pseudo_id_source, PseudoIdSource::Ssn);
        assert!(!identity.fallback_used);
        assert_eq!(identity.applicant_pseudo_id.len(), 64);
    }

    #[test]
    fn test_email_fallback() {
        let row = create_test_row(json!({
            "_id": "app_002",
            "applicant_info": { "ssn": "  ", "email": " A@B.com " }
        }));

        let (source, seed) = Pseudonymizer::resolve_seed(&row);

        assert_eq!(source, PseudoIdSource::Email);
        assert_eq!(seed, "email:a@b.com");
    }

    #[test]
    fn test_name_dob_zip_fallback() {
        let p = create_test_pseudonymizer();
        let row = create_test_row(json!({
            "_id": "app_003",
            "applicant_info": {
                "ssn": "",
                "email": "",
                "full_name": "Jane Doe",
                "date_of_birth": "1990-01-01",
                "zip_code": "10001"
            }
        }));

        let identity = p.pseudonymize(&row);

        assert_eq!(identity.pseudo_id_source, PseudoIdSource::NameDobZip);
        assert_eq!(identity.pseudo_id_source.as_str(), "name_dob_zip");
        assert!(identity.fallback_used);
        assert_eq!(
            Pseudonymizer::resolve_seed(&row).1,
            "name_dob_zip:jane doe|1990-01-01|10001"
        );
    }

    #[test]
    fn test_application_row_fallback() {
        let row = create_test_row(json!({ "_id": "app_004" }));

        let (source, seed) = Pseudonymizer::resolve_seed(&row);

        assert_eq!(source, PseudoIdSource::ApplicationRow);
        assert_eq!(source.path_number(), 4);
        assert_eq!(seed, "application:app_004|row:5");
    }

    #[test]
    fn test_unrelated_field_does_not_change_id() {
        let p = create_test_pseudonymizer();
        let a = create_test_row(json!({
            "_id": "app_005",
            "applicant_info": { "ssn": "111-22-3333" },
            "financials": { "annual_income": 10 }
        }));
        let b = create_test_row(json!({
            "_id": "app_005",
            "applicant_info": { "ssn": "111-22-3333", "email": "x@y.z" },
            "financials": { "annual_income": 99999 }
        }));

        assert_eq!(
            p.pseudonymize(&a).applicant_pseudo_id,
            p.pseudonymize(&b).applicant_pseudo_id
        );
    }

    #[test]
    fn test_salt_changes_id() {
        let a = Pseudonymizer::new(Salt::new("one")).unwrap();
        let b = Pseudonymizer::new(Salt::new("two")).unwrap();

        assert_ne!(a.derive("ssn:1"), b.derive("ssn:1"));
        assert_eq!(a.derive("ssn:1"), a.derive("ssn:1"));
    }

    #[test]
    fn test_redact_record_masks_identifiers() {
        let redacted = redact_record(&json!({
            "_id": "app_001",
            "applicant_info": {
                "full_name": "Jane Doe",
                "email": "jane@example.com",
                "ssn": "123-45-6789",
                "ip_address": "10.0.0.1",
                "date_of_birth": "1990-01-01",
                "zip_code": "10001"
            }
        }));

        let info = &redacted["applicant_info"];
        assert_eq!(info["full_name"], json!("[REDACTED_NAME]"));
        assert_eq!(info["email"], json!("j***@example.com"));
        assert_eq!(info["ssn"], json!("***-**-6789"));
        assert_eq!(info["ip_address"], json!("[REDACTED_IP]"));
        assert_eq!(info["date_of_birth"], json!("1990-**-**"));
        assert_eq!(info["zip_code"], json!("10001"));
        assert_eq!(redacted["_id"], json!("app_001"));
    }
}
