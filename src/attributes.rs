// 🏛️ Schema Dictionary - Attribute Registry
// Every declared raw field path and the column it lands in.
// The column set is fixed before a run so sparse records never drop columns.

use crate::flatten::RawRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Path prefix for fields that live on spending line items
pub const SPENDING_PREFIX: &str = "spending_behavior[].";

/// Top-level keys the flattener understands structurally
pub const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "_id",
    "processing_timestamp",
    "applicant_info",
    "financials",
    "decision",
    "spending_behavior",
];

// ============================================================================
// ATTRIBUTE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    String,
    Number,
    Boolean,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PiiClass {
    /// Identifies a person on its own
    Direct,
    /// Narrows identity when combined with other fields
    Quasi,
    None,
}

impl PiiClass {
    pub fn label(&self) -> &'static str {
        match self {
            PiiClass::Direct => "PII",
            PiiClass::Quasi => "Quasi-PII",
            PiiClass::None => "Non-PII",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldScope {
    Application,
    Spending,
}

// ============================================================================
// ATTRIBUTE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDefinition {
    /// Canonical dotted path in the source record (e.g. "financials.debt_to_income")
    pub path: String,

    /// Output column (e.g. "raw_financials_debt_to_income")
    pub column: String,

    pub scope: FieldScope,
    pub type_: AttributeType,
    pub pii: PiiClass,
    pub description: String,
}

impl AttributeDefinition {
    pub fn application(path: impl Into<String>, type_: AttributeType) -> Self {
        let path = path.into();
        AttributeDefinition {
            column: raw_column_name(&path),
            path,
            scope: FieldScope::Application,
            type_,
            pii: PiiClass::None,
            description: String::new(),
        }
    }

    /// Spending fields are declared by their leaf name
    pub fn spending(leaf: &str, type_: AttributeType) -> Self {
        AttributeDefinition {
            path: format!("{}{}", SPENDING_PREFIX, leaf),
            column: format!("raw_{}", leaf),
            scope: FieldScope::Spending,
            type_,
            pii: PiiClass::None,
            description: String::new(),
        }
    }

    pub fn with_pii(mut self, pii: PiiClass) -> Self {
        self.pii = pii;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Path segments below the record root ("applicant_info.email" → ["applicant_info", "email"])
    pub fn segments(&self) -> Vec<&str> {
        match self.scope {
            FieldScope::Application => self.path.split('.').collect(),
            FieldScope::Spending => vec![self.leaf()],
        }
    }

    pub fn leaf(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(self.path.as_str())
    }
}

/// `raw_` + path with dots replaced by underscores
pub fn raw_column_name(path: &str) -> String {
    format!("raw_{}", path.replace('.', "_"))
}

// ============================================================================
// ATTRIBUTE REGISTRY
// ============================================================================

/// Ordered catalog of declared fields. Declaration order is column order.
#[derive(Debug, Clone)]
pub struct AttributeRegistry {
    attributes: Vec<AttributeDefinition>,
    index: HashMap<String, usize>,
}

impl AttributeRegistry {
    pub fn empty() -> Self {
        AttributeRegistry {
            attributes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Registry for the credit application dataset
    pub fn credit_applications() -> Self {
        let mut registry = Self::empty();
        registry.register_core_attributes();
        registry
    }

    fn register_core_attributes(&mut self) {
        use AttributeType as T;

        self.register(
            AttributeDefinition::application("processing_timestamp", T::Timestamp)
                .with_description("When the application was processed upstream"),
        );

        // ====================================================================
        // APPLICANT
        // ====================================================================

        self.register(
            AttributeDefinition::application("applicant_info.full_name", T::String)
                .with_pii(PiiClass::Direct)
                .with_description("Applicant full name"),
        );
        self.register(
            AttributeDefinition::application("applicant_info.email", T::String)
                .with_pii(PiiClass::Direct)
                .with_description("Applicant email address"),
        );
        self.register(
            AttributeDefinition::application("applicant_info.ssn", T::String)
                .with_pii(PiiClass::Direct)
                .with_description("Social security number"),
        );
        self.register(
            AttributeDefinition::application("applicant_info.ip_address", T::String)
                .with_pii(PiiClass::Direct)
                .with_description("IP address the application was submitted from"),
        );
        self.register(
            AttributeDefinition::application("applicant_info.gender", T::String)
                .with_pii(PiiClass::Quasi)
                .with_description("Self-reported gender"),
        );
        self.register(
            AttributeDefinition::application("applicant_info.date_of_birth", T::Date)
                .with_pii(PiiClass::Direct)
                .with_description("Date of birth in one of several layouts"),
        );
        self.register(
            AttributeDefinition::application("applicant_info.zip_code", T::String)
                .with_pii(PiiClass::Quasi)
                .with_description("Residential zip code"),
        );

        // ====================================================================
        // FINANCIALS
        // ====================================================================

        self.register(
            AttributeDefinition::application("financials.annual_income", T::Number)
                .with_description("Annual income"),
        );
        self.register(
            AttributeDefinition::application("financials.annual_salary", T::Number)
                .with_description("Drifted alias of annual_income seen in older feeds"),
        );
        self.register(
            AttributeDefinition::application("financials.credit_history_months", T::Number)
                .with_description("Length of credit history in months"),
        );
        self.register(
            AttributeDefinition::application("financials.debt_to_income", T::Number)
                .with_description("Debt-to-income ratio, expected in [0, 1]"),
        );
        self.register(
            AttributeDefinition::application("financials.savings_balance", T::Number)
                .with_description("Savings balance"),
        );

        // ====================================================================
        // DECISION
        // ====================================================================

        self.register(
            AttributeDefinition::application("decision.loan_approved", T::Boolean)
                .with_description("Whether the loan was approved"),
        );
        self.register(
            AttributeDefinition::application("decision.interest_rate", T::Number)
                .with_description("Interest rate for approved loans"),
        );
        self.register(
            AttributeDefinition::application("decision.approved_amount", T::Number)
                .with_description("Approved loan amount"),
        );
        self.register(
            AttributeDefinition::application("decision.rejection_reason", T::String)
                .with_description("Reason given for a rejected loan"),
        );

        self.register(
            AttributeDefinition::application("notes", T::String)
                .with_pii(PiiClass::Quasi)
                .with_description("Free-text operator notes"),
        );

        // ====================================================================
        // SPENDING LINE ITEMS
        // ====================================================================

        self.register(
            AttributeDefinition::spending("category", T::String)
                .with_description("Spending category"),
        );
        self.register(
            AttributeDefinition::spending("amount", T::Number)
                .with_description("Amount spent in the category"),
        );
    }

    /// Register an attribute; re-registering a path replaces its definition in place
    pub fn register(&mut self, attr: AttributeDefinition) {
        match self.index.get(&attr.path) {
            Some(&i) => self.attributes[i] = attr,
            None => {
                self.index.insert(attr.path.clone(), self.attributes.len());
                self.attributes.push(attr);
            }
        }
    }

    /// Register unknown top-level keys seen anywhere in the batch as extra
    /// application columns (sorted, so the column order is reproducible)
    pub fn register_passthrough_fields(&mut self, records: &[RawRecord]) -> Vec<String> {
        let mut unknown = BTreeSet::new();
        for record in records {
            if let Some(obj) = record.value.as_object() {
                for key in obj.keys() {
                    if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) && !self.contains(key) {
                        unknown.insert(key.clone());
                    }
                }
            }
        }

        let added: Vec<String> = unknown.into_iter().collect();
        for key in &added {
            self.register(
                AttributeDefinition::application(key.clone(), AttributeType::String)
                    .with_pii(PiiClass::Quasi)
                    .with_description("Pass-through top-level field"),
            );
        }
        added
    }

    pub fn get(&self, path: &str) -> Option<&AttributeDefinition> {
        self.index.get(path).map(|&i| &self.attributes[i])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn column_for(&self, path: &str) -> Option<&str> {
        self.get(path).map(|a| a.column.as_str())
    }

    pub fn all(&self) -> &[AttributeDefinition] {
        &self.attributes
    }

    pub fn in_scope(&self, scope: FieldScope) -> impl Iterator<Item = &AttributeDefinition> {
        self.attributes.iter().filter(move |a| a.scope == scope)
    }

    /// Paths classified `Direct` plus the configured extras
    pub fn direct_pii_paths<'a>(&'a self, configured: &'a [String]) -> BTreeSet<&'a str> {
        self.attributes
            .iter()
            .filter(|a| a.pii == PiiClass::Direct)
            .map(|a| a.path.as_str())
            .chain(configured.iter().map(String::as_str))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.attributes.len()
    }
}

impl Default for AttributeRegistry {
    fn default() -> Self {
        Self::credit_applications()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_column_names_follow_path() {
        let registry = AttributeRegistry::credit_applications();

        assert_eq!(
            registry.column_for("financials.debt_to_income"),
            Some("raw_financials_debt_to_income")
        );
        assert_eq!(
            registry.column_for("processing_timestamp"),
            Some("raw_processing_timestamp")
        );
        assert_eq!(
            registry.column_for("spending_behavior[].amount"),
            Some("raw_amount")
        );
    }

    #[test]
    fn test_scopes_and_segments() {
        let registry = AttributeRegistry::credit_applications();

        assert_eq!(registry.in_scope(FieldScope::Spending).count(), 2);
        let email = registry.get("applicant_info.email").unwrap();
        assert_eq!(email.segments(), vec!["applicant_info", "email"]);
        assert_eq!(email.leaf(), "email");

        let amount = registry.get("spending_behavior[].amount").unwrap();
        assert_eq!(amount.segments(), vec!["amount"]);
    }

    #[test]
    fn test_direct_pii_paths() {
        let registry = AttributeRegistry::credit_applications();
        let configured = vec!["applicant_info.zip_code".to_string()];

        let pii = registry.direct_pii_paths(&[]);
        assert!(pii.contains("applicant_info.ssn"));
        assert!(pii.contains("applicant_info.date_of_birth"));
        assert!(!pii.contains("applicant_info.gender"));
        assert!(!pii.contains("applicant_info.zip_code"));

        assert!(registry.direct_pii_paths(&configured).contains("applicant_info.zip_code"));
        assert_eq!(PiiClass::Direct.label(), "PII");
    }

    #[test]
    fn test_passthrough_fields_are_sorted_and_stable() {
        let mut registry = AttributeRegistry::credit_applications();
        let before = registry.count();

        let records = vec![
            RawRecord::new(0, json!({"_id": "a", "zeta": 1, "channel": "web"})),
            RawRecord::new(1, json!({"_id": "b", "channel": "branch", "notes": "x"})),
        ];
        let added = registry.register_passthrough_fields(&records);

        assert_eq!(added, vec!["channel".to_string(), "zeta".to_string()]);
        assert_eq!(registry.count(), before + 2);
        assert_eq!(registry.column_for("channel"), Some("raw_channel"));
        assert_eq!(registry.get("channel").unwrap().pii, PiiClass::Quasi);
    }

    #[test]
    fn test_register_replaces_existing_path() {
        let mut registry = AttributeRegistry::credit_applications();
        let before = registry.count();

        registry.register(
            AttributeDefinition::application("notes", AttributeType::String)
                .with_pii(PiiClass::Direct),
        );

        assert_eq!(registry.count(), before);
        assert_eq!(registry.get("notes").unwrap().pii, PiiClass::Direct);
    }
}
