// 🏷️ Validation Rules - Rules as Data
// A stable-id catalog of row-local predicates, evaluated the same way before and
// after cleaning so each rule's counts are directly comparable across stages.

use crate::attributes::FieldScope;
use crate::cleaning::{
    CleanedRow, CleanedSpendingItem, AMOUNT_INVALID_FLAG, ANNUAL_INCOME_INVALID_FLAG,
    ANNUAL_INCOME_REMAPPED_FLAG, DOB_AMBIGUOUS_FLAG,
};
use crate::data_quality::{IssueGroup, Severity, Stage};
use crate::error::{RuleEvaluationError, ValueTypeError};
use crate::flatten::{FlatRow, SpendingItemRow};
use crate::temporal::{is_ambiguous_dob, is_iso_date_shape};
use crate::values::{as_bool, as_f64, as_text, is_blank, is_non_numeric};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, warn};

pub const EMAIL_PATTERN: &str = r"^[^\s@]+@[^\s@]+\.[^\s@]+$";

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(EMAIL_PATTERN).expect("email pattern compiles"));

/// Applicant fields every application must carry
pub const REQUIRED_APPLICANT_FIELDS: &[&str] = &[
    "applicant_info.full_name",
    "applicant_info.email",
    "applicant_info.ssn",
    "applicant_info.ip_address",
    "applicant_info.gender",
    "applicant_info.date_of_birth",
    "applicant_info.zip_code",
];

// ============================================================================
// RULE SUBJECTS
// ============================================================================

/// What a predicate can see of one row
pub trait RuleSubject {
    fn row_id(&self) -> usize;
    fn application_id(&self) -> &str;

    /// Line-item position for spending rows
    fn item_index(&self) -> Option<usize> {
        None
    }

    fn raw(&self, path: &str) -> &Value;

    /// Clean value for a cleaned path; always `None` before cleaning
    fn clean(&self, path: &str) -> Option<&Value>;

    /// Cleaning flag; `None` before cleaning
    fn flag(&self, name: &str) -> Option<bool>;

    /// The value a predicate reads: clean when the path was cleaned, raw otherwise
    fn field(&self, path: &str) -> &Value {
        match self.clean(path) {
            Some(v) => v,
            None => self.raw(path),
        }
    }
}

/// A row type bound to one evaluation stage
pub trait StagedRow: RuleSubject {
    const STAGE: Stage;
}

impl RuleSubject for FlatRow {
    fn row_id(&self) -> usize {
        self.row_id
    }
    fn application_id(&self) -> &str {
        &self.application_id
    }
    fn raw(&self, path: &str) -> &Value {
        FlatRow::raw(self, path)
    }
    fn clean(&self, _path: &str) -> Option<&Value> {
        None
    }
    fn flag(&self, _name: &str) -> Option<bool> {
        None
    }
}

impl StagedRow for FlatRow {
    const STAGE: Stage = Stage::Pre;
}

impl RuleSubject for SpendingItemRow {
    fn row_id(&self) -> usize {
        self.row_id
    }
    fn application_id(&self) -> &str {
        &self.application_id
    }
    fn item_index(&self) -> Option<usize> {
        Some(self.item_index)
    }
    fn raw(&self, path: &str) -> &Value {
        SpendingItemRow::raw(self, path)
    }
    fn clean(&self, _path: &str) -> Option<&Value> {
        None
    }
    fn flag(&self, _name: &str) -> Option<bool> {
        None
    }
}

impl StagedRow for SpendingItemRow {
    const STAGE: Stage = Stage::Pre;
}

impl RuleSubject for CleanedRow {
    fn row_id(&self) -> usize {
        self.flat.row_id
    }
    fn application_id(&self) -> &str {
        &self.flat.application_id
    }
    fn raw(&self, path: &str) -> &Value {
        self.flat.raw(path)
    }
    fn clean(&self, path: &str) -> Option<&Value> {
        CleanedRow::clean(self, path)
    }
    fn flag(&self, name: &str) -> Option<bool> {
        Some(CleanedRow::flag(self, name))
    }
}

impl StagedRow for CleanedRow {
    const STAGE: Stage = Stage::Post;
}

impl RuleSubject for CleanedSpendingItem {
    fn row_id(&self) -> usize {
        self.item.row_id
    }
    fn application_id(&self) -> &str {
        &self.item.application_id
    }
    fn item_index(&self) -> Option<usize> {
        Some(self.item.item_index)
    }
    fn raw(&self, path: &str) -> &Value {
        self.item.raw(path)
    }
    fn clean(&self, path: &str) -> Option<&Value> {
        CleanedSpendingItem::clean(self, path)
    }
    fn flag(&self, name: &str) -> Option<bool> {
        Some(CleanedSpendingItem::flag(self, name))
    }
}

impl StagedRow for CleanedSpendingItem {
    const STAGE: Stage = Stage::Post;
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

/// True when the row fails the rule
pub type Predicate = fn(&dyn RuleSubject) -> Result<bool, ValueTypeError>;

#[derive(Clone, Serialize)]
pub struct Rule {
    /// Stable id shared by both stages (e.g. "R_APP_014")
    pub id: String,
    pub scope: FieldScope,
    pub issue_group: IssueGroup,

    /// Field the issue is reported against
    pub field_path: String,

    /// Every field path the predicate reads
    pub inputs: Vec<String>,
    pub severity: Severity,
    pub description: String,

    #[serde(skip)]
    pub predicate: Predicate,
}

impl Rule {
    pub fn new(
        id: &str,
        scope: FieldScope,
        issue_group: IssueGroup,
        field_path: &str,
        inputs: &[&str],
        severity: Severity,
        description: &str,
        predicate: Predicate,
    ) -> Self {
        Rule {
            id: id.to_string(),
            scope,
            issue_group,
            field_path: field_path.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            severity,
            description: description.to_string(),
            predicate,
        }
    }

    pub fn evaluate(&self, row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
        (self.predicate)(row)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("field_path", &self.field_path)
            .field("severity", &self.severity)
            .finish()
    }
}

// ============================================================================
// PREDICATES
// ============================================================================

fn blank(row: &dyn RuleSubject, path: &str) -> bool {
    is_blank(row.field(path))
}

fn number(row: &dyn RuleSubject, path: &str) -> Result<Option<f64>, ValueTypeError> {
    as_f64(path, row.field(path))
}

fn approved(row: &dyn RuleSubject) -> Result<Option<bool>, ValueTypeError> {
    as_bool("decision.loan_approved", row.field("decision.loan_approved"))
}

fn is_private_ip(text: &str) -> bool {
    match text.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_private() || ip.is_loopback() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00,
        Err(_) => false,
    }
}

fn missing_processing_timestamp(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(blank(row, "processing_timestamp"))
}

fn missing_required_applicant_field(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(REQUIRED_APPLICANT_FIELDS.iter().any(|path| blank(row, path)))
}

fn missing_ssn_and_ip(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(blank(row, "applicant_info.ssn") && blank(row, "applicant_info.ip_address"))
}

fn blank_email(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(blank(row, "applicant_info.email"))
}

fn invalid_email(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    let path = "applicant_info.email";
    Ok(match as_text(path, row.field(path))? {
        Some(email) => !EMAIL_RE.is_match(&email),
        None => false,
    })
}

fn gender_needs_normalisation(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    let path = "applicant_info.gender";
    Ok(match as_text(path, row.field(path))? {
        Some(g) => matches!(g.to_lowercase().as_str(), "m" | "f"),
        None => false,
    })
}

fn invalid_gender(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    let path = "applicant_info.gender";
    Ok(match as_text(path, row.field(path))? {
        Some(g) => !matches!(g.to_lowercase().as_str(), "m" | "male" | "f" | "female"),
        None => false,
    })
}

fn dob_not_iso(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    let path = "applicant_info.date_of_birth";
    Ok(match as_text(path, row.field(path))? {
        Some(dob) => !is_iso_date_shape(&dob),
        None => false,
    })
}

fn dob_ambiguous(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    if let Some(flagged) = row.flag(DOB_AMBIGUOUS_FLAG) {
        return Ok(flagged);
    }
    let path = "applicant_info.date_of_birth";
    Ok(as_text(path, row.raw(path))?.map_or(false, |dob| is_ambiguous_dob(&dob)))
}

fn annual_income_not_numeric(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    if let Some(flagged) = row.flag(ANNUAL_INCOME_INVALID_FLAG) {
        return Ok(flagged);
    }
    let path = "financials.annual_income";
    is_non_numeric(path, row.raw(path))
}

fn salary_instead_of_income(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    if let Some(flagged) = row.flag(ANNUAL_INCOME_REMAPPED_FLAG) {
        return Ok(flagged);
    }
    Ok(is_blank(row.raw("financials.annual_income"))
        && !is_blank(row.raw("financials.annual_salary")))
}

fn negative_credit_history(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(number(row, "financials.credit_history_months")?.map_or(false, |v| v < 0.0))
}

fn negative_savings(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(number(row, "financials.savings_balance")?.map_or(false, |v| v < 0.0))
}

fn dti_out_of_range(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(number(row, "financials.debt_to_income")?.map_or(false, |v| !(0.0..=1.0).contains(&v)))
}

fn approved_missing_terms(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    if approved(row)? != Some(true) {
        return Ok(false);
    }
    Ok(number(row, "decision.interest_rate")?.is_none()
        || number(row, "decision.approved_amount")?.is_none())
}

fn rejected_missing_reason(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(approved(row)? == Some(false) && blank(row, "decision.rejection_reason"))
}

fn approved_zero_credit_history(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(approved(row)? == Some(true)
        && number(row, "financials.credit_history_months")? == Some(0.0))
}

fn approved_short_credit_history(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(approved(row)? == Some(true)
        && number(row, "financials.credit_history_months")?.map_or(false, |v| v < 6.0))
}

fn private_ip_address(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    let path = "applicant_info.ip_address";
    Ok(as_text(path, row.raw(path))?.map_or(false, |ip| is_private_ip(&ip)))
}

fn spending_missing_category(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(blank(row, "spending_behavior[].category"))
}

fn spending_amount_non_numeric(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    if let Some(flagged) = row.flag(AMOUNT_INVALID_FLAG) {
        return Ok(flagged);
    }
    let path = "spending_behavior[].amount";
    is_non_numeric(path, row.raw(path))
}

fn spending_amount_negative(row: &dyn RuleSubject) -> Result<bool, ValueTypeError> {
    Ok(number(row, "spending_behavior[].amount")?.map_or(false, |v| v < 0.0))
}

// ============================================================================
// CATALOG
// ============================================================================

pub fn default_rule_catalog() -> Vec<Rule> {
    use FieldScope::{Application as App, Spending as Spn};
    use IssueGroup::*;
    use Severity::*;

    vec![
        Rule::new("R_APP_001", App, Completeness, "processing_timestamp",
            &["processing_timestamp"], High,
            "Missing or blank processing timestamp.", missing_processing_timestamp),
        Rule::new("R_APP_002", App, Completeness, "applicant_info.*",
            REQUIRED_APPLICANT_FIELDS, High,
            "One or more required applicant fields missing or blank.", missing_required_applicant_field),
        Rule::new("R_APP_003", App, Completeness, "applicant_info.ssn|applicant_info.ip_address",
            &["applicant_info.ssn", "applicant_info.ip_address"], High,
            "Both SSN and IP address are missing or blank.", missing_ssn_and_ip),
        Rule::new("R_APP_004", App, Completeness, "applicant_info.email",
            &["applicant_info.email"], Medium,
            "Email is missing or blank.", blank_email),
        Rule::new("R_APP_005", App, Validity, "applicant_info.email",
            &["applicant_info.email"], Medium,
            "Email does not match the expected format.", invalid_email),
        Rule::new("R_APP_006", App, Consistency, "applicant_info.gender",
            &["applicant_info.gender"], Low,
            "Gender is not already in canonical form.", gender_needs_normalisation),
        Rule::new("R_APP_007", App, Validity, "applicant_info.gender",
            &["applicant_info.gender"], Medium,
            "Gender is outside the allowed values.", invalid_gender),
        Rule::new("R_APP_008", App, Consistency, "applicant_info.date_of_birth",
            &["applicant_info.date_of_birth"], Low,
            "Date of birth is not in canonical YYYY-MM-DD form.", dob_not_iso),
        Rule::new("R_APP_009", App, Consistency, "applicant_info.date_of_birth",
            &["applicant_info.date_of_birth"], Medium,
            "Date of birth matches the ambiguous NN/NN/YYYY pattern and is read month-first.", dob_ambiguous),
        Rule::new("R_APP_010", App, Consistency, "financials.annual_income",
            &["financials.annual_income"], Low,
            "Annual income cannot be read as a number.", annual_income_not_numeric),
        Rule::new("R_APP_011", App, Consistency, "financials.annual_salary",
            &["financials.annual_income", "financials.annual_salary"], Medium,
            "Annual salary is populated instead of annual income.", salary_instead_of_income),
        Rule::new("R_APP_012", App, Validity, "financials.credit_history_months",
            &["financials.credit_history_months"], High,
            "Credit history months is negative.", negative_credit_history),
        Rule::new("R_APP_013", App, Validity, "financials.savings_balance",
            &["financials.savings_balance"], High,
            "Savings balance is negative.", negative_savings),
        Rule::new("R_APP_014", App, Validity, "financials.debt_to_income",
            &["financials.debt_to_income"], High,
            "Debt-to-income is outside the allowed range [0, 1].", dti_out_of_range),
        Rule::new("R_APP_015", App, CrossField, "decision.loan_approved",
            &["decision.loan_approved", "decision.interest_rate", "decision.approved_amount"], High,
            "Approved loan is missing interest_rate and/or approved_amount.", approved_missing_terms),
        Rule::new("R_APP_016", App, CrossField, "decision.rejection_reason",
            &["decision.loan_approved", "decision.rejection_reason"], Medium,
            "Rejected loan is missing rejection_reason.", rejected_missing_reason),
        Rule::new("R_APP_017", App, CrossField, "financials.credit_history_months",
            &["decision.loan_approved", "financials.credit_history_months"], Medium,
            "Loan approved with zero months of credit history.", approved_zero_credit_history),
        Rule::new("R_APP_018", App, CrossField, "financials.credit_history_months",
            &["decision.loan_approved", "financials.credit_history_months"], Medium,
            "Loan approved with less than 6 months of credit history.", approved_short_credit_history),
        Rule::new("R_APP_019", App, Privacy, "applicant_info.ip_address",
            &["applicant_info.ip_address"], Low,
            "IP address is in a private range and likely masked or synthetic.", private_ip_address),
        Rule::new("R_SPN_001", Spn, Completeness, "spending_behavior[].category",
            &["spending_behavior[].category"], Medium,
            "Spending category is missing or blank.", spending_missing_category),
        Rule::new("R_SPN_002", Spn, Validity, "spending_behavior[].amount",
            &["spending_behavior[].amount"], High,
            "Spending amount cannot be read as a number.", spending_amount_non_numeric),
        Rule::new("R_SPN_003", Spn, Validity, "spending_behavior[].amount",
            &["spending_behavior[].amount"], High,
            "Spending amount is negative.", spending_amount_negative),
    ]
}

// ============================================================================
// EVALUATION RESULT
// ============================================================================

/// Which rules one row failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowOutcome {
    pub row_id: usize,
    pub application_id: String,
    pub item_index: Option<usize>,
    pub failed_rules: Vec<String>,
}

impl RowOutcome {
    pub fn failed(&self, rule_id: &str) -> bool {
        self.failed_rules.iter().any(|id| id == rule_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleEvaluation {
    pub stage: Stage,
    pub scope: FieldScope,

    /// One outcome per input row, in input order
    pub rows: Vec<RowOutcome>,
    pub errors: Vec<RuleEvaluationError>,
}

impl RuleEvaluation {
    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }

    /// Rows failing `rule_id`, in input order
    pub fn failures<'a>(&'a self, rule_id: &'a str) -> impl Iterator<Item = &'a RowOutcome> + 'a {
        self.rows.iter().filter(move |r| r.failed(rule_id))
    }

    pub fn failure_count(&self, rule_id: &str) -> usize {
        self.failures(rule_id).count()
    }

    pub fn errors_for<'a>(
        &'a self,
        rule_id: &'a str,
    ) -> impl Iterator<Item = &'a RuleEvaluationError> + 'a {
        self.errors.iter().filter(move |e| e.rule_id == rule_id)
    }

    /// Failed rule ids keyed by (row id, item index)
    pub fn failed_by_row(&self) -> HashMap<(usize, Option<usize>), &[String]> {
        self.rows
            .iter()
            .map(|r| ((r.row_id, r.item_index), r.failed_rules.as_slice()))
            .collect()
    }
}

// ============================================================================
// RULE ENGINE
// ============================================================================

pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// Create a new empty rule engine
    pub fn new() -> Self {
        RuleEngine { rules: Vec::new() }
    }

    pub fn from_rules(rules: Vec<Rule>) -> Self {
        RuleEngine { rules }
    }

    pub fn credit_applications() -> Self {
        Self::from_rules(default_rule_catalog())
    }

    /// Add a rule; an existing rule with the same id is replaced
    pub fn add_rule(&mut self, rule: Rule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rules_in(&self, scope: FieldScope) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.scope == scope)
    }

    pub fn get(&self, rule_id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate every rule of `scope` against every row. A predicate that
    /// errors counts as a failure and is reported in `errors`.
    pub fn evaluate<S: StagedRow>(&self, scope: FieldScope, rows: &[S]) -> RuleEvaluation {
        let mut errors = Vec::new();
        let mut outcomes = Vec::with_capacity(rows.len());

        for row in rows {
            let mut failed_rules = Vec::new();
            for rule in self.rules_in(scope) {
                match rule.evaluate(row) {
                    Ok(true) => failed_rules.push(rule.id.clone()),
                    Ok(false) => {}
                    Err(source) => {
                        failed_rules.push(rule.id.clone());
                        errors.push(RuleEvaluationError {
                            rule_id: rule.id.clone(),
                            row_id: row.row_id(),
                            application_id: row.application_id().to_string(),
                            source,
                        });
                    }
                }
            }
            outcomes.push(RowOutcome {
                row_id: row.row_id(),
                application_id: row.application_id().to_string(),
                item_index: row.item_index(),
                failed_rules,
            });
        }

        let stage = S::STAGE;
        if !errors.is_empty() {
            warn!(
                stage = %stage,
                scope = ?scope,
                errors = errors.len(),
                "rule predicates could not evaluate some rows"
            );
        }
        debug!(stage = %stage, scope = ?scope, rows = rows.len(), "rules evaluated");

        RuleEvaluation {
            stage,
            scope,
            rows: outcomes,
            errors,
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::credit_applications()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeRegistry;
    use crate::cleaning::Cleaner;
    use crate::flatten::{Flattener, RawRecord};
    use serde_json::json;

    fn create_test_row(row_id: usize, value: Value) -> FlatRow {
        Flattener::new(AttributeRegistry::credit_applications())
            .flatten(&RawRecord::new(row_id, value))
            .row
    }

    fn create_test_record() -> Value {
        json!({
            "_id": "app_001",
            "processing_timestamp": "2024-01-02T00:00:00",
            "applicant_info": {
                "full_name": "Jane Doe",
                "email": "jane@example.com",
                "ssn": "123-45-6789",
                "ip_address": "203.0.113.9",
                "gender": "Female",
                "date_of_birth": "1990-05-07",
                "zip_code": "10001"
            },
            "financials": {
                "annual_income": 55000,
                "credit_history_months": 24,
                "debt_to_income": 0.3,
                "savings_balance": 1000
            },
            "decision": {
                "loan_approved": true,
                "interest_rate": 0.07,
                "approved_amount": 10000
            }
        })
    }

    fn failed(engine: &RuleEngine, row: &FlatRow) -> Vec<String> {
        engine
            .evaluate(FieldScope::Application, std::slice::from_ref(row))
            .rows[0]
            .failed_rules
            .clone()
    }

    #[test]
    fn test_clean_record_passes_every_rule() {
        let engine = RuleEngine::credit_applications();
        let row = create_test_row(0, create_test_record());

        assert!(failed(&engine, &row).is_empty());
    }

    #[test]
    fn test_catalog_ids_are_unique() {
        let engine = RuleEngine::credit_applications();
        let mut ids: Vec<&str> = engine.rules().iter().map(|r| r.id.as_str()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();

        assert_eq!(ids.len(), total);
        assert_eq!(engine.rules_in(FieldScope::Spending).count(), 3);
    }

    #[test]
    fn test_pre_stage_failures() {
        let engine = RuleEngine::credit_applications();
        let mut record = create_test_record();
        record["applicant_info"]["email"] = json!("not-an-email");
        record["applicant_info"]["gender"] = json!("f");
        record["applicant_info"]["date_of_birth"] = json!("05/07/1990");
        record["applicant_info"]["ip_address"] = json!("192.168.1.10");
        record["financials"]["debt_to_income"] = json!(1.4);
        record["decision"]["interest_rate"] = Value::Null;

        let failures = failed(&engine, &create_test_row(0, record));

        for id in ["R_APP_005", "R_APP_006", "R_APP_008", "R_APP_009", "R_APP_014", "R_APP_015", "R_APP_019"] {
            assert!(failures.contains(&id.to_string()), "expected {} to fail", id);
        }
        assert!(!failures.contains(&"R_APP_007".to_string()));
    }

    #[test]
    fn test_post_stage_reads_clean_values_and_flags() {
        let engine = RuleEngine::credit_applications();
        let mut record = create_test_record();
        record["applicant_info"]["gender"] = json!("f");
        record["applicant_info"]["date_of_birth"] = json!("05/07/1990");
        record["financials"]["debt_to_income"] = json!(1.4);
        record["financials"]["annual_income"] = Value::Null;
        record["financials"]["annual_salary"] = json!("52000");
        let row = create_test_row(0, record);

        let cleaned = Cleaner::credit_applications().clean_row(&row);
        let post = engine.evaluate(FieldScope::Application, &[cleaned]);
        let failures = &post.rows[0].failed_rules;

        assert!(!failures.contains(&"R_APP_006".to_string()));
        assert!(!failures.contains(&"R_APP_008".to_string()));
        assert!(!failures.contains(&"R_APP_014".to_string()));
        // Ambiguity and remap are carried by cleaning flags
        assert!(failures.contains(&"R_APP_009".to_string()));
        assert!(failures.contains(&"R_APP_011".to_string()));
        assert_eq!(post.stage, Stage::Post);
    }

    #[test]
    fn test_numeric_income_text_is_accepted() {
        let engine = RuleEngine::credit_applications();

        let mut numeric = create_test_record();
        numeric["financials"]["annual_income"] = json!("55000");
        assert!(!failed(&engine, &create_test_row(0, numeric)).contains(&"R_APP_010".to_string()));

        let mut words = create_test_record();
        words["financials"]["annual_income"] = json!("fifty");
        assert!(failed(&engine, &create_test_row(1, words)).contains(&"R_APP_010".to_string()));
    }

    #[test]
    fn test_wrong_shape_is_evaluation_error() {
        let engine = RuleEngine::credit_applications();
        let mut record = create_test_record();
        record["decision"]["loan_approved"] = json!({"value": true});

        let eval = engine.evaluate(FieldScope::Application, &[create_test_row(3, record)]);

        assert!(eval.rows[0].failed("R_APP_015"));
        let errors: Vec<_> = eval.errors_for("R_APP_015").collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_id, 3);
        assert_eq!(errors[0].source.field_path, "decision.loan_approved");
    }

    #[test]
    fn test_cross_field_rules() {
        let engine = RuleEngine::credit_applications();

        let mut zero = create_test_record();
        zero["financials"]["credit_history_months"] = json!(0);
        let failures = failed(&engine, &create_test_row(0, zero));
        assert!(failures.contains(&"R_APP_017".to_string()));
        assert!(failures.contains(&"R_APP_018".to_string()));

        let mut rejected = create_test_record();
        rejected["decision"] = json!({"loan_approved": "no", "rejection_reason": " "});
        let failures = failed(&engine, &create_test_row(1, rejected));
        assert!(failures.contains(&"R_APP_016".to_string()));
        assert!(!failures.contains(&"R_APP_015".to_string()));
    }

    #[test]
    fn test_spending_rules() {
        let engine = RuleEngine::credit_applications();
        let flattened = Flattener::new(AttributeRegistry::credit_applications()).flatten(
            &RawRecord::new(
                0,
                json!({
                    "_id": "app_009",
                    "spending_behavior": [
                        { "category": "", "amount": "abc" },
                        { "category": "Rent", "amount": -10 }
                    ]
                }),
            ),
        );

        let eval = engine.evaluate(FieldScope::Spending, &flattened.spending_items);

        assert!(eval.rows[0].failed("R_SPN_001"));
        assert!(eval.rows[0].failed("R_SPN_002"));
        assert!(eval.rows[1].failed("R_SPN_003"));
        assert_eq!(eval.rows[1].item_index, Some(1));
        assert_eq!(eval.failure_count("R_SPN_002"), 1);
    }

    #[test]
    fn test_failed_by_row_keys_items_separately() {
        let engine = RuleEngine::credit_applications();
        let flattened = Flattener::new(AttributeRegistry::credit_applications()).flatten(
            &RawRecord::new(
                4,
                json!({
                    "_id": "app_004",
                    "spending_behavior": [
                        { "category": "Rent", "amount": 10 },
                        { "category": "Rent", "amount": -10 }
                    ]
                }),
            ),
        );

        let eval = engine.evaluate(FieldScope::Spending, &flattened.spending_items);
        let index = eval.failed_by_row();

        assert_eq!(index.len(), 2);
        assert!(index[&(4, Some(0))].is_empty());
        assert_eq!(index[&(4, Some(1))], ["R_SPN_003".to_string()]);
        assert!(index.get(&(4, None)).is_none());
    }

    #[test]
    fn test_private_ip_ranges() {
        assert!(is_private_ip("10.0.0.1"));
        assert!(is_private_ip("127.0.0.1"));
        assert!(is_private_ip("fd00::1"));
        assert!(!is_private_ip("8.8.8.8"));
        assert!(!is_private_ip("not an ip"));
    }

    #[test]
    fn test_add_rule_replaces_same_id() {
        let mut engine = RuleEngine::credit_applications();
        let before = engine.rule_count();
        let mut rule = engine.get("R_APP_019").unwrap().clone();
        rule.severity = Severity::High;

        engine.add_rule(rule);

        assert_eq!(engine.rule_count(), before);
        assert_eq!(engine.get("R_APP_019").unwrap().severity, Severity::High);
    }
}
