// 🧹 Cleaner - raw_* → clean_* with a flag for every transform that fired
//
// Transforms are pure and row-local. Re-cleaning a cleaned value yields the same
// value and fires nothing. Raw values are never touched.

use crate::attributes::FieldScope;
use crate::flatten::{FlatRow, SpendingItemRow};
use crate::temporal::{format_timestamp, parse_date_of_birth, parse_timestamp, DobParse};
use crate::values::{as_bool, as_f64, as_text, is_blank, number_value, NULL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Flag names other components read
pub const DOB_AMBIGUOUS_FLAG: &str = "dob_ambiguous_flag";
pub const ANNUAL_INCOME_REMAPPED_FLAG: &str = "annual_income_remapped_flag";
pub const ANNUAL_INCOME_INVALID_FLAG: &str = "annual_income_invalid_flag";
pub const AMOUNT_INVALID_FLAG: &str = "amount_invalid_flag";

// ============================================================================
// TRANSFORMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    /// Value was rewritten into canonical form
    Standardized,
    /// NN/NN/YYYY date resolved by the month-first convention
    Ambiguous,
    /// Date/timestamp could not be parsed and was nulled
    ParseFailed,
    /// Canonical field was filled from an alias field
    Remapped,
    /// Value present but unusable (wrong type or not coercible), nulled
    Invalid,
    /// Value outside its declared valid range, nulled
    Nullified,
}

impl FlagKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            FlagKind::Standardized => "standardized",
            FlagKind::Ambiguous => "ambiguous",
            FlagKind::ParseFailed => "parse_failed",
            FlagKind::Remapped => "remapped",
            FlagKind::Invalid => "invalid",
            FlagKind::Nullified => "nullified",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: Option<f64>,
    pub max: Option<f64>,

    /// Validation rule that the out-of-range value violates
    pub rule_id: String,
}

impl ValidRange {
    pub fn contains(&self, v: f64) -> bool {
        self.min.map_or(true, |min| v >= min) && self.max.map_or(true, |max| v <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    /// Trim, optionally lowercase
    Text { lowercase: bool },
    /// Trim and title-case each word
    TitleCase,
    /// m/male → Male, f/female → Female
    Gender,
    DateOfBirth,
    Timestamp,
    Numeric {
        integer: bool,
        range: Option<ValidRange>,
    },
    Boolean,
    /// Numeric, filled from `alias` when the canonical field is blank
    NumericWithAlias { alias: String },
}

impl Transform {
    pub fn flag_kinds(&self) -> Vec<FlagKind> {
        use FlagKind::*;
        match self {
            Transform::Text { .. } | Transform::TitleCase | Transform::Gender => {
                vec![Standardized, Invalid]
            }
            Transform::DateOfBirth => vec![Standardized, Ambiguous, ParseFailed],
            Transform::Timestamp => vec![Standardized, ParseFailed],
            Transform::Numeric { range: Some(_), .. } => vec![Invalid, Nullified],
            Transform::Numeric { range: None, .. } | Transform::Boolean => vec![Invalid],
            Transform::NumericWithAlias { .. } => vec![Remapped, Invalid],
        }
    }

    /// Validation rule referenced by a range nullification
    pub fn range_rule_id(&self) -> Option<&str> {
        match self {
            Transform::Numeric { range: Some(r), .. } => Some(r.rule_id.as_str()),
            _ => None,
        }
    }

    /// Other field paths this transform reads
    pub fn alias_path(&self) -> Option<&str> {
        match self {
            Transform::NumericWithAlias { alias } => Some(alias.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Outcome {
    value: Value,
    fired: Vec<FlagKind>,
    /// Path the value was taken from, when a remap is possible
    source: Option<String>,
}

impl Outcome {
    fn value(value: Value) -> Self {
        Outcome { value, fired: Vec::new(), source: None }
    }

    fn nulled(kind: FlagKind) -> Self {
        Outcome { value: Value::Null, fired: vec![kind], source: None }
    }

    fn standardized_if(mut self, changed: bool) -> Self {
        if changed {
            self.fired.push(FlagKind::Standardized);
        }
        self
    }
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_alpha = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// True when `cleaned` is not literally the string already held in `original`
fn rewritten(original: &Value, cleaned: &str) -> bool {
    original.as_str() != Some(cleaned)
}

fn apply_numeric(field_path: &str, value: &Value, integer: bool, range: Option<&ValidRange>) -> Outcome {
    let parsed = match as_f64(field_path, value) {
        Ok(p) => p,
        Err(_) => return Outcome::nulled(FlagKind::Invalid),
    };

    let Some(mut v) = parsed else {
        return if is_blank(value) {
            Outcome::value(Value::Null)
        } else {
            Outcome::nulled(FlagKind::Invalid)
        };
    };

    if let Some(range) = range {
        if !range.contains(v) {
            return Outcome::nulled(FlagKind::Nullified);
        }
    }
    if integer {
        v = v.round();
    }
    Outcome::value(number_value(v))
}

fn apply_transform<'a>(
    transform: &Transform,
    field_path: &str,
    value: &'a Value,
    lookup: &dyn Fn(&str) -> &'a Value,
) -> Outcome {
    match transform {
        Transform::Text { lowercase } => match as_text(field_path, value) {
            Err(_) => Outcome::nulled(FlagKind::Invalid),
            Ok(None) => Outcome::value(Value::Null),
            Ok(Some(text)) => {
                let out = if *lowercase { text.to_lowercase() } else { text };
                let changed = rewritten(value, &out);
                Outcome::value(Value::String(out)).standardized_if(changed)
            }
        },

        Transform::TitleCase => match as_text(field_path, value) {
            Err(_) => Outcome::nulled(FlagKind::Invalid),
            Ok(None) => Outcome::value(Value::Null),
            Ok(Some(text)) => {
                let out = title_case(&text);
                let changed = rewritten(value, &out);
                Outcome::value(Value::String(out)).standardized_if(changed)
            }
        },

        Transform::Gender => match as_text(field_path, value) {
            Err(_) => Outcome::nulled(FlagKind::Invalid),
            Ok(None) => Outcome::value(Value::Null),
            Ok(Some(text)) => {
                let canonical = match text.to_lowercase().as_str() {
                    "m" | "male" => "Male",
                    "f" | "female" => "Female",
                    _ => return Outcome::nulled(FlagKind::Invalid),
                };
                Outcome::value(Value::String(canonical.to_string()))
                    .standardized_if(rewritten(value, canonical))
            }
        },

        Transform::DateOfBirth => match as_text(field_path, value) {
            Err(_) => Outcome::nulled(FlagKind::ParseFailed),
            Ok(None) => Outcome::value(Value::Null),
            Ok(Some(text)) => match parse_date_of_birth(&text) {
                DobParse::Parsed { date, ambiguous, .. } => {
                    let iso = date.format("%Y-%m-%d").to_string();
                    let changed = rewritten(value, &iso);
                    let mut out = Outcome::value(Value::String(iso)).standardized_if(changed);
                    if ambiguous {
                        out.fired.push(FlagKind::Ambiguous);
                    }
                    out
                }
                DobParse::Missing => Outcome::value(Value::Null),
                DobParse::Failed => Outcome::nulled(FlagKind::ParseFailed),
            },
        },

        Transform::Timestamp => match as_text(field_path, value) {
            Err(_) => Outcome::nulled(FlagKind::ParseFailed),
            Ok(None) => Outcome::value(Value::Null),
            Ok(Some(text)) => match parse_timestamp(&text) {
                Some(ts) => {
                    let rendered = format_timestamp(&ts);
                    let changed = rewritten(value, &rendered);
                    Outcome::value(Value::String(rendered)).standardized_if(changed)
                }
                None => Outcome::nulled(FlagKind::ParseFailed),
            },
        },

        Transform::Numeric { integer, range } => {
            apply_numeric(field_path, value, *integer, range.as_ref())
        }

        Transform::Boolean => match as_bool(field_path, value) {
            Ok(Some(b)) => Outcome::value(Value::Bool(b)),
            Ok(None) if is_blank(value) => Outcome::value(Value::Null),
            _ => Outcome::nulled(FlagKind::Invalid),
        },

        Transform::NumericWithAlias { alias } => {
            let alias_value = lookup(alias);
            let (selected, source, remapped) = if is_blank(value) && !is_blank(alias_value) {
                (alias_value, alias.as_str(), true)
            } else {
                (value, field_path, false)
            };

            let mut out = apply_numeric(source, selected, false, None);
            if !is_blank(selected) {
                out.source = Some(source.to_string());
            }
            if remapped {
                out.fired.insert(0, FlagKind::Remapped);
            }
            out
        }
    }
}

// ============================================================================
// CLEANING CATALOG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleaningRule {
    /// Stable action id (e.g. "A_CLEAN_004")
    pub action_id: String,
    pub scope: FieldScope,
    pub field_path: String,

    /// Output column (e.g. "clean_date_of_birth")
    pub column: String,

    /// Flag columns are named `<stem>_<kind>_flag`
    pub flag_stem: String,
    pub transform: Transform,
    pub description: String,
}

impl CleaningRule {
    pub fn new(
        action_id: &str,
        field_path: &str,
        column: &str,
        flag_stem: &str,
        transform: Transform,
        description: &str,
    ) -> Self {
        let scope = if field_path.starts_with(crate::attributes::SPENDING_PREFIX) {
            FieldScope::Spending
        } else {
            FieldScope::Application
        };
        CleaningRule {
            action_id: action_id.to_string(),
            scope,
            field_path: field_path.to_string(),
            column: column.to_string(),
            flag_stem: flag_stem.to_string(),
            transform,
            description: description.to_string(),
        }
    }

    pub fn flag_name(&self, kind: FlagKind) -> String {
        format!("{}_{}_flag", self.flag_stem, kind.suffix())
    }

    pub fn flag_names(&self) -> Vec<String> {
        self.transform
            .flag_kinds()
            .into_iter()
            .map(|k| self.flag_name(k))
            .collect()
    }
}

fn range(min: Option<f64>, max: Option<f64>, rule_id: &str) -> Option<ValidRange> {
    Some(ValidRange { min, max, rule_id: rule_id.to_string() })
}

pub fn default_cleaning_catalog() -> Vec<CleaningRule> {
    use Transform as T;
    vec![
        CleaningRule::new("A_CLEAN_001", "processing_timestamp", "clean_processing_timestamp", "processing_timestamp",
            T::Timestamp, "Processing timestamp normalised to UTC ISO-8601"),
        CleaningRule::new("A_CLEAN_002", "applicant_info.email", "clean_email", "email",
            T::Text { lowercase: true }, "Email trimmed and lowercased"),
        CleaningRule::new("A_CLEAN_003", "applicant_info.gender", "clean_gender", "gender",
            T::Gender, "Gender mapped to Male/Female"),
        CleaningRule::new("A_CLEAN_004", "applicant_info.date_of_birth", "clean_date_of_birth", "dob",
            T::DateOfBirth, "DOB parsed to YYYY-MM-DD (NN/NN/YYYY read month-first)"),
        CleaningRule::new("A_CLEAN_005", "applicant_info.zip_code", "clean_zip_code", "zip_code",
            T::Text { lowercase: false }, "Zip code trimmed"),
        CleaningRule::new("A_CLEAN_006", "financials.annual_income", "clean_annual_income", "annual_income",
            T::NumericWithAlias { alias: "financials.annual_salary".to_string() },
            "annual_salary mapped into clean_annual_income when annual_income is blank"),
        CleaningRule::new("A_CLEAN_007", "financials.credit_history_months", "clean_credit_history_months", "credit_history",
            T::Numeric { integer: true, range: range(Some(0.0), None, "R_APP_012") },
            "Negative credit_history_months nullified"),
        CleaningRule::new("A_CLEAN_008", "financials.debt_to_income", "clean_debt_to_income", "dti",
            T::Numeric { integer: false, range: range(Some(0.0), Some(1.0), "R_APP_014") },
            "Out-of-range debt_to_income nullified"),
        CleaningRule::new("A_CLEAN_009", "financials.savings_balance", "clean_savings_balance", "savings",
            T::Numeric { integer: false, range: range(Some(0.0), None, "R_APP_013") },
            "Negative savings_balance nullified"),
        CleaningRule::new("A_CLEAN_010", "decision.loan_approved", "clean_loan_approved", "loan_approved",
            T::Boolean, "Loan decision coerced to boolean"),
        CleaningRule::new("A_CLEAN_011", "decision.interest_rate", "clean_interest_rate", "interest_rate",
            T::Numeric { integer: false, range: None }, "Interest rate coerced to numeric"),
        CleaningRule::new("A_CLEAN_012", "decision.approved_amount", "clean_approved_amount", "approved_amount",
            T::Numeric { integer: false, range: None }, "Approved amount coerced to numeric"),
        CleaningRule::new("A_CLEAN_013", "decision.rejection_reason", "clean_rejection_reason", "rejection_reason",
            T::Text { lowercase: false }, "Rejection reason trimmed"),
        CleaningRule::new("A_SPN_001", "spending_behavior[].category", "clean_category", "category",
            T::TitleCase, "Spending category trimmed and title-cased"),
        CleaningRule::new("A_SPN_002", "spending_behavior[].amount", "clean_amount", "amount",
            T::Numeric { integer: false, range: range(Some(0.0), None, "R_SPN_003") },
            "Negative spending amount nullified"),
    ]
}

// ============================================================================
// CLEANED ROWS
// ============================================================================

/// One fired transform, with the value before and after
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleaningAction {
    pub action_id: String,
    pub field_path: String,
    pub flag: String,
    /// Validation rule behind a range nullification
    pub rule_id: Option<String>,
    pub before: Value,
    pub after: Value,
}

/// Shared result of running a catalog over one row
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CleanedFields {
    /// Field path → clean value
    pub clean: BTreeMap<String, Value>,
    /// Flag column → fired
    pub flags: BTreeMap<String, bool>,
    /// Field path → path the clean value came from
    pub sources: BTreeMap<String, String>,
    pub actions: Vec<CleaningAction>,
}

impl CleanedFields {
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn fired_flags(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().filter(|(_, f)| **f).map(|(k, _)| k.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedRow {
    pub flat: FlatRow,
    pub fields: CleanedFields,
}

impl CleanedRow {
    pub fn clean(&self, path: &str) -> Option<&Value> {
        self.fields.clean.get(path)
    }

    /// Clean value when the path is cleaned, raw value otherwise
    pub fn value(&self, path: &str) -> &Value {
        self.clean(path).unwrap_or_else(|| self.flat.raw(path))
    }

    pub fn flag(&self, name: &str) -> bool {
        self.fields.flag(name)
    }

    /// The row as if its clean values were raw; re-cleaning this is a no-op
    pub fn as_flat(&self) -> FlatRow {
        let mut flat = self.flat.clone();
        for (path, value) in &self.fields.clean {
            flat.raw.insert(path.clone(), value.clone());
        }
        flat
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedSpendingItem {
    pub item: SpendingItemRow,
    pub fields: CleanedFields,
}

impl CleanedSpendingItem {
    pub fn clean(&self, path: &str) -> Option<&Value> {
        self.fields.clean.get(path)
    }

    pub fn value(&self, path: &str) -> &Value {
        self.clean(path).unwrap_or_else(|| self.item.raw(path))
    }

    pub fn flag(&self, name: &str) -> bool {
        self.fields.flag(name)
    }

    pub fn as_item(&self) -> SpendingItemRow {
        let mut item = self.item.clone();
        for (path, value) in &self.fields.clean {
            item.raw.insert(path.clone(), value.clone());
        }
        item
    }
}

// ============================================================================
// CLEANER
// ============================================================================

pub struct Cleaner {
    rules: Vec<CleaningRule>,
}

impl Cleaner {
    pub fn new(rules: Vec<CleaningRule>) -> Self {
        Cleaner { rules }
    }

    pub fn credit_applications() -> Self {
        Self::new(default_cleaning_catalog())
    }

    pub fn rules(&self) -> &[CleaningRule] {
        &self.rules
    }

    pub fn rules_in(&self, scope: FieldScope) -> impl Iterator<Item = &CleaningRule> {
        self.rules.iter().filter(move |r| r.scope == scope)
    }

    /// Every flag column a cleaned row of `scope` carries, in catalog order
    pub fn flag_columns(&self, scope: FieldScope) -> Vec<String> {
        self.rules_in(scope).flat_map(|r| r.flag_names()).collect()
    }

    pub fn clean_row(&self, row: &FlatRow) -> CleanedRow {
        let lookup = |path: &str| row.raw(path);
        CleanedRow {
            flat: row.clone(),
            fields: self.run(FieldScope::Application, &lookup),
        }
    }

    pub fn clean_spending_item(&self, item: &SpendingItemRow) -> CleanedSpendingItem {
        let lookup = |path: &str| item.raw(path);
        CleanedSpendingItem {
            item: item.clone(),
            fields: self.run(FieldScope::Spending, &lookup),
        }
    }

    fn run<'a>(&self, scope: FieldScope, lookup: &dyn Fn(&str) -> &'a Value) -> CleanedFields {
        let mut fields = CleanedFields::default();

        for rule in self.rules_in(scope) {
            let before = lookup(&rule.field_path);
            let outcome = apply_transform(&rule.transform, &rule.field_path, before, lookup);

            for name in rule.flag_names() {
                fields.flags.insert(name, false);
            }
            for kind in &outcome.fired {
                let flag = rule.flag_name(*kind);
                fields.flags.insert(flag.clone(), true);
                let before = match (kind, outcome.source.as_deref()) {
                    (FlagKind::Remapped, Some(source)) => lookup(source),
                    _ => before,
                };
                fields.actions.push(CleaningAction {
                    action_id: rule.action_id.clone(),
                    field_path: rule.field_path.clone(),
                    flag,
                    rule_id: match kind {
                        FlagKind::Nullified => rule.transform.range_rule_id().map(str::to_string),
                        _ => None,
                    },
                    before: before.clone(),
                    after: outcome.value.clone(),
                });
            }
            if let Some(source) = outcome.source {
                fields.sources.insert(rule.field_path.clone(), source);
            }
            fields.clean.insert(rule.field_path.clone(), outcome.value);
        }

        fields
    }
}

impl Default for Cleaner {
    fn default() -> Self {
        Self::credit_applications()
    }
}

/// Null-safe accessor used where a path may have no clean column
pub fn clean_or_null<'a>(fields: &'a CleanedFields, path: &str) -> &'a Value {
    fields.clean.get(path).unwrap_or(&NULL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeRegistry;
    use crate::flatten::{Flattener, RawRecord};
    use serde_json::json;

    fn create_test_row(value: Value) -> FlatRow {
        Flattener::new(AttributeRegistry::credit_applications())
            .flatten(&RawRecord::new(1, value))
            .row
    }

    fn create_test_record() -> Value {
        json!({
            "_id": "app_001",
            "processing_timestamp": "2024-01-02 08:00:00",
            "applicant_info": {
                "full_name": "Jane Doe",
                "email": "  Jane@Example.COM ",
                "gender": "f",
                "date_of_birth": "05/07/1990",
                "zip_code": " 10001 "
            },
            "financials": {
                "annual_salary": "52000",
                "credit_history_months": -3,
                "debt_to_income": 1.4,
                "savings_balance": "1200.50"
            },
            "decision": {
                "loan_approved": "yes",
                "interest_rate": "abc",
                "rejection_reason": " "
            },
            "spending_behavior": [
                { "category": "FAST food", "amount": "-20" },
                { "category": null, "amount": "lots" }
            ]
        })
    }

    #[test]
    fn test_dob_ambiguity_flagged() {
        let cleaned = Cleaner::credit_applications().clean_row(&create_test_row(create_test_record()));

        assert_eq!(cleaned.clean("applicant_info.date_of_birth"), Some(&json!("1990-05-07")));
        assert!(cleaned.flag(DOB_AMBIGUOUS_FLAG));
        assert!(cleaned.flag("dob_standardized_flag"));
        assert!(!cleaned.flag("dob_parse_failed_flag"));
    }

    #[test]
    fn test_range_nullification_keeps_raw() {
        let cleaned = Cleaner::credit_applications().clean_row(&create_test_row(create_test_record()));

        assert_eq!(cleaned.clean("financials.debt_to_income"), Some(&Value::Null));
        assert!(cleaned.flag("dti_nullified_flag"));
        assert_eq!(cleaned.flat.raw("financials.debt_to_income"), &json!(1.4));

        let action = cleaned
            .fields
            .actions
            .iter()
            .find(|a| a.flag == "dti_nullified_flag")
            .unwrap();
        assert_eq!(action.rule_id.as_deref(), Some("R_APP_014"));
        assert_eq!(action.before, json!(1.4));
        assert_eq!(action.after, Value::Null);

        assert_eq!(cleaned.clean("financials.credit_history_months"), Some(&Value::Null));
        assert!(cleaned.flag("credit_history_nullified_flag"));
    }

    #[test]
    fn test_alias_remap_records_source() {
        let cleaned = Cleaner::credit_applications().clean_row(&create_test_row(create_test_record()));

        assert_eq!(cleaned.clean("financials.annual_income"), Some(&json!(52000)));
        assert!(cleaned.flag(ANNUAL_INCOME_REMAPPED_FLAG));
        assert_eq!(
            cleaned.fields.sources.get("financials.annual_income").map(String::as_str),
            Some("financials.annual_salary")
        );
    }

    #[test]
    fn test_alias_never_overwrites_present_value() {
        let row = create_test_row(json!({
            "_id": "app_002",
            "financials": { "annual_income": 40000, "annual_salary": 52000 }
        }));
        let cleaned = Cleaner::credit_applications().clean_row(&row);

        assert_eq!(cleaned.clean("financials.annual_income"), Some(&json!(40000)));
        assert!(!cleaned.flag(ANNUAL_INCOME_REMAPPED_FLAG));
        assert_eq!(
            cleaned.fields.sources.get("financials.annual_income").map(String::as_str),
            Some("financials.annual_income")
        );
    }

    #[test]
    fn test_text_and_categorical_normalisation() {
        let cleaned = Cleaner::credit_applications().clean_row(&create_test_row(create_test_record()));

        assert_eq!(cleaned.clean("applicant_info.email"), Some(&json!("jane@example.com")));
        assert_eq!(cleaned.clean("applicant_info.gender"), Some(&json!("Female")));
        assert_eq!(cleaned.clean("applicant_info.zip_code"), Some(&json!("10001")));
        assert_eq!(cleaned.clean("decision.loan_approved"), Some(&json!(true)));
        assert_eq!(cleaned.clean("decision.interest_rate"), Some(&Value::Null));
        assert!(cleaned.flag("interest_rate_invalid_flag"));
        assert_eq!(cleaned.clean("decision.rejection_reason"), Some(&Value::Null));
        assert!(!cleaned.flag("rejection_reason_standardized_flag"));
        assert_eq!(
            cleaned.clean("processing_timestamp"),
            Some(&json!("2024-01-02T08:00:00Z"))
        );
        assert_eq!(cleaned.clean("financials.savings_balance"), Some(&json!(1200.5)));
    }

    #[test]
    fn test_every_flag_column_present() {
        let cleaner = Cleaner::credit_applications();
        let cleaned = cleaner.clean_row(&create_test_row(json!({"_id": "sparse"})));

        let expected = cleaner.flag_columns(FieldScope::Application);
        assert_eq!(cleaned.fields.flags.len(), expected.len());
        assert!(cleaned.fields.flags.values().all(|f| !f));
        assert!(cleaned.fields.actions.is_empty());
    }

    #[test]
    fn test_cleaning_is_idempotent() {
        let cleaner = Cleaner::credit_applications();
        let first = cleaner.clean_row(&create_test_row(create_test_record()));
        let second = cleaner.clean_row(&first.as_flat());

        assert_eq!(first.fields.clean, second.fields.clean);
        assert_eq!(second.fields.fired_flags().count(), 0);
        assert!(second.fields.actions.is_empty());
    }

    #[test]
    fn test_spending_cleaning_and_idempotency() {
        let cleaner = Cleaner::credit_applications();
        let flattened = Flattener::new(AttributeRegistry::credit_applications())
            .flatten(&RawRecord::new(1, create_test_record()));

        let first = cleaner.clean_spending_item(&flattened.spending_items[0]);
        assert_eq!(first.clean("spending_behavior[].category"), Some(&json!("Fast Food")));
        assert_eq!(first.clean("spending_behavior[].amount"), Some(&Value::Null));
        assert!(first.flag("amount_nullified_flag"));

        let invalid = cleaner.clean_spending_item(&flattened.spending_items[1]);
        assert!(invalid.flag(AMOUNT_INVALID_FLAG));
        assert_eq!(invalid.clean("spending_behavior[].category"), Some(&Value::Null));

        let again = cleaner.clean_spending_item(&first.as_item());
        assert_eq!(again.fields.clean, first.fields.clean);
        assert_eq!(again.fields.fired_flags().count(), 0);
    }

    #[test]
    fn test_unparseable_dob_and_timestamp_nulled() {
        let row = create_test_row(json!({
            "_id": "app_003",
            "processing_timestamp": "last tuesday",
            "applicant_info": { "date_of_birth": "31/31/1990", "gender": "x" }
        }));
        let cleaned = Cleaner::credit_applications().clean_row(&row);

        assert_eq!(cleaned.clean("applicant_info.date_of_birth"), Some(&Value::Null));
        assert!(cleaned.flag("dob_parse_failed_flag"));
        assert_eq!(cleaned.clean("processing_timestamp"), Some(&Value::Null));
        assert!(cleaned.flag("processing_timestamp_parse_failed_flag"));
        assert_eq!(cleaned.clean("applicant_info.gender"), Some(&Value::Null));
        assert!(cleaned.flag("gender_invalid_flag"));
    }

    #[test]
    fn test_integer_rounding_and_clean_or_null() {
        let row = create_test_row(json!({
            "_id": "app_004",
            "financials": { "credit_history_months": "12.4" }
        }));
        let cleaned = Cleaner::credit_applications().clean_row(&row);

        assert_eq!(cleaned.clean("financials.credit_history_months"), Some(&json!(12)));
        assert_eq!(clean_or_null(&cleaned.fields, "nope"), &Value::Null);
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("fast food"), "Fast Food");
        assert_eq!(title_case("SELF-CARE"), "Self-Care");
    }
}
