// ✅ Data Quality - Issue registry
// Aggregates rule failures, malformed records and uniqueness checks into one
// issue per rule id and stage, plus the before/after view and cleaning summary.

use crate::attributes::FieldScope;
use crate::cleaning::{CleanedRow, CleanedSpendingItem, Cleaner};
use crate::deduplication::{Classification, Resolution};
use crate::error::MalformedRecordError;
use crate::flatten::FlatRow;
use crate::rules::{RuleEngine, RuleEvaluation};
use crate::values::as_text;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// ISSUE ATTRIBUTES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pre,  // Evaluated against raw_* values
    Post, // Evaluated against clean_* values and cleaning flags
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Pre => "pre",
            Stage::Post => "post",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,   // Row is unusable or misleading for analysis
    Medium, // Row needs remediation or review
    Low,    // Cosmetic or format-level
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueGroup {
    Structure,
    Completeness,
    Validity,
    Consistency,
    #[serde(rename = "Cross-field logic")]
    CrossField,
    Privacy,
    Uniqueness,
    Remediation,
    Evaluation,
}

impl fmt::Display for IssueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IssueGroup::Structure => "Structure",
            IssueGroup::Completeness => "Completeness",
            IssueGroup::Validity => "Validity",
            IssueGroup::Consistency => "Consistency",
            IssueGroup::CrossField => "Cross-field logic",
            IssueGroup::Privacy => "Privacy",
            IssueGroup::Uniqueness => "Uniqueness",
            IssueGroup::Remediation => "Remediation",
            IssueGroup::Evaluation => "Evaluation",
        })
    }
}

// ============================================================================
// ISSUE
// ============================================================================

/// One aggregated finding. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub stage: Stage,
    pub rule_id: String,
    pub issue_group: IssueGroup,
    pub field_path: String,
    pub description: String,
    pub severity: Severity,
    pub count: usize,

    /// Rows the percentage is taken over
    pub denominator: usize,

    /// 0-100, two decimals
    pub percent: f64,
    pub example_application_ids: Vec<String>,
}

impl Issue {
    /// Flat form for CSV output; examples are pipe-joined
    pub fn to_record(&self) -> IssueRecord {
        IssueRecord {
            stage: self.stage.to_string(),
            rule_id: self.rule_id.clone(),
            issue_group: self.issue_group.to_string(),
            field_path: self.field_path.clone(),
            description: self.description.clone(),
            severity: self.severity.to_string(),
            count: self.count,
            denominator: self.denominator,
            percent: self.percent,
            example_application_ids: self.example_application_ids.join("|"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueRecord {
    pub stage: String,
    pub rule_id: String,
    pub issue_group: String,
    pub field_path: String,
    pub description: String,
    pub severity: String,
    pub count: usize,
    pub denominator: usize,
    pub percent: f64,
    pub example_application_ids: String,
}

/// `count / total` as a percentage rounded to two decimals; 0 for an empty denominator
pub fn percent_of(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// First `max` distinct ids, in the order given
pub fn example_ids<'a>(ids: impl IntoIterator<Item = &'a str>, max: usize) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(*id))
        .take(max)
        .map(str::to_string)
        .collect()
}

struct IssueBuilder {
    stage: Stage,
    denominator: usize,
    max_examples: usize,
}

impl IssueBuilder {
    #[allow(clippy::too_many_arguments)]
    fn issue<'a>(
        &self,
        rule_id: &str,
        issue_group: IssueGroup,
        field_path: &str,
        description: &str,
        severity: Severity,
        count: usize,
        examples: impl IntoIterator<Item = &'a str>,
    ) -> Issue {
        Issue {
            stage: self.stage,
            rule_id: rule_id.to_string(),
            issue_group,
            field_path: field_path.to_string(),
            description: description.to_string(),
            severity,
            count,
            denominator: self.denominator,
            percent: percent_of(count, self.denominator),
            example_application_ids: example_ids(examples, self.max_examples),
        }
    }
}

// ============================================================================
// ISSUE SOURCES
// ============================================================================

/// One issue per catalog rule of the evaluated scope (zero counts included),
/// plus one diagnostic issue per rule whose predicate errored.
pub fn rule_issues(engine: &RuleEngine, evaluation: &RuleEvaluation, max_examples: usize) -> Vec<Issue> {
    let builder = IssueBuilder {
        stage: evaluation.stage,
        denominator: evaluation.total_rows(),
        max_examples,
    };

    let mut issues = Vec::new();
    for rule in engine.rules_in(evaluation.scope) {
        let failures: Vec<&str> = evaluation
            .failures(&rule.id)
            .map(|r| r.application_id.as_str())
            .collect();
        issues.push(builder.issue(
            &rule.id,
            rule.issue_group,
            &rule.field_path,
            &rule.description,
            rule.severity,
            failures.len(),
            failures.iter().copied(),
        ));

        let errors: Vec<_> = evaluation.errors_for(&rule.id).collect();
        if let Some(first) = errors.first() {
            let rows: BTreeSet<usize> = errors.iter().map(|e| e.row_id).collect();
            issues.push(builder.issue(
                &evaluation_issue_id(&rule.id),
                IssueGroup::Evaluation,
                &rule.field_path,
                &format!("Rule could not be evaluated for some rows: {}", first.source),
                rule.severity,
                rows.len(),
                errors.iter().map(|e| e.application_id.as_str()),
            ));
        }
    }
    issues
}

/// Id of the diagnostic issue raised when a rule's predicate errors
pub fn evaluation_issue_id(rule_id: &str) -> String {
    format!("{}_EVAL", rule_id)
}

pub const MALFORMED_RECORD_RULE_ID: &str = "R_FLAT_001";

/// Pre-stage structural issue over malformed records
pub fn malformed_record_issue(
    errors: &[MalformedRecordError],
    total_rows: usize,
    max_examples: usize,
) -> Issue {
    let builder = IssueBuilder {
        stage: Stage::Pre,
        denominator: total_rows,
        max_examples,
    };
    let rows: BTreeSet<usize> = errors.iter().map(|e| e.row_id).collect();
    builder.issue(
        MALFORMED_RECORD_RULE_ID,
        IssueGroup::Structure,
        "record",
        "Record is not shaped as expected; affected fields were nulled.",
        Severity::High,
        rows.len(),
        errors.iter().map(|e| e.application_id.as_str()),
    )
}

/// Cross-row uniqueness checks. Counts do not depend on the stage.
pub fn uniqueness_issues(
    stage: Stage,
    rows: &[FlatRow],
    resolution: &Resolution,
    max_examples: usize,
) -> Vec<Issue> {
    let builder = IssueBuilder {
        stage,
        denominator: rows.len(),
        max_examples,
    };
    let mut issues = Vec::new();

    let duplicated: Vec<&str> = resolution
        .rows
        .iter()
        .filter(|r| r.is_duplicate_id)
        .map(|r| r.application_id.as_str())
        .collect();
    issues.push(builder.issue(
        "R_DUP_001",
        IssueGroup::Uniqueness,
        "_id",
        "Rows with duplicated application_id values.",
        Severity::High,
        duplicated.len(),
        duplicated.iter().copied(),
    ));

    issues.push(builder.issue(
        "R_DUP_002",
        IssueGroup::Uniqueness,
        "_id",
        "Distinct application_id values that are duplicated.",
        Severity::High,
        resolution.groups.len(),
        resolution.groups.iter().map(|g| g.application_id.as_str()),
    ));

    // SSN per row, then SSN → (row count, distinct application ids)
    let path = "applicant_info.ssn";
    let ssns: Vec<Option<String>> = rows
        .iter()
        .map(|row| as_text(path, row.raw(path)).ok().flatten())
        .collect();
    let mut by_ssn: BTreeMap<&str, (usize, BTreeSet<&str>)> = BTreeMap::new();
    for (row, ssn) in rows.iter().zip(&ssns) {
        if let Some(ssn) = ssn {
            let entry = by_ssn.entry(ssn.as_str()).or_default();
            entry.0 += 1;
            entry.1.insert(row.application_id.as_str());
        }
    }

    let repeated: BTreeSet<&str> = by_ssn
        .iter()
        .filter(|(_, (count, _))| *count > 1)
        .map(|(ssn, _)| *ssn)
        .collect();
    let repeated_rows = rows_with_ssn(rows, &ssns, &repeated);
    issues.push(builder.issue(
        "R_DUP_003",
        IssueGroup::Uniqueness,
        "applicant_info.ssn",
        "Rows where SSN repeats across one or more records.",
        Severity::High,
        repeated_rows.len(),
        repeated_rows.iter().copied(),
    ));

    let shared: BTreeSet<&str> = by_ssn
        .iter()
        .filter(|(_, (_, ids))| ids.len() > 1)
        .map(|(ssn, _)| *ssn)
        .collect();
    let shared_rows = rows_with_ssn(rows, &ssns, &shared);
    issues.push(builder.issue(
        "R_DUP_004",
        IssueGroup::Uniqueness,
        "applicant_info.ssn",
        "Distinct SSN values that appear across different application IDs.",
        Severity::High,
        shared.len(),
        shared_rows.iter().copied(),
    ));

    let conflicts: Vec<&str> = resolution
        .groups_with(Classification::Conflict)
        .map(|g| g.application_id.as_str())
        .collect();
    issues.push(builder.issue(
        "R_DUP_CONFLICT",
        IssueGroup::Uniqueness,
        "_id",
        "Duplicated application IDs classified as conflicts.",
        Severity::High,
        conflicts.len(),
        conflicts.iter().copied(),
    ));

    issues.push(builder.issue(
        "R_DUP_CANONICAL",
        IssueGroup::Remediation,
        "_id",
        "Canonical application rows retained for downstream analysis.",
        Severity::Medium,
        resolution.canonical.len(),
        resolution.canonical.keys().map(String::as_str),
    ));

    issues
}

/// Application ids of the rows whose SSN is in `wanted`, in row order
fn rows_with_ssn<'a>(rows: &'a [FlatRow], ssns: &[Option<String>], wanted: &BTreeSet<&str>) -> Vec<&'a str> {
    rows.iter()
        .zip(ssns)
        .filter(|(_, ssn)| ssn.as_deref().map_or(false, |s| wanted.contains(s)))
        .map(|(row, _)| row.application_id.as_str())
        .collect()
}

/// Stable report order: stage, then rule id
pub fn sort_issues(issues: &mut [Issue]) {
    issues.sort_by(|a, b| (a.stage, &a.rule_id).cmp(&(b.stage, &b.rule_id)));
}

// ============================================================================
// ISSUE REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueReport {
    pub stage: Stage,
    pub issues: Vec<Issue>,
}

impl IssueReport {
    pub fn new(stage: Stage, mut issues: Vec<Issue>) -> Self {
        sort_issues(&mut issues);
        IssueReport { stage, issues }
    }

    pub fn get(&self, rule_id: &str) -> Option<&Issue> {
        self.issues.iter().find(|i| i.rule_id == rule_id)
    }

    /// Issues with at least one affected row
    pub fn open_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.count > 0)
    }

    pub fn summary(&self) -> String {
        format!(
            "Stage {}: {} rules checked, {} with findings ({} high severity)",
            self.stage,
            self.issues.len(),
            self.open_issues().count(),
            self.open_issues()
                .filter(|i| i.severity == Severity::High)
                .count()
        )
    }
}

// ============================================================================
// BEFORE / AFTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageComparison {
    pub rule_id: String,
    pub issue_group: String,
    pub severity: String,
    pub description: String,
    pub pre_count: Option<usize>,
    pub pre_percent: Option<f64>,
    pub post_count: Option<usize>,
    pub post_percent: Option<f64>,

    /// post − pre, when both stages report the rule
    pub delta_count: Option<i64>,
}

/// Join pre and post issues on rule id
pub fn compare_stages(pre: &IssueReport, post: &IssueReport) -> Vec<StageComparison> {
    let mut by_rule: BTreeMap<&str, (Option<&Issue>, Option<&Issue>)> = BTreeMap::new();
    for issue in &pre.issues {
        by_rule.entry(issue.rule_id.as_str()).or_default().0 = Some(issue);
    }
    for issue in &post.issues {
        by_rule.entry(issue.rule_id.as_str()).or_default().1 = Some(issue);
    }

    by_rule
        .into_iter()
        .filter_map(|(rule_id, (before, after))| {
            let meta = before.or(after)?;
            Some(StageComparison {
                rule_id: rule_id.to_string(),
                issue_group: meta.issue_group.to_string(),
                severity: meta.severity.to_string(),
                description: meta.description.clone(),
                pre_count: before.map(|i| i.count),
                pre_percent: before.map(|i| i.percent),
                post_count: after.map(|i| i.count),
                post_percent: after.map(|i| i.percent),
                delta_count: match (before, after) {
                    (Some(b), Some(a)) => Some(a.count as i64 - b.count as i64),
                    _ => None,
                },
            })
        })
        .collect()
}

// ============================================================================
// CLEANING SUMMARY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleaningSummary {
    pub action_id: String,
    pub field_path: String,
    pub flag: String,
    pub description: String,
    pub rows_flagged: usize,
    pub total_rows: usize,
    pub percent: f64,
}

/// Rows per flag column, for every flag the catalog can fire (zero counts included)
pub fn summarise_cleaning(
    cleaner: &Cleaner,
    rows: &[CleanedRow],
    items: &[CleanedSpendingItem],
) -> Vec<CleaningSummary> {
    let mut summary = Vec::new();
    for rule in cleaner.rules() {
        for flag in rule.flag_names() {
            let (flagged, total) = match rule.scope {
                FieldScope::Application => {
                    (rows.iter().filter(|r| r.flag(&flag)).count(), rows.len())
                }
                FieldScope::Spending => {
                    (items.iter().filter(|i| i.flag(&flag)).count(), items.len())
                }
            };
            summary.push(CleaningSummary {
                action_id: rule.action_id.clone(),
                field_path: rule.field_path.clone(),
                flag,
                description: rule.description.clone(),
                rows_flagged: flagged,
                total_rows: total,
                percent: percent_of(flagged, total),
            });
        }
    }
    summary
}
