// 💾 CSV Export - Tables and reports to disk
// Every file is rendered in memory first, then written into a staging directory
// next to the output directory. Files only move into place once all of them
// were written.

use crate::assembly::{Datasets, PiiInventoryRecord, Table};
use crate::attributes::FieldScope;
use crate::cleaning::Cleaner;
use crate::data_quality::{CleaningSummary, IssueRecord, StageComparison};
use crate::deduplication::DuplicateGroup;
use crate::error::{PipelineError, Result};
use crate::pipeline::PipelineOutput;
use crate::rules::RuleEngine;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const ISSUE_REPORT: &str = "issue_report.csv";
pub const DUPLICATE_REPORT: &str = "duplicate_report.csv";
pub const COMPARISON_REPORT: &str = "before_after_comparison.csv";
pub const CLEANING_REPORT: &str = "cleaning_summary.csv";
pub const RULE_CATALOG: &str = "rule_catalog.csv";
pub const CLEANING_CATALOG: &str = "cleaning_catalog.csv";
pub const PII_INVENTORY: &str = "pii_inventory.csv";

// ============================================================================
// REPORT RECORDS
// ============================================================================

/// Column names of a report record, written even when the report is empty
pub trait CsvHeader {
    const HEADERS: &'static [&'static str];
}

impl CsvHeader for IssueRecord {
    const HEADERS: &'static [&'static str] = &[
        "stage",
        "rule_id",
        "issue_group",
        "field_path",
        "description",
        "severity",
        "count",
        "denominator",
        "percent",
        "example_application_ids",
    ];
}

impl CsvHeader for StageComparison {
    const HEADERS: &'static [&'static str] = &[
        "rule_id",
        "issue_group",
        "severity",
        "description",
        "pre_count",
        "pre_percent",
        "post_count",
        "post_percent",
        "delta_count",
    ];
}

impl CsvHeader for CleaningSummary {
    const HEADERS: &'static [&'static str] = &[
        "action_id",
        "field_path",
        "flag",
        "description",
        "rows_flagged",
        "total_rows",
        "percent",
    ];
}

impl CsvHeader for PiiInventoryRecord {
    const HEADERS: &'static [&'static str] = &[
        "field_path",
        "classification",
        "present_in_raw",
        "present_in_audit",
        "present_in_analysis",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateRecord {
    pub application_id: String,
    pub dup_count: usize,
    pub row_ids: String,
    pub classification: String,
    pub canonical_row_id: usize,
    pub canonical_reason: String,
    pub timestamp_tie: bool,
    pub differing_fields: String,
}

impl From<&DuplicateGroup> for DuplicateRecord {
    fn from(g: &DuplicateGroup) -> Self {
        DuplicateRecord {
            application_id: g.application_id.clone(),
            dup_count: g.dup_count,
            row_ids: g
                .row_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join("|"),
            classification: g.classification.to_string(),
            canonical_row_id: g.canonical_row_id,
            canonical_reason: g.canonical_reason.to_string(),
            timestamp_tie: g.timestamp_tie,
            differing_fields: g.differing_fields.join("|"),
        }
    }
}

impl CsvHeader for DuplicateRecord {
    const HEADERS: &'static [&'static str] = &[
        "application_id",
        "dup_count",
        "row_ids",
        "classification",
        "canonical_row_id",
        "canonical_reason",
        "timestamp_tie",
        "differing_fields",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleCatalogRecord {
    pub rule_id: String,
    pub scope: String,
    pub issue_group: String,
    pub field_path: String,
    pub inputs: String,
    pub severity: String,
    pub description: String,
}

impl CsvHeader for RuleCatalogRecord {
    const HEADERS: &'static [&'static str] = &[
        "rule_id",
        "scope",
        "issue_group",
        "field_path",
        "inputs",
        "severity",
        "description",
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleaningCatalogRecord {
    pub action_id: String,
    pub scope: String,
    pub field_path: String,
    pub clean_column: String,
    pub flags: String,
    pub nullifying_rule: String,
    pub description: String,
}

impl CsvHeader for CleaningCatalogRecord {
    const HEADERS: &'static [&'static str] = &[
        "action_id",
        "scope",
        "field_path",
        "clean_column",
        "flags",
        "nullifying_rule",
        "description",
    ];
}

fn scope_name(scope: FieldScope) -> &'static str {
    match scope {
        FieldScope::Application => "application",
        FieldScope::Spending => "spending",
    }
}

pub fn rule_catalog_records(engine: &RuleEngine) -> Vec<RuleCatalogRecord> {
    engine
        .rules()
        .iter()
        .map(|r| RuleCatalogRecord {
            rule_id: r.id.clone(),
            scope: scope_name(r.scope).to_string(),
            issue_group: r.issue_group.to_string(),
            field_path: r.field_path.clone(),
            inputs: r.inputs.join("|"),
            severity: r.severity.to_string(),
            description: r.description.clone(),
        })
        .collect()
}

pub fn cleaning_catalog_records(cleaner: &Cleaner) -> Vec<CleaningCatalogRecord> {
    cleaner
        .rules()
        .iter()
        .map(|r| CleaningCatalogRecord {
            action_id: r.action_id.clone(),
            scope: scope_name(r.scope).to_string(),
            field_path: r.field_path.clone(),
            clean_column: r.column.clone(),
            flags: r.flag_names().join("|"),
            nullifying_rule: r.transform.range_rule_id().unwrap_or_default().to_string(),
            description: r.description.clone(),
        })
        .collect()
}

// ============================================================================
// RENDERING
// ============================================================================

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| PipelineError::Io(e.into_error()))
}

/// Header row from the table's columns, one record per row
pub fn render_table(table: &Table) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.columns)?;
    for row in table.text_rows() {
        writer.write_record(&row)?;
    }
    finish(writer)
}

/// Header row from the record's field names; an empty report is the header alone
pub fn render_records<T: Serialize + CsvHeader>(records: &[T]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if records.is_empty() {
        writer.write_record(T::HEADERS)?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    finish(writer)
}

// ============================================================================
// EXPORT
// ============================================================================

pub struct Exporter<'a> {
    engine: &'a RuleEngine,
    cleaner: &'a Cleaner,
}

impl<'a> Exporter<'a> {
    pub fn new(engine: &'a RuleEngine, cleaner: &'a Cleaner) -> Self {
        Exporter { engine, cleaner }
    }

    /// File name → contents, in write order
    pub fn render(&self, datasets: &Datasets, output: &PipelineOutput) -> Result<Vec<(String, Vec<u8>)>> {
        let mut files = Vec::new();
        for table in [&datasets.audit, &datasets.analysis, &datasets.spending] {
            files.push((format!("{}.csv", table.name), render_table(table)?));
        }

        let issues: Vec<IssueRecord> = output
            .pre_issues
            .issues
            .iter()
            .chain(output.post_issues.issues.iter())
            .map(|i| i.to_record())
            .collect();
        files.push((ISSUE_REPORT.to_string(), render_records(&issues)?));

        let duplicates: Vec<DuplicateRecord> =
            output.duplicate_groups().iter().map(DuplicateRecord::from).collect();
        files.push((DUPLICATE_REPORT.to_string(), render_records(&duplicates)?));

        files.push((COMPARISON_REPORT.to_string(), render_records(&output.comparison)?));
        files.push((CLEANING_REPORT.to_string(), render_records(&output.cleaning_summary)?));
        files.push((
            RULE_CATALOG.to_string(),
            render_records(&rule_catalog_records(self.engine))?,
        ));
        files.push((
            CLEANING_CATALOG.to_string(),
            render_records(&cleaning_catalog_records(self.cleaner))?,
        ));
        files.push((PII_INVENTORY.to_string(), render_records(&datasets.pii_inventory)?));

        Ok(files)
    }

    /// Render everything, stage it next to `dir`, then move it into place.
    /// A failure while staging leaves `dir` untouched.
    pub fn export(&self, dir: &Path, datasets: &Datasets, output: &PipelineOutput) -> Result<Vec<PathBuf>> {
        let files = self.render(datasets, output)?;

        let dir = if dir.file_name().is_some() {
            dir.to_path_buf()
        } else {
            dir.canonicalize()?
        };
        let staging = staging_dir(&dir)?;

        let result = write_staged(&staging, &files).and_then(|_| publish(&staging, &dir, &files));
        if staging.exists() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                warn!(dir = %staging.display(), error = %e, "could not remove staging directory");
            }
        }
        let written = result?;

        info!(files = written.len(), dir = %dir.display(), "exported");
        Ok(written)
    }
}

// ============================================================================
// STAGING
// ============================================================================

fn staging_dir(dir: &Path) -> Result<PathBuf> {
    let name = dir.file_name().ok_or_else(|| {
        PipelineError::Config(format!("output directory '{}' has no name", dir.display()))
    })?;
    Ok(dir.with_file_name(format!(
        ".{}.{}.staging",
        name.to_string_lossy(),
        Uuid::new_v4()
    )))
}

fn write_staged(staging: &Path, files: &[(String, Vec<u8>)]) -> Result<()> {
    if let Some(parent) = staging.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir(staging)?;
    for (name, bytes) in files {
        fs::write(staging.join(name), bytes)?;
    }
    Ok(())
}

/// A missing `dir` is replaced by the staging directory in one rename; an existing
/// one receives the files one rename each, after checking none of them is blocked
fn publish(staging: &Path, dir: &Path, files: &[(String, Vec<u8>)]) -> Result<Vec<PathBuf>> {
    let targets: Vec<PathBuf> = files.iter().map(|(name, _)| dir.join(name)).collect();

    if !dir.exists() {
        fs::rename(staging, dir)?;
        return Ok(targets);
    }

    if let Some(blocked) = targets.iter().find(|t| t.is_dir()) {
        return Err(PipelineError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("'{}' is a directory", blocked.display()),
        )));
    }
    for ((name, _), target) in files.iter().zip(&targets) {
        fs::rename(staging.join(name), target)?;
    }
    Ok(targets)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::Assembler;
    use crate::config::PipelineConfig;
    use crate::flatten::RawRecord;
    use crate::pipeline::Pipeline;
    use crate::privacy::Salt;
    use serde_json::json;

    fn create_test_run() -> (Pipeline, PipelineOutput, Datasets) {
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let records = RawRecord::from_batch(vec![
            json!({
                "_id": "app_001",
                "applicant_info": { "full_name": "Jane Doe", "ssn": "123-45-6789" },
                "financials": { "debt_to_income": 1.4 }
            }),
            json!({
                "_id": "app_001",
                "applicant_info": { "full_name": "Jane Doe", "ssn": "123-45-6789" },
                "financials": { "debt_to_income": 1.4 }
            }),
        ]);
        let output = pipeline.run(&records, Salt::new("export-salt")).unwrap();
        let datasets = Assembler::for_pipeline(&pipeline).assemble(&output).unwrap();
        (pipeline, output, datasets)
    }

    #[test]
    fn test_render_table_writes_header_and_empty_cells() {
        let mut table = Table::new("t", vec!["a".to_string(), "b".to_string()]);
        table.rows.push(vec![json!("x"), json!(null)]);

        let bytes = render_table(&table).unwrap();

        assert_eq!(String::from_utf8(bytes).unwrap(), "a,b\nx,\n");
    }

    #[test]
    fn test_duplicate_record_joins_lists() {
        let (_, output, _) = create_test_run();
        let record = DuplicateRecord::from(&output.duplicate_groups()[0]);

        assert_eq!(record.row_ids, "0|1");
        assert_eq!(record.classification, "exact");
        assert_eq!(record.canonical_row_id, 1);
        assert_eq!(record.differing_fields, "");
    }

    #[test]
    fn test_export_writes_every_file() {
        let (pipeline, output, datasets) = create_test_run();
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(pipeline.engine(), pipeline.cleaner());

        let written = exporter.export(dir.path(), &datasets, &output).unwrap();

        assert_eq!(written.len(), 10);
        for path in &written {
            assert!(path.exists(), "{} missing", path.display());
        }

        let analysis = fs::read_to_string(dir.path().join("analysis_applications.csv")).unwrap();
        assert_eq!(analysis.lines().count(), 2);
        assert!(!analysis.contains("123-45-6789"));
        assert!(!analysis.contains("export-salt"));

        let issues = fs::read_to_string(dir.path().join(ISSUE_REPORT)).unwrap();
        assert!(issues.starts_with("stage,rule_id,issue_group"));
        assert!(issues.contains("R_APP_014"));

        let inventory = fs::read_to_string(dir.path().join(PII_INVENTORY)).unwrap();
        assert!(inventory.starts_with("field_path,classification,present_in_raw"));
        assert!(inventory.contains("applicant_info.ssn,PII,true,true,false"));
    }

    #[test]
    fn test_empty_report_still_has_header() {
        let bytes = render_records::<DuplicateRecord>(&[]).unwrap();

        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            format!("{}\n", DuplicateRecord::HEADERS.join(","))
        );
    }

    fn header_line<T: Serialize + CsvHeader>(records: &[T]) -> String {
        let text = String::from_utf8(render_records(records).unwrap()).unwrap();
        text.lines().next().unwrap_or_default().to_string()
    }

    #[test]
    fn test_declared_headers_match_serialised_fields() {
        let (pipeline, output, datasets) = create_test_run();
        let issues: Vec<IssueRecord> = output.pre_issues.issues.iter().map(|i| i.to_record()).collect();
        let duplicates: Vec<DuplicateRecord> =
            output.duplicate_groups().iter().map(DuplicateRecord::from).collect();

        assert_eq!(header_line(&issues), IssueRecord::HEADERS.join(","));
        assert_eq!(header_line(&duplicates), DuplicateRecord::HEADERS.join(","));
        assert_eq!(header_line(&output.comparison), StageComparison::HEADERS.join(","));
        assert_eq!(header_line(&output.cleaning_summary), CleaningSummary::HEADERS.join(","));
        assert_eq!(header_line(&datasets.pii_inventory), PiiInventoryRecord::HEADERS.join(","));
        assert_eq!(
            header_line(&rule_catalog_records(pipeline.engine())),
            RuleCatalogRecord::HEADERS.join(",")
        );
        assert_eq!(
            header_line(&cleaning_catalog_records(pipeline.cleaner())),
            CleaningCatalogRecord::HEADERS.join(",")
        );
    }

    #[test]
    fn test_export_into_new_directory_leaves_no_staging() {
        let (pipeline, output, datasets) = create_test_run();
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("nested").join("out");

        Exporter::new(pipeline.engine(), pipeline.cleaner())
            .export(&out, &datasets, &output)
            .unwrap();

        assert!(out.join(DUPLICATE_REPORT).exists());
        let siblings: Vec<_> = fs::read_dir(root.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(siblings, vec![std::ffi::OsString::from("out")]);
    }

    #[test]
    fn test_blocked_export_writes_nothing() {
        let (pipeline, output, datasets) = create_test_run();
        let root = tempfile::tempdir().unwrap();
        let out = root.path().join("out");
        fs::create_dir_all(out.join(ISSUE_REPORT)).unwrap();
        fs::write(out.join("keep.txt"), "mine").unwrap();

        let result = Exporter::new(pipeline.engine(), pipeline.cleaner()).export(&out, &datasets, &output);

        assert!(matches!(result, Err(PipelineError::Io(_))));
        assert!(!out.join("audit_applications.csv").exists());
        assert_eq!(fs::read_to_string(out.join("keep.txt")).unwrap(), "mine");
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_rule_catalog_lists_every_rule() {
        let engine = RuleEngine::credit_applications();

        let records = rule_catalog_records(&engine);

        assert_eq!(records.len(), engine.rule_count());
        assert!(records.iter().any(|r| r.rule_id == "R_SPN_003" && r.scope == "spending"));
    }
}
