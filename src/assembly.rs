// 🧱 Dataset Assembler - Audit, analysis and spending tables
// Joins one run's outputs into flat tables with a fixed column set.
//
// audit:    every record, raw + clean + flags + resolution + failed rule ids
// analysis: canonical rows only, pseudonymous, allow-listed clean columns only
// spending: every line item with its clean values and flags

use crate::attributes::{FieldScope, PiiClass};
use crate::cleaning::{clean_or_null, CleanedFields, Cleaner};
use crate::config::PipelineConfig;
use crate::data_quality::Stage;
use crate::error::Result;
use crate::pipeline::{Pipeline, PipelineOutput};
use crate::temporal::age_band;
use crate::values::{cell_text, is_blank};
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::info;

pub const AUDIT_TABLE: &str = "audit_applications";
pub const ANALYSIS_TABLE: &str = "analysis_applications";
pub const SPENDING_TABLE: &str = "spending_items";

const DATE_OF_BIRTH: &str = "applicant_info.date_of_birth";

// ============================================================================
// TABLE
// ============================================================================

/// Column names plus rows of cells; every row has one cell per column
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: &str, columns: Vec<String>) -> Self {
        Table {
            name: name.to_string(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Cells rendered as CSV text (null → empty)
    pub fn text_rows(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.rows.iter().map(|r| r.iter().map(cell_text).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Datasets {
    pub audit: Table,
    pub analysis: Table,
    pub spending: Table,
    pub pii_inventory: Vec<PiiInventoryRecord>,
}

// ============================================================================
// PII INVENTORY
// ============================================================================

/// Privacy class of one field and the layers it is visible in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PiiInventoryRecord {
    pub field_path: String,
    pub classification: String,
    pub present_in_raw: bool,
    pub present_in_audit: bool,
    pub present_in_analysis: bool,
}

/// Identifiers the run derives rather than reads
const DERIVED_IDENTIFIERS: &[(&str, PiiClass)] = &[
    ("application_id", PiiClass::Quasi),
    ("applicant_pseudo_id", PiiClass::Quasi),
    ("age_band", PiiClass::None),
];

fn joined_rule_ids(failed: Option<&[String]>) -> Value {
    Value::from(failed.map(|ids| ids.join("|")).unwrap_or_default())
}

// ============================================================================
// ASSEMBLER
// ============================================================================

pub struct Assembler<'a> {
    cleaner: &'a Cleaner,
    config: &'a PipelineConfig,
}

impl<'a> Assembler<'a> {
    pub fn new(cleaner: &'a Cleaner, config: &'a PipelineConfig) -> Self {
        Assembler { cleaner, config }
    }

    pub fn for_pipeline(pipeline: &'a Pipeline) -> Self {
        Self::new(pipeline.cleaner(), pipeline.config())
    }

    pub fn assemble(&self, output: &PipelineOutput) -> Result<Datasets> {
        let mut datasets = Datasets {
            audit: self.audit_table(output),
            analysis: self.analysis_table(output)?,
            spending: self.spending_table(output),
            pii_inventory: Vec::new(),
        };
        datasets.pii_inventory = self.pii_inventory(output, &datasets);

        info!(
            audit = datasets.audit.len(),
            analysis = datasets.analysis.len(),
            spending = datasets.spending.len(),
            "datasets assembled"
        );

        Ok(datasets)
    }

    fn clean_cells(&self, scope: FieldScope, fields: &CleanedFields) -> Vec<Value> {
        let mut cells: Vec<Value> = self
            .cleaner
            .rules_in(scope)
            .map(|r| clean_or_null(fields, &r.field_path).clone())
            .collect();
        cells.extend(
            self.cleaner
                .flag_columns(scope)
                .iter()
                .map(|f| Value::Bool(fields.flag(f))),
        );
        cells
    }

    fn clean_columns(&self, scope: FieldScope) -> Vec<String> {
        let mut columns: Vec<String> = self.cleaner.rules_in(scope).map(|r| r.column.clone()).collect();
        columns.extend(self.cleaner.flag_columns(scope));
        columns
    }

    /// Every record in row order
    pub fn audit_table(&self, output: &PipelineOutput) -> Table {
        let attributes: Vec<_> = output.registry.in_scope(FieldScope::Application).collect();

        let mut columns = vec!["row_id".to_string(), "application_id".to_string()];
        columns.extend(attributes.iter().map(|a| a.column.clone()));
        columns.extend(self.clean_columns(FieldScope::Application));
        columns.extend(
            [
                "is_malformed",
                "is_duplicate_id",
                "dup_count",
                "rank_within_id",
                "is_canonical",
                "duplicate_classification",
                "canonical_reason",
                "pre_failed_rules",
                "post_failed_rules",
            ]
            .iter()
            .map(|c| c.to_string()),
        );

        let malformed: BTreeSet<usize> = output.malformed.iter().map(|e| e.row_id).collect();
        let failed = [Stage::Pre, Stage::Post]
            .map(|stage| output.evaluations.get(stage, FieldScope::Application).failed_by_row());
        let mut table = Table::new(AUDIT_TABLE, columns);

        for row in &output.rows {
            let row_id = row.flat.row_id;
            let mut cells = vec![Value::from(row_id), Value::from(row.flat.application_id.clone())];
            cells.extend(attributes.iter().map(|a| row.flat.raw(&a.path).clone()));
            cells.extend(self.clean_cells(FieldScope::Application, &row.fields));
            cells.push(Value::Bool(malformed.contains(&row_id)));

            match output.resolution.for_row(row_id) {
                Some(r) => {
                    cells.push(Value::Bool(r.is_duplicate_id));
                    cells.push(Value::from(r.dup_count));
                    cells.push(Value::from(r.rank_within_id));
                    cells.push(Value::Bool(r.is_canonical));
                    cells.push(r.classification.map_or(Value::Null, |c| Value::from(c.as_str())));
                    cells.push(Value::from(r.canonical_reason.as_str()));
                }
                None => cells.extend(std::iter::repeat(Value::Null).take(6)),
            }

            for stage in &failed {
                cells.push(joined_rule_ids(stage.get(&(row_id, None)).copied()));
            }

            table.rows.push(cells);
        }

        table
    }

    /// Configured analysis fields with their clean column, direct PII excluded
    fn analysis_fields<'o>(&'o self, output: &'o PipelineOutput) -> Vec<(&'o str, &'o str)> {
        let direct = output.registry.direct_pii_paths(&self.config.direct_pii_fields);
        self.config
            .analysis_fields
            .iter()
            .filter(|path| !direct.contains(path.as_str()))
            .filter_map(|path| {
                self.cleaner
                    .rules_in(FieldScope::Application)
                    .find(|r| &r.field_path == path)
                    .map(|r| (r.field_path.as_str(), r.column.as_str()))
            })
            .collect()
    }

    /// One row per application id: pseudonymous, with an age band in place of
    /// the date of birth. Only identity columns and allow-listed clean columns
    /// are projected; raw values never reach this table.
    pub fn analysis_table(&self, output: &PipelineOutput) -> Result<Table> {
        let reference = self.config.reference_date()?;
        let fields = self.analysis_fields(output);

        let mut columns: Vec<String> = ANALYSIS_ID_COLUMNS.iter().map(|c| c.to_string()).collect();
        columns.extend(fields.iter().map(|(_, column)| column.to_string()));

        let mut table = Table::new(ANALYSIS_TABLE, columns);
        for row in output.canonical_rows() {
            let Some(identity) = output.identity_for(&row.flat.application_id) else {
                continue;
            };

            let band = row
                .value(DATE_OF_BIRTH)
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .and_then(|dob| age_band(dob, reference));
            let band_missing = band.is_none();

            let mut cells = vec![
                Value::from(identity.application_id.clone()),
                Value::from(identity.applicant_pseudo_id.clone()),
                Value::from(identity.pseudo_id_source.as_str()),
                Value::from(identity.pseudo_id_source.path_number()),
                Value::Bool(identity.fallback_used),
                band.map_or(Value::Null, Value::from),
                Value::Bool(band_missing),
            ];
            cells.extend(fields.iter().map(|(path, _)| clean_or_null(&row.fields, path).clone()));
            table.rows.push(cells);
        }

        Ok(table)
    }

    /// One entry per schema field plus the derived identifiers, sorted by path.
    /// Presence in the audit and analysis layers is read off the assembled columns.
    pub fn pii_inventory(&self, output: &PipelineOutput, datasets: &Datasets) -> Vec<PiiInventoryRecord> {
        let direct = output.registry.direct_pii_paths(&self.config.direct_pii_fields);
        let audit_columns: BTreeSet<&str> = datasets
            .audit
            .columns
            .iter()
            .chain(&datasets.spending.columns)
            .map(String::as_str)
            .collect();
        let analysis_columns: BTreeSet<&str> =
            datasets.analysis.columns.iter().map(String::as_str).collect();

        let mut records: Vec<PiiInventoryRecord> = output
            .registry
            .all()
            .iter()
            .map(|attr| {
                let mut columns = vec![attr.column.as_str()];
                columns.extend(
                    self.cleaner
                        .rules()
                        .iter()
                        .filter(|r| r.field_path == attr.path)
                        .map(|r| r.column.as_str()),
                );
                let class = if direct.contains(attr.path.as_str()) {
                    PiiClass::Direct
                } else {
                    attr.pii
                };
                let present_in_raw = match attr.scope {
                    FieldScope::Application => output
                        .rows
                        .iter()
                        .any(|r| !is_blank(r.flat.raw(&attr.path))),
                    FieldScope::Spending => output
                        .spending_items
                        .iter()
                        .any(|i| !is_blank(i.item.raw(&attr.path))),
                };

                PiiInventoryRecord {
                    field_path: attr.path.clone(),
                    classification: class.label().to_string(),
                    present_in_raw,
                    present_in_audit: columns.iter().any(|c| audit_columns.contains(c)),
                    present_in_analysis: columns.iter().any(|c| analysis_columns.contains(c)),
                }
            })
            .collect();

        for (path, class) in DERIVED_IDENTIFIERS {
            records.push(PiiInventoryRecord {
                field_path: path.to_string(),
                classification: class.label().to_string(),
                present_in_raw: *path == "application_id" && !output.rows.is_empty(),
                present_in_audit: audit_columns.contains(path),
                present_in_analysis: analysis_columns.contains(path),
            });
        }

        records.sort_by(|a, b| a.field_path.cmp(&b.field_path));
        records
    }

    /// Every spending item; `parent_is_canonical` marks items of the retained row
    pub fn spending_table(&self, output: &PipelineOutput) -> Table {
        let attributes: Vec<_> = output.registry.in_scope(FieldScope::Spending).collect();

        let mut columns = vec![
            "row_id".to_string(),
            "application_id".to_string(),
            "item_index".to_string(),
        ];
        columns.extend(attributes.iter().map(|a| a.column.clone()));
        columns.extend(self.clean_columns(FieldScope::Spending));
        columns.extend(
            ["parent_is_canonical", "pre_failed_rules", "post_failed_rules"]
                .iter()
                .map(|c| c.to_string()),
        );

        let failed = [Stage::Pre, Stage::Post]
            .map(|stage| output.evaluations.get(stage, FieldScope::Spending).failed_by_row());
        let mut table = Table::new(SPENDING_TABLE, columns);
        for item in &output.spending_items {
            let row = &item.item;
            let mut cells = vec![
                Value::from(row.row_id),
                Value::from(row.application_id.clone()),
                Value::from(row.item_index),
            ];
            cells.extend(attributes.iter().map(|a| row.raw(&a.path).clone()));
            cells.extend(self.clean_cells(FieldScope::Spending, &item.fields));
            cells.push(Value::Bool(output.resolution.is_canonical(row.row_id)));
            for stage in &failed {
                cells.push(joined_rule_ids(
                    stage.get(&(row.row_id, Some(row.item_index))).copied(),
                ));
            }
            table.rows.push(cells);
        }

        table
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::RawRecord;
    use crate::privacy::Salt;
    use serde_json::json;

    fn create_test_run() -> (Pipeline, PipelineOutput) {
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let records = RawRecord::from_batch(vec![
            json!({
                "_id": "app_001",
                "processing_timestamp": "2024-01-02T00:00:00",
                "applicant_info": {
                    "full_name": "Jane Doe",
                    "email": "jane@example.com",
                    "ssn": "123-45-6789",
                    "date_of_birth": "05/07/1990"
                },
                "financials": { "debt_to_income": 1.4 },
                "spending_behavior": [{ "category": "groceries", "amount": 120 }]
            }),
            json!({
                "_id": "app_001",
                "applicant_info": { "full_name": "Jane Doe", "ssn": "123-45-6789" }
            }),
            json!({
                "_id": "app_002",
                "applicant_info": { "email": "bob@example.com" },
                "spending_behavior": [{ "category": "travel", "amount": -3 }]
            }),
        ]);
        let output = pipeline.run(&records, Salt::new("assembly-salt")).unwrap();
        (pipeline, output)
    }

    #[test]
    fn test_audit_table_keeps_every_record() {
        let (pipeline, output) = create_test_run();
        let audit = Assembler::for_pipeline(&pipeline).audit_table(&output);

        assert_eq!(audit.len(), 3);
        assert!(audit.rows.iter().all(|r| r.len() == audit.columns.len()));
        assert_eq!(audit.cell(0, "raw_financials_debt_to_income"), Some(&json!(1.4)));
        assert_eq!(audit.cell(0, "clean_debt_to_income"), Some(&json!(null)));
        assert_eq!(audit.cell(0, "dti_nullified_flag"), Some(&json!(true)));
        assert_eq!(audit.cell(1, "is_canonical"), Some(&json!(false)));
        assert_eq!(audit.cell(1, "rank_within_id"), Some(&json!(2)));

        let pre_failed = audit.cell(0, "pre_failed_rules").unwrap().as_str().unwrap();
        assert!(pre_failed.split('|').any(|id| id == "R_APP_014"));
        let post_failed = audit.cell(0, "post_failed_rules").unwrap().as_str().unwrap();
        assert!(!post_failed.split('|').any(|id| id == "R_APP_014"));
    }

    #[test]
    fn test_analysis_table_is_one_row_per_id_without_direct_pii() {
        let (pipeline, output) = create_test_run();
        let analysis = Assembler::for_pipeline(&pipeline).analysis_table(&output).unwrap();

        assert_eq!(analysis.len(), 2);
        assert!(analysis.rows.iter().all(|r| r.len() == analysis.columns.len()));
        for column in ["clean_email", "clean_date_of_birth", "row_id", "pre_failed_rules"] {
            assert!(analysis.column_index(column).is_none(), "{column} should not be projected");
        }
        assert!(analysis.columns.iter().all(|c| !c.starts_with("raw_")));
        assert_eq!(analysis.cell(0, "application_id"), Some(&json!("app_001")));
        assert_eq!(analysis.cell(0, "pseudo_id_source"), Some(&json!("ssn")));
        assert_eq!(analysis.cell(0, "age_band"), Some(&json!("35-44")));
        assert_eq!(analysis.cell(0, "age_band_missing_flag"), Some(&json!(false)));
        assert_eq!(analysis.cell(0, "clean_debt_to_income"), Some(&json!(null)));
        assert_eq!(analysis.cell(1, "pseudo_id_source"), Some(&json!("email")));
        assert_eq!(analysis.cell(1, "fallback_used"), Some(&json!(true)));
        assert_eq!(analysis.cell(1, "age_band"), Some(&json!(null)));
        assert_eq!(analysis.cell(1, "age_band_missing_flag"), Some(&json!(true)));
    }

    #[test]
    fn test_unknown_top_level_keys_stay_out_of_analysis() {
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let records = RawRecord::from_batch(vec![json!({
            "_id": "app_003",
            "phone": "+1-555-0100",
            "notes": "called Jane Doe at home",
            "applicant_info": { "ssn": "987-65-4321", "gender": "F", "zip_code": "10001" },
            "financials": { "annual_income": "55000" }
        })]);
        let output = pipeline.run(&records, Salt::new("assembly-salt")).unwrap();
        let assembler = Assembler::for_pipeline(&pipeline);

        let audit = assembler.audit_table(&output);
        let analysis = assembler.analysis_table(&output).unwrap();

        assert_eq!(audit.cell(0, "raw_phone"), Some(&json!("+1-555-0100")));
        assert!(analysis.column_index("raw_phone").is_none());
        assert!(analysis.column_index("raw_notes").is_none());
        let leaked = analysis
            .text_rows()
            .flatten()
            .any(|cell| cell.contains("555-0100") || cell.contains("Jane Doe") || cell.contains("987-65"));
        assert!(!leaked);
        assert_eq!(analysis.cell(0, "clean_gender"), Some(&json!("Female")));
        assert_eq!(analysis.cell(0, "clean_annual_income"), Some(&json!(55000)));
    }

    #[test]
    fn test_configured_direct_pii_is_never_projected() {
        let config = PipelineConfig {
            direct_pii_fields: vec!["applicant_info.zip_code".to_string()],
            analysis_fields: vec![
                "applicant_info.zip_code".to_string(),
                "financials.debt_to_income".to_string(),
            ],
            ..PipelineConfig::default()
        };
        let cleaner = Cleaner::credit_applications();
        let (_, output) = create_test_run();

        let analysis = Assembler::new(&cleaner, &config).analysis_table(&output).unwrap();

        assert_eq!(analysis.columns.len(), ANALYSIS_ID_COLUMNS.len() + 1);
        assert!(analysis.column_index("clean_zip_code").is_none());
        assert!(analysis.column_index("clean_debt_to_income").is_some());
    }

    #[test]
    fn test_pii_inventory_tracks_layers() {
        let (pipeline, output) = create_test_run();
        let datasets = Assembler::for_pipeline(&pipeline).assemble(&output).unwrap();
        let inventory = &datasets.pii_inventory;
        let entry = |path: &str| inventory.iter().find(|r| r.field_path == path).unwrap();

        let paths: Vec<&str> = inventory.iter().map(|r| r.field_path.as_str()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);

        let ssn = entry("applicant_info.ssn");
        assert_eq!(ssn.classification, "PII");
        assert!(ssn.present_in_raw && ssn.present_in_audit && !ssn.present_in_analysis);

        let gender = entry("applicant_info.gender");
        assert_eq!(gender.classification, "Quasi-PII");
        assert!(!gender.present_in_raw);
        assert!(gender.present_in_analysis);

        let pseudo = entry("applicant_pseudo_id");
        assert!(!pseudo.present_in_raw && !pseudo.present_in_audit && pseudo.present_in_analysis);
        assert_eq!(entry("age_band").classification, "Non-PII");
        assert!(entry("spending_behavior[].amount").present_in_audit);

        for record in inventory.iter().filter(|r| r.classification == "PII") {
            assert!(!record.present_in_analysis, "{} reached analysis", record.field_path);
        }
    }

    #[test]
    fn test_spending_table_cleans_items() {
        let (pipeline, output) = create_test_run();
        let spending = Assembler::for_pipeline(&pipeline).spending_table(&output);

        assert_eq!(spending.len(), 2);
        assert_eq!(spending.cell(0, "clean_category"), Some(&json!("Groceries")));
        assert_eq!(spending.cell(1, "raw_amount"), Some(&json!(-3)));
        assert_eq!(spending.cell(1, "clean_amount"), Some(&json!(null)));
        assert_eq!(spending.cell(1, "parent_is_canonical"), Some(&json!(true)));
    }

    #[test]
    fn test_text_rows_render_nulls_as_empty() {
        let mut table = Table::new("t", vec!["a".to_string(), "b".to_string()]);
        table.rows.push(vec![json!(1), json!(null)]);

        assert_eq!(table.cell(0, "zzz"), None);
        assert_eq!(table.text_rows().next(), Some(vec!["1".to_string(), String::new()]));
    }
}
