// 🔁 Pipeline - One curation run over an in-memory batch
// raw → flattened → pre rules → cleaned → post rules → duplicate-resolved → pseudonymized
//
// A run either returns a complete PipelineOutput or a single fatal error; nothing
// is produced halfway.

use crate::attributes::{AttributeRegistry, FieldScope};
use crate::cleaning::{CleanedRow, CleanedSpendingItem, Cleaner};
use crate::config::PipelineConfig;
use crate::data_quality::{
    compare_stages, malformed_record_issue, rule_issues, summarise_cleaning, uniqueness_issues,
    CleaningSummary, IssueReport, Stage, StageComparison,
};
use crate::deduplication::{DuplicateGroup, DuplicateResolver, Resolution};
use crate::error::{MalformedRecordError, Result, RuleEvaluationError};
use crate::flatten::{FlatRow, Flattener, RawRecord};
use crate::privacy::{PseudoIdentity, Pseudonymizer, Salt};
use crate::rules::{RuleEngine, RuleEvaluation};
use crate::schema::SchemaValidator;
use std::collections::BTreeMap;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

// ============================================================================
// RUN OUTPUT
// ============================================================================

/// Per-row rule outcomes for both stages and scopes
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvaluations {
    pub pre_application: RuleEvaluation,
    pub pre_spending: RuleEvaluation,
    pub post_application: RuleEvaluation,
    pub post_spending: RuleEvaluation,
}

impl StageEvaluations {
    pub fn all(&self) -> [&RuleEvaluation; 4] {
        [
            &self.pre_application,
            &self.pre_spending,
            &self.post_application,
            &self.post_spending,
        ]
    }

    pub fn get(&self, stage: Stage, scope: FieldScope) -> &RuleEvaluation {
        match (stage, scope) {
            (Stage::Pre, FieldScope::Application) => &self.pre_application,
            (Stage::Pre, FieldScope::Spending) => &self.pre_spending,
            (Stage::Post, FieldScope::Application) => &self.post_application,
            (Stage::Post, FieldScope::Spending) => &self.post_spending,
        }
    }
}

/// Everything the Assembler and the reports consume from one run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Schema used for this run, passthrough columns included
    pub registry: AttributeRegistry,
    pub passthrough_fields: Vec<String>,

    /// One per input record, in row order
    pub rows: Vec<CleanedRow>,
    pub spending_items: Vec<CleanedSpendingItem>,
    pub malformed: Vec<MalformedRecordError>,

    pub resolution: Resolution,
    pub evaluations: StageEvaluations,

    /// Keyed by application id, canonical rows only
    pub identities: BTreeMap<String, PseudoIdentity>,

    pub pre_issues: IssueReport,
    pub post_issues: IssueReport,
    pub comparison: Vec<StageComparison>,
    pub cleaning_summary: Vec<CleaningSummary>,
}

impl PipelineOutput {
    /// One row per application id, ordered by application id
    pub fn canonical_rows(&self) -> Vec<&CleanedRow> {
        let by_row: BTreeMap<usize, &CleanedRow> =
            self.rows.iter().map(|r| (r.flat.row_id, r)).collect();
        self.resolution
            .canonical
            .values()
            .filter_map(|row_id| by_row.get(row_id).copied())
            .collect()
    }

    pub fn duplicate_groups(&self) -> &[DuplicateGroup] {
        &self.resolution.groups
    }

    pub fn identity_for(&self, application_id: &str) -> Option<&PseudoIdentity> {
        self.identities.get(application_id)
    }

    pub fn evaluation_errors(&self) -> impl Iterator<Item = &RuleEvaluationError> {
        self.evaluations.all().into_iter().flat_map(|e| e.errors.iter())
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    config: PipelineConfig,
    registry: AttributeRegistry,
    engine: RuleEngine,
    cleaner: Cleaner,
}

impl Pipeline {
    /// Build the credit-application catalogs and check them against the schema
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_catalogs(
            config,
            AttributeRegistry::credit_applications(),
            RuleEngine::credit_applications(),
            Cleaner::credit_applications(),
        )
    }

    /// Custom catalogs; a catalog entry pointing at an undeclared path is fatal here
    pub fn with_catalogs(
        config: PipelineConfig,
        registry: AttributeRegistry,
        engine: RuleEngine,
        cleaner: Cleaner,
    ) -> Result<Self> {
        config.validate()?;
        SchemaValidator::new(&registry).check(&engine, &cleaner, &config)?;

        info!(
            attributes = registry.count(),
            rules = engine.rule_count(),
            cleaning_actions = cleaner.rules().len(),
            "catalogs validated"
        );

        Ok(Pipeline {
            config,
            registry,
            engine,
            cleaner,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    pub fn run(&self, records: &[RawRecord], salt: Option<Salt>) -> Result<PipelineOutput> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        let _enter = span.enter();

        // No salt, no run
        let pseudonymizer = Pseudonymizer::new(salt)?;
        let max_examples = self.config.max_examples;

        // 1. Flatten
        let mut registry = self.registry.clone();
        let passthrough_fields = if self.config.passthrough_unknown_fields {
            registry.register_passthrough_fields(records)
        } else {
            Vec::new()
        };
        if !passthrough_fields.is_empty() {
            info!(fields = ?passthrough_fields, "passthrough columns registered");
        }
        let flattener = Flattener::new(registry);

        let mut rows: Vec<FlatRow> = Vec::with_capacity(records.len());
        let mut items = Vec::new();
        let mut malformed = Vec::new();
        for record in records {
            let flattened = flattener.flatten(record);
            rows.push(flattened.row);
            items.extend(flattened.spending_items);
            malformed.extend(flattened.errors);
        }
        info!(
            records = rows.len(),
            spending_items = items.len(),
            malformed = malformed.len(),
            "flattened"
        );

        debug!(rules = self.engine.rule_count(), "evaluating rules");

        // 2. Pre-stage rules
        let pre_application = self.engine.evaluate(FieldScope::Application, &rows);
        let pre_spending = self.engine.evaluate(FieldScope::Spending, &items);

        // 3. Clean
        let cleaned: Vec<CleanedRow> = rows.iter().map(|r| self.cleaner.clean_row(r)).collect();
        let cleaned_items: Vec<CleanedSpendingItem> = items
            .iter()
            .map(|i| self.cleaner.clean_spending_item(i))
            .collect();

        // 4. Post-stage rules
        let post_application = self.engine.evaluate(FieldScope::Application, &cleaned);
        let post_spending = self.engine.evaluate(FieldScope::Spending, &cleaned_items);

        // 5. Resolve duplicates
        let resolver = DuplicateResolver::from_config(flattener.registry(), &self.config);
        let resolution = resolver.resolve(&rows);

        // 6. Pseudonymize canonical rows
        let identities: BTreeMap<String, PseudoIdentity> = cleaned
            .iter()
            .filter(|r| resolution.is_canonical(r.flat.row_id))
            .map(|r| {
                let identity = pseudonymizer.pseudonymize(r);
                (identity.application_id.clone(), identity)
            })
            .collect();
        let fallbacks = identities.values().filter(|i| i.fallback_used).count();
        info!(identities = identities.len(), fallbacks, "pseudonymized");

        // 7. Issues
        let mut pre = rule_issues(&self.engine, &pre_application, max_examples);
        pre.extend(rule_issues(&self.engine, &pre_spending, max_examples));
        pre.push(malformed_record_issue(&malformed, rows.len(), max_examples));
        pre.extend(uniqueness_issues(Stage::Pre, &rows, &resolution, max_examples));
        let pre_issues = IssueReport::new(Stage::Pre, pre);

        let mut post = rule_issues(&self.engine, &post_application, max_examples);
        post.extend(rule_issues(&self.engine, &post_spending, max_examples));
        post.extend(uniqueness_issues(Stage::Post, &rows, &resolution, max_examples));
        let post_issues = IssueReport::new(Stage::Post, post);

        info!("{}", pre_issues.summary());
        info!("{}", post_issues.summary());

        let evaluations = StageEvaluations {
            pre_application,
            pre_spending,
            post_application,
            post_spending,
        };
        let error_count: usize = evaluations.all().iter().map(|e| e.errors.len()).sum();
        if error_count > 0 {
            warn!(errors = error_count, "some rules could not be evaluated");
        }

        let comparison = compare_stages(&pre_issues, &post_issues);
        let cleaning_summary = summarise_cleaning(&self.cleaner, &cleaned, &cleaned_items);

        Ok(PipelineOutput {
            registry: flattener.registry().clone(),
            passthrough_fields,
            rows: cleaned,
            spending_items: cleaned_items,
            malformed,
            resolution,
            evaluations,
            identities,
            pre_issues,
            post_issues,
            comparison,
            cleaning_summary,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
