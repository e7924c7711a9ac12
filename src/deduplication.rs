// 🔍 Duplicate Resolver - One canonical row per application id
// Rows are partitioned by application id (key → row indices), each multi-row group
// is classified, and a canonical row is picked by latest timestamp, then max row id.

use crate::attributes::{AttributeRegistry, FieldScope};
use crate::config::PipelineConfig;
use crate::flatten::FlatRow;
use crate::temporal::parse_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::info;

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Every raw field identical
    Exact,

    /// Only non-material fields (timestamps, notes) differ
    Versioned,

    /// A material field differs
    Conflict,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Exact => "exact",
            Classification::Versioned => "versioned",
            Classification::Conflict => "conflict",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalReason {
    /// Latest parseable processing timestamp (ties go to the max row id)
    ByTimestamp,

    /// No row had a parseable timestamp; max row id wins
    MissingOrUnparseableTimestampFallbackMaxRowId,
}

impl CanonicalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalReason::ByTimestamp => "by_timestamp",
            CanonicalReason::MissingOrUnparseableTimestampFallbackMaxRowId => {
                "missing_or_unparseable_timestamp_fallback_max_row_id"
            }
        }
    }
}

impl fmt::Display for CanonicalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RESOLUTION RESULT
// ============================================================================

/// A set of rows sharing one application id (count > 1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub application_id: String,
    pub dup_count: usize,

    /// Member row ids, ascending
    pub row_ids: Vec<usize>,
    pub classification: Classification,
    pub canonical_row_id: usize,
    pub canonical_reason: CanonicalReason,

    /// More than one row shared the latest timestamp
    pub timestamp_tie: bool,

    /// Paths that differ from the canonical row, in schema order
    pub differing_fields: Vec<String>,
}

/// Per-row resolution metadata carried into the audit table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResolution {
    pub row_id: usize,
    pub application_id: String,
    pub is_duplicate_id: bool,
    pub dup_count: usize,

    /// 1-based position within the group by row id
    pub rank_within_id: usize,
    pub is_canonical: bool,

    /// `None` for singletons
    pub classification: Option<Classification>,
    pub canonical_reason: CanonicalReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Multi-row groups, ordered by application id
    pub groups: Vec<DuplicateGroup>,

    /// One entry per input row, ordered by row id
    pub rows: Vec<RowResolution>,

    /// Application id → canonical row id, for every key
    pub canonical: BTreeMap<String, usize>,
}

impl Resolution {
    pub fn for_row(&self, row_id: usize) -> Option<&RowResolution> {
        self.rows
            .binary_search_by_key(&row_id, |r| r.row_id)
            .ok()
            .map(|i| &self.rows[i])
    }

    pub fn is_canonical(&self, row_id: usize) -> bool {
        self.for_row(row_id).map_or(false, |r| r.is_canonical)
    }

    pub fn canonical_row_ids(&self) -> BTreeSet<usize> {
        self.canonical.values().copied().collect()
    }

    pub fn groups_with(&self, classification: Classification) -> impl Iterator<Item = &DuplicateGroup> {
        self.groups
            .iter()
            .filter(move |g| g.classification == classification)
    }

    pub fn summary(&self) -> String {
        format!(
            "Keys: {}, duplicate groups: {} ({} exact, {} versioned, {} conflict)",
            self.canonical.len(),
            self.groups.len(),
            self.groups_with(Classification::Exact).count(),
            self.groups_with(Classification::Versioned).count(),
            self.groups_with(Classification::Conflict).count(),
        )
    }
}

struct CanonicalChoice {
    row_id: usize,
    reason: CanonicalReason,
    timestamp_tie: bool,
}

// ============================================================================
// DUPLICATE RESOLVER
// ============================================================================

pub struct DuplicateResolver {
    /// Application paths in schema order
    field_order: Vec<String>,

    /// Paths whose differences alone make a group `versioned`
    non_material_fields: BTreeSet<String>,

    max_difference_fields: usize,
}

impl DuplicateResolver {
    pub fn new(
        registry: &AttributeRegistry,
        non_material_fields: &[String],
        max_difference_fields: usize,
    ) -> Self {
        DuplicateResolver {
            field_order: registry
                .in_scope(FieldScope::Application)
                .map(|a| a.path.clone())
                .collect(),
            non_material_fields: non_material_fields.iter().cloned().collect(),
            max_difference_fields,
        }
    }

    pub fn from_config(registry: &AttributeRegistry, config: &PipelineConfig) -> Self {
        Self::new(
            registry,
            &config.non_material_fields,
            config.max_difference_fields,
        )
    }

    pub fn non_material_fields(&self) -> impl Iterator<Item = &str> {
        self.non_material_fields.iter().map(String::as_str)
    }

    /// Resolve every application id in the batch. Never fails on content;
    /// an empty batch yields an empty resolution.
    pub fn resolve(&self, rows: &[FlatRow]) -> Resolution {
        let mut by_key: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, row) in rows.iter().enumerate() {
            by_key.entry(row.application_id.as_str()).or_default().push(i);
        }

        let mut resolution = Resolution::default();

        for (application_id, mut members) in by_key {
            members.sort_by_key(|&i| rows[i].row_id);
            let group: Vec<&FlatRow> = members.iter().map(|&i| &rows[i]).collect();

            let choice = self.choose_canonical(&group);
            let classification = if group.len() > 1 {
                Some(self.classify(&group))
            } else {
                None
            };

            if let Some(classification) = classification {
                let differing_fields = match classification {
                    Classification::Exact => Vec::new(),
                    _ => self.differing_fields(&group, choice.row_id),
                };
                resolution.groups.push(DuplicateGroup {
                    application_id: application_id.to_string(),
                    dup_count: group.len(),
                    row_ids: group.iter().map(|r| r.row_id).collect(),
                    classification,
                    canonical_row_id: choice.row_id,
                    canonical_reason: choice.reason,
                    timestamp_tie: choice.timestamp_tie,
                    differing_fields,
                });
            }

            for (rank, row) in group.iter().enumerate() {
                resolution.rows.push(RowResolution {
                    row_id: row.row_id,
                    application_id: application_id.to_string(),
                    is_duplicate_id: group.len() > 1,
                    dup_count: group.len(),
                    rank_within_id: rank + 1,
                    is_canonical: row.row_id == choice.row_id,
                    classification,
                    canonical_reason: choice.reason,
                });
            }

            resolution
                .canonical
                .insert(application_id.to_string(), choice.row_id);
        }

        resolution.rows.sort_by_key(|r| r.row_id);

        info!(
            rows = rows.len(),
            keys = resolution.canonical.len(),
            duplicate_groups = resolution.groups.len(),
            conflicts = resolution.groups_with(Classification::Conflict).count(),
            "duplicates resolved"
        );

        resolution
    }

    /// Latest parseable timestamp wins; ties and timestamp-less groups go to the max row id
    fn choose_canonical(&self, group: &[&FlatRow]) -> CanonicalChoice {
        let stamped: Vec<(DateTime<Utc>, usize)> = group
            .iter()
            .filter_map(|row| {
                row.processing_timestamp()
                    .and_then(parse_timestamp)
                    .map(|ts| (ts, row.row_id))
            })
            .collect();

        let max_row_id = group.iter().map(|r| r.row_id).max().unwrap_or_default();

        match stamped.iter().map(|(ts, _)| *ts).max() {
            Some(latest) => {
                let candidates: Vec<usize> = stamped
                    .iter()
                    .filter(|(ts, _)| *ts == latest)
                    .map(|(_, id)| *id)
                    .collect();
                CanonicalChoice {
                    row_id: candidates.iter().copied().max().unwrap_or(max_row_id),
                    reason: CanonicalReason::ByTimestamp,
                    timestamp_tie: candidates.len() > 1,
                }
            }
            None => CanonicalChoice {
                row_id: max_row_id,
                reason: CanonicalReason::MissingOrUnparseableTimestampFallbackMaxRowId,
                timestamp_tie: false,
            },
        }
    }

    fn classify(&self, group: &[&FlatRow]) -> Classification {
        let Some((first, rest)) = group.split_first() else {
            return Classification::Exact;
        };

        let mut material_difference = false;
        let mut any_difference = false;
        for row in rest {
            for path in &self.field_order {
                if first.raw(path) != row.raw(path) {
                    any_difference = true;
                    if !self.non_material_fields.contains(path) {
                        material_difference = true;
                    }
                }
            }
        }

        if material_difference {
            Classification::Conflict
        } else if any_difference {
            Classification::Versioned
        } else {
            Classification::Exact
        }
    }

    fn differing_fields(&self, group: &[&FlatRow], canonical_row_id: usize) -> Vec<String> {
        let Some(canonical) = group.iter().find(|r| r.row_id == canonical_row_id) else {
            return Vec::new();
        };

        self.field_order
            .iter()
            .filter(|path| {
                group
                    .iter()
                    .filter(|r| r.row_id != canonical_row_id)
                    .any(|r| r.raw(path) != canonical.raw(path))
            })
            .take(self.max_difference_fields)
            .cloned()
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
