// 🗂️ Flattener - Nested record → flat rows
// One application row per record, one spending row per line item.
// Every declared path becomes a column, absent paths become explicit nulls.

use crate::attributes::{AttributeRegistry, FieldScope};
use crate::error::MalformedRecordError;
use crate::privacy::redact_record;
use crate::values::NULL;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// ============================================================================
// CORE TYPES
// ============================================================================

/// One ingested record, immutable once read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Globally unique, monotonic by ingestion order
    pub row_id: usize,
    pub value: Value,
}

impl RawRecord {
    pub fn new(row_id: usize, value: Value) -> Self {
        RawRecord { row_id, value }
    }

    /// Number a batch by ingestion order
    pub fn from_batch(values: Vec<Value>) -> Vec<RawRecord> {
        values
            .into_iter()
            .enumerate()
            .map(|(row_id, value)| RawRecord::new(row_id, value))
            .collect()
    }

    /// The `_id` key as a string. Numbers are stringified, `{"$oid": ..}` is unwrapped,
    /// anything else (including absent) is the empty id.
    pub fn application_id(&self) -> String {
        match self.value.get("_id") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Object(obj)) => obj
                .get("$oid")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

/// Application-level projection of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRow {
    pub row_id: usize,
    pub application_id: String,

    /// Declared path → raw value (null when absent). Write-once.
    pub raw: BTreeMap<String, Value>,
}

impl FlatRow {
    pub fn raw(&self, path: &str) -> &Value {
        self.raw.get(path).unwrap_or(&NULL)
    }

    pub fn processing_timestamp(&self) -> Option<&str> {
        self.raw("processing_timestamp").as_str()
    }
}

/// One spending line item, keyed back to its parent record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingItemRow {
    pub row_id: usize,
    pub application_id: String,
    pub item_index: usize,
    pub raw: BTreeMap<String, Value>,
}

impl SpendingItemRow {
    pub fn raw(&self, path: &str) -> &Value {
        self.raw.get(path).unwrap_or(&NULL)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flattened {
    pub row: FlatRow,
    pub spending_items: Vec<SpendingItemRow>,
    pub errors: Vec<MalformedRecordError>,
}

// ============================================================================
// FLATTENER
// ============================================================================

pub struct Flattener {
    registry: AttributeRegistry,
}

impl Flattener {
    pub fn new(registry: AttributeRegistry) -> Self {
        Flattener { registry }
    }

    pub fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    /// Flatten one record. Shape violations null the affected fields and are
    /// reported in `errors`; the row itself is always produced.
    pub fn flatten(&self, record: &RawRecord) -> Flattened {
        let application_id = record.application_id();
        let mut errors = Vec::new();
        let mut bad_sections = BTreeSet::new();

        let root = record.value.as_object();
        if root.is_none() {
            errors.push(self.malformed(record, &application_id, "record", "an object"));
        }

        let mut raw = BTreeMap::new();
        for attr in self.registry.in_scope(FieldScope::Application) {
            let value = match root {
                Some(obj) => lookup(obj, &attr.segments(), &mut bad_sections),
                None => Value::Null,
            };
            raw.insert(attr.path.clone(), value);
        }

        for section in &bad_sections {
            errors.push(self.malformed(record, &application_id, section, "an object"));
        }

        let spending_items = match root {
            Some(obj) => self.flatten_spending(record, &application_id, obj, &mut errors),
            None => Vec::new(),
        };

        if !errors.is_empty() {
            debug!(
                row_id = record.row_id,
                record = %redact_record(&record.value),
                "malformed record flattened with nulled fields"
            );
        }

        Flattened {
            row: FlatRow {
                row_id: record.row_id,
                application_id,
                raw,
            },
            spending_items,
            errors,
        }
    }

    fn flatten_spending(
        &self,
        record: &RawRecord,
        application_id: &str,
        root: &Map<String, Value>,
        errors: &mut Vec<MalformedRecordError>,
    ) -> Vec<SpendingItemRow> {
        let items = match root.get("spending_behavior") {
            None | Some(Value::Null) => return Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => {
                errors.push(self.malformed(record, application_id, "spending_behavior", "a list"));
                return Vec::new();
            }
        };

        items
            .iter()
            .enumerate()
            .map(|(item_index, item)| {
                let obj = item.as_object();
                if obj.is_none() {
                    errors.push(self.malformed(
                        record,
                        application_id,
                        &format!("spending_behavior[{}]", item_index),
                        "an object",
                    ));
                }

                let raw = self
                    .registry
                    .in_scope(FieldScope::Spending)
                    .map(|attr| {
                        let value = obj
                            .and_then(|o| o.get(attr.leaf()))
                            .cloned()
                            .unwrap_or(Value::Null);
                        (attr.path.clone(), value)
                    })
                    .collect();

                SpendingItemRow {
                    row_id: record.row_id,
                    application_id: application_id.to_string(),
                    item_index,
                    raw,
                }
            })
            .collect()
    }

    fn malformed(
        &self,
        record: &RawRecord,
        application_id: &str,
        section: &str,
        expected: &str,
    ) -> MalformedRecordError {
        MalformedRecordError {
            row_id: record.row_id,
            application_id: application_id.to_string(),
            section: section.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Walk `segments` from the root. A non-object at an intermediate step marks
/// that section as malformed and yields null.
fn lookup(root: &Map<String, Value>, segments: &[&str], bad_sections: &mut BTreeSet<String>) -> Value {
    let mut current = root;
    for (depth, segment) in segments.iter().enumerate() {
        let value = match current.get(*segment) {
            Some(v) => v,
            None => return Value::Null,
        };

        if depth + 1 == segments.len() {
            return value.clone();
        }

        match value {
            Value::Object(obj) => current = obj,
            Value::Null => return Value::Null,
            _ => {
                bad_sections.insert(segments[..=depth].join("."));
                return Value::Null;
            }
        }
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_flattener() -> Flattener {
        Flattener::new(AttributeRegistry::credit_applications())
    }

    fn create_test_record() -> RawRecord {
        RawRecord::new(
            7,
            json!({
                "_id": "app_001",
                "processing_timestamp": "2024-01-02T00:00:00",
                "applicant_info": {
                    "full_name": "Jane Doe",
                    "email": "Jane@Example.com",
                    "ssn": "123-45-6789",
                    "gender": "F",
                    "date_of_birth": "05/07/1990",
                    "zip_code": "10001"
                },
                "financials": {
                    "annual_income": 55000,
                    "debt_to_income": 1.4
                },
                "decision": { "loan_approved": true },
                "spending_behavior": [
                    { "category": "groceries", "amount": 120 },
                    { "category": "", "amount": "-5" }
                ]
            }),
        )
    }

    #[test]
    fn test_flatten_full_record() {
        let flattener = create_test_flattener();
        let out = flattener.flatten(&create_test_record());

        assert!(out.errors.is_empty());
        assert_eq!(out.row.row_id, 7);
        assert_eq!(out.row.application_id, "app_001");
        assert_eq!(out.row.raw("applicant_info.email"), &json!("Jane@Example.com"));
        assert_eq!(out.row.raw("financials.debt_to_income"), &json!(1.4));
        assert_eq!(out.row.processing_timestamp(), Some("2024-01-02T00:00:00"));
        assert_eq!(out.spending_items.len(), 2);
        assert_eq!(out.spending_items[1].item_index, 1);
        assert_eq!(out.spending_items[1].raw("spending_behavior[].amount"), &json!("-5"));
    }

    #[test]
    fn test_sparse_record_keeps_every_column() {
        let flattener = create_test_flattener();
        let out = flattener.flatten(&RawRecord::new(0, json!({"_id": "app_002"})));

        let app_columns = flattener
            .registry()
            .in_scope(FieldScope::Application)
            .count();
        assert_eq!(out.row.raw.len(), app_columns);
        assert!(out.row.raw.values().all(|v| v.is_null()));
        assert!(out.spending_items.is_empty());
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_flatten_is_deterministic() {
        let flattener = create_test_flattener();
        let record = create_test_record();

        assert_eq!(flattener.flatten(&record), flattener.flatten(&record));
    }

    #[test]
    fn test_non_object_section_is_malformed() {
        let flattener = create_test_flattener();
        let record = RawRecord::new(
            3,
            json!({
                "_id": "app_003",
                "applicant_info": "Jane Doe",
                "financials": { "annual_income": 10 }
            }),
        );

        let out = flattener.flatten(&record);

        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].section, "applicant_info");
        assert!(out.row.raw("applicant_info.full_name").is_null());
        assert_eq!(out.row.raw("financials.annual_income"), &json!(10));
    }

    #[test]
    fn test_spending_not_a_list_is_malformed() {
        let flattener = create_test_flattener();
        let record = RawRecord::new(
            4,
            json!({ "_id": "app_004", "spending_behavior": { "category": "rent" } }),
        );

        let out = flattener.flatten(&record);

        assert!(out.spending_items.is_empty());
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].section, "spending_behavior");
        assert_eq!(out.errors[0].expected, "a list");
    }

    #[test]
    fn test_non_object_record_still_emits_row() {
        let flattener = create_test_flattener();
        let out = flattener.flatten(&RawRecord::new(9, json!(["not", "a", "record"])));

        assert_eq!(out.row.row_id, 9);
        assert_eq!(out.row.application_id, "");
        assert!(out.row.raw.values().all(|v| v.is_null()));
        assert_eq!(out.errors[0].section, "record");
    }

    #[test]
    fn test_application_id_shapes() {
        assert_eq!(RawRecord::new(0, json!({"_id": 42})).application_id(), "42");
        assert_eq!(
            RawRecord::new(0, json!({"_id": {"$oid": "abc"}})).application_id(),
            "abc"
        );
        assert_eq!(RawRecord::new(0, json!({})).application_id(), "");
    }

    #[test]
    fn test_from_batch_numbers_by_ingestion_order() {
        let records = RawRecord::from_batch(vec![json!({"_id": "a"}), json!({"_id": "b"})]);

        assert_eq!(records[0].row_id, 0);
        assert_eq!(records[1].row_id, 1);
    }
}
