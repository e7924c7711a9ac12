// ⏰ Temporal Parsing
// Date-of-birth and processing-timestamp parsing shared by the cleaner and the resolver.
//
// Accepted date-of-birth shapes:
// 1. YYYY-MM-DD
// 2. YYYY/MM/DD
// 3. DD/MM/YYYY (only when the first part is > 12)
// 4. MM/DD/YYYY
//
// NN/NN/YYYY with both parts <= 12 is read month-first and flagged ambiguous.
// This is a fixed convention, not locale inference.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// The convention applied to NN/NN/YYYY dates where both parts could be a month
pub const DOB_AMBIGUITY_RULE: &str =
    "When DOB is NN/NN/YYYY and both NN <= 12, parse as MM/DD/YYYY.";

/// Canonical rendering of a cleaned processing timestamp
pub const TIMESTAMP_OUTPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Naive timestamp shapes, read as UTC
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

// ============================================================================
// DATE OF BIRTH
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DobFormat {
    IsoDash,
    IsoSlash,
    DayFirst,
    MonthFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DobParse {
    /// Nothing to parse (null or blank)
    Missing,
    Parsed {
        date: NaiveDate,
        format: DobFormat,
        ambiguous: bool,
    },
    Failed,
}

impl DobParse {
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            DobParse::Parsed { date, .. } => Some(*date),
            _ => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, DobParse::Parsed { ambiguous: true, .. })
    }
}

/// True for the NN/NN/YYYY shape (two digits, two digits, four digits)
fn split_numeric_slash_date(text: &str) -> Option<(u32, u32, i32)> {
    let parts: Vec<&str> = text.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    let digits = |s: &str, n: usize| s.len() == n && s.chars().all(|c| c.is_ascii_digit());
    if !digits(parts[0], 2) || !digits(parts[1], 2) || !digits(parts[2], 4) {
        return None;
    }
    Some((
        parts[0].parse().ok()?,
        parts[1].parse().ok()?,
        parts[2].parse().ok()?,
    ))
}

/// True when the text has the ambiguous NN/NN/YYYY shape with both parts <= 12
pub fn is_ambiguous_dob(text: &str) -> bool {
    match split_numeric_slash_date(text.trim()) {
        Some((left, right, _)) => left <= 12 && right <= 12,
        None => false,
    }
}

/// True for text already in canonical YYYY-MM-DD shape
pub fn is_iso_date_shape(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit())
}

pub fn parse_date_of_birth(text: &str) -> DobParse {
    let text = text.trim();
    if text.is_empty() {
        return DobParse::Missing;
    }

    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return DobParse::Parsed { date, format: DobFormat::IsoDash, ambiguous: false };
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y/%m/%d") {
        return DobParse::Parsed { date, format: DobFormat::IsoSlash, ambiguous: false };
    }

    let Some((left, right, year)) = split_numeric_slash_date(text) else {
        return DobParse::Failed;
    };

    let ambiguous = left <= 12 && right <= 12;
    let (month, day, format) = if left > 12 {
        (right, left, DobFormat::DayFirst)
    } else {
        (left, right, DobFormat::MonthFirst)
    };

    match NaiveDate::from_ymd_opt(year, month, day) {
        Some(date) => DobParse::Parsed { date, format, ambiguous },
        None => DobParse::Failed,
    }
}

// ============================================================================
// PROCESSING TIMESTAMP
// ============================================================================

/// Parse a processing timestamp into UTC.
/// Unparseable input is `None`; callers fall back rather than fail.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    // Date-only stamps mean midnight
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_OUTPUT_FORMAT).to_string()
}

// ============================================================================
// AGE
// ============================================================================

/// Whole-year age bands used by the analysis table
pub fn age_band(dob: NaiveDate, reference: NaiveDate) -> Option<&'static str> {
    let days = (reference - dob).num_days();
    if days < 0 {
        return None;
    }
    let years = days as f64 / 365.25;
    let band = if years < 25.0 {
        "<25"
    } else if years < 35.0 {
        "25-34"
    } else if years < 45.0 {
        "35-44"
    } else if years < 55.0 {
        "45-54"
    } else if years < 65.0 {
        "55-64"
    } else {
        "65+"
    };
    Some(band)
}
