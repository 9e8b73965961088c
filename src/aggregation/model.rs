//! Task log and summary data model.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Which log a rollup reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffKind {
    Coordinator,
    Provider,
}

impl StaffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Provider => "provider",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinator" | "coordinators" => Ok(Self::Coordinator),
            "provider" | "providers" => Ok(Self::Provider),
            other => Err(ValidationError::InvalidValue {
                field: "staff_kind",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for StaffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Monthly,
    /// ISO-8601 weeks, Monday through Sunday.
    Weekly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(Self::Monthly),
            "weekly" | "week" => Ok(Self::Weekly),
            other => Err(ValidationError::InvalidValue {
                field: "granularity",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task log entry as submitted or imported. Fields stay loosely typed
/// because legacy imports carry non-numeric ids and free-form dates.
///
/// Ids and dates accept JSON strings or numbers, and minutes accept numbers
/// or numeric strings. Nulls and unreadable minutes deserialize to empty
/// values so the row is stored and later counted as skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    #[serde(default, deserialize_with = "loose_text")]
    pub staff_id: String,
    #[serde(default, deserialize_with = "loose_optional_text")]
    pub patient_id: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub task_date: String,
    #[serde(default, deserialize_with = "loose_minutes")]
    pub minutes: Option<i64>,
    #[serde(default)]
    pub task_description: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn loose_optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}

fn loose_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(loose_optional_text(deserializer)?.unwrap_or_default())
}

fn loose_minutes<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let minutes = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.round() as i64)
            })
        }
        _ => None,
    };
    Ok(minutes)
}

/// A stored task log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogRow {
    pub task_id: i64,
    #[serde(flatten)]
    pub entry: TaskLogEntry,
}

/// A log row that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTask {
    pub staff_id: i64,
    pub patient_id: Option<String>,
    pub date: NaiveDate,
    pub minutes: i64,
}

/// Why a log row was left out of a rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InvalidStaffId,
    UnparseableDate,
    NonPositiveMinutes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub invalid_staff_id: u64,
    pub unparseable_date: u64,
    pub non_positive_minutes: u64,
}

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::InvalidStaffId => self.invalid_staff_id += 1,
            SkipReason::UnparseableDate => self.unparseable_date += 1,
            SkipReason::NonPositiveMinutes => self.non_positive_minutes += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.invalid_staff_id + self.unparseable_date + self.non_positive_minutes
    }
}

/// One staff member's totals for one period.
///
/// `period` is the month (1–12) or ISO week (1–53); `year` is the ISO
/// week-year for weekly rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub staff_kind: StaffKind,
    pub granularity: Granularity,
    pub staff_id: i64,
    pub year: i32,
    pub period: u32,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub total_minutes: i64,
    pub total_tasks: i64,
    pub distinct_patients: i64,
    pub avg_minutes_per_task: Decimal,
    pub minutes_per_patient: Decimal,
}

/// Output of the pure aggregation step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollup {
    pub rows: Vec<SummaryRow>,
    pub skipped: SkipCounts,
}

/// Result of a persisted rollup refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupReport {
    pub staff_kind: StaffKind,
    pub granularity: Granularity,
    pub rows_written: u64,
    pub skipped: SkipCounts,
}

/// A coordinator billing code covering a band of monthly minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCode {
    pub code_id: i64,
    pub billing_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub min_minutes: i64,
    pub max_minutes: i64,
}

impl BillingCode {
    pub fn covers(&self, minutes: i64) -> bool {
        (self.min_minutes..=self.max_minutes).contains(&minutes)
    }
}

/// Fields for adding a billing code band.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBillingCode {
    pub billing_code: String,
    #[serde(default)]
    pub description: Option<String>,
    pub min_minutes: i64,
    pub max_minutes: i64,
}

impl NewBillingCode {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.billing_code.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "billing_code",
            });
        }
        if self.min_minutes < 0 || self.min_minutes > self.max_minutes {
            return Err(ValidationError::InvalidValue {
                field: "minutes",
                value: format!("{}..={}", self.min_minutes, self.max_minutes),
            });
        }
        Ok(())
    }
}

/// A patient's coordinated minutes for one month and the code they bill to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientBillingRow {
    pub patient_id: String,
    pub year: i32,
    pub month: u32,
    pub total_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_code: Option<String>,
}
