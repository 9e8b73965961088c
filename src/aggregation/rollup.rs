//! Pure rollup of task logs into per-staff period summaries.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, Months, NaiveDate, Weekday};
use rust_decimal::Decimal;

use super::dates::parse_task_date;
use super::model::{
    Granularity, NormalizedTask, Rollup, SkipCounts, SkipReason, StaffKind, SummaryRow,
    TaskLogEntry,
};

/// Validate one log row for aggregation.
///
/// Staff ids must be all digits; dates must parse; minutes must be present
/// and positive.
pub fn normalize(entry: &TaskLogEntry) -> Result<NormalizedTask, SkipReason> {
    let staff = entry.staff_id.trim();
    if staff.is_empty() || !staff.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SkipReason::InvalidStaffId);
    }
    let staff_id: i64 = staff.parse().map_err(|_| SkipReason::InvalidStaffId)?;

    let date = parse_task_date(&entry.task_date).ok_or(SkipReason::UnparseableDate)?;

    let minutes = entry
        .minutes
        .filter(|m| *m > 0)
        .ok_or(SkipReason::NonPositiveMinutes)?;

    let patient_id = entry
        .patient_id
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    Ok(NormalizedTask {
        staff_id,
        patient_id,
        date,
        minutes,
    })
}

/// Calendar bounds of a period.
pub fn period_bounds(granularity: Granularity, year: i32, period: u32) -> Option<(NaiveDate, NaiveDate)> {
    match granularity {
        Granularity::Monthly => {
            let start = NaiveDate::from_ymd_opt(year, period, 1)?;
            let end = start.checked_add_months(Months::new(1))?.pred_opt()?;
            Some((start, end))
        }
        Granularity::Weekly => {
            let start = NaiveDate::from_isoywd_opt(year, period, Weekday::Mon)?;
            let end = NaiveDate::from_isoywd_opt(year, period, Weekday::Sun)?;
            Some((start, end))
        }
    }
}

fn period_key(granularity: Granularity, date: NaiveDate) -> (i32, u32) {
    match granularity {
        Granularity::Monthly => (date.year(), date.month()),
        Granularity::Weekly => {
            let week = date.iso_week();
            (week.year(), week.week())
        }
    }
}

#[derive(Default)]
struct Accumulator {
    minutes: i64,
    tasks: i64,
    patients: BTreeSet<String>,
}

fn ratio(numerator: i64, denominator: i64) -> Decimal {
    if denominator == 0 {
        Decimal::ZERO
    } else {
        (Decimal::from(numerator) / Decimal::from(denominator)).round_dp(2)
    }
}

/// Group valid rows by staff and period and compute totals.
///
/// Rows come back ordered by staff id, then year, then period.
pub fn aggregate<'a, I>(kind: StaffKind, granularity: Granularity, entries: I) -> Rollup
where
    I: IntoIterator<Item = &'a TaskLogEntry>,
{
    let mut groups: BTreeMap<(i64, i32, u32), Accumulator> = BTreeMap::new();
    let mut skipped = SkipCounts::default();

    for entry in entries {
        let task = match normalize(entry) {
            Ok(task) => task,
            Err(reason) => {
                skipped.record(reason);
                continue;
            }
        };
        let (year, period) = period_key(granularity, task.date);
        let acc = groups.entry((task.staff_id, year, period)).or_default();
        acc.minutes += task.minutes;
        acc.tasks += 1;
        if let Some(patient) = task.patient_id {
            acc.patients.insert(patient);
        }
    }

    let rows = groups
        .into_iter()
        .filter_map(|((staff_id, year, period), acc)| {
            let (period_start, period_end) = period_bounds(granularity, year, period)?;
            let distinct_patients = acc.patients.len() as i64;
            Some(SummaryRow {
                staff_kind: kind,
                granularity,
                staff_id,
                year,
                period,
                period_start,
                period_end,
                total_minutes: acc.minutes,
                total_tasks: acc.tasks,
                distinct_patients,
                avg_minutes_per_task: ratio(acc.minutes, acc.tasks),
                minutes_per_patient: ratio(acc.minutes, distinct_patients),
            })
        })
        .collect();

    Rollup { rows, skipped }
}

/// Valid minutes per patient within one calendar month.
///
/// Rows without a patient or failing `normalize` are ignored.
pub fn patient_month_totals<'a, I>(year: i32, month: u32, entries: I) -> BTreeMap<String, i64>
where
    I: IntoIterator<Item = &'a TaskLogEntry>,
{
    let mut totals = BTreeMap::new();
    for task in entries.into_iter().filter_map(|e| normalize(e).ok()) {
        if task.date.year() != year || task.date.month() != month {
            continue;
        }
        if let Some(patient) = task.patient_id {
            *totals.entry(patient).or_insert(0) += task.minutes;
        }
    }
    totals
}
