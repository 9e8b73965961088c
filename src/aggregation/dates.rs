//! Task date parsing for legacy log formats.

use chrono::NaiveDate;

/// Parse a task log date.
///
/// Accepts `MM/DD/YY`, `MM/DD/YYYY`, `YYYY-MM-DD`, and datetimes whose
/// first ten characters are `YYYY-MM-DD`.
pub fn parse_task_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.contains('/') {
        let year_len = raw.rsplit('/').next().map(str::len).unwrap_or(0);
        let format = match year_len {
            2 => "%m/%d/%y",
            4 => "%m/%d/%Y",
            _ => return None,
        };
        return NaiveDate::parse_from_str(raw, format).ok();
    }

    let date_part = raw.get(..10)?;
    let rest = &raw[10..];
    if !(rest.is_empty() || rest.starts_with('T') || rest.starts_with(' ')) {
        return None;
    }
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Normalize a raw date to ISO `YYYY-MM-DD`, keeping unparseable input
/// verbatim so rollups can count it.
pub fn normalize_task_date(raw: &str) -> String {
    match parse_task_date(raw) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => raw.trim().to_string(),
    }
}
