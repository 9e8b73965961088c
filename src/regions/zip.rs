//! Zip normalization and matching. Pure functions, no I/O.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::model::Region;

/// How a zip was resolved to a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    /// Heuristic prefix fallback. Callers should surface it for review.
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipMatch {
    pub region_id: i64,
    pub kind: MatchKind,
}

/// Trim and reduce a zip or zip range to its start code.
///
/// `"94102–94134"` and `"94102-94134"` both become `"94102"`. Blank input
/// yields `None`.
pub fn normalize_zip(raw: &str) -> Option<String> {
    let start = raw
        .split(['\u{2013}', '-'])
        .next()
        .unwrap_or_default()
        .trim();
    if start.is_empty() {
        None
    } else {
        Some(start.to_string())
    }
}

fn shared_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

/// Resolve a patient zip against candidate regions.
///
/// An exact match on the region's start code wins. Otherwise a region is a
/// prefix candidate when either code is a prefix of the other, or when the
/// two share at least `min_prefix_len` leading characters; the longest
/// shared prefix wins. Ties go to the lowest region id.
pub fn match_zip(zip: &str, regions: &[Region], min_prefix_len: usize) -> Option<ZipMatch> {
    let zip = normalize_zip(zip)?;

    let codes: Vec<(i64, String)> = regions
        .iter()
        .filter_map(|r| normalize_zip(&r.zip_code).map(|code| (r.region_id, code)))
        .collect();

    if let Some(region_id) = codes
        .iter()
        .filter(|(_, code)| *code == zip)
        .map(|(id, _)| *id)
        .min()
    {
        return Some(ZipMatch {
            region_id,
            kind: MatchKind::Exact,
        });
    }

    codes
        .iter()
        .filter_map(|(id, code)| {
            let shared = shared_prefix_len(&zip, code);
            let one_sided = code.starts_with(zip.as_str()) || zip.starts_with(code.as_str());
            (shared > 0 && (one_sided || shared >= min_prefix_len)).then_some((*id, shared))
        })
        .min_by(|(a_id, a_len), (b_id, b_len)| b_len.cmp(a_len).then(a_id.cmp(b_id)))
        .map(|(region_id, _)| ZipMatch {
            region_id,
            kind: MatchKind::Prefix,
        })
}

/// Order zip strings numerically by their start code; non-numeric codes
/// sort after numeric ones, lexically.
pub fn compare_zip_codes(a: &str, b: &str) -> Ordering {
    let key = |s: &str| {
        normalize_zip(s)
            .and_then(|z| z.parse::<u64>().ok())
    };
    match (key(a), key(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}
