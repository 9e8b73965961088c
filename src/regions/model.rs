//! Region and service-area data model.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::zip::MatchKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionStatus {
    Active,
    Inactive,
}

impl RegionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(ValidationError::InvalidValue {
                field: "region_status",
                value: other.to_string(),
            }),
        }
    }
}

impl Default for RegionStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// A geographic service unit keyed by zip code or zip range.
///
/// `zip_code` may be range-encoded (`"94102–94134"`); matching only ever
/// looks at the start code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub region_id: i64,
    pub zip_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    pub status: RegionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRegion {
    pub zip_code: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default)]
    pub status: RegionStatus,
}

impl NewRegion {
    pub fn active(zip_code: impl Into<String>, county: impl Into<String>) -> Self {
        Self {
            zip_code: zip_code.into(),
            city: None,
            state: None,
            county: Some(county.into()),
            status: RegionStatus::Active,
        }
    }
}

/// A county a provider serves, with the number of patients in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountyCount {
    pub county: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub patient_count: i64,
}

/// A zip code a provider serves, with the number of patients in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipCount {
    pub zip_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub patient_count: i64,
}

/// Result of reconciling one patient's zip against the region table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionAssignment {
    pub patient_id: i64,
    pub region_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_kind: Option<MatchKind>,
    /// Whether the stored region changed.
    pub changed: bool,
}

/// Row counts written by a service-area cache rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAreaRefresh {
    pub county_rows: u64,
    pub zip_rows: u64,
}
