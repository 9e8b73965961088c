//! `RegionReconciler` ties patients and providers to zip-anchored regions.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{RegionConfig, UnassignedProviderPolicy};
use crate::context::{REGION_ROLES, RequestContext};
use crate::error::{Error, Result, ValidationError};
use crate::patients::Patient;
use crate::store::Database;

use super::model::{CountyCount, NewRegion, RegionAssignment, ZipCount};
use super::zip::{MatchKind, match_zip, normalize_zip};

pub struct RegionReconciler {
    db: Arc<dyn Database>,
    config: RegionConfig,
}

impl RegionReconciler {
    pub fn new(db: Arc<dyn Database>, config: RegionConfig) -> Self {
        Self { db, config }
    }

    async fn load_patient(&self, patient_id: i64) -> Result<Patient> {
        self.db
            .get_patient(patient_id)
            .await?
            .ok_or_else(|| Error::not_found("patient", patient_id))
    }

    async fn require_provider(&self, provider_id: i64) -> Result<()> {
        if self.db.provider_exists(provider_id).await? {
            Ok(())
        } else {
            Err(Error::not_found("provider", provider_id))
        }
    }

    /// Resolve the patient's zip against active regions and store the result.
    ///
    /// A prefix match is stored but logged at WARN for review. A blank or
    /// unmatched zip clears the region.
    pub async fn assign_patient_to_region(
        &self,
        ctx: &RequestContext,
        patient_id: i64,
    ) -> Result<RegionAssignment> {
        ctx.require_any(REGION_ROLES, "assign patient regions")?;
        let patient = self.load_patient(patient_id).await?;
        let regions = self.db.list_active_regions().await?;

        let found = match_zip(
            &patient.address.zip,
            &regions,
            self.config.zip_min_prefix_len,
        );
        match found {
            Some(m) if m.kind == MatchKind::Prefix => {
                let region_zip = regions
                    .iter()
                    .find(|r| r.region_id == m.region_id)
                    .map(|r| r.zip_code.as_str())
                    .unwrap_or_default();
                warn!(
                    request_id = %ctx.request_id,
                    patient_id,
                    zip = %patient.address.zip,
                    region_id = m.region_id,
                    region_zip,
                    "Zip matched a region by prefix only"
                );
            }
            Some(_) => {}
            None => debug!(patient_id, zip = %patient.address.zip, "No region for zip"),
        }

        let region_id = found.map(|m| m.region_id);
        let changed = patient.region_id != region_id;
        if changed {
            self.db
                .set_patient_region(patient_id, region_id, Utc::now())
                .await?;
            info!(
                request_id = %ctx.request_id,
                patient_id,
                from = ?patient.region_id,
                to = ?region_id,
                "Patient region updated"
            );
        }

        Ok(RegionAssignment {
            patient_id,
            region_id,
            match_kind: found.map(|m| m.kind),
            changed,
        })
    }

    /// Whether the provider is assigned to the region.
    pub async fn provider_serves_region(&self, provider_id: i64, region_id: i64) -> Result<bool> {
        self.require_provider(provider_id).await?;
        let regions = self.db.list_provider_region_ids(provider_id).await?;
        Ok(regions.contains(&region_id))
    }

    /// Whether the patient's region county lies outside every county the
    /// provider's regions cover.
    ///
    /// Providers without any region follow `unassigned_provider_policy`. A
    /// patient without a region or county is outside a constrained provider.
    pub async fn is_patient_outside_provider_region(
        &self,
        patient_id: i64,
        provider_id: i64,
    ) -> Result<bool> {
        self.require_provider(provider_id).await?;
        let patient = self.load_patient(patient_id).await?;

        if self.db.list_provider_region_ids(provider_id).await?.is_empty() {
            return Ok(match self.config.unassigned_provider_policy {
                UnassignedProviderPolicy::Unconstrained => false,
                UnassignedProviderPolicy::Strict => true,
            });
        }

        let county = match patient.region_id {
            Some(region_id) => self
                .db
                .get_region(region_id)
                .await?
                .and_then(|r| r.county)
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            None => None,
        };
        let Some(county) = county else {
            return Ok(true);
        };

        let served = self.db.list_provider_region_counties(provider_id).await?;
        Ok(!served.iter().any(|c| c.eq_ignore_ascii_case(&county)))
    }

    /// Counties the provider serves, alphabetical, from the service-area cache.
    pub async fn list_provider_counties(&self, provider_id: i64) -> Result<Vec<CountyCount>> {
        self.require_provider(provider_id).await?;
        Ok(self.db.list_cached_provider_counties(provider_id).await?)
    }

    /// Zip codes the provider serves, numeric order, from the service-area cache.
    pub async fn list_provider_zip_codes(&self, provider_id: i64) -> Result<Vec<ZipCount>> {
        self.require_provider(provider_id).await?;
        Ok(self.db.list_cached_provider_zip_codes(provider_id).await?)
    }

    pub async fn create_region(&self, ctx: &RequestContext, region: &NewRegion) -> Result<i64> {
        ctx.require_any(REGION_ROLES, "create regions")?;
        if normalize_zip(&region.zip_code).is_none() {
            return Err(ValidationError::MissingField { field: "zip_code" }.into());
        }
        let region_id = self.db.insert_region(region).await?;
        info!(
            request_id = %ctx.request_id,
            region_id,
            zip = %region.zip_code,
            status = region.status.as_str(),
            "Region created"
        );
        Ok(region_id)
    }

    pub async fn assign_provider_region(
        &self,
        ctx: &RequestContext,
        provider_id: i64,
        region_id: i64,
    ) -> Result<()> {
        ctx.require_any(REGION_ROLES, "assign provider regions")?;
        self.require_provider(provider_id).await?;
        if self.db.get_region(region_id).await?.is_none() {
            return Err(Error::not_found("region", region_id));
        }
        self.db.assign_provider_region(provider_id, region_id).await?;
        info!(request_id = %ctx.request_id, provider_id, region_id, "Provider region assigned");
        Ok(())
    }
}
