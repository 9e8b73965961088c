//! `TaskAggregator`: log ingest, summary rebuilds and monthly billing lookups.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use crate::context::{ADMIN_ROLES, RequestContext, TASK_LOG_ROLES};
use crate::error::{Result, ValidationError};
use crate::regions::model::ServiceAreaRefresh;
use crate::store::Database;

use super::dates::normalize_task_date;
use super::model::{
    BillingCode, Granularity, NewBillingCode, PatientBillingRow, RollupReport, StaffKind,
    SummaryRow, TaskLogEntry,
};
use super::rollup::patient_month_totals;

pub struct TaskAggregator {
    db: Arc<dyn Database>,
}

impl TaskAggregator {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Append raw log rows with dates normalized to ISO where they parse.
    ///
    /// Malformed rows are stored as-is; the rollup counts them as skipped.
    pub async fn ingest(
        &self,
        ctx: &RequestContext,
        kind: StaffKind,
        rows: &[TaskLogEntry],
    ) -> Result<u64> {
        ctx.require_any(TASK_LOG_ROLES, "log tasks")?;
        let normalized: Vec<TaskLogEntry> = rows
            .iter()
            .map(|row| TaskLogEntry {
                task_date: normalize_task_date(&row.task_date),
                ..row.clone()
            })
            .collect();
        let inserted = self.db.insert_task_logs(kind, &normalized).await?;
        info!(
            request_id = %ctx.request_id,
            staff_kind = kind.as_str(),
            inserted,
            "Task logs ingested"
        );
        Ok(inserted)
    }

    pub async fn aggregate_monthly(
        &self,
        ctx: &RequestContext,
        kind: StaffKind,
    ) -> Result<RollupReport> {
        self.rebuild(ctx, kind, Granularity::Monthly).await
    }

    pub async fn aggregate_weekly(
        &self,
        ctx: &RequestContext,
        kind: StaffKind,
    ) -> Result<RollupReport> {
        self.rebuild(ctx, kind, Granularity::Weekly).await
    }

    /// Recompute every summary row for `kind`/`granularity` from the log
    /// and swap them in atomically.
    pub async fn rebuild(
        &self,
        ctx: &RequestContext,
        kind: StaffKind,
        granularity: Granularity,
    ) -> Result<RollupReport> {
        ctx.require_any(ADMIN_ROLES, "rebuild summaries")?;
        let report = self
            .db
            .rebuild_summaries(kind, granularity, Utc::now())
            .await?;

        if report.skipped.total() > 0 {
            warn!(
                request_id = %ctx.request_id,
                staff_kind = kind.as_str(),
                granularity = granularity.as_str(),
                invalid_staff_id = report.skipped.invalid_staff_id,
                unparseable_date = report.skipped.unparseable_date,
                non_positive_minutes = report.skipped.non_positive_minutes,
                "Skipped task log rows during rollup"
            );
        }
        info!(
            request_id = %ctx.request_id,
            staff_kind = kind.as_str(),
            granularity = granularity.as_str(),
            rows_written = report.rows_written,
            "Summaries rebuilt"
        );
        Ok(report)
    }

    pub async fn summaries(
        &self,
        kind: StaffKind,
        granularity: Granularity,
        staff_id: Option<i64>,
    ) -> Result<Vec<SummaryRow>> {
        Ok(self.db.list_summaries(kind, granularity, staff_id).await?)
    }

    /// Rebuild the provider county and zip caches.
    pub async fn refresh_service_area_maps(
        &self,
        ctx: &RequestContext,
    ) -> Result<ServiceAreaRefresh> {
        ctx.require_any(ADMIN_ROLES, "refresh service areas")?;
        let refresh = self.db.refresh_service_area_maps(Utc::now()).await?;
        info!(
            request_id = %ctx.request_id,
            county_rows = refresh.county_rows,
            zip_rows = refresh.zip_rows,
            "Service-area maps refreshed"
        );
        Ok(refresh)
    }

    pub async fn add_billing_code(
        &self,
        ctx: &RequestContext,
        code: &NewBillingCode,
    ) -> Result<i64> {
        ctx.require_any(ADMIN_ROLES, "manage billing codes")?;
        code.validate()?;
        let code_id = self
            .db
            .insert_billing_code(
                code.billing_code.trim(),
                code.description.as_deref(),
                code.min_minutes,
                code.max_minutes,
            )
            .await?;
        info!(
            request_id = %ctx.request_id,
            code_id,
            billing_code = %code.billing_code.trim(),
            "Billing code added"
        );
        Ok(code_id)
    }

    pub async fn billing_codes(&self) -> Result<Vec<BillingCode>> {
        Ok(self.db.list_billing_codes().await?)
    }

    /// Coordinator minutes per patient for a month, each matched to the
    /// first billing code whose range contains the total.
    pub async fn patient_monthly_billing(
        &self,
        year: i32,
        month: u32,
    ) -> Result<Vec<PatientBillingRow>> {
        if NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(ValidationError::InvalidValue {
                field: "month",
                value: format!("{year}-{month}"),
            }
            .into());
        }

        let logs = self.db.list_task_logs(StaffKind::Coordinator).await?;
        let codes = self.db.list_billing_codes().await?;
        let totals = patient_month_totals(year, month, logs.iter().map(|row| &row.entry));

        Ok(totals
            .into_iter()
            .map(|(patient_id, total_minutes)| PatientBillingRow {
                billing_code: codes
                    .iter()
                    .find(|code| code.covers(total_minutes))
                    .map(|code| code.billing_code.clone()),
                patient_id,
                year,
                month,
                total_minutes,
            })
            .collect())
    }
}
