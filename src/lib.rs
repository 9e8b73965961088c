//! Care Ops: the operations core of a home-care staffing service.
//!
//! Referrals move through the onboarding workflow into the patient table,
//! patients are reconciled to zip-anchored regions, and staff task logs are
//! rolled up into period summaries.

pub mod aggregation;
pub mod config;
pub mod context;
pub mod error;
pub mod onboarding;
pub mod patients;
pub mod regions;
pub mod server;
pub mod store;
