//! Onboarding workflow: five ordered stages from referral to patient handoff.
//!
//! A record is registered (stage 1) at creation, then moves through
//! eligibility, chart creation, intake processing, and TV scheduling. Each
//! stage has a fixed form and a completion gate. Once all five flags are set
//! the record can be handed off into the patient table.

pub mod engine;
pub mod model;
pub mod routes;
pub mod state;

pub use engine::OnboardingEngine;
pub use model::{IntakeData, OnboardingRecord, QueueEntry, StageSubmission};
pub use routes::{OnboardingRouteState, onboarding_routes};
pub use state::{OnboardingStage, StageFlags};
