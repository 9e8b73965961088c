//! Onboarding state machine: which stage a record is in, derived from its
//! five completion flags.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Number of flag-backed stages.
pub const STAGE_COUNT: u8 = 5;

/// The stages of patient onboarding.
///
/// Progresses linearly: Registration → EligibilityVerification →
/// ChartCreation → IntakeProcessing → TvScheduling → HandoffReady.
/// Handoff itself is recorded by `completed_date`, not by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStage {
    Registration,
    EligibilityVerification,
    ChartCreation,
    IntakeProcessing,
    TvScheduling,
    HandoffReady,
}

impl OnboardingStage {
    pub const ALL: [OnboardingStage; 6] = [
        Self::Registration,
        Self::EligibilityVerification,
        Self::ChartCreation,
        Self::IntakeProcessing,
        Self::TvScheduling,
        Self::HandoffReady,
    ];

    /// 1-based stage number; `HandoffReady` is 6.
    pub fn number(&self) -> u8 {
        match self {
            Self::Registration => 1,
            Self::EligibilityVerification => 2,
            Self::ChartCreation => 3,
            Self::IntakeProcessing => 4,
            Self::TvScheduling => 5,
            Self::HandoffReady => 6,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.get(usize::from(n).checked_sub(1)?).copied()
    }

    /// Human-facing label used in queue views.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Registration => "Patient Registration",
            Self::EligibilityVerification => "Eligibility Verification",
            Self::ChartCreation => "Chart Creation",
            Self::IntakeProcessing => "Intake Processing",
            Self::TvScheduling => "TV Scheduling",
            Self::HandoffReady => "Ready for Handoff",
        }
    }
}

impl std::fmt::Display for OnboardingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Registration => "registration",
            Self::EligibilityVerification => "eligibility_verification",
            Self::ChartCreation => "chart_creation",
            Self::IntakeProcessing => "intake_processing",
            Self::TvScheduling => "tv_scheduling",
            Self::HandoffReady => "handoff_ready",
        };
        write!(f, "{s}")
    }
}

/// The five `stageN_complete` flags of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageFlags(pub [bool; 5]);

impl StageFlags {
    /// Flags for a freshly registered record: stage 1 only.
    pub fn registered() -> Self {
        Self([true, false, false, false, false])
    }

    pub fn is_complete(&self, stage: u8) -> bool {
        stage_index(stage).is_some_and(|i| self.0[i])
    }

    /// First stage whose flag is false, else `HandoffReady`.
    pub fn current_stage(&self) -> OnboardingStage {
        self.0
            .iter()
            .position(|done| !done)
            .and_then(|i| OnboardingStage::from_number(i as u8 + 1))
            .unwrap_or(OnboardingStage::HandoffReady)
    }

    pub fn completed_count(&self) -> u8 {
        self.0.iter().filter(|done| **done).count() as u8
    }

    pub fn all_complete(&self) -> bool {
        self.0.iter().all(|done| *done)
    }

    /// Lowest incomplete stage number, if any.
    pub fn first_missing(&self) -> Option<u8> {
        self.0.iter().position(|done| !done).map(|i| i as u8 + 1)
    }

    /// Flags are contiguous from stage 1: no later flag set past a gap.
    pub fn is_ordered(&self) -> bool {
        self.0.windows(2).all(|w| w[0] || !w[1])
    }

    /// Validate and apply completion of `stage`.
    ///
    /// Returns `Ok(false)` when the stage was already complete (no-op).
    pub fn complete(&mut self, stage: u8) -> Result<bool, ValidationError> {
        let idx = stage_index(stage).ok_or(ValidationError::InvalidValue {
            field: "stage",
            value: stage.to_string(),
        })?;
        if self.0[idx] {
            return Ok(false);
        }
        if idx > 0 && !self.0[idx - 1] {
            return Err(ValidationError::StageOutOfOrder {
                stage,
                required: stage - 1,
            });
        }
        self.0[idx] = true;
        Ok(true)
    }
}

fn stage_index(stage: u8) -> Option<usize> {
    (1..=STAGE_COUNT)
        .contains(&stage)
        .then(|| usize::from(stage - 1))
}

/// Stage a template step belongs to: three steps per stage, clamped to 5.
pub fn stage_for_step_order(step_order: i64) -> u8 {
    let stage = (step_order.max(1) - 1) / 3 + 1;
    stage.min(i64::from(STAGE_COUNT)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_numbers_round_trip() {
        for stage in OnboardingStage::ALL {
            assert_eq!(OnboardingStage::from_number(stage.number()), Some(stage));
        }
        assert_eq!(OnboardingStage::from_number(0), None);
        assert_eq!(OnboardingStage::from_number(7), None);
    }

    #[test]
    fn current_stage_is_first_incomplete() {
        assert_eq!(
            StageFlags::registered().current_stage(),
            OnboardingStage::EligibilityVerification
        );
        assert_eq!(
            StageFlags([true, true, true, false, false]).current_stage(),
            OnboardingStage::IntakeProcessing
        );
        assert_eq!(
            StageFlags([true; 5]).current_stage(),
            OnboardingStage::HandoffReady
        );
        assert_eq!(StageFlags::default().current_stage(), OnboardingStage::Registration);
    }

    #[test]
    fn complete_enforces_order() {
        let mut flags = StageFlags::registered();
        assert_eq!(
            flags.complete(3),
            Err(ValidationError::StageOutOfOrder {
                stage: 3,
                required: 2
            })
        );
        assert_eq!(flags.complete(2), Ok(true));
        assert_eq!(flags.complete(2), Ok(false));
        assert_eq!(flags.completed_count(), 2);
        assert!(flags.is_ordered());
    }

    #[test]
    fn complete_rejects_out_of_range() {
        let mut flags = StageFlags::registered();
        assert!(flags.complete(0).is_err());
        assert!(flags.complete(6).is_err());
    }

    #[test]
    fn ordering_check_detects_gaps() {
        assert!(!StageFlags([true, false, true, false, false]).is_ordered());
        assert!(StageFlags([true, true, false, false, false]).is_ordered());
    }

    #[test]
    fn step_order_partition() {
        assert_eq!(stage_for_step_order(1), 1);
        assert_eq!(stage_for_step_order(3), 1);
        assert_eq!(stage_for_step_order(4), 2);
        assert_eq!(stage_for_step_order(13), 5);
        assert_eq!(stage_for_step_order(15), 5);
        assert_eq!(stage_for_step_order(22), 5);
    }
}
