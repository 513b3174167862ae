//! Provisioning run report.

use crate::image::ImageDigest;
use crate::step::{ProvisionStep, StepOutcome};
use crate::verify::ToolchainReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: ProvisionStep,

    pub outcome: StepOutcome,

    /// Layer cache key of the step.
    pub layer_key: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Error message when the step failed.
    pub error: Option<String>,
}

impl StepRecord {
    pub fn passed(&self) -> bool {
        self.outcome != StepOutcome::Failed
    }
}

/// Result of a complete provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub run_id: Uuid,

    pub started_at: DateTime<Utc>,

    /// Whether every step passed.
    pub success: bool,

    /// Steps in execution order. Steps after a failure are absent.
    pub steps: Vec<StepRecord>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,

    /// Digest of the plan that was executed.
    pub plan_digest: String,

    /// Digest of the environment contract.
    pub contract_digest: String,

    /// Registry digest the base image resolved to.
    pub image_digest: Option<ImageDigest>,

    /// Versions collected by the verification step.
    pub toolchain: Option<ToolchainReport>,
}

impl ProvisionReport {
    pub fn new(plan_digest: String, contract_digest: String) -> Self {
        ProvisionReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            success: false,
            steps: Vec::new(),
            duration_ms: 0,
            plan_digest,
            contract_digest,
            image_digest: None,
            toolchain: None,
        }
    }

    /// Number of steps that changed the host.
    pub fn applied_count(&self) -> usize {
        self.count(StepOutcome::Applied)
    }

    /// Number of steps whose postcondition already held.
    pub fn skipped_count(&self) -> usize {
        self.count(StepOutcome::Skipped)
    }

    /// The step that aborted the run, if any.
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.outcome == StepOutcome::Failed)
    }

    pub fn outcome_of(&self, step: ProvisionStep) -> Option<StepOutcome> {
        self.steps.iter().find(|s| s.step == step).map(|s| s.outcome)
    }

    fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: ProvisionStep, outcome: StepOutcome) -> StepRecord {
        StepRecord {
            step,
            outcome,
            layer_key: "k".to_string(),
            duration_ms: 1,
            error: None,
        }
    }

    #[test]
    fn test_report_counts() {
        let mut report = ProvisionReport::new("plan".into(), "contract".into());
        report.steps = vec![
            record(ProvisionStep::PinBaseImage, StepOutcome::Applied),
            record(ProvisionStep::InstallSystemPackages, StepOutcome::Skipped),
            record(ProvisionStep::InstallToolchain, StepOutcome::Failed),
        ];

        assert_eq!(report.applied_count(), 1);
        assert_eq!(report.skipped_count(), 1);
        assert_eq!(
            report.failed_step().map(|s| s.step),
            Some(ProvisionStep::InstallToolchain)
        );
        assert_eq!(
            report.outcome_of(ProvisionStep::InstallSystemPackages),
            Some(StepOutcome::Skipped)
        );
        assert_eq!(report.outcome_of(ProvisionStep::RegisterTarget), None);
        assert!(!report.steps[2].passed());
    }

    #[test]
    fn test_report_serializes() {
        let report = ProvisionReport::new("plan".into(), "contract".into());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["plan_digest"], "plan");
        assert_eq!(json["success"], false);
    }
}
