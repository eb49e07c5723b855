pub mod driver;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::delivery::DeliveryReceipt;
use super::diagnose::Diagnosis;
use super::extract::ExtractedSummary;
use super::patch::PatchProposal;

pub use driver::{PipelineContext, run_pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Received,
    Extracting,
    Diagnosing,
    Patching,
    SkippedLowConfidence,
    Delivering,
    Done,
    ExtractingFailed,
    DiagnosingFailed,
    PatchingFailed,
    DeliveringFailed,
    Abandoned,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Received => "received",
            RunState::Extracting => "extracting",
            RunState::Diagnosing => "diagnosing",
            RunState::Patching => "patching",
            RunState::SkippedLowConfidence => "skipped_low_confidence",
            RunState::Delivering => "delivering",
            RunState::Done => "done",
            RunState::ExtractingFailed => "extracting_failed",
            RunState::DiagnosingFailed => "diagnosing_failed",
            RunState::PatchingFailed => "patching_failed",
            RunState::DeliveringFailed => "delivering_failed",
            RunState::Abandoned => "abandoned",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "received" => Some(RunState::Received),
            "extracting" => Some(RunState::Extracting),
            "diagnosing" => Some(RunState::Diagnosing),
            "patching" => Some(RunState::Patching),
            "skipped_low_confidence" => Some(RunState::SkippedLowConfidence),
            "delivering" => Some(RunState::Delivering),
            "done" => Some(RunState::Done),
            "extracting_failed" => Some(RunState::ExtractingFailed),
            "diagnosing_failed" => Some(RunState::DiagnosingFailed),
            "patching_failed" => Some(RunState::PatchingFailed),
            "delivering_failed" => Some(RunState::DeliveringFailed),
            "abandoned" => Some(RunState::Abandoned),
            _ => None,
        }
    }

    /// No further stage execution happens from these without manual
    /// intervention.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Abandoned) || self.is_failed()
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            RunState::ExtractingFailed
                | RunState::DiagnosingFailed
                | RunState::PatchingFailed
                | RunState::DeliveringFailed
        )
    }

    pub fn needs_intervention(self) -> bool {
        self.is_failed()
    }
}

pub fn can_transition(from: RunState, to: RunState) -> bool {
    if from == to {
        return true;
    }
    match from {
        RunState::Received => matches!(to, RunState::Extracting | RunState::Abandoned),
        RunState::Extracting => matches!(
            to,
            RunState::Diagnosing | RunState::ExtractingFailed | RunState::Abandoned
        ),
        RunState::Diagnosing => matches!(
            to,
            RunState::Patching
                | RunState::SkippedLowConfidence
                | RunState::DiagnosingFailed
                | RunState::Abandoned
        ),
        RunState::Patching => matches!(
            to,
            RunState::Delivering | RunState::PatchingFailed | RunState::Abandoned
        ),
        RunState::SkippedLowConfidence => {
            matches!(to, RunState::Delivering | RunState::Abandoned)
        }
        RunState::Delivering => matches!(
            to,
            RunState::Done | RunState::DeliveringFailed | RunState::Abandoned
        ),
        RunState::ExtractingFailed
        | RunState::DiagnosingFailed
        | RunState::PatchingFailed
        | RunState::DeliveringFailed => matches!(to, RunState::Abandoned),
        RunState::Done | RunState::Abandoned => false,
    }
}

/// The stage a non-terminal state executes, for attempt bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extracting,
    Diagnosing,
    Patching,
    Delivering,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extracting => "extracting",
            Stage::Diagnosing => "diagnosing",
            Stage::Patching => "patching",
            Stage::Delivering => "delivering",
        }
    }

    pub fn failed_state(self) -> RunState {
        match self {
            Stage::Extracting => RunState::ExtractingFailed,
            Stage::Diagnosing => RunState::DiagnosingFailed,
            Stage::Patching => RunState::PatchingFailed,
            Stage::Delivering => RunState::DeliveringFailed,
        }
    }
}

/// Attempt counters for one stage, split by retry class so schema
/// violations can carry a smaller budget than genuine outages.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageAttempts {
    #[serde(default)]
    pub transient: u32,
    #[serde(default)]
    pub schema: u32,
}

impl StageAttempts {
    pub fn total(self) -> u32 {
        self.transient + self.schema
    }
}

pub type AttemptMap = BTreeMap<Stage, StageAttempts>;

/// Mutable state record for one CI event, owned by the state machine.
/// Stage outputs live here as nullable fields so any stage can resume from
/// "all prior fields populated, this one null".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub event_id: String,
    pub state: RunState,
    pub attempts: AttemptMap,
    pub last_error_kind: Option<String>,
    pub last_error: Option<String>,
    pub extracted_summary: Option<ExtractedSummary>,
    pub diagnosis: Option<Diagnosis>,
    pub patch_proposal: Option<PatchProposal>,
    pub delivery_receipt: Option<DeliveryReceipt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn attempts_for(&self, stage: Stage) -> StageAttempts {
        self.attempts.get(&stage).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests;
