// src/core/types.rs — Core domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::breakdown::ProjectBreakdown;

/// Outcome status of one eval case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    Pass,
    Fail,
    Error,
}

/// Opaque handle to a recorded trajectory in the eval gateway's store.
///
/// The raw trajectory is retrievable by the analysis dispatcher but is
/// never inlined into the controller's working context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryRef(pub String);

/// Result of running one eval case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub eval_id: String,
    pub status: EvalStatus,
    pub score: Option<f64>,
    pub trajectory: Option<TrajectoryRef>,
}

impl EvalOutcome {
    pub fn is_pass(&self) -> bool {
        self.status == EvalStatus::Pass
    }
}

/// One entry in the eval catalog the gateway is constructed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub id: String,
    pub description: String,
}

/// Merged results of one suite run, keyed by eval id.
pub type SuiteResults = BTreeMap<String, EvalOutcome>;

/// Percentage of passing evals in a suite result (0.0–100.0).
pub fn pass_rate(results: &SuiteResults) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let passed = results.values().filter(|o| o.is_pass()).count();
    (passed as f64 / results.len() as f64) * 100.0
}

/// Fixed taxonomy a trajectory-analysis subagent classifies failures against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    Strategy,
    ToolSelection,
    ToolUsage,
    ToolImplementation,
    Reasoning,
    OutputCommunication,
    CapabilityGap,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCategory::Strategy => "strategy",
            FailureCategory::ToolSelection => "tool-selection",
            FailureCategory::ToolUsage => "tool-usage",
            FailureCategory::ToolImplementation => "tool-implementation",
            FailureCategory::Reasoning => "reasoning",
            FailureCategory::OutputCommunication => "output-communication",
            FailureCategory::CapabilityGap => "capability-gap",
        };
        write!(f, "{s}")
    }
}

/// Ranking of a diagnosis among findings for the same iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

/// Output of one trajectory-analysis sub-conversation.
///
/// Ephemeral: referenced by an IterationRecord, not independently versioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub eval_id: String,
    pub failure_categories: Vec<FailureCategory>,
    pub narrative: String,
    pub severity: Severity,
}

/// Compact log entry for one action taken during an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: String,
    pub target: String,
    pub summary: String,
}

impl ActionRecord {
    pub fn new(
        kind: impl Into<String>,
        target: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
            summary: summary.into(),
        }
    }
}

/// Recorded when an iteration began by rolling back to an earlier snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetNote {
    pub from_iteration: u32,
    pub reason: String,
}

/// One immutable historical entry, created at `end_iteration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration_number: u32,
    pub file_snapshot_id: String,
    pub eval_results: SuiteResults,
    pub actions_taken: Vec<ActionRecord>,
    pub diagnosis_reports: Vec<DiagnosisReport>,
    /// The driving agent's own summary of what changed and why.
    pub changelog: String,
    /// Breakdown as it stood when the iteration closed; restored on reset.
    pub breakdown: ProjectBreakdown,
    pub reset_from: Option<ResetNote>,
    pub created_at: DateTime<Utc>,
}

impl IterationRecord {
    pub fn pass_rate(&self) -> f64 {
        pass_rate(&self.eval_results)
    }
}

/// Where the controller currently is in the iteration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Analyzing,
    Investigating,
    Modifying,
    Testing,
    EndingIteration,
    Finished,
}
