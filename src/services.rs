//! Typed contracts for the external collaborators.
//!
//! Planning, execution, review, and forge operations are opaque services
//! consumed through these traits. Responses are validated at the boundary
//! into tagged types; malformed payloads become errors here and never
//! propagate as untyped data.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gate::GateReport;

/// Severity of a review issue. Ordered: `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Cosmetic or informational.
    Low,
    /// Should be fixed before merge.
    Medium,
    /// Must be fixed.
    High,
}

/// Review verdict for a run or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Work is acceptable.
    Approve,
    /// A human must look before merging.
    ManualRequired,
    /// Work must not merge.
    Block,
}

/// A single issue flagged by the review service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    /// Category, e.g. "correctness", "completeness", "safety".
    #[serde(rename = "type", default)]
    pub kind: String,
    /// What is wrong or risky.
    pub description: String,
    /// How bad it is.
    pub severity: IssueSeverity,
}

/// Validated review response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutcome {
    /// Verdict.
    pub decision: ReviewDecision,
    /// Short summary of how well the work matched the goal.
    #[serde(default)]
    pub overall_assessment: String,
    /// Flagged issues.
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    /// Concrete follow-up suggestions.
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl ReviewOutcome {
    /// Parses a review response from raw service output.
    ///
    /// Tolerates markdown-fenced JSON. Malformed output is an error, never
    /// a silently defaulted decision.
    pub fn from_json_output(raw: &str) -> Result<Self> {
        let json = extract_json(raw)
            .ok_or_else(|| Error::Review("no JSON found in review output".to_string()))?;
        serde_json::from_str(json)
            .map_err(|e| Error::Review(format!("invalid review JSON: {}", e)))
    }

    /// Returns true if any issue is at or above the given severity.
    pub fn has_issues_at_or_above(&self, threshold: IssueSeverity) -> bool {
        self.issues.iter().any(|issue| issue.severity >= threshold)
    }

    /// Issues at or above the given severity, in reported order.
    pub fn issues_at_or_above(&self, threshold: IssueSeverity) -> Vec<ReviewIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity >= threshold)
            .cloned()
            .collect()
    }
}

/// One planned unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step identifier, 1-based and strictly increasing within a plan.
    pub id: u32,
    /// What the execution service should do.
    pub description: String,
}

/// Validated planning response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    /// Restated goal.
    #[serde(default)]
    pub goal: String,
    /// Ordered steps.
    pub steps: Vec<PlanStep>,
}

impl PlanResponse {
    /// Parses a plan from raw service output.
    ///
    /// Tolerates markdown-fenced JSON, then validates: at least one step,
    /// non-empty descriptions, strictly increasing ids.
    pub fn from_json_output(raw: &str) -> Result<Self> {
        let json = extract_json(raw)
            .ok_or_else(|| Error::Planning("no JSON found in planner output".to_string()))?;
        let plan: PlanResponse = serde_json::from_str(json)
            .map_err(|e| Error::Planning(format!("invalid plan JSON: {}", e)))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Validates plan structure.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::Planning("plan contains no steps".to_string()));
        }
        let mut last_id = 0;
        for step in &self.steps {
            if step.description.trim().is_empty() {
                return Err(Error::Planning(format!("step {} has no description", step.id)));
            }
            if step.id <= last_id {
                return Err(Error::Planning(format!(
                    "step ids must strictly increase (saw {} after {})",
                    step.id, last_id
                )));
            }
            last_id = step.id;
        }
        Ok(())
    }
}

/// One shell command executed by the execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Command line as executed.
    pub command: String,
    /// Captured stdout.
    #[serde(default)]
    pub stdout: String,
    /// Captured stderr.
    #[serde(default)]
    pub stderr: String,
    /// Process exit code.
    pub exit_code: i32,
}

/// Result of executing one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Commands run, in order.
    pub history: Vec<CommandRecord>,
    /// Unified diff of the resulting change, as text.
    pub diff_text: String,
    /// Repo-relative paths of changed files.
    pub changed_files: Vec<String>,
}

/// Request payload for a review.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewRequest {
    /// Original goal.
    pub goal: String,
    /// Rendered execution history across all attempts.
    pub execution_summary: String,
    /// Gate reports for every gated step so far.
    pub gate_history: Vec<GateReport>,
}

/// A pull request created on the forge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRef {
    /// Stable identifier (number or URL) assigned by the forge.
    pub identifier: String,
    /// Browsable URL, if the forge reports one.
    #[serde(default)]
    pub url: Option<String>,
}

/// Generates ordered plans from goals.
#[async_trait]
pub trait PlanningService: Send + Sync {
    /// Plans the given goal. `memory_context` carries a compact summary of
    /// related prior projects and may be empty.
    async fn plan(&self, goal: &str, memory_context: &str) -> Result<PlanResponse>;
}

/// Executes one planned step inside a working directory.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Executes the step. All filesystem effects must stay within
    /// `working_dir`.
    async fn execute(&self, step: &PlanStep, working_dir: &Path) -> Result<ExecutionOutput>;
}

/// Reviews completed work.
#[async_trait]
pub trait ReviewService: Send + Sync {
    /// Reviews the run so far.
    async fn review(&self, request: &ReviewRequest) -> Result<ReviewOutcome>;
}

/// Version-control/forge operations.
#[async_trait]
pub trait ForgeService: Send + Sync {
    /// Creates (or resets) a branch with the step's changes committed.
    async fn publish_branch(
        &self,
        project_id: &str,
        branch: &str,
        commit_message: &str,
    ) -> Result<()>;

    /// Opens a pull request for a published branch.
    async fn open_pull_request(
        &self,
        project_id: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef>;

    /// Merges a previously opened pull request.
    async fn merge_pull_request(&self, project_id: &str, pr: &PullRequestRef) -> Result<()>;
}

/// Extracts JSON from output that may contain markdown code blocks.
fn extract_json(output: &str) -> Option<&str> {
    if let Some(start) = output.find("```json") {
        let json_start = start + 7;
        if let Some(end) = output[json_start..].find("```") {
            return Some(output[json_start..json_start + end].trim());
        }
    }

    let json_start = output.find('{')?;
    let json_end = output.rfind('}')?;
    if json_start < json_end {
        Some(&output[json_start..=json_end])
    } else {
        None
    }
}
