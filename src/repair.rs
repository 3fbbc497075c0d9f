//! Bounded repair loop.
//!
//! When the review service flags issues at or above the configured trigger
//! severity after a run's steps complete, the loop asks planning for a
//! repair plan, executes it through the same coordinator (identically
//! gated), and re-reviews. It terminates at zero triggering issues or at the
//! attempt ceiling; exhaustion is never declared success.

use std::path::{Path, PathBuf};

use crate::artifact::StepExecution;
use crate::coordinator::{active_run, active_run_mut, RunProgress, StepExecutionCoordinator};
use crate::diff::ChangedFile;
use crate::error::{Error, Result};
use crate::services::{ReviewIssue, ReviewOutcome};
use crate::state::{MergeOutcome, ProjectState, RepairAttempt};

/// Typed request handed to the planning service for a repair pass.
#[derive(Debug, Clone)]
pub struct FixRequest {
    /// Original goal of the run.
    pub goal: String,
    /// Workspace directory being repaired.
    pub project_dir: PathBuf,
    /// Issues that triggered the repair.
    pub issues: Vec<ReviewIssue>,
    /// Reviewer suggestions.
    pub suggestions: Vec<String>,
}

impl FixRequest {
    /// Renders the request as planner input.
    pub fn render(&self) -> String {
        let issues = serde_json::to_string_pretty(&self.issues).unwrap_or_default();
        let suggestions = serde_json::to_string_pretty(&self.suggestions).unwrap_or_default();
        format!(
            "Repair request for existing project.\n\
             Project directory: {}\n\
             Original goal: {}\n\n\
             Reviewer flagged issues (JSON): {}\n\
             Reviewer suggestions: {}\n\
             Return a revised plan that will fix the issues in-place.",
            self.project_dir.display(),
            self.goal,
            issues,
            suggestions
        )
    }
}

/// How a repair loop ended.
#[derive(Debug, Clone)]
pub enum RepairVerdict {
    /// No triggering issues remain.
    Resolved {
        /// Repair passes taken.
        attempts: u32,
        /// Review after the last pass.
        final_review: ReviewOutcome,
    },
    /// The ceiling was reached with issues still open.
    Exhausted {
        /// Repair passes taken.
        attempts: u32,
        /// Review that still shows triggering issues.
        final_review: ReviewOutcome,
    },
    /// A repair step halted the run (gate, approval, or failure).
    Halted {
        /// Repair passes taken, counting the halted one.
        attempts: u32,
        /// The halting disposition.
        outcome: MergeOutcome,
        /// Review that triggered the halted pass.
        final_review: ReviewOutcome,
    },
}

/// Bounded retry controller over the coordinator.
pub struct RepairLoop<'c, 'a> {
    coordinator: &'c StepExecutionCoordinator<'a>,
}

impl<'c, 'a> RepairLoop<'c, 'a> {
    /// Creates a repair loop over the given coordinator.
    pub fn new(coordinator: &'c StepExecutionCoordinator<'a>) -> Self {
        Self { coordinator }
    }

    /// Runs repair passes until issues clear, a pass halts, or the ceiling
    /// is hit.
    pub async fn drive(
        &self,
        state: &mut ProjectState,
        project_dir: &Path,
        initial_review: ReviewOutcome,
        executions: &mut Vec<StepExecution>,
    ) -> Result<RepairVerdict> {
        let trigger = self.coordinator.policy().repair_trigger_severity;
        let max_attempts = self.coordinator.config().max_repair_attempts;
        let mut review = initial_review;
        let mut attempts = 0u32;

        while review.has_issues_at_or_above(trigger) {
            if attempts >= max_attempts {
                let exhausted = Error::RepairExhausted(attempts);
                tracing::warn!(error = %exhausted, "repair ceiling reached");
                return Ok(RepairVerdict::Exhausted {
                    attempts,
                    final_review: review,
                });
            }
            attempts += 1;
            let label = format!("repair-{}", attempts);
            tracing::info!(attempt = attempts, max_attempts, "repair attempt started");

            let goal = active_run(state)?.goal.clone();
            let request = FixRequest {
                goal,
                project_dir: project_dir.to_path_buf(),
                issues: review.issues_at_or_above(trigger),
                suggestions: review.suggestions.clone(),
            };
            let plan = self.coordinator.plan_goal(&request.render(), "").await?;

            {
                let run = active_run_mut(state)?;
                run.append_repair(RepairAttempt {
                    attempt_number: attempts,
                    triggering_issues: request.issues.clone(),
                    plan_delta: plan.steps.clone(),
                    resulting_change: Vec::new(),
                    started_at: chrono::Utc::now().to_rfc3339(),
                    finished_at: None,
                });
            }
            self.coordinator.store().persist(state)?;

            let executed_before = executions.len();
            let progress = self
                .coordinator
                .run_plan(state, project_dir, &plan.steps, &label, executions)
                .await?;

            let resulting_change: Vec<ChangedFile> = executions[executed_before..]
                .iter()
                .flat_map(|execution| execution.changed_files.clone())
                .collect();
            {
                let run = active_run_mut(state)?;
                if let Some(attempt) = run.repair_attempts.last_mut() {
                    attempt.resulting_change = resulting_change;
                    attempt.finished_at = Some(chrono::Utc::now().to_rfc3339());
                }
            }
            self.coordinator.store().persist(state)?;

            if let RunProgress::Halted(outcome) = progress {
                tracing::warn!(attempt = attempts, ?outcome, "repair attempt halted");
                return Ok(RepairVerdict::Halted {
                    attempts,
                    outcome,
                    final_review: review,
                });
            }

            review = self.coordinator.review_run(state, executions).await?;
            tracing::info!(
                attempt = attempts,
                remaining_issues = review.issues_at_or_above(trigger).len(),
                "repair attempt reviewed"
            );
        }

        Ok(RepairVerdict::Resolved {
            attempts,
            final_review: review,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::IssueSeverity;

    #[test]
    fn fix_request_renders_goal_and_issues() {
        let request = FixRequest {
            goal: "build the API".to_string(),
            project_dir: PathBuf::from("projects/demo"),
            issues: vec![ReviewIssue {
                kind: "correctness".to_string(),
                description: "endpoint returns 500".to_string(),
                severity: IssueSeverity::High,
            }],
            suggestions: vec!["add error handling".to_string()],
        };
        let rendered = request.render();
        assert!(rendered.contains("Original goal: build the API"));
        assert!(rendered.contains("endpoint returns 500"));
        assert!(rendered.contains("add error handling"));
        assert!(rendered.contains("projects/demo"));
    }
}
