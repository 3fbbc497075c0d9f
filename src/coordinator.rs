//! Step execution coordination.
//!
//! Drives each planned step through `Pending → Executed → Gated` and into a
//! final disposition, strictly sequentially: each step's change set depends
//! on filesystem state left by the previous one. The deterministic gate is
//! consulted before review, and a favorable review can never override a
//! failed gate. Every transition is persisted before the next externally
//! observable side effect.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::artifact::{
    self, build_verification_guide, render_execution_summary, ProjectDocument, RunSummary,
    StepExecution,
};
use crate::config::{ApprovalMode, EngineConfig};
use crate::diff;
use crate::error::{Error, Result};
use crate::gate::{self, GateReport};
use crate::memory::{ProjectMemory, ReviewSummary};
use crate::naming;
use crate::policy::PolicyConfig;
use crate::project::{ensure_project_dir, ProjectSpec};
use crate::repair::{RepairLoop, RepairVerdict};
use crate::services::{
    ExecutionOutput, ExecutionService, ForgeService, PlanResponse, PlanStep, PlanningService,
    ReviewDecision, ReviewOutcome, ReviewRequest, ReviewService,
};
use crate::state::{MergeOutcome, ProjectState, RunState, RunStateStore, RunStatus, StepRecord};

/// Phase of the per-step state machine, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// Not yet handed to the execution service.
    Pending,
    /// Execution finished; change set not yet gated.
    Executed,
    /// Gate evaluated; branch and PR published.
    Gated,
    /// Automatically merged.
    Merged,
    /// Awaiting human approval.
    PendingApproval,
    /// Rejected by gate or review.
    Blocked,
}

/// What the gate and mode settings permit before review is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateDecision {
    /// Ineligible: the step blocks the run.
    Blocked,
    /// Eligible, but a human must approve.
    PendingApproval,
    /// Eligible and auto; ask the review service.
    NeedsReview,
    /// Eligible and auto with review disabled; merge.
    Merge,
}

/// Pure decision over a gate report and the run's mode settings.
///
/// Review is deliberately absent here: it is consulted only when this
/// returns `NeedsReview`, so it can never rescue an ineligible change.
fn decide(
    report: &GateReport,
    approval_mode: ApprovalMode,
    warnings_force_manual: bool,
    review_enabled: bool,
) -> GateDecision {
    if !report.eligible {
        return GateDecision::Blocked;
    }
    if approval_mode == ApprovalMode::Manual {
        return GateDecision::PendingApproval;
    }
    if warnings_force_manual && report.passed_with_warnings() {
        return GateDecision::PendingApproval;
    }
    if review_enabled {
        GateDecision::NeedsReview
    } else {
        GateDecision::Merge
    }
}

/// Result of driving a sequence of steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunProgress {
    /// Every step merged.
    Completed,
    /// A step ended the sequence early with this disposition.
    Halted(MergeOutcome),
}

/// Summary of one orchestrated run, returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Project identifier.
    pub project_id: String,
    /// Run number.
    pub run_number: u32,
    /// Session identifier.
    pub session_id: String,
    /// Final run status.
    pub status: RunStatus,
    /// Steps executed across all attempts.
    pub steps_executed: usize,
    /// Repair passes taken.
    pub repair_attempts: u32,
    /// Final review, when review ran.
    pub review: Option<ReviewOutcome>,
    /// Path of the run summary artifact.
    pub summary_path: PathBuf,
}

/// Returns the active run or fails closed.
pub(crate) fn active_run(state: &ProjectState) -> Result<&RunState> {
    state
        .current_run()
        .ok_or_else(|| Error::Execution("no active run in project state".to_string()))
}

/// Mutable access to the active run.
pub(crate) fn active_run_mut(state: &mut ProjectState) -> Result<&mut RunState> {
    state
        .current_run_mut()
        .ok_or_else(|| Error::Execution("no active run in project state".to_string()))
}

/// Maps a repair verdict to a run status override and the final review.
///
/// A halted repair leaves the status the halting step already set.
fn settle_repair(verdict: RepairVerdict) -> (Option<RunStatus>, ReviewOutcome) {
    match verdict {
        RepairVerdict::Resolved { final_review, .. } => {
            let status = match final_review.decision {
                ReviewDecision::Approve => RunStatus::Completed,
                ReviewDecision::ManualRequired => RunStatus::PendingApproval,
                ReviewDecision::Block => RunStatus::Blocked,
            };
            (Some(status), final_review)
        }
        RepairVerdict::Exhausted { final_review, .. } => {
            (Some(RunStatus::PendingApproval), final_review)
        }
        RepairVerdict::Halted { final_review, .. } => (None, final_review),
    }
}

/// Sequences steps through execution, gating, publication, and merge.
pub struct StepExecutionCoordinator<'a> {
    config: &'a EngineConfig,
    policy: &'a PolicyConfig,
    store: &'a RunStateStore,
    planning: &'a dyn PlanningService,
    execution: &'a dyn ExecutionService,
    review: &'a dyn ReviewService,
    forge: &'a dyn ForgeService,
}

impl<'a> StepExecutionCoordinator<'a> {
    /// Creates a coordinator over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a EngineConfig,
        policy: &'a PolicyConfig,
        store: &'a RunStateStore,
        planning: &'a dyn PlanningService,
        execution: &'a dyn ExecutionService,
        review: &'a dyn ReviewService,
        forge: &'a dyn ForgeService,
    ) -> Self {
        Self {
            config,
            policy,
            store,
            planning,
            execution,
            review,
            forge,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    /// Normalized merge policy.
    pub fn policy(&self) -> &PolicyConfig {
        self.policy
    }

    /// Run state store.
    pub fn store(&self) -> &RunStateStore {
        self.store
    }

    /// Runs one full orchestration: lock, allocate a run, plan, drive steps,
    /// review, repair, and write artifacts.
    pub async fn orchestrate(&self, project_id: &str, goal: &str) -> Result<RunReport> {
        let lock = self.store.lock_project(project_id)?;
        let project_dir = ensure_project_dir(self.store.projects_root(), project_id)?;
        let spec = ProjectSpec::load_or_default(&project_dir.join("project.yaml"), project_id);
        tracing::info!(project_id, goal, spec = %spec.summarize(), "orchestration started");

        let memory = ProjectMemory::new(self.store.projects_root());
        let memory_context = memory.summarize_recent(Some(goal), 3);

        let mut state = self.store.begin_run(&lock, goal, self.config.approval_mode)?;

        let plan = match self.plan_goal(goal, &memory_context).await {
            Ok(plan) => plan,
            Err(e) => return self.fail_run(&mut state, e),
        };
        tracing::info!(steps = plan.steps.len(), "plan accepted");

        let mut executions: Vec<StepExecution> = Vec::new();
        let progress = self
            .run_plan(&mut state, &project_dir, &plan.steps, "initial", &mut executions)
            .await?;

        let mut final_review: Option<ReviewOutcome> = None;
        let mut status_override: Option<RunStatus> = None;

        if progress == RunProgress::Completed {
            if self.config.review.is_enabled() {
                let outcome = match self.review_run(&state, &executions).await {
                    Ok(outcome) => outcome,
                    Err(e) => return self.fail_run(&mut state, e),
                };

                if outcome.decision == ReviewDecision::Block {
                    status_override = Some(RunStatus::Blocked);
                    final_review = Some(outcome);
                } else if outcome.has_issues_at_or_above(self.policy.repair_trigger_severity) {
                    let verdict = match RepairLoop::new(self)
                        .drive(&mut state, &project_dir, outcome, &mut executions)
                        .await
                    {
                        Ok(verdict) => verdict,
                        Err(e) => return self.fail_run(&mut state, e),
                    };
                    let (status, review) = settle_repair(verdict);
                    status_override = status;
                    final_review = Some(review);
                } else {
                    status_override = Some(match outcome.decision {
                        ReviewDecision::Approve => RunStatus::Completed,
                        ReviewDecision::ManualRequired => RunStatus::PendingApproval,
                        ReviewDecision::Block => RunStatus::Blocked,
                    });
                    final_review = Some(outcome);
                }
            } else {
                status_override = Some(RunStatus::Completed);
            }
        }

        let status = {
            let run = active_run_mut(&mut state)?;
            if let Some(status) = status_override {
                run.status = status;
            }
            if matches!(run.status, RunStatus::Completed | RunStatus::Blocked) {
                run.completed_at = Some(chrono::Utc::now().to_rfc3339());
            }
            run.status
        };
        self.store.persist(&state)?;

        let report = self.write_artifacts(
            project_id,
            &project_dir,
            &memory,
            &state,
            &plan,
            executions,
            final_review,
        )?;
        tracing::info!(
            project_id,
            run_number = report.run_number,
            ?status,
            steps = report.steps_executed,
            repairs = report.repair_attempts,
            "orchestration complete"
        );
        Ok(report)
    }

    /// Drives an ordered step sequence; stops at the first non-merged step.
    pub async fn run_plan(
        &self,
        state: &mut ProjectState,
        project_dir: &Path,
        steps: &[PlanStep],
        attempt_label: &str,
        executions: &mut Vec<StepExecution>,
    ) -> Result<RunProgress> {
        for step in steps {
            match self
                .run_step(state, project_dir, step, attempt_label, executions)
                .await?
            {
                MergeOutcome::Merged => {}
                halted => return Ok(RunProgress::Halted(halted)),
            }
        }
        Ok(RunProgress::Completed)
    }

    /// Drives one step through the per-step machine.
    async fn run_step(
        &self,
        state: &mut ProjectState,
        project_dir: &Path,
        step: &PlanStep,
        attempt_label: &str,
        executions: &mut Vec<StepExecution>,
    ) -> Result<MergeOutcome> {
        let project_id = state.project_id.clone();
        let (run_number, session_id, approval_mode, goal, step_number) = {
            let run = active_run(state)?;
            (
                run.run_number,
                run.session_id.clone(),
                run.approval_mode,
                run.goal.clone(),
                run.next_step_number(),
            )
        };

        let slug = naming::slugify(&step.description);
        let branch_name = naming::branch_name(run_number, step_number, &slug);
        let title = naming::pr_title(&project_id, run_number, step_number, &step.description);
        let started_at = chrono::Utc::now().to_rfc3339();

        tracing::info!(
            project_id = %project_id,
            step_id = step.id,
            step_number,
            attempt_label,
            phase = ?StepPhase::Pending,
            "step started"
        );

        let output = match self.execute_step(step, project_dir).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(step_id = step.id, error = %e, "step failed after retries");
                let run = active_run_mut(state)?;
                run.append_step(StepRecord {
                    step_number,
                    step_id: step.id,
                    description: step.description.clone(),
                    slug,
                    branch_name,
                    attempt_label: attempt_label.to_string(),
                    pr: None,
                    gate_report: None,
                    merge_outcome: Some(MergeOutcome::Failed),
                    pushed: false,
                    error: Some(e.to_string()),
                    started_at,
                    finished_at: Some(chrono::Utc::now().to_rfc3339()),
                });
                run.status = RunStatus::Failed;
                self.store.persist(state)?;
                return Ok(MergeOutcome::Failed);
            }
        };
        tracing::debug!(step_id = step.id, phase = ?StepPhase::Executed, "execution finished");

        let change_set = diff::analyze(&output.diff_text, &output.changed_files);
        executions.push(StepExecution {
            attempt_label: attempt_label.to_string(),
            step_id: step.id,
            description: step.description.clone(),
            history: output.history.clone(),
            changed_files: change_set.files.clone(),
        });

        let report = gate::evaluate_now(&change_set, self.policy);
        tracing::info!(
            step_id = step.id,
            eligible = report.eligible,
            blocking = report.blocking_reasons.len(),
            warnings = report.warnings.len(),
            phase = ?StepPhase::Gated,
            "gate evaluated"
        );

        // The record (with its name and gate report) is durable before any
        // branch exists externally.
        {
            let run = active_run_mut(state)?;
            run.append_step(StepRecord {
                step_number,
                step_id: step.id,
                description: step.description.clone(),
                slug,
                branch_name: branch_name.clone(),
                attempt_label: attempt_label.to_string(),
                pr: None,
                gate_report: Some(report.clone()),
                merge_outcome: None,
                pushed: false,
                error: None,
                started_at,
                finished_at: None,
            });
        }
        self.store.persist(state)?;

        let body = {
            let run = active_run(state)?;
            let record = run
                .steps
                .last()
                .ok_or_else(|| Error::Execution("step record missing".to_string()))?;
            artifact::render_pr_body(&session_id, record, &report, &output.history, &change_set.files)
        };

        if let Err(e) = self.forge.publish_branch(&project_id, &branch_name, &title).await {
            return self.fail_run(state, e);
        }
        let pr = match self
            .forge
            .open_pull_request(&project_id, &branch_name, &title, &body)
            .await
        {
            Ok(pr) => pr,
            Err(e) => return self.fail_run(state, e),
        };
        {
            let run = active_run_mut(state)?;
            if let Some(record) = run.steps.last_mut() {
                record.record_published(pr.clone());
            }
        }
        self.store.persist(state)?;
        tracing::info!(step_id = step.id, pr = %pr.identifier, branch = %branch_name, "published");

        let outcome = match decide(
            &report,
            approval_mode,
            self.policy.warnings_force_manual,
            self.config.review.is_enabled(),
        ) {
            GateDecision::Blocked => {
                tracing::warn!(
                    step_id = step.id,
                    reasons = ?report.blocking_reasons,
                    "gate blocked automatic merge"
                );
                MergeOutcome::Blocked
            }
            GateDecision::PendingApproval => MergeOutcome::PendingApproval,
            GateDecision::Merge => MergeOutcome::Merged,
            GateDecision::NeedsReview => {
                let request = ReviewRequest {
                    goal: goal.clone(),
                    execution_summary: render_execution_summary(executions),
                    gate_history: active_run(state)?.gate_history(),
                };
                let review = match self.review_with_timeout(&request).await {
                    Ok(review) => review,
                    Err(e) => return self.fail_run(state, e),
                };
                match review.decision {
                    ReviewDecision::Approve => MergeOutcome::Merged,
                    ReviewDecision::ManualRequired => MergeOutcome::PendingApproval,
                    ReviewDecision::Block => MergeOutcome::Blocked,
                }
            }
        };

        if outcome == MergeOutcome::Merged {
            if let Err(e) = self.forge.merge_pull_request(&project_id, &pr).await {
                return self.fail_run(state, e);
            }
        }

        {
            let run = active_run_mut(state)?;
            match outcome {
                MergeOutcome::Merged => {}
                MergeOutcome::PendingApproval => run.status = RunStatus::PendingApproval,
                MergeOutcome::Blocked => run.status = RunStatus::Blocked,
                MergeOutcome::Failed => run.status = RunStatus::Failed,
            }
            if let Some(record) = run.steps.last_mut() {
                record.record_outcome(outcome, chrono::Utc::now().to_rfc3339());
            }
        }
        self.store.persist(state)?;

        let phase = match outcome {
            MergeOutcome::Merged => StepPhase::Merged,
            MergeOutcome::PendingApproval => StepPhase::PendingApproval,
            MergeOutcome::Blocked | MergeOutcome::Failed => StepPhase::Blocked,
        };
        tracing::info!(step_id = step.id, ?phase, ?outcome, "step finished");
        Ok(outcome)
    }

    /// Calls the planning service with a timeout and validates the plan.
    pub async fn plan_goal(&self, goal: &str, memory_context: &str) -> Result<PlanResponse> {
        let timeout = self.config.timeouts.planning();
        let plan = match tokio::time::timeout(timeout, self.planning.plan(goal, memory_context))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Planning(format!(
                    "planning timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Reviews the whole run so far.
    pub async fn review_run(
        &self,
        state: &ProjectState,
        executions: &[StepExecution],
    ) -> Result<ReviewOutcome> {
        let run = active_run(state)?;
        let request = ReviewRequest {
            goal: run.goal.clone(),
            execution_summary: render_execution_summary(executions),
            gate_history: run.gate_history(),
        };
        self.review_with_timeout(&request).await
    }

    async fn review_with_timeout(&self, request: &ReviewRequest) -> Result<ReviewOutcome> {
        let timeout = self.config.timeouts.review();
        match tokio::time::timeout(timeout, self.review.review(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Review(format!(
                "review timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Calls the execution service with bounded retries and a timeout.
    ///
    /// A timeout counts as an execution failure for the step, never a gate
    /// outcome.
    async fn execute_step(&self, step: &PlanStep, project_dir: &Path) -> Result<ExecutionOutput> {
        let timeout = self.config.timeouts.execution();
        let mut last_error: Option<Error> = None;
        for attempt in 0..=self.config.max_execution_retries {
            if attempt > 0 {
                tracing::warn!(step_id = step.id, attempt, "retrying step execution");
            }
            match tokio::time::timeout(timeout, self.execution.execute(step, project_dir)).await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    last_error = Some(Error::Execution(format!(
                        "execution timed out after {}s",
                        timeout.as_secs()
                    )))
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::Execution("execution failed with no detail".to_string())))
    }

    /// Marks the run failed, persists, and propagates the error.
    fn fail_run<T>(&self, state: &mut ProjectState, error: Error) -> Result<T> {
        if let Some(run) = state.current_run_mut() {
            run.status = RunStatus::Failed;
        }
        if let Err(persist_error) = self.store.persist(state) {
            tracing::error!(error = %persist_error, "failed to persist failed-run state");
        }
        Err(error)
    }

    /// Writes run and project artifacts and updates the memory index.
    #[allow(clippy::too_many_arguments)]
    fn write_artifacts(
        &self,
        project_id: &str,
        project_dir: &Path,
        memory: &ProjectMemory,
        state: &ProjectState,
        plan: &PlanResponse,
        executions: Vec<StepExecution>,
        final_review: Option<ReviewOutcome>,
    ) -> Result<RunReport> {
        let run = active_run(state)?;

        let summary =
            RunSummary::from_run(project_id, run, executions, final_review.clone());
        let summary_path = summary.write(project_dir)?;

        let blocking_issues_remaining = final_review
            .as_ref()
            .map(|review| review.has_issues_at_or_above(self.policy.repair_trigger_severity))
            .unwrap_or(false);

        ProjectDocument {
            goal: run.goal.clone(),
            project_dir: project_dir.display().to_string(),
            plan: plan.clone(),
            review: final_review.clone(),
            gate_history: run.gate_history(),
            repair_attempts: run.repair_attempts.clone(),
            status: run.status,
            blocking_issues_remaining,
            started_at: run.started_at.clone(),
            completed_at: run.completed_at.clone(),
            how_to_verify: build_verification_guide(&run.goal, project_dir),
        }
        .write(project_dir)?;

        let review_summary = final_review
            .as_ref()
            .map(ReviewSummary::from_outcome)
            .unwrap_or_default();
        if let Err(e) = memory.update(
            project_id,
            &run.goal,
            &project_dir.display().to_string(),
            &summary_path.display().to_string(),
            review_summary,
        ) {
            tracing::warn!(error = %e, "failed to update memory index");
        }

        Ok(RunReport {
            project_id: project_id.to_string(),
            run_number: run.run_number,
            session_id: run.session_id.clone(),
            status: run.status,
            steps_executed: summary.executions.len(),
            repair_attempts: run.repair_attempts.len() as u32,
            review: final_review,
            summary_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(eligible: bool, warnings: Vec<String>) -> GateReport {
        GateReport {
            eligible,
            blocking_reasons: if eligible {
                vec![]
            } else {
                vec!["hard-stop path: agents/**".to_string()]
            },
            warnings,
            files_changed: 1,
            lines_added: 1,
            lines_removed: 0,
            evaluated_at: "2026-08-07T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn manual_mode_never_passes_pending_approval() {
        let passing = report(true, vec![]);
        assert_eq!(
            decide(&passing, ApprovalMode::Manual, false, true),
            GateDecision::PendingApproval
        );
        assert_eq!(
            decide(&passing, ApprovalMode::Manual, false, false),
            GateDecision::PendingApproval
        );
    }

    #[test]
    fn ineligible_report_blocks_before_review_is_consulted() {
        let failing = report(false, vec![]);
        // Review is not even reachable for an ineligible change.
        assert_eq!(
            decide(&failing, ApprovalMode::Auto, false, true),
            GateDecision::Blocked
        );
        assert_eq!(
            decide(&failing, ApprovalMode::Manual, false, true),
            GateDecision::Blocked
        );
    }

    #[test]
    fn auto_mode_with_review_disabled_merges_eligible_changes() {
        let passing = report(true, vec![]);
        assert_eq!(
            decide(&passing, ApprovalMode::Auto, false, false),
            GateDecision::Merge
        );
    }

    #[test]
    fn auto_mode_with_review_enabled_defers_to_review() {
        let passing = report(true, vec![]);
        assert_eq!(
            decide(&passing, ApprovalMode::Auto, false, true),
            GateDecision::NeedsReview
        );
    }

    #[test]
    fn warnings_force_manual_downgrades_auto_merge() {
        let with_warnings = report(true, vec!["binary file change: logo.png".to_string()]);
        assert_eq!(
            decide(&with_warnings, ApprovalMode::Auto, true, false),
            GateDecision::PendingApproval
        );
        // Without the flag, warnings never affect the outcome.
        assert_eq!(
            decide(&with_warnings, ApprovalMode::Auto, false, false),
            GateDecision::Merge
        );
    }
}
