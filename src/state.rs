//! Durable per-project run state.
//!
//! One JSON record per project under `<project>/.stepgate/state.json`. The
//! record is the sole source of truth for run/step counters and naming:
//! resuming after a crash reproduces identical names for any step that was
//! never pushed, and never reuses a name for one that was. Writes go through
//! a temp file, `sync_all`, then an atomic rename, so a crash leaves either
//! the prior state or the new state — never a partial record. Cross-process
//! mutual exclusion uses an advisory file lock.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::ApprovalMode;
use crate::diff::ChangedFile;
use crate::error::{Error, Result};
use crate::gate::GateReport;
use crate::services::{PlanStep, PullRequestRef, ReviewIssue};

/// Final disposition of a gated step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Automatically merged.
    Merged,
    /// Halted awaiting human approval.
    PendingApproval,
    /// Gate or review rejected the change; terminal for the run.
    Blocked,
    /// Execution failed after bounded retries.
    Failed,
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Steps are still being driven.
    Running,
    /// All steps finished and no blocking review issues remain.
    Completed,
    /// Paused for human approval; resumable.
    PendingApproval,
    /// Rejected by gate or review; requires a new run or intervention.
    Blocked,
    /// A step failed to execute; paused.
    Failed,
}

/// Record of one step within a run. Appended once, then only `None` fields
/// are filled in as the step progresses; nothing is rewritten after the
/// step becomes externally visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Position within the run, starting at 1.
    pub step_number: u32,
    /// Planner-assigned step id.
    pub step_id: u32,
    /// Step description from the plan.
    pub description: String,
    /// Slug used in the branch name.
    pub slug: String,
    /// Branch name, derived purely from persisted counters.
    pub branch_name: String,
    /// Attempt this step belongs to: `initial` or `repair-<n>`.
    pub attempt_label: String,
    /// Pull request, once opened.
    #[serde(default)]
    pub pr: Option<PullRequestRef>,
    /// Gate report, once evaluated.
    #[serde(default)]
    pub gate_report: Option<GateReport>,
    /// Final disposition, once decided.
    #[serde(default)]
    pub merge_outcome: Option<MergeOutcome>,
    /// True once the branch has been pushed to the forge. A pushed step's
    /// name is never reused.
    #[serde(default)]
    pub pushed: bool,
    /// Failure detail when execution failed.
    #[serde(default)]
    pub error: Option<String>,
    /// When the step started (RFC 3339).
    pub started_at: String,
    /// When the step reached a final disposition.
    #[serde(default)]
    pub finished_at: Option<String>,
}

impl StepRecord {
    /// Marks the step's branch and PR as published on the forge.
    pub fn record_published(&mut self, pr: PullRequestRef) {
        debug_assert!(self.pr.is_none(), "step already published");
        self.pr = Some(pr);
        self.pushed = true;
    }

    /// Records the final disposition. Fills once, never rewrites.
    pub fn record_outcome(&mut self, outcome: MergeOutcome, finished_at: String) {
        debug_assert!(self.merge_outcome.is_none(), "step outcome already recorded");
        self.merge_outcome = Some(outcome);
        self.finished_at = Some(finished_at);
    }
}

/// Record of one repair pass. Appended, never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Review issues that triggered this attempt.
    pub triggering_issues: Vec<ReviewIssue>,
    /// Steps of the repair plan.
    pub plan_delta: Vec<PlanStep>,
    /// Files changed across the attempt's steps.
    #[serde(default)]
    pub resulting_change: Vec<ChangedFile>,
    /// When the attempt started (RFC 3339).
    pub started_at: String,
    /// When the attempt finished.
    #[serde(default)]
    pub finished_at: Option<String>,
}

/// State of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Monotonic per-project run number.
    pub run_number: u32,
    /// Unique session identifier for artifacts and logs.
    pub session_id: String,
    /// Goal this run pursues.
    pub goal: String,
    /// Approval mode, snapshotted once at run start.
    pub approval_mode: ApprovalMode,
    /// Current status.
    pub status: RunStatus,
    /// When the run started (RFC 3339).
    pub started_at: String,
    /// When the run reached a terminal status.
    #[serde(default)]
    pub completed_at: Option<String>,
    /// Append-only step history.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// Append-only repair history.
    #[serde(default)]
    pub repair_attempts: Vec<RepairAttempt>,
}

impl RunState {
    /// Next step number within this run (1-based, strictly increasing).
    pub fn next_step_number(&self) -> u32 {
        self.steps.len() as u32 + 1
    }

    /// Appends a step record. Records are never removed or reordered.
    pub fn append_step(&mut self, record: StepRecord) {
        debug_assert_eq!(record.step_number, self.next_step_number());
        self.steps.push(record);
    }

    /// Appends a repair attempt. Attempts are never removed or reordered.
    pub fn append_repair(&mut self, attempt: RepairAttempt) {
        debug_assert_eq!(attempt.attempt_number as usize, self.repair_attempts.len() + 1);
        self.repair_attempts.push(attempt);
    }

    /// Gate reports of all gated steps, in order.
    pub fn gate_history(&self) -> Vec<GateReport> {
        self.steps
            .iter()
            .filter_map(|step| step.gate_report.clone())
            .collect()
    }
}

/// Durable record for one project: the run counter and full run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    /// Project identifier (directory name under the projects root).
    pub project_id: String,
    /// Last allocated run number.
    pub run_number: u32,
    /// Append-only run history.
    #[serde(default)]
    pub runs: Vec<RunState>,
}

impl ProjectState {
    /// The most recent run, if any.
    pub fn current_run(&self) -> Option<&RunState> {
        self.runs.last()
    }

    /// Mutable access to the most recent run.
    pub fn current_run_mut(&mut self) -> Option<&mut RunState> {
        self.runs.last_mut()
    }
}

/// Exclusive advisory lock on a project's state.
///
/// Held for the duration of an orchestrator invocation; released on drop.
pub struct ProjectLock {
    file: File,
    project_id: String,
}

impl ProjectLock {
    /// Project this lock guards.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Store for durable project state.
pub struct RunStateStore {
    projects_root: PathBuf,
}

impl RunStateStore {
    /// Creates a store rooted at the given projects directory.
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
        }
    }

    /// The projects root directory.
    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Workspace directory for a project.
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_root.join(project_id)
    }

    fn state_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join(".stepgate")
    }

    fn state_path(&self, project_id: &str) -> PathBuf {
        self.state_dir(project_id).join("state.json")
    }

    fn lock_path(&self, project_id: &str) -> PathBuf {
        self.state_dir(project_id).join("lock")
    }

    fn open_lock_file(&self, project_id: &str) -> Result<File> {
        let dir = self.state_dir(project_id);
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(project_id))?;
        Ok(file)
    }

    /// Acquires the project lock, blocking until the holder releases it.
    pub fn lock_project(&self, project_id: &str) -> Result<ProjectLock> {
        let file = self.open_lock_file(project_id)?;
        file.lock_exclusive().map_err(|e| Error::Lock {
            project_id: project_id.to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!(project_id, "acquired project lock");
        Ok(ProjectLock {
            file,
            project_id: project_id.to_string(),
        })
    }

    /// Attempts to acquire the project lock without blocking.
    pub fn try_lock_project(&self, project_id: &str) -> Result<ProjectLock> {
        let file = self.open_lock_file(project_id)?;
        file.try_lock_exclusive().map_err(|e| Error::Lock {
            project_id: project_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(ProjectLock {
            file,
            project_id: project_id.to_string(),
        })
    }

    /// Loads a project's durable state, or `None` if it has never run.
    ///
    /// A corrupt record is an error, never a silent reset: resetting would
    /// reuse run numbers and branch names that may already exist externally.
    pub fn load(&self, project_id: &str) -> Result<Option<ProjectState>> {
        let path = self.state_path(project_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let state = serde_json::from_str(&raw).map_err(|e| Error::Persistence {
            path: path.clone(),
            reason: format!("corrupt state record: {}", e),
        })?;
        Ok(Some(state))
    }

    /// Allocates the next run number and persists it before returning.
    ///
    /// The caller must hold the project lock. Because the counter is durable
    /// before any branch exists, a crash after this call resumes with the
    /// same run number; a crash before it repeats the same allocation.
    pub fn begin_run(
        &self,
        lock: &ProjectLock,
        goal: &str,
        approval_mode: ApprovalMode,
    ) -> Result<ProjectState> {
        let project_id = lock.project_id().to_string();
        let mut state = self.load(&project_id)?.unwrap_or(ProjectState {
            project_id: project_id.clone(),
            run_number: 0,
            runs: Vec::new(),
        });

        state.run_number += 1;
        let started_at = chrono::Utc::now().to_rfc3339();
        state.runs.push(RunState {
            run_number: state.run_number,
            session_id: new_session_id(&project_id),
            goal: goal.to_string(),
            approval_mode,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            steps: Vec::new(),
            repair_attempts: Vec::new(),
        });

        self.persist(&state)?;
        tracing::info!(
            project_id = %project_id,
            run_number = state.run_number,
            ?approval_mode,
            "run started"
        );
        Ok(state)
    }

    /// Durably writes the project record: temp file, fsync, atomic rename.
    pub fn persist(&self, state: &ProjectState) -> Result<()> {
        let dir = self.state_dir(&state.project_id);
        fs::create_dir_all(&dir)?;
        let path = self.state_path(&state.project_id);

        let persist_err = |reason: String| Error::Persistence {
            path: path.clone(),
            reason,
        };

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| persist_err(format!("serialize: {}", e)))?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| persist_err(format!("create temp file: {}", e)))?;
        temp.write_all(&json)
            .map_err(|e| persist_err(format!("write: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| persist_err(format!("sync: {}", e)))?;
        temp.persist(&path)
            .map_err(|e| persist_err(format!("rename: {}", e)))?;
        Ok(())
    }
}

/// Builds a unique session identifier: `<project>-<timestamp>-<suffix>`.
fn new_session_id(project_id: &str) -> String {
    let ts = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", project_id, ts, &suffix[..8])
}
