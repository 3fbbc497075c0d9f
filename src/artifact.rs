//! Run and project artifacts.
//!
//! After a run, the engine writes two documents: a per-run summary under
//! `<project>/runs/` and a per-project `PROJECT_INFO.json` with the latest
//! goal, plan, review, gate history, and a derived verification guide.
//! These are reports, not state: the durable record in `.stepgate/` remains
//! the source of truth.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::diff::ChangedFile;
use crate::error::{Error, Result};
use crate::gate::GateReport;
use crate::naming;
use crate::services::{CommandRecord, PlanResponse, ReviewOutcome};
use crate::state::{RepairAttempt, RunState, RunStatus, StepRecord};

/// In-memory execution trace for one step: what ran and what changed.
///
/// Not persisted in `.stepgate/` (the durable record keeps only gate-relevant
/// facts); carried through the run and written into artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// Attempt this execution belongs to: `initial` or `repair-<n>`.
    pub attempt_label: String,
    /// Planner step id.
    pub step_id: u32,
    /// Step description.
    pub description: String,
    /// Commands run, in order.
    pub history: Vec<CommandRecord>,
    /// Files the step changed.
    pub changed_files: Vec<ChangedFile>,
}

/// Renders execution history into a text blob for the review service.
pub fn render_execution_summary(executions: &[StepExecution]) -> String {
    let mut text = String::new();
    for execution in executions {
        text.push_str(&format!(
            "\n--- Attempt: {} | Step {} ---\n",
            execution.attempt_label, execution.step_id
        ));
        text.push_str(&format!("Description: {}\n", execution.description));
        for cmd in &execution.history {
            text.push_str(&format!("COMMAND: {}\n", cmd.command));
            text.push_str(&format!("RETURN CODE: {}\n", cmd.exit_code));
            text.push_str(&format!("STDOUT:\n{}\n", cmd.stdout));
            text.push_str(&format!("STDERR:\n{}\n", cmd.stderr));
        }
    }
    text
}

/// Generates a PR body annotated with the gate report.
pub fn render_pr_body(
    session_id: &str,
    step: &StepRecord,
    report: &GateReport,
    history: &[CommandRecord],
    files: &[ChangedFile],
) -> String {
    let mut body = String::new();

    body.push_str("## Summary\n\n");
    body.push_str(&step.description);
    body.push_str("\n\n");

    body.push_str("## Merge Gate\n\n");
    if report.eligible {
        body.push_str("Eligible for automatic merge.\n");
    } else {
        body.push_str("Not eligible for automatic merge.\n");
    }
    if !report.blocking_reasons.is_empty() {
        body.push_str("\nBlocking reasons:\n");
        for reason in &report.blocking_reasons {
            body.push_str(&format!("- {}\n", reason));
        }
    }
    if !report.warnings.is_empty() {
        body.push_str("\nWarnings:\n");
        for warning in &report.warnings {
            body.push_str(&format!("- {}\n", warning));
        }
    }
    body.push_str(&format!(
        "\n{} files changed, +{} / -{} lines, evaluated {}\n\n",
        report.files_changed, report.lines_added, report.lines_removed, report.evaluated_at
    ));

    if !history.is_empty() {
        body.push_str("## Commands\n\n");
        for cmd in history {
            body.push_str(&format!("- `{}`\n", cmd.command));
        }
        body.push('\n');
    }

    if !files.is_empty() {
        body.push_str(&format!("## Files Changed ({})\n\n", files.len()));
        for file in files {
            if file.is_binary {
                body.push_str(&format!("- `{}` (binary)\n", file.path));
            } else {
                body.push_str(&format!(
                    "- `{}` (+{}, -{})\n",
                    file.path, file.added, file.removed
                ));
            }
        }
        body.push('\n');
    }

    body.push_str("---\n");
    body.push_str(&format!("Session: `{}`\n", session_id));
    body
}

/// Builds a human-readable guide for verifying the project by hand.
///
/// Looks at what actually exists in the workspace and points the reader at
/// it in order.
pub fn build_verification_guide(goal: &str, project_dir: &Path) -> String {
    let mut lines = vec![
        format!("To verify \"{}\":", naming::short_goal(goal)),
        format!("1. Open a terminal and change into {}", project_dir.display()),
    ];

    let readme = project_dir.join("README.md");
    let server_run = project_dir.join("SERVER_RUN.md");
    let start_script = project_dir.join("start_server.sh");
    let mut step = 2;

    if readme.exists() {
        lines.push(format!("{}. Read README.md for setup and usage", step));
        step += 1;
    }
    if server_run.exists() {
        lines.push(format!(
            "{}. Follow SERVER_RUN.md to start and exercise the server",
            step
        ));
        step += 1;
    }
    if start_script.exists() {
        lines.push(format!(
            "{}. Run ./start_server.sh (chmod +x first if needed)",
            step
        ));
        step += 1;
    }

    lines.push(format!(
        "{}. If a web service starts, check the documented URL (commonly http://127.0.0.1:8000)",
        step
    ));
    lines.push(format!(
        "{}. Run any documented test command (e.g. pytest) to validate behavior",
        step + 1
    ));

    if !readme.exists() && !server_run.exists() && !start_script.exists() {
        lines.push(String::new());
        lines.push(
            "Note: no README.md, SERVER_RUN.md, or start_server.sh was found; inspect the \
             project files directly to see how to run it."
                .to_string(),
        );
    }

    lines.join("\n")
}

/// Per-run summary artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Project identifier.
    pub project_id: String,
    /// Goal the run pursued.
    pub goal: String,
    /// Session identifier.
    pub session_id: String,
    /// Run number.
    pub run_number: u32,
    /// Final status.
    pub status: RunStatus,
    /// All step records.
    pub steps: Vec<StepRecord>,
    /// All repair attempts.
    pub repair_attempts: Vec<RepairAttempt>,
    /// Execution traces across all attempts.
    pub executions: Vec<StepExecution>,
    /// Final review, when review ran.
    pub review: Option<ReviewOutcome>,
    /// Run start (RFC 3339).
    pub started_at: String,
    /// Run end.
    pub completed_at: Option<String>,
}

impl RunSummary {
    /// Builds a summary from a finished (or halted) run.
    pub fn from_run(
        project_id: &str,
        run: &RunState,
        executions: Vec<StepExecution>,
        review: Option<ReviewOutcome>,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            goal: run.goal.clone(),
            session_id: run.session_id.clone(),
            run_number: run.run_number,
            status: run.status,
            steps: run.steps.clone(),
            repair_attempts: run.repair_attempts.clone(),
            executions,
            review,
            started_at: run.started_at.clone(),
            completed_at: run.completed_at.clone(),
        }
    }

    /// Writes the summary under `<project_dir>/runs/` and returns its path.
    pub fn write(&self, project_dir: &Path) -> Result<PathBuf> {
        let runs_dir = project_dir.join("runs");
        fs::create_dir_all(&runs_dir)?;
        let date = self.started_at.get(..10).unwrap_or("undated");
        let path = runs_dir.join(naming::run_summary_filename(&self.goal, date));
        let json = serde_json::to_vec_pretty(self).map_err(|e| Error::Persistence {
            path: path.clone(),
            reason: format!("serialize: {}", e),
        })?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Per-project artifact (`PROJECT_INFO.json`): the latest goal, plan,
/// review, gate history, and verification guide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDocument {
    /// Goal of the latest run.
    pub goal: String,
    /// Workspace directory.
    pub project_dir: String,
    /// Initial plan of the latest run.
    pub plan: PlanResponse,
    /// Final review of the latest run.
    pub review: Option<ReviewOutcome>,
    /// Gate reports of every gated step in the latest run.
    pub gate_history: Vec<GateReport>,
    /// Repair attempts of the latest run.
    pub repair_attempts: Vec<RepairAttempt>,
    /// Final status of the latest run.
    pub status: RunStatus,
    /// True when medium/high review issues remain.
    pub blocking_issues_remaining: bool,
    /// Run start.
    pub started_at: String,
    /// Run end.
    pub completed_at: Option<String>,
    /// Derived verification guide.
    pub how_to_verify: String,
}

impl ProjectDocument {
    /// Writes the document into the project directory and returns its path.
    pub fn write(&self, project_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(project_dir)?;
        let path = project_dir.join("PROJECT_INFO.json");
        let json = serde_json::to_vec_pretty(self).map_err(|e| Error::Persistence {
            path: path.clone(),
            reason: format!("serialize: {}", e),
        })?;
        fs::write(&path, json)?;
        tracing::info!(path = %path.display(), "project document written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_execution() -> StepExecution {
        StepExecution {
            attempt_label: "initial".to_string(),
            step_id: 1,
            description: "scaffold the app".to_string(),
            history: vec![CommandRecord {
                command: "mkdir -p output".to_string(),
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            }],
            changed_files: vec![],
        }
    }

    #[test]
    fn execution_summary_includes_commands_and_attempts() {
        let summary = render_execution_summary(&[sample_execution()]);
        assert!(summary.contains("Attempt: initial | Step 1"));
        assert!(summary.contains("COMMAND: mkdir -p output"));
        assert!(summary.contains("RETURN CODE: 0"));
    }

    #[test]
    fn pr_body_lists_gate_findings() {
        let step = StepRecord {
            step_number: 1,
            step_id: 1,
            description: "add endpoint".to_string(),
            slug: "add-endpoint".to_string(),
            branch_name: "run-1-step-1-add-endpoint".to_string(),
            attempt_label: "initial".to_string(),
            pr: None,
            gate_report: None,
            merge_outcome: None,
            pushed: false,
            error: None,
            started_at: String::new(),
            finished_at: None,
        };
        let report = GateReport {
            eligible: false,
            blocking_reasons: vec!["hard-stop path: agents/**".to_string()],
            warnings: vec!["binary file change: logo.png".to_string()],
            files_changed: 2,
            lines_added: 5,
            lines_removed: 0,
            evaluated_at: "2026-08-07T00:00:00+00:00".to_string(),
        };
        let files = vec![ChangedFile {
            path: "logo.png".to_string(),
            added: 0,
            removed: 0,
            is_binary: true,
        }];

        let body = render_pr_body("sess-1", &step, &report, &[], &files);
        assert!(body.contains("Not eligible"));
        assert!(body.contains("hard-stop path: agents/**"));
        assert!(body.contains("binary file change: logo.png"));
        assert!(body.contains("`logo.png` (binary)"));
        assert!(body.contains("Session: `sess-1`"));
    }

    #[test]
    fn verification_guide_mentions_existing_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README.md"), "# hi").unwrap();
        let guide = build_verification_guide("serve the data", dir.path());
        assert!(guide.contains("README.md"));
        assert!(!guide.contains("SERVER_RUN.md"));
    }

    #[test]
    fn verification_guide_notes_bare_projects() {
        let dir = TempDir::new().unwrap();
        let guide = build_verification_guide("goal", dir.path());
        assert!(guide.contains("inspect the project files"));
    }

    #[test]
    fn run_summary_filename_uses_goal_and_date() {
        let dir = TempDir::new().unwrap();
        let run = RunState {
            run_number: 1,
            session_id: "s".to_string(),
            goal: "Build the API".to_string(),
            approval_mode: crate::config::ApprovalMode::Auto,
            status: RunStatus::Completed,
            started_at: "2026-08-07T10:00:00Z".to_string(),
            completed_at: None,
            steps: vec![],
            repair_attempts: vec![],
        };
        let summary = RunSummary::from_run("demo", &run, vec![], None);
        let path = summary.write(dir.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "build-the-api-2026-08-07.json"
        );
    }
}
