//! Stepgate - policy-gated run/step orchestration for automated project work.
//!
//! This library scaffolds per-project workspaces, executes planned work in
//! discrete steps, and publishes each step as a branch and pull request. A
//! deterministic merge gate decides, per step, whether automatic merging is
//! permitted; run/step counters and approval state live in a durable,
//! lock-protected record that survives crashes and restarts.

pub mod artifact;
pub mod config;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod gate;
pub mod logging;
pub mod memory;
pub mod naming;
pub mod policy;
pub mod project;
pub mod repair;
pub mod services;
pub mod state;

pub use error::{Error, Result};

pub use artifact::{
    build_verification_guide, render_execution_summary, render_pr_body, ProjectDocument,
    RunSummary, StepExecution,
};
pub use config::{ApprovalMode, EngineConfig, ReviewToggle, TimeoutsConfig};
pub use coordinator::{RunProgress, RunReport, StepExecutionCoordinator, StepPhase};
pub use diff::{analyze, ChangeSet, ChangedFile};
pub use gate::{evaluate, evaluate_now, GateReport};
pub use memory::{MemoryEntry, ProjectMemory, ReviewSummary};
pub use policy::{ContentRule, PathPattern, PolicyConfig, RawContentRule, RawPolicy, Severity};
pub use project::{ensure_project_dir, ProjectSpec, RepoInfo};
pub use repair::{FixRequest, RepairLoop, RepairVerdict};
pub use services::{
    CommandRecord, ExecutionOutput, ExecutionService, ForgeService, IssueSeverity, PlanResponse,
    PlanStep, PlanningService, PullRequestRef, ReviewDecision, ReviewIssue, ReviewOutcome,
    ReviewRequest, ReviewService,
};
pub use state::{
    MergeOutcome, ProjectLock, ProjectState, RepairAttempt, RunState, RunStateStore, RunStatus,
    StepRecord,
};
