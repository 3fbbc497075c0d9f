//! Cross-run project memory.
//!
//! A small index of past projects and their review outcomes, kept under the
//! projects root. Its summary is handed to the planning service as context,
//! so new runs can learn from how earlier, similar goals went.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::services::{IssueSeverity, ReviewIssue, ReviewOutcome};

/// Compact review digest stored per project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewSummary {
    /// Reviewer's one-line assessment.
    #[serde(default)]
    pub overall_assessment: String,
    /// Flagged issues.
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    /// Reviewer suggestions.
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// True when any issue is medium or high.
    #[serde(default)]
    pub has_medium_or_high: bool,
}

impl ReviewSummary {
    /// Digests a full review outcome.
    pub fn from_outcome(outcome: &ReviewOutcome) -> Self {
        Self {
            overall_assessment: outcome.overall_assessment.clone(),
            issues: outcome.issues.clone(),
            suggestions: outcome.suggestions.clone(),
            has_medium_or_high: outcome.has_issues_at_or_above(IssueSeverity::Medium),
        }
    }
}

/// One project's entry in the memory index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Project identifier.
    pub project_id: String,
    /// Goal of the most recent run.
    pub goal: String,
    /// Workspace directory.
    pub project_dir: String,
    /// Path of the most recent run summary artifact.
    pub run_summary_path: String,
    /// Digest of the most recent review.
    #[serde(default)]
    pub review: ReviewSummary,
    /// When the entry was first created (RFC 3339).
    pub created_at: String,
    /// When the entry was last updated.
    pub updated_at: String,
}

/// Memory index stored at `<projects_root>/memory/project_index.json`.
pub struct ProjectMemory {
    index_path: PathBuf,
}

impl ProjectMemory {
    /// Creates a memory handle under the given projects root.
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            index_path: projects_root.into().join("memory").join("project_index.json"),
        }
    }

    /// Loads the index; missing or unreadable indexes read as empty.
    pub fn load_index(&self) -> Vec<MemoryEntry> {
        let raw = match fs::read_to_string(&self.index_path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "memory index unreadable; starting empty");
                Vec::new()
            }
        }
    }

    /// Persists the index.
    pub fn save_index(&self, entries: &[MemoryEntry]) -> Result<()> {
        if let Some(parent) = self.index_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(entries).map_err(|e| Error::Persistence {
            path: self.index_path.clone(),
            reason: format!("serialize: {}", e),
        })?;
        fs::write(&self.index_path, json)?;
        Ok(())
    }

    /// Upserts a project entry after a run.
    pub fn update(
        &self,
        project_id: &str,
        goal: &str,
        project_dir: &str,
        run_summary_path: &str,
        review: ReviewSummary,
    ) -> Result<MemoryEntry> {
        let mut entries = self.load_index();
        let now = chrono::Utc::now().to_rfc3339();

        let entry = match entries.iter_mut().find(|e| e.project_id == project_id) {
            Some(existing) => {
                existing.goal = goal.to_string();
                existing.project_dir = project_dir.to_string();
                existing.run_summary_path = run_summary_path.to_string();
                existing.review = review;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let entry = MemoryEntry {
                    project_id: project_id.to_string(),
                    goal: goal.to_string(),
                    project_dir: project_dir.to_string(),
                    run_summary_path: run_summary_path.to_string(),
                    review,
                    created_at: now.clone(),
                    updated_at: now,
                };
                entries.push(entry.clone());
                entry
            }
        };

        self.save_index(&entries)?;
        tracing::info!(project_id, "memory index updated");
        Ok(entry)
    }

    /// Builds a compact text summary of the most relevant past projects.
    ///
    /// Entries are ranked by word overlap with the goal, then by recency,
    /// and capped at `max_entries` to keep planner prompts small.
    pub fn summarize_recent(&self, goal: Option<&str>, max_entries: usize) -> String {
        let entries = self.load_index();
        if entries.is_empty() {
            return String::new();
        }

        let target_words: HashSet<String> = goal
            .map(|g| words_of(g).into_iter().collect())
            .unwrap_or_default();

        let mut ranked: Vec<&MemoryEntry> = entries.iter().collect();
        ranked.sort_by(|a, b| {
            let score = |entry: &MemoryEntry| {
                let overlap = if target_words.is_empty() {
                    0
                } else {
                    words_of(&entry.goal)
                        .iter()
                        .filter(|w| target_words.contains(*w))
                        .count()
                };
                (overlap, entry.updated_at.clone())
            };
            score(b).cmp(&score(a))
        });

        let mut lines = vec!["Recent/related project memory:".to_string()];
        for entry in ranked.into_iter().take(max_entries) {
            let first_issue = entry
                .review
                .issues
                .first()
                .map(|i| truncate(&i.description, 120))
                .unwrap_or_default();
            lines.push(format!(
                "- {}: goal='{}'; assessment='{}'; medium/high issues={}; first_issue='{}'",
                entry.project_id,
                truncate(&entry.goal, 80),
                truncate(&entry.review.overall_assessment, 140),
                entry.review.has_medium_or_high,
                first_issue
            ));
        }
        lines.join("\n")
    }
}

fn words_of(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit.saturating_sub(3);
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory() -> (TempDir, ProjectMemory) {
        let dir = TempDir::new().unwrap();
        let memory = ProjectMemory::new(dir.path());
        (dir, memory)
    }

    #[test]
    fn missing_index_reads_empty() {
        let (_dir, memory) = memory();
        assert!(memory.load_index().is_empty());
        assert_eq!(memory.summarize_recent(Some("anything"), 3), "");
    }

    #[test]
    fn update_inserts_then_overwrites() {
        let (_dir, memory) = memory();
        memory
            .update("demo", "build api", "projects/demo", "runs/a.json", ReviewSummary::default())
            .unwrap();
        memory
            .update("demo", "extend api", "projects/demo", "runs/b.json", ReviewSummary::default())
            .unwrap();

        let entries = memory.load_index();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].goal, "extend api");
        assert_eq!(entries[0].run_summary_path, "runs/b.json");
    }

    #[test]
    fn summarize_ranks_by_goal_overlap() {
        let (_dir, memory) = memory();
        memory
            .update("alpha", "build a fastapi service", "p/alpha", "r/a.json", ReviewSummary::default())
            .unwrap();
        memory
            .update("beta", "write terraform modules", "p/beta", "r/b.json", ReviewSummary::default())
            .unwrap();

        let summary = memory.summarize_recent(Some("extend the fastapi service"), 1);
        assert!(summary.contains("alpha"));
        assert!(!summary.contains("beta"));
    }

    #[test]
    fn corrupt_index_reads_empty() {
        let (dir, memory) = memory();
        let path = dir.path().join("memory").join("project_index.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();
        assert!(memory.load_index().is_empty());
    }
}
