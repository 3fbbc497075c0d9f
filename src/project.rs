//! Project workspace layout and project spec documents.
//!
//! Each project owns a directory under the projects root; all step execution
//! is scoped strictly inside it. An optional `project.yaml` carries the
//! human-maintained description of the project.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Repository coordinates for a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    /// Remote URL, if the project is published.
    #[serde(default)]
    pub url: Option<String>,
    /// Default branch PRs target.
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// Human-maintained project description (`project.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    /// Project identifier.
    pub project_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Standing goal or mission for the project.
    #[serde(default)]
    pub goal: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Repository coordinates.
    #[serde(default)]
    pub repo: RepoInfo,
    /// Arbitrary tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ProjectSpec {
    /// Loads a project spec from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid project spec {}: {}", path.display(), e)))
    }

    /// Loads a spec, falling back to a minimal one when the file is missing
    /// or unreadable.
    pub fn load_or_default(path: &Path, project_id: &str) -> Self {
        match Self::load(path) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "project spec unavailable");
                Self {
                    project_id: project_id.to_string(),
                    name: project_id.to_string(),
                    ..Self::default()
                }
            }
        }
    }

    /// One-line summary for logs and prompts.
    pub fn summarize(&self) -> String {
        let name = if self.name.is_empty() {
            &self.project_id
        } else {
            &self.name
        };
        let goal = if self.goal.is_empty() {
            "(no goal)"
        } else {
            &self.goal
        };
        format!("project {}: {}", name, goal)
    }
}

/// Ensures the workspace directory for a project exists, including its
/// `output/` subdirectory, and returns its path.
pub fn ensure_project_dir(projects_root: &Path, project_id: &str) -> Result<PathBuf> {
    let dir = projects_root.join(project_id);
    fs::create_dir_all(dir.join("output"))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_project_dir_creates_output() {
        let root = TempDir::new().unwrap();
        let dir = ensure_project_dir(root.path(), "demo").unwrap();
        assert!(dir.join("output").is_dir());
        // Idempotent.
        ensure_project_dir(root.path(), "demo").unwrap();
    }

    #[test]
    fn project_spec_round_trips_yaml() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("project.yaml");
        std::fs::write(
            &path,
            "project_id: demo\nname: Demo\ngoal: build a small API\ntags: [api]\n",
        )
        .unwrap();

        let spec = ProjectSpec::load(&path).unwrap();
        assert_eq!(spec.project_id, "demo");
        assert_eq!(spec.tags, vec!["api"]);
        assert_eq!(spec.summarize(), "project Demo: build a small API");
    }

    #[test]
    fn load_rejects_invalid_yaml() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("project.yaml");
        std::fs::write(&path, "project_id: [unclosed").unwrap();
        assert!(matches!(ProjectSpec::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn load_or_default_survives_missing_file() {
        let spec = ProjectSpec::load_or_default(Path::new("/nonexistent/project.yaml"), "demo");
        assert_eq!(spec.project_id, "demo");
        assert_eq!(spec.name, "demo");
    }
}
