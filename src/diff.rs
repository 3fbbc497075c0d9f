//! Diff analysis.
//!
//! Parses unified diff text plus a changed-file list into a structured
//! [`ChangeSet`]. Diff content is treated strictly as text. Anything the
//! parser cannot account for is recorded as a parse error, which the gate
//! turns into a blocking reason; malformed input is never silently skipped.

use serde::{Deserialize, Serialize};

/// Per-file summary of a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    /// Repo-root-relative path, forward slashes, no traversal segments.
    pub path: String,
    /// Lines added.
    pub added: u32,
    /// Lines removed.
    pub removed: u32,
    /// True for binary changes; binary files report zero line counts.
    pub is_binary: bool,
}

/// Structured summary of one step's resulting change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Ordered changed files: file-list order first, then any files that
    /// appear only in the diff.
    pub files: Vec<ChangedFile>,
    /// The diff text the set was parsed from, kept for content scanning and
    /// replay of gate decisions.
    pub diff_text: String,
    /// Fragments the parser could not account for. Non-empty means the gate
    /// must not pass this change.
    pub parse_errors: Vec<String>,
}

impl ChangeSet {
    /// Number of changed files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Total lines added across all files.
    pub fn total_added(&self) -> u32 {
        self.files.iter().map(|f| f.added).sum()
    }

    /// Total lines removed across all files.
    pub fn total_removed(&self) -> u32 {
        self.files.iter().map(|f| f.removed).sum()
    }

    /// True when nothing changed and nothing failed to parse.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.parse_errors.is_empty()
    }
}

/// Normalizes a repo-relative path: forward slashes, no leading `./`.
fn normalize_path(path: &str) -> String {
    let normalized = path.trim().replace('\\', "/");
    normalized
        .strip_prefix("./")
        .unwrap_or(&normalized)
        .to_string()
}

/// Returns true if the path tries to escape the repository root.
fn escapes_root(path: &str) -> bool {
    path.starts_with('/') || path.split('/').any(|segment| segment == "..")
}

#[derive(Default)]
struct FileStats {
    added: u32,
    removed: u32,
    is_binary: bool,
}

/// Parses diff text and a file list into a [`ChangeSet`].
///
/// Files present in `file_list` but absent from the diff (mode changes,
/// renames without content edits) get zero counts. Files present only in the
/// diff are appended after the listed ones, so nothing the diff touches can
/// escape classification.
pub fn analyze(diff_text: &str, file_list: &[String]) -> ChangeSet {
    let mut parse_errors: Vec<String> = Vec::new();
    let mut parsed: Vec<(String, FileStats)> = Vec::new();
    let mut current: Option<usize> = None;

    for line in diff_text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            match parse_git_header(rest) {
                Some(path) => {
                    let path = normalize_path(&path);
                    if escapes_root(&path) {
                        parse_errors.push(format!("path escapes repository root: {}", path));
                        current = None;
                    } else {
                        parsed.push((path, FileStats::default()));
                        current = Some(parsed.len() - 1);
                    }
                }
                None => {
                    parse_errors.push(format!("unparseable diff header: {}", line));
                    current = None;
                }
            }
        } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
            match current {
                Some(idx) => parsed[idx].1.is_binary = true,
                None => parse_errors.push(format!("binary marker outside file section: {}", line)),
            }
        } else if line.starts_with("+++") || line.starts_with("---") {
            // Hunk file headers carry no line counts.
        } else if line.starts_with('+') {
            match current {
                Some(idx) => parsed[idx].1.added += 1,
                None => parse_errors.push("diff content outside any file section".to_string()),
            }
        } else if line.starts_with('-') {
            match current {
                Some(idx) => parsed[idx].1.removed += 1,
                None => parse_errors.push("diff content outside any file section".to_string()),
            }
        }
    }

    // Binary files report zero counts regardless of what the hunks said.
    for (_, stats) in parsed.iter_mut() {
        if stats.is_binary {
            stats.added = 0;
            stats.removed = 0;
        }
    }

    let mut files: Vec<ChangedFile> = Vec::new();
    let mut consumed: Vec<bool> = vec![false; parsed.len()];

    for listed in file_list {
        let path = normalize_path(listed);
        if path.is_empty() {
            parse_errors.push("empty path in file list".to_string());
            continue;
        }
        if escapes_root(&path) {
            parse_errors.push(format!("path escapes repository root: {}", path));
            continue;
        }
        let stats = parsed
            .iter()
            .position(|(p, _)| *p == path)
            .map(|idx| {
                consumed[idx] = true;
                &parsed[idx].1
            });
        files.push(match stats {
            Some(stats) => ChangedFile {
                path,
                added: stats.added,
                removed: stats.removed,
                is_binary: stats.is_binary,
            },
            None => ChangedFile {
                path,
                added: 0,
                removed: 0,
                is_binary: false,
            },
        });
    }

    for (idx, (path, stats)) in parsed.iter().enumerate() {
        if !consumed[idx] {
            files.push(ChangedFile {
                path: path.clone(),
                added: stats.added,
                removed: stats.removed,
                is_binary: stats.is_binary,
            });
        }
    }

    ChangeSet {
        files,
        diff_text: diff_text.to_string(),
        parse_errors,
    }
}

/// Extracts the post-image path from a `diff --git a/X b/Y` header rest.
fn parse_git_header(rest: &str) -> Option<String> {
    // Paths with spaces are rare in practice; split on " b/" from the right
    // so `a/dir/file b/dir/file` resolves to the post-image side.
    let idx = rest.rfind(" b/")?;
    if !rest.starts_with("a/") {
        return None;
    }
    let path = &rest[idx + 3..];
    if path.is_empty() {
        return None;
    }
    Some(path.to_string())
}
