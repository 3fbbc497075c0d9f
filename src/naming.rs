//! Branch and pull-request naming.
//!
//! Names are pure functions of `(project_id, run_number, step_number, slug)`
//! so that resuming from persisted counters reproduces identical names.

/// Maximum slug length in branch names.
const MAX_SLUG_LEN: usize = 40;

/// Maximum length of the shortened goal in PR titles.
const MAX_SHORT_GOAL_LEN: usize = 60;

/// Turns arbitrary text into a branch-safe slug.
///
/// Lowercases, replaces non-alphanumeric runs with single dashes, trims
/// leading/trailing dashes, and truncates. Empty input yields `"step"`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-');
    let mut slug = slug.to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        slug = "step".to_string();
    }
    slug
}

/// Collapses whitespace and truncates a goal for display in PR titles.
pub fn short_goal(text: &str) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return "Update".to_string();
    }
    if cleaned.len() <= MAX_SHORT_GOAL_LEN {
        return cleaned;
    }
    let mut cut = MAX_SHORT_GOAL_LEN - 3;
    while !cleaned.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", cleaned[..cut].trim_end())
}

/// Builds the branch name for a step: `run-<run>-step-<step>-<slug>`.
pub fn branch_name(run_number: u32, step_number: u32, slug: &str) -> String {
    format!("run-{}-step-{}-{}", run_number, step_number, slug)
}

/// Builds the PR title: `<project> — Run <run> / Step <step> — <shortGoal>`.
pub fn pr_title(project_id: &str, run_number: u32, step_number: u32, goal: &str) -> String {
    format!(
        "{} — Run {} / Step {} — {}",
        project_id,
        run_number,
        step_number,
        short_goal(goal)
    )
}

/// Builds the run summary filename: `<slug>-<YYYY-MM-DD>.json`.
pub fn run_summary_filename(goal: &str, date: &str) -> String {
    let mut slug = slugify(goal);
    slug.truncate(50);
    format!("{}-{}.json", slug.trim_end_matches('-'), date)
}
