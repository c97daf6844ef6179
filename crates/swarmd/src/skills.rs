//! Capability discovery.
//!
//! Skills are pre-installed adjunct packages under a well-known directory;
//! the orchestrator's only job is to find their names and hint at them in
//! prompts. Discovery failure is never an error, just an empty list.

use std::path::Path;

/// Names of installed skills: subdirectories of `skills_dir` containing a
/// `SKILL.md`. Sorted for stable prompt text.
pub fn discover_skills(skills_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(skills_dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| entry.path().join("SKILL.md").is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}
