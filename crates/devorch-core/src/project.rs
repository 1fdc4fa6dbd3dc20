//! Project context
//!
//! The orchestrator keeps one active project. Detection is pluggable via
//! [`ProjectDetector`]; the bundled [`DirectoryDetector`] reads the
//! directory name, the current git branch and the toolchain marker files.

use crate::error::{OrchestratorError, Result};
use crate::guardrail::resolve_directory;
use crate::types::ProjectProfile;
use std::path::Path;

const PYTHON_MARKERS: &[&str] = &["pyproject.toml", "setup.py", "requirements.txt"];

/// Project kinds recognised from marker files in `path`
pub fn project_types(path: &Path) -> Vec<String> {
    let has = |name: &str| path.join(name).exists();
    let mut types = Vec::new();

    if PYTHON_MARKERS.iter().any(|m| has(*m)) {
        types.push("python");
        let mentions_pytest = PYTHON_MARKERS.iter().any(|m| {
            std::fs::read_to_string(path.join(m))
                .map(|content| content.to_lowercase().contains("pytest"))
                .unwrap_or(false)
        });
        if mentions_pytest || has("pytest.ini") || has("conftest.py") {
            types.push("pytest");
        }
    }
    if has("package.json") {
        types.push("node");
    }
    if has("Cargo.toml") {
        types.push("rust");
    }
    if has("go.mod") {
        types.push("go");
    }
    if has(".git") {
        types.push("git");
    }
    types.into_iter().map(str::to_string).collect()
}

fn node_package_manager(path: &Path) -> &'static str {
    if path.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if path.join("yarn.lock").exists() {
        "yarn"
    } else {
        "npm"
    }
}

/// Test command for a project of the given kinds, if one is known
pub fn test_command(path: &Path, types: &[String]) -> Option<String> {
    let is = |kind: &str| types.iter().any(|t| t == kind);
    if is("pytest") {
        Some("pytest".to_string())
    } else if is("node") {
        Some(format!("{} test", node_package_manager(path)))
    } else if is("rust") {
        Some("cargo test".to_string())
    } else if is("go") {
        Some("go test ./...".to_string())
    } else {
        None
    }
}

pub trait ProjectDetector: Send + Sync + std::fmt::Debug {
    fn detect(&self, path: &Path) -> Result<ProjectProfile>;
}

#[derive(Debug, Default, Clone)]
pub struct DirectoryDetector;

impl DirectoryDetector {
    fn git_branch(path: &Path) -> Option<String> {
        let head = std::fs::read_to_string(path.join(".git").join("HEAD")).ok()?;
        let head = head.trim();
        match head.strip_prefix("ref: refs/heads/") {
            Some(branch) => Some(branch.to_string()),
            // Detached HEAD: short commit id
            None => head.get(..7).map(str::to_string),
        }
    }
}

impl ProjectDetector for DirectoryDetector {
    fn detect(&self, path: &Path) -> Result<ProjectProfile> {
        let path = resolve_directory(path);
        if !path.is_dir() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "project path {} is not a directory",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(ProjectProfile {
            name,
            git_branch: Self::git_branch(&path),
            project_type: project_types(&path),
            path,
        })
    }
}
