//! Guardrail policy engine
//!
//! Classifies a candidate command as [`Verdict::Allowed`],
//! [`Verdict::Blocked`] or [`Verdict::NeedsApproval`]. Evaluation order is
//! fixed:
//!
//! 1. working directory outside the allow-list: blocked
//! 2. any block rule matches: blocked, no override
//! 3. any approve rule matches: needs approval
//! 4. otherwise allowed
//!
//! [`GuardrailPolicy`] is immutable once built. Hot reload swaps whole
//! policies through a [`PolicyHandle`].

mod rules;
mod watcher;

pub use rules::{
    default_allowed_directories, default_rules, GuardrailRule, MatchKind, PolicyFile, RuleAction,
};
pub use watcher::{PolicyHandle, PolicyWatcher};

use crate::config::GuardrailsConfig;
use crate::error::{OrchestratorError, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Outcome of evaluating one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allowed,
    Blocked { reason: String },
    NeedsApproval { reason: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Blocked { .. })
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Contains(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: GuardrailRule,
    matcher: Matcher,
}

impl CompiledRule {
    fn compile(rule: GuardrailRule) -> Result<Self> {
        let matcher = match rule.match_kind {
            MatchKind::Contains => Matcher::Contains(normalize_text(&rule.pattern)),
            MatchKind::Regex => {
                let regex = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        OrchestratorError::InvalidConfig(format!(
                            "invalid guardrail regex '{}': {}",
                            rule.pattern, e
                        ))
                    })?;
                Matcher::Regex(regex)
            }
        };
        Ok(Self { rule, matcher })
    }

    fn matches(&self, normalized: &str) -> bool {
        match &self.matcher {
            Matcher::Contains(needle) => !needle.trim().is_empty() && normalized.contains(needle),
            Matcher::Regex(regex) => regex.is_match(normalized),
        }
    }
}

/// An immutable, compiled guardrail policy
#[derive(Debug, Clone)]
pub struct GuardrailPolicy {
    allowed_directories: Vec<PathBuf>,
    blocks: Vec<CompiledRule>,
    approvals: Vec<CompiledRule>,
}

impl GuardrailPolicy {
    /// Compile a rule list and an allow-list (entries may start with `~`)
    pub fn new(rules: Vec<GuardrailRule>, allowed_directories: &[String]) -> Result<Self> {
        let mut blocks = Vec::new();
        let mut approvals = Vec::new();
        for rule in rules {
            let compiled = CompiledRule::compile(rule)?;
            match compiled.rule.action {
                RuleAction::Block => blocks.push(compiled),
                RuleAction::Approve => approvals.push(compiled),
            }
        }

        let allowed_directories = allowed_directories
            .iter()
            .map(|entry| resolve_directory(&expand_home(entry)))
            .collect();

        Ok(Self {
            allowed_directories,
            blocks,
            approvals,
        })
    }

    /// Built-in defaults
    pub fn with_defaults() -> Result<Self> {
        Self::new(default_rules(), &default_allowed_directories())
    }

    /// Build from configuration: the policy file when one is set, inline
    /// rules otherwise, built-in defaults as the last resort.
    pub fn from_config(config: &GuardrailsConfig) -> Result<Self> {
        if let Some(path) = &config.policy_file {
            return Self::load_file(path, config);
        }
        let rules = if config.rules.is_empty() {
            default_rules()
        } else {
            config.rules.clone()
        };
        Self::new(rules, &config.allowed_directories)
    }

    /// Parse a policy file. Directories missing from the file fall back to
    /// the configured allow-list; an empty rule list falls back to defaults.
    pub fn load_file(path: &Path, config: &GuardrailsConfig) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::InvalidConfig(format!(
                "cannot read policy file {}: {}",
                path.display(),
                e
            ))
        })?;
        let file = PolicyFile::parse(&text).map_err(|e| {
            OrchestratorError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        let rules = if file.rules.is_empty() {
            default_rules()
        } else {
            file.rules
        };
        let directories = file
            .allowed_directories
            .unwrap_or_else(|| config.allowed_directories.clone());
        Self::new(rules, &directories)
    }

    /// Classify `text` run inside `cwd`
    pub fn evaluate(&self, text: &str, cwd: &Path) -> Verdict {
        if !self.directory_allowed(cwd) {
            return Verdict::Blocked {
                reason: format!(
                    "Working directory {} is outside the allowed directories",
                    cwd.display()
                ),
            };
        }

        let normalized = normalize_text(text);

        if let Some(rule) = self.blocks.iter().find(|r| r.matches(&normalized)) {
            return Verdict::Blocked {
                reason: rule.rule.describe(),
            };
        }

        if let Some(rule) = self.approvals.iter().find(|r| r.matches(&normalized)) {
            return Verdict::NeedsApproval {
                reason: rule.rule.describe(),
            };
        }

        Verdict::Allowed
    }

    /// Whether `cwd` equals or descends from an allow-list entry.
    /// An empty allow-list admits nothing.
    pub fn directory_allowed(&self, cwd: &Path) -> bool {
        if !cwd.is_absolute() {
            return false;
        }
        let cwd = normalize_path(cwd);
        self.allowed_directories
            .iter()
            .any(|allowed| cwd.starts_with(allowed))
    }

    pub fn allowed_directories(&self) -> &[PathBuf] {
        &self.allowed_directories
    }

    pub fn rule_count(&self) -> usize {
        self.blocks.len() + self.approvals.len()
    }
}

/// Lowercase and collapse every whitespace run to a single space
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.extend(ch.to_lowercase());
            in_space = false;
        }
    }
    out
}

/// Expand a leading `~` using `$HOME`
pub fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

/// Lexically resolve `.` and `..` components
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Normalize and, when the directory exists, resolve symlinks
pub fn resolve_directory(path: &Path) -> PathBuf {
    let normalized = normalize_path(path);
    std::fs::canonicalize(&normalized).unwrap_or(normalized)
}
