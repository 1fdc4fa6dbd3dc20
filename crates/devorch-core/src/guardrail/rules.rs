//! Guardrail rules as data, plus the built-in defaults.
//!
//! A policy file is TOML:
//!
//! ```toml
//! allowed_directories = ["~/work", "~/projects"]
//!
//! [[rule]]
//! pattern = "git push --force"
//! action = "approve"
//! reason = "Force push rewrites remote history"
//!
//! [[rule]]
//! pattern = '\bmkfs(\.\w+)?\b'
//! action = "block"
//! match = "regex"
//! ```

use serde::{Deserialize, Serialize};

/// What a matching rule does to the command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Approve,
}

/// How a rule's pattern is matched against the command text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Case-insensitive substring on whitespace-normalized text
    #[default]
    Contains,
    /// Case-insensitive regular expression
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailRule {
    pub pattern: String,
    pub action: RuleAction,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, rename = "match")]
    pub match_kind: MatchKind,
}

impl GuardrailRule {
    pub fn block(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            action: RuleAction::Block,
            reason: None,
            match_kind: MatchKind::Contains,
        }
    }

    pub fn approve(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            action: RuleAction::Approve,
            reason: None,
            match_kind: MatchKind::Contains,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn regex(mut self) -> Self {
        self.match_kind = MatchKind::Regex;
        self
    }

    /// Human-readable explanation that always names the matched pattern
    pub fn describe(&self) -> String {
        match (&self.reason, self.action) {
            (Some(reason), _) => format!("{} (matched '{}')", reason, self.pattern),
            (None, RuleAction::Block) => {
                format!("Command matches blocked pattern '{}'", self.pattern)
            }
            (None, RuleAction::Approve) => {
                format!("Command contains '{}' which requires approval", self.pattern)
            }
        }
    }
}

/// On-disk shape of a policy file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub allowed_directories: Option<Vec<String>>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<GuardrailRule>,
}

impl PolicyFile {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Directories commands may run in when nothing else is configured
pub fn default_allowed_directories() -> Vec<String> {
    ["~/work", "~/personal", "~/repos", "~/projects", "~/dev"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

/// Built-in hard blocks followed by approval-required patterns.
pub fn default_rules() -> Vec<GuardrailRule> {
    let mut rules = vec![
        // Any flag order or spelling, `--` and extra operands included.
        GuardrailRule::block(
            r"\brm\s+(-[a-z-]*\s+)*(-[a-z]*r[a-z]*|--recursive)\s+([^\s;&|]+\s+)*(/[/.]*\*?|~/?\*?|\$\{?home\}?/?\*?)(\s|;|&|\||$)",
        )
        .regex()
        .with_reason("Recursive delete of the filesystem root or home directory"),
        GuardrailRule::block("sudo rm -rf").with_reason("Privileged recursive delete"),
        GuardrailRule::block(r"\bmkfs(\.\w+)?\b")
            .regex()
            .with_reason("Formatting a filesystem"),
        GuardrailRule::block(r"\bdd\s+if=")
            .regex()
            .with_reason("Raw disk copy"),
        GuardrailRule::block(r">\s*/dev/(sd[a-z]|nvme\d|disk\d|hd[a-z])")
            .regex()
            .with_reason("Raw write to a block device"),
        GuardrailRule::block(r"\bchmod\s+-r\s+777\s+/(\s|$)")
            .regex()
            .with_reason("World-writable filesystem root"),
        GuardrailRule::block(":(){ :|:& };:").with_reason("Fork bomb"),
    ];

    let approvals: &[(&str, &str)] = &[
        ("git push --force", "Force push rewrites remote history"),
        ("git push -f", "Force push rewrites remote history"),
        ("git reset --hard", "Hard reset discards local changes"),
        ("git clean -fd", "Removes untracked files"),
        ("drop table", "Destructive data-store statement"),
        ("drop database", "Destructive data-store statement"),
        ("delete from", "Destructive data-store statement"),
        ("truncate", "Destructive data-store statement"),
        ("sudo ", "Privilege escalation"),
        ("chmod -r", "Recursive permission change"),
        ("chown -r", "Recursive ownership change"),
        ("kill -9", "Forced process kill"),
        ("killall", "Mass process kill"),
        ("pkill", "Mass process kill"),
        ("shutdown", "Machine shutdown"),
        ("reboot", "Machine reboot"),
        ("npm publish", "Package publish"),
        ("cargo publish", "Package publish"),
        ("pip upload", "Package publish"),
        ("twine upload", "Package publish"),
    ];
    rules.push(
        GuardrailRule::approve(r"\brm\s+([^\s;&|]+\s+)*(-[a-z]*r[a-z]*|--recursive)(\s|;|&|\||$)")
            .regex()
            .with_reason("Recursive delete"),
    );
    rules.extend(
        approvals
            .iter()
            .map(|(pattern, reason)| GuardrailRule::approve(*pattern).with_reason(*reason)),
    );
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy_file() {
        let text = r#"
allowed_directories = ["~/src"]

[[rule]]
pattern = "terraform destroy"
action = "block"

[[rule]]
pattern = 'deploy\s+prod'
action = "approve"
match = "regex"
reason = "Production deploy"
"#;
        let file = PolicyFile::parse(text).unwrap();
        assert_eq!(file.allowed_directories, Some(vec!["~/src".to_string()]));
        assert_eq!(file.rules.len(), 2);
        assert_eq!(file.rules[0].action, RuleAction::Block);
        assert_eq!(file.rules[0].match_kind, MatchKind::Contains);
        assert_eq!(file.rules[1].match_kind, MatchKind::Regex);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let text = "[[rule]]\npattern = \"x\"\naction = \"maybe\"\n";
        assert!(PolicyFile::parse(text).is_err());
    }

    #[test]
    fn test_describe_names_pattern() {
        let rule = GuardrailRule::approve("git push --force");
        assert_eq!(
            rule.describe(),
            "Command contains 'git push --force' which requires approval"
        );
        let rule = rule.with_reason("Force push");
        assert!(rule.describe().contains("git push --force"));
    }

    #[test]
    fn test_defaults_put_blocks_first() {
        let rules = default_rules();
        let first_approve = rules
            .iter()
            .position(|r| r.action == RuleAction::Approve)
            .unwrap();
        assert!(rules[..first_approve]
            .iter()
            .all(|r| r.action == RuleAction::Block));
    }
}
