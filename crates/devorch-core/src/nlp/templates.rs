//! Regex command templates: the instant, offline first stage of the
//! pre-processor. Patterns are anchored and case-insensitive; `{0}`, `{1}`
//! in the target are replaced by the capture groups.

use super::{tools, NlpContext, NlpOutcome, NlpProvider};
use crate::error::{OrchestratorError, Result};
use crate::project;
use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;

pub(super) const PROVIDER_NAME: &str = "template";

#[derive(Debug, Clone)]
enum Target {
    Command(String),
    /// Tool name plus the argument name bound to each capture group
    Tool(&'static str, &'static [&'static str]),
    /// Whatever runs the tests of the current project
    ProjectTests,
}

#[derive(Debug, Clone)]
struct Template {
    pattern: String,
    regex: Regex,
    target: Target,
}

impl Template {
    fn compile(pattern: &str, target: Target) -> Result<Self> {
        let regex = RegexBuilder::new(&format!("^(?:{})$", pattern))
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                OrchestratorError::InvalidConfig(format!("invalid template '{}': {}", pattern, e))
            })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            target,
        })
    }

    fn apply(&self, text: &str, ctx: &NlpContext) -> Option<NlpOutcome> {
        let caps = self.regex.captures(text)?;
        let groups: Vec<&str> = caps
            .iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().trim()).unwrap_or(""))
            .collect();

        match &self.target {
            Target::Command(command) => {
                let mut command = command.clone();
                for (i, value) in groups.iter().enumerate() {
                    command = command.replace(&format!("{{{}}}", i), value);
                }
                Some(NlpOutcome::Command {
                    command,
                    confidence: 1.0,
                    source: PROVIDER_NAME.to_string(),
                    explanation: Some(format!("Matched template: {}", self.pattern)),
                })
            }
            Target::ProjectTests => {
                let command = project_test_command(ctx)?;
                Some(NlpOutcome::Command {
                    command,
                    confidence: 1.0,
                    source: PROVIDER_NAME.to_string(),
                    explanation: Some("Test command of the current project".to_string()),
                })
            }
            Target::Tool(name, params) => {
                let args: HashMap<String, serde_json::Value> = params
                    .iter()
                    .zip(groups.iter())
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                    .collect();
                Some(NlpOutcome::Tool {
                    name: name.to_string(),
                    args,
                    confidence: 1.0,
                    source: PROVIDER_NAME.to_string(),
                })
            }
        }
    }
}

/// The active project wins over the working directory. No project and no
/// working directory means no guess.
fn project_test_command(ctx: &NlpContext) -> Option<String> {
    match &ctx.project {
        Some(profile) => project::test_command(&profile.path, &profile.project_type),
        None if ctx.cwd.as_os_str().is_empty() => None,
        None => project::test_command(&ctx.cwd, &project::project_types(&ctx.cwd)),
    }
}

fn command(pattern: &str, target: &str) -> Template {
    Template::compile(pattern, Target::Command(target.to_string())).unwrap()
}

fn tool(pattern: &str, name: &'static str, params: &'static [&'static str]) -> Template {
    Template::compile(pattern, Target::Tool(name, params)).unwrap()
}

fn project_tests(pattern: &str) -> Template {
    Template::compile(pattern, Target::ProjectTests).unwrap()
}

lazy_static! {
    static ref BUILTIN: Vec<Template> = vec![
        // Orchestrator tools
        tool(r"start (?:the )?service (\S+) (?:with|using|running) (.+)", tools::START_SERVICE, &["name", "command"]),
        tool(r"stop (?:the )?service (\S+)", tools::STOP_SERVICE, &["service_id"]),
        tool(r"(?:list|show)(?: all)?(?: running)? services", tools::LIST_SERVICES, &[]),
        tool(r"(?:show )?status", tools::GET_STATUS, &[]),
        tool(r"(?:switch to|open|use) project (.+)", tools::SET_PROJECT, &["path"]),
        // Files
        command(r"(?:list|show)(?: all)? files", "ls -lah"),
        command(r"(?:list|show)(?: all)? (?:directories|folders)", "ls -d */"),
        command(r"find (?:a )?file(?:s)? named (.+)", "find . -name '{0}'"),
        command(r"find files containing (.+)", "grep -r '{0}' ."),
        command(r"count lines in (.+)", "wc -l {0}"),
        // System
        command(r"(?:show|list)(?: all)? processes", "ps aux"),
        command(r"show disk space", "df -h"),
        command(r"(?:show )?disk usage", "du -sh *"),
        command(r"show memory(?: usage)?", "free -h"),
        command(r"(?:show )?system info", "uname -a"),
        command(r"show path", "echo $PATH"),
        command(r"show (?:env|environment)", "env"),
        command(r"show date", "date"),
        // Git
        command(r"git status", "git status"),
        command(r"show changes", "git diff"),
        command(r"(?:git log|show git history)", "git log --oneline -10"),
        command(r"(?:show|list) branches", "git branch -a"),
        // Docker
        command(r"list containers", "docker ps -a"),
        command(r"list images", "docker images"),
        // Network
        command(r"show ports", "netstat -tuln"),
        command(r"(?:check port|what'?s on port) (\d+)", "lsof -i :{0}"),
        command(r"ping (\S+)", "ping -c 4 {0}"),
        // Projects
        project_tests(r"run (?:the )?tests?"),
        command(r"run npm tests", "npm test"),
        command(r"start dev server", "npm run dev"),
        command(r"build project", "npm run build"),
    ];

    static ref SHELL_WORDS: Vec<&'static str> = vec![
        "ls", "cd", "pwd", "echo", "cat", "grep", "find", "git", "npm", "npx", "yarn", "pnpm",
        "cargo", "python", "python3", "pip", "node", "make", "docker", "kubectl", "go", "rm",
        "mv", "cp", "mkdir", "touch", "chmod", "chown", "curl", "wget", "ssh", "tar", "sed",
        "awk", "head", "tail", "kill", "ps", "sudo", "env", "export", "which", "pytest",
    ];
}

/// Heuristic: the text is already a shell command and needs no translation
pub fn looks_like_shell(text: &str) -> bool {
    let text = text.trim();
    if text.starts_with("./") || text.starts_with('/') || text.starts_with("~/") {
        return true;
    }
    if ["|", "&&", ";", ">", "$("].iter().any(|op| text.contains(op)) {
        return true;
    }
    let first = text.split_whitespace().next().unwrap_or("");
    SHELL_WORDS.contains(&first)
}

/// Built-in plus learned templates
#[derive(Debug, Default)]
pub struct TemplateProvider {
    custom: RwLock<Vec<Template>>,
}

impl TemplateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom template. Custom templates are checked before the
    /// built-in ones.
    pub fn add_template(&self, pattern: &str, command: &str) -> Result<()> {
        let template = Template::compile(pattern, Target::Command(command.to_string()))?;
        tracing::info!("Added NLP template: {} -> {}", pattern, command);
        let mut custom = self.custom.write();
        custom.retain(|t| t.pattern != template.pattern);
        custom.insert(0, template);
        Ok(())
    }

    /// Remember that `input` should have produced `command`
    pub fn learn_from_correction(&self, input: &str, command: &str) -> Result<()> {
        let words: Vec<String> = input
            .split_whitespace()
            .map(|w| regex::escape(&w.to_lowercase()))
            .collect();
        let pattern = words.join(r"\s+");
        self.add_template(&pattern, command)
    }

    pub fn template_count(&self) -> usize {
        BUILTIN.len() + self.custom.read().len()
    }

    pub fn lookup(&self, text: &str, ctx: &NlpContext) -> Option<NlpOutcome> {
        let text = text.trim();
        if let Some(outcome) = self.custom.read().iter().find_map(|t| t.apply(text, ctx)) {
            return Some(outcome);
        }
        BUILTIN.iter().find_map(|t| t.apply(text, ctx))
    }
}

#[async_trait]
impl NlpProvider for TemplateProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn translate(&self, text: &str, ctx: &NlpContext) -> Result<Option<NlpOutcome>> {
        Ok(self.lookup(text, ctx))
    }
}
