use super::{tools, NlpContext, NlpOutcome, NlpProvider};
use crate::config::OllamaConfig;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub(super) const PROVIDER_NAME: &str = "ollama";

const SYSTEM_PROMPT: &str = r#"You translate requests for a local developer orchestrator into commands.

Available tools:
- start_service: start a long-running dev process (parameters: name, command, port)
- stop_service: stop a running service (parameters: service_id)
- list_services: list running services
- detect_project: switch to a project directory (parameters: path)
- git_status: show git status of the current project

Convert the input into either a shell command or a tool call.

Respond with JSON only:
{
  "type": "shell" | "start_service" | "stop_service" | "list_services" | "detect_project" | "git_status" | "unknown",
  "command": "the shell command, or the tool name",
  "confidence": 0.0-1.0,
  "reasoning": "brief explanation",
  "parameters": {"key": "value"}
}

Examples:
Input: "list files in current directory"
Output: {"type": "shell", "command": "ls -la", "confidence": 0.95, "reasoning": "Basic file listing"}

Input: "start the frontend with npm run dev on 5173"
Output: {"type": "start_service", "command": "start_service", "confidence": 0.9, "reasoning": "Start a dev server", "parameters": {"name": "frontend", "command": "npm run dev", "port": 5173}}

Input: "what's the git status"
Output: {"type": "git_status", "command": "git_status", "confidence": 0.95, "reasoning": "Repository status"}"#;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    format: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// What the model is asked to answer with
#[derive(Debug, Deserialize)]
struct Intent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    command: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    parameters: Option<HashMap<String, serde_json::Value>>,
}

fn default_confidence() -> f32 {
    0.5
}

/// Local model served by Ollama
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "ollama base_url is empty".to_string(),
            ));
        }
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model,
            http_client: reqwest::Client::new(),
        })
    }

    fn unavailable(&self, reason: impl ToString) -> OrchestratorError {
        OrchestratorError::ProviderUnavailable {
            provider: PROVIDER_NAME.to_string(),
            reason: reason.to_string(),
        }
    }

    fn prompt(text: &str, ctx: &NlpContext) -> String {
        let mut prompt = String::from(SYSTEM_PROMPT);
        prompt.push_str(&format!("\n\nWorking directory: {}", ctx.cwd.display()));
        if let Some(project) = &ctx.project {
            prompt.push_str(&format!("\nProject: {}", project.name));
            if !project.project_type.is_empty() {
                prompt.push_str(&format!(" ({})", project.project_type.join(", ")));
            }
        }
        prompt.push_str(&format!("\n\nInput: {}\nOutput:", text));
        prompt
    }
}

fn outcome_from_intent(intent: Intent) -> Option<NlpOutcome> {
    let source = PROVIDER_NAME.to_string();
    let args = intent.parameters.unwrap_or_default();
    let tool = |name: &str| NlpOutcome::Tool {
        name: name.to_string(),
        args: args.clone(),
        confidence: intent.confidence,
        source: source.clone(),
    };

    match intent.kind.as_str() {
        "shell" if !intent.command.trim().is_empty() => Some(NlpOutcome::Command {
            command: intent.command.trim().to_string(),
            confidence: intent.confidence,
            source: source.clone(),
            explanation: (!intent.reasoning.is_empty()).then(|| intent.reasoning.clone()),
        }),
        "git_status" => Some(NlpOutcome::Command {
            command: "git status".to_string(),
            confidence: intent.confidence,
            source: source.clone(),
            explanation: (!intent.reasoning.is_empty()).then(|| intent.reasoning.clone()),
        }),
        "start_service" => Some(tool(tools::START_SERVICE)),
        "stop_service" => Some(tool(tools::STOP_SERVICE)),
        "list_services" => Some(tool(tools::LIST_SERVICES)),
        "detect_project" => Some(tool(tools::SET_PROJECT)),
        _ => None,
    }
}

#[async_trait]
impl NlpProvider for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn translate(&self, text: &str, ctx: &NlpContext) -> Result<Option<NlpOutcome>> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: Self::prompt(text, ctx),
            stream: false,
            format: "json",
        };

        let response = self
            .http_client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(format!("status {}", status)));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| self.unavailable(e))?;
        match serde_json::from_str::<Intent>(&body.response) {
            Ok(intent) => Ok(outcome_from_intent(intent)),
            Err(err) => {
                tracing::debug!(%err, "unparseable model output, ignoring");
                Ok(None)
            }
        }
    }

    async fn health_check(&self) -> bool {
        match self
            .http_client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
