//! NLP pre-processor
//!
//! Turns free text into a shell command or a tool call before the text
//! reaches the guardrails. Providers are tried in order:
//!
//! 1. [`TemplateProvider`], instant regex templates
//! 2. the selected provider (explicit selector, else the configured primary)
//! 3. the configured fallbacks
//!
//! Every provider call is bounded by a timeout. A failure is reported back
//! as [`OrchestratorError::ProviderUnavailable`] and the next provider is
//! tried; when nothing answers with enough confidence the text is used
//! literally. Translation never blocks a submission.

mod ollama;
mod templates;

pub use ollama::OllamaProvider;
pub use templates::{looks_like_shell, TemplateProvider};

use crate::config::NlpConfig;
use crate::error::{OrchestratorError, Result};
use crate::types::ProjectProfile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// What a provider knows about where the command will run
#[derive(Debug, Clone, Default)]
pub struct NlpContext {
    pub cwd: PathBuf,
    pub project: Option<ProjectProfile>,
}

/// Tool names understood by the orchestrator
pub mod tools {
    pub const START_SERVICE: &str = "start_service";
    pub const STOP_SERVICE: &str = "stop_service";
    pub const LIST_SERVICES: &str = "list_services";
    pub const GET_STATUS: &str = "get_status";
    pub const SET_PROJECT: &str = "set_project";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NlpOutcome {
    Command {
        command: String,
        confidence: f32,
        source: String,
        #[serde(default)]
        explanation: Option<String>,
    },
    Tool {
        name: String,
        #[serde(default)]
        args: HashMap<String, serde_json::Value>,
        confidence: f32,
        source: String,
    },
}

impl NlpOutcome {
    pub fn confidence(&self) -> f32 {
        match self {
            NlpOutcome::Command { confidence, .. } | NlpOutcome::Tool { confidence, .. } => {
                *confidence
            }
        }
    }

    pub fn source(&self) -> &str {
        match self {
            NlpOutcome::Command { source, .. } | NlpOutcome::Tool { source, .. } => source,
        }
    }
}

#[async_trait]
pub trait NlpProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// `Ok(None)` means "no opinion"; the next provider is tried
    async fn translate(&self, text: &str, ctx: &NlpContext) -> Result<Option<NlpOutcome>>;

    async fn health_check(&self) -> bool {
        true
    }
}

/// Result of one pre-processing pass
#[derive(Debug, Default)]
pub struct Translation {
    /// `None`: use the text literally
    pub outcome: Option<NlpOutcome>,
    /// Providers that failed along the way
    pub failures: Vec<OrchestratorError>,
}

#[derive(Debug)]
pub struct NlpPreprocessor {
    templates: Arc<TemplateProvider>,
    providers: Vec<Arc<dyn NlpProvider>>,
    primary: Option<String>,
    fallbacks: Vec<String>,
    timeout: Duration,
    min_confidence: f32,
}

impl NlpPreprocessor {
    pub fn new(config: &NlpConfig) -> Self {
        let mut preprocessor = Self {
            templates: Arc::new(TemplateProvider::new()),
            providers: Vec::new(),
            primary: config.primary.clone(),
            fallbacks: config.fallbacks.clone(),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            min_confidence: config.min_confidence,
        };
        if let Some(ollama) = &config.ollama {
            match OllamaProvider::new(ollama.clone()) {
                Ok(provider) => {
                    preprocessor = preprocessor.with_provider(Arc::new(provider));
                    if preprocessor.primary.is_none() {
                        preprocessor.primary = Some(ollama::PROVIDER_NAME.to_string());
                    }
                }
                Err(err) => tracing::warn!(%err, "Ollama provider disabled"),
            }
        }
        preprocessor
    }

    pub fn with_provider(mut self, provider: Arc<dyn NlpProvider>) -> Self {
        self.providers.retain(|p| p.name() != provider.name());
        self.providers.push(provider);
        self
    }

    pub fn with_primary(mut self, name: impl Into<String>) -> Self {
        self.primary = Some(name.into());
        self
    }

    pub fn with_fallbacks(mut self, names: Vec<String>) -> Self {
        self.fallbacks = names;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn templates(&self) -> &TemplateProvider {
        &self.templates
    }

    pub fn provider_names(&self) -> Vec<String> {
        std::iter::once(self.templates.name().to_string())
            .chain(self.providers.iter().map(|p| p.name().to_string()))
            .collect()
    }

    /// Health of every registered provider, templates included
    pub async fn health(&self) -> Vec<(String, bool)> {
        let mut report = vec![(self.templates.name().to_string(), true)];
        for provider in &self.providers {
            let healthy = tokio::time::timeout(self.timeout, provider.health_check())
                .await
                .unwrap_or(false);
            report.push((provider.name().to_string(), healthy));
        }
        report
    }

    fn provider(&self, name: &str) -> Option<Arc<dyn NlpProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    fn chain(&self, selector: Option<&str>) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        if let Some(name) = selector.or(self.primary.as_deref()) {
            order.push(name.to_string());
        }
        for name in &self.fallbacks {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    pub async fn translate(
        &self,
        text: &str,
        selector: Option<&str>,
        ctx: &NlpContext,
    ) -> Translation {
        let mut translation = Translation::default();
        let text = text.trim();
        if text.is_empty() {
            return translation;
        }

        if let Ok(Some(outcome)) = self.templates.translate(text, ctx).await {
            translation.outcome = Some(outcome);
            return translation;
        }
        if looks_like_shell(text) {
            return translation;
        }

        for name in self.chain(selector) {
            if name == self.templates.name() {
                continue;
            }
            let Some(provider) = self.provider(&name) else {
                translation.failures.push(OrchestratorError::ProviderUnavailable {
                    provider: name,
                    reason: "not configured".to_string(),
                });
                continue;
            };

            match tokio::time::timeout(self.timeout, provider.translate(text, ctx)).await {
                Ok(Ok(Some(outcome))) if outcome.confidence() >= self.min_confidence => {
                    translation.outcome = Some(outcome);
                    return translation;
                }
                Ok(Ok(Some(outcome))) => {
                    tracing::debug!(
                        provider = %name,
                        confidence = outcome.confidence(),
                        "translation below confidence threshold"
                    );
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    translation
                        .failures
                        .push(OrchestratorError::ProviderUnavailable {
                            provider: name,
                            reason: err.to_string(),
                        });
                }
                Err(_) => {
                    translation
                        .failures
                        .push(OrchestratorError::ProviderUnavailable {
                            provider: name,
                            reason: format!("timed out after {}ms", self.timeout.as_millis()),
                        });
                }
            }
        }
        translation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed {
        name: &'static str,
        command: &'static str,
        confidence: f32,
    }

    #[async_trait]
    impl NlpProvider for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn translate(&self, _text: &str, _ctx: &NlpContext) -> Result<Option<NlpOutcome>> {
            Ok(Some(NlpOutcome::Command {
                command: self.command.to_string(),
                confidence: self.confidence,
                source: self.name.to_string(),
                explanation: None,
            }))
        }
    }

    #[derive(Debug)]
    struct Slow;

    #[async_trait]
    impl NlpProvider for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn translate(&self, _text: &str, _ctx: &NlpContext) -> Result<Option<NlpOutcome>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
    }

    #[derive(Debug)]
    struct Broken;

    #[async_trait]
    impl NlpProvider for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn translate(&self, _text: &str, _ctx: &NlpContext) -> Result<Option<NlpOutcome>> {
            Err(OrchestratorError::InvalidRequest("model offline".to_string()))
        }
    }

    fn preprocessor() -> NlpPreprocessor {
        NlpPreprocessor::new(&NlpConfig::default()).with_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_templates_win_first() {
        let nlp = preprocessor()
            .with_provider(Arc::new(Fixed {
                name: "remote",
                command: "echo remote",
                confidence: 1.0,
            }))
            .with_primary("remote");

        let t = nlp.translate("check port 3000", None, &NlpContext::default()).await;
        match t.outcome {
            Some(NlpOutcome::Command { command, source, .. }) => {
                assert_eq!(command, "lsof -i :3000");
                assert_eq!(source, "template");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_and_error_fall_through_to_fallback() {
        let nlp = preprocessor()
            .with_provider(Arc::new(Slow))
            .with_provider(Arc::new(Broken))
            .with_provider(Arc::new(Fixed {
                name: "local",
                command: "du -sh .",
                confidence: 0.9,
            }))
            .with_primary("slow")
            .with_fallbacks(vec!["broken".to_string(), "local".to_string()]);

        let t = nlp
            .translate("how big is this folder", None, &NlpContext::default())
            .await;
        assert_eq!(t.outcome.unwrap().source(), "local");
        assert_eq!(t.failures.len(), 2);
        assert!(t
            .failures
            .iter()
            .all(|f| f.code() == "provider_unavailable"));
    }

    #[tokio::test]
    async fn test_low_confidence_means_literal() {
        let nlp = preprocessor()
            .with_provider(Arc::new(Fixed {
                name: "unsure",
                command: "rm -rf build",
                confidence: 0.2,
            }))
            .with_primary("unsure");

        let t = nlp
            .translate("tidy up the build output", None, &NlpContext::default())
            .await;
        assert!(t.outcome.is_none());
        assert!(t.failures.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_selector_and_unknown_provider() {
        let nlp = preprocessor().with_provider(Arc::new(Fixed {
            name: "remote",
            command: "echo picked",
            confidence: 1.0,
        }));

        let t = nlp
            .translate("do the thing", Some("remote"), &NlpContext::default())
            .await;
        assert_eq!(t.outcome.unwrap().source(), "remote");

        let t = nlp
            .translate("do the thing", Some("nonexistent"), &NlpContext::default())
            .await;
        assert!(t.outcome.is_none());
        assert_eq!(t.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_shell_input_passes_through() {
        let nlp = preprocessor();
        let t = nlp.translate("git status --short", None, &NlpContext::default()).await;
        assert!(t.outcome.is_none());
    }

    #[tokio::test]
    async fn test_health_report_includes_templates() {
        let nlp = preprocessor().with_provider(Arc::new(Slow));
        let health = nlp.health().await;
        assert_eq!(health[0], ("template".to_string(), true));
        assert_eq!(health.len(), 2);
    }
}
