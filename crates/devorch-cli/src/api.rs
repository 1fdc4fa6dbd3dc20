//! HTTP calls against a running gateway

use anyhow::{anyhow, Context, Result};
use devorch_core::{
    CommandRecord, SavedCommand, Service, ServiceRequest, StateSnapshot, Submission,
};
use devorch_gateway::RunCommand;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// `gateway` is `host:port`, optionally with an `http://` prefix
    pub fn new(gateway: &str) -> Self {
        let gateway = gateway.trim_end_matches('/');
        let base = if gateway.starts_with("http://") || gateway.starts_with("https://") {
            gateway.to_string()
        } else {
            format!("http://{}", gateway)
        };
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn ws_url(&self) -> String {
        let rest = self
            .base
            .strip_prefix("https://")
            .map(|r| format!("wss://{}", r))
            .or_else(|| self.base.strip_prefix("http://").map(|r| format!("ws://{}", r)))
            .unwrap_or_else(|| self.base.clone());
        format!("{}/ws", rest)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("unreadable response ({})", status))?;
        if !status.is_success() {
            if let Some(code) = body.get("error").and_then(Value::as_str) {
                let message = body.get("message").and_then(Value::as_str).unwrap_or(code);
                return Err(anyhow!("{} ({})", message, code));
            }
        }
        serde_json::from_value(body).context("unexpected response shape")
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("gateway unreachable at {}", self.base))?;
        Self::decode(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let mut request = self.http.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("gateway unreachable at {}", self.base))?;
        Self::decode(response).await
    }

    async fn delete(&self, path: &str) -> Result<Option<Value>> {
        let response = self
            .http
            .delete(self.url(path))
            .send()
            .await
            .with_context(|| format!("gateway unreachable at {}", self.base))?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    pub async fn run(&self, run: &RunCommand) -> Result<Submission> {
        self.post("/api/commands", Some(run)).await
    }

    pub async fn command(&self, id: &str) -> Result<CommandRecord> {
        self.get(&format!("/api/commands/{}", id)).await
    }

    pub async fn cancel(&self, id: &str) -> Result<Value> {
        self.post::<(), _>(&format!("/api/commands/{}/cancel", id), None)
            .await
    }

    pub async fn approve(&self, id: &str) -> Result<Value> {
        self.post::<(), _>(&format!("/api/approvals/{}/approve", id), None)
            .await
    }

    pub async fn reject(&self, id: &str) -> Result<Value> {
        self.post::<(), _>(&format!("/api/approvals/{}/reject", id), None)
            .await
    }

    pub async fn services(&self) -> Result<Vec<Service>> {
        self.get("/api/services").await
    }

    pub async fn start_service(&self, request: &ServiceRequest) -> Result<Service> {
        self.post("/api/services", Some(request)).await
    }

    pub async fn stop_service(&self, id: &str) -> Result<Service> {
        let body = self
            .delete(&format!("/api/services/{}", id))
            .await?
            .ok_or_else(|| anyhow!("empty response"))?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn state(&self) -> Result<StateSnapshot> {
        self.get("/api/state").await
    }

    pub async fn saved(&self) -> Result<Vec<SavedCommand>> {
        self.get("/api/saved").await
    }

    pub async fn save(&self, body: &Value) -> Result<SavedCommand> {
        self.post("/api/saved", Some(body)).await
    }

    pub async fn delete_saved(&self, id: &str) -> Result<()> {
        self.delete(&format!("/api/saved/{}", id)).await.map(|_| ())
    }

    pub async fn run_saved(&self, id: &str) -> Result<Submission> {
        self.post::<(), _>(&format!("/api/saved/{}/run", id), None)
            .await
    }
}
