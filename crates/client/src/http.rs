//! `GameApi` over HTTP.
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` so calls never
//! block the runtime. Status codes are read by hand (the agent does not turn
//! them into errors) so 4xx bodies can be classified.

use async_trait::async_trait;
use folkhart_engine::{ApiError, GameApi};
use folkhart_protocol::{
    routes, CompletionResult, ErrorBody, RunDescriptor, RunKind, StartRunRequest, VersionInfo,
};
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
}

/// Which family of endpoint answered, for error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Completion,
    Other,
}

#[derive(Clone)]
pub struct HttpApi {
    base_url: String,
    auth_token: Option<String>,
    agent: ureq::Agent,
}

impl HttpApi {
    pub fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request<T: DeserializeOwned + Send + 'static>(
        &self,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
        endpoint: Endpoint,
    ) -> Result<Option<T>, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let agent = self.agent.clone();
        let auth = self
            .auth_token
            .as_ref()
            .map(|token| format!("Bearer {token}"));

        tokio::task::spawn_blocking(move || {
            let response = match method {
                Method::Get => {
                    let mut req = agent.get(&url);
                    if let Some(auth) = &auth {
                        req = req.header("Authorization", auth);
                    }
                    req.call()
                }
                Method::Post => {
                    let mut req = agent.post(&url);
                    if let Some(auth) = &auth {
                        req = req.header("Authorization", auth);
                    }
                    match &body {
                        Some(body) => req.send_json(body),
                        None => req.send_empty(),
                    }
                }
            }
            .map_err(|e| ApiError::Transport(format!("{url}: {e}")))?;

            let status = response.status().as_u16();
            let text = response
                .into_body()
                .read_to_string()
                .map_err(|e| ApiError::Transport(format!("{url}: reading body: {e}")))?;

            if !(200..300).contains(&status) {
                return Err(classify(status, &text, endpoint));
            }
            decode_optional(&text)
        })
        .await
        .map_err(|e| ApiError::Transport(format!("task join error: {e}")))?
    }

    async fn required<T: DeserializeOwned + Send + 'static>(
        &self,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
        endpoint: Endpoint,
    ) -> Result<T, ApiError> {
        self.request(method, path.clone(), body, endpoint)
            .await?
            .ok_or_else(|| ApiError::Decode(format!("{path}: empty response")))
    }
}

/// Empty bodies and `null` both mean "nothing".
fn decode_optional<T: DeserializeOwned>(text: &str) -> Result<Option<T>, ApiError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| ApiError::Decode(e.to_string()))
}

/// Maps a non-2xx response to an [`ApiError`]. On the completion endpoints any
/// 4xx that is not about auth, timeouts, rate limiting or currency means the
/// run is no longer valid server-side.
pub fn classify(status: u16, body: &str, endpoint: Endpoint) -> ApiError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| body.trim().to_string());

    if status >= 500 {
        return ApiError::Server { status, message };
    }
    let lower = message.to_lowercase();
    if lower.contains("insufficient") || lower.contains("not enough") {
        return ApiError::InsufficientFunds(message);
    }
    match (endpoint, status) {
        (Endpoint::Completion, 401 | 403 | 408 | 429) | (Endpoint::Other, _) => {
            ApiError::Rejected { status, message }
        }
        (Endpoint::Completion, _) => ApiError::RunGone(message),
    }
}

#[async_trait]
impl GameApi for HttpApi {
    async fn start_run(
        &self,
        kind: RunKind,
        request: &StartRunRequest,
    ) -> Result<RunDescriptor, ApiError> {
        let body =
            serde_json::to_value(request).map_err(|e| ApiError::Decode(e.to_string()))?;
        self.required(Method::Post, routes::start(kind), Some(body), Endpoint::Other)
            .await
    }

    async fn active_run(&self, kind: RunKind) -> Result<Option<RunDescriptor>, ApiError> {
        self.request(Method::Get, routes::active(kind), None, Endpoint::Other)
            .await
    }

    async fn complete_run(
        &self,
        kind: RunKind,
        run_id: &str,
    ) -> Result<CompletionResult, ApiError> {
        self.required(
            Method::Post,
            routes::complete(kind, run_id),
            None,
            Endpoint::Completion,
        )
        .await
    }

    async fn fast_finish(
        &self,
        kind: RunKind,
        run_id: &str,
    ) -> Result<CompletionResult, ApiError> {
        self.required(
            Method::Post,
            routes::fast_finish(kind, run_id),
            None,
            Endpoint::Completion,
        )
        .await
    }

    async fn version(&self) -> Result<VersionInfo, ApiError> {
        Ok(self
            .request(Method::Get, routes::VERSION.to_string(), None, Endpoint::Other)
            .await?
            .unwrap_or_default())
    }
}
