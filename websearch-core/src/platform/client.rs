//! HTTP client for the remote task platform API
//!
//! All requests authenticate with the server-held secret as a bearer token,
//! except [`fetch_with_token`](TaskPlatform::fetch_with_token), which uses a
//! scoped run token instead.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    validate_run_id, AccessToken, RemoteRunStatus, RunState, SearchInput, TaskPlatform,
    TriggerHandle,
};
use crate::config::PlatformConfig;
use crate::error::{Error, Result};

/// Response from POST /api/v1/tasks/{task_id}/trigger
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    id: String,
    #[serde(default)]
    public_access_token: Option<String>,
}

/// Response from GET /api/v3/runs/{run_id}
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    id: String,
    status: String,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
    /// Either a plain string or `{ "message": ... }`
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

impl RunResponse {
    fn into_status(self) -> RemoteRunStatus {
        let error = match self.error {
            Some(Value::String(message)) => Some(message),
            Some(Value::Object(obj)) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };

        RemoteRunStatus {
            state: RunState::parse(&self.status),
            run_id: self.id,
            metadata: self.metadata.filter(|m| !m.is_null()),
            output: self.output.filter(|o| !o.is_null()),
            error,
            created_at: parse_time(self.created_at.as_deref()),
            updated_at: parse_time(self.updated_at.as_deref()),
        }
    }
}

/// Response from POST /api/v1/auth/jwt
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Request body for POST /api/v1/tasks/{task_id}/trigger
#[derive(Serialize)]
struct TriggerRequest<'a> {
    payload: &'a SearchInput,
}

/// Request body for POST /api/v1/auth/jwt
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
    claims: TokenClaims,
    expiration_time: String,
}

#[derive(Serialize)]
struct TokenClaims {
    scopes: Vec<String>,
}

/// HTTP client for the task platform
pub struct PlatformClient {
    config: PlatformConfig,
    http_client: reqwest::Client,
    base_url: String,
}

impl PlatformClient {
    /// Create a client from configuration.
    ///
    /// Fails with [`Error::Config`] when the platform secret is missing, so
    /// no remote call is ever attempted without it.
    pub fn new(config: PlatformConfig) -> Result<Self> {
        let secret = config.require_secret()?;

        let base_url = config.api_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::Config("platform.api_url is required".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", secret))
                .map_err(|e| Error::Config(format!("invalid secret key: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
            base_url,
        })
    }

    fn run_url(&self, run_id: &str) -> String {
        format!(
            "{}/api/v3/runs/{}",
            self.base_url,
            urlencoding::encode(run_id)
        )
    }

    fn token_expiry(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(self.config.token_ttl_hours as i64)
    }

    async fn get_run(&self, run_id: &str, token: Option<&str>) -> Result<RemoteRunStatus> {
        validate_run_id(run_id)?;

        let mut request = self.http_client.get(self.run_url(run_id));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(request_error)?;

        let run: RunResponse = read_json(response, run_id).await?;
        let status = run.into_status();
        tracing::debug!(run_id = %run_id, state = %status.state, "Fetched run status");
        Ok(status)
    }
}

#[async_trait]
impl TaskPlatform for PlatformClient {
    async fn trigger(&self, input: &SearchInput) -> Result<TriggerHandle> {
        if input.query.trim().is_empty() {
            return Err(Error::Validation("Query is required".to_string()));
        }

        let url = format!(
            "{}/api/v1/tasks/{}/trigger",
            self.base_url,
            urlencoding::encode(&self.config.task_id)
        );

        let response = self
            .http_client
            .post(&url)
            .json(&TriggerRequest { payload: input })
            .send()
            .await
            .map_err(request_error)?;

        let triggered: TriggerResponse = read_json(response, &self.config.task_id).await?;
        tracing::info!(run_id = %triggered.id, task = %self.config.task_id, "Triggered run");

        let access_token = match triggered.public_access_token {
            Some(token) if !token.is_empty() => AccessToken {
                token,
                expires_at: self.token_expiry(),
            },
            _ => self.issue_access_token(&triggered.id).await?,
        };

        Ok(TriggerHandle {
            run_id: triggered.id,
            access_token,
        })
    }

    async fn fetch_status(&self, run_id: &str) -> Result<RemoteRunStatus> {
        self.get_run(run_id, None).await
    }

    async fn fetch_with_token(&self, run_id: &str, token: &str) -> Result<RemoteRunStatus> {
        self.get_run(run_id, Some(token)).await
    }

    async fn issue_access_token(&self, run_id: &str) -> Result<AccessToken> {
        validate_run_id(run_id)?;

        let url = format!("{}/api/v1/auth/jwt", self.base_url);
        let request = TokenRequest {
            claims: TokenClaims {
                scopes: vec![format!("read:runs:{}", run_id)],
            },
            expiration_time: format!("{}h", self.config.token_ttl_hours),
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;

        let minted: TokenResponse = read_json(response, run_id).await?;
        tracing::debug!(run_id = %run_id, "Issued scoped access token");
        Ok(AccessToken {
            token: minted.token,
            expires_at: self.token_expiry(),
        })
    }

    async fn cancel(&self, run_id: &str) -> Result<bool> {
        validate_run_id(run_id)?;

        let url = format!(
            "{}/api/v2/runs/{}/cancel",
            self.base_url,
            urlencoding::encode(run_id)
        );

        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(run_id = %run_id, "Cancellation accepted");
            Ok(true)
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(status_error(status, run_id, &body))
        }
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response, subject: &str) -> Result<T> {
    let status = response.status();

    if status.is_success() {
        response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("failed to parse response: {}", e)))
    } else {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(status_error(status, subject, &body))
    }
}

/// Map a non-success HTTP status onto the error taxonomy
fn status_error(status: StatusCode, subject: &str, body: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(subject.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Unauthorized(format!("API error ({}): {}", status, body))
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            Error::InvalidRequest(format!("API error ({}): {}", status, body))
        }
        _ => Error::Transport(format!("API error ({}): {}", status, body)),
    }
}

fn request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Transport(format!("request timed out: {}", e))
    } else {
        Error::Transport(format!("HTTP request failed: {}", e))
    }
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchDefaults;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> PlatformConfig {
        PlatformConfig {
            api_url: server.uri(),
            secret_key: Some("tr_dev_secret".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_client_requires_secret() {
        let config = PlatformConfig {
            secret_key: Some("   ".to_string()),
            ..Default::default()
        };
        // A blank configured secret does not fall back to the environment
        assert!(matches!(PlatformClient::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "run_1", ""),
            Error::NotFound(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "run_1", ""),
            Error::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "run_1", ""),
            Error::InvalidRequest(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "run_1", ""),
            Error::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_status_parses_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/runs/run_1"))
            .and(header("authorization", "Bearer tr_dev_secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "run_1",
                "status": "FAILED",
                "error": {"message": "agent crashed", "name": "Error"},
                "metadata": {"progress": 40},
                "createdAt": "2026-01-02T03:04:05.000Z",
                "updatedAt": "not a date"
            })))
            .mount(&server)
            .await;

        let client = PlatformClient::new(config_for(&server)).unwrap();
        let status = client.fetch_status("run_1").await.unwrap();
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.error.as_deref(), Some("agent crashed"));
        assert_eq!(status.metadata, Some(json!({"progress": 40})));
        assert!(status.created_at.is_some());
        assert!(status.updated_at.is_none());
    }

    #[tokio::test]
    async fn test_fetch_status_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/runs/run_gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Not found"})))
            .mount(&server)
            .await;

        let client = PlatformClient::new(config_for(&server)).unwrap();
        let err = client.fetch_status("run_gone").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_malformed_run_id_never_hits_network() {
        let server = MockServer::start().await;
        let client = PlatformClient::new(config_for(&server)).unwrap();
        let err = client.issue_access_token("bad id").await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_mints_token_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tasks/websearch-agent/trigger"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "run_new"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/jwt"))
            .and(body_json(json!({
                "claims": {"scopes": ["read:runs:run_new"]},
                "expirationTime": "24h"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "pk_scoped"})))
            .mount(&server)
            .await;

        let client = PlatformClient::new(config_for(&server)).unwrap();
        let input = SearchInput::new("rust async runtimes", &SearchDefaults::default(), None, None);
        let handle = client.trigger(&input).await.unwrap();
        assert_eq!(handle.run_id, "run_new");
        assert_eq!(handle.access_token.token, "pk_scoped");
        assert!(!handle.access_token.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn test_trigger_rejects_empty_query() {
        let server = MockServer::start().await;
        let client = PlatformClient::new(config_for(&server)).unwrap();
        let input = SearchInput::new("   ", &SearchDefaults::default(), None, None);
        let err = client.trigger(&input).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_fetch_with_token_uses_scoped_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/runs/run_1"))
            .and(header("authorization", "Bearer pk_scoped"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "run_1", "status": "EXECUTING"})),
            )
            .mount(&server)
            .await;

        let client = PlatformClient::new(config_for(&server)).unwrap();
        let status = client.fetch_with_token("run_1", "pk_scoped").await.unwrap();
        assert_eq!(status.state, RunState::Executing);
    }

    #[tokio::test]
    async fn test_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/runs/run_1/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "run_1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/runs/run_2/cancel"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = PlatformClient::new(config_for(&server)).unwrap();
        assert!(client.cancel("run_1").await.unwrap());
        assert!(matches!(
            client.cancel("run_2").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
