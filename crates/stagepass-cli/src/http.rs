//! Reqwest-based transport against the Stagepass festival API
//!
//! The engine only requires idempotency-by-id on push and a monotonic
//! `since` cursor on pull; this client maps those onto the platform's
//! REST/JSON endpoints and translates HTTP status classes into the
//! engine's error taxonomy.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use stagepass_core::error::{Error, Result};
use stagepass_core::models::EntitySnapshot;
use stagepass_core::transport::{
    AuthProvider, AuthSession, EntityTransport, PullPage, PullRequest, PushOutcome, PushRequest,
};

#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            token: token.into(),
            client: reqwest::Client::builder()
                .build()
                .map_err(|e| Error::Transport(e.to_string()))?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    server_id: Option<String>,
    #[serde(default)]
    server_updated_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ConflictResponse {
    server: EntitySnapshot,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[async_trait]
impl EntityTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushOutcome> {
        let url = format!("{}/v1/sync/{}/push", self.base_url, request.entity_type);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let body: ConflictResponse = response
                .json()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            return Ok(PushOutcome::Conflict {
                server: body.server,
            });
        }
        if status.is_success() {
            let body: PushResponse = response
                .json()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            return Ok(PushOutcome::Applied {
                server_id: body.server_id,
                server_updated_at: body.server_updated_at,
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullPage> {
        let url = format!("{}/v1/sync/{}", self.base_url, request.entity_type);
        let mut query: Vec<(&str, String)> = vec![("limit", request.limit.to_string())];
        if let Some(since) = request.since {
            query.push(("since", since.to_string()));
        }
        if let Some(cursor) = &request.cursor {
            query.push(("cursor", cursor.clone()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<PullPage>()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Verifies the bearer token against the platform before a pass
#[derive(Clone)]
pub struct HttpAuthProvider {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpAuthProvider {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            token: token.into(),
            client: reqwest::Client::builder()
                .build()
                .map_err(|e| Error::Transport(e.to_string()))?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    subject: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn ensure_authenticated(&self) -> Result<AuthSession> {
        let url = format!("{}/v1/auth/verify", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(parse_api_error(status, &body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(AuthSession {
            subject: body.subject,
            expires_at: body.expires_at,
        })
    }
}

/// Map an HTTP status class onto the engine's error taxonomy
fn classify_status(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Error::Auth(message)
    } else if status.is_client_error() {
        Error::Validation(message)
    } else {
        Error::Transport(message)
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Config("API base URL must not be empty".into()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "API base URL must include http:// or https://".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.stagepass.live".to_string()).is_err());
        assert_eq!(
            normalize_base_url("https://api.stagepass.live/".to_string()).unwrap(),
            "https://api.stagepass.live"
        );
    }

    #[test]
    fn test_classify_status_maps_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            Error::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            Error::Validation(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            Error::Transport(_)
        ));
    }

    #[test]
    fn test_parse_api_error_prefers_message_field() {
        let body = r#"{"message": "ticket already scanned"}"#;
        let parsed = parse_api_error(StatusCode::UNPROCESSABLE_ENTITY, body);
        assert_eq!(parsed, "ticket already scanned (422)");
    }

    #[test]
    fn test_parse_api_error_falls_back_to_body() {
        let parsed = parse_api_error(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(parsed, "upstream down (502)");

        let empty = parse_api_error(StatusCode::BAD_GATEWAY, "");
        assert_eq!(empty, "HTTP 502");
    }
}
