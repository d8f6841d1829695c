//! HTTP cast API publisher
//!
//! Posts casts as JSON to `{api_url}/v2/farcaster/cast`, authenticating with
//! an API key header and the account's signer id in the body.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{ConfigError, PublishError, Result};
use crate::publisher::Publisher;
use crate::types::{Embed, PublishRequest};

const CAST_PATH: &str = "/v2/farcaster/cast";

pub struct HttpPublisher {
    http: Client,
    api_url: String,
    api_key: SecretString,
    request_timeout: Duration,
}

#[derive(Serialize)]
struct CastBody<'a> {
    signer_uuid: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "no_embeds")]
    embeds: &'a [Embed],
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<&'a str>,
    idem: &'a str,
}

fn no_embeds(embeds: &&[Embed]) -> bool {
    embeds.is_empty()
}

#[derive(Deserialize)]
struct CastResponse {
    #[serde(default)]
    success: bool,
    cast: Option<CastPayload>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct CastPayload {
    hash: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

impl HttpPublisher {
    pub fn new(api_url: &str, api_key: SecretString, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "publisher".to_string(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            request_timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.api_url, CAST_PATH)
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, request: &PublishRequest) -> std::result::Result<String, PublishError> {
        let body = CastBody {
            signer_uuid: request.signer_token.expose_secret(),
            text: &request.content,
            embeds: &request.embeds,
            channel_id: request.channel_id.as_deref(),
            parent: request.parent_hash.as_deref(),
            idem: &request.idempotency_key,
        };

        debug!(cast_id = %request.cast_id, embeds = request.embeds.len(), "Sending cast to network");

        let response = self
            .http
            .post(self.endpoint())
            .header("x-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Timeout(self.request_timeout.as_secs())
                } else {
                    PublishError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let text = response
            .text()
            .await
            .map_err(|e| PublishError::Network(format!("failed to read response ({}): {}", status, e)))?;

        if status.is_success() {
            parse_success(&text)
        } else {
            Err(classify_failure(status, retry_after.as_deref(), &text))
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Extract the cast hash from a 2xx response body.
fn parse_success(body: &str) -> std::result::Result<String, PublishError> {
    let parsed: CastResponse = serde_json::from_str(body)
        .map_err(|e| PublishError::Rejected(format!("unreadable response: {}", e)))?;

    if !parsed.success {
        return Err(PublishError::Rejected(
            parsed
                .message
                .unwrap_or_else(|| "network reported failure".to_string()),
        ));
    }

    match parsed.cast {
        Some(cast) if !cast.hash.is_empty() => Ok(cast.hash),
        _ => Err(PublishError::Rejected(
            "response missing cast hash".to_string(),
        )),
    }
}

/// Map a non-2xx response onto the publish error taxonomy.
fn classify_failure(status: StatusCode, retry_after: Option<&str>, body: &str) -> PublishError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| body.trim().to_string());
    let message = format!("{} ({})", message, status);

    match status {
        StatusCode::TOO_MANY_REQUESTS => match retry_after {
            Some(secs) => PublishError::RateLimited(format!("{}; retry after {}s", message, secs)),
            None => PublishError::RateLimited(message),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PublishError::Authentication(message),
        s if s.is_server_error() => PublishError::Network(message),
        _ => PublishError::Rejected(message),
    }
}
