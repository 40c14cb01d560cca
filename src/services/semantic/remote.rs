//! HTTP plumbing shared by the remote backends.
//!
//! Retry strategy:
//! - HTTP 429 and 5xx → retry with exponential backoff
//! - other 4xx → fail immediately
//! - network errors and per-attempt timeouts → retry
//! - backoff: 1s, 2s, 4s, ... capped at 32s

use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::api::middleware::AppError;

/// Body text the hosted index returns for requests over its size limit
const OVERSIZED_MARKER: &str = "exceeds the maximum supported size";

#[derive(Debug)]
pub enum RemoteError {
    /// Non-success status after retries (or immediately for client errors)
    Status(StatusCode, String),
    /// Connection, decode or deadline failure after retries
    Transport(String),
}

impl RemoteError {
    pub fn is_oversized(&self) -> bool {
        match self {
            RemoteError::Status(status, body) => {
                *status == StatusCode::PAYLOAD_TOO_LARGE || body.contains(OVERSIZED_MARKER)
            }
            RemoteError::Transport(msg) => msg.contains(OVERSIZED_MARKER),
        }
    }

    pub fn into_app_error(self, service: &str) -> AppError {
        match self {
            RemoteError::Status(status, body) => {
                AppError::BackendUnavailable(format!("{} error {}: {}", service, status, body))
            }
            RemoteError::Transport(msg) => {
                AppError::BackendUnavailable(format!("{} request failed: {}", service, msg))
            }
        }
    }
}

pub fn build_client(timeout: Duration) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

/// Send a JSON request with retry and backoff, returning the parsed body.
///
/// `make_request` is called once per attempt. An empty success body yields
/// `Value::Null`.
pub async fn send_json<F>(
    make_request: F,
    max_retries: u32,
    deadline: Duration,
) -> Result<Value, RemoteError>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff(attempt)).await;
        }

        let resp = match tokio::time::timeout(deadline, make_request().send()).await {
            Ok(resp) => resp,
            Err(_) => {
                last_err = Some(RemoteError::Transport(format!(
                    "request timed out after {:?}",
                    deadline
                )));
                continue;
            }
        };

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| RemoteError::Transport(e.to_string()))?;
                    if bytes.is_empty() {
                        return Ok(Value::Null);
                    }
                    return serde_json::from_slice(&bytes)
                        .map_err(|e| RemoteError::Transport(format!("invalid JSON response: {}", e)));
                }

                let body_text = response.text().await.unwrap_or_default();

                // Rate limited or server error: retry
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    tracing::warn!("Remote call returned {} (attempt {})", status, attempt + 1);
                    last_err = Some(RemoteError::Status(status, body_text));
                    continue;
                }

                return Err(RemoteError::Status(status, body_text));
            }
            Err(e) => {
                tracing::warn!("Remote call failed (attempt {}): {}", attempt + 1, e);
                last_err = Some(RemoteError::Transport(e.to_string()));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| RemoteError::Transport("failed after retries".to_string())))
}
