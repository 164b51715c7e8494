//! REST client for the durable session store.
//!
//! Reads and deletes are idempotent and retried on transient failures under
//! a [`RetryPolicy`]; appends are sent exactly once.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tender_stream::{new_request_id, Citation, MessageRole, REQUEST_ID_HEADER};
use thiserror::Error;

use crate::ConversationMessage;

#[derive(Debug, Error)]
/// Enumerates supported `SessionError` values.
pub enum SessionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("session store returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),
    #[error("invalid session store configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Message shape exchanged with the session store.
pub struct PersistedMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

impl From<&ConversationMessage> for PersistedMessage {
    fn from(message: &ConversationMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            timestamp: message.timestamp,
            citations: message.citations.clone(),
            confidence: message.confidence,
            interrupted: message.interrupted,
        }
    }
}

impl PersistedMessage {
    /// Converts into a settled history entry; ids are assigned on hydrate.
    pub fn into_conversation_message(self) -> ConversationMessage {
        ConversationMessage {
            id: 0,
            role: self.role,
            content: self.content,
            timestamp: self.timestamp,
            citations: self.citations,
            confidence: self.confidence,
            is_streaming: false,
            interrupted: self.interrupted,
        }
    }
}

#[async_trait]
/// Trait contract for `SessionPersistence` behavior.
pub trait SessionPersistence: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, SessionError>;
    async fn create_session(&self, title: &str) -> Result<SessionSummary, SessionError>;
    async fn delete_session(&self, session_id: &str) -> Result<(), SessionError>;
    async fn list_messages(&self, session_id: &str)
        -> Result<Vec<PersistedMessage>, SessionError>;
    async fn append_message(
        &self,
        session_id: &str,
        message: &PersistedMessage,
    ) -> Result<(), SessionError>;
}

/// Backoff schedule for idempotent session store calls.
///
/// Delays double from `initial_delay` per attempt and never exceed
/// `max_delay`, even when the store asks for a longer `retry-after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Statuses worth repeating a read or delete for. A conflict or a
    /// not-implemented route will not change on its own.
    pub fn is_transient_status(status: StatusCode) -> bool {
        match status.as_u16() {
            408 | 425 | 429 => true,
            501 => false,
            _ => status.is_server_error(),
        }
    }

    pub fn is_transient_error(error: &reqwest::Error) -> bool {
        error.is_connect() || error.is_timeout()
    }

    /// Delay before retry number `attempt` (zero based), or `None` once the
    /// budget is spent.
    pub fn delay_before_retry(&self, attempt: usize, hint: Option<Duration>) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = 1_u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        let backoff = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(hint.map_or(backoff, |hint| hint.max(backoff)).min(self.max_delay))
    }
}

/// Reads a `retry-after` header given as delta seconds or an HTTP date.
fn retry_after_hint(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone)]
pub struct HttpSessionPersistenceConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
}

impl Default for HttpSessionPersistenceConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000/api".to_string(),
            api_key: None,
            request_timeout_ms: 30_000,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSessionPersistence {
    client: reqwest::Client,
    config: HttpSessionPersistenceConfig,
}

impl HttpSessionPersistence {
    pub fn new(config: HttpSessionPersistenceConfig) -> Result<Self, SessionError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        {
            let bearer = format!("Bearer {api_key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer).map_err(|e| {
                    SessionError::InvalidConfig(format!("invalid API key header: {e}"))
                })?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpSessionPersistenceConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn send_idempotent(
        &self,
        method: Method,
        url: &str,
    ) -> Result<reqwest::Response, SessionError> {
        let policy = RetryPolicy::with_max_retries(self.config.max_retries);
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .request(method.clone(), url)
                .header(REQUEST_ID_HEADER, new_request_id())
                .send()
                .await;

            let delay = match &result {
                Ok(response) if response.status().is_success() => None,
                Ok(response) if RetryPolicy::is_transient_status(response.status()) => policy
                    .delay_before_retry(
                        attempt,
                        retry_after_hint(response.headers(), Utc::now()),
                    ),
                Err(error) if RetryPolicy::is_transient_error(error) => {
                    policy.delay_before_retry(attempt, None)
                }
                _ => None,
            };

            let Some(delay) = delay else {
                let response = result?;
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                return Err(status_error(status, response).await);
            };

            tracing::debug!(
                %method,
                url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying session store request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, SessionError> {
        let response = self
            .client
            .post(url)
            .header(REQUEST_ID_HEADER, new_request_id())
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(status_error(status, response).await)
        }
    }
}

#[async_trait]
impl SessionPersistence for HttpSessionPersistence {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let response = self.send_idempotent(Method::GET, &self.url("sessions")).await?;
        decode_json(response).await
    }

    async fn create_session(&self, title: &str) -> Result<SessionSummary, SessionError> {
        let response = self
            .post_json(&self.url("sessions"), &json!({ "title": title }))
            .await?;
        decode_json(response).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        validate_session_id(session_id)?;
        self.send_idempotent(Method::DELETE, &self.url(&format!("sessions/{session_id}")))
            .await?;
        tracing::debug!(session_id, "session deleted");
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<PersistedMessage>, SessionError> {
        validate_session_id(session_id)?;
        let response = self
            .send_idempotent(
                Method::GET,
                &self.url(&format!("sessions/{session_id}/messages")),
            )
            .await?;
        decode_json(response).await
    }

    async fn append_message(
        &self,
        session_id: &str,
        message: &PersistedMessage,
    ) -> Result<(), SessionError> {
        validate_session_id(session_id)?;
        let body = serde_json::to_value(message)?;
        self.post_json(&self.url(&format!("sessions/{session_id}/messages")), &body)
            .await?;
        Ok(())
    }
}

fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() || trimmed != session_id || session_id.contains('/') {
        return Err(SessionError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

async fn status_error(status: StatusCode, response: reqwest::Response) -> SessionError {
    let body = response.text().await.unwrap_or_default();
    SessionError::HttpStatus {
        status: status.as_u16(),
        body,
    }
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SessionError> {
    let raw = response.text().await?;
    Ok(serde_json::from_str(&raw)?)
}
