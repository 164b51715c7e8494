use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use crate::{StreamError, StreamRequest};

/// Header carrying a per-request id for correlating client and server logs.
pub const REQUEST_ID_HEADER: &str = "x-tender-request-id";

static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Process-unique id: start-of-request seconds plus a monotonic sequence.
pub fn new_request_id() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let sequence = REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("tender-{seconds:x}-{sequence}")
}

/// Raw response body delivered in chunks of arbitrary size.
pub type ByteChunkStream = BoxStream<'static, Result<Vec<u8>, StreamError>>;

#[async_trait]
/// Capability that issues a stream request and yields its body bytes.
///
/// Dropping the returned stream must release the underlying connection, which
/// is how the controller aborts an in-flight read.
pub trait StreamTransport: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<ByteChunkStream, StreamError>;
}

#[derive(Debug, Clone)]
/// Public struct `HttpStreamTransportConfig` used by the HTTP transport.
pub struct HttpStreamTransportConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for HttpStreamTransportConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000/api".to_string(),
            api_key: None,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
/// `StreamTransport` that POSTs the request as JSON and streams the response body.
pub struct HttpStreamTransport {
    client: reqwest::Client,
    config: HttpStreamTransportConfig,
}

impl HttpStreamTransport {
    pub fn new(config: HttpStreamTransportConfig) -> Result<Self, StreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

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
                    StreamError::InvalidRequest(format!("invalid API key header: {e}"))
                })?,
            );
        }

        // Only the connect phase is bounded; a total timeout would cut long streams.
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(std::time::Duration::from_millis(
                config.connect_timeout_ms.max(1),
            ))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpStreamTransportConfig {
        &self.config
    }

    fn route_url(&self, route: &str) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        let route = route.trim_start_matches('/');
        format!("{base}/{route}")
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ByteChunkStream, StreamError> {
        let url = self.route_url(&request.route);
        let request_id = new_request_id();
        tracing::debug!(
            route = %request.route,
            target_id = %request.target_id,
            request_id = %request_id,
            history_turns = request.history.len(),
            "opening event stream"
        );

        let response = self
            .client
            .post(&url)
            .header(REQUEST_ID_HEADER, request_id)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(StreamError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(StreamError::from))
            .boxed())
    }
}
