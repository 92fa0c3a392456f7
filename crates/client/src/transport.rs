//! Authenticated, retrying HTTP transport.
//!
//! [`TransportClient`] knows nothing about generation jobs. It attaches the
//! bearer credential, classifies failures into [`ErrorKind`]s, retries the
//! transient ones according to its [`RetryPolicy`], and normalises every
//! failure into a [`ClientError`]. The actual wire I/O sits behind the
//! [`HttpBackend`] trait so tests can script responses; [`ReqwestBackend`]
//! is the production implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::{ClientConfig, ConfigError};
use crate::credentials::{self, CredentialStore, FileCredentialStore};
use crate::error::{ClientError, ErrorKind};
use crate::retry::RetryPolicy;

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Broadcast channel capacity for session events.
const SESSION_CHANNEL_CAPACITY: usize = 16;

/// Cap on how much of a failed stream response is read for the error body.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// A fully-resolved outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Whole-request timeout; `None` for open-ended streams.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub request_id: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Chunks of a streaming response body.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ClientError>>;

/// A response whose body is consumed incrementally.
pub struct StreamingResponse {
    pub status: u16,
    pub request_id: Option<String>,
    pub body: ByteStream,
}

/// Performs the raw HTTP exchange. Implementations report only
/// [`ErrorKind::Network`] / [`ErrorKind::Timeout`] failures; status
/// classification happens in [`TransportClient`].
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ClientError>;

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamingResponse, ClientError>;
}

/// [`HttpBackend`] backed by a shared [`reqwest::Client`].
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("veo-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Reuse an existing client (shared connection pool).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::timeout(e.to_string())
    } else {
        ClientError::network(e.to_string())
    }
}

fn response_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        let response = self.build(request).send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let request_id = response_request_id(response.headers());
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();
        Ok(HttpResponse {
            status,
            request_id,
            body,
        })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamingResponse, ClientError> {
        let response = self.build(request).send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let request_id = response_request_id(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(map_reqwest_error))
            .boxed();
        Ok(StreamingResponse {
            status,
            request_id,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Transport client
// ---------------------------------------------------------------------------

/// Per-call switches.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Do not attach the bearer credential.
    pub skip_auth: bool,
    /// Never retry, whatever the failure class.
    pub skip_retry: bool,
    /// Override the client's default request timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn unauthenticated() -> Self {
        Self {
            skip_auth: true,
            ..Default::default()
        }
    }

    pub fn skip_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Authentication state changes observed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new credential was stored.
    Established,
    /// The remote rejected the credential (401); it has been cleared and
    /// the user must re-authenticate.
    Invalidated,
    /// The credential was removed locally.
    SignedOut,
}

/// Outbound call layer with authentication and retry.
pub struct TransportClient {
    backend: Arc<dyn HttpBackend>,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
    retry: RetryPolicy,
    request_timeout: Duration,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl TransportClient {
    pub fn new(
        backend: Arc<dyn HttpBackend>,
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let (session_tx, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        Self {
            backend,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            session_tx,
        }
    }

    /// Production wiring: reqwest backend and the file credential slot.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        let backend = Arc::new(ReqwestBackend::new()?);
        let credentials = Arc::new(FileCredentialStore::new(&config.credential_dir));
        Ok(Self::new(backend, config.base_url.clone(), credentials)
            .with_request_timeout(config.request_timeout))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Subscribe to [`SessionEvent`]s (e.g. to redirect to login).
    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    /// Whether a non-expired credential is currently stored.
    pub fn has_valid_credential(&self) -> bool {
        self.credentials
            .load()
            .is_some_and(|token| credentials::is_usable(&token, chrono::Utc::now()))
    }

    pub fn store_credential(&self, token: &str) -> Result<(), ClientError> {
        self.credentials.save(token).map_err(|e| {
            ClientError::new(ErrorKind::ClientError, format!("Failed to store credential: {e}"))
        })?;
        let _ = self.session_tx.send(SessionEvent::Established);
        Ok(())
    }

    pub fn clear_credential(&self) {
        self.drop_credential();
        let _ = self.session_tx.send(SessionEvent::SignedOut);
    }

    /// Send a request and decode a JSON response body.
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<T, ClientError> {
        let response = self.execute(method, path, body, options).await?;
        let request_id = response.request_id.clone();
        serde_json::from_slice(&response.body).map_err(|e| {
            ClientError::decode(format!("Unexpected response body from {path}: {e}"))
                .with_request_id(request_id)
        })
    }

    /// Serialize `body` and send it, decoding a JSON response.
    pub async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        options: &RequestOptions,
    ) -> Result<T, ClientError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ClientError::decode(format!("Failed to encode request body: {e}")))?;
        self.send(method, path, Some(value), options).await
    }

    /// Send a request and return the raw response body.
    pub async fn send_bytes(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.execute(method, path, body, options).await?.body)
    }

    /// Open a streaming `GET`. Never retried: the caller owns fallback.
    pub async fn open_event_stream(
        &self,
        path: &str,
        options: &RequestOptions,
    ) -> Result<ByteStream, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut request = self.build_request(Method::GET, path, None, options, &request_id);
        request.timeout = None;
        request
            .headers
            .push(("accept".to_string(), "text/event-stream".to_string()));

        // Only the wait for response headers is bounded; the body may stay
        // open indefinitely.
        let header_timeout = options.timeout.unwrap_or(self.request_timeout);
        let response = tokio::time::timeout(header_timeout, self.backend.open_stream(request))
            .await
            .unwrap_or_else(|_| {
                Err(ClientError::timeout(format!(
                    "No response to {path} within {}s",
                    header_timeout.as_secs()
                )))
            })
            .map_err(|e| e.with_request_id(Some(request_id.clone())))?;

        if (200..300).contains(&response.status) {
            return Ok(response.body);
        }

        let body = read_error_body(response.body).await;
        let err = ClientError::from_response(
            response.status,
            &body,
            response.request_id.or(Some(request_id)),
        );
        self.on_failure(&err, options);
        Err(err)
    }

    // ---- private helpers ----

    /// Core request loop: one logical request, up to `max_retries` retries.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<HttpResponse, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut attempt = 0u32;

        loop {
            let request = self.build_request(method.clone(), path, body.clone(), options, &request_id);

            let err = match self.backend.execute(request).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => ClientError::from_response(
                    response.status,
                    &response.body,
                    response.request_id.or_else(|| Some(request_id.clone())),
                ),
                Err(e) => e.with_request_id(Some(request_id.clone())),
            };

            self.on_failure(&err, options);

            if options.skip_retry || !err.is_retryable() || !self.retry.allows(attempt) {
                return Err(err);
            }

            let delay = self.retry.next_delay(attempt, err.kind);
            tracing::warn!(
                method = %method,
                path,
                attempt = attempt + 1,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind,
                status = ?err.status,
                "Request failed, retrying",
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: &RequestOptions,
        request_id: &str,
    ) -> HttpRequest {
        let mut headers = vec![(REQUEST_ID_HEADER.to_string(), request_id.to_string())];
        if let Some(token) = self.bearer(options) {
            headers.push(("authorization".to_string(), format!("Bearer {token}")));
        }
        HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            headers,
            body,
            timeout: Some(options.timeout.unwrap_or(self.request_timeout)),
        }
    }

    /// The stored credential, if attachable.
    fn bearer(&self, options: &RequestOptions) -> Option<String> {
        if options.skip_auth {
            return None;
        }
        let token = self.credentials.load()?;
        if credentials::is_usable(&token, chrono::Utc::now()) {
            Some(token)
        } else {
            tracing::debug!("Stored credential is expired or unreadable, sending without it");
            None
        }
    }

    fn on_failure(&self, err: &ClientError, options: &RequestOptions) {
        if err.kind == ErrorKind::AuthRejected && !options.skip_auth {
            tracing::warn!(
                request_id = ?err.request_id,
                "Credential rejected by the service, clearing session",
            );
            self.drop_credential();
            let _ = self.session_tx.send(SessionEvent::Invalidated);
        }
    }

    fn drop_credential(&self) {
        if let Err(e) = self.credentials.clear() {
            tracing::warn!(error = %e, "Failed to clear stored credential");
        }
    }
}

async fn read_error_body(mut body: ByteStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(Ok(chunk)) = body.next().await {
        out.extend_from_slice(&chunk);
        if out.len() >= MAX_ERROR_BODY_BYTES {
            break;
        }
    }
    out
}
