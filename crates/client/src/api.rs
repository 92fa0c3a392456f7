//! Typed wrappers over the remote video-generation HTTP surface.
//!
//! | Call                    | Endpoint                         |
//! |-------------------------|----------------------------------|
//! | [`VideoApi::login`]     | `POST /auth/login`               |
//! | [`VideoApi::register`]  | `POST /auth/register`            |
//! | [`VideoApi::submit`]    | `POST /videos/generate`          |
//! | [`VideoApi::submit_batch`] | `POST /videos/generate/batch` |
//! | [`VideoApi::status`]    | `GET /videos/{id}/status`        |
//! | [`VideoApi::download`]  | `GET /videos/{id}/download`      |
//! | [`VideoApi::cancel`]    | `DELETE /videos/{id}/cancel`     |
//! | [`VideoApi::open_status_stream`] | `GET /events/{id}`      |
//!
//! The [`StatusSource`] and [`VideoService`] traits are the seams the
//! tracker and orchestrator depend on; [`VideoApi`] implements both.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use veo_core::generation::GenerationRequest;
use veo_core::job::{GenerationJob, SubmitResponse};

use crate::error::ClientError;
use crate::sse::SseDecoder;
use crate::transport::{RequestOptions, TransportClient};

/// Live status updates for one job.
pub type StatusStream = BoxStream<'static, Result<GenerationJob, ClientError>>;

/// Where the tracker gets job status from: a push stream, or one poll.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Open the push transport for `job_id`. Resolves once the connection
    /// is live; the stream ends or errors when the connection drops.
    async fn open_stream(&self, job_id: &str) -> Result<StatusStream, ClientError>;

    /// Fetch one status snapshot.
    async fn fetch_status(&self, job_id: &str) -> Result<GenerationJob, ClientError>;
}

/// Job submission and cancellation as seen by the orchestrator.
#[async_trait]
pub trait VideoService: Send + Sync {
    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitResponse, ClientError>;

    /// Whether [`submit_batch`](Self::submit_batch) is available.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Submit several requests in one call; responses are in request order.
    async fn submit_batch(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<Vec<SubmitResponse>, ClientError>;

    async fn cancel(&self, job_id: &str) -> Result<(), ClientError>;
}

// ---------------------------------------------------------------------------
// Auth payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
}

/// Credential issued by `/auth/login` and `/auth/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds, when the service states it.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
struct BatchSubmitRequest<'a> {
    requests: &'a [GenerationRequest],
}

#[derive(Debug, Deserialize)]
struct BatchSubmitResponse {
    generations: Vec<SubmitResponse>,
}

// ---------------------------------------------------------------------------
// VideoApi
// ---------------------------------------------------------------------------

/// Remote API client built on a shared [`TransportClient`].
pub struct VideoApi {
    transport: Arc<TransportClient>,
    transfer_timeout: Duration,
    batch_submit: bool,
}

impl VideoApi {
    pub fn new(transport: Arc<TransportClient>) -> Self {
        Self {
            transport,
            transfer_timeout: Duration::from_secs(300),
            batch_submit: false,
        }
    }

    /// Timeout applied to uploads and downloads.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Declare that the remote exposes the batch submission endpoint.
    pub fn with_batch_submit(mut self, enabled: bool) -> Self {
        self.batch_submit = enabled;
        self
    }

    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.transport
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ClientError> {
        self.authenticate("/auth/login", request).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ClientError> {
        self.authenticate("/auth/register", request).await
    }

    /// Forget the stored credential.
    pub fn logout(&self) {
        self.transport.clear_credential();
        tracing::info!("Signed out");
    }

    pub async fn status(&self, job_id: &str) -> Result<GenerationJob, ClientError> {
        self.transport
            .send(
                Method::GET,
                &format!("/videos/{job_id}/status"),
                None,
                &RequestOptions::default(),
            )
            .await
    }

    /// Download the finished video.
    pub async fn download(&self, job_id: &str) -> Result<Vec<u8>, ClientError> {
        self.transport
            .send_bytes(
                Method::GET,
                &format!("/videos/{job_id}/download"),
                None,
                &RequestOptions::default().with_timeout(self.transfer_timeout),
            )
            .await
    }

    /// Open the server-sent event stream and decode each message as a
    /// [`GenerationJob`]. Messages that fail to decode are skipped.
    pub async fn open_status_stream(&self, job_id: &str) -> Result<StatusStream, ClientError> {
        let bytes = self
            .transport
            .open_event_stream(&format!("/events/{job_id}"), &RequestOptions::default())
            .await?;

        let job_id = job_id.to_string();
        let stream = bytes
            .scan(SseDecoder::new(), move |decoder, chunk| {
                let items: Vec<Result<GenerationJob, ClientError>> = match chunk {
                    Ok(chunk) => decoder
                        .push(&chunk)
                        .into_iter()
                        .filter_map(|event| decode_status_event(&job_id, &event.data))
                        .map(Ok)
                        .collect(),
                    Err(e) => vec![Err(e)],
                };
                futures::future::ready(Some(futures::stream::iter(items)))
            })
            .flatten()
            .boxed();

        Ok(stream)
    }

    // ---- private helpers ----

    async fn authenticate<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<AuthResponse, ClientError> {
        let response: AuthResponse = self
            .transport
            .send_json(Method::POST, path, body, &RequestOptions::unauthenticated())
            .await?;
        self.transport.store_credential(&response.access_token)?;
        tracing::info!(path, expires_in = ?response.expires_in, "Authenticated");
        Ok(response)
    }
}

fn decode_status_event(job_id: &str, data: &str) -> Option<GenerationJob> {
    match serde_json::from_str::<GenerationJob>(data) {
        Ok(job) => Some(job),
        Err(e) => {
            tracing::debug!(job_id, error = %e, "Skipping undecodable stream message");
            None
        }
    }
}

#[async_trait]
impl StatusSource for VideoApi {
    async fn open_stream(&self, job_id: &str) -> Result<StatusStream, ClientError> {
        self.open_status_stream(job_id).await
    }

    async fn fetch_status(&self, job_id: &str) -> Result<GenerationJob, ClientError> {
        self.status(job_id).await
    }
}

#[async_trait]
impl VideoService for VideoApi {
    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitResponse, ClientError> {
        let mut options = RequestOptions::default();
        if request.reference_image.is_some() {
            options = options.with_timeout(self.transfer_timeout);
        }
        self.transport
            .send_json(Method::POST, "/videos/generate", request, &options)
            .await
    }

    fn supports_batch(&self) -> bool {
        self.batch_submit
    }

    async fn submit_batch(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<Vec<SubmitResponse>, ClientError> {
        let options = RequestOptions::default().with_timeout(self.transfer_timeout);
        let response: BatchSubmitResponse = self
            .transport
            .send_json(
                Method::POST,
                "/videos/generate/batch",
                &BatchSubmitRequest { requests },
                &options,
            )
            .await?;
        if response.generations.len() != requests.len() {
            return Err(ClientError::decode(format!(
                "Batch submission returned {} generations for {} requests",
                response.generations.len(),
                requests.len()
            )));
        }
        Ok(response.generations)
    }

    /// Best-effort: not retried, so a slow remote never delays local
    /// teardown.
    async fn cancel(&self, job_id: &str) -> Result<(), ClientError> {
        self.transport
            .send_bytes(
                Method::DELETE,
                &format!("/videos/{job_id}/cancel"),
                None,
                &RequestOptions::default().skip_retry(),
            )
            .await
            .map(|_| ())
    }
}
