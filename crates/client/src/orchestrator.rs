//! Single entry point for generation workflows.
//!
//! The orchestrator validates requests locally, submits them through a
//! [`VideoService`], hands the job id to the [`JobTracker`], and forwards
//! every update to the caller and to the [`ClientStateStore`]. It is the
//! only writer of the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use veo_core::generation::{GenerationRequest, ReferenceImage, ValidationReport};
use veo_core::job::GenerationJob;
use veo_core::types::JobId;

use crate::api::VideoService;
use crate::error::{ClientError, ErrorKind};
use crate::store::ClientStateStore;
use crate::tracker::{JobTracker, TrackOptions, TrackingError};

/// Receives every status update of a job, starting with the submission
/// snapshot.
pub type ProgressCallback = Arc<dyn Fn(&GenerationJob) + Send + Sync>;

/// Receives image-encoding progress (0, 50, 100).
pub type EncodeProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Default number of generations in flight during a batch.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 3;

#[derive(Clone, Default)]
pub struct GenerateOptions {
    pub on_progress: Option<ProgressCallback>,
    pub on_encode_progress: Option<EncodeProgressCallback>,
    /// Overall tracking timeout; the tracker default applies when unset.
    pub timeout: Option<Duration>,
}

impl GenerateOptions {
    pub fn on_progress(mut self, callback: impl Fn(&GenerationJob) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_encode_progress(mut self, callback: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.on_encode_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub struct BatchOptions {
    /// Upper bound on generations in flight at once (at least 1).
    pub max_concurrency: usize,
    /// Abort the remaining generations after the first failure.
    pub fail_fast: bool,
    /// Per-job tracking timeout.
    pub timeout: Option<Duration>,
    /// Receives updates from every job in the batch.
    pub on_progress: Option<ProgressCallback>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_BATCH_CONCURRENCY,
            fail_fast: false,
            timeout: None,
            on_progress: None,
        }
    }
}

/// Result of [`GenerationOrchestrator::cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub job_id: JobId,
    /// Whether the service acknowledged the cancel request.
    pub remote_acknowledged: bool,
}

/// Why a generation did not produce a terminal status.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// Local validation failed; nothing was sent.
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationReport),

    /// Submission or tracking failed at the transport level.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Tracking timed out or was aborted.
    #[error(transparent)]
    Tracking(TrackingError),

    /// `cancel` was called with no job named and none in flight.
    #[error("No generation is in progress")]
    NoActiveJob,

    /// A fail-fast batch stopped before this request was started.
    #[error("Not started because another generation in the batch failed")]
    BatchAborted,
}

impl From<TrackingError> for GenerationError {
    fn from(err: TrackingError) -> Self {
        match err {
            // Transport failures surface in the same shape as submission
            // failures, so a mid-tracking 401 reads like any other.
            TrackingError::Transport(e) => Self::Client(e),
            other => Self::Tracking(other),
        }
    }
}

impl GenerationError {
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Self::Client(e) if e.is_auth_rejected())
    }

    /// The job may still complete remotely.
    pub fn is_tracking_timeout(&self) -> bool {
        matches!(self, Self::Tracking(TrackingError::Timeout { .. }))
    }

    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(report) => format!("Your input was invalid: {report}"),
            Self::Client(e) => match e.kind {
                ErrorKind::AuthRejected => {
                    "Your session has expired. Please log in again.".to_string()
                }
                ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::ServerError
                | ErrorKind::RateLimited => {
                    "The video service is unavailable right now. We retried without success; please try again shortly."
                        .to_string()
                }
                ErrorKind::ClientError | ErrorKind::Decode => {
                    format!("The request could not be completed: {}", e.message)
                }
            },
            Self::Tracking(TrackingError::Timeout { .. }) => {
                "This is taking longer than expected. The video is still being generated; check back later."
                    .to_string()
            }
            Self::Tracking(_) => "The generation was cancelled.".to_string(),
            Self::NoActiveJob => "There is no generation in progress to cancel.".to_string(),
            Self::BatchAborted => {
                "Skipped because another generation in the batch failed.".to_string()
            }
        }
    }

    fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::Tracking(TrackingError::Aborted { .. }) | Self::BatchAborted
        )
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct ActiveSession {
    id: u64,
    job_id: JobId,
    cancel: CancellationToken,
}

/// Coordinates submission, tracking and client state.
pub struct GenerationOrchestrator {
    service: Arc<dyn VideoService>,
    tracker: JobTracker,
    store: Arc<ClientStateStore>,
    /// Tracking sessions in start order.
    sessions: Mutex<Vec<ActiveSession>>,
    next_session: AtomicU64,
}

impl GenerationOrchestrator {
    pub fn new(
        service: Arc<dyn VideoService>,
        tracker: JobTracker,
        store: Arc<ClientStateStore>,
    ) -> Self {
        Self {
            service,
            tracker,
            store,
            sessions: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<ClientStateStore> {
        &self.store
    }

    /// Ids of jobs currently being tracked, oldest first.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.sessions().iter().map(|s| s.job_id.clone()).collect()
    }

    /// Validate, submit and track one request to a terminal status.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        options: GenerateOptions,
    ) -> Result<GenerationJob, GenerationError> {
        self.run(&request, options.on_progress.as_ref(), options.timeout, None)
            .await
    }

    /// Encode `image` into the request, then [`generate`](Self::generate).
    ///
    /// Encoding progress is reported separately through
    /// `on_encode_progress` as 0, 50 and 100.
    pub async fn generate_with_image(
        &self,
        request: GenerationRequest,
        image: ReferenceImage,
        options: GenerateOptions,
    ) -> Result<GenerationJob, GenerationError> {
        let report_encode = |percent: u8| {
            if let Some(callback) = &options.on_encode_progress {
                callback(percent);
            }
        };

        report_encode(0);

        let mut report = ValidationReport::default();
        if let Err(e) = request.validate_request() {
            report.merge(e);
        }
        if let Err(e) = image.validate() {
            report.merge(e);
        }
        report.into_result()?;

        report_encode(50);
        let encoded = image.encode_base64();
        report_encode(100);

        tracing::debug!(
            file_name = %image.file_name,
            mime_type = %image.mime_type,
            bytes = image.bytes.len(),
            "Encoded reference image",
        );

        self.generate(request.with_reference_image(encoded), options)
            .await
    }

    /// Stop tracking `job_id` (or the most recently started job) and ask
    /// the service to cancel it.
    ///
    /// Local teardown always succeeds; a failed remote call only shows up as
    /// `remote_acknowledged: false`.
    pub async fn cancel(&self, job_id: Option<&str>) -> Result<CancelOutcome, GenerationError> {
        let session = {
            let mut sessions = self.sessions();
            let index = match job_id {
                Some(id) => sessions.iter().rposition(|s| s.job_id == id),
                None => sessions.len().checked_sub(1),
            };
            index.map(|i| sessions.remove(i))
        };

        let job_id = match (job_id, &session) {
            (_, Some(session)) => session.job_id.clone(),
            (Some(id), None) => id.to_string(),
            (None, None) => return Err(GenerationError::NoActiveJob),
        };

        match &session {
            Some(session) => session.cancel.cancel(),
            None => tracing::debug!(job_id = %job_id, "No local tracking session to cancel"),
        }

        let remote_acknowledged = self.notify_remote_cancel(&job_id).await;
        self.store.mark_cancelled(&job_id);

        tracing::info!(job_id = %job_id, remote_acknowledged, "Generation cancelled");
        Ok(CancelOutcome {
            job_id,
            remote_acknowledged,
        })
    }

    /// Run several generations with at most `max_concurrency` in flight.
    ///
    /// Results are in request order. When every request fits in one window
    /// and the service supports it, submission is a single batch call.
    pub async fn generate_batch(
        &self,
        requests: Vec<GenerationRequest>,
        options: BatchOptions,
    ) -> Vec<Result<GenerationJob, GenerationError>> {
        if requests.is_empty() {
            return Vec::new();
        }

        let cap = options.max_concurrency.max(1);
        let batch_cancel = CancellationToken::new();

        tracing::info!(
            count = requests.len(),
            max_concurrency = cap,
            fail_fast = options.fail_fast,
            "Starting batch generation",
        );

        if cap >= requests.len() && self.service.supports_batch() {
            return self
                .run_single_submission(&requests, &options, &batch_cancel)
                .await;
        }

        let mut results: Vec<Option<Result<GenerationJob, GenerationError>>> =
            (0..requests.len()).map(|_| None).collect();

        let options = &options;
        let batch_cancel = &batch_cancel;
        let mut in_flight = futures::stream::iter(requests.into_iter().enumerate())
            .map(|(index, request)| async move {
                if options.fail_fast && batch_cancel.is_cancelled() {
                    return (index, Err(GenerationError::BatchAborted));
                }
                let result = self
                    .run(
                        &request,
                        options.on_progress.as_ref(),
                        options.timeout,
                        Some(batch_cancel),
                    )
                    .await;
                (index, result)
            })
            .buffer_unordered(cap);

        while let Some((index, result)) = in_flight.next().await {
            if options.fail_fast && !batch_cancel.is_cancelled() {
                if let Err(e) = &result {
                    if !e.is_abort() {
                        tracing::warn!(index, error = %e, "Batch member failed, aborting the rest");
                        batch_cancel.cancel();
                    }
                }
            }
            results[index] = Some(result);
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(GenerationError::BatchAborted)))
            .collect()
    }

    // ---- private helpers ----

    async fn run(
        &self,
        request: &GenerationRequest,
        on_progress: Option<&ProgressCallback>,
        timeout: Option<Duration>,
        parent: Option<&CancellationToken>,
    ) -> Result<GenerationJob, GenerationError> {
        request.validate_request()?;

        let submitted = self.service.submit(request).await?;
        let initial = GenerationJob::from_submission(&submitted);
        tracing::info!(
            job_id = %initial.generation_id,
            status = %initial.status,
            "Generation submitted",
        );

        self.follow(initial, on_progress, timeout, parent).await
    }

    /// Single `submit_batch` call, then every job tracked concurrently.
    async fn run_single_submission(
        &self,
        requests: &[GenerationRequest],
        options: &BatchOptions,
        batch_cancel: &CancellationToken,
    ) -> Vec<Result<GenerationJob, GenerationError>> {
        let mut results: Vec<Option<Result<GenerationJob, GenerationError>>> =
            (0..requests.len()).map(|_| None).collect();

        let mut valid = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            match request.validate_request() {
                Ok(()) => valid.push((index, request.clone())),
                Err(report) => results[index] = Some(Err(report.into())),
            }
        }

        if !valid.is_empty() {
            let batch: Vec<GenerationRequest> = valid.iter().map(|(_, r)| r.clone()).collect();
            match self.service.submit_batch(&batch).await {
                Ok(responses) => {
                    let follows = valid.iter().zip(responses).map(|((index, _), response)| {
                        let initial = GenerationJob::from_submission(&response);
                        async move {
                            let result = self
                                .follow(
                                    initial,
                                    options.on_progress.as_ref(),
                                    options.timeout,
                                    Some(batch_cancel),
                                )
                                .await;
                            if options.fail_fast {
                                if let Err(e) = &result {
                                    if !e.is_abort() {
                                        batch_cancel.cancel();
                                    }
                                }
                            }
                            (*index, result)
                        }
                    });
                    for (index, result) in futures::future::join_all(follows).await {
                        results[index] = Some(result);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Batch submission failed");
                    for (index, _) in &valid {
                        results[*index] = Some(Err(e.clone().into()));
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(GenerationError::BatchAborted)))
            .collect()
    }

    /// Record the submission, then track to a terminal status.
    async fn follow(
        &self,
        initial: GenerationJob,
        on_progress: Option<&ProgressCallback>,
        timeout: Option<Duration>,
        parent: Option<&CancellationToken>,
    ) -> Result<GenerationJob, GenerationError> {
        let job_id = initial.generation_id.clone();

        self.store.record_submitted(&initial);
        if let Some(callback) = on_progress {
            callback(&initial);
        }
        if initial.is_terminal() {
            return Ok(initial);
        }

        let cancel = parent
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let session = self.register(&job_id, &cancel);

        let store = Arc::clone(&self.store);
        let forward = on_progress.cloned();
        let result = self
            .tracker
            .track(
                &job_id,
                TrackOptions { timeout, cancel },
                move |job: &GenerationJob| {
                    store.apply_update(job);
                    if let Some(callback) = &forward {
                        callback(job);
                    }
                },
            )
            .await;

        // If the session is still registered, `cancel()` did not end it.
        let still_registered = session.release();

        match result {
            Ok(job) => Ok(job),
            Err(e @ TrackingError::Timeout { .. }) => {
                self.store.mark_tracking_lost(&job_id);
                Err(e.into())
            }
            Err(e @ TrackingError::Aborted { .. }) if still_registered => {
                // Aborted by a failing batch sibling.
                self.notify_remote_cancel(&job_id).await;
                self.store.mark_cancelled(&job_id);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Register a tracking session. It is released when the returned guard
    /// is released or dropped, so a caller dropping `generate` mid-flight
    /// leaves nothing behind.
    fn register(&self, job_id: &str, cancel: &CancellationToken) -> SessionGuard<'_> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions().push(ActiveSession {
            id,
            job_id: job_id.to_string(),
            cancel: cancel.clone(),
        });
        SessionGuard {
            sessions: &self.sessions,
            id,
            released: false,
        }
    }

    async fn notify_remote_cancel(&self, job_id: &str) -> bool {
        match self.service.cancel(job_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Remote cancel failed");
                false
            }
        }
    }

    fn sessions(&self) -> MutexGuard<'_, Vec<ActiveSession>> {
        lock_sessions(&self.sessions)
    }
}

fn lock_sessions(sessions: &Mutex<Vec<ActiveSession>>) -> MutexGuard<'_, Vec<ActiveSession>> {
    sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps one entry in the orchestrator's session list alive.
struct SessionGuard<'a> {
    sessions: &'a Mutex<Vec<ActiveSession>>,
    id: u64,
    released: bool,
}

impl SessionGuard<'_> {
    /// Remove the session; true if it was still present.
    fn release(mut self) -> bool {
        self.remove()
    }

    fn remove(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let mut sessions = lock_sessions(self.sessions);
        match sessions.iter().position(|s| s.id == self.id) {
            Some(index) => {
                sessions.remove(index);
                true
            }
            None => false,
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.remove();
    }
}
