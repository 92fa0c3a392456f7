//! Turns a job id into a live sequence of status updates.
//!
//! [`JobTracker::track`] first tries the push stream. If the stream cannot
//! be opened, errors, or ends before a terminal status, the tracker tears it
//! down and falls back to polling with a growing interval. Whichever
//! transport is in use, the caller sees one contract:
//!
//! - updates arrive in non-decreasing progress order;
//! - the terminal status is delivered exactly once, and then tracking ends;
//! - after cancellation, no further updates are delivered.
//!
//! Per job, at most one transport (open stream or armed poll timer) exists
//! at any time. That handle lives in [`TrackingSession`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use veo_core::job::GenerationJob;

use crate::api::{StatusSource, StatusStream};
use crate::error::ClientError;

/// Tunable parameters for tracking.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Try the push stream before polling.
    pub streaming: bool,
    /// Delay after the first non-terminal poll.
    pub poll_interval: Duration,
    /// Upper bound on the delay between polls.
    pub max_poll_interval: Duration,
    /// Factor by which the poll delay grows after each non-terminal poll.
    pub poll_multiplier: f64,
    /// Overall bound on one `track` call when the caller sets none.
    pub default_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            streaming: true,
            poll_interval: Duration::from_secs(2),
            max_poll_interval: Duration::from_secs(10),
            poll_multiplier: 1.5,
            default_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Calculate the next poll delay from the current one.
///
/// The result is clamped to [`TrackerConfig::max_poll_interval`] and never
/// shrinks.
pub fn next_poll_interval(current: Duration, config: &TrackerConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.poll_multiplier) as u64;
    Duration::from_millis(next_ms)
        .max(current)
        .min(config.max_poll_interval.max(current))
}

/// Per-call tracking options.
#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    /// Overrides [`TrackerConfig::default_timeout`].
    pub timeout: Option<Duration>,
    /// Cancelling this token aborts tracking.
    pub cancel: CancellationToken,
}

impl TrackOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            timeout: None,
            cancel,
        }
    }
}

/// Why `track` ended without a terminal status.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    /// The overall timeout elapsed. The job may still finish remotely.
    #[error("Stopped tracking job {job_id} after the timeout; it may still be processing")]
    Timeout {
        job_id: String,
        /// Last non-terminal update delivered, if any.
        last: Option<GenerationJob>,
    },

    #[error("Tracking of job {job_id} was aborted")]
    Aborted { job_id: String },

    /// A non-recoverable transport failure (auth rejected, client error).
    #[error(transparent)]
    Transport(#[from] ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingErrorKind {
    Timeout,
    Aborted,
    Transport,
}

impl TrackingError {
    pub fn kind(&self) -> TrackingErrorKind {
        match self {
            Self::Timeout { .. } => TrackingErrorKind::Timeout,
            Self::Aborted { .. } => TrackingErrorKind::Aborted,
            Self::Transport(_) => TrackingErrorKind::Transport,
        }
    }
}

// ---------------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------------

/// Where a tracking session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    Idle,
    StreamingAttempt,
    Streaming,
    PollingFallback,
    Terminal,
}

/// The single transport handle a session may hold.
enum ActiveTransport {
    Idle,
    Stream(StatusStream),
    Timer(Pin<Box<Sleep>>),
}

impl ActiveTransport {
    fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Stream(_) => "stream",
            Self::Timer(_) => "timer",
        }
    }
}

/// Mutable state of one `track` call.
struct TrackingSession {
    job_id: String,
    phase: TrackerPhase,
    transport: ActiveTransport,
    poll_interval: Duration,
    last_progress: Option<f64>,
    last: Option<GenerationJob>,
}

impl TrackingSession {
    fn new(job_id: &str, poll_interval: Duration) -> Self {
        Self {
            job_id: job_id.to_string(),
            phase: TrackerPhase::Idle,
            transport: ActiveTransport::Idle,
            poll_interval,
            last_progress: None,
            last: None,
        }
    }

    /// Replace the active transport, closing whatever was there first.
    fn switch_to(&mut self, transport: ActiveTransport) {
        self.teardown();
        self.transport = transport;
    }

    /// Close the stream or clear the timer. Safe to call repeatedly.
    fn teardown(&mut self) {
        let previous = std::mem::replace(&mut self.transport, ActiveTransport::Idle);
        if !matches!(previous, ActiveTransport::Idle) {
            tracing::debug!(
                job_id = %self.job_id,
                transport = previous.label(),
                "Released tracking transport",
            );
        }
        // Dropping the stream closes the connection; dropping the sleep
        // disarms the timer.
        drop(previous);
    }

    /// Wait for the armed poll timer, if any, then release it.
    async fn wait_for_timer(&mut self) {
        if let ActiveTransport::Timer(sleep) = &mut self.transport {
            sleep.as_mut().await;
        }
        self.transport = ActiveTransport::Idle;
    }

    /// Hand one received status to the caller.
    ///
    /// Returns the job once it is terminal. Non-terminal updates whose
    /// progress is lower than the last delivered one are dropped.
    fn deliver<F>(
        &mut self,
        job: GenerationJob,
        cancel: &CancellationToken,
        on_update: &mut F,
    ) -> Result<Option<GenerationJob>, TrackingError>
    where
        F: FnMut(&GenerationJob),
    {
        // A result that resolves after cancellation is ignored.
        if cancel.is_cancelled() {
            return Err(TrackingError::Aborted {
                job_id: self.job_id.clone(),
            });
        }

        if job.is_terminal() {
            self.teardown();
            self.phase = TrackerPhase::Terminal;
            on_update(&job);
            return Ok(Some(job));
        }

        if let Some(last) = self.last_progress {
            if job.progress < last {
                tracing::debug!(
                    job_id = %self.job_id,
                    progress = job.progress,
                    last_progress = last,
                    "Dropping out-of-order status update",
                );
                return Ok(None);
            }
        }

        self.last_progress = Some(job.progress);
        on_update(&job);
        self.last = Some(job);
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// JobTracker
// ---------------------------------------------------------------------------

/// Tracks jobs against a [`StatusSource`].
#[derive(Clone)]
pub struct JobTracker {
    source: Arc<dyn StatusSource>,
    config: TrackerConfig,
}

enum Outcome {
    Finished(Result<GenerationJob, TrackingError>),
    Cancelled,
    TimedOut,
}

impl JobTracker {
    pub fn new(source: Arc<dyn StatusSource>, config: TrackerConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Track `job_id` until it reaches a terminal status.
    ///
    /// `on_update` sees every accepted update, including the terminal one.
    /// Resolves with the terminal snapshot, or fails with
    /// [`TrackingError`]. A timeout never fabricates a terminal status.
    pub async fn track<F>(
        &self,
        job_id: &str,
        options: TrackOptions,
        mut on_update: F,
    ) -> Result<GenerationJob, TrackingError>
    where
        F: FnMut(&GenerationJob) + Send,
    {
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let deadline = Instant::now() + timeout;
        let cancel = options.cancel;
        let mut session = TrackingSession::new(job_id, self.config.poll_interval);

        tracing::info!(
            job_id,
            timeout_secs = timeout.as_secs(),
            streaming = self.config.streaming,
            "Tracking job",
        );

        let outcome = {
            let drive = self.drive(&mut session, &cancel, &mut on_update);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                result = drive => Outcome::Finished(result),
                _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
            }
        };

        session.teardown();

        match outcome {
            Outcome::Finished(Ok(job)) => {
                tracing::info!(job_id, status = %job.status, "Job reached terminal status");
                Ok(job)
            }
            Outcome::Finished(Err(e)) => {
                tracing::warn!(job_id, error = %e, "Tracking failed");
                Err(e)
            }
            Outcome::Cancelled => {
                tracing::info!(job_id, "Tracking aborted");
                Err(TrackingError::Aborted {
                    job_id: job_id.to_string(),
                })
            }
            Outcome::TimedOut => {
                tracing::warn!(
                    job_id,
                    timeout_secs = timeout.as_secs(),
                    last_progress = ?session.last_progress,
                    "Tracking timed out",
                );
                Err(TrackingError::Timeout {
                    job_id: job_id.to_string(),
                    last: session.last.take(),
                })
            }
        }
    }

    // ---- private helpers ----

    async fn drive<F>(
        &self,
        session: &mut TrackingSession,
        cancel: &CancellationToken,
        on_update: &mut F,
    ) -> Result<GenerationJob, TrackingError>
    where
        F: FnMut(&GenerationJob),
    {
        if self.config.streaming {
            if let Some(job) = self.follow_stream(session, cancel, on_update).await? {
                return Ok(job);
            }
        }
        self.poll(session, cancel, on_update).await
    }

    /// Consume the push stream. `Ok(None)` means fall back to polling.
    async fn follow_stream<F>(
        &self,
        session: &mut TrackingSession,
        cancel: &CancellationToken,
        on_update: &mut F,
    ) -> Result<Option<GenerationJob>, TrackingError>
    where
        F: FnMut(&GenerationJob),
    {
        session.phase = TrackerPhase::StreamingAttempt;

        let stream = match self.source.open_stream(&session.job_id).await {
            Ok(stream) => stream,
            Err(e) if e.is_auth_rejected() => return Err(TrackingError::Transport(e)),
            Err(e) => {
                tracing::info!(
                    job_id = %session.job_id,
                    error = %e,
                    "Status stream unavailable, falling back to polling",
                );
                return Ok(None);
            }
        };

        session.switch_to(ActiveTransport::Stream(stream));
        session.phase = TrackerPhase::Streaming;

        loop {
            let next = match &mut session.transport {
                ActiveTransport::Stream(stream) => stream.next().await,
                _ => None,
            };

            match next {
                Some(Ok(job)) => {
                    if let Some(done) = session.deliver(job, cancel, on_update)? {
                        return Ok(Some(done));
                    }
                }
                Some(Err(e)) => {
                    tracing::info!(
                        job_id = %session.job_id,
                        error = %e,
                        "Status stream failed, falling back to polling",
                    );
                    return Ok(None);
                }
                None => {
                    tracing::info!(
                        job_id = %session.job_id,
                        "Status stream closed before a terminal status, falling back to polling",
                    );
                    return Ok(None);
                }
            }
        }
    }

    async fn poll<F>(
        &self,
        session: &mut TrackingSession,
        cancel: &CancellationToken,
        on_update: &mut F,
    ) -> Result<GenerationJob, TrackingError>
    where
        F: FnMut(&GenerationJob),
    {
        // The stream, if any, is fully closed before the first poll.
        session.teardown();
        session.phase = TrackerPhase::PollingFallback;

        loop {
            match self.source.fetch_status(&session.job_id).await {
                Ok(job) => {
                    if let Some(done) = session.deliver(job, cancel, on_update)? {
                        return Ok(done);
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        job_id = %session.job_id,
                        error = %e,
                        next_poll_ms = session.poll_interval.as_millis() as u64,
                        "Status poll failed, will poll again",
                    );
                }
                Err(e) => return Err(TrackingError::Transport(e)),
            }

            let wait = session.poll_interval;
            session.poll_interval = next_poll_interval(wait, &self.config);
            session.switch_to(ActiveTransport::Timer(Box::pin(tokio::time::sleep(wait))));
            session.wait_for_timer().await;

            if cancel.is_cancelled() {
                return Err(TrackingError::Aborted {
                    job_id: session.job_id.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veo_core::job::JobStatus;

    fn job(status: JobStatus, progress: f64) -> GenerationJob {
        GenerationJob {
            generation_id: "job-1".into(),
            status,
            progress,
            message: String::new(),
            video_url: None,
            error_details: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn poll_interval_grows_by_half() {
        let config = TrackerConfig::default();
        let d = next_poll_interval(Duration::from_secs(2), &config);
        assert_eq!(d, Duration::from_secs(3));
    }

    #[test]
    fn poll_interval_clamps_at_max() {
        let config = TrackerConfig::default();
        let mut delay = config.poll_interval;
        let expected = [2000, 3000, 4500, 6750, 10_000, 10_000];

        for &expected_ms in &expected {
            assert_eq!(delay.as_millis() as u64, expected_ms);
            delay = next_poll_interval(delay, &config);
        }
    }

    #[test]
    fn poll_interval_never_shrinks() {
        let config = TrackerConfig {
            poll_multiplier: 0.5,
            ..Default::default()
        };
        let d = next_poll_interval(Duration::from_secs(4), &config);
        assert_eq!(d, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let mut session = TrackingSession::new("job-1", Duration::from_secs(2));
        session.teardown();
        session.switch_to(ActiveTransport::Stream(futures::stream::empty().boxed()));
        session.switch_to(ActiveTransport::Timer(Box::pin(tokio::time::sleep(
            Duration::from_secs(1),
        ))));
        assert_eq!(session.transport.label(), "timer");
        session.teardown();
        session.teardown();
        assert_eq!(session.transport.label(), "idle");
    }

    #[test]
    fn regressing_progress_is_dropped() {
        let mut session = TrackingSession::new("job-1", Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let mut record = |j: &GenerationJob| seen.push(j.progress);

        session
            .deliver(job(JobStatus::Processing, 40.0), &cancel, &mut record)
            .unwrap();
        session
            .deliver(job(JobStatus::Processing, 30.0), &cancel, &mut record)
            .unwrap();
        let done = session
            .deliver(job(JobStatus::Completed, 100.0), &cancel, &mut record)
            .unwrap();

        assert!(done.is_some());
        assert_eq!(session.phase, TrackerPhase::Terminal);
        assert_eq!(seen, vec![40.0, 100.0]);
    }

    #[test]
    fn nothing_is_delivered_after_cancel() {
        let mut session = TrackingSession::new("job-1", Duration::from_secs(2));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut calls = 0;

        let result = session.deliver(job(JobStatus::Completed, 100.0), &cancel, &mut |_| calls += 1);

        assert!(matches!(result, Err(TrackingError::Aborted { .. })));
        assert_eq!(calls, 0);
    }

    #[test]
    fn error_kinds() {
        let timeout = TrackingError::Timeout {
            job_id: "j".into(),
            last: None,
        };
        assert_eq!(timeout.kind(), TrackingErrorKind::Timeout);
        assert!(timeout.to_string().contains("may still be processing"));
        assert_eq!(
            TrackingError::from(ClientError::network("down")).kind(),
            TrackingErrorKind::Transport,
        );
    }
}
