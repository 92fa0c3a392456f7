#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;

use veo_client::api::{StatusSource, StatusStream, VideoService};
use veo_client::error::ClientError;
use veo_client::transport::{HttpBackend, HttpRequest, HttpResponse, StreamingResponse};
use veo_core::generation::GenerationRequest;
use veo_core::job::{GenerationJob, JobStatus, SubmitResponse};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn job(id: &str, status: JobStatus, progress: f64) -> GenerationJob {
    GenerationJob {
        generation_id: id.to_string(),
        status,
        progress,
        message: String::new(),
        video_url: None,
        error_details: None,
        created_at: None,
        updated_at: None,
    }
}

pub fn completed(id: &str) -> GenerationJob {
    GenerationJob {
        video_url: Some(format!("https://cdn.example.com/{id}.mp4")),
        ..job(id, JobStatus::Completed, 100.0)
    }
}

pub fn failed(id: &str, detail: &str) -> GenerationJob {
    GenerationJob {
        error_details: Some(detail.to_string()),
        ..job(id, JobStatus::Failed, 30.0)
    }
}

/// Mint an unsigned-for-our-purposes JWT with the given `exp`.
pub fn token_expiring_at(exp: i64) -> String {
    #[derive(serde::Serialize)]
    struct Claims {
        sub: String,
        exp: i64,
    }
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &Claims {
            sub: "user-1".into(),
            exp,
        },
        &jsonwebtoken::EncodingKey::from_secret(b"server-secret"),
    )
    .unwrap()
}

pub fn fresh_token() -> String {
    token_expiring_at(chrono::Utc::now().timestamp() + 3600)
}

// ---------------------------------------------------------------------------
// Scripted HTTP backend
// ---------------------------------------------------------------------------

/// Replays queued responses and records every request with its time.
#[derive(Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<HttpResponse, ClientError>>>,
    /// `None` accepts the connection but never answers.
    streams: Mutex<VecDeque<Option<Result<(u16, Vec<Vec<u8>>), ClientError>>>>,
    requests: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, status: u16, body: serde_json::Value) {
        self.responses.lock().unwrap().push_back(Ok(HttpResponse {
            status,
            request_id: None,
            body: serde_json::to_vec(&body).unwrap(),
        }));
    }

    pub fn fail(&self, err: ClientError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    /// Queue a streaming response whose body is the given chunks.
    pub fn stream(&self, status: u16, chunks: Vec<&str>) {
        self.streams.lock().unwrap().push_back(Some(Ok((
            status,
            chunks.into_iter().map(|c| c.as_bytes().to_vec()).collect(),
        ))));
    }

    pub fn fail_stream(&self, err: ClientError) {
        self.streams.lock().unwrap().push_back(Some(Err(err)));
    }

    /// Queue a stream that never sends response headers.
    pub fn hang_stream(&self) {
        self.streams.lock().unwrap().push_back(None);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Gaps between consecutive requests.
    pub fn gaps(&self) -> Vec<std::time::Duration> {
        let requests = self.requests.lock().unwrap();
        requests
            .windows(2)
            .map(|pair| pair[1].0.duration_since(pair[0].0))
            .collect()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        self.requests.lock().unwrap().push((Instant::now(), request));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::network("unscripted request")))
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamingResponse, ClientError> {
        self.requests.lock().unwrap().push((Instant::now(), request));
        let scripted = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Some(Err(ClientError::network("unscripted stream"))));
        let Some(scripted) = scripted else {
            return futures::future::pending().await;
        };
        let (status, chunks) = scripted?;
        Ok(StreamingResponse {
            status,
            request_id: None,
            body: futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted status source
// ---------------------------------------------------------------------------

/// How a scripted stream behaves after its items run out.
#[derive(Debug, Clone, Copy)]
pub enum StreamEnd {
    /// Stay open without sending anything.
    Hang,
    /// Close the connection.
    Close,
}

/// What polls return once the scripted queue is empty.
#[derive(Debug, Clone, Copy)]
pub enum PollFallback {
    /// Keep reporting `processing` at this progress.
    Stall(f64),
    /// Report 50% per poll and complete on this poll number (1-based),
    /// counted per job.
    CompleteAfter(u32),
}

pub struct ScriptedSource {
    streams: Mutex<VecDeque<Result<(Vec<Result<GenerationJob, ClientError>>, StreamEnd), ClientError>>>,
    polls: Mutex<VecDeque<Result<GenerationJob, ClientError>>>,
    fallback: PollFallback,
    poll_counts: Mutex<HashMap<String, u32>>,
    /// (time, job id, live streams at that moment)
    poll_log: Mutex<Vec<(Instant, String, usize)>>,
    stream_opens: AtomicUsize,
    live_streams: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(fallback: PollFallback) -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
            polls: Mutex::new(VecDeque::new()),
            fallback,
            poll_counts: Mutex::new(HashMap::new()),
            poll_log: Mutex::new(Vec::new()),
            stream_opens: AtomicUsize::new(0),
            live_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stream(&self, items: Vec<Result<GenerationJob, ClientError>>, end: StreamEnd) {
        self.streams.lock().unwrap().push_back(Ok((items, end)));
    }

    pub fn refuse_stream(&self, err: ClientError) {
        self.streams.lock().unwrap().push_back(Err(err));
    }

    pub fn poll(&self, result: Result<GenerationJob, ClientError>) {
        self.polls.lock().unwrap().push_back(result);
    }

    pub fn poll_count(&self) -> usize {
        self.poll_log.lock().unwrap().len()
    }

    pub fn poll_gaps(&self) -> Vec<std::time::Duration> {
        let log = self.poll_log.lock().unwrap();
        log.windows(2)
            .map(|pair| pair[1].0.duration_since(pair[0].0))
            .collect()
    }

    /// Live streams observed at each poll.
    pub fn live_streams_at_polls(&self) -> Vec<usize> {
        self.poll_log.lock().unwrap().iter().map(|(_, _, live)| *live).collect()
    }

    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }

    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    async fn open_stream(&self, _job_id: &str) -> Result<StatusStream, ClientError> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        let (items, end) = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::network("stream unavailable")))?;

        self.live_streams.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live_streams));

        let items = futures::stream::iter(items);
        let stream = match end {
            StreamEnd::Hang => items.chain(futures::stream::pending()).boxed(),
            StreamEnd::Close => items.boxed(),
        };
        Ok(stream
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed())
    }

    async fn fetch_status(&self, job_id: &str) -> Result<GenerationJob, ClientError> {
        self.poll_log.lock().unwrap().push((
            Instant::now(),
            job_id.to_string(),
            self.live_streams.load(Ordering::SeqCst),
        ));

        if let Some(result) = self.polls.lock().unwrap().pop_front() {
            return result;
        }

        match self.fallback {
            PollFallback::Stall(progress) => Ok(job(job_id, JobStatus::Processing, progress)),
            PollFallback::CompleteAfter(n) => {
                let mut counts = self.poll_counts.lock().unwrap();
                let count = counts.entry(job_id.to_string()).or_insert(0);
                *count += 1;
                if *count >= n {
                    Ok(completed(job_id))
                } else {
                    Ok(job(job_id, JobStatus::Processing, (50 * *count).min(99) as f64))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fake video service
// ---------------------------------------------------------------------------

/// Assigns `gen-N` ids; prompts containing "reject" get a 400.
#[derive(Default)]
pub struct FakeService {
    batch: bool,
    fail_cancel: bool,
    submitted: Mutex<Vec<GenerationRequest>>,
    batch_calls: AtomicUsize,
    cancelled: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise the batch submission endpoint.
    pub fn with_batch(mut self) -> Self {
        self.batch = true;
        self
    }

    /// Make remote cancel calls fail.
    pub fn with_failing_cancel(mut self) -> Self {
        self.fail_cancel = true;
        self
    }

    pub fn submitted(&self) -> Vec<GenerationRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    fn accept(&self, request: &GenerationRequest) -> Result<SubmitResponse, ClientError> {
        self.submitted.lock().unwrap().push(request.clone());
        if request.prompt.contains("reject") {
            return Err(ClientError::from_response(
                400,
                br#"{"message":"Prompt violates content policy","code":"content_policy"}"#,
                None,
            ));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmitResponse {
            generation_id: format!("gen-{n}"),
            status: JobStatus::Pending,
            message: "Video generation started".to_string(),
        })
    }
}

#[async_trait]
impl VideoService for FakeService {
    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitResponse, ClientError> {
        self.accept(request)
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    async fn submit_batch(
        &self,
        requests: &[GenerationRequest],
    ) -> Result<Vec<SubmitResponse>, ClientError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        requests.iter().map(|r| self.accept(r)).collect()
    }

    async fn cancel(&self, job_id: &str) -> Result<(), ClientError> {
        self.cancelled.lock().unwrap().push(job_id.to_string());
        if self.fail_cancel {
            Err(ClientError::network("connection reset"))
        } else {
            Ok(())
        }
    }
}
