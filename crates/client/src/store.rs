//! Client-side record of generation jobs for display.
//!
//! Holds the latest snapshot per job, the id of the most recently submitted
//! job, and a bounded history (newest first). The orchestrator is the only
//! writer; readers get clones. Every mutation is published as a
//! [`GenerationEvent`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use veo_core::job::{GenerationJob, JobStatus};
use veo_core::types::JobId;

use crate::events::GenerationEvent;

/// Maximum number of jobs kept in the history list.
pub const HISTORY_LIMIT: usize = 50;

/// Broadcast channel capacity for store events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<JobId, GenerationJob>,
    current: Option<JobId>,
    /// Job ids, newest first.
    history: VecDeque<JobId>,
    /// Jobs whose tracking timed out before a terminal status.
    tracking_lost: HashSet<JobId>,
}

/// Shared job state for display.
pub struct ClientStateStore {
    state: RwLock<StoreState>,
    event_tx: broadcast::Sender<GenerationEvent>,
}

impl Default for ClientStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStateStore {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            event_tx,
        }
    }

    /// Subscribe to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.event_tx.subscribe()
    }

    // ---- mutations (orchestrator only) ----

    /// Record a freshly submitted job and make it current.
    pub fn record_submitted(&self, job: &GenerationJob) {
        {
            let mut state = self.write();
            let id = job.generation_id.clone();
            state.jobs.insert(id.clone(), job.clone());
            state.tracking_lost.remove(&id);
            state.history.retain(|existing| existing != &id);
            state.history.push_front(id.clone());
            state.current = Some(id);

            while state.history.len() > HISTORY_LIMIT {
                if let Some(evicted) = state.history.pop_back() {
                    state.jobs.remove(&evicted);
                    state.tracking_lost.remove(&evicted);
                }
            }
        }
        self.emit(GenerationEvent::Submitted { job: job.clone() });
    }

    /// Apply a status update received while tracking.
    pub fn apply_update(&self, job: &GenerationJob) {
        {
            let mut state = self.write();
            state.tracking_lost.remove(&job.generation_id);
            state.jobs.insert(job.generation_id.clone(), job.clone());
        }

        let event = match job.status {
            JobStatus::Completed => GenerationEvent::Completed { job: job.clone() },
            JobStatus::Failed => GenerationEvent::Failed {
                job_id: job.generation_id.clone(),
                error: job.error_details.clone(),
            },
            JobStatus::Cancelled => GenerationEvent::Cancelled {
                job_id: job.generation_id.clone(),
            },
            JobStatus::Pending | JobStatus::Processing => GenerationEvent::Progress {
                job_id: job.generation_id.clone(),
                status: job.status,
                progress: job.progress,
                message: job.message.clone(),
            },
        };
        self.emit(event);
    }

    /// Mark a job cancelled locally. A job that already reached a terminal
    /// status keeps it.
    pub fn mark_cancelled(&self, job_id: &str) {
        {
            let mut state = self.write();
            if let Some(job) = state.jobs.get_mut(job_id) {
                if job.is_terminal() {
                    return;
                }
                job.status = JobStatus::Cancelled;
                job.updated_at = Some(chrono::Utc::now());
            }
            state.tracking_lost.remove(job_id);
        }
        self.emit(GenerationEvent::Cancelled {
            job_id: job_id.to_string(),
        });
    }

    /// Note that tracking gave up on a job that may still be running.
    pub fn mark_tracking_lost(&self, job_id: &str) {
        self.write().tracking_lost.insert(job_id.to_string());
        self.emit(GenerationEvent::TrackingTimedOut {
            job_id: job_id.to_string(),
        });
    }

    /// Forget everything (e.g. on sign-out).
    pub fn clear(&self) {
        *self.write() = StoreState::default();
    }

    // ---- queries ----

    pub fn job(&self, job_id: &str) -> Option<GenerationJob> {
        self.read().jobs.get(job_id).cloned()
    }

    /// The most recently submitted job.
    pub fn current(&self) -> Option<GenerationJob> {
        let state = self.read();
        state.current.as_ref().and_then(|id| state.jobs.get(id)).cloned()
    }

    /// Known jobs, newest first.
    pub fn history(&self) -> Vec<GenerationJob> {
        let state = self.read();
        state
            .history
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .cloned()
            .collect()
    }

    pub fn is_tracking_lost(&self, job_id: &str) -> bool {
        self.read().tracking_lost.contains(job_id)
    }

    // ---- private helpers ----

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: GenerationEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}
