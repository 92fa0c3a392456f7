//! Events published by the [`ClientStateStore`](crate::store::ClientStateStore).
//!
//! These describe state changes a UI layer re-renders on. They are
//! produced only after the store has applied the change.

use serde::Serialize;
use veo_core::job::{GenerationJob, JobStatus};
use veo_core::types::JobId;

/// A change to the client-side view of a generation job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// The service accepted a request and assigned it an id.
    Submitted { job: GenerationJob },

    /// A non-terminal status update.
    Progress {
        job_id: JobId,
        status: JobStatus,
        /// Completion percentage (0-100).
        progress: f64,
        message: String,
    },

    /// The job finished and its video can be downloaded.
    Completed { job: GenerationJob },

    /// The service reported that the job failed.
    Failed {
        job_id: JobId,
        /// Failure detail from the service, when given.
        error: Option<String>,
    },

    /// The job was cancelled, locally or remotely.
    Cancelled { job_id: JobId },

    /// Tracking gave up before a terminal status. The job may still
    /// complete on the service.
    TrackingTimedOut { job_id: JobId },
}

impl GenerationEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Submitted { job } | Self::Completed { job } => &job.generation_id,
            Self::Progress { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id }
            | Self::TrackingTimedOut { job_id } => job_id,
        }
    }
}
