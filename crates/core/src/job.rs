//! Generation job snapshots and lifecycle status.
//!
//! The same [`GenerationJob`] shape is returned by `GET /videos/{id}/status`
//! and carried by every message on the `/events/{id}` stream.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

/// Lifecycle status of a generation job.
///
/// `Completed`, `Failed` and `Cancelled` are terminal: no further status
/// changes occur once one of them is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::UnknownVariant {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

/// Point-in-time view of a job as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    #[serde(alias = "id")]
    pub generation_id: JobId,
    pub status: JobStatus,
    /// Completion percentage, clamped to `0.0..=100.0` on read.
    #[serde(default, deserialize_with = "deserialize_progress")]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    /// Download URL; only meaningful once `status` is `Completed`.
    #[serde(default)]
    pub video_url: Option<String>,
    /// Failure detail; only meaningful once `status` is `Failed`.
    #[serde(default)]
    pub error_details: Option<String>,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

fn deserialize_progress<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0);
    Ok(if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 100.0) })
}

impl GenerationJob {
    /// Initial snapshot built from the submission response, before any
    /// status update has been received.
    pub fn from_submission(response: &SubmitResponse) -> Self {
        Self {
            generation_id: response.generation_id.clone(),
            status: response.status,
            progress: 0.0,
            message: response.message.clone(),
            video_url: None,
            error_details: None,
            created_at: Some(chrono::Utc::now()),
            updated_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Body returned by `POST /videos/generate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(alias = "id")]
    pub generation_id: JobId,
    #[serde(default = "default_submit_status")]
    pub status: JobStatus,
    #[serde(default)]
    pub message: String,
}

fn default_submit_status() -> JobStatus {
    JobStatus::Pending
}
