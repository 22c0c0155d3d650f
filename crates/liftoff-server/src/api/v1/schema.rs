//! Job payloads.

use serde::{Deserialize, Serialize};

/// Body of `POST /v1/jobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    /// Free-form text recorded by the job.
    pub message: String,
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Scheduled, not yet run.
    Queued,
    /// Recorded in the database.
    Finished,
}

/// Cached job status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub status: JobState,
    pub message: String,
    /// Request that submitted the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Service that ran the job, set once finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
}

/// Response of `POST /v1/jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct JobAccepted {
    #[serde(flatten)]
    pub job: JobStatus,
    /// Identifier of the scheduled task.
    pub task_id: String,
}
