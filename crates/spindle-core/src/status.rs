// Workflow status lifecycle and the status event payload
//
// pending -> running -> {success | failed | timeout | cancelled}
// Once a workflow reaches a finish state no further events are written for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl StatusKind {
    /// States a workflow passes through before completion
    pub fn is_start(self) -> bool {
        matches!(self, StatusKind::Pending | StatusKind::Running)
    }

    /// Terminal states; nothing follows these
    pub fn is_finish(self) -> bool {
        !self.is_start()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusKind::Pending => "pending",
            StatusKind::Running => "running",
            StatusKind::Success => "success",
            StatusKind::Failed => "failed",
            StatusKind::Timeout => "timeout",
            StatusKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON payload appended to the events table per transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// At-uri of the pipeline record
    pub pipeline: String,
    /// Workflow name within the pipeline
    pub workflow: String,
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(pipeline: String, workflow: String, status: StatusKind) -> Self {
        Self {
            pipeline,
            workflow,
            status,
            error: None,
            exit_code: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>, exit_code: Option<i64>) -> Self {
        self.error = Some(error.into());
        self.exit_code = exit_code;
        self
    }
}
