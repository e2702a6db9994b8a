// Per-workflow log entries, one JSON object per line
//
// Data lines carry step output; control lines bracket each step (start then
// end with the same stepId).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::{Step, StepKind};

/// Which output stream a data line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Control line marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Start,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogEntry {
    #[serde(rename_all = "camelCase")]
    Data {
        time: DateTime<Utc>,
        step_id: usize,
        content: String,
        stream: LogStream,
    },
    #[serde(rename_all = "camelCase")]
    Control {
        time: DateTime<Utc>,
        step_id: usize,
        /// Step name
        content: String,
        step_status: StepStatus,
        step_kind: StepKind,
        step_command: String,
    },
}

impl LogEntry {
    pub fn data(step_id: usize, stream: LogStream, content: impl Into<String>) -> Self {
        LogEntry::Data {
            time: Utc::now(),
            step_id,
            content: content.into(),
            stream,
        }
    }

    pub fn control(step_id: usize, step: &Step, step_status: StepStatus) -> Self {
        LogEntry::Control {
            time: Utc::now(),
            step_id,
            content: step.name.clone(),
            step_status,
            step_kind: step.kind,
            step_command: step.command.clone(),
        }
    }

    pub fn step_id(&self) -> usize {
        match self {
            LogEntry::Data { step_id, .. } | LogEntry::Control { step_id, .. } => *step_id,
        }
    }
}
