// Pipeline and workflow identifiers
// Decision: WorkflowId stringifies to a filesystem-safe, stable key used for
// log file names, container names and cleanup registry slots.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Record collection NSIDs the spindle produces or consumes
pub mod nsid {
    /// Pipeline records emitted by knots
    pub const PIPELINE: &str = "sh.tangled.spindle.pipeline";
    /// Status events the spindle appends per workflow transition
    pub const PIPELINE_STATUS: &str = "sh.tangled.pipeline.status";
    /// Spindle membership records observed on the firehose
    pub const SPINDLE_MEMBER: &str = "sh.tangled.spindle.member";

    /// XRPC method NSIDs
    pub const ADD_SECRET: &str = "sh.tangled.spindle.addSecret";
    pub const REMOVE_SECRET: &str = "sh.tangled.spindle.removeSecret";
    pub const LIST_SECRETS: &str = "sh.tangled.spindle.listSecrets";
    pub const OWNER: &str = "sh.tangled.spindle.owner";
}

/// Identifies one pipeline record: the knot that emitted it plus its rkey
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId {
    pub knot: String,
    pub rkey: String,
}

impl PipelineId {
    pub fn new(knot: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            knot: knot.into(),
            rkey: rkey.into(),
        }
    }

    /// Canonical at-uri of the pipeline record
    pub fn at_uri(&self) -> String {
        format!("at://did:web:{}/{}/{}", self.knot, nsid::PIPELINE, self.rkey)
    }
}

/// Identifies one workflow within a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId {
    pub pipeline: PipelineId,
    pub name: String,
}

impl WorkflowId {
    pub fn new(pipeline: PipelineId, name: impl Into<String>) -> Self {
        Self {
            pipeline,
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkflowId {
    // <normalized-knot>-<rkey>-<normalized-name>
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            normalize(&self.pipeline.knot),
            self.pipeline.rkey,
            normalize(&self.name)
        )
    }
}

/// Replace anything outside [a-zA-Z0-9_.-] so the result is safe as a file
/// name, docker object name or status key
fn normalize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
