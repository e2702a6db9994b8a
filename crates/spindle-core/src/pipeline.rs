// Inbound pipeline record

use serde::{Deserialize, Serialize};

use crate::trigger::TriggerMetadata;

/// One workflow file as carried by the pipeline record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    /// File name (without directory), used as the fallback workflow name
    pub name: String,
    /// Raw YAML contents
    pub contents: String,
}

/// A pipeline record as emitted by a knot: the trigger plus the workflow
/// files present at the triggering commit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRecord {
    pub trigger_metadata: TriggerMetadata,
    #[serde(default)]
    pub workflows: Vec<WorkflowFile>,
}
