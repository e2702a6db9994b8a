// Spindle Core Abstractions
//
// This crate provides the storage- and daemon-agnostic pieces of the spindle:
// pipeline records, the workflow compiler and trigger matcher, the status
// lifecycle, log entry formats, the secrets model, and the trait seams the
// worker and storage crates plug into.
//
// Key design decisions:
// - Records parse at ingress with tagged-union discrimination on `kind`/nsid
// - The compiler surfaces problems as Diagnostic values, never as panics
// - Engines are pluggable via the WorkflowEngine trait; docker is just one impl
// - Cancellation is an explicit {deadline, cancel-signal} pair (RunContext),
//   observed by the step runner and log tailer on every blocking wait
// - Notifier pulses are lossy on purpose: subscribers re-query from a cursor

pub mod compile;
pub mod error;
pub mod glob;
pub mod ids;
pub mod log;
pub mod notifier;
pub mod pipeline;
pub mod secret;
pub mod status;
pub mod traits;
pub mod trigger;
pub mod workflow;

// Re-exports for convenience
pub use compile::{
    compile, parse, CompiledPipeline, CompiledWorkflow, Diagnostic, DiagnosticKind, Severity,
};
pub use error::{EngineError, ErrorTag, VaultError};
pub use ids::{nsid, PipelineId, WorkflowId};
pub use log::{LogEntry, LogStream, StepStatus};
pub use notifier::Notifier;
pub use pipeline::{PipelineRecord, WorkflowFile};
pub use secret::{DidSlashRepo, LockedSecret, Secret};
pub use status::{StatusEvent, StatusKind};
pub use traits::{
    CancelGuard, CursorStore, EngineWorkflow, RunContext, StepLogger, Vault, WorkflowEngine,
};
pub use trigger::{
    ManualTrigger, PullRequestTrigger, PushTrigger, TriggerKind, TriggerMetadata, TriggerRepo,
};
pub use workflow::{CloneOpts, Constraint, PatternList, Step, StepKind, StepSource, WorkflowSource};
