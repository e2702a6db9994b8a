// Core traits for pluggable backends
//
// These traits let the orchestrator run against different backends:
// - WorkflowEngine: docker in production, a scripted fake in tests
// - Vault: embedded sqlite table or a remote KV service
// - CursorStore: database-backed in production, in-memory in tests
// - StepLogger: the NDJSON file logger, or a collector in tests

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::compile::CompiledWorkflow;
use crate::error::{EngineError, VaultError};
use crate::ids::WorkflowId;
use crate::log::{LogStream, StepStatus};
use crate::secret::{DidSlashRepo, LockedSecret, Secret};
use crate::trigger::TriggerMetadata;
use crate::workflow::Step;

// ============================================================================
// RunContext - explicit {deadline, cancel-signal} pair
// ============================================================================

/// Cancellation context handed to the step runner and log tailer.
/// Both observe it on every blocking wait.
#[derive(Clone)]
pub struct RunContext {
    deadline: Instant,
    cancel: watch::Receiver<bool>,
}

/// Held by the creator of a RunContext; dropping it does NOT cancel
pub struct CancelGuard {
    tx: watch::Sender<bool>,
}

impl CancelGuard {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl RunContext {
    /// Create a context whose deadline is `timeout` from now
    pub fn with_timeout(timeout: Duration) -> (Self, CancelGuard) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                deadline: Instant::now() + timeout,
                cancel: rx,
            },
            CancelGuard { tx },
        )
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline || *self.cancel.borrow()
    }

    /// Resolves when the deadline fires or the guard cancels. Use inside
    /// `tokio::select!` against the blocking operation.
    pub async fn done(&self) {
        let mut cancel = self.cancel.clone();
        if *cancel.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => {}
            changed = cancel.changed() => {
                if changed.is_err() {
                    // Guard dropped without cancelling; only the deadline
                    // can end the run now
                    tokio::time::sleep_until(self.deadline).await;
                }
            }
        }
    }
}

// ============================================================================
// StepLogger - structured per-workflow log sink
// ============================================================================

/// Sink for per-workflow log entries. Data lines carry step output; control
/// lines bracket each step.
#[async_trait]
pub trait StepLogger: Send + Sync {
    async fn data(&self, step_id: usize, stream: LogStream, content: &str) -> anyhow::Result<()>;

    async fn control(&self, step_id: usize, step: &Step, status: StepStatus)
        -> anyhow::Result<()>;
}

// ============================================================================
// WorkflowEngine - executes one workflow as isolated steps
// ============================================================================

/// A workflow as prepared by an engine: resolved base image and the full
/// step sequence (system steps first, then user steps)
#[derive(Debug, Clone)]
pub struct EngineWorkflow {
    pub image: String,
    pub steps: Vec<Step>,
    /// Workflow-level environment, overlaid by per-step environment
    pub environment: BTreeMap<String, String>,
}

/// Contract between the orchestrator and a concrete execution engine
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Parse engine-specific config out of the compiled workflow, resolve the
    /// base image and compose system + user steps
    async fn init_workflow(
        &self,
        compiled: &CompiledWorkflow,
        trigger: &TriggerMetadata,
    ) -> Result<EngineWorkflow, EngineError>;

    /// Allocate per-workflow resources (workspace, caches, network) and
    /// register a cleanup closure for each
    async fn setup_workflow(
        &self,
        wid: &WorkflowId,
        workflow: &EngineWorkflow,
    ) -> Result<(), EngineError>;

    /// Pull or otherwise make the base image available
    async fn pull_image(&self, wid: &WorkflowId, workflow: &EngineWorkflow)
        -> Result<(), EngineError>;

    /// Maximum wall-clock for a whole workflow
    fn workflow_timeout(&self) -> Duration;

    /// Execute one step to completion, streaming output into the logger.
    /// Must observe `ctx` on every blocking wait and kill the step when it
    /// fires. The logger is shared with the engine's log-tail task.
    async fn run_step(
        &self,
        ctx: &RunContext,
        wid: &WorkflowId,
        workflow: &EngineWorkflow,
        step_idx: usize,
        secrets: &[Secret],
        logger: Arc<dyn StepLogger>,
    ) -> Result<(), EngineError>;

    /// Drain registered cleanup closures (LIFO). Idempotent: calling again is
    /// a no-op. Individual closure errors are logged, not propagated.
    async fn destroy_workflow(&self, wid: &WorkflowId) -> Result<(), EngineError>;
}

// ============================================================================
// Vault - pluggable secret store
// ============================================================================

#[async_trait]
pub trait Vault: Send + Sync {
    /// Store a secret; `(repo, key)` must not already exist
    async fn add_secret(&self, secret: Secret) -> Result<(), VaultError>;

    /// Remove a secret; the `(repo, key)` pair must exist
    async fn remove_secret(&self, repo: &DidSlashRepo, key: &str) -> Result<(), VaultError>;

    /// List secrets without plaintext values; safe to return over the wire
    async fn secrets_locked(&self, repo: &DidSlashRepo) -> Result<Vec<LockedSecret>, VaultError>;

    /// List secrets with values; consumed only by the execution engine
    async fn secrets_unlocked(&self, repo: &DidSlashRepo) -> Result<Vec<Secret>, VaultError>;

    /// Stop background tasks (token renewal and the like)
    async fn stop(&self) {}
}

// ============================================================================
// CursorStore - durable per-source resume points
// ============================================================================

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, source: &str) -> anyhow::Result<Option<i64>>;

    async fn set(&self, source: &str, cursor: i64) -> anyhow::Result<()>;
}
