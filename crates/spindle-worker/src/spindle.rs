// Spindle orchestrator
//
// Consumes source messages, compiles pipeline records, initializes one
// engine workflow per compiled workflow and queues its execution. The
// execution job owns the whole §status lifecycle of its workflow: running,
// then exactly one finish state, with destroy_workflow guaranteed on every
// exit path including panics.

use anyhow::{Context, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use spindle_core::traits::{EngineWorkflow, RunContext, StepLogger, Vault, WorkflowEngine};
use spindle_core::{
    compile, nsid, parse, DidSlashRepo, EngineError, Notifier, PipelineId, PipelineRecord,
    Severity, StatusEvent, StatusKind, WorkflowId,
};
use spindle_storage::Database;

use crate::consumer::{EventSource, SourceMessage};
use crate::logger::WorkflowLogger;
use crate::queue::{Job, JobQueue};

#[derive(Debug, Clone)]
pub struct SpindleConfig {
    /// Owner DID; records from this identity are always accepted
    pub owner: String,
    /// Directory for per-workflow log files
    pub log_dir: PathBuf,
}

pub struct Spindle {
    db: Database,
    engine: Arc<dyn WorkflowEngine>,
    vault: Arc<dyn Vault>,
    notifier: Notifier,
    queue: Arc<JobQueue>,
    config: SpindleConfig,
}

impl Spindle {
    pub fn new(
        db: Database,
        engine: Arc<dyn WorkflowEngine>,
        vault: Arc<dyn Vault>,
        notifier: Notifier,
        queue: Arc<JobQueue>,
        config: SpindleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            engine,
            vault,
            notifier,
            queue,
            config,
        })
    }

    /// Adapter for the event consumer
    pub fn process_func(self: &Arc<Self>) -> crate::consumer::ProcessFunc {
        let spindle = self.clone();
        Arc::new(move |source, message| {
            let spindle = spindle.clone();
            Box::pin(async move { spindle.process_message(&source, message).await })
        })
    }

    pub async fn process_message(
        self: &Arc<Self>,
        source: &EventSource,
        message: SourceMessage,
    ) -> Result<()> {
        match message.nsid.as_str() {
            nsid::PIPELINE => self.process_pipeline(source, message).await,
            other => {
                debug!(source = %source.key, nsid = other, "Skipping uninteresting record");
                Ok(())
            }
        }
    }

    async fn process_pipeline(
        self: &Arc<Self>,
        source: &EventSource,
        message: SourceMessage,
    ) -> Result<()> {
        let record: PipelineRecord =
            serde_json::from_value(message.event).context("Failed to parse pipeline record")?;

        let did = record.trigger_metadata.repo.did.clone();
        if did != self.config.owner && !self.db.is_known_did(&did).await? {
            warn!(source = %source.key, did = %did, "Dropping pipeline from unknown identity");
            return Ok(());
        }
        // Remember the knot so a restart resubscribes to it
        self.db.add_knot(&source.key, "").await?;

        let repo = DidSlashRepo::new(&did, &record.trigger_metadata.repo.repo)
            .map_err(|err| anyhow::anyhow!("invalid repo in trigger: {err}"))?;

        let pipeline_id = PipelineId::new(&source.key, &message.rkey);
        let compiled = compile(parse(record));

        for diagnostic in &compiled.diagnostics {
            match diagnostic.severity {
                Severity::Warning => warn!(
                    pipeline = %pipeline_id.at_uri(),
                    workflow = %diagnostic.workflow,
                    kind = ?diagnostic.kind,
                    "{}", diagnostic.message
                ),
                Severity::Error => error!(
                    pipeline = %pipeline_id.at_uri(),
                    workflow = %diagnostic.workflow,
                    kind = ?diagnostic.kind,
                    "{}", diagnostic.message
                ),
            }
        }

        info!(
            pipeline = %pipeline_id.at_uri(),
            workflows = compiled.workflows.len(),
            "Scheduling pipeline"
        );

        for workflow in &compiled.workflows {
            let wid = WorkflowId::new(pipeline_id.clone(), &workflow.name);

            let plan = match self.engine.init_workflow(workflow, &compiled.trigger).await {
                Ok(plan) => plan,
                Err(err) => {
                    self.write_status(&wid, StatusKind::Failed, Some(err.to_string()), Some(-1))
                        .await;
                    continue;
                }
            };

            self.write_status(&wid, StatusKind::Pending, None, None).await;

            let run_spindle = self.clone();
            let run_wid = wid.clone();
            let run_repo = repo.clone();
            let fail_spindle = self.clone();
            let fail_wid = wid.clone();
            let job = Job::new(
                wid.to_string(),
                async move {
                    run_spindle.run_workflow(run_wid, plan, run_repo).await;
                    Ok(())
                },
                move |err| {
                    Box::pin(async move {
                        fail_spindle
                            .write_status(
                                &fail_wid,
                                StatusKind::Failed,
                                Some(err.to_string()),
                                Some(-1),
                            )
                            .await;
                    })
                },
            );

            if !self.queue.enqueue(job) {
                warn!(workflow = %wid, "Execution queue full");
                self.write_status(
                    &wid,
                    StatusKind::Failed,
                    Some("execution queue full".to_string()),
                    Some(-1),
                )
                .await;
            }
        }

        Ok(())
    }

    /// Execute one workflow to its terminal status. Cleanup always runs,
    /// even when execution panics.
    pub async fn run_workflow(
        self: Arc<Self>,
        wid: WorkflowId,
        plan: EngineWorkflow,
        repo: DidSlashRepo,
    ) {
        self.write_status(&wid, StatusKind::Running, None, None).await;

        let outcome = AssertUnwindSafe(self.execute(&wid, &plan, &repo))
            .catch_unwind()
            .await;

        if let Err(err) = self.engine.destroy_workflow(&wid).await {
            error!(workflow = %wid, error = %err, "Failed to destroy workflow resources");
        }

        let (status, error, exit_code) = match outcome {
            Ok(terminal) => terminal,
            Err(_panic) => {
                error!(workflow = %wid, "Workflow execution panicked");
                (
                    StatusKind::Failed,
                    Some("workflow execution panicked".to_string()),
                    Some(-1),
                )
            }
        };
        self.write_status(&wid, status, error, exit_code).await;
    }

    async fn execute(
        &self,
        wid: &WorkflowId,
        plan: &EngineWorkflow,
        repo: &DidSlashRepo,
    ) -> (StatusKind, Option<String>, Option<i64>) {
        if let Err(err) = self.engine.setup_workflow(wid, plan).await {
            return (StatusKind::Failed, Some(err.to_string()), Some(-1));
        }
        if let Err(err) = self.engine.pull_image(wid, plan).await {
            return (StatusKind::Failed, Some(err.to_string()), Some(-1));
        }

        let logger: Arc<dyn StepLogger> =
            match WorkflowLogger::create(&self.config.log_dir, wid).await {
                Ok(logger) => Arc::new(logger),
                Err(err) => {
                    return (StatusKind::Failed, Some(err.to_string()), Some(-1));
                }
            };

        // One deadline for the whole workflow; the guard stays alive until
        // every step has returned
        let (ctx, _guard) = RunContext::with_timeout(self.engine.workflow_timeout());

        let secrets = match self.vault.secrets_unlocked(repo).await {
            Ok(secrets) => secrets,
            Err(err) => {
                warn!(workflow = %wid, error = %err, "Failed to fetch secrets, running without");
                Vec::new()
            }
        };

        for step_idx in 0..plan.steps.len() {
            match self
                .engine
                .run_step(&ctx, wid, plan, step_idx, &secrets, logger.clone())
                .await
            {
                Ok(()) => {}
                Err(EngineError::TimedOut) => {
                    return (
                        StatusKind::Timeout,
                        Some("workflow timed out".to_string()),
                        None,
                    );
                }
                Err(err @ EngineError::OomKilled) => {
                    return (StatusKind::Failed, Some(err.to_string()), Some(137));
                }
                Err(EngineError::WorkflowFailed { exit_code }) => {
                    return (
                        StatusKind::Failed,
                        Some(format!("exit status {exit_code}")),
                        Some(exit_code),
                    );
                }
                Err(err) => {
                    return (StatusKind::Failed, Some(err.to_string()), Some(-1));
                }
            }
        }

        (StatusKind::Success, None, None)
    }

    async fn write_status(
        &self,
        wid: &WorkflowId,
        status: StatusKind,
        error: Option<String>,
        exit_code: Option<i64>,
    ) {
        let mut event = StatusEvent::new(wid.pipeline.at_uri(), wid.name.clone(), status);
        if let Some(message) = error {
            event = event.with_error(message, exit_code);
        }

        match self.db.add_status_event(&event).await {
            Ok(_) => self.notifier.notify_all(),
            Err(err) => error!(workflow = %wid, error = %err, "Failed to write status event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use spindle_core::compile::CompiledWorkflow;
    use spindle_core::{LockedSecret, Secret, TriggerMetadata, VaultError};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Engine whose step results are scripted per workflow name
    #[derive(Default)]
    struct FakeEngine {
        step_results: Mutex<HashMap<String, Vec<Result<(), &'static str>>>>,
        destroys: AtomicUsize,
        setups: AtomicUsize,
    }

    impl FakeEngine {
        async fn script(&self, workflow: &str, results: Vec<Result<(), &'static str>>) {
            self.step_results
                .lock()
                .await
                .insert(workflow.to_string(), results);
        }
    }

    #[async_trait]
    impl WorkflowEngine for FakeEngine {
        async fn init_workflow(
            &self,
            compiled: &CompiledWorkflow,
            _trigger: &TriggerMetadata,
        ) -> Result<EngineWorkflow, EngineError> {
            Ok(EngineWorkflow {
                image: "test.image/shell".to_string(),
                steps: compiled.source.steps.iter().map(spindle_core::Step::user).collect(),
                environment: Default::default(),
            })
        }

        async fn setup_workflow(
            &self,
            _wid: &WorkflowId,
            _workflow: &EngineWorkflow,
        ) -> Result<(), EngineError> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn pull_image(
            &self,
            _wid: &WorkflowId,
            _workflow: &EngineWorkflow,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn workflow_timeout(&self) -> Duration {
            Duration::from_secs(10)
        }

        async fn run_step(
            &self,
            _ctx: &RunContext,
            wid: &WorkflowId,
            _workflow: &EngineWorkflow,
            step_idx: usize,
            _secrets: &[Secret],
            _logger: Arc<dyn StepLogger>,
        ) -> Result<(), EngineError> {
            let scripted = self.step_results.lock().await;
            match scripted.get(&wid.name).and_then(|s| s.get(step_idx)) {
                Some(Ok(())) | None => Ok(()),
                Some(Err("timeout")) => Err(EngineError::TimedOut),
                Some(Err("oom")) => Err(EngineError::OomKilled),
                Some(Err("panic")) => panic!("scripted panic"),
                Some(Err(other)) => Err(EngineError::failed(
                    other.parse().expect("scripted exit code"),
                )),
            }
        }

        async fn destroy_workflow(&self, _wid: &WorkflowId) -> Result<(), EngineError> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullVault;

    #[async_trait]
    impl Vault for NullVault {
        async fn add_secret(&self, _secret: Secret) -> Result<(), VaultError> {
            Ok(())
        }
        async fn remove_secret(&self, _repo: &DidSlashRepo, _key: &str) -> Result<(), VaultError> {
            Ok(())
        }
        async fn secrets_locked(
            &self,
            _repo: &DidSlashRepo,
        ) -> Result<Vec<LockedSecret>, VaultError> {
            Ok(Vec::new())
        }
        async fn secrets_unlocked(&self, _repo: &DidSlashRepo) -> Result<Vec<Secret>, VaultError> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        spindle: Arc<Spindle>,
        engine: Arc<FakeEngine>,
        db: Database,
        _log_dir: tempfile::TempDir,
    }

    async fn harness(queue_capacity: usize) -> Harness {
        let db = Database::in_memory().await.unwrap();
        let engine = Arc::new(FakeEngine::default());
        let log_dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JobQueue::new(queue_capacity));
        queue.start(2).await;

        let spindle = Spindle::new(
            db.clone(),
            engine.clone(),
            Arc::new(NullVault),
            Notifier::new(),
            queue,
            SpindleConfig {
                owner: "did:plc:owner".to_string(),
                log_dir: log_dir.path().to_path_buf(),
            },
        );
        Harness {
            spindle,
            engine,
            db,
            _log_dir: log_dir,
        }
    }

    fn pipeline_message(rkey: &str, did: &str) -> SourceMessage {
        SourceMessage {
            rkey: rkey.to_string(),
            nsid: nsid::PIPELINE.to_string(),
            created: 1,
            event: serde_json::json!({
                "triggerMetadata": {
                    "kind": "push",
                    "push": {"ref": "refs/heads/main", "oldSha": "a", "newSha": "b"},
                    "repo": {"knot": "knot.test", "did": did, "repo": "widget"}
                },
                "workflows": [{
                    "name": "build.yml",
                    "contents": "engine: nixery\nwhen:\n  - event: push\n    branch: [main]\nsteps:\n  - name: go\n    command: make\n"
                }]
            }),
        }
    }

    fn source() -> EventSource {
        EventSource::knot("knot.test")
    }

    async fn statuses(db: &Database) -> Vec<StatusKind> {
        db.get_events(0)
            .await
            .unwrap()
            .iter()
            .map(|row| {
                serde_json::from_str::<StatusEvent>(&row.event)
                    .unwrap()
                    .status
            })
            .collect()
    }

    async fn wait_for_terminal(db: &Database) -> Vec<StatusKind> {
        for _ in 0..50 {
            let seen = statuses(db).await;
            if seen.iter().any(|s| s.is_finish()) {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        statuses(db).await
    }

    #[tokio::test]
    async fn test_successful_pipeline_reaches_success() {
        let h = harness(16).await;
        h.spindle
            .process_message(&source(), pipeline_message("rk1", "did:plc:owner"))
            .await
            .unwrap();

        let seen = wait_for_terminal(&h.db).await;
        assert_eq!(
            seen,
            vec![StatusKind::Pending, StatusKind::Running, StatusKind::Success]
        );
        assert_eq!(h.engine.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_step_records_exit_code() {
        let h = harness(16).await;
        h.engine.script("build", vec![Err("2")]).await;
        h.spindle
            .process_message(&source(), pipeline_message("rk1", "did:plc:owner"))
            .await
            .unwrap();

        let seen = wait_for_terminal(&h.db).await;
        assert_eq!(*seen.last().unwrap(), StatusKind::Failed);

        let rows = h.db.get_events(0).await.unwrap();
        let last: StatusEvent = serde_json::from_str(&rows.last().unwrap().event).unwrap();
        assert_eq!(last.exit_code, Some(2));
        assert_eq!(last.error.as_deref(), Some("exit status 2"));

        // No event follows the finish state
        assert!(seen.iter().filter(|s| s.is_finish()).count() == 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_status() {
        let h = harness(16).await;
        h.engine.script("build", vec![Err("timeout")]).await;
        h.spindle
            .process_message(&source(), pipeline_message("rk1", "did:plc:owner"))
            .await
            .unwrap();

        let seen = wait_for_terminal(&h.db).await;
        assert_eq!(*seen.last().unwrap(), StatusKind::Timeout);
        assert_eq!(h.engine.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_still_destroys_and_fails() {
        let h = harness(16).await;
        h.engine.script("build", vec![Err("panic")]).await;
        h.spindle
            .process_message(&source(), pipeline_message("rk1", "did:plc:owner"))
            .await
            .unwrap();

        let seen = wait_for_terminal(&h.db).await;
        assert_eq!(*seen.last().unwrap(), StatusKind::Failed);
        assert_eq!(h.engine.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_identity_is_dropped() {
        let h = harness(16).await;
        h.spindle
            .process_message(&source(), pipeline_message("rk1", "did:plc:stranger"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(statuses(&h.db).await.is_empty());
        assert_eq!(h.engine.setups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_known_did_is_accepted() {
        let h = harness(16).await;
        h.db.add_known_did("did:plc:friend").await.unwrap();
        h.spindle
            .process_message(&source(), pipeline_message("rk1", "did:plc:friend"))
            .await
            .unwrap();

        let seen = wait_for_terminal(&h.db).await;
        assert_eq!(*seen.last().unwrap(), StatusKind::Success);
    }

    #[tokio::test]
    async fn test_full_queue_fails_the_workflow() {
        // Capacity 1 and no workers: the first enqueue occupies the slot
        let db = Database::in_memory().await.unwrap();
        let engine = Arc::new(FakeEngine::default());
        let log_dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JobQueue::new(1));
        queue.enqueue(Job::new("filler", async { Ok(()) }, |_| Box::pin(async {})));

        let spindle = Spindle::new(
            db.clone(),
            engine,
            Arc::new(NullVault),
            Notifier::new(),
            queue,
            SpindleConfig {
                owner: "did:plc:owner".to_string(),
                log_dir: log_dir.path().to_path_buf(),
            },
        );

        spindle
            .process_message(&source(), pipeline_message("rk1", "did:plc:owner"))
            .await
            .unwrap();

        let seen = statuses(&db).await;
        assert_eq!(seen, vec![StatusKind::Pending, StatusKind::Failed]);
        let rows = db.get_events(0).await.unwrap();
        let last: StatusEvent = serde_json::from_str(&rows.last().unwrap().event).unwrap();
        assert_eq!(last.error.as_deref(), Some("execution queue full"));
    }

    #[tokio::test]
    async fn test_notifier_pulses_on_status_writes() {
        let h = harness(16).await;
        let mut rx = h.spindle.notifier.subscribe();

        h.spindle
            .process_message(&source(), pipeline_message("rk1", "did:plc:owner"))
            .await
            .unwrap();
        wait_for_terminal(&h.db).await;

        // At least one pulse arrived; the re-query then sees all rows
        assert!(rx.try_recv().is_ok());
    }
}
