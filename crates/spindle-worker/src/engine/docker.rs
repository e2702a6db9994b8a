// Docker-backed workflow engine
//
// Each workflow owns a workspace volume, a dependency-cache volume and an
// isolated bridge network; each step runs as one container attached to that
// network. Cleanup closures are registered at setup and drained LIFO on
// destroy. Container removal is mandatory on every exit path.

use anyhow::Context;
use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig, NetworkCreateRequest};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    KillContainerOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    RemoveVolumeOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use spindle_core::traits::{EngineWorkflow, RunContext, StepLogger, WorkflowEngine};
use spindle_core::{
    CompiledWorkflow, EngineError, LogStream, Secret, StepStatus, TriggerMetadata, WorkflowId,
};

use super::steps::{compose_steps, resolve_image, CACHE_DIR, DEV_HOST_ALIAS, WORKSPACE_DIR};

/// Engine name workflows select in their `engine:` field
const ENGINE_NAME: &str = "nixery";

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

#[derive(Debug, Clone)]
pub struct DockerEngineConfig {
    pub nixery_host: String,
    pub workflow_timeout: Duration,
    pub dev: bool,
}

impl Default for DockerEngineConfig {
    fn default() -> Self {
        Self {
            nixery_host: "nixery.dev".to_string(),
            workflow_timeout: Duration::from_secs(300),
            dev: false,
        }
    }
}

pub struct DockerEngine {
    docker: Docker,
    config: DockerEngineConfig,
    /// Registered cleanup closures per workflow, drained LIFO on destroy
    cleanups: Mutex<HashMap<String, Vec<CleanupFn>>>,
}

impl DockerEngine {
    pub fn new(config: DockerEngineConfig) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to docker daemon")?;
        Ok(Self {
            docker,
            config,
            cleanups: Mutex::new(HashMap::new()),
        })
    }

    async fn register_cleanup(&self, wid: &WorkflowId, cleanup: CleanupFn) {
        self.cleanups
            .lock()
            .await
            .entry(wid.to_string())
            .or_default()
            .push(cleanup);
    }

    fn workspace_volume(wid: &WorkflowId) -> String {
        format!("{wid}-workspace")
    }

    fn cache_volume(wid: &WorkflowId) -> String {
        format!("{wid}-cache")
    }

    fn network_name(wid: &WorkflowId) -> String {
        format!("{wid}-net")
    }

    async fn create_volume(&self, wid: &WorkflowId, name: String) -> Result<(), EngineError> {
        self.docker
            .create_volume(bollard::models::VolumeCreateOptions {
                name: Some(name.clone()),
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to create volume {name}"))?;

        let docker = self.docker.clone();
        self.register_cleanup(
            wid,
            Box::new(move || {
                Box::pin(async move {
                    docker
                        .remove_volume(&name, None::<RemoveVolumeOptions>)
                        .await
                        .with_context(|| format!("Failed to remove volume {name}"))
                })
            }),
        )
        .await;
        Ok(())
    }

    async fn create_network(&self, wid: &WorkflowId) -> Result<(), EngineError> {
        let name = Self::network_name(wid);
        self.docker
            .create_network(NetworkCreateRequest {
                name: name.clone(),
                driver: Some("bridge".to_string()),
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to create network {name}"))?;

        let docker = self.docker.clone();
        self.register_cleanup(
            wid,
            Box::new(move || {
                Box::pin(async move {
                    docker
                        .remove_network(&name)
                        .await
                        .with_context(|| format!("Failed to remove network {name}"))
                })
            }),
        )
        .await;
        Ok(())
    }

    /// Run the container to completion and classify the outcome. The caller
    /// removes the container.
    async fn drive_container(
        &self,
        ctx: &RunContext,
        container_id: &str,
        step_id: usize,
        logger: Arc<dyn StepLogger>,
    ) -> Result<(), EngineError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .context("Failed to start step container")?;

        // Tail stdout/stderr into the workflow log; the stream ends when the
        // container exits (or we kill it)
        let tail_docker = self.docker.clone();
        let tail_container = container_id.to_string();
        let tail_ctx = ctx.clone();
        let tail = tokio::spawn(async move {
            let stream = tail_docker.logs(
                &tail_container,
                Some(
                    LogsOptionsBuilder::default()
                        .follow(true)
                        .stdout(true)
                        .stderr(true)
                        .build(),
                ),
            );
            tail_logs(stream, step_id, logger, tail_ctx).await;
        });

        let mut wait_stream = std::pin::pin!(self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions>));

        let wait_outcome = tokio::select! {
            _ = ctx.done() => {
                warn!(container = container_id, "Deadline fired, killing step container");
                let kill = self
                    .docker
                    .kill_container(
                        container_id,
                        Some(KillContainerOptionsBuilder::default().signal("SIGKILL").build()),
                    )
                    .await;
                if let Err(err) = kill {
                    error!(container = container_id, error = %err, "Failed to kill container");
                }
                // Let the daemon settle and the tail drain before reporting
                let _ = wait_stream.next().await;
                let _ = tail.await;
                return Err(EngineError::TimedOut);
            }
            outcome = wait_stream.next() => outcome,
        };
        let _ = tail.await;

        let status_code = match wait_outcome {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(err)) => return Err(EngineError::Other(err.into())),
            None => {
                return Err(EngineError::Other(anyhow::anyhow!(
                    "wait stream ended without a status"
                )))
            }
        };

        // OOM kills surface through inspect, not the wait status
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect step container")?;
        if let Some(state) = &inspect.state {
            if state.oom_killed == Some(true) {
                return Err(EngineError::OomKilled);
            }
        }

        if status_code != 0 {
            return Err(EngineError::failed(status_code));
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) {
        let result = self
            .docker
            .remove_container(
                container_id,
                Some(
                    RemoveContainerOptionsBuilder::default()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await;
        if let Err(err) = result {
            error!(container = container_id, error = %err, "Failed to remove step container");
        }
    }
}

#[async_trait]
impl WorkflowEngine for DockerEngine {
    async fn init_workflow(
        &self,
        compiled: &CompiledWorkflow,
        trigger: &TriggerMetadata,
    ) -> Result<EngineWorkflow, EngineError> {
        if compiled.engine != ENGINE_NAME {
            return Err(EngineError::Other(anyhow::anyhow!(
                "unknown engine {:?}, this spindle provides {:?}",
                compiled.engine,
                ENGINE_NAME
            )));
        }

        Ok(EngineWorkflow {
            image: resolve_image(&self.config.nixery_host, &compiled.source),
            steps: compose_steps(&compiled.source, trigger, self.config.dev),
            environment: compiled.source.environment.clone(),
        })
    }

    async fn setup_workflow(
        &self,
        wid: &WorkflowId,
        _workflow: &EngineWorkflow,
    ) -> Result<(), EngineError> {
        debug!(workflow = %wid, "Setting up workflow resources");
        self.create_volume(wid, Self::workspace_volume(wid)).await?;
        self.create_volume(wid, Self::cache_volume(wid)).await?;
        self.create_network(wid).await?;
        Ok(())
    }

    async fn pull_image(
        &self,
        wid: &WorkflowId,
        workflow: &EngineWorkflow,
    ) -> Result<(), EngineError> {
        info!(workflow = %wid, image = %workflow.image, "Pulling base image");
        let mut stream = std::pin::pin!(self.docker.create_image(
            Some(
                CreateImageOptionsBuilder::default()
                    .from_image(&workflow.image)
                    .build(),
            ),
            None,
            None,
        ));
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("Failed to pull image {}", workflow.image))?;
        }
        Ok(())
    }

    fn workflow_timeout(&self) -> Duration {
        self.config.workflow_timeout
    }

    async fn run_step(
        &self,
        ctx: &RunContext,
        wid: &WorkflowId,
        workflow: &EngineWorkflow,
        step_idx: usize,
        secrets: &[Secret],
        logger: Arc<dyn StepLogger>,
    ) -> Result<(), EngineError> {
        let step = workflow.steps.get(step_idx).ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!("step index {step_idx} out of range"))
        })?;

        // Workflow env, overlaid by step env, then secrets and HOME
        let mut env = workflow.environment.clone();
        env.extend(step.environment.clone());
        for secret in secrets {
            env.insert(secret.key.clone(), secret.value.clone());
        }
        env.insert("HOME".to_string(), WORKSPACE_DIR.to_string());
        env.insert("XDG_CACHE_HOME".to_string(), CACHE_DIR.to_string());
        let env: Vec<String> = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();

        let host_config = HostConfig {
            binds: Some(vec![
                format!("{}:{WORKSPACE_DIR}", Self::workspace_volume(wid)),
                format!("{}:{CACHE_DIR}", Self::cache_volume(wid)),
            ]),
            network_mode: Some(Self::network_name(wid)),
            extra_hosts: self
                .config
                .dev
                .then(|| vec![format!("{DEV_HOST_ALIAS}:host-gateway")]),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(workflow.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                step.command.clone(),
            ]),
            env: Some(env),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::default()
                        .name(&format!("{wid}-step-{step_idx}"))
                        .build(),
                ),
                body,
            )
            .await
            .context("Failed to create step container")?;

        info!(workflow = %wid, step = %step.name, container = %container.id, "Running step");
        logger
            .control(step_idx, step, StepStatus::Start)
            .await
            .map_err(EngineError::Other)?;

        let outcome = self
            .drive_container(ctx, &container.id, step_idx, logger.clone())
            .await;

        if let Err(err) = logger.control(step_idx, step, StepStatus::End).await {
            warn!(workflow = %wid, error = %err, "Failed to write control line");
        }
        self.remove_container(&container.id).await;

        outcome
    }

    async fn destroy_workflow(&self, wid: &WorkflowId) -> Result<(), EngineError> {
        let Some(cleanups) = self.cleanups.lock().await.remove(&wid.to_string()) else {
            debug!(workflow = %wid, "Nothing to destroy");
            return Ok(());
        };

        info!(workflow = %wid, count = cleanups.len(), "Destroying workflow resources");
        for cleanup in cleanups.into_iter().rev() {
            if let Err(err) = cleanup().await {
                error!(workflow = %wid, error = %err, "Cleanup step failed");
            }
        }
        Ok(())
    }
}

/// Copy container output into the workflow log, one data line per output
/// line. Observes the run context so a hung log endpoint cannot outlive the
/// workflow deadline.
async fn tail_logs<S>(stream: S, step_id: usize, logger: Arc<dyn StepLogger>, ctx: RunContext)
where
    S: futures::Stream<Item = Result<bollard::container::LogOutput, bollard::errors::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    loop {
        let chunk = tokio::select! {
            _ = ctx.done() => break,
            chunk = stream.next() => chunk,
        };
        let output = match chunk {
            Some(Ok(output)) => output,
            Some(Err(err)) => {
                warn!(error = %err, "Log tail error");
                break;
            }
            None => break,
        };

        let (stream_kind, bytes) = match output {
            bollard::container::LogOutput::StdOut { message } => (LogStream::Stdout, message),
            bollard::container::LogOutput::StdErr { message } => (LogStream::Stderr, message),
            _ => continue,
        };

        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            if let Err(err) = logger.data(step_id, stream_kind, line).await {
                warn!(error = %err, "Failed to write log line");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::compile::CompiledWorkflow;
    use spindle_core::{CloneOpts, PipelineId, StepKind, TriggerKind, TriggerRepo, WorkflowSource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> DockerEngine {
        DockerEngine::new(DockerEngineConfig {
            nixery_host: "nixery.dev".to_string(),
            workflow_timeout: Duration::from_secs(300),
            dev: false,
        })
        .unwrap()
    }

    fn compiled(engine_name: &str) -> CompiledWorkflow {
        let source = WorkflowSource::from_yaml(
            "engine: nixery\nsteps:\n  - name: build\n    command: make\n",
        )
        .unwrap();
        CompiledWorkflow {
            name: "build".to_string(),
            engine: engine_name.to_string(),
            clone_opts: CloneOpts::default(),
            source,
        }
    }

    fn trigger() -> TriggerMetadata {
        TriggerMetadata {
            kind: TriggerKind::Manual,
            push: None,
            pull_request: None,
            manual: None,
            repo: TriggerRepo {
                knot: "knot.example.com".to_string(),
                did: "did:plc:abc".to_string(),
                repo: "widget".to_string(),
            },
        }
    }

    fn wid() -> WorkflowId {
        WorkflowId::new(PipelineId::new("knot.example.com", "rk"), "build")
    }

    #[tokio::test]
    async fn test_init_workflow_composes_plan() {
        let engine = engine();
        let plan = engine.init_workflow(&compiled("nixery"), &trigger()).await.unwrap();
        assert_eq!(plan.image, "nixery.dev/shell/git");
        // nix config + clone + one user step
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].kind, StepKind::System);
        assert_eq!(plan.steps[2].kind, StepKind::User);
        assert_eq!(plan.steps[2].command, "make");
    }

    #[tokio::test]
    async fn test_init_workflow_rejects_unknown_engine() {
        let engine = engine();
        let result = engine.init_workflow(&compiled("buildkit"), &trigger()).await;
        assert!(matches!(result, Err(EngineError::Other(_))));
    }

    #[tokio::test]
    async fn test_destroy_drains_lifo_and_is_idempotent() {
        let engine = engine();
        let wid = wid();
        let order = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        for tag in ["workspace", "cache", "network"] {
            let order = order.clone();
            let calls = calls.clone();
            engine
                .register_cleanup(
                    &wid,
                    Box::new(move || {
                        Box::pin(async move {
                            order.lock().await.push(tag);
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                    }),
                )
                .await;
        }

        engine.destroy_workflow(&wid).await.unwrap();
        assert_eq!(*order.lock().await, vec!["network", "cache", "workspace"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Second call is a no-op
        engine.destroy_workflow(&wid).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cleanup_errors_do_not_abort_the_rest() {
        let engine = engine();
        let wid = wid();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        engine
            .register_cleanup(
                &wid,
                Box::new(move || {
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .await;
        engine
            .register_cleanup(
                &wid,
                Box::new(|| Box::pin(async { anyhow::bail!("volume busy") })),
            )
            .await;

        engine.destroy_workflow(&wid).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resource_names_derive_from_workflow_id() {
        let wid = wid();
        assert_eq!(
            DockerEngine::workspace_volume(&wid),
            "knot.example.com-rk-build-workspace"
        );
        assert_eq!(DockerEngine::cache_volume(&wid), "knot.example.com-rk-build-cache");
        assert_eq!(DockerEngine::network_name(&wid), "knot.example.com-rk-build-net");
    }
}
