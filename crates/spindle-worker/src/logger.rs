// Per-workflow log file: newline-delimited JSON LogEntry records

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use spindle_core::traits::StepLogger;
use spindle_core::{LogEntry, LogStream, Step, StepStatus, WorkflowId};

/// Append-only NDJSON writer shared by the step runner and the log tailer
#[derive(Clone)]
pub struct WorkflowLogger {
    file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl WorkflowLogger {
    /// Create (or truncate) `<log_dir>/<workflow-id>.log`
    pub async fn create(log_dir: impl AsRef<Path>, wid: &WorkflowId) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        tokio::fs::create_dir_all(log_dir)
            .await
            .with_context(|| format!("Failed to create log dir {}", log_dir.display()))?;

        let path = log_dir.join(format!("{wid}.log"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open log file {}", path.display()))?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_entry(&self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StepLogger for WorkflowLogger {
    async fn data(&self, step_id: usize, stream: LogStream, content: &str) -> Result<()> {
        self.write_entry(&LogEntry::data(step_id, stream, content))
            .await
    }

    async fn control(&self, step_id: usize, step: &Step, status: StepStatus) -> Result<()> {
        self.write_entry(&LogEntry::control(step_id, step, status))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::PipelineId;

    fn wid() -> WorkflowId {
        WorkflowId::new(PipelineId::new("knot.test", "rkey1"), "build")
    }

    async fn read_entries(logger: &WorkflowLogger) -> Vec<LogEntry> {
        let contents = tokio::fs::read_to_string(logger.path()).await.unwrap();
        contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_log_file_name_is_workflow_id() {
        let dir = tempfile::tempdir().unwrap();
        let logger = WorkflowLogger::create(dir.path(), &wid()).await.unwrap();
        assert_eq!(
            logger.path().file_name().unwrap().to_str().unwrap(),
            "knot.test-rkey1-build.log"
        );
    }

    #[tokio::test]
    async fn test_data_lines_bracketed_by_control_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = WorkflowLogger::create(dir.path(), &wid()).await.unwrap();
        let step = Step::system("clone", "git init");

        logger.control(0, &step, StepStatus::Start).await.unwrap();
        logger.data(0, LogStream::Stdout, "Initialized").await.unwrap();
        logger.data(0, LogStream::Stderr, "hint: ...").await.unwrap();
        logger.control(0, &step, StepStatus::End).await.unwrap();

        let entries = read_entries(&logger).await;
        assert_eq!(entries.len(), 4);
        assert!(matches!(
            entries[0],
            LogEntry::Control {
                step_status: StepStatus::Start,
                ..
            }
        ));
        assert!(matches!(entries[1], LogEntry::Data { .. }));
        assert!(matches!(
            entries[3],
            LogEntry::Control {
                step_status: StepStatus::End,
                ..
            }
        ));
        assert!(entries.iter().all(|e| e.step_id() == 0));
    }

    #[tokio::test]
    async fn test_concurrent_writers_emit_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = WorkflowLogger::create(dir.path(), &wid()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let logger = logger.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..20 {
                    logger
                        .data(i, LogStream::Stdout, &format!("line {j}"))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every line parses: no interleaved partial writes
        assert_eq!(read_entries(&logger).await.len(), 200);
    }
}
