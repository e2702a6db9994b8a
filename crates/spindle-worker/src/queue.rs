// Bounded FIFO job queue with N worker tasks
//
// Enqueue is non-blocking: a full queue rejects the job and the caller
// decides what that means. Workers run jobs to completion; a failed job gets
// its on_fail callback. Stop aborts the workers; pending jobs are dropped
// (their source cursors never advanced, so the events re-deliver).

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct Job {
    /// Short label for logs
    pub name: String,
    pub run: BoxFuture<'static, anyhow::Result<()>>,
    pub on_fail: Box<dyn FnOnce(anyhow::Error) -> BoxFuture<'static, ()> + Send>,
}

impl Job {
    pub fn new<R, F>(name: impl Into<String>, run: R, on_fail: F) -> Self
    where
        R: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
        F: FnOnce(anyhow::Error) -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::pin(run),
            on_fail: Box::new(on_fail),
        }
    }
}

pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Try to queue a job. Returns false when the queue is full.
    pub fn enqueue(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                debug!(job = %job.name, "Job queue full, rejecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Spawn `count` worker tasks draining the queue
    pub async fn start(&self, count: usize) {
        let mut workers = self.workers.lock().await;
        for worker_id in 0..count {
            let rx = self.rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    // Hold the lock only for the dequeue itself
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else {
                        break;
                    };
                    debug!(worker_id, job = %job.name, "Running job");
                    if let Err(err) = job.run.await {
                        error!(worker_id, job = %job.name, error = %err, "Job failed");
                        (job.on_fail)(err).await;
                    }
                }
            }));
        }
        info!(count, "Started job queue workers");
    }

    /// Abort all workers; jobs still queued are dropped
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            handle.abort();
        }
        info!("Stopped job queue workers");
    }
}
