// Event consumer: one websocket subscription per upstream source
//
// Each source gets a long-running task that connects, reads messages in
// order, hands them to the process function and persists the cursor after
// each success. Disconnects back off exponentially with jitter and resume
// from the persisted cursor, so delivery is at-least-once: a message whose
// processing failed is re-delivered on the next connection.

use futures::future::BoxFuture;
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use spindle_core::traits::CursorStore;

/// An upstream event source; the key identifies it in the cursor store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    /// Stable identifier, normally the knot hostname
    pub key: String,
    /// Websocket authority (host or host:port)
    pub endpoint: String,
}

impl EventSource {
    pub fn knot(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            endpoint: hostname.clone(),
            key: hostname,
        }
    }

    fn ws_url(&self, dev: bool, cursor: Option<i64>) -> String {
        let scheme = if dev { "ws" } else { "wss" };
        match cursor {
            Some(cursor) => format!("{scheme}://{}/events?cursor={cursor}", self.endpoint),
            None => format!("{scheme}://{}/events", self.endpoint),
        }
    }
}

/// One inbound message off a source stream
#[derive(Debug, Clone, Deserialize)]
pub struct SourceMessage {
    pub rkey: String,
    pub nsid: String,
    /// JSON document whose shape depends on nsid
    pub event: serde_json::Value,
    /// Source-side unix nanos; doubles as the resume cursor
    pub created: i64,
}

pub type ProcessFunc =
    Arc<dyn Fn(EventSource, SourceMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Use ws:// instead of wss://
    pub dev: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on cross-source concurrent message handling
    pub workers: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            dev: false,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            workers: 10,
        }
    }
}

pub struct EventConsumer {
    config: ConsumerConfig,
    cursors: Arc<dyn CursorStore>,
    process: ProcessFunc,
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscribed: Mutex<HashSet<String>>,
}

impl EventConsumer {
    pub fn new(config: ConsumerConfig, cursors: Arc<dyn CursorStore>, process: ProcessFunc) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            cursors,
            process,
            permits,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    /// Register a source and spin up its subscription task. Adding a source
    /// twice is a no-op.
    pub async fn add_source(&self, source: EventSource) {
        if !self.subscribed.lock().await.insert(source.key.clone()) {
            debug!(source = %source.key, "Source already subscribed");
            return;
        }

        info!(source = %source.key, "Subscribing to event source");
        let task = run_source(
            source,
            self.config.clone(),
            self.cursors.clone(),
            self.process.clone(),
            self.permits.clone(),
            self.shutdown.subscribe(),
        );
        self.tasks.lock().await.push(tokio::spawn(task));
    }

    /// Launch all given sources concurrently
    pub async fn start(&self, sources: Vec<EventSource>) {
        for source in sources {
            self.add_source(source).await;
        }
    }

    /// Signal all source tasks to exit
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Event consumer stopped");
    }
}

/// Exponential backoff with a cap and up to one initial-interval of jitter
pub(crate) fn backoff_delay(config: &ConsumerConfig, attempt: u32) -> Duration {
    let exp = config
        .initial_backoff
        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(config.max_backoff);
    let jitter_ms = rand::thread_rng().gen_range(0..=config.initial_backoff.as_millis() as u64);
    capped + Duration::from_millis(jitter_ms)
}

async fn run_source(
    source: EventSource,
    config: ConsumerConfig,
    cursors: Arc<dyn CursorStore>,
    process: ProcessFunc,
    permits: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let cursor = match cursors.get(&source.key).await {
            Ok(cursor) => cursor,
            Err(err) => {
                error!(source = %source.key, error = %err, "Failed to load cursor");
                None
            }
        };
        let url = source.ws_url(config.dev, cursor);

        match connect_async(url).await {
            Ok((mut stream, _)) => {
                info!(source = %source.key, cursor = ?cursor, "Connected to event source");
                attempt = 0;

                loop {
                    let message = tokio::select! {
                        _ = shutdown.changed() => return,
                        message = stream.next() => message,
                    };

                    let message = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            info!(source = %source.key, "Event stream closed");
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!(source = %source.key, error = %err, "Event stream error");
                            break;
                        }
                    };

                    let parsed: SourceMessage = match serde_json::from_str(message.as_str()) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            warn!(source = %source.key, error = %err, "Skipping unparseable message");
                            continue;
                        }
                    };

                    // Sequential per source; the semaphore only bounds how
                    // many sources process at once
                    let _permit = match permits.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let created = parsed.created;
                    match (process)(source.clone(), parsed).await {
                        Ok(()) => {
                            if let Err(err) = cursors.set(&source.key, created).await {
                                error!(source = %source.key, error = %err, "Failed to persist cursor");
                            }
                        }
                        Err(err) => {
                            // Cursor stays put; the message re-delivers on
                            // the next connection
                            error!(source = %source.key, error = %err, "Failed to process message");
                        }
                    }
                }
            }
            Err(err) => {
                warn!(source = %source.key, error = %err, "Failed to connect to event source");
            }
        }

        let delay = backoff_delay(&config, attempt);
        attempt = attempt.saturating_add(1);
        debug!(source = %source.key, attempt, delay = ?delay, "Reconnecting after backoff");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::SinkExt;
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct MemoryCursors {
        inner: std::sync::Mutex<HashMap<String, i64>>,
    }

    #[async_trait]
    impl CursorStore for MemoryCursors {
        async fn get(&self, source: &str) -> anyhow::Result<Option<i64>> {
            Ok(self.inner.lock().unwrap().get(source).copied())
        }

        async fn set(&self, source: &str, cursor: i64) -> anyhow::Result<()> {
            self.inner.lock().unwrap().insert(source.to_string(), cursor);
            Ok(())
        }
    }

    fn message_json(rkey: &str, created: i64) -> String {
        serde_json::json!({
            "rkey": rkey,
            "nsid": "sh.tangled.spindle.pipeline",
            "event": {},
            "created": created
        })
        .to_string()
    }

    /// One-shot ws server that sends the given frames and closes
    async fn serve_once(messages: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            for message in messages {
                ws.send(Message::text(message)).await.unwrap();
            }
            let _ = ws.close(None).await;
        });
        addr.to_string()
    }

    fn test_config() -> ConsumerConfig {
        ConsumerConfig {
            dev: true,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            workers: 4,
        }
    }

    #[tokio::test]
    async fn test_messages_processed_in_order_and_cursor_advances() {
        let endpoint = serve_once(vec![message_json("a", 100), message_json("b", 200)]).await;
        let cursors = Arc::new(MemoryCursors::default());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let process: ProcessFunc = Arc::new(move |_source, message| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(message.rkey);
                Ok(())
            })
        });

        let consumer = EventConsumer::new(test_config(), cursors.clone(), process);
        consumer
            .add_source(EventSource {
                key: "test-knot".to_string(),
                endpoint,
            })
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        consumer.stop().await;

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(cursors.get("test-knot").await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn test_failed_message_does_not_advance_cursor() {
        let endpoint = serve_once(vec![message_json("ok", 100), message_json("bad", 200)]).await;
        let cursors = Arc::new(MemoryCursors::default());

        let process: ProcessFunc = Arc::new(|_source, message| {
            Box::pin(async move {
                if message.rkey == "bad" {
                    anyhow::bail!("processing failed");
                }
                Ok(())
            })
        });

        let consumer = EventConsumer::new(test_config(), cursors.clone(), process);
        consumer
            .add_source(EventSource {
                key: "test-knot".to_string(),
                endpoint,
            })
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        consumer.stop().await;

        // Cursor stopped at the last success
        assert_eq!(cursors.get("test-knot").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_duplicate_source_is_not_subscribed_twice() {
        let cursors = Arc::new(MemoryCursors::default());
        let process: ProcessFunc = Arc::new(|_, _| Box::pin(async { Ok(()) }));

        let consumer = EventConsumer::new(test_config(), cursors, process);
        let source = EventSource {
            key: "dup".to_string(),
            // Nothing listens here; the task just backs off
            endpoint: "127.0.0.1:1".to_string(),
        };
        consumer.add_source(source.clone()).await;
        consumer.add_source(source).await;

        assert_eq!(consumer.tasks.lock().await.len(), 1);
        consumer.stop().await;
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ConsumerConfig {
            dev: false,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            workers: 1,
        };
        // Jitter adds at most one initial interval
        assert!(backoff_delay(&config, 0) <= Duration::from_secs(2));
        assert!(backoff_delay(&config, 3) >= Duration::from_secs(8));
        assert!(backoff_delay(&config, 30) <= Duration::from_secs(61));
    }

    #[test]
    fn test_ws_url_carries_cursor() {
        let source = EventSource::knot("knot.example.com");
        assert_eq!(
            source.ws_url(false, Some(42)),
            "wss://knot.example.com/events?cursor=42"
        );
        assert_eq!(source.ws_url(true, None), "ws://knot.example.com/events");
    }
}
