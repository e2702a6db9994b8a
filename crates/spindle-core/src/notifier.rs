// Fan-out "something changed" broadcaster
//
// Subscribers hold a capacity-1 channel. A pulse that finds the channel full
// is dropped; the subscriber is already due to re-query its cursor, so the
// dropped pulse carries no information it would miss.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<()>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer. Each pulse means "query the status store for
    /// deltas past your cursor".
    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .lock()
            .expect("notifier lock poisoned")
            .push(tx);
        rx
    }

    /// Pulse every live subscriber without blocking. Closed subscribers are
    /// pruned here.
    pub fn notify_all(&self) {
        self.subscribers
            .lock()
            .expect("notifier lock poisoned")
            .retain(|tx| match tx.try_send(()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("notifier lock poisoned")
            .len()
    }
}
