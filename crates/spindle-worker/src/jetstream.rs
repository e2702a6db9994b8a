// Jetstream firehose ingestion for spindle membership
//
// The spindle only cares about one collection on the firehose: the owner's
// sh.tangled.spindle.member records. Creates add a member (and a known DID),
// deletes remove the member by rkey. Everything else is skipped.

use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use spindle_core::nsid;
use spindle_core::traits::CursorStore;
use spindle_storage::Database;

use crate::consumer::{backoff_delay, ConsumerConfig};

const CURSOR_KEY: &str = "jetstream";

#[derive(Debug, Deserialize)]
pub struct JetstreamEvent {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    #[serde(default)]
    pub commit: Option<JetstreamCommit>,
}

#[derive(Debug, Deserialize)]
pub struct JetstreamCommit {
    pub operation: String,
    pub collection: String,
    pub rkey: String,
    #[serde(default)]
    pub record: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MemberRecord {
    subject: String,
}

pub struct JetstreamIngester {
    endpoint: String,
    owner: String,
    db: Database,
    cursors: Arc<dyn CursorStore>,
    backoff: ConsumerConfig,
    shutdown: watch::Sender<bool>,
}

impl JetstreamIngester {
    pub fn new(
        endpoint: impl Into<String>,
        owner: impl Into<String>,
        db: Database,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            endpoint: endpoint.into(),
            owner: owner.into(),
            db,
            cursors,
            backoff: ConsumerConfig::default(),
            shutdown,
        }
    }

    fn subscribe_url(&self, cursor: Option<i64>) -> String {
        let mut url = format!(
            "{}?wantedCollections={}&wantedDids={}",
            self.endpoint,
            nsid::SPINDLE_MEMBER,
            self.owner
        );
        if let Some(cursor) = cursor {
            url.push_str(&format!("&cursor={cursor}"));
        }
        url
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let cursor = self.cursors.get(CURSOR_KEY).await.ok().flatten();
                match connect_async(self.subscribe_url(cursor)).await {
                    Ok((mut stream, _)) => {
                        info!(cursor = ?cursor, "Connected to jetstream");
                        attempt = 0;

                        loop {
                            let message = tokio::select! {
                                _ = shutdown.changed() => return,
                                message = stream.next() => message,
                            };
                            let text = match message {
                                Some(Ok(Message::Text(text))) => text,
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => continue,
                                Some(Err(err)) => {
                                    warn!(error = %err, "Jetstream stream error");
                                    break;
                                }
                            };
                            match serde_json::from_str::<JetstreamEvent>(text.as_str()) {
                                Ok(event) => {
                                    let time_us = event.time_us;
                                    if let Err(err) = self.apply(event).await {
                                        warn!(error = %err, "Failed to apply jetstream event");
                                        continue;
                                    }
                                    if let Err(err) = self.cursors.set(CURSOR_KEY, time_us).await {
                                        warn!(error = %err, "Failed to persist jetstream cursor");
                                    }
                                }
                                Err(err) => {
                                    debug!(error = %err, "Skipping unparseable jetstream frame");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "Failed to connect to jetstream");
                    }
                }

                let delay = backoff_delay(&self.backoff, attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Apply one firehose event to the membership tables. Only the owner's
    /// member records are honored.
    async fn apply(&self, event: JetstreamEvent) -> anyhow::Result<()> {
        if event.kind != "commit" {
            return Ok(());
        }
        let Some(commit) = event.commit else {
            return Ok(());
        };
        if commit.collection != nsid::SPINDLE_MEMBER || event.did != self.owner {
            return Ok(());
        }

        match commit.operation.as_str() {
            "create" | "update" => {
                let Some(record) = commit.record else {
                    return Ok(());
                };
                let member: MemberRecord = serde_json::from_value(record)?;
                info!(member = %member.subject, "Adding spindle member");
                self.db
                    .add_member(&member.subject, &event.did, &commit.rkey)
                    .await?;
            }
            "delete" => {
                if self.db.remove_member_by_rkey(&commit.rkey).await? {
                    info!(rkey = %commit.rkey, "Removed spindle member");
                }
            }
            other => {
                debug!(operation = other, "Ignoring jetstream operation");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member_event(did: &str, operation: &str, rkey: &str, subject: Option<&str>) -> JetstreamEvent {
        JetstreamEvent {
            did: did.to_string(),
            time_us: 1,
            kind: "commit".to_string(),
            commit: Some(JetstreamCommit {
                operation: operation.to_string(),
                collection: nsid::SPINDLE_MEMBER.to_string(),
                rkey: rkey.to_string(),
                record: subject.map(|s| serde_json::json!({"subject": s})),
            }),
        }
    }

    async fn ingester() -> (Arc<JetstreamIngester>, Database) {
        let db = Database::in_memory().await.unwrap();
        let cursors: Arc<dyn CursorStore> = Arc::new(db.clone());
        let ingester = Arc::new(JetstreamIngester::new(
            "wss://jetstream.test/subscribe",
            "did:plc:owner",
            db.clone(),
            cursors,
        ));
        (ingester, db)
    }

    #[tokio::test]
    async fn test_create_adds_member_and_known_did() {
        let (ingester, db) = ingester().await;
        ingester
            .apply(member_event("did:plc:owner", "create", "rk1", Some("did:plc:alice")))
            .await
            .unwrap();

        assert!(db.is_member("did:plc:alice").await.unwrap());
        assert!(db.is_known_did("did:plc:alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_member_by_rkey() {
        let (ingester, db) = ingester().await;
        ingester
            .apply(member_event("did:plc:owner", "create", "rk1", Some("did:plc:alice")))
            .await
            .unwrap();
        ingester
            .apply(member_event("did:plc:owner", "delete", "rk1", None))
            .await
            .unwrap();

        assert!(!db.is_member("did:plc:alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_did_records_are_ignored() {
        let (ingester, db) = ingester().await;
        ingester
            .apply(member_event("did:plc:mallory", "create", "rk1", Some("did:plc:eve")))
            .await
            .unwrap();

        assert!(!db.is_member("did:plc:eve").await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_url_shape() {
        let (ingester, _) = ingester().await;
        assert_eq!(
            ingester.subscribe_url(Some(99)),
            "wss://jetstream.test/subscribe?wantedCollections=sh.tangled.spindle.member&wantedDids=did:plc:owner&cursor=99"
        );
    }

    #[test]
    fn test_jetstream_frame_parses() {
        let frame = serde_json::json!({
            "did": "did:plc:owner",
            "time_us": 1725911162329308i64,
            "kind": "commit",
            "commit": {
                "rev": "3l3qo2vutsw2b",
                "operation": "create",
                "collection": "sh.tangled.spindle.member",
                "rkey": "3l3qo2vuowo2b",
                "record": {
                    "$type": "sh.tangled.spindle.member",
                    "subject": "did:plc:alice",
                    "createdAt": "2026-07-01T00:00:00Z"
                }
            }
        });
        let event: JetstreamEvent = serde_json::from_value(frame).unwrap();
        let commit = event.commit.unwrap();
        assert_eq!(commit.operation, "create");
        assert_eq!(commit.collection, nsid::SPINDLE_MEMBER);
    }
}
