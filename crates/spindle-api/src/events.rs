// Status event streaming (SSE)
//
// Subscribers replay the events table from their cursor, then follow
// notifier pulses. A pulse only means "re-query"; the rows themselves are
// the source of truth, so dropped pulses are harmless.

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, Stream};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;

use spindle_core::Notifier;
use spindle_storage::{Database, EventRow};

/// How long to sit idle before re-querying anyway
const IDLE_POLL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub notifier: Notifier,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/events", get(stream_events))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    /// Replay starts after this `created` value (exclusive)
    #[serde(default)]
    pub cursor: i64,
}

/// (SSE id, payload) pairs for one query batch
fn event_payloads(rows: &[EventRow]) -> Vec<(String, String)> {
    rows.iter()
        .map(|row| (row.created.to_string(), row.event.clone()))
        .collect()
}

/// GET /events?cursor= - stream status events
#[utoipa::path(
    get,
    path = "/events",
    params(("cursor" = Option<i64>, Query, description = "Replay events created after this value")),
    responses((status = 200, description = "Status event stream", content_type = "text/event-stream")),
    tag = "events"
)]
pub async fn stream_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    tracing::debug!(cursor = params.cursor, "Starting status event stream");
    let pulses = state.notifier.subscribe();

    struct StreamState {
        cursor: i64,
        pulses: mpsc::Receiver<()>,
        db: Database,
    }

    let stream = stream::unfold(
        StreamState {
            cursor: params.cursor,
            pulses,
            db: state.db,
        },
        |mut st| async move {
            loop {
                match st.db.get_events(st.cursor).await {
                    Ok(rows) if !rows.is_empty() => {
                        st.cursor = rows.last().map(|row| row.created).unwrap_or(st.cursor);
                        let events: Vec<Result<SseEvent, Infallible>> = event_payloads(&rows)
                            .into_iter()
                            .map(|(id, data)| {
                                Ok(SseEvent::default().event("status").id(id).data(data))
                            })
                            .collect();
                        return Some((stream::iter(events), st));
                    }
                    Ok(_) => {
                        // Nothing new; wait for a pulse (or the idle poll)
                        tokio::select! {
                            _ = st.pulses.recv() => {}
                            _ = tokio::time::sleep(IDLE_POLL) => {}
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to query status events");
                        return None;
                    }
                }
            }
        },
    )
    .flatten();

    Sse::new(stream).keep_alive(KeepAlive::default())
}
