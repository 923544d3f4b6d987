//! Server-Sent Events stream fed by the agent monitor.

use std::convert::Infallible;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use autoapply::io::monitor::AgentEvent;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::state::AppState;

/// Event name used for every monitor event.
const AGENT_EVENT: &str = "agent";

/// SSE endpoint handler.
///
/// Sends a `snapshot` event first so a client can render without polling,
/// then one `agent` event per monitor event.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();
    let snapshot = state.monitor.snapshot();

    let stream = async_stream::stream! {
        if let Some(event) = json_event("snapshot", &snapshot) {
            yield Ok(event);
        }

        loop {
            match rx.recv().await {
                Ok(agent_event) => {
                    if let Some(event) = json_event(AGENT_EVENT, &agent_event) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Option<Event> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Event::default().event(name).data(json)),
        Err(err) => {
            warn!(error = %err, "failed to serialize SSE payload");
            None
        }
    }
}

/// Forward monitor events into the broadcast channel.
///
/// The monitor delivers on a blocking channel, so the bridge runs on its own
/// thread and exits once every publisher is gone.
pub fn start_event_bridge(events: Receiver<AgentEvent>, tx: broadcast::Sender<AgentEvent>) {
    let spawned = thread::Builder::new()
        .name("sse-bridge".to_string())
        .spawn(move || forward_events(&events, &tx));
    if let Err(err) = spawned {
        warn!(error = %err, "failed to start SSE bridge; /events will stay quiet");
    }
}

fn forward_events(events: &Receiver<AgentEvent>, tx: &broadcast::Sender<AgentEvent>) {
    for event in events {
        // No subscribers is not an error; the event is simply dropped.
        if tx.send(event).is_err() {
            debug!("no SSE clients connected");
        }
    }
}
