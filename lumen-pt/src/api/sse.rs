//! Server-Sent Events (SSE) for progress updates

use crate::AppState;
use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Optional per-user filter
#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    pub user_id: Option<String>,
}

/// GET /api/events - SSE event stream for progress updates
///
/// Streams every progress event, or only one user's with `?user_id=`.
pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(
        "New SSE client connected to progress events (filter: {:?})",
        query.user_id
    );

    let mut rx = state.event_bus.subscribe();
    let filter = query.user_id;

    let stream = async_stream::stream! {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("SSE: client lagged, {} events dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if let Some(user_id) = filter.as_deref() {
                if event.user_id() != user_id {
                    continue;
                }
            }

            let event_type = event.event_type();
            match serde_json::to_string(&event) {
                Ok(event_json) => {
                    debug!("SSE: Broadcasting event: {}", event_type);
                    yield Ok(Event::default().event(event_type).data(event_json));
                }
                Err(e) => {
                    warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                }
            }
        }
        debug!("SSE: event bus closed, ending stream");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
