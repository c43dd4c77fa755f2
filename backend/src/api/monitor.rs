use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::broadcast::{self, error::RecvError};

use super::ApiState;
use crate::models::BroadcastEvent;

const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn list_tracked(State(state): State<ApiState>) -> impl IntoResponse {
    let tracked = state.monitor.tracked();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "count": tracked.len(),
            "tracked": tracked,
        })),
    )
}

pub async fn untrack(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    if state.monitor.untrack(&request_id) {
        (StatusCode::OK, Json(serde_json::json!({ "removed": true }))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "Request is not being monitored"
            })),
        )
            .into_response()
    }
}

pub async fn get_slot(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "network": state.network.as_str(),
            "slot": state.slots.current_slot(),
            "source": state.slots.source(),
        })),
    )
}

pub async fn recent_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);

    match state.store.recent_events(limit) {
        Ok(audit) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "broadcast": state.events.recent(limit),
                "audit": audit,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Error loading audit log: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": e.to_string()
                })),
            )
                .into_response()
        }
    }
}

/// Live `request_updated`, `ttl_update` and `utxo_update` events as server-sent events.
pub async fn stream_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_stream(state.events.subscribe())).keep_alive(KeepAlive::default())
}

fn event_stream(
    receiver: broadcast::Receiver<BroadcastEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match Event::default().event(event.name()).json_data(&event) {
                    Ok(sse) => return Some((Ok::<_, Infallible>(sse), receiver)),
                    Err(e) => tracing::warn!("Failed to encode event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event stream subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
