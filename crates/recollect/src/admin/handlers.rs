use axum::{
    Json,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::admin::DaemonStats;
use crate::pipeline::JobEventKind;
use crate::server::AppState;

fn event_name(kind: JobEventKind) -> &'static str {
    match kind {
        JobEventKind::Submitted => "submitted",
        JobEventKind::StageChanged => "stage_changed",
        JobEventKind::StateChanged => "state_changed",
        JobEventKind::Cached => "cached",
    }
}

/// Server-sent stream of job events
///
/// Slow subscribers that fall behind the broadcast buffer skip the missed
/// events rather than closing the stream.
pub async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.pipeline.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        match result {
            Ok(event) => {
                let json = serde_json::to_string(&event).ok()?;
                Some(Ok(Event::default().event(event_name(event.kind)).data(json)))
            }
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Admin event subscriber lagged");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<DaemonStats> {
    let decryption = state.decryption.as_ref().map(|d| d.stats());
    Json(DaemonStats::collect(
        state.started_at.elapsed().as_secs(),
        &state.pipeline.stats(),
        &state.retrieval.cache_stats(),
        decryption.as_ref(),
    ))
}
