//! Server-Sent Events stream of one job's log.
//!
//! Each log line is one unnamed `data` event. The stream ends with a single
//! `done` event whose data is the final status.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tracing::{debug, warn};

use patchrunner::bus::{BusError, LogEvent, Subscription};
use patchrunner::core::types::JobId;
use patchrunner::io::store::JobStore;

use crate::state::AppState;

/// GET /api/jobs/{id}/events
pub async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let job = JobId(id);
    let subscription = match state.engine.bus().subscribe(job) {
        Ok(subscription) => subscription,
        Err(BusError::UnknownJob(_)) => settled_or_missing(&state, job).await?,
        Err(err @ BusError::TooManySubscribers { .. }) => {
            warn!(job = %job, "log subscriber limit reached");
            return Err((StatusCode::TOO_MANY_REQUESTS, err.to_string()));
        }
    };
    debug!(job = %job, "log subscriber attached");

    let stream = async_stream::stream! {
        let mut subscription = subscription;
        while let Some(event) = subscription.recv().await {
            match event {
                LogEvent::Line(line) => {
                    yield Ok(Event::default().data(line.replace('\r', "")));
                }
                LogEvent::Done(status) => {
                    yield Ok(Event::default().event("done").data(status.as_str()));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

/// Jobs without a topic (settled before this process saw them, or forgotten)
/// get their stored terminal status as the only event.
async fn settled_or_missing(
    state: &AppState,
    job: JobId,
) -> Result<Subscription, (StatusCode, String)> {
    match state.engine.store().job(job).await {
        Ok(Some(record)) if record.status.is_terminal() => Ok(Subscription::Finished {
            status: record.status,
            delivered: false,
        }),
        Ok(Some(_)) => Err((
            StatusCode::CONFLICT,
            format!("job {job} has no live log stream"),
        )),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("job {job} not found"))),
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))),
    }
}
