use std::convert::Infallible;

use axum::response::sse::{Event as SseEvent, Sse};
use futures::stream::Stream;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::{LiveStream, StreamMessage};
use crate::config::BroadcastConfig;

/// Turn a registered stream into an SSE response body.
///
/// The stream's guard travels with the body, so the registration ends when
/// the client disconnects or the maximum lifetime elapses. Idle streams are
/// kept open by the service's `heartbeat` events, not by SSE comments.
pub fn sse_response(
    live: LiveStream,
    config: &BroadcastConfig,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let LiveStream {
        receiver, guard, ..
    } = live;

    let stream = ReceiverStream::new(receiver)
        .map(move |message| {
            let _registered = &guard;
            Ok(to_sse_event(&message))
        })
        .take_until(tokio::time::sleep(config.stream_timeout));

    Sse::new(stream)
}

pub fn to_sse_event(message: &StreamMessage) -> SseEvent {
    let event = SseEvent::default().event(message.event.as_str());
    match event.clone().json_data(message) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(event = %message.event, error = %e, "Failed to encode stream message");
            event.data(message.data.to_string())
        }
    }
}
