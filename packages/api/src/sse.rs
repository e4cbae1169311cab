// ABOUTME: Server-Sent Events helpers for streaming exec output
// ABOUTME: Streams hold a drain connection guard so shutdown waits for open streams

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::middleware::ConnectionGuard;

/// Largest output chunk sent in one event; longer chunks are split.
pub const MAX_SSE_EVENT_SIZE: usize = 64 * 1024;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Keeps its connection counted until the stream is dropped, consumed or not.
pub struct GuardedSseStream<S> {
    stream: Pin<Box<S>>,
    _guard: ConnectionGuard,
}

impl<S> GuardedSseStream<S> {
    pub fn new(stream: S, guard: ConnectionGuard) -> Self {
        Self {
            stream: Box::pin(stream),
            _guard: guard,
        }
    }
}

impl<S, T, E> Stream for GuardedSseStream<S>
where
    S: Stream<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// Wrap a stream in an SSE response with the standard keep-alive.
pub fn create_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

/// A data-only event carrying `data` as JSON.
pub fn create_sse_event<T: Serialize>(data: &T) -> Result<Event, serde_json::Error> {
    Ok(Event::default().data(serde_json::to_string(data)?))
}

pub fn create_error_event(message: &str) -> Event {
    let body = serde_json::json!({ "t": "error", "message": message });
    Event::default().event("error").data(body.to_string())
}

/// Split `data` into pieces of at most `MAX_SSE_EVENT_SIZE` bytes on char boundaries.
pub fn chunk_output(data: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = data;
    while rest.len() > MAX_SSE_EVENT_SIZE {
        let mut cut = MAX_SSE_EVENT_SIZE;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::DrainController;
    use futures::StreamExt;

    #[test]
    fn test_chunk_output_splits_on_char_boundaries() {
        assert!(chunk_output("").is_empty());
        assert_eq!(chunk_output("hi"), vec!["hi"]);

        let long = "é".repeat(MAX_SSE_EVENT_SIZE);
        let pieces = chunk_output(&long);
        assert!(pieces.iter().all(|p| p.len() <= MAX_SSE_EVENT_SIZE));
        assert_eq!(pieces.concat(), long);
    }

    #[tokio::test]
    async fn test_guard_released_when_stream_dropped() {
        let drain = DrainController::new();
        let stream = futures::stream::iter(vec![Ok::<_, Infallible>(1), Ok(2)]);
        let mut guarded = GuardedSseStream::new(stream, drain.track_connection());
        assert_eq!(drain.active_connections(), 1);

        assert_eq!(guarded.next().await, Some(Ok(1)));
        drop(guarded);
        assert_eq!(drain.active_connections(), 0);
    }

    #[test]
    fn test_create_sse_event() {
        #[derive(Serialize)]
        struct Chunk {
            seq: u64,
        }
        assert!(create_sse_event(&Chunk { seq: 1 }).is_ok());
    }
}
