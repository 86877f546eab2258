//! Progress streams: server-sent events for local runs and a relay for upstream ones

use crate::settlement::SettlementEvent;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Turn a run's events into an SSE response
///
/// Dropping the response body (client disconnect) cancels the run. The
/// stream closes right after the terminal event.
pub fn sse_response(
    events: mpsc::Receiver<SettlementEvent>,
    cancel: CancellationToken,
    heartbeat: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = cancel.drop_guard();

    let stream = futures::stream::unfold(
        (events, Some(guard)),
        |(mut events, guard)| async move {
            let guard = guard?;
            let event = events.recv().await?;

            let next_guard = if event.is_terminal() {
                // Run finished on its own; nothing left to cancel
                guard.disarm();
                None
            } else {
                Some(guard)
            };

            Some((Ok(to_frame(&event)), (events, next_guard)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat"))
}

fn to_frame(event: &SettlementEvent) -> Event {
    match Event::default().event(event.name()).json_data(event) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to serialize {} event: {}", event.name(), e);
            Event::default()
                .event("log")
                .data(r#"{"level":"error","text":"unserializable event"}"#)
        }
    }
}

/// Forward a settlement request upstream and stream the reply back unchanged
///
/// Frames are parsed on the side for metrics only. Dropping the returned body
/// drops the upstream connection.
pub async fn relay(client: &reqwest::Client, upstream_url: &str, body: Bytes) -> Response {
    let url = format!("{}/settle", upstream_url.trim_end_matches('/'));
    debug!("Relaying settlement request to {}", url);

    let upstream = match client
        .post(&url)
        .header("content-type", "application/json")
        .header("accept", "text/event-stream")
        .body(body.to_vec())
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!("Upstream {} unreachable: {}", url, e);
            crate::metrics::record_relayed_stream(StatusCode::BAD_GATEWAY.as_u16());
            return (
                StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({ "error": format!("upstream unreachable: {}", e) })),
            )
                .into_response();
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    crate::metrics::record_relayed_stream(status.as_u16());

    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));

    let mut parser = SseParser::new();
    let bytes = upstream.bytes_stream().map(move |chunk| {
        if let Ok(chunk) = &chunk {
            for frame in parser.feed(chunk) {
                crate::metrics::record_relayed_event(&frame.event);
            }
        }
        chunk
    });

    let mut response = Response::new(Body::from_stream(bytes));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// One parsed server-sent event
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE parser for consumers of a settlement stream
///
/// Frames end at a blank line. Multi-line `data:` fields are joined with
/// `\n`; comment lines (heartbeats) are skipped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every frame it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block)) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}
