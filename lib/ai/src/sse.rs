//! Decoding of OpenAI-style server-sent event streams.
//!
//! Event framing is handled by `eventsource-stream`; this module maps each
//! event's data to a [`CompletionChunk`] and ends the stream at `[DONE]`.

use crate::backend::{ChunkStream, CompletionChunk, FinishReason, ToolCallDelta};
use crate::error::CompletionError;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt, future};
use rootcause::prelude::Report;
use serde::Deserialize;
use std::fmt;
use tracing::debug;

/// Data of the event that ends a stream.
pub const DONE_MARKER: &str = "[DONE]";

/// Turns a response body stream into completion chunks.
///
/// Events after `[DONE]` are never read. Transport and framing errors are
/// reported as [`CompletionError::StreamFailed`].
pub fn completion_chunks<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    body.eventsource()
        .take_while(|event| future::ready(!matches!(event, Ok(event) if event.data == DONE_MARKER)))
        .filter_map(|event| {
            future::ready(match event {
                Ok(event) => decode_event(&event.data).map(|item| item.map_err(Report::from)),
                Err(e) => Some(Err(Report::from(CompletionError::StreamFailed {
                    reason: e.to_string(),
                }))),
            })
        })
        .boxed()
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Maps one event payload to a chunk.
///
/// Unparsable payloads and events that carry nothing are skipped.
pub fn decode_event(data: &str) -> Option<Result<CompletionChunk, CompletionError>> {
    let wire: WireChunk = match serde_json::from_str(data) {
        Ok(wire) => wire,
        Err(e) => {
            debug!(error = %e, "skipping unparsable stream event");
            return None;
        }
    };

    if let Some(error) = wire.error {
        let reason = error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        return Some(Err(CompletionError::StreamFailed { reason }));
    }

    // Usage-only events carry no choices.
    let choice = wire.choices.into_iter().next()?;
    let delta = choice.delta.unwrap_or_default();
    let chunk = CompletionChunk {
        text: delta.content.unwrap_or_default(),
        tool_calls: delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                ToolCallDelta {
                    index: tc.index,
                    id: tc.id,
                    name,
                    arguments,
                }
            })
            .collect(),
        finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
    };

    if chunk.text.is_empty() && chunk.tool_calls.is_empty() && chunk.finish_reason.is_none() {
        return None;
    }
    Some(Ok(chunk))
}
