//! Terminal rendering of turn events.
//!
//! Model text goes to one writer (stdout) and tool activity to another
//! (stderr), so the reply can be piped on its own.

use colloquy_engine::{DoneReason, TurnEvent};
use std::io::{self, Write};

/// Writes one event.
///
/// # Errors
///
/// Returns an error if either writer fails.
pub fn render(event: &TurnEvent, out: &mut impl Write, err: &mut impl Write) -> io::Result<()> {
    match event {
        TurnEvent::Delta { text } => {
            out.write_all(text.as_bytes())?;
            out.flush()
        }
        TurnEvent::ToolCallStart { round, tool_calls } => {
            writeln!(err, "[round {round}] model requested {} tool call(s)", tool_calls.len())
        }
        TurnEvent::ToolCall { name, .. } => writeln!(err, "  -> {name}"),
        TurnEvent::ToolResult { name, result, .. } => {
            writeln!(err, "  <- {name} ({} bytes)", result.len())
        }
        TurnEvent::Done { reason } => {
            writeln!(out)?;
            if *reason != DoneReason::Completed {
                writeln!(err, "[stopped: {reason}]")?;
            }
            out.flush()
        }
    }
}
