//! Built-in tools offered to the model.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use colloquy_conversation::{Tool, ToolArgs, ToolDefinition, ToolError, ToolRegistry};
use std::sync::Arc;

/// Reports the current time.
#[derive(Debug, Default)]
pub struct TimeNow;

#[async_trait]
impl Tool for TimeNow {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("time_now", "Returns the current UTC time as an RFC 3339 timestamp.")
    }

    async fn call(&self, _args: &ToolArgs) -> Result<String, ToolError> {
        Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// Returns the registry of built-in tools.
#[must_use]
pub fn builtin_tools() -> ToolRegistry {
    ToolRegistry::new().with_tool(Arc::new(TimeNow))
}
