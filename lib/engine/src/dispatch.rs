//! Routing of model tool calls.
//!
//! Calls are routed through a static table: the login lookup is answered
//! from the turn's [`LoginContext`], everything else goes to the
//! [`ToolExecutor`]. Failures never escape; they become a textual result the
//! model can react to.

use colloquy_conversation::{LoginContext, ToolArgs, ToolCallRequest, ToolDefinition, ToolError, ToolExecutor};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the built-in login lookup tool.
pub const LOGIN_TOOL_NAME: &str = "get_login_data";

/// Prefix of the result text produced when a tool fails.
pub const TOOL_ERROR_PREFIX: &str = "tool error: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Login,
    Executor,
}

fn route(name: &str) -> Route {
    match name {
        LOGIN_TOOL_NAME => Route::Login,
        _ => Route::Executor,
    }
}

/// Definition advertised for the login lookup tool.
#[must_use]
pub fn login_tool_definition() -> ToolDefinition {
    ToolDefinition::new(
        LOGIN_TOOL_NAME,
        "Returns the current user's id and session cookie for calling campus services.",
    )
}

/// Normalizes the argument text of a call.
///
/// Unparsable text never aborts a call; it is handed to the tool under
/// sentinel keys together with the parse error.
#[must_use]
pub fn parse_arguments(call: &ToolCallRequest) -> ToolArgs {
    let args = ToolArgs::parse_detailed(&call.arguments);
    if args.is_fallback() {
        warn!(tool = %call.name, call_id = %call.id, "tool arguments are not a JSON object");
    }
    args
}

/// The outcome of one dispatched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// Result text fed back to the model.
    pub output: String,
    /// Whether the tool failed.
    pub failed: bool,
}

/// Routes tool calls to their handlers.
#[derive(Clone)]
pub struct ToolDispatcher {
    executor: Arc<dyn ToolExecutor>,
}

impl ToolDispatcher {
    /// Creates a dispatcher over an executor.
    #[must_use]
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    /// Returns the tools offered to the model, including the login lookup.
    #[must_use]
    pub fn schema(&self) -> Vec<ToolDefinition> {
        let mut schema = self.executor.schema();
        if !schema.iter().any(|def| def.name == LOGIN_TOOL_NAME) {
            schema.push(login_tool_definition());
        }
        schema
    }

    /// Runs one call with already-normalized arguments.
    pub async fn call(
        &self,
        call: &ToolCallRequest,
        args: &ToolArgs,
        login: Option<&LoginContext>,
    ) -> Dispatched {
        let result = match route(&call.name) {
            Route::Login => login.map(LoginContext::to_tool_result).ok_or_else(|| {
                ToolError::MissingLoginContext {
                    name: call.name.clone(),
                }
            }),
            Route::Executor => self.executor.call(&call.name, args).await,
        };

        match result {
            Ok(output) => {
                debug!(tool = %call.name, call_id = %call.id, bytes = output.len(), "tool call succeeded");
                Dispatched {
                    output,
                    failed: false,
                }
            }
            Err(err) => {
                warn!(tool = %call.name, call_id = %call.id, error = %err, "tool call failed");
                Dispatched {
                    output: format!("{TOOL_ERROR_PREFIX}{}", err.message()),
                    failed: true,
                }
            }
        }
    }
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher").finish_non_exhaustive()
    }
}
