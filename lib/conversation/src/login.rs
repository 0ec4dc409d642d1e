//! Login data carried alongside a turn.

use colloquy_core::UserId;
use serde::{Deserialize, Serialize};

/// Identity and session cookie of the user driving a turn.
///
/// The engine answers the built-in login lookup tool from this value instead
/// of routing the call to the tool executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginContext {
    /// The logged-in user.
    pub user_id: UserId,
    /// Session cookie presented by the client.
    pub cookie: String,
}

impl LoginContext {
    /// Creates a login context.
    #[must_use]
    pub fn new(user_id: UserId, cookie: impl Into<String>) -> Self {
        Self {
            user_id,
            cookie: cookie.into(),
        }
    }

    /// Renders the context as the JSON text returned to the model.
    #[must_use]
    pub fn to_tool_result(&self) -> String {
        serde_json::json!({ "id": self.user_id, "cookie": self.cookie }).to_string()
    }
}
