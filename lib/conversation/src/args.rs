//! Normalization of model-emitted tool arguments.
//!
//! Models emit tool arguments as free text that is usually, but not always,
//! a JSON object. [`ToolArgs`] always yields a usable key/value map so that a
//! malformed call never aborts a turn.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Key holding raw argument text that could not be parsed.
pub const RAW_ARGS_KEY: &str = "_";
/// Key holding raw argument text in the detailed fallback.
pub const RAW_TEXT_KEY: &str = "_raw";
/// Key holding the parse error in the detailed fallback.
pub const PARSE_ERROR_KEY: &str = "_parse_error";

/// Structured tool arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolArgs(Map<String, JsonValue>);

impl ToolArgs {
    /// Creates an empty argument map.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Parses argument text.
    ///
    /// Empty input gives an empty map, a JSON object gives that object, and
    /// anything else is kept verbatim under [`RAW_ARGS_KEY`].
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match parse_object(raw) {
            Ok(args) => args,
            Err(_) => Self::fallback(&[(RAW_ARGS_KEY, raw)]),
        }
    }

    /// Parses argument text, recording why parsing failed.
    ///
    /// Like [`ToolArgs::parse`], but the fallback map holds the raw text under
    /// [`RAW_TEXT_KEY`] and the parse error under [`PARSE_ERROR_KEY`].
    #[must_use]
    pub fn parse_detailed(raw: &str) -> Self {
        match parse_object(raw) {
            Ok(args) => args,
            Err(reason) => Self::fallback(&[(PARSE_ERROR_KEY, reason.as_str()), (RAW_TEXT_KEY, raw)]),
        }
    }

    fn fallback(entries: &[(&str, &str)]) -> Self {
        let mut map = Map::new();
        for (key, value) in entries {
            map.insert((*key).to_string(), JsonValue::String((*value).to_string()));
        }
        Self(map)
    }

    /// Returns true if the arguments came from a parse fallback.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.0.contains_key(PARSE_ERROR_KEY) || (self.0.len() == 1 && self.0.contains_key(RAW_ARGS_KEY))
    }

    /// Returns a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Returns a string value by key.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    /// Returns an integer value by key.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(JsonValue::as_i64)
    }

    /// Returns a boolean value by key.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(JsonValue::as_bool)
    }

    /// Inserts a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.0.insert(key.into(), value)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    /// Returns the arguments as a JSON object value.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }

    /// Consumes the arguments, returning the underlying map.
    #[must_use]
    pub fn into_inner(self) -> Map<String, JsonValue> {
        self.0
    }
}

impl From<Map<String, JsonValue>> for ToolArgs {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

fn parse_object(raw: &str) -> Result<ToolArgs, String> {
    if raw.trim().is_empty() {
        return Ok(ToolArgs::new());
    }
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(JsonValue::Object(map)) => Ok(ToolArgs(map)),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
