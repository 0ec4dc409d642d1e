//! Engine configuration.

use colloquy_ai::CompletionOptions;
use serde::Deserialize;

/// Default ceiling on model rounds per turn.
pub const DEFAULT_MAX_ROUNDS: u32 = 10;

fn default_max_rounds() -> u32 {
    DEFAULT_MAX_ROUNDS
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Maximum completion rounds in one turn.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// System message seeded when a conversation is first created.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Options sent with every completion request.
    #[serde(default)]
    pub completion: CompletionOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            system_prompt: None,
            completion: CompletionOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Sets the round ceiling.
    #[must_use]
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the completion options.
    #[must_use]
    pub fn with_completion(mut self, completion: CompletionOptions) -> Self {
        self.completion = completion;
        self
    }
}
