//! Error types for the Gemini API MCP server.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeminiError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    Validation(String),

    #[error("Gemini API returned {status}: {body}")]
    Upstream { status: u16, body: Value },

    #[error("HTTP transport error: {0}")]
    Transport(String),

    #[error("Invalid tool catalog: {0}")]
    Schema(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read tool catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParseError(#[from] serde_json::Error),

    #[error("Failed to parse tool catalog: {0}")]
    YamlParseError(#[from] serde_yaml::Error),
}

impl From<reqwest::Error> for GeminiError {
    fn from(value: reqwest::Error) -> Self {
        // Strip the URL: it may carry an API key in the query string.
        Self::Transport(value.without_url().to_string())
    }
}

impl GeminiError {
    /// Errors the caller can fix by changing the tool name or arguments.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, GeminiError>;
