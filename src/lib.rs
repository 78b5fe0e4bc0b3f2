//! Gemini API MCP Server - Exposes the Google Gemini REST API as MCP tools.
//!
//! The tool surface is described by an OpenAPI-style catalog (`catalog/gemini.yaml`, embedded
//! at build time). Each tool call is turned into exactly one HTTP request against the
//! Generative Language API.

pub mod config;
pub mod error;
pub mod gemini;
pub mod registry;
pub mod request;
pub mod server;

pub use config::Config;
pub use error::{GeminiError, Result};
pub use gemini::{ChunkStream, Dispatcher, ToolOutput};
pub use registry::{ToolDescriptor, ToolRegistry};
pub use request::{HttpRequest, RequestBody};
pub use server::{run_server, GeminiServer};
