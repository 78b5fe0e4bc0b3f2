//! MCP Server implementation for the Gemini API.

use crate::config::Config;
use crate::error::GeminiError;
use crate::gemini::{Dispatcher, ToolOutput};
use crate::registry::{HttpMethod, ToolDescriptor, ToolRegistry};
use base64::Engine as _;
use futures::StreamExt;
use rmcp::model::*;
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler, ServiceExt};
use serde_json::{json, Value};
use std::sync::Arc;

/// Render a catalog tool as an MCP tool definition.
pub fn mcp_tool(descriptor: &ToolDescriptor) -> Tool {
    let mut tool = Tool::new(
        descriptor.name.clone(),
        descriptor.description.clone(),
        Arc::new(descriptor.input_schema()),
    );
    tool.annotations = Some(annotations_for_method(descriptor.http_method));
    tool
}

/// MCP tool hints derived from HTTP method semantics. Every tool talks to an external API,
/// so `openWorldHint` is always set.
pub fn annotations_for_method(method: HttpMethod) -> ToolAnnotations {
    let (read_only, destructive, idempotent) = match method {
        HttpMethod::Get => (true, false, true),
        HttpMethod::Post => (false, false, false),
        HttpMethod::Delete => (false, true, true),
    };
    ToolAnnotations {
        title: None,
        read_only_hint: Some(read_only),
        destructive_hint: Some(destructive),
        idempotent_hint: Some(idempotent),
        open_world_hint: Some(true),
    }
}

/// The Gemini API MCP Server.
#[derive(Clone)]
pub struct GeminiServer {
    dispatcher: Dispatcher,
    tools: Arc<Vec<Tool>>,
}

impl GeminiServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let tools = dispatcher.registry().iter().map(mcp_tool).collect();
        Self {
            dispatcher,
            tools: Arc::new(tools),
        }
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Execute one tool call and shape the outcome as an MCP result.
    ///
    /// Unknown tools and bad arguments are protocol errors; failures reported by the Gemini
    /// API or the network are tool results flagged `isError`.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        match self.dispatcher.invoke(name, &arguments).await {
            Ok(ToolOutput::Json(body)) => Ok(CallToolResult::success(vec![Content::text(
                body.to_string(),
            )])),
            Ok(ToolOutput::Bytes { data, content_type }) => {
                Ok(CallToolResult::success(vec![bytes_content(data, content_type)]))
            }
            Ok(ToolOutput::Stream(mut stream)) => {
                let mut content = Vec::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => {
                            tracing::debug!(tool = %name, index = content.len(), "stream chunk");
                            content.push(Content::text(chunk.to_string()));
                        }
                        Err(e) => {
                            content.push(Content::text(error_json(&e)));
                            return Ok(CallToolResult::error(content));
                        }
                    }
                }
                Ok(CallToolResult::success(content))
            }
            Err(e) if e.is_caller_error() => Err(McpError::invalid_params(e.to_string(), None)),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(error_json(&e))])),
        }
    }
}

fn bytes_content(data: Vec<u8>, content_type: Option<String>) -> Content {
    let mime = content_type.unwrap_or_else(|| "application/octet-stream".to_string());
    let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
    if mime.starts_with("image/") {
        return Content::image(b64, mime);
    }
    match String::from_utf8(data) {
        Ok(text) => Content::text(text),
        Err(_) => Content::text(
            json!({
                "encoding": "base64",
                "mimeType": mime,
                "data": b64,
            })
            .to_string(),
        ),
    }
}

fn error_json(error: &GeminiError) -> String {
    let value = match error {
        GeminiError::Upstream { status, body } => json!({
            "success": false,
            "status": status,
            "error": error.to_string(),
            "body": body,
        }),
        other => json!({
            "success": false,
            "error": other.to_string(),
        }),
    };
    value.to_string()
}

impl ServerHandler for GeminiServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Gemini API MCP Server - Exposes the Google Gemini REST API (models, content \
                 generation, token counting, tuning, embeddings, file uploads) as tools"
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(self.tools.as_ref().clone()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.map(Value::Object).unwrap_or(Value::Null);
        self.call(&request.name, arguments).await
    }
}

/// Load the tool catalog named by `config`, or the embedded Gemini catalog.
pub fn load_registry(config: &Config) -> crate::Result<ToolRegistry> {
    match &config.catalog {
        Some(path) => {
            tracing::info!(catalog = %path.display(), "Loading tool catalog");
            ToolRegistry::from_catalog_file(path)
        }
        None => ToolRegistry::gemini(),
    }
}

/// Create and run the MCP server over stdio transport.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting Gemini API MCP Server...");

    if config.api_key.is_none() {
        tracing::warn!("No API key configured; requests must pass the `key` argument");
    }

    let registry = load_registry(&config)?;
    tracing::info!(tools = registry.len(), base_url = %config.base_url, "Tool catalog loaded");

    let dispatcher = Dispatcher::new(registry, &config)?;
    let server = GeminiServer::new(dispatcher);
    let service = server.serve(rmcp::transport::stdio()).await?;

    tracing::info!("Gemini API MCP Server is running");

    service.waiting().await?;

    tracing::info!("Gemini API MCP Server shutting down");
    Ok(())
}
