//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] into an MCP Streamable HTTP endpoint
//! (mounted at `/mcp` by the server) so MCP clients can list and call the
//! vault tools with the standard protocol. Calls go through
//! [`ToolRegistry::dispatch`], so validation and timeouts match the REST
//! endpoint.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};

use crate::engine::Engine;
use crate::error::VaultError;
use crate::traits::ToolRegistry;

/// Bridges the tool registry to the MCP JSON-RPC protocol.
///
/// Each MCP session receives a clone of this struct (everything is
/// behind `Arc`), so all sessions share one engine.
#[derive(Clone)]
pub struct McpBridge {
    engine: Arc<Engine>,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(engine: Arc<Engine>, tools: Arc<ToolRegistry>) -> Self {
        Self { engine, tools }
    }

    /// Convert a registry tool into an rmcp `Tool` descriptor.
    fn to_mcp_tool(tool: &dyn crate::traits::Tool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> =
            match tool.parameters_schema() {
                serde_json::Value::Object(map) => Arc::new(map),
                _ => Arc::new(serde_json::Map::new()),
            };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(tool.read_only())),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "vault-context".to_string(),
                title: Some("Vault Context".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Retrieval over a note vault. Use ask to get cited context for a question \
                 within a token budget, search for ranked matches, read_note for one note, \
                 and list_vault to browse paths."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if self.tools.find(&request.name).is_none() {
            return Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            ));
        }

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        match self.tools.dispatch(&self.engine, &request.name, params).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(VaultError::Validation(msg)) => {
                Err(McpError::new(ErrorCode::INVALID_PARAMS, msg, None))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "{}: {}",
                e.code(),
                e
            ))])),
        }
    }
}
