//! Tool trait, registry and the built-in vault tools.
//!
//! Tools are the agent-facing surface of the engine. Each one declares its
//! parameters as [`ParamSpec`]s; [`ToolRegistry::dispatch`] validates the
//! incoming JSON against them before [`Tool::execute`] runs, so an invalid
//! call never reaches the vault.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ToolRegistry                  │
//! │  list_vault  search  ask  read_note          │
//! │  put_note    stats   clear_cache   (custom)  │
//! └──────────────┬───────────────────────────────┘
//!                ▼
//!      dispatch() → validate → execute(ToolContext)
//!                ▼
//!          POST /tools/{name}, /mcp, vctx tools
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vault_context::config::Config;
//! use vault_context::engine::Engine;
//! use vault_context::traits::ToolRegistry;
//!
//! # async fn example() -> vault_context::error::Result<()> {
//! let engine = Arc::new(Engine::new(Config::for_base_url("https://127.0.0.1:27124"))?);
//! let tools = ToolRegistry::with_builtins();
//! let out = tools
//!     .dispatch(&engine, "search", serde_json::json!({ "query": "weekly review" }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::{Result, VaultError};
use crate::params::{self, ParamSpec};

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A tool that agents can discover and call.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::{json, Map, Value};
/// use vault_context::error::Result;
/// use vault_context::params::ParamSpec;
/// use vault_context::traits::{Tool, ToolContext};
///
/// pub struct CircuitTool;
///
/// #[async_trait]
/// impl Tool for CircuitTool {
///     fn name(&self) -> &str { "circuit" }
///     fn description(&self) -> &str { "Report the breaker state" }
///     fn params(&self) -> Vec<ParamSpec> { Vec::new() }
///
///     async fn execute(&self, _params: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
///         Ok(json!({ "state": ctx.engine().breaker().state() }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Route name (`POST /tools/{name}`), lowercase with underscores.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether this tool ships with the crate.
    fn is_builtin(&self) -> bool {
        false
    }

    /// True when the tool never writes to the vault.
    fn read_only(&self) -> bool {
        true
    }

    fn params(&self) -> Vec<ParamSpec>;

    /// JSON Schema for the parameters, derived from [`Tool::params`].
    fn parameters_schema(&self) -> Value {
        params::schema(&self.params())
    }

    /// Run with parameters that already passed validation.
    async fn execute(&self, params: Map<String, Value>, ctx: &ToolContext) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// What a tool sees while executing: the engine and the call's
/// cancellation token.
pub struct ToolContext {
    engine: Arc<Engine>,
    cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(engine: Arc<Engine>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Tool descriptor as listed by `GET /tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub read_only: bool,
    pub parameters: Value,
}

impl ToolInfo {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            builtin: tool.is_builtin(),
            read_only: tool.read_only(),
            parameters: tool.parameters_schema(),
        }
    }
}

fn str_param<'a>(params: &'a Map<String, Value>, name: &str) -> &'a str {
    params.get(name).and_then(|v| v.as_str()).unwrap_or("")
}

fn usize_param(params: &Map<String, Value>, name: &str) -> Option<usize> {
    params
        .get(name)
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tool Implementations
// ═══════════════════════════════════════════════════════════════════════

/// Recursive listing of the vault.
pub struct ListVaultTool;

#[async_trait]
impl Tool for ListVaultTool {
    fn name(&self) -> &str {
        "list_vault"
    }

    fn description(&self) -> &str {
        "List files in the vault, recursively from a root directory"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::string("root", "Directory to start from").default_value(json!("")),
            ParamSpec::integer("max_depth", "Maximum directory depth").range(Some(1), Some(64)),
            ParamSpec::string("glob", "Only files matching this glob"),
            ParamSpec::boolean("include_dirs", "Include directory entries")
                .default_value(json!(true)),
        ]
    }

    async fn execute(&self, params: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let glob = params.get("glob").and_then(|v| v.as_str());
        let mut inventory = ctx
            .engine
            .list_vault(
                str_param(&params, "root"),
                usize_param(&params, "max_depth"),
                glob,
                &ctx.cancel,
            )
            .await?;
        if params.get("include_dirs").and_then(|v| v.as_bool()) == Some(false) {
            inventory.entries.retain(|e| !e.is_directory);
        }
        Ok(json!({
            "entries": inventory.entries,
            "partial": inventory.is_partial(),
            "skipped": inventory.skipped,
        }))
    }
}

/// Ranked search without context assembly.
pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the vault by filename, path and content; an empty query browses"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::string("query", "Query text; supports #tag, path: and ext: filters")
                .required(),
            ParamSpec::integer("limit", "Max results")
                .range(Some(1), Some(500))
                .default_value(json!(20)),
        ]
    }

    async fn execute(&self, params: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let limit = usize_param(&params, "limit").unwrap_or(20);
        let out = ctx
            .engine
            .search(str_param(&params, "query"), limit, &ctx.cancel)
            .await?;
        to_value(&out)
    }
}

/// Full pipeline ending in a token-budgeted context block.
pub struct AskTool;

#[async_trait]
impl Tool for AskTool {
    fn name(&self) -> &str {
        "ask"
    }

    fn description(&self) -> &str {
        "Assemble cited context from the vault for a question, within a token budget"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::string("query", "Question or search text").required(),
            ParamSpec::integer("budget", "Token budget for the context").range(Some(1), None),
            ParamSpec::integer("limit", "Max candidates considered")
                .range(Some(1), Some(500))
                .default_value(json!(50)),
            ParamSpec::integer("timeout_ms", "Abort the query after this many milliseconds")
                .range(Some(1), None),
        ]
    }

    async fn execute(&self, params: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let limit = usize_param(&params, "limit").unwrap_or(50);
        let out = ctx
            .engine
            .ask(
                str_param(&params, "query"),
                usize_param(&params, "budget"),
                limit,
                &ctx.cancel,
            )
            .await?;
        let mut value = to_value(&out)?;
        value["rendered"] = json!(out.context.render());
        Ok(value)
    }
}

/// Read one note with its tags and modification time.
pub struct ReadNoteTool;

#[async_trait]
impl Tool for ReadNoteTool {
    fn name(&self) -> &str {
        "read_note"
    }

    fn description(&self) -> &str {
        "Read a note by vault path"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::string("path", "Vault-relative note path")
            .required()
            .non_empty()]
    }

    async fn execute(&self, params: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let note = ctx
            .engine
            .read_note(str_param(&params, "path"), &ctx.cancel)
            .await?;
        to_value(&note)
    }
}

/// Create or replace a note (`PUT`).
pub struct PutNoteTool;

#[async_trait]
impl Tool for PutNoteTool {
    fn name(&self) -> &str {
        "put_note"
    }

    fn description(&self) -> &str {
        "Create or replace a note at a vault path"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn read_only(&self) -> bool {
        false
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::string("path", "Vault-relative note path")
                .required()
                .non_empty(),
            ParamSpec::string("content", "Full markdown content").required(),
        ]
    }

    async fn execute(&self, params: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let path = str_param(&params, "path");
        let content = str_param(&params, "content");
        ctx.engine.put_note(path, content, &ctx.cancel).await?;
        Ok(json!({ "path": path, "bytes": content.len() }))
    }
}

pub struct StatsTool;

#[async_trait]
impl Tool for StatsTool {
    fn name(&self) -> &str {
        "stats"
    }

    fn description(&self) -> &str {
        "Cache, transport and circuit breaker statistics"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn params(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    async fn execute(&self, _params: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        to_value(&ctx.engine.stats())
    }
}

pub struct ClearCacheTool;

#[async_trait]
impl Tool for ClearCacheTool {
    fn name(&self) -> &str {
        "clear_cache"
    }

    fn description(&self) -> &str {
        "Drop all cached listings and notes"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn params(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    async fn execute(&self, _params: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        Ok(json!({ "cleared": ctx.engine.clear_cache() }))
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| VaultError::Decode {
        path: String::new(),
        message: e.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry for built-in and custom tools.
///
/// Use [`ToolRegistry::with_builtins`] for the standard set, then
/// [`register`](ToolRegistry::register) to add custom ones.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ListVaultTool));
        registry.register(Box::new(SearchTool));
        registry.register(Box::new(AskTool));
        registry.register(Box::new(ReadNoteTool));
        registry.register(Box::new(PutNoteTool));
        registry.register(Box::new(StatsTool));
        registry.register(Box::new(ClearCacheTool));
        registry
    }

    /// Register a tool. A tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| ToolInfo::of(t.as_ref())).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Look up, validate and run a tool.
    ///
    /// A `timeout_ms` parameter, when the tool declares one, bounds the
    /// call; hitting it is reported as [`VaultError::Timeout`].
    pub async fn dispatch(&self, engine: &Arc<Engine>, name: &str, params: Value) -> Result<Value> {
        let tool = self
            .find(name)
            .ok_or_else(|| VaultError::NotFound(format!("no tool registered with name: {}", name)))?;
        let params = params::validate(&tool.params(), &params)?;

        let timeout_ms = params.get("timeout_ms").and_then(|v| v.as_u64());
        let cancel = engine.request_token(timeout_ms);
        let ctx = ToolContext::new(engine.clone(), cancel.clone());
        let started = std::time::Instant::now();

        let result = tool.execute(params, &ctx).await;
        // The deadline task only fires once; cancel here so it exits.
        cancel.cancel();

        match (result, timeout_ms) {
            (Err(VaultError::Cancelled), Some(ms))
                if started.elapsed() >= Duration::from_millis(ms) =>
            {
                Err(VaultError::Timeout {
                    path: name.to_string(),
                    after: Duration::from_millis(ms),
                })
            }
            (result, _) => result,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(Config::for_base_url("http://127.0.0.1:9")).unwrap())
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        let names: Vec<&str> = registry.tools().iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec!["list_vault", "search", "ask", "read_note", "put_note", "stats", "clear_cache"]
        );
        assert!(!registry.find("put_note").unwrap().read_only());
        assert!(registry.find("search").unwrap().read_only());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = ToolRegistry::with_builtins();
        let before = registry.len();
        registry.register(Box::new(StatsTool));
        assert_eq!(registry.len(), before);
    }

    #[tokio::test]
    async fn test_unknown_tool_not_found() {
        let err = ToolRegistry::with_builtins()
            .dispatch(&engine(), "nope", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_validation_runs_before_execute() {
        let engine = engine();
        let registry = ToolRegistry::with_builtins();
        let err = registry
            .dispatch(&engine, "search", json!({ "limit": 5 }))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
        let err = registry
            .dispatch(&engine, "read_note", json!({ "path": "" }))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
        // Nothing reached the (unreachable) vault.
        assert_eq!(engine.stats().transport.requests, 0);
    }

    #[tokio::test]
    async fn test_stats_and_clear_cache_tools() {
        let engine = engine();
        let registry = ToolRegistry::with_builtins();
        let stats = registry.dispatch(&engine, "stats", json!({})).await.unwrap();
        assert_eq!(stats["circuit"], "closed");
        let cleared = registry
            .dispatch(&engine, "clear_cache", Value::Null)
            .await
            .unwrap();
        assert_eq!(cleared["cleared"], 0);
    }
}
