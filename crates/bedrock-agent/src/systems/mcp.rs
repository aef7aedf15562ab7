//! Tool provider speaking the Model Context Protocol over a child process's stdio.
//!
//! Requests are line-delimited JSON-RPC 2.0 messages. Responses are matched to requests by
//! id, so any number of calls can be in flight on the same pipe.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::{System, SystemConfig};
use crate::errors::{ConnectionError, ToolError};
use crate::models::tool::Tool;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    protocol_version: String,
    #[serde(default)]
    server_info: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    name: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    tools: Vec<McpTool>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Value,
}

impl From<McpTool> for Tool {
    fn from(tool: McpTool) -> Self {
        Tool::new(tool.name, tool.description.unwrap_or_default(), tool.input_schema)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    is_error: bool,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Drops a request's pending entry once its caller stops waiting, whether it got an
/// answer, timed out here, or was abandoned by an outer timeout or cancellation
struct PendingGuard {
    id: u64,
    pending: Pending,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let id = self.id;
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.remove(&id);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pending = Arc::clone(&self.pending);
            handle.spawn(async move {
                pending.lock().await.remove(&id);
            });
        }
    }
}

/// A connected MCP server
pub struct McpSystem {
    name: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    next_id: AtomicU64,
    pending: Pending,
    request_timeout: Duration,
}

impl McpSystem {
    /// Spawn the server process and complete the initialization handshake
    pub async fn connect(config: SystemConfig) -> Result<Self, ConnectionError> {
        Self::connect_with_timeout(config, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        config: SystemConfig,
        request_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        info!(
            target: "mcp",
            system = %config.name,
            command = %config.command,
            "Starting tool provider"
        );

        let spawn_error = |message: String| ConnectionError::Spawn {
            system: config.name.clone(),
            message,
        };

        let command = shellexpand::full(&config.command)
            .map_err(|e| spawn_error(format!("cannot expand command: {}", e)))?;

        let mut cmd = Command::new(command.into_owned());
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &config.cwd {
            let cwd = shellexpand::full(cwd)
                .map_err(|e| spawn_error(format!("cannot expand cwd: {}", e)))?;
            cmd.current_dir(cwd.into_owned());
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(config.name.clone(), stderr);
        }

        let system = Self {
            name: config.name.clone(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_timeout,
        };
        system.spawn_reader(stdout);

        if let Err(e) = system.initialize().await {
            system.shutdown().await;
            return Err(ConnectionError::Handshake {
                system: config.name,
                message: e.to_string(),
            });
        }

        Ok(system)
    }

    async fn initialize(&self) -> Result<(), ToolError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self.request("initialize", Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ToolError::Transport(format!("invalid initialize result: {}", e)))?;

        if result.protocol_version != PROTOCOL_VERSION {
            debug!(
                target: "mcp",
                system = %self.name,
                version = %result.protocol_version,
                "Server negotiated a different protocol version"
            );
        }

        self.notify("notifications/initialized").await?;

        match result.server_info {
            Some(server) => info!(
                target: "mcp",
                system = %self.name,
                server = %server.name,
                server_version = %server.version,
                "Tool provider initialized"
            ),
            None => info!(target: "mcp", system = %self.name, "Tool provider initialized"),
        }
        Ok(())
    }

    /// Requests sent and still waiting for an answer
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn write_line(&self, line: String) -> Result<(), ToolError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| ToolError::Transport("connection closed".to_string()))?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))
    }

    async fn notify(&self, method: &str) -> Result<(), ToolError> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0",
            method,
        };
        let line = serde_json::to_string(&notification)
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        self.write_line(line).await
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        let _guard = PendingGuard {
            id,
            pending: Arc::clone(&self.pending),
        };

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let sent = match serde_json::to_string(&request) {
            Ok(line) => self.write_line(line).await,
            Err(e) => Err(ToolError::Transport(e.to_string())),
        };
        sent?;

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(ToolError::Transport(
                    "tool provider closed the connection".to_string(),
                ))
            }
            Err(_) => {
                warn!(target: "mcp", system = %self.name, method, id, "Request timed out");
                return Err(ToolError::Timeout(self.request_timeout));
            }
        };

        if let Some(error) = response.error {
            return Err(rpc_error_to_tool_error(error));
        }

        response
            .result
            .ok_or_else(|| ToolError::Transport("response has neither result nor error".to_string()))
    }

    fn spawn_reader(&self, stdout: ChildStdout) {
        let pending = Arc::clone(&self.pending);
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<JsonRpcResponse>(&line) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(target: "mcp", system = %name, error = %e, line = %line, "Unparseable message from tool provider");
                        continue;
                    }
                };

                // Server-initiated requests and notifications carry no id we issued
                let Some(id) = response.id.as_ref().and_then(Value::as_u64) else {
                    debug!(target: "mcp", system = %name, "Ignoring message without request id");
                    continue;
                };

                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        warn!(target: "mcp", system = %name, id, "Response for unknown request")
                    }
                }
            }

            // Fail everything still waiting instead of letting it run into the timeout
            pending.lock().await.clear();
            debug!(target: "mcp", system = %name, "Tool provider output closed");
        });
    }
}

fn spawn_stderr_logger(name: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "mcp", system = %name, "{}", line);
        }
    });
}

fn rpc_error_to_tool_error(error: JsonRpcError) -> ToolError {
    let message = format!("{} (code: {})", error.message, error.code);
    match error.code {
        INVALID_PARAMS => ToolError::InvalidParameters(message),
        METHOD_NOT_FOUND => ToolError::Transport(message),
        _ => ToolError::Execution(message),
    }
}

/// Join the text items of an MCP content list, for error reporting
fn content_text(content: &Value) -> String {
    match content.as_array() {
        Some(items) => {
            let texts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                content.to_string()
            } else {
                texts.join("\n")
            }
        }
        None => content.to_string(),
    }
}

#[async_trait]
impl System for McpSystem {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, ToolError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.request("tools/list", Some(params)).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| ToolError::Transport(format!("invalid tools/list result: {}", e)))?;

            tools.extend(page.tools.into_iter().map(Tool::from));

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(target: "mcp", system = %self.name, count = tools.len(), "Listed tools");
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        debug!(target: "mcp", system = %self.name, tool = %name, "Calling tool");

        let result = self
            .request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| ToolError::Transport(format!("invalid tools/call result: {}", e)))?;

        if result.is_error {
            return Err(ToolError::Execution(content_text(&result.content)));
        }
        Ok(result.content)
    }

    async fn shutdown(&self) {
        // Closing stdin lets a well-behaved server exit on its own
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                error!(target: "mcp", system = %self.name, error = %e, "Failed to stop tool provider");
            }
            info!(target: "mcp", system = %self.name, "Tool provider stopped");
        }
    }
}
