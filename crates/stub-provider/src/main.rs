//! A small MCP server over stdio, used to exercise the agent's stdio transport.
//!
//! Requests are handled concurrently, so responses may come back out of order.
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const PAGE_SIZE: usize = 2;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn tools() -> Vec<Value> {
    vec![
        json!({
            "name": "echo",
            "description": "Echoes back the input",
            "inputSchema": {
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }
        }),
        json!({
            "name": "search_listings",
            "description": "Search rental listings in a city",
            "inputSchema": {
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }
        }),
        json!({
            "name": "sleep",
            "description": "Waits for the given number of milliseconds",
            "inputSchema": {
                "type": "object",
                "properties": {"millis": {"type": "integer"}}
            }
        }),
        json!({
            "name": "fail",
            "description": "Always reports an error",
            "inputSchema": {"type": "object", "properties": {}}
        }),
    ]
}

fn text(value: impl Into<String>) -> Value {
    json!([{"type": "text", "text": value.into()}])
}

async fn call_tool(name: &str, arguments: &Value) -> Result<Value, (i64, String)> {
    match name {
        "echo" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .ok_or((-32602, "missing message".to_string()))?;
            Ok(json!({"content": text(message)}))
        }
        "search_listings" => {
            let city = arguments
                .get("city")
                .and_then(Value::as_str)
                .ok_or((-32602, "missing city".to_string()))?;
            let listings = match city {
                "Miami" => "Apt A: 2br $2100, Apt B: 1br $1800",
                _ => "No listings found",
            };
            Ok(json!({"content": text(listings)}))
        }
        "sleep" => {
            let millis = arguments.get("millis").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!({"content": text(format!("slept {}ms", millis))}))
        }
        "fail" => Ok(json!({"content": text("listing service unavailable"), "isError": true})),
        other => Err((-32602, format!("Unknown tool: {}", other))),
    }
}

async fn handle(request: Request) -> Option<Value> {
    // Notifications get no response
    let id = request.id?;

    let result = match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": "stub-provider", "version": env!("CARGO_PKG_VERSION")}
        })),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let start = request
                .params
                .get("cursor")
                .and_then(Value::as_str)
                .and_then(|cursor| cursor.parse::<usize>().ok())
                .unwrap_or(0);
            let all = tools();
            let end = (start + PAGE_SIZE).min(all.len());
            let page = all.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();
            let mut result = json!({"tools": page});
            if end < all.len() {
                result["nextCursor"] = json!(end.to_string());
            }
            Ok(result)
        }
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            call_tool(&name, &arguments).await
        }
        other => Err((-32601, format!("Method not found: {}", other))),
    };

    Some(match result {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let line = format!("{}\n", message);
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    info!("stub-provider listening on stdio");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable request");
                continue;
            }
        };
        debug!(method = %request.method, "Received request");

        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = handle(request).await {
                let _ = tx.send(response);
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    info!("stdin closed, exiting");
    Ok(())
}
