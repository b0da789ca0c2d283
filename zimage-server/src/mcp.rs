//! Agent tool protocol (MCP): JSON-RPC 2.0 over stdio lines or `POST /mcp`.

use std::path::Path;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{prelude::BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use zimage_core::{thumbnail_png, Error, GenerationResult, HistoryQuery, Worker};

use crate::api::{GenerateBody, GenerateResponse, HistoryParams, ModelsResponse};
use crate::AppState;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "z-image-studio";
/// Longest side of the preview embedded in `generate` results.
pub const THUMBNAIL_MAX_SIDE: u32 = 256;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        let code = if e.is_client_error() {
            INVALID_PARAMS
        } else {
            INTERNAL_ERROR
        };
        let mut message = format!("{e:#}");
        if e.is_out_of_memory() {
            message.push_str(&format!(" ({})", crate::error::OOM_HINT));
        }
        Self::new(code, message)
    }
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// How `generate` results point at the saved image.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkStyle {
    /// `file://` URI; the agent shares the filesystem (stdio).
    File,
    /// Absolute URL under this base (HTTP).
    Url(String),
}

pub struct McpServer {
    worker: Worker,
    links: LinkStyle,
}

impl McpServer {
    pub fn new(worker: Worker, links: LinkStyle) -> Self {
        Self { worker, links }
    }

    /// Handles one message. Notifications (no `id`) get no response.
    pub async fn handle(&self, request: RpcRequest) -> Option<RpcResponse> {
        if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
            return Some(RpcResponse::failure(
                request.id.unwrap_or(Value::Null),
                RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            ));
        }
        debug!("MCP request {}", request.method);
        let outcome = self.dispatch(&request.method, request.params).await;
        let id = request.id?;
        Some(match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => {
                warn!("MCP {} failed: {}", request.method, error.message);
                RpcResponse::failure(id, error)
            }
        })
    }

    /// Parses and handles one raw message.
    pub async fn handle_raw(&self, raw: &[u8]) -> Option<RpcResponse> {
        match serde_json::from_slice::<RpcRequest>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!("Invalid JSON-RPC message: {}", e);
                Some(RpcResponse::failure(
                    Value::Null,
                    RpcError::new(PARSE_ERROR, format!("Parse error: {e}")),
                ))
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tool_definitions() })),
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::invalid_params("tools/call requires a tool name"))?;
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                self.call_tool(name, arguments).await
            }
            m if m.starts_with("notifications/") => Ok(Value::Null),
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        match name {
            "generate" => {
                let body: GenerateBody = serde_json::from_value(arguments)
                    .map_err(|e| RpcError::invalid_params(format!("invalid arguments: {e}")))?;
                let result = self.worker.generate(body.into()).await?;
                self.generate_content(&result).await
            }
            "list_models" => {
                let models = ModelsResponse::for_worker(&self.worker);
                text_result(&models)
            }
            "list_history" => {
                let params: HistoryParams = serde_json::from_value(arguments)
                    .map_err(|e| RpcError::invalid_params(format!("invalid arguments: {e}")))?;
                let query: HistoryQuery = params
                    .into_query()
                    .map_err(|e| RpcError::invalid_params(e.to_string()))?;
                let (items, total) = self.worker.history().list(&query).await?;
                text_result(&json!({
                    "total": total,
                    "limit": query.limit,
                    "offset": query.offset,
                    "items": items,
                }))
            }
            other => Err(RpcError::invalid_params(format!("Unknown tool: {other}"))),
        }
    }

    /// Metadata text, a link to the full image and an inline preview, in that order.
    async fn generate_content(&self, result: &GenerationResult) -> Result<Value, RpcError> {
        let metadata = GenerateResponse::from(result);
        let text = serde_json::to_string(&metadata)
            .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
        let uri = match &self.links {
            LinkStyle::File => file_uri(&result.output_path),
            LinkStyle::Url(base) => format!("{base}{}", metadata.image_url),
        };
        let preview = thumbnail(&result.output_path).await?;

        Ok(json!({
            "content": [
                { "type": "text", "text": text },
                {
                    "type": "resource_link",
                    "uri": uri,
                    "name": result.filename,
                    "mimeType": "image/png",
                },
                {
                    "type": "image",
                    "data": BASE64_STANDARD.encode(preview),
                    "mimeType": "image/png",
                },
            ],
            "isError": false,
        }))
    }
}

fn text_result(value: &impl Serialize) -> Result<Value, RpcError> {
    let text =
        serde_json::to_string(value).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?;
    Ok(json!({ "content": [{ "type": "text", "text": text }], "isError": false }))
}

fn file_uri(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let display = absolute.to_string_lossy().replace('\\', "/");
    if display.starts_with('/') {
        format!("file://{display}")
    } else {
        format!("file:///{display}")
    }
}

async fn thumbnail(path: &Path) -> Result<Vec<u8>, RpcError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let img = image::open(&path)?;
        thumbnail_png(&img, THUMBNAIL_MAX_SIDE)
    })
    .await
    .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))?
    .map_err(|e| RpcError::new(INTERNAL_ERROR, format!("building preview: {e:#}")))
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "generate",
            "description": "Generate an image from a text prompt and save it to the studio's output directory.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "What to draw" },
                    "steps": { "type": "integer", "minimum": 1, "default": zimage_core::DEFAULT_STEPS },
                    "width": { "type": "integer", "default": zimage_core::DEFAULT_WIDTH },
                    "height": { "type": "integer", "default": zimage_core::DEFAULT_HEIGHT },
                    "seed": { "type": "integer", "minimum": 0 },
                    "precision": {
                        "type": "string",
                        "enum": ["full", "q8", "q4"],
                        "default": zimage_core::DEFAULT_PRECISION,
                    },
                    "loras": {
                        "type": "array",
                        "maxItems": zimage_core::engine::MAX_LORAS,
                        "items": {
                            "type": "object",
                            "properties": {
                                "filename": { "type": "string" },
                                "strength": { "type": "number", "default": zimage_core::DEFAULT_LORA_STRENGTH },
                            },
                            "required": ["filename"],
                        },
                    },
                },
                "required": ["prompt"],
            },
        },
        {
            "name": "list_models",
            "description": "Describe the detected hardware and the precision tiers that fit on it.",
            "inputSchema": { "type": "object", "properties": {} },
        },
        {
            "name": "list_history",
            "description": "List past generations, newest first.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "minimum": 1, "default": 20 },
                    "offset": { "type": "integer", "minimum": 0, "default": 0 },
                    "q": { "type": "string", "description": "Substring of the prompt" },
                    "start_date": { "type": "string", "format": "date" },
                    "end_date": { "type": "string", "format": "date" },
                },
            },
        },
    ])
}

/// Serves MCP on stdin/stdout, one JSON message per line, until EOF.
pub async fn run_stdio(server: McpServer) -> anyhow::Result<()> {
    info!("Starting MCP stdio transport");
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut writer = tokio::io::stdout();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            info!("MCP client disconnected");
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = server.handle_raw(line.trim().as_bytes()).await {
            let out = serde_json::to_string(&response)?;
            writer.write_all(out.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }
    Ok(())
}

/// `POST /mcp`. Resource links are absolute URLs under the public URL, or
/// under the request's host when none is configured.
pub async fn http_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let base = state.public_url.clone().unwrap_or_else(|| {
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{host}")
    });
    let server = McpServer::new(state.worker.clone(), LinkStyle::Url(base));
    match server.handle_raw(&body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_follow_error_kind() {
        assert_eq!(RpcError::from(Error::invalid("bad")).code, INVALID_PARAMS);
        assert_eq!(
            RpcError::from(Error::UnknownPrecision("q9".into())).code,
            INVALID_PARAMS
        );
        let oom = RpcError::from(Error::generation(anyhow::anyhow!("out of memory")));
        assert_eq!(oom.code, INTERNAL_ERROR);
        assert!(oom.message.contains("q4"));
    }

    #[test]
    fn test_file_uri_is_absolute() {
        let uri = file_uri(Path::new("/srv/outputs/fox.png"));
        assert_eq!(uri, "file:///srv/outputs/fox.png");
        assert!(file_uri(Path::new("fox.png")).starts_with("file:///"));
    }

    #[test]
    fn test_tool_definitions_name_all_tools() {
        let tools = tool_definitions();
        let names: Vec<&str> = tools
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["generate", "list_models", "list_history"]);
    }
}
