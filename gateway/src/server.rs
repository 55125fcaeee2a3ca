use std::sync::Arc;

use clap::Args;
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::{Gateway, TOOL_CONFIRM_REQUEST, TOOL_GATEWAY_STATUS};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const MCP_SERVER_NAME: &str = "relay-mcp";

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Explicit backend bearer token (otherwise RELAY_BACKEND_TOKEN or the
    /// stored credentials file)
    #[arg(long, env = "RELAY_MCP_TOKEN")]
    pub token: Option<String>,
    /// Client identity override for lease ownership and workspace
    /// resolution (defaults to a token fingerprint)
    #[arg(long)]
    pub client_id: Option<String>,
}

#[derive(Debug)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

/// JSON-RPC 2.0 server over the gateway façade. One instance per stdio
/// session; HTTP requests build a short-lived instance per call (shared
/// state lives in the `Gateway`, not here).
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    client_id: String,
}

impl GatewayServer {
    pub fn new(gateway: Arc<Gateway>, client_id: String) -> Self {
        Self { gateway, client_id }
    }

    pub async fn serve_stdio(&self) -> Result<(), String> {
        tracing::info!(
            event = "mcp_stdio_started",
            client_id = %self.client_id,
            "serving MCP over stdio"
        );

        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    pub async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; the server issues no
            // outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method).await;
            None
        }
    }

    async fn handle_notification(&self, method: &str) {
        if matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            return;
        }
        // Unknown notifications are intentionally ignored.
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload().await),
            "tools/call" => self.handle_tools_call(params).await,
            "prompts/list" => Ok(json!({ "prompts": [] })),
            "resources/list" => Ok(json!({ "resources": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        let namespace = self.gateway.namespace();
        let instructions = format!(
            "Tools follow a three-tier naming scheme: {namespace}_tool_* are read-only and directly callable; \
             {namespace}_run_* mutate state and require a confirmation token; {namespace}_playbook_* are \
             backend workflows, also confirmation-gated. When a call returns status \"confirmation_required\", \
             call {TOOL_CONFIRM_REQUEST} with the tool_name (and an action_preview for destructive operations) \
             to obtain a single-use confirm_token, then retry the original call with it. Tokens expire after a \
             few minutes and are consumed on use. Use {TOOL_GATEWAY_STATUS} to inspect catalog freshness."
        );
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "prompts": {
                    "listChanged": false
                },
                "resources": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": instructions,
            "gatewayStatus": self.gateway.status_value()
        })
    }

    async fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = self
            .gateway
            .list_tools()
            .await
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let envelope = self.gateway.invoke_tool(name, &args, &self.client_id).await;
        // "confirmation_required" is a structured next-step, not an error.
        let is_error = envelope.get("status").and_then(Value::as_str) == Some("error");
        Ok(build_tool_call_response(envelope, is_error))
    }
}

/// HTTP entry point: handles one JSON-RPC payload (single or batch) on
/// behalf of an authenticated client.
pub async fn handle_http_jsonrpc(
    gateway: Arc<Gateway>,
    client_id: String,
    incoming: Value,
) -> Vec<Value> {
    let server = GatewayServer::new(gateway, client_id);
    server.handle_incoming_message(incoming).await
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    let text = to_pretty_json(&envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

async fn read_framed_json(
    reader: &mut BufReader<tokio::io::Stdin>,
) -> Result<Option<Value>, std::io::Error> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json(
    writer: &mut tokio::io::Stdout,
    value: &Value,
) -> Result<(), std::io::Error> {
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

/// Derives a stdio session client identity from the backend token, or a
/// random one when running tokenless against a dev backend.
pub fn stdio_client_id(token: Option<&str>) -> String {
    match token {
        Some(token) => relay_core::auth::client_fingerprint(token),
        None => format!("cid-stdio-{}", Uuid::now_v7().simple()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::workspace::StaticWorkspaceAuthority;
    use async_trait::async_trait;
    use relay_core::receipt::ContextEnvelope;

    struct NullBackend;

    #[async_trait]
    impl crate::backend::BackendClient for NullBackend {
        async fn invoke(
            &self,
            canonical: &str,
            _workspace_id: Uuid,
            _payload: &Value,
            _context: Option<&ContextEnvelope>,
        ) -> Result<Value, crate::backend::BackendError> {
            Ok(json!({ "invoked": canonical }))
        }

        async fn catalog(
            &self,
        ) -> Result<crate::catalog::CatalogResponse, crate::backend::BackendError> {
            Ok(crate::catalog::CatalogResponse::default())
        }

        async fn resolve_workspace(
            &self,
            _external_key: &str,
        ) -> Result<Uuid, crate::backend::BackendError> {
            Ok(Uuid::now_v7())
        }

        async fn lens(
            &self,
            _op: crate::backend::LensOp,
            _workspace_id: Uuid,
            _body: Option<Value>,
        ) -> Result<Value, crate::backend::BackendError> {
            Ok(Value::Null)
        }
    }

    fn server() -> GatewayServer {
        let gateway = Arc::new(Gateway::new(
            GatewayConfig::default(),
            Arc::new(NullBackend),
            Arc::new(StaticWorkspaceAuthority::new(Uuid::now_v7())),
        ));
        GatewayServer::new(gateway, "cid-test".to_string())
    }

    #[tokio::test]
    async fn initialize_advertises_protocol_and_tier_instructions() {
        let server = server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize"
            }))
            .await;
        assert_eq!(responses.len(), 1);
        let result = &responses[0]["result"];
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        let instructions = result["instructions"].as_str().unwrap();
        assert!(instructions.contains("relay_tool_"));
        assert!(instructions.contains("relay_run_"));
        assert!(instructions.contains(TOOL_CONFIRM_REQUEST));
    }

    #[tokio::test]
    async fn rejects_wrong_jsonrpc_version() {
        let server = server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "1.0",
                "id": 7,
                "method": "ping"
            }))
            .await;
        assert_eq!(responses[0]["error"]["code"], -32600);
        assert_eq!(responses[0]["id"], 7);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let server = server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/destroy"
            }))
            .await;
        assert_eq!(responses[0]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let server = server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized"
            }))
            .await;
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn batch_requests_return_one_response_per_request() {
        let server = server();
        let responses = server
            .handle_incoming_message(json!([
                { "jsonrpc": "2.0", "id": 1, "method": "ping" },
                { "jsonrpc": "2.0", "method": "notifications/initialized" },
                { "jsonrpc": "2.0", "id": 2, "method": "ping" }
            ]))
            .await;
        assert_eq!(responses.len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() {
        let server = server();
        let responses = server.handle_incoming_message(json!([])).await;
        assert_eq!(responses[0]["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn tools_call_requires_name() {
        let server = server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "arguments": {} }
            }))
            .await;
        assert_eq!(responses[0]["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn tool_errors_surface_as_is_error_content_not_rpc_errors() {
        let server = server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": { "name": "definitely_not_a_tool" }
            }))
            .await;
        let result = &responses[0]["result"];
        assert_eq!(result["isError"], true);
        assert_eq!(result["structuredContent"]["error"]["error"], "unknown_tool");
    }

    #[tokio::test]
    async fn confirmation_required_is_not_marked_as_error() {
        let server = server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": { "name": "relay_run_notes_update_note", "arguments": {} }
            }))
            .await;
        let result = &responses[0]["result"];
        assert!(result.get("isError").is_none());
        assert_eq!(
            result["structuredContent"]["status"],
            "confirmation_required"
        );
    }

    #[tokio::test]
    async fn tools_list_includes_intrinsic_tools() {
        let server = server();
        let responses = server
            .handle_incoming_message(json!({
                "jsonrpc": "2.0",
                "id": 6,
                "method": "tools/list"
            }))
            .await;
        let tools = responses[0]["result"]["tools"].as_array().unwrap();
        let names: Vec<&str> = tools
            .iter()
            .filter_map(|tool| tool["name"].as_str())
            .collect();
        assert!(names.contains(&TOOL_CONFIRM_REQUEST));
        assert!(names.contains(&TOOL_GATEWAY_STATUS));
    }

    #[test]
    fn stdio_client_id_is_stable_for_a_token() {
        assert_eq!(
            stdio_client_id(Some("token-a")),
            stdio_client_id(Some("token-a"))
        );
        assert_ne!(stdio_client_id(None), stdio_client_id(None));
    }
}
