//! Tool Protocol Implementations
//!
//! Concrete [`ToolProtocol`] transports, one per [`Transport`] kind:
//!
//! - **LocalToolProtocol**: Rust closures (sync and async) behind an in-process pipe
//! - **HttpToolProtocol**: HTTP client for remote tool servers
//! - **SocketToolProtocol**: newline-delimited JSON over a TCP stream
//!
//! [`ProtocolConnector`] turns an [`EndpointConfig`] into the matching transport.
//!
//! # Example
//!
//! ```rust,no_run
//! use nero::config::{EndpointConfig, Transport};
//! use nero::tool_protocols::{LocalToolProtocol, ProtocolConnector};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async {
//! let local = Arc::new(LocalToolProtocol::new());
//! local
//!     .register_tool("ping", Arc::new(|_args| Ok(json!("pong"))))
//!     .await;
//!
//! let connector = ProtocolConnector::new().with_local("calc", local);
//! let protocol = connector
//!     .connect(&EndpointConfig::new("calc", Transport::InProcess { name: "calc".into() }))
//!     .unwrap();
//! assert_eq!(protocol.protocol_name(), "in-process");
//! # };
//! ```

use crate::nero::config::{EndpointConfig, Transport};
use crate::nero::tool_protocol::{ToolArguments, ToolError, ToolProtocol};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::RwLock;

/// Type alias for synchronous tool functions exposed via the local adapter.
pub type ToolFunction =
    Arc<dyn Fn(ToolArguments) -> Result<JsonValue, Box<dyn Error + Send + Sync>> + Send + Sync>;

/// Type alias for asynchronous tool functions exposed via the local adapter.
pub type AsyncToolFunction = Arc<
    dyn Fn(
            ToolArguments,
        )
            -> Pin<Box<dyn Future<Output = Result<JsonValue, Box<dyn Error + Send + Sync>>> + Send>>
        + Send
        + Sync,
>;

/// In-process tool adapter.
///
/// Registers Rust functions as tools. Useful for built-in endpoints and for tests
/// that need a deterministic, scriptable endpoint.
pub struct LocalToolProtocol {
    sync_functions: RwLock<HashMap<String, ToolFunction>>,
    async_functions: RwLock<HashMap<String, AsyncToolFunction>>,
}

impl LocalToolProtocol {
    pub fn new() -> Self {
        Self {
            sync_functions: RwLock::new(HashMap::new()),
            async_functions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a synchronous tool function.
    ///
    /// Subsequent calls will overwrite any existing tool with the same name.
    pub async fn register_tool(&self, name: impl Into<String>, function: ToolFunction) {
        let name = name.into();
        self.async_functions.write().await.remove(&name);
        self.sync_functions.write().await.insert(name, function);
    }

    /// Register an asynchronous tool function.
    pub async fn register_async_tool(&self, name: impl Into<String>, function: AsyncToolFunction) {
        let name = name.into();
        self.sync_functions.write().await.remove(&name);
        self.async_functions.write().await.insert(name, function);
    }

    pub async fn unregister_tool(&self, name: &str) {
        self.sync_functions.write().await.remove(name);
        self.async_functions.write().await.remove(name);
    }

    /// Names of every registered tool, sorted.
    pub async fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sync_functions.read().await.keys().cloned().collect();
        names.extend(self.async_functions.read().await.keys().cloned());
        names.sort();
        names
    }
}

impl Default for LocalToolProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for LocalToolProtocol {
    async fn call(
        &self,
        tool_name: &str,
        arguments: &ToolArguments,
    ) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        // Clone the handle out so the lock is not held while the tool runs
        let async_func = self.async_functions.read().await.get(tool_name).cloned();
        if let Some(func) = async_func {
            return func(arguments.clone()).await;
        }

        let sync_func = self.sync_functions.read().await.get(tool_name).cloned();
        if let Some(func) = sync_func {
            return func(arguments.clone());
        }

        Err(Box::new(ToolError::NotFound(tool_name.to_string())))
    }

    fn protocol_name(&self) -> &str {
        "in-process"
    }
}

/// Wire shape shared by the HTTP and socket transports.
#[derive(Debug, Serialize)]
struct RemoteToolCall<'a> {
    tool: &'a str,
    parameters: &'a ToolArguments,
}

#[derive(Debug, Deserialize)]
struct RemoteToolResult {
    success: bool,
    #[serde(default)]
    output: JsonValue,
    #[serde(default)]
    error: Option<String>,
}

impl RemoteToolResult {
    fn into_payload(self) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        if self.success {
            Ok(self.output)
        } else {
            Err(Box::new(ToolError::ExecutionFailed(
                self.error.unwrap_or_else(|| "remote tool reported failure".to_string()),
            )))
        }
    }
}

/// HTTP tool server adapter.
///
/// Posts `{"tool": ..., "parameters": {...}}` to `{endpoint}/execute` and expects a
/// `{"success": bool, "output": ..., "error": ...}` body back. Timeouts are enforced by
/// the owning client, not by the HTTP layer.
pub struct HttpToolProtocol {
    endpoint: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpToolProtocol {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            bearer_token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every call.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ToolProtocol for HttpToolProtocol {
    async fn call(
        &self,
        tool_name: &str,
        arguments: &ToolArguments,
    ) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        let mut request = self
            .client
            .post(format!("{}/execute", self.endpoint))
            .json(&RemoteToolCall {
                tool: tool_name,
                parameters: arguments,
            });
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                Box::new(ToolError::Connection(e.to_string())) as Box<dyn Error + Send + Sync>
            } else {
                Box::new(e) as Box<dyn Error + Send + Sync>
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Box::new(ToolError::Unauthorized(format!(
                "tool server returned status: {}",
                status
            ))));
        }
        if status == reqwest::StatusCode::CONFLICT {
            return Err(Box::new(ToolError::Conflict(format!(
                "tool server returned status: {}",
                status
            ))));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Box::new(ToolError::NotFound(tool_name.to_string())));
        }
        if !status.is_success() {
            return Err(Box::new(ToolError::ProtocolError(format!(
                "server returned status: {}",
                status
            ))));
        }

        let result: RemoteToolResult = response
            .json()
            .await
            .map_err(|e| ToolError::ProtocolError(e.to_string()))?;
        result.into_payload()
    }

    fn protocol_name(&self) -> &str {
        "http"
    }
}

/// Socket-stream adapter speaking newline-delimited JSON.
///
/// Each call opens a fresh connection, writes one request line and reads one
/// response line.
pub struct SocketToolProtocol {
    address: String,
}

impl SocketToolProtocol {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl ToolProtocol for SocketToolProtocol {
    async fn call(
        &self,
        tool_name: &str,
        arguments: &ToolArguments,
    ) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| ToolError::Connection(format!("{}: {}", self.address, e)))?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(&RemoteToolCall {
            tool: tool_name,
            parameters: arguments,
        })?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ToolError::Connection(e.to_string()))?;

        let mut reply = String::new();
        let read = BufReader::new(reader)
            .read_line(&mut reply)
            .await
            .map_err(|e| ToolError::Connection(e.to_string()))?;
        if read == 0 {
            return Err(Box::new(ToolError::Connection(
                "socket closed before a reply was received".to_string(),
            )));
        }

        let result: RemoteToolResult = serde_json::from_str(reply.trim_end())
            .map_err(|e| ToolError::ProtocolError(e.to_string()))?;
        result.into_payload()
    }

    fn protocol_name(&self) -> &str {
        "socket"
    }
}

/// Builds the transport for an [`EndpointConfig`].
///
/// In-process pipes are resolved by name against the protocols handed to
/// [`ProtocolConnector::with_local`].
#[derive(Default)]
pub struct ProtocolConnector {
    local: HashMap<String, Arc<dyn ToolProtocol>>,
}

impl ProtocolConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an in-process protocol available under `name`.
    pub fn with_local(mut self, name: impl Into<String>, protocol: Arc<dyn ToolProtocol>) -> Self {
        self.local.insert(name.into(), protocol);
        self
    }

    pub fn connect(&self, config: &EndpointConfig) -> Result<Arc<dyn ToolProtocol>, ToolError> {
        match &config.transport {
            Transport::InProcess { name } => self.local.get(name).cloned().ok_or_else(|| {
                ToolError::Connection(format!("no in-process pipe named '{}'", name))
            }),
            Transport::Http { url } => Ok(Arc::new(HttpToolProtocol::new(url.clone()))),
            Transport::Socket { address } => Ok(Arc::new(SocketToolProtocol::new(address.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_local_sync_and_async_tools() {
        let local = LocalToolProtocol::new();
        local
            .register_tool(
                "add",
                Arc::new(|args| {
                    let a = args.get("a").and_then(JsonValue::as_f64).unwrap_or(0.0);
                    let b = args.get("b").and_then(JsonValue::as_f64).unwrap_or(0.0);
                    Ok(json!(a + b))
                }),
            )
            .await;
        local
            .register_async_tool(
                "echo",
                Arc::new(|args| Box::pin(async move { Ok(JsonValue::Object(args)) })),
            )
            .await;

        let mut args = ToolArguments::new();
        args.insert("a".into(), json!(2));
        args.insert("b".into(), json!(3));
        assert_eq!(local.call("add", &args).await.unwrap(), json!(5.0));
        assert_eq!(local.call("echo", &args).await.unwrap()["a"], 2);
        assert_eq!(local.tool_names().await, vec!["add", "echo"]);

        let missing = local.call("nope", &args).await.unwrap_err();
        assert!(missing.to_string().contains("Tool not found"));
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await.unwrap();
            let call: JsonValue = serde_json::from_str(&line).unwrap();
            let reply = json!({"success": true, "output": {"tool": call["tool"]}});
            writer
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        });

        let protocol = SocketToolProtocol::new(address);
        let payload = protocol.call("ping", &ToolArguments::new()).await.unwrap();
        assert_eq!(payload["tool"], "ping");
    }

    #[tokio::test]
    async fn test_socket_unreachable_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let error = SocketToolProtocol::new(address)
            .call("ping", &ToolArguments::new())
            .await
            .unwrap_err();
        assert!(error.to_string().starts_with("Connection error"));
    }

    #[test]
    fn test_connector_missing_pipe() {
        let connector = ProtocolConnector::new();
        let config = EndpointConfig::new("x", Transport::InProcess { name: "x".into() });
        assert!(connector.connect(&config).is_err());

        let http = EndpointConfig::new("h", Transport::Http { url: "http://localhost:1".into() });
        assert_eq!(connector.connect(&http).unwrap().protocol_name(), "http");
    }
}
