//! Registry of endpoint clients.
//!
//! [`ClientRegistry`] holds one [`EndpointClient`] per registered endpoint id, routes
//! tool requests to the right client, and fans out health checks concurrently.
//! Registries are constructed explicitly and handed to whatever needs them; there is
//! no process-wide instance.
//!
//! # Example
//!
//! ```rust,no_run
//! use nero::config::{NeroConfig, Transport};
//! use nero::registry::ClientRegistry;
//! use nero::tool_protocol::ToolRequest;
//! use nero::tool_protocols::ProtocolConnector;
//!
//! # async {
//! let config = NeroConfig::default();
//! let endpoints = vec![
//!     config.endpoint("echo", Transport::Http { url: "http://localhost:8080".into() }),
//!     config.endpoint("frs", Transport::Socket { address: "127.0.0.1:7000".into() }),
//! ];
//! let registry = ClientRegistry::bootstrap(endpoints, &ProtocolConnector::new()).await.unwrap();
//!
//! let health = registry.health_check_all().await;
//! let response = registry.invoke(&ToolRequest::new("echo", "search_facilities")).await;
//! println!("{:?} {}", health, response.is_success());
//! # };
//! ```

use crate::nero::client::{EndpointClient, EndpointMetrics, DEFAULT_ERROR_CAPACITY};
use crate::nero::config::{EndpointConfig, NeroConfig};
use crate::nero::event::EventHandler;
use crate::nero::tool_protocol::{
    ClassifiedError, ResponseMetadata, ToolError, ToolProtocol, ToolRequest, ToolResponse,
};
use crate::nero::tool_protocols::ProtocolConnector;
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Owns the clients for every registered endpoint.
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<EndpointClient>>>,
    error_capacity: usize,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            error_capacity: DEFAULT_ERROR_CAPACITY,
            event_handler: None,
        }
    }

    /// Clients created by this registry use the config's error ring capacity.
    pub fn with_config(config: &NeroConfig) -> Self {
        Self {
            error_capacity: config.error_ring_capacity,
            ..Self::new()
        }
    }

    /// Attach `handler` to every client created by [`register`](Self::register).
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Build a default registry and register every endpoint in `configs`.
    ///
    /// Fails if a config names an in-process pipe the connector does not know.
    pub async fn bootstrap<I>(configs: I, connector: &ProtocolConnector) -> Result<Self, ToolError>
    where
        I: IntoIterator<Item = EndpointConfig>,
    {
        Self::new().connect_all(configs, connector).await
    }

    /// Register every endpoint in `configs` on an already configured registry.
    ///
    /// ```rust,ignore
    /// let registry = ClientRegistry::with_config(&config)
    ///     .with_event_handler(handler)
    ///     .connect_all(NeroConfig::endpoints_from_json(catalog)?, &connector)
    ///     .await?;
    /// ```
    pub async fn connect_all<I>(
        self,
        configs: I,
        connector: &ProtocolConnector,
    ) -> Result<Self, ToolError>
    where
        I: IntoIterator<Item = EndpointConfig>,
    {
        for config in configs {
            let protocol = connector.connect(&config)?;
            self.register(config, protocol).await;
        }
        Ok(self)
    }

    /// Create and store a client for `config`.
    ///
    /// Re-registering an id replaces the previous client, discarding its metrics.
    pub async fn register(
        &self,
        config: EndpointConfig,
        protocol: Arc<dyn ToolProtocol>,
    ) -> Arc<EndpointClient> {
        let mut client =
            EndpointClient::new(config, protocol).with_error_capacity(self.error_capacity);
        if let Some(handler) = &self.event_handler {
            client = client.with_event_handler(handler.clone());
        }
        let client = Arc::new(client);
        self.register_client(client.clone()).await;
        client
    }

    /// Store a pre-built client, returning the one it replaced.
    pub async fn register_client(&self, client: Arc<EndpointClient>) -> Option<Arc<EndpointClient>> {
        let id = client.endpoint_id().to_string();
        log::info!(
            "nero::registry: registering endpoint '{}' ({})",
            id,
            client.config().transport.kind()
        );
        let previous = self.clients.write().await.insert(id.clone(), client);
        if previous.is_some() {
            log::info!("nero::registry: replaced existing client for '{}'", id);
        }
        previous
    }

    pub async fn unregister(&self, endpoint_id: &str) -> Option<Arc<EndpointClient>> {
        self.clients.write().await.remove(endpoint_id)
    }

    pub async fn get(&self, endpoint_id: &str) -> Option<Arc<EndpointClient>> {
        self.clients.read().await.get(endpoint_id).cloned()
    }

    /// Registered endpoint ids, sorted.
    pub async fn endpoint_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Route `request` to its endpoint's client.
    ///
    /// An unknown endpoint yields an `endpoint-not-found` failure with a retry count
    /// of zero.
    pub async fn invoke(&self, request: &ToolRequest) -> ToolResponse {
        // Clone the client out so the map lock is released before the call
        match self.get(&request.endpoint_id).await {
            Some(client) => client.invoke(request).await,
            None => {
                log::warn!(
                    "nero::registry: no endpoint '{}' for tool '{}'",
                    request.endpoint_id,
                    request.tool_name
                );
                ToolResponse::failure(
                    ClassifiedError::endpoint_not_found(&request.endpoint_id),
                    ResponseMetadata {
                        endpoint_id: request.endpoint_id.clone(),
                        tool_name: request.tool_name.clone(),
                        duration: Duration::ZERO,
                        timestamp: Utc::now(),
                        retry_count: 0,
                    },
                )
            }
        }
    }

    /// Run independent requests concurrently; responses come back in request order.
    pub async fn invoke_many(&self, requests: &[ToolRequest]) -> Vec<ToolResponse> {
        join_all(requests.iter().map(|request| self.invoke(request))).await
    }

    /// Metrics snapshot for every registered endpoint.
    pub async fn all_metrics(&self) -> HashMap<String, EndpointMetrics> {
        self.clients
            .read()
            .await
            .iter()
            .map(|(id, client)| (id.clone(), client.metrics()))
            .collect()
    }

    /// Health-check every endpoint concurrently, one task per endpoint.
    ///
    /// A check that panics is reported as unhealthy for that endpoint only.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let clients: Vec<(String, Arc<EndpointClient>)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(id, client)| (id.clone(), client.clone()))
            .collect();

        let checks = clients.into_iter().map(|(id, client)| {
            let handle = tokio::spawn(async move { client.health_check().await });
            async move {
                let healthy = match handle.await {
                    Ok(healthy) => healthy,
                    Err(e) => {
                        log::error!("nero::registry: health check task for '{}' failed: {}", id, e);
                        false
                    }
                };
                (id, healthy)
            }
        });

        join_all(checks).await.into_iter().collect()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
