use async_trait::async_trait;
use nero::client::EndpointClient;
use nero::config::{EndpointConfig, NeroConfig, Transport};
use nero::registry::ClientRegistry;
use nero::tool_protocol::{ErrorKind, ToolArguments, ToolError, ToolProtocol, ToolRequest};
use nero::tool_protocols::{LocalToolProtocol, ProtocolConnector};
use serde_json::{json, Value as JsonValue};
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Answers every call after `delay`, or fails if `healthy` is false.
struct DelayedProtocol {
    delay: Duration,
    healthy: bool,
}

#[async_trait]
impl ToolProtocol for DelayedProtocol {
    async fn call(
        &self,
        tool_name: &str,
        _arguments: &ToolArguments,
    ) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        tokio::time::sleep(self.delay).await;
        if self.healthy {
            Ok(json!({ "tool": tool_name }))
        } else {
            Err(Box::new(ToolError::Connection("endpoint down".into())))
        }
    }

    fn protocol_name(&self) -> &str {
        "delayed"
    }
}

fn endpoint(id: &str) -> EndpointConfig {
    EndpointConfig::new(id, Transport::InProcess { name: id.into() })
        .with_max_retries(0)
        .with_retry_delay(Duration::from_millis(1))
}

#[tokio::test]
async fn test_unregistered_endpoint_is_a_failure_not_a_panic() {
    let registry = ClientRegistry::new();
    registry
        .register(
            endpoint("alpha"),
            Arc::new(DelayedProtocol {
                delay: Duration::ZERO,
                healthy: true,
            }),
        )
        .await;

    let ok = registry.invoke(&ToolRequest::new("alpha", "echo")).await;
    assert!(ok.is_success());

    let missing = registry.invoke(&ToolRequest::new("beta", "echo")).await;
    assert!(!missing.is_success());
    assert_eq!(missing.error().unwrap().code(), "endpoint-not-found");
    assert_eq!(missing.error().unwrap().kind, ErrorKind::EndpointNotFound);
    assert_eq!(missing.retry_count(), 0);
    assert_eq!(missing.metadata.endpoint_id, "beta");
}

#[tokio::test]
async fn test_health_checks_run_concurrently() {
    let registry = ClientRegistry::new();
    let delay = Duration::from_millis(200);
    for (id, healthy) in [("a", true), ("b", true), ("c", false), ("d", true)] {
        registry
            .register(endpoint(id), Arc::new(DelayedProtocol { delay, healthy }))
            .await;
    }

    let started = Instant::now();
    let health = registry.health_check_all().await;
    let elapsed = started.elapsed();

    assert_eq!(health.len(), 4);
    assert_eq!(health.values().filter(|healthy| !**healthy).count(), 1);
    assert_eq!(health["c"], false);
    assert!(health["a"] && health["b"] && health["d"]);
    // Sequential checks would take at least 800ms
    assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_reregistering_replaces_client_and_metrics() {
    let registry = ClientRegistry::new();
    let protocol = Arc::new(DelayedProtocol {
        delay: Duration::ZERO,
        healthy: true,
    });
    registry.register(endpoint("alpha"), protocol.clone()).await;
    registry.invoke(&ToolRequest::new("alpha", "echo")).await;
    assert_eq!(registry.all_metrics().await["alpha"].total_requests, 1);

    let replacement = Arc::new(EndpointClient::new(endpoint("alpha"), protocol));
    let previous = registry.register_client(replacement).await;
    assert!(previous.is_some());
    assert_eq!(registry.all_metrics().await["alpha"].total_requests, 0);
    assert_eq!(registry.endpoint_ids().await, vec!["alpha".to_string()]);

    assert!(registry.unregister("alpha").await.is_some());
    assert!(registry.get("alpha").await.is_none());
}

#[tokio::test]
async fn test_invoke_many_preserves_request_order() {
    let registry = ClientRegistry::new();
    registry
        .register(
            endpoint("slow"),
            Arc::new(DelayedProtocol {
                delay: Duration::from_millis(50),
                healthy: true,
            }),
        )
        .await;
    registry
        .register(
            endpoint("fast"),
            Arc::new(DelayedProtocol {
                delay: Duration::ZERO,
                healthy: true,
            }),
        )
        .await;

    let responses = registry
        .invoke_many(&[
            ToolRequest::new("slow", "first"),
            ToolRequest::new("fast", "second"),
            ToolRequest::new("missing", "third"),
        ])
        .await;

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].payload().unwrap()["tool"], json!("first"));
    assert_eq!(responses[1].payload().unwrap()["tool"], json!("second"));
    assert_eq!(responses[2].error().unwrap().kind, ErrorKind::EndpointNotFound);
}

#[tokio::test]
async fn test_bootstrap_from_config() {
    let local = Arc::new(LocalToolProtocol::new());
    local
        .register_tool("ping", Arc::new(|_args| Ok(json!("pong"))))
        .await;
    let connector = ProtocolConnector::new().with_local("builtin", local);

    let config = NeroConfig::default();
    let endpoints = vec![
        config.endpoint("builtin", Transport::InProcess { name: "builtin".into() }),
        config.endpoint("permits", Transport::Http { url: "http://127.0.0.1:9".into() }),
    ];
    let registry = ClientRegistry::bootstrap(endpoints, &connector).await.unwrap();
    assert_eq!(
        registry.endpoint_ids().await,
        vec!["builtin".to_string(), "permits".to_string()]
    );
    assert!(registry.get("builtin").await.unwrap().health_check().await);

    let unknown = vec![config.endpoint("ghost", Transport::InProcess { name: "ghost".into() })];
    assert!(ClientRegistry::bootstrap(unknown, &connector).await.is_err());
}

#[tokio::test]
async fn test_registry_config_sets_error_capacity() {
    let config = NeroConfig {
        error_ring_capacity: 1,
        ..NeroConfig::default()
    };
    let registry = ClientRegistry::with_config(&config);
    let client = registry
        .register(
            endpoint("down"),
            Arc::new(DelayedProtocol {
                delay: Duration::ZERO,
                healthy: false,
            }),
        )
        .await;

    registry.invoke(&ToolRequest::new("down", "first")).await;
    registry.invoke(&ToolRequest::new("down", "second")).await;

    let errors = client.recent_errors(10);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].tool_name, "second");
    assert_eq!(errors[0].kind, ErrorKind::Connection);
}

#[tokio::test]
async fn test_register_twice_resets_metrics() {
    let registry = ClientRegistry::new();
    let protocol = Arc::new(DelayedProtocol {
        delay: Duration::ZERO,
        healthy: true,
    });
    let first = registry.register(endpoint("alpha"), protocol.clone()).await;
    registry.invoke(&ToolRequest::new("alpha", "echo")).await;
    registry.invoke(&ToolRequest::new("alpha", "echo")).await;
    assert_eq!(first.metrics().total_requests, 2);

    let second = registry.register(endpoint("alpha"), protocol).await;
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(registry.all_metrics().await["alpha"].total_requests, 0);
    assert_eq!(registry.endpoint_ids().await.len(), 1);
}

#[tokio::test]
async fn test_connect_all_applies_registry_config() {
    let local = Arc::new(LocalToolProtocol::new());
    let connector = ProtocolConnector::new().with_local("builtin", local);
    let config = NeroConfig {
        error_ring_capacity: 1,
        ..NeroConfig::default()
    };

    let registry = ClientRegistry::with_config(&config)
        .connect_all(
            vec![config
                .endpoint("builtin", Transport::InProcess { name: "builtin".into() })
                .with_max_retries(0)],
            &connector,
        )
        .await
        .unwrap();

    registry.invoke(&ToolRequest::new("builtin", "first")).await;
    registry.invoke(&ToolRequest::new("builtin", "second")).await;
    let errors = registry.get("builtin").await.unwrap().recent_errors(10);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].tool_name, "second");
}
