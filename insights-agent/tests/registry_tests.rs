// ABOUTME: Tests for the BackendRegistry and BackendFactory pattern.
// ABOUTME: Validates runtime backend selection by name and from a config file.

use insights_agent::backends::mock::MockBackend;
use insights_agent::registry::{BackendFactory, BackendRegistry};
use insights_agent::{AgentBackend, Config, CreateSessionRequest, Provider};
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_registry_lists_every_backend_family() {
    let registry = BackendRegistry::default();
    assert_eq!(registry.available(), vec!["acp", "app-server", "cli", "mock"]);
}

#[test]
fn test_registry_creates_each_backend() {
    let registry = BackendRegistry::default();
    assert_eq!(registry.create("mock", &json!({})).unwrap().name(), "mock");
    assert_eq!(registry.create("cli", &json!({})).unwrap().name(), "cli");
    assert_eq!(
        registry.create("app-server", &json!({})).unwrap().provider(),
        Provider::AppServer
    );
    assert_eq!(
        registry
            .create("acp", &json!({"binary": "claude-code-acp"}))
            .unwrap()
            .name(),
        "acp"
    );
}

#[test]
fn test_acp_requires_binary() {
    let registry = BackendRegistry::default();
    assert!(registry.create("acp", &json!({})).is_err());
}

#[test]
fn test_registry_unknown_backend_errors() {
    let registry = BackendRegistry::default();
    match registry.create("nonexistent", &json!({})) {
        Err(err) => assert!(err.to_string().contains("Unknown backend: nonexistent")),
        Ok(_) => panic!("Expected error for unknown backend"),
    }
}

#[test]
fn test_registry_custom_factory() {
    let factory: BackendFactory = Box::new(|_config| Ok(Arc::new(MockBackend::new())));
    let registry = BackendRegistry::new().register("custom", factory);
    assert_eq!(registry.available(), vec!["custom"]);
    assert_eq!(registry.create("custom", &json!(null)).unwrap().name(), "mock");
}

#[tokio::test]
async fn test_create_from_config_passes_backend_table() {
    let config = Config::parse(
        r#"
[backend]
type = "mock"
models = ["small", "large"]

[[backend.responses]]
pattern = "ping"
text = "pong"
"#,
    )
    .unwrap();
    let backend = BackendRegistry::default()
        .create_from_config(&config.backend)
        .unwrap();

    let models = backend.list_models().await.unwrap();
    assert_eq!(models.len(), 2);
    assert!(backend.capabilities().supports_model_listing);

    let session = backend
        .create_session(CreateSessionRequest::new("/tmp").with_prompt("ping"))
        .await
        .unwrap();
    let mut events = session.subscribe_events();
    let text = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let insights_agent::EventKind::Text { text, .. } = event.kind {
                return text;
            }
        }
        String::new()
    })
    .await
    .unwrap();
    assert_eq!(text, "pong");
}
