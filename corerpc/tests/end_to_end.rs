//! Full-stack integration scenarios exercising a real TCP listener against
//! a real client, plus the literal end-to-end scenarios from spec.md §8
//! that span more than one module.

use std::sync::Arc;
use std::time::Duration;

use corerpc::balancer::{LoadBalancer, RoundRobinBalancer};
use corerpc::breaker::{BreakerConfig, CircuitBreakerManager, CircuitState};
use corerpc::client::Client;
use corerpc::server::{Handler, Server, Service, ServiceRegistry};
use corerpc::{RpcRequest, RpcResponse, ServiceEndpoint, ServiceKey};

fn sample_request() -> RpcRequest {
    RpcRequest {
        interface: "com.example.Greeter".into(),
        method: "sayHello".into(),
        group: "default".into(),
        version: "1.0".into(),
        param_types: vec![],
        params: vec![serde_json::json!("world")],
        auth_token: None,
        client_address: None,
        timestamp_ms: 0,
        attributes: Default::default(),
    }
}

struct Greeter;

#[async_trait::async_trait]
impl Handler for Greeter {
    async fn handle(&self, request: &RpcRequest) -> corerpc::Result<serde_json::Value> {
        Ok(serde_json::json!({ "greeting": format!("hello, {}", request.params[0]) }))
    }
}

fn greeter_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry.register(
        ServiceKey::new("com.example.Greeter", "default", "1.0"),
        Service::new().method("sayHello", Arc::new(Greeter)),
    );
    registry
}

#[tokio::test]
async fn client_and_server_round_trip_a_call_over_real_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Server::new(greeter_registry(), corerpc::interceptor::InterceptorChain::new());
    tokio::spawn(server.serve(listener));

    let client = Client::connect(ServiceEndpoint::new("127.0.0.1", addr.port()), "greeter").await.unwrap();
    let response = client.call(sample_request()).await.unwrap();
    assert!(response.is_success());
    assert_eq!(response.payload.unwrap()["greeting"], serde_json::json!("hello, \"world\""));
}

#[tokio::test]
async fn client_and_server_handle_concurrent_calls_over_one_connection() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(greeter_registry(), corerpc::interceptor::InterceptorChain::new());
    tokio::spawn(server.serve(listener));

    let client = Client::connect(ServiceEndpoint::new("127.0.0.1", addr.port()), "greeter").await.unwrap();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.call(sample_request()).await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_success());
    }
}

/// Scenario 1 (spec.md §8): round-robin over three endpoints yields
/// `8001, 8002, 8003, 8001, 8002, 8003` for six successive selections.
#[test]
fn round_robin_determinism_scenario() {
    let balancer = RoundRobinBalancer::new();
    let endpoints = vec![
        ServiceEndpoint::new("127.0.0.1", 8001),
        ServiceEndpoint::new("127.0.0.1", 8002),
        ServiceEndpoint::new("127.0.0.1", 8003),
    ];
    let request = sample_request();
    let ports: Vec<u16> = (0..6)
        .map(|_| balancer.select(&endpoints, &request).unwrap().port)
        .collect();
    assert_eq!(ports, vec![8001, 8002, 8003, 8001, 8002, 8003]);
}

/// Scenario 3 (spec.md §8): threshold 3, recovery 50ms. Three consecutive
/// failures open the breaker; admission is denied until the recovery
/// window elapses, then the first admit flips it to half-open.
#[tokio::test]
async fn circuit_breaker_trips_then_recovers_after_real_delay() {
    let manager = CircuitBreakerManager::new(BreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_millis(50),
        half_open_max_calls: 3,
    });
    for _ in 0..3 {
        manager.record_failure("payments");
    }
    assert_eq!(manager.state_of("payments"), CircuitState::Open);
    assert!(manager.admit("payments").is_err());

    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(manager.admit("payments").is_ok());
    assert_eq!(manager.state_of("payments"), CircuitState::HalfOpen);
}
