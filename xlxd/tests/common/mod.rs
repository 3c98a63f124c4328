//! Shared test utilities for xlxd integration tests.

#![allow(dead_code)]

use reqwest::{Client, Response as ReqwestResponse};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use xlxd::backend::{ContainerStatus, DevBackend};
use xlxd::{Daemon, DaemonConfig, EngineConfig, EventBus};

/// Test server wrapper running a daemon on the in-memory backend.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    pub backend: Arc<DevBackend>,
    token: Option<String>,
    daemon: Daemon,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    /// Spawn a test server where every caller is trusted.
    pub async fn spawn() -> Self {
        Self::spawn_with(DaemonConfig {
            engine: EngineConfig {
                cancel_grace: Duration::from_secs(2),
                ..EngineConfig::default()
            },
            backend_latency: Duration::from_millis(20),
            ..DaemonConfig::default()
        })
        .await
    }

    pub async fn spawn_with(config: DaemonConfig) -> Self {
        let events = EventBus::new(config.event_buffer);
        let backend = Arc::new(DevBackend::new(events.clone(), config.backend_latency));
        let token = config.trust_token.clone();
        let daemon = Daemon::with_backend(config, events, backend.clone());
        let router = daemon.router();

        // Bind to port 0 to let the OS choose an available port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            client: Client::new(),
            backend,
            token,
            daemon,
            shutdown_tx,
        }
    }

    /// Seed a container directly in the backend.
    pub fn seed(&self, name: &str, status: ContainerStatus) {
        self.backend.insert(name, status);
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/1.0", self.addr)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}/1.0{}", self.addr, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url(), path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Perform a GET request.
    pub async fn get(&self, path: &str) -> ReqwestResponse {
        self.request(reqwest::Method::GET, path)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a GET request without credentials.
    pub async fn get_anonymous(&self, path: &str) -> ReqwestResponse {
        self.client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a POST request with JSON body.
    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a PUT request with JSON body.
    pub async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.request(reqwest::Method::PUT, path)
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a DELETE request.
    pub async fn delete(&self, path: &str) -> ReqwestResponse {
        self.request(reqwest::Method::DELETE, path)
            .send()
            .await
            .expect("Request failed")
    }

    /// Wait for an operation and return its terminal record.
    pub async fn wait(&self, operation: &Value) -> Value {
        let id = operation["id"].as_str().expect("operation id");
        let response = self
            .get(&format!("/operations/{}/wait?timeout=10", id))
            .await;
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    /// Shutdown the server and drain the engine.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        self.daemon.shutdown().await;
    }
}
