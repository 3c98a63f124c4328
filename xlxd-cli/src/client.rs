//! Thin REST client for the xlxd API.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct ServerInfo {
    pub api_compat: String,
    pub auth: String,
    pub environment: Option<ServerEnvironment>,
}

#[derive(Debug, Deserialize)]
pub struct ServerEnvironment {
    pub server: String,
    pub server_version: String,
    pub backend: String,
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub kernel_architecture: String,
    #[serde(default)]
    pub kernel_version: String,
    #[serde(default)]
    pub server_pid: u32,
    pub operations_active: usize,
    pub operations_limit: usize,
    pub event_listeners: usize,
    pub events_dropped: u64,
}

#[derive(Debug, Deserialize)]
pub struct Operation {
    pub id: String,
    pub class: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: String,
    pub status_code: u16,
    #[serde(default)]
    pub resources: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub metadata: Value,
    pub may_cancel: bool,
    #[serde(default)]
    pub err: String,
}

impl Operation {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "Success" | "Failure" | "Cancelled")
    }
}

#[derive(Debug, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub stateful: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct Container {
    pub name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Deserialize)]
struct ContainerList {
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
}

pub struct Client {
    http: reqwest::Client,
    server: String,
    token: Option<String>,
}

impl Client {
    pub fn new(server: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/1.0{}", self.server, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                anyhow!("Cannot connect to xlxd daemon at {}", self.server)
            } else {
                anyhow::Error::new(e)
            }
        })?;
        self.send_checked(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)).await?;
        response
            .json()
            .await
            .with_context(|| format!("invalid response from {}", path))
    }

    async fn submit(&self, builder: RequestBuilder) -> Result<Operation> {
        let response = self.send(builder).await?;
        response.json().await.context("invalid operation record")
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        self.get("").await
    }

    pub async fn containers(&self) -> Result<Vec<Container>> {
        let list: ContainerList = self.get("/containers").await?;
        Ok(list.containers)
    }

    pub async fn container(&self, name: &str) -> Result<Container> {
        self.get(&format!("/containers/{}", name)).await
    }

    pub async fn create_container(&self, name: &str) -> Result<Operation> {
        self.submit(
            self.request(Method::POST, "/containers")
                .json(&serde_json::json!({ "name": name })),
        )
        .await
    }

    pub async fn delete_container(&self, name: &str) -> Result<Operation> {
        self.submit(self.request(Method::DELETE, &format!("/containers/{}", name)))
            .await
    }

    pub async fn update_state(&self, name: &str, body: Value) -> Result<Operation> {
        self.submit(
            self.request(Method::PUT, &format!("/containers/{}/state", name))
                .json(&body),
        )
        .await
    }

    pub async fn snapshot(&self, name: &str, body: Value) -> Result<Operation> {
        self.submit(
            self.request(Method::POST, &format!("/containers/{}/snapshots", name))
                .json(&body),
        )
        .await
    }

    pub async fn exec(&self, name: &str, body: Value) -> Result<Operation> {
        self.submit(
            self.request(Method::POST, &format!("/containers/{}/exec", name))
                .json(&body),
        )
        .await
    }

    /// Operation records grouped by status.
    pub async fn operations(&self) -> Result<BTreeMap<String, Vec<Operation>>> {
        self.get("/operations?recursion=1").await
    }

    pub async fn operation(&self, id: &str) -> Result<Operation> {
        self.get(&format!("/operations/{}", id)).await
    }

    /// Cancel a running operation, or forget a finished one.
    pub async fn cancel_operation(&self, id: &str) -> Result<Operation> {
        self.submit(self.request(Method::DELETE, &format!("/operations/{}", id)))
            .await
    }

    /// Block until the operation is terminal. A negative timeout waits forever.
    pub async fn wait(&self, id: &str, timeout: i64) -> Result<Operation> {
        let path = format!("/operations/{}/wait?timeout={}", id, timeout);
        let response = self
            .request(Method::GET, &path)
            .send()
            .await
            .with_context(|| format!("Cannot connect to xlxd daemon at {}", self.server))?;
        if response.status() == StatusCode::REQUEST_TIMEOUT {
            bail!("operation {} still running after {}s", id, timeout);
        }
        let response = self.send_checked(response).await?;
        response.json().await.context("invalid operation record")
    }

    async fn send_checked(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match response.json::<ApiError>().await {
            Ok(body) => bail!("{} ({})", body.error, status.as_u16()),
            Err(_) => bail!("request failed: {}", status),
        }
    }

    /// Wait for the operation and turn anything but success into an error.
    pub async fn wait_for_success(&self, op: &Operation) -> Result<Operation> {
        let done = self.wait(&op.id, -1).await?;
        match done.status.as_str() {
            "Success" => Ok(done),
            "Cancelled" => bail!("{}: cancelled", done.description),
            _ => bail!("{}: {}", done.description, done.err),
        }
    }

    /// Open the event stream; the response body is server-sent events.
    pub async fn events(&self, types: &[String]) -> Result<Response> {
        let mut builder = self.request(Method::GET, "/events");
        if !types.is_empty() {
            builder = builder.query(&[("type", types.join(","))]);
        }
        self.send(builder).await
    }
}
