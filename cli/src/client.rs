//! HTTP and websocket clients for the conductor server

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

use crate::messages::{
    AcquirePermitsResponse, ClientMessage, ConstraintUsage, ConsumerRequest, Delegate,
    DelegateTask, ExecutionOutcome, NewDelegate, PromotedResponse, ResourceConstraint,
    ServerMessage, TaskRequest,
};

/// REST client
#[derive(Clone)]
pub struct ConductorClient {
    http: reqwest::Client,
    base: Url,
}

impl ConductorClient {
    pub fn new(server: &str) -> Result<Self> {
        let base = Url::parse(server).with_context(|| format!("Invalid server URL: {}", server))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid path: {}", path))
    }

    /// Websocket URL of a delegate's stream
    pub fn stream_url(&self, account: &str, delegate_id: Uuid) -> Result<Url> {
        let mut url = self.url(&format!("/accounts/{}/delegates/{}/stream", account, delegate_id))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("Cannot derive websocket URL from {}", self.base))?;
        Ok(url)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.http.post(self.url(path)?).json(body).send().await?;
        Self::decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)?).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(anyhow!("Server error ({}): {}", status, message));
        }
        Ok(response.json().await?)
    }

    pub async fn register_delegate(&self, account: &str, delegate: &NewDelegate) -> Result<Delegate> {
        self.post(&format!("/accounts/{}/delegates", account), delegate).await
    }

    pub async fn queue_task(&self, account: &str, request: &TaskRequest) -> Result<DelegateTask> {
        self.post(&format!("/accounts/{}/tasks", account), request).await
    }

    /// Synchronous execution. A 504 still carries a timed-out outcome.
    pub async fn execute_task(&self, account: &str, request: &TaskRequest) -> Result<ExecutionOutcome> {
        let response = self
            .http
            .post(self.url(&format!("/accounts/{}/tasks/execute", account))?)
            .json(request)
            .send()
            .await?;
        if response.status() == StatusCode::GATEWAY_TIMEOUT {
            return Ok(response.json().await?);
        }
        Self::decode(response).await
    }

    pub async fn get_task(&self, account: &str, task_id: Uuid) -> Result<DelegateTask> {
        self.get(&format!("/accounts/{}/tasks/{}", account, task_id)).await
    }

    pub async fn ensure_constraint(
        &self,
        account: &str,
        name: &str,
        capacity: u32,
    ) -> Result<ResourceConstraint> {
        self.post(
            &format!("/accounts/{}/constraints", account),
            &serde_json::json!({ "name": name, "capacity": capacity }),
        )
        .await
    }

    pub async fn list_constraints(&self, account: &str) -> Result<Vec<ConstraintUsage>> {
        self.get(&format!("/accounts/{}/constraints", account)).await
    }

    pub async fn acquire_permits(
        &self,
        constraint_id: Uuid,
        unit: &str,
        request: &ConsumerRequest,
    ) -> Result<AcquirePermitsResponse> {
        self.post(
            &format!("/constraints/{}/units/{}/acquire", constraint_id, unit),
            request,
        )
        .await
    }

    pub async fn release_permits(
        &self,
        constraint_id: Uuid,
        unit: &str,
        consumer_id: &str,
    ) -> Result<PromotedResponse> {
        self.post(
            &format!("/constraints/{}/units/{}/release", constraint_id, unit),
            &serde_json::json!({ "consumer_id": consumer_id }),
        )
        .await
    }
}

/// Websocket connection of one delegate
pub struct DelegateStream {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<ServerMessage>,
    #[allow(dead_code)]
    handle: tokio::task::JoinHandle<()>,
}

impl DelegateStream {
    pub async fn connect(url: &Url) -> Result<Self> {
        tracing::info!("Connecting to {}", url);

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        // Channel for outgoing messages
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);

        // Channel for incoming parsed messages
        let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(32);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = out_rx.recv() => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(result) = read.next() => {
                        match result {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(msg) => {
                                        if in_tx.send(msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Failed to parse message: {} - {}", e, text);
                                    }
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Err(e) => {
                                tracing::error!("WebSocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    else => break,
                }
            }
        });

        Ok(Self {
            tx: out_tx,
            rx: in_rx,
            handle,
        })
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.sender().send(msg).await
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// A cloneable handle for sending from other tasks
    pub fn sender(&self) -> StreamSender {
        StreamSender {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<Message>,
}

impl StreamSender {
    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        let json = serde_json::to_string(&msg)?;
        self.tx
            .send(Message::Text(json))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }
}
