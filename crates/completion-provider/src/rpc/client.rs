//! JSON-lines transport to the marketplace daemon
//!
//! One connection carries traffic both ways. Each line is a JSON message:
//! - request: `{"id": 1, "method": "provider_complete_job", "params": {...}}`
//! - response: `{"id": 1, "result": {...}}` or `{"id": 1, "error": "..."}`
//!
//! Ids are scoped to the side that sent the request.

use super::{
    CompleteJob, CompleteJobResponse, EventHandler, FailJob, MarketplaceRpc, ProvideOffer,
    RpcError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Message {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

/// A request pushed by the marketplace, awaiting [`RpcClient::respond`]
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

type PendingCalls = HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

struct Shared {
    outgoing: mpsc::UnboundedSender<String>,
    /// `None` once the connection is gone
    pending: Mutex<Option<PendingCalls>>,
    next_id: AtomicU64,
}

impl Shared {
    fn resolve(&self, id: u64, result: Result<Value, RpcError>) {
        let sender = self.pending.lock().as_mut().and_then(|p| p.remove(&id));
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => tracing::warn!(id, "Response for unknown RPC call"),
        }
    }

    fn respond(&self, id: u64, result: Result<Value, String>) {
        let message = match result {
            Ok(result) => Message::Response {
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => Message::Response {
                id,
                result: None,
                error: Some(Value::String(error)),
            },
        };

        match serde_json::to_string(&message) {
            Ok(line) => {
                if self.outgoing.send(line).is_err() {
                    tracing::warn!(id, "RPC connection closed before response was sent");
                }
            }
            Err(e) => tracing::error!(id, "Failed to encode RPC response: {}", e),
        }
    }

    fn close(&self) {
        if let Some(pending) = self.pending.lock().take() {
            for (_, sender) in pending {
                let _ = sender.send(Err(RpcError::Closed));
            }
        }
    }
}

/// Marketplace RPC client. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

impl RpcClient {
    /// Connect to the marketplace daemon
    pub async fn connect(addr: &str) -> Result<(Self, mpsc::Receiver<InboundRequest>), RpcError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::info!("Connected to marketplace RPC at {}", addr);
        Ok(Self::from_stream(stream))
    }

    /// Run the protocol over an established stream.
    ///
    /// Returns the client and the queue of requests pushed by the marketplace.
    pub fn from_stream<S>(stream: S) -> (Self, mpsc::Receiver<InboundRequest>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);

        let shared = Arc::new(Shared {
            outgoing: outgoing_tx,
            pending: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(write_loop(writer, outgoing_rx));
        tokio::spawn(read_loop(
            BufReader::new(reader),
            Arc::clone(&shared),
            inbound_tx,
        ));

        (Self { shared }, inbound_rx)
    }

    async fn call<P, T>(&self, method: &str, params: P) -> Result<T, RpcError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Message::Request {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        })?;

        let (tx, rx) = oneshot::channel();
        match self.shared.pending.lock().as_mut() {
            Some(pending) => {
                pending.insert(id, tx);
            }
            None => return Err(RpcError::Closed),
        }

        if self.shared.outgoing.send(line).is_err() {
            if let Some(pending) = self.shared.pending.lock().as_mut() {
                pending.remove(&id);
            }
            return Err(RpcError::Closed);
        }
        tracing::debug!(id, method, "RPC call sent");

        let value = rx.await.map_err(|_| RpcError::Closed)??;
        Ok(serde_json::from_value(value)?)
    }

    /// Answer a request pushed by the marketplace
    pub fn respond(&self, id: u64, result: Result<Value, String>) {
        self.shared.respond(id, result);
    }
}

#[async_trait]
impl MarketplaceRpc for RpcClient {
    async fn provide_offer(&self, offer: ProvideOffer) -> Result<(), RpcError> {
        self.call::<_, Value>("provider_provide_offer", offer).await?;
        Ok(())
    }

    async fn complete_job(&self, job: CompleteJob) -> Result<i64, RpcError> {
        let response: CompleteJobResponse = self.call("provider_complete_job", job).await?;
        Ok(response.completed_at_sync)
    }

    async fn fail_job(&self, job: FailJob) -> Result<(), RpcError> {
        self.call::<_, Value>("provider_fail_job", job).await?;
        Ok(())
    }
}

async fn write_loop<W>(mut writer: W, mut outgoing: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = outgoing.recv().await {
        if let Err(e) = write_line(&mut writer, &line).await {
            tracing::warn!("RPC write failed: {}", e);
            break;
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_loop<R>(
    mut reader: BufReader<R>,
    shared: Arc<Shared>,
    inbound: mpsc::Sender<InboundRequest>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("RPC read failed: {}", e);
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<Message>(trimmed) {
            Ok(Message::Request { id, method, params }) => {
                tracing::debug!(id, method = %method, "RPC request received");
                let request = InboundRequest { id, method, params };
                if let Err(rejected) = inbound.send(request).await {
                    shared.respond(
                        rejected.0.id,
                        Err("Provider is not accepting events".to_string()),
                    );
                }
            }
            Ok(Message::Response { id, result, error }) => {
                let result = match error {
                    Some(Value::String(message)) => Err(RpcError::Remote(message)),
                    Some(error) => Err(RpcError::Remote(error.to_string())),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                shared.resolve(id, result);
            }
            Err(e) => tracing::warn!("Ignoring malformed RPC message: {}", e),
        }
    }

    tracing::info!("Marketplace RPC connection closed");
    shared.close();
}

/// Dispatch marketplace requests to `handler` until the connection closes.
///
/// Each request runs on its own task so a slow handler never stalls the
/// connection.
pub async fn serve_events<H: EventHandler>(
    client: RpcClient,
    mut incoming: mpsc::Receiver<InboundRequest>,
    handler: Arc<H>,
) {
    while let Some(request) = incoming.recv().await {
        let client = client.clone();
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let result = dispatch(handler.as_ref(), &request.method, request.params).await;
            if let Err(e) = &result {
                tracing::warn!(method = %request.method, "RPC request failed: {}", e);
            }
            client.respond(request.id, result);
        });
    }
}

async fn dispatch<H: EventHandler>(
    handler: &H,
    method: &str,
    params: Value,
) -> Result<Value, String> {
    match method {
        "provider_create_job" => {
            let request = serde_json::from_value(params).map_err(|e| e.to_string())?;
            let response = handler.create_job(request).await?;
            serde_json::to_value(response).map_err(|e| e.to_string())
        }
        "provider_prepare_job_connection" => {
            let request = serde_json::from_value(params).map_err(|e| e.to_string())?;
            let response = handler.prepare_job_connection(request).await?;
            serde_json::to_value(response).map_err(|e| e.to_string())
        }
        other => Err(format!("Unknown method: {}", other)),
    }
}
