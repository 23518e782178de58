//! Shared mocks for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use completion_provider::pricing::Wei;
use completion_provider::protocol::{Offer, Price, RequestBody, decode_frames};
use completion_provider::rpc::{CompleteJob, FailJob, MarketplaceRpc, ProvideOffer, RpcError};
use completion_provider::upstream::{ChunkReceiver, CompletionApi, UpstreamError};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

pub const MODEL: &str = "gpt-4o-mini";
pub const OFFER_ID: &str = "gpt-4o-mini-offer";
pub const FIRST_SYNC: i64 = 1000;

/// Input 0.000001, output 0.000002 per token
pub fn offer() -> Offer {
    Offer {
        model_id: MODEL.to_string(),
        context_size: 128_000,
        description: Some("Test offer".to_string()),
        input_token_price: Price::new(Wei::parse_decimal("0.000001").unwrap()),
        output_token_price: Price::new(Wei::parse_decimal("0.000002").unwrap()),
        trial: None,
    }
}

pub fn usage(prompt: u64, completion: u64) -> Value {
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": prompt + completion
    })
}

pub fn chat_args(stream: bool) -> String {
    json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "Tell me a secret"}],
        "temperature": 0.2,
        "stream": stream
    })
    .to_string()
}

pub fn chat_body(stream: bool) -> RequestBody {
    RequestBody::parse(&chat_args(stream)).unwrap()
}

pub fn chat_response() -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": MODEL,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello there"},
            "finish_reason": "stop"
        }],
        "usage": usage(100, 50)
    })
}

pub fn chat_chunks() -> Vec<Value> {
    vec![
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}}],
            "usage": null
        }),
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}],
            "usage": null
        }),
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "choices": [],
            "usage": usage(100, 50)
        }),
    ]
}

fn token_logprobs() -> Value {
    json!({
        "content": [
            {"token": "Hel", "logprob": -9.88582262435732696e-3, "bytes": [72, 101, 108]},
            {"token": "lo", "logprob": -0.31326168751822286, "bytes": [108, 111]},
            {"token": "!", "logprob": -1.2398974262392855e-7, "bytes": [33]}
        ]
    })
}

/// `chat_response` with full-precision float logprobs
pub fn chat_response_with_logprobs() -> Value {
    let mut response = chat_response();
    response["choices"][0]["logprobs"] = token_logprobs();
    response
}

/// `chat_chunks` with full-precision float logprobs on every content chunk
pub fn chat_chunks_with_logprobs() -> Vec<Value> {
    let mut chunks = chat_chunks();
    for chunk in chunks.iter_mut().take(2) {
        chunk["choices"][0]["logprobs"] = token_logprobs();
    }
    chunks
}

// ============================================================================
// Mock upstream API
// ============================================================================

enum Behavior {
    Respond(Value),
    Stream {
        chunks: Vec<Value>,
        fail_after: Option<usize>,
    },
    Gated(Mutex<Option<ChunkReceiver>>),
    Unavailable,
}

/// Mock upstream API - returns scripted responses
pub struct MockCompletionApi {
    behavior: Behavior,
    calls: Mutex<Vec<RequestBody>>,
}

impl MockCompletionApi {
    fn with(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn responding(response: Value) -> Self {
        Self::with(Behavior::Respond(response))
    }

    pub fn streaming(chunks: Vec<Value>) -> Self {
        Self::with(Behavior::Stream {
            chunks,
            fail_after: None,
        })
    }

    /// Streams `count` chunks, then fails
    pub fn failing_after(chunks: Vec<Value>, count: usize) -> Self {
        Self::with(Behavior::Stream {
            chunks,
            fail_after: Some(count),
        })
    }

    /// Streams whatever the test pushes into the returned sender
    pub fn gated() -> (Self, mpsc::Sender<Result<Value, UpstreamError>>) {
        let (tx, rx) = mpsc::channel(100);
        (Self::with(Behavior::Gated(Mutex::new(Some(rx)))), tx)
    }

    /// Every call fails with HTTP 503
    pub fn unavailable() -> Self {
        Self::with(Behavior::Unavailable)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

fn unavailable_error() -> UpstreamError {
    UpstreamError::Api {
        status: 503,
        body: "upstream overloaded".to_string(),
    }
}

#[async_trait]
impl CompletionApi for MockCompletionApi {
    async fn complete(&self, body: &RequestBody) -> Result<Value, UpstreamError> {
        self.calls.lock().push(body.clone());
        match &self.behavior {
            Behavior::Respond(response) => Ok(response.clone()),
            Behavior::Unavailable => Err(unavailable_error()),
            _ => panic!("non-streaming call on a streaming mock"),
        }
    }

    async fn complete_stream(&self, body: &RequestBody) -> Result<ChunkReceiver, UpstreamError> {
        self.calls.lock().push(body.clone());
        match &self.behavior {
            Behavior::Stream { chunks, fail_after } => {
                let (tx, rx) = mpsc::channel(100);
                let count = fail_after.unwrap_or(chunks.len());
                for chunk in chunks.iter().take(count) {
                    tx.send(Ok(chunk.clone())).await.unwrap();
                }
                if fail_after.is_some() {
                    tx.send(Err(UpstreamError::Stream("connection reset".to_string())))
                        .await
                        .unwrap();
                }
                Ok(rx)
            }
            Behavior::Gated(rx) => Ok(rx.lock().take().expect("gated stream used twice")),
            Behavior::Unavailable => Err(unavailable_error()),
            Behavior::Respond(_) => panic!("streaming call on a non-streaming mock"),
        }
    }
}

// ============================================================================
// Mock marketplace
// ============================================================================

/// Records every marketplace call
pub struct MockMarketplace {
    pub offers: Mutex<Vec<ProvideOffer>>,
    pub completed: Mutex<Vec<CompleteJob>>,
    pub failed: Mutex<Vec<FailJob>>,
    next_sync: AtomicI64,
}

impl Default for MockMarketplace {
    fn default() -> Self {
        Self {
            offers: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            next_sync: AtomicI64::new(FIRST_SYNC),
        }
    }
}

#[async_trait]
impl MarketplaceRpc for MockMarketplace {
    async fn provide_offer(&self, offer: ProvideOffer) -> Result<(), RpcError> {
        self.offers.lock().push(offer);
        Ok(())
    }

    async fn complete_job(&self, job: CompleteJob) -> Result<i64, RpcError> {
        self.completed.lock().push(job);
        Ok(self.next_sync.fetch_add(1, Ordering::SeqCst))
    }

    async fn fail_job(&self, job: FailJob) -> Result<(), RpcError> {
        self.failed.lock().push(job);
        Ok(())
    }
}

// ============================================================================
// Connections
// ============================================================================

/// In-memory connection: the provider writes into the first half, the test reads the second
pub fn connection() -> (DuplexStream, DuplexStream) {
    let (provider_side, requester_side) = tokio::io::duplex(1 << 20);
    (provider_side, requester_side)
}

pub async fn read_all(mut requester_side: DuplexStream) -> Vec<u8> {
    let mut bytes = Vec::new();
    requester_side.read_to_end(&mut bytes).await.unwrap();
    bytes
}

pub fn frames(bytes: &[u8]) -> Vec<Value> {
    decode_frames(bytes).unwrap()
}
