//! Mode-specific upstream invocation and replay

use super::JobError;
use crate::buffer::ReplayBuffer;
use crate::protocol::{Epilogue, FrameError, RequestBody, ResponsePrologue, Usage, encode_frame};
use crate::upstream::{CompletionApi, UpstreamError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

/// Result of calling the upstream API
pub(crate) enum Invocation {
    /// Output to persist (the response, or the array of chunks) and its usage
    Completed { output: Value, usage: Usage },
    /// The API failed; `partial` holds whatever arrived before the failure
    ServiceFailed {
        error: UpstreamError,
        prologue_written: bool,
        partial: Option<Value>,
    },
}

#[async_trait]
pub(crate) trait ModeDriver: Send + Sync {
    /// Call upstream, writing the Ok prologue and content frames as they arrive
    async fn invoke(
        &self,
        api: &dyn CompletionApi,
        body: &RequestBody,
        buffer: &ReplayBuffer,
    ) -> Result<Invocation, JobError>;

    /// Write content frames rebuilt from stored output
    fn replay(&self, output: &str, buffer: &ReplayBuffer) -> Result<(), JobError>;

    fn epilogue_frame(&self, epilogue: &Epilogue) -> Result<Bytes, FrameError>;
}

pub(crate) struct StreamingDriver;

pub(crate) struct NonStreamingDriver;

#[async_trait]
impl ModeDriver for StreamingDriver {
    async fn invoke(
        &self,
        api: &dyn CompletionApi,
        body: &RequestBody,
        buffer: &ReplayBuffer,
    ) -> Result<Invocation, JobError> {
        let mut chunks_rx = match api.complete_stream(body).await {
            Ok(rx) => rx,
            Err(error) if error.is_service_error() => {
                return Ok(Invocation::ServiceFailed {
                    error,
                    prologue_written: false,
                    partial: None,
                });
            }
            Err(error) => return Err(error.into()),
        };

        buffer.write(encode_frame(&ResponsePrologue::Ok)?)?;

        let mut chunks = Vec::new();
        while let Some(item) = chunks_rx.recv().await {
            match item {
                Ok(chunk) => {
                    buffer.write(encode_frame(&chunk)?)?;
                    chunks.push(chunk);
                }
                Err(error) if error.is_service_error() => {
                    return Ok(Invocation::ServiceFailed {
                        error,
                        prologue_written: true,
                        partial: Some(Value::Array(chunks)),
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
        tracing::debug!(chunks = chunks.len(), "Upstream stream finished");

        let usage = chunks
            .last()
            .ok_or(JobError::MissingUsage)
            .and_then(usage_of)?;

        Ok(Invocation::Completed {
            output: Value::Array(chunks),
            usage,
        })
    }

    fn replay(&self, output: &str, buffer: &ReplayBuffer) -> Result<(), JobError> {
        let chunks: Vec<Value> = serde_json::from_str(output)?;
        for chunk in &chunks {
            buffer.write(encode_frame(chunk)?)?;
        }
        Ok(())
    }

    fn epilogue_frame(&self, epilogue: &Epilogue) -> Result<Bytes, FrameError> {
        epilogue.to_frame(true)
    }
}

#[async_trait]
impl ModeDriver for NonStreamingDriver {
    async fn invoke(
        &self,
        api: &dyn CompletionApi,
        body: &RequestBody,
        buffer: &ReplayBuffer,
    ) -> Result<Invocation, JobError> {
        let response = match api.complete(body).await {
            Ok(response) => response,
            Err(error) if error.is_service_error() => {
                return Ok(Invocation::ServiceFailed {
                    error,
                    prologue_written: false,
                    partial: None,
                });
            }
            Err(error) => return Err(error.into()),
        };

        let usage = usage_of(&response)?;

        buffer.write(encode_frame(&ResponsePrologue::Ok)?)?;
        buffer.write(encode_frame(&response)?)?;

        Ok(Invocation::Completed {
            output: response,
            usage,
        })
    }

    fn replay(&self, output: &str, buffer: &ReplayBuffer) -> Result<(), JobError> {
        let response: Value = serde_json::from_str(output)?;
        buffer.write(encode_frame(&response)?)?;
        Ok(())
    }

    fn epilogue_frame(&self, epilogue: &Epilogue) -> Result<Bytes, FrameError> {
        epilogue.to_frame(false)
    }
}

fn usage_of(value: &Value) -> Result<Usage, JobError> {
    match value.get("usage") {
        None | Some(Value::Null) => Err(JobError::MissingUsage),
        Some(usage) => Ok(Usage::deserialize(usage)?),
    }
}
