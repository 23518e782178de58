//! Completion job execution
//!
//! A [`CompletionJob`] runs one upstream call, writes the resulting frames into its
//! [`ReplayBuffer`], and persists the terminal outcome. Connections read from the
//! buffer, never from the upstream call, so any number of them can attach at any
//! point in the job's life.

mod driver;

use crate::buffer::{BufferError, ReplayBuffer};
use crate::pricing::{PricingError, calc_cost};
use crate::protocol::{
    Epilogue, FrameError, Offer, PublicJobPayload, ReasonClass, RequestBody, ResponsePrologue,
    encode_frame,
};
use crate::rpc::{CompleteJob, FailJob, MarketplaceRpc, RpcError};
use crate::store::{JobCompletion, JobStore};
use crate::upstream::{CompletionApi, UpstreamError};
use driver::{Invocation, ModeDriver, NonStreamingDriver, StreamingDriver};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

const SERVICE_ERROR_REASON: &str = "Service Error";

/// Fatal job faults. Upstream service failures are not errors; they end the job
/// in the failed state.
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("Marketplace RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Upstream response carried no usage")]
    MissingUsage,

    #[error("Job #{0} not found")]
    RecordMissing(i64),

    #[error("Job #{0} is not terminal and has no live processor")]
    NotTerminal(i64),

    #[error("Job #{0} is completed but missing billing fields")]
    IncompleteRecord(i64),
}

/// Streaming flag of a job, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Streaming,
    NonStreaming,
}

impl JobMode {
    pub fn from_streaming(streaming: bool) -> Self {
        if streaming {
            JobMode::Streaming
        } else {
            JobMode::NonStreaming
        }
    }

    pub fn is_streaming(self) -> bool {
        self == JobMode::Streaming
    }

    fn driver(self) -> &'static dyn ModeDriver {
        match self {
            JobMode::Streaming => &StreamingDriver,
            JobMode::NonStreaming => &NonStreamingDriver,
        }
    }
}

pub struct CompletionJob {
    rowid: i64,
    mode: JobMode,
    store: JobStore,
    buffer: ReplayBuffer,
    /// Set for jobs rebuilt from storage rather than run live
    from_storage: bool,
    restored: OnceCell<Result<(), Arc<JobError>>>,
}

impl CompletionJob {
    pub fn new(rowid: i64, mode: JobMode, store: JobStore) -> Self {
        Self {
            rowid,
            mode,
            store,
            buffer: ReplayBuffer::new(),
            from_storage: false,
            restored: OnceCell::new(),
        }
    }

    /// A job whose frames must be rebuilt from its stored record, see [`Self::ready`]
    pub fn from_storage(rowid: i64, mode: JobMode, store: JobStore) -> Self {
        Self {
            from_storage: true,
            ..Self::new(rowid, mode, store)
        }
    }

    pub fn rowid(&self) -> i64 {
        self.rowid
    }

    /// Wait until the job can serve connections.
    ///
    /// Live jobs are always ready. A job built with [`Self::from_storage`] runs
    /// [`Self::prefetch`] once; every caller, concurrent or later, sees that outcome.
    pub async fn ready(&self) -> Result<(), Arc<JobError>> {
        if !self.from_storage {
            return Ok(());
        }
        self.restored
            .get_or_init(|| async { self.prefetch().await.map_err(Arc::new) })
            .await
            .clone()
    }

    pub fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    /// Run the job against the upstream API. The record must already be inserted.
    ///
    /// The buffer is closed when this returns, whatever the outcome.
    pub async fn process(
        &self,
        api: &dyn CompletionApi,
        provider_peer_id: &str,
        provider_job_id: &str,
        offer: &Offer,
        body: &RequestBody,
        rpc: &dyn MarketplaceRpc,
    ) -> Result<(), JobError> {
        let result = self
            .run(api, provider_peer_id, provider_job_id, offer, body, rpc)
            .await;
        self.buffer.close();
        result
    }

    async fn run(
        &self,
        api: &dyn CompletionApi,
        provider_peer_id: &str,
        provider_job_id: &str,
        offer: &Offer,
        body: &RequestBody,
        rpc: &dyn MarketplaceRpc,
    ) -> Result<(), JobError> {
        let driver = self.mode.driver();
        tracing::debug!(rowid = self.rowid, mode = ?self.mode, "Processing job");

        let (output, usage) = match driver.invoke(api, body, &self.buffer).await? {
            Invocation::Completed { output, usage } => (output, usage),
            Invocation::ServiceFailed {
                error,
                prologue_written,
                partial,
            } => {
                return self
                    .fail(
                        rpc,
                        provider_peer_id,
                        provider_job_id,
                        body,
                        error,
                        prologue_written,
                        partial,
                    )
                    .await;
            }
        };

        let balance_delta = calc_cost(offer, &usage)?;
        let public_payload = serde_json::to_string(&PublicJobPayload::new(body, usage))?;
        let private_payload = serde_json::to_string(&json!({ "input": body, "output": output }))?;
        let output = serde_json::to_string(&output)?;

        let completed_at_sync = rpc
            .complete_job(CompleteJob {
                provider_peer_id: provider_peer_id.to_string(),
                provider_job_id: provider_job_id.to_string(),
                balance_delta: balance_delta.to_string(),
                public_payload: public_payload.clone(),
                private_payload,
            })
            .await?;

        let epilogue = Epilogue {
            balance_delta: balance_delta.to_string(),
            public_payload,
            completed_at_sync,
        };

        self.store
            .complete(
                self.rowid,
                JobCompletion {
                    output,
                    balance_delta: epilogue.balance_delta.clone(),
                    public_payload: epilogue.public_payload.clone(),
                    completed_at_sync,
                },
            )
            .await?;

        self.buffer.write(driver.epilogue_frame(&epilogue)?)?;

        tracing::info!(
            rowid = self.rowid,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "Completed job #{} (~{})",
            self.rowid,
            balance_delta.to_decimal_string()
        );
        Ok(())
    }

    async fn fail(
        &self,
        rpc: &dyn MarketplaceRpc,
        provider_peer_id: &str,
        provider_job_id: &str,
        body: &RequestBody,
        error: UpstreamError,
        prologue_written: bool,
        partial: Option<serde_json::Value>,
    ) -> Result<(), JobError> {
        tracing::warn!(rowid = self.rowid, "Upstream service error: {}", error);

        if !prologue_written {
            self.buffer
                .write(encode_frame(&ResponsePrologue::ServiceError)?)?;
        }

        self.store.fail(self.rowid, &error.to_string()).await?;

        let private_payload = match partial {
            Some(partial) => json!({ "request": body, "response": partial }),
            None => json!({ "request": body }),
        };
        rpc.fail_job(FailJob {
            provider_peer_id: provider_peer_id.to_string(),
            provider_job_id: provider_job_id.to_string(),
            reason: SERVICE_ERROR_REASON.to_string(),
            reason_class: ReasonClass::ServiceError,
            private_payload: Some(serde_json::to_string(&private_payload)?),
        })
        .await?;

        Ok(())
    }

    /// Rebuild the frame sequence of a terminal job from its stored record.
    ///
    /// The buffer is closed when this returns, whatever the outcome.
    pub async fn prefetch(&self) -> Result<(), JobError> {
        let result = self.replay_record().await;
        self.buffer.close();
        result
    }

    async fn replay_record(&self) -> Result<(), JobError> {
        let record = self
            .store
            .get(self.rowid)
            .await?
            .ok_or(JobError::RecordMissing(self.rowid))?;

        if record.service_error.is_some() {
            self.buffer
                .write(encode_frame(&ResponsePrologue::ServiceError)?)?;
            return Ok(());
        }

        let Some(output) = record.output.as_deref() else {
            return Err(JobError::NotTerminal(self.rowid));
        };
        let (Some(balance_delta), Some(public_payload), Some(completed_at_sync)) = (
            record.balance_delta,
            record.public_payload,
            record.completed_at_sync,
        ) else {
            return Err(JobError::IncompleteRecord(self.rowid));
        };

        let driver = self.mode.driver();
        self.buffer.write(encode_frame(&ResponsePrologue::Ok)?)?;
        driver.replay(output, &self.buffer)?;
        self.buffer.write(driver.epilogue_frame(&Epilogue {
            balance_delta,
            public_payload,
            completed_at_sync,
        })?)?;

        tracing::debug!(rowid = self.rowid, frames = self.buffer.len(), "Prefetched job");
        Ok(())
    }

    /// Stream the job's full frame sequence into `sink`, then shut it down
    pub fn connect<S>(&self, sink: S) -> JoinHandle<std::io::Result<()>>
    where
        S: AsyncWrite + Unpin + Send + 'static,
    {
        self.buffer.pipe_to(sink)
    }
}

