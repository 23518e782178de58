//! Completion provider - ties marketplace events to completion jobs
//!
//! Job creation and job connections arrive on independent channels. The provider
//! correlates them with one-time nonces:
//! 1. `create_job` validates the request, inserts a pending record and spawns the job
//! 2. `prepare_job_connection` mints a nonce for a known job
//! 3. `on_job_connection` redeems the nonce and attaches the connection to the
//!    live job, or rebuilds the job's output from storage when no live job exists

use crate::buffer::{BufferError, ReplayBuffer};
use crate::job::{CompletionJob, JobError, JobMode};
use crate::protocol::{
    FrameError, Offer, PROTOCOL_ID, ReasonClass, RequestBody, ResponsePrologue, encode_frame,
};
use crate::rpc::{
    CreateJob, CreateJobResponse, EventHandler, FailJob, MarketplaceRpc, PrepareJobConnection,
    PrepareJobConnectionResponse, ProvideOffer, RpcError,
};
use crate::store::JobStore;
use crate::upstream::CompletionApi;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;

const MODEL_MISMATCH_MESSAGE: &str = "Model ID Mismatch";

/// Errors returned to the caller of a provider event
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Invalid protocol_id: {0}")]
    InvalidProtocol(String),

    #[error("Invalid offer_id: {0}")]
    UnknownOffer(String),

    #[error("Unexpected nonce: {0}")]
    UnexpectedNonce(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Restore(Arc<JobError>),

    #[error("Marketplace RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a nonce resolves to
#[derive(Clone)]
enum AwaitingConnection {
    Job { rowid: i64, streaming: bool },
    /// A job rejected before it was created; the frames live in memory only
    Rejected(Arc<ReplayBuffer>),
}

type ExternalId = (String, String);

struct ProviderState {
    offers: BTreeMap<String, Offer>,
    store: JobStore,
    api: Arc<dyn CompletionApi>,
    rpc: Arc<dyn MarketplaceRpc>,
    registry_grace: Duration,
    processors: Mutex<HashMap<i64, Arc<CompletionJob>>>,
    rejected: Mutex<HashMap<ExternalId, Arc<ReplayBuffer>>>,
    awaiting: Mutex<HashMap<u64, AwaitingConnection>>,
    next_nonce: AtomicU64,
}

/// Marketplace provider serving completion jobs. Cheap to clone.
#[derive(Clone)]
pub struct CompletionProvider {
    state: Arc<ProviderState>,
}

impl CompletionProvider {
    pub fn new(
        offers: BTreeMap<String, Offer>,
        store: JobStore,
        api: Arc<dyn CompletionApi>,
        rpc: Arc<dyn MarketplaceRpc>,
        registry_grace: Duration,
    ) -> Self {
        Self {
            state: Arc::new(ProviderState {
                offers,
                store,
                api,
                rpc,
                registry_grace,
                processors: Mutex::new(HashMap::new()),
                rejected: Mutex::new(HashMap::new()),
                awaiting: Mutex::new(HashMap::new()),
                next_nonce: AtomicU64::new(0),
            }),
        }
    }

    pub fn offers(&self) -> &BTreeMap<String, Offer> {
        &self.state.offers
    }

    /// Number of jobs currently held in the live registry
    pub fn live_jobs(&self) -> usize {
        self.state.processors.lock().len()
    }

    /// Number of minted nonces not yet redeemed or expired
    pub fn awaiting_connections(&self) -> usize {
        self.state.awaiting.lock().len()
    }

    /// Publish every offer to the marketplace
    pub async fn init(&self) -> Result<(), ProviderError> {
        for (offer_id, offer) in &self.state.offers {
            tracing::debug!(offer_id = %offer_id, model_id = %offer.model_id, "Providing offer");
            self.state
                .rpc
                .provide_offer(ProvideOffer {
                    offer_id: offer_id.clone(),
                    protocol_id: PROTOCOL_ID.to_string(),
                    protocol_payload: serde_json::to_string(offer)?,
                })
                .await?;
        }

        tracing::info!("Provider initialized with {} offers", self.state.offers.len());
        Ok(())
    }

    /// Handle a create-job event.
    ///
    /// Returns once the job is durably recorded; the job itself runs on its own task.
    pub async fn on_create_job(&self, request: CreateJob) -> Result<CreateJobResponse, ProviderError> {
        if request.protocol_id != PROTOCOL_ID {
            return Err(ProviderError::InvalidProtocol(request.protocol_id));
        }

        let offer = self
            .state
            .offers
            .get(&request.offer_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownOffer(request.offer_id.clone()))?;

        let Some(args) = request.job_args.as_deref() else {
            tracing::warn!(job_id = %request.provider_job_id, "Rejecting job without args");
            return Ok(CreateJobResponse::InvalidJobArgs("Expected args".to_string()));
        };

        let body = match RequestBody::parse(args) {
            Ok(body) => body,
            Err(message) => {
                tracing::warn!(job_id = %request.provider_job_id, "Rejecting job: {}", message);
                return Ok(CreateJobResponse::InvalidJobArgs(message));
            }
        };

        if body.model() != offer.model_id {
            return self.reject_model_mismatch(request, &offer, &body).await;
        }

        let streaming = body.is_streaming();
        let input = serde_json::to_string(&body)?;
        let rowid = self
            .state
            .store
            .insert_pending(
                &request.provider_peer_id,
                &request.provider_job_id,
                &input,
                streaming,
            )
            .await?;

        tracing::info!(
            rowid,
            offer_id = %request.offer_id,
            streaming,
            "Created job #{}",
            rowid
        );

        let job = Arc::new(CompletionJob::new(
            rowid,
            JobMode::from_streaming(streaming),
            self.state.store.clone(),
        ));
        self.register(Arc::clone(&job));

        let api = Arc::clone(&self.state.api);
        let rpc = Arc::clone(&self.state.rpc);
        let CreateJob {
            provider_peer_id,
            provider_job_id,
            ..
        } = request;
        tokio::spawn(async move {
            if let Err(e) = job
                .process(
                    api.as_ref(),
                    &provider_peer_id,
                    &provider_job_id,
                    &offer,
                    &body,
                    rpc.as_ref(),
                )
                .await
            {
                tracing::error!(rowid = job.rowid(), "Job #{} failed: {}", job.rowid(), e);
            }
        });

        Ok(CreateJobResponse::Ok)
    }

    async fn reject_model_mismatch(
        &self,
        request: CreateJob,
        offer: &Offer,
        body: &RequestBody,
    ) -> Result<CreateJobResponse, ProviderError> {
        tracing::warn!(
            job_id = %request.provider_job_id,
            expected = %offer.model_id,
            received = %body.model(),
            "Rejecting job: model id mismatch"
        );

        let buffer = Arc::new(ReplayBuffer::new());
        buffer.write(encode_frame(&ResponsePrologue::ProtocolViolation {
            message: MODEL_MISMATCH_MESSAGE.to_string(),
        })?)?;
        buffer.close();

        let reason = serde_json::json!({
            "expected": offer.model_id,
            "received": body.model(),
        });
        self.state
            .rpc
            .fail_job(FailJob {
                provider_peer_id: request.provider_peer_id.clone(),
                provider_job_id: request.provider_job_id.clone(),
                reason: reason.to_string(),
                reason_class: ReasonClass::ProtocolModelId,
                private_payload: None,
            })
            .await?;

        let key = (request.provider_peer_id, request.provider_job_id);
        self.state
            .rejected
            .lock()
            .insert(key.clone(), Arc::clone(&buffer));
        self.schedule_rejected_eviction(key, buffer);

        Ok(CreateJobResponse::Ok)
    }

    /// Handle a prepare-job-connection event, minting a nonce for a known job
    pub async fn on_prepare_job_connection(
        &self,
        request: PrepareJobConnection,
    ) -> Result<PrepareJobConnectionResponse, ProviderError> {
        let record = self
            .state
            .store
            .find_by_external_id(&request.provider_peer_id, &request.provider_job_id)
            .await?;

        let target = match record {
            Some(record) => AwaitingConnection::Job {
                rowid: record.rowid,
                streaming: record.streaming,
            },
            None => {
                let key = (request.provider_peer_id, request.provider_job_id);
                let rejected = self.state.rejected.lock().get(&key).cloned();
                match rejected {
                    Some(buffer) => AwaitingConnection::Rejected(buffer),
                    None => {
                        tracing::debug!(job_id = %key.1, "Job not found for connection");
                        return Ok(PrepareJobConnectionResponse::JobNotFound);
                    }
                }
            }
        };

        let nonce = self.state.next_nonce.fetch_add(1, Ordering::Relaxed);
        self.state.awaiting.lock().insert(nonce, target);
        self.schedule_nonce_expiry(nonce);
        tracing::debug!(nonce, "Prepared job connection");

        Ok(PrepareJobConnectionResponse::Ok(nonce.to_string()))
    }

    /// Handle an opened job connection, consuming its nonce.
    ///
    /// Returns the task streaming the job's frames into `sink`.
    pub async fn on_job_connection<S>(
        &self,
        nonce: &str,
        sink: S,
    ) -> Result<JoinHandle<std::io::Result<()>>, ProviderError>
    where
        S: AsyncWrite + Unpin + Send + 'static,
    {
        let target = nonce
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|n| self.state.awaiting.lock().remove(&n))
            .ok_or_else(|| ProviderError::UnexpectedNonce(nonce.to_string()))?;

        match target {
            AwaitingConnection::Rejected(buffer) => Ok(buffer.pipe_to(sink)),
            AwaitingConnection::Job { rowid, streaming } => {
                let job = self.processor_for(rowid, streaming).await?;
                tracing::debug!(rowid, "Job connection attached");
                Ok(job.connect(sink))
            }
        }
    }

    /// Live processor for a job, rehydrating it from storage if needed
    async fn processor_for(
        &self,
        rowid: i64,
        streaming: bool,
    ) -> Result<Arc<CompletionJob>, ProviderError> {
        let (job, inserted) = {
            let mut processors = self.state.processors.lock();
            match processors.get(&rowid) {
                Some(job) => (Arc::clone(job), false),
                None => {
                    let job = Arc::new(CompletionJob::from_storage(
                        rowid,
                        JobMode::from_streaming(streaming),
                        self.state.store.clone(),
                    ));
                    processors.insert(rowid, Arc::clone(&job));
                    (job, true)
                }
            }
        };

        if inserted {
            tracing::debug!(rowid, "No live processor for job #{}, prefetching", rowid);
            self.schedule_eviction(Arc::clone(&job));
        }

        if let Err(e) = job.ready().await {
            tracing::warn!(rowid, "Job #{} could not be restored: {}", rowid, e);
            self.evict(&job);
            return Err(ProviderError::Restore(e));
        }

        Ok(job)
    }

    fn register(&self, job: Arc<CompletionJob>) {
        self.state
            .processors
            .lock()
            .insert(job.rowid(), Arc::clone(&job));
        self.schedule_eviction(job);
    }

    fn evict(&self, job: &Arc<CompletionJob>) {
        evict_processor(&self.state, job);
    }

    /// Drop the job from the registry once its buffer has been closed for the grace period
    fn schedule_eviction(&self, job: Arc<CompletionJob>) {
        let state: Weak<ProviderState> = Arc::downgrade(&self.state);
        let grace = self.state.registry_grace;

        tokio::spawn(async move {
            job.buffer().closed().await;
            tokio::time::sleep(grace).await;
            if let Some(state) = state.upgrade() {
                evict_processor(&state, &job);
            }
        });
    }

    /// Forget a nonce that was never redeemed
    fn schedule_nonce_expiry(&self, nonce: u64) {
        let state: Weak<ProviderState> = Arc::downgrade(&self.state);
        let grace = self.state.registry_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(state) = state.upgrade() {
                if state.awaiting.lock().remove(&nonce).is_some() {
                    tracing::debug!(nonce, "Expired unused nonce");
                }
            }
        });
    }

    fn schedule_rejected_eviction(&self, key: ExternalId, buffer: Arc<ReplayBuffer>) {
        let state: Weak<ProviderState> = Arc::downgrade(&self.state);
        let grace = self.state.registry_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(state) = state.upgrade() {
                let mut rejected = state.rejected.lock();
                if rejected
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &buffer))
                {
                    rejected.remove(&key);
                }
            }
        });
    }
}

fn evict_processor(state: &ProviderState, job: &Arc<CompletionJob>) {
    let mut processors = state.processors.lock();
    if processors
        .get(&job.rowid())
        .is_some_and(|current| Arc::ptr_eq(current, job))
    {
        processors.remove(&job.rowid());
        tracing::debug!(rowid = job.rowid(), "Evicted job #{} from registry", job.rowid());
    }
}

#[async_trait]
impl EventHandler for CompletionProvider {
    async fn create_job(&self, request: CreateJob) -> Result<CreateJobResponse, String> {
        self.on_create_job(request).await.map_err(|e| e.to_string())
    }

    async fn prepare_job_connection(
        &self,
        request: PrepareJobConnection,
    ) -> Result<PrepareJobConnectionResponse, String> {
        self.on_prepare_job_connection(request)
            .await
            .map_err(|e| e.to_string())
    }
}
