//! Marketplace RPC contract
//!
//! [`MarketplaceRpc`] is what the provider calls into; [`EventHandler`] is what
//! the marketplace calls back. [`client::RpcClient`] implements both directions
//! over a JSON-lines TCP connection.

pub mod client;

pub use client::{InboundRequest, RpcClient, serve_events};

use crate::protocol::ReasonClass;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("RPC connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Remote error: {0}")]
    Remote(String),
}

// ============================================================================
// Outbound calls
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvideOffer {
    pub offer_id: String,
    pub protocol_id: String,
    /// Offer JSON
    pub protocol_payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteJob {
    pub provider_peer_id: String,
    pub provider_job_id: String,
    pub balance_delta: String,
    pub public_payload: String,
    pub private_payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteJobResponse {
    pub completed_at_sync: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailJob {
    pub provider_peer_id: String,
    pub provider_job_id: String,
    pub reason: String,
    pub reason_class: ReasonClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_payload: Option<String>,
}

#[async_trait]
pub trait MarketplaceRpc: Send + Sync {
    async fn provide_offer(&self, offer: ProvideOffer) -> Result<(), RpcError>;

    /// Returns the marketplace's `completed_at_sync` timestamp
    async fn complete_job(&self, job: CompleteJob) -> Result<i64, RpcError>;

    async fn fail_job(&self, job: FailJob) -> Result<(), RpcError>;
}

// ============================================================================
// Inbound events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateJob {
    pub protocol_id: String,
    pub offer_id: String,
    pub provider_peer_id: String,
    pub provider_job_id: String,
    #[serde(default)]
    pub job_args: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "content")]
pub enum CreateJobResponse {
    Ok,
    InvalidJobArgs(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareJobConnection {
    pub provider_peer_id: String,
    pub provider_job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "content")]
pub enum PrepareJobConnectionResponse {
    /// Nonce to present when opening the job connection
    Ok(String),
    JobNotFound,
}

/// Handles events pushed by the marketplace.
///
/// An `Err` is reported back to the caller as an RPC error.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn create_job(&self, request: CreateJob) -> Result<CreateJobResponse, String>;

    async fn prepare_job_connection(
        &self,
        request: PrepareJobConnection,
    ) -> Result<PrepareJobConnectionResponse, String>;
}
