//! Completion Provider - serve OpenAI-compatible completion jobs to a compute marketplace
//!
//! The provider accepts jobs from the marketplace RPC fabric, runs them against an
//! upstream completion API, bills token usage, and streams results back over job
//! connections. Job execution is decoupled from the connection that reads it:
//! - Every job writes its frames into a [`buffer::ReplayBuffer`]
//! - Connections attach to the buffer and receive the full frame sequence
//! - Terminal jobs are persisted, so connections after a restart replay from storage

pub mod buffer;
pub mod config;
pub mod job;
pub mod logging;
pub mod pricing;
pub mod protocol;
pub mod provider;
pub mod rpc;
pub mod server;
pub mod store;
pub mod upstream;

pub use buffer::{ReplayBuffer, ReplayReader};
pub use config::ProviderConfig;
pub use job::{CompletionJob, JobError, JobMode};
pub use provider::{CompletionProvider, ProviderError};
pub use store::{JobRecord, JobStore};
