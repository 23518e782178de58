//! Wire types shared with the marketplace and with job connections
//!
//! Job connections carry a sequence of CBOR records (see [`frame`]):
//! a [`ResponsePrologue`], then upstream chunks or a single response forwarded
//! verbatim, then an [`Epilogue`] when the job completed.

pub mod frame;
pub mod request;

pub use frame::{FrameError, decode_frames, encode_frame};
pub use request::{PublicJobPayload, RequestBody};

use crate::pricing::Wei;
use serde::{Deserialize, Serialize};

/// Protocol identifier advertised with every offer
pub const PROTOCOL_ID: &str = "openai";

/// `object` tag carried by the streaming epilogue so clients can tell it from a chunk
pub const EPILOGUE_OBJECT: &str = "derouter.epilogue";

// ============================================================================
// Offers
// ============================================================================

/// A unit price, encoded on the wire as `{"$pol": "<integer string>"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    #[serde(rename = "$pol")]
    pub amount: Wei,
}

impl Price {
    pub fn new(amount: Wei) -> Self {
        Self { amount }
    }
}

/// Offer payload published to the marketplace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub model_id: String,
    pub context_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_token_price: Price,
    pub output_token_price: Price,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial: Option<Price>,
}

// ============================================================================
// Usage and failure reasons
// ============================================================================

/// Token usage reported by the upstream API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Classification attached to a fail-job call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ReasonClass {
    UnhandledError = 0,
    ProtocolRequestBody = 1,
    ProtocolModelId = 2,
    ServiceError = 3,
}

impl From<ReasonClass> for u8 {
    fn from(class: ReasonClass) -> Self {
        class as u8
    }
}

impl TryFrom<u8> for ReasonClass {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::UnhandledError),
            1 => Ok(Self::ProtocolRequestBody),
            2 => Ok(Self::ProtocolModelId),
            3 => Ok(Self::ServiceError),
            other => Err(format!("unknown reason class {}", other)),
        }
    }
}

// ============================================================================
// Job connection records
// ============================================================================

/// First record on every job connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ResponsePrologue {
    Ok,
    ServiceError,
    ProtocolViolation { message: String },
}

/// Billing record closing a completed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epilogue {
    pub balance_delta: String,
    pub public_payload: String,
    pub completed_at_sync: i64,
}

#[derive(Serialize)]
struct TaggedEpilogue<'a> {
    object: &'static str,
    balance_delta: &'a str,
    public_payload: &'a str,
    completed_at_sync: i64,
}

impl Epilogue {
    /// Encode as a frame; the streaming variant carries the `object` tag
    pub fn to_frame(&self, streaming: bool) -> Result<bytes::Bytes, FrameError> {
        if streaming {
            encode_frame(&TaggedEpilogue {
                object: EPILOGUE_OBJECT,
                balance_delta: &self.balance_delta,
                public_payload: &self.public_payload,
                completed_at_sync: self.completed_at_sync,
            })
        } else {
            encode_frame(self)
        }
    }
}
