//! CBOR framing for job connections
//!
//! Each write to a job connection is one self-delimiting CBOR data item, so a
//! reader decodes items back-to-back until the stream ends.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("failed to decode frame: {0}")]
    Decode(String),
}

/// Encode a value as a single frame
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, FrameError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| FrameError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode every frame in a byte sequence
pub fn decode_frames<T: DeserializeOwned>(mut bytes: &[u8]) -> Result<Vec<T>, FrameError> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        let frame =
            ciborium::from_reader(&mut bytes).map_err(|e| FrameError::Decode(e.to_string()))?;
        frames.push(frame);
    }
    Ok(frames)
}
