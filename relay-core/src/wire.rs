//! Framing: length-prefix (4 bytes LE) + block. Blocks are bincode payloads, encrypted on sessions.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_payload(msg)?;
    frame_block(&payload)
}

/// Prefix an already-encoded (or encrypted) block with its length.
pub fn frame_block(block: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(block.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + block.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(block);
    Ok(out)
}

/// Bincode body without a length prefix (envelope plaintext, envelope payloads).
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    bincode::serialize(msg).map_err(FrameEncodeError::Encode)
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameDecodeError> {
    bincode::deserialize(bytes).map_err(FrameDecodeError::Decode)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Validate a length prefix read from a stream.
pub fn block_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Error decoding a frame (too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
