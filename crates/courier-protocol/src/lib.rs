//! Courier Protocol -- wire framing, payload envelope, action registry.
//!
//! One persistent TCP stream per peer, symmetric in both directions.
//! Each frame: 8-byte little-endian length prefix + payload.
//! Each payload: 2-byte little-endian tag length + tag + serde JSON body.

pub mod action;
pub mod codec;
pub mod envelope;
pub mod registry;

pub use action::{Action, TypedAction};
pub use codec::{FrameCodec, ReadState};
pub use envelope::{decode_payload, encode_action, encode_payload};
pub use registry::{ActionFactory, ActionRegistry};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Default maximum payload size: 16 MB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Maximum tag length that fits the 2-byte tag prefix.
pub const MAX_TAG_LEN: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: usize },
    #[error("stream truncated mid-frame: {buffered} bytes buffered, {expected} expected")]
    Truncated { buffered: usize, expected: usize },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unknown action type: {0:?}")]
    UnknownActionType(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error means the peer broke the framing contract, as opposed
    /// to sending a well-framed parcel we cannot interpret.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::Truncated { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
