//! Agent to controller wire protocol
//!
//! Every message travels as two consecutive transport frames:
//!
//! 1. a 4-byte little-endian signed length of the JSON payload
//! 2. the UTF-8 JSON payload itself, tagged by a `Type` field
//!
//! The transport may surface the two frames as separate deliveries, so
//! consumers feed every frame to a [`FrameAssembler`] and only parse once
//! both halves have arrived.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the length header frame in bytes
pub const HEADER_LEN: usize = 4;

/// A build telemetry message sent from the agent to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Message {
    #[serde(rename_all = "camelCase")]
    BuildOutput { output: String },

    #[serde(rename_all = "camelCase")]
    SectionStart { section_name: String },

    #[serde(rename_all = "camelCase")]
    SectionEnd { was_successful: bool },

    #[serde(rename_all = "camelCase")]
    FinalStatus { was_successful: bool },
}

impl Message {
    pub fn output(text: impl Into<String>) -> Self {
        Self::BuildOutput {
            output: text.into(),
        }
    }

    pub fn section_start(name: impl Into<String>) -> Self {
        Self::SectionStart {
            section_name: name.into(),
        }
    }

    pub fn section_end(was_successful: bool) -> Self {
        Self::SectionEnd { was_successful }
    }

    pub fn final_status(was_successful: bool) -> Self {
        Self::FinalStatus { was_successful }
    }

    /// The `Type` discriminator as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BuildOutput { .. } => "BuildOutput",
            Self::SectionStart { .. } => "SectionStart",
            Self::SectionEnd { .. } => "SectionEnd",
            Self::FinalStatus { .. } => "FinalStatus",
        }
    }
}

/// Errors raised while framing or parsing protocol messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload of {0} bytes does not fit in a frame header")]
    PayloadTooLarge(usize),

    #[error("length header must be {expected} bytes, got {0}", expected = HEADER_LEN)]
    InvalidHeader(usize),

    #[error("negative payload length {0}")]
    NegativeLength(i32),

    #[error("payload length mismatch: header announced {expected} bytes, frame has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid message payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// The two frames that carry one message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub header: [u8; HEADER_LEN],
    pub payload: Vec<u8>,
}

/// Encode a message into its length header and JSON payload frames
pub fn encode_frames(message: &Message) -> Result<EncodedMessage, ProtocolError> {
    let payload = serde_json::to_vec(message)?;
    let len = i32::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;

    Ok(EncodedMessage {
        header: len.to_le_bytes(),
        payload,
    })
}

/// Decode a JSON payload frame
pub fn decode_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Reassembles header and payload frames into messages
#[derive(Debug, Default)]
pub struct FrameAssembler {
    expected: Option<usize>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport frame
    ///
    /// Returns `Ok(None)` after a header frame and `Ok(Some(message))` once the
    /// matching payload frame arrives. Any error resets the assembler so the
    /// next frame is treated as a header again.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Message>, ProtocolError> {
        match self.expected.take() {
            None => {
                let header: [u8; HEADER_LEN] = frame
                    .try_into()
                    .map_err(|_| ProtocolError::InvalidHeader(frame.len()))?;
                let len = i32::from_le_bytes(header);
                let len = usize::try_from(len).map_err(|_| ProtocolError::NegativeLength(len))?;
                self.expected = Some(len);
                Ok(None)
            }
            Some(expected) => {
                if frame.len() != expected {
                    return Err(ProtocolError::LengthMismatch {
                        expected,
                        actual: frame.len(),
                    });
                }
                decode_payload(frame).map(Some)
            }
        }
    }

    /// Whether a header has been received and its payload is outstanding
    pub fn is_pending(&self) -> bool {
        self.expected.is_some()
    }
}
