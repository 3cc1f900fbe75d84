//! kiln-common
//!
//! Types shared by the kiln build agent and the controllers that consume its
//! output:
//! - Build job configuration (`config`)
//! - The framed JSON message protocol (`protocol`)

pub mod config;
pub mod protocol;

// Re-export commonly used types
pub use config::{
    ArtifactsConfig, BuildJobConfig, CacheConfig, JobConfig, JobConfigError, Step, When,
};
pub use protocol::{encode_frames, EncodedMessage, FrameAssembler, Message, ProtocolError};
