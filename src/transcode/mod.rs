//! Transcoding pipeline
//!
//! - [`decoder`], [`encoder`], [`filter`]: thin wrappers over the FFmpeg
//!   codec and filter contexts for the selected video stream
//! - [`muxer`]: output format to muxer and options mapping
//! - [`pump`]: the packet loop, generic over its stages
//! - [`pipeline`]: the FFmpeg implementation of those stages

pub mod decoder;
pub mod encoder;
pub mod filter;
pub mod muxer;
pub mod pipeline;
pub mod pump;

use serde::Serialize;

pub use muxer::MuxerPlan;
pub use pipeline::Transcoder;
pub use pump::{PumpStats, PumpWindow};

/// Outcome of a completed session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxStats {
    pub pump: PumpStats,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Files the muxer opened (manifests, init and media segments, keys)
    pub outputs: usize,
}
