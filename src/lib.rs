//! avpipe
//!
//! Transcodes or remuxes one audio/video input into DASH, HLS, MP4,
//! fragmented MP4 or raw segments. FFmpeg does the media work; every byte
//! it reads or writes goes through the pluggable handlers in [`io`].
//!
//! Sessions live in a table keyed by random handles so a host can start,
//! run and cancel them from different threads. See [`Avpipe`].

pub mod api;
pub mod config;
pub mod error;
pub mod ffmpeg_utils;
pub mod io;
pub mod mux;
pub mod params;
pub mod probe;
pub mod session;
pub mod transcode;

#[cfg(test)]
pub(crate) mod tests;

pub use api::Avpipe;
pub use config::AvpipeConfig;
pub use error::{AvpipeError, FfmpegError, Result};
pub use ffmpeg_utils::{init, install_log_filter, version_info};
pub use io::{
    InputHandler, InputOpener, MemoryStore, Openers, OutputHandler, OutputOpener, OutputTarget,
};
pub use mux::{MuxSpec, MuxStats};
pub use params::{OutputFormat, TxParams, TxType};
pub use probe::ProbeInfo;
pub use transcode::TxStats;
