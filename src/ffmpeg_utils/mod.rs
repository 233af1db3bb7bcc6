//! FFmpeg glue shared by every session
//!
//! One-time library setup, `av_log` forwarding, raw field accessors in
//! [`helpers`] and timestamp/naming utilities in [`utils`].

pub mod helpers;
pub mod utils;

pub use ffmpeg_next as ffmpeg;
pub use utils::*;

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the FFmpeg library.
///
/// Safe to call more than once; only the first call does any work. Every
/// public entry point of the crate calls this before touching FFmpeg.
pub fn init() -> Result<(), crate::error::FfmpegError> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = ffmpeg::init().map_err(|e| {
            crate::error::FfmpegError::InitFailed(format!("ffmpeg::init() failed: {}", e))
        });
        if result.is_ok() {
            tracing::info!("FFmpeg initialized");
        }
    });
    result
}

/// Route FFmpeg's `av_log` output into `tracing` under the `ffmpeg` target.
///
/// Changes process-global FFmpeg state: call once from the binary after
/// [`init`], before any session starts.
pub fn install_log_filter() {
    // SAFETY: plain stores into libavutil globals, done before sessions run.
    unsafe {
        ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_INFO as i32);
        ffmpeg::ffi::av_log_set_callback(Some(forward_av_log));
    }
}

/// Lines the segmenting muxers print for every output they open or that
/// custom AVIO makes unavoidable.
const MUXER_NOISE: &[&str] = &[
    "Opening '",
    "No meaningful edit list will be written",
    "starts with a nonzero dts",
    "Set the delay_moov flag",
    "Timestamps are unset in a packet",
    "Cannot use rename on non file protocol",
];

fn is_muxer_noise(line: &str) -> bool {
    MUXER_NOISE.iter().any(|n| line.contains(n))
}

unsafe extern "C" fn forward_av_log(
    avcl: *mut std::ffi::c_void,
    level: std::ffi::c_int,
    fmt: *const std::ffi::c_char,
    vl: ffmpeg::ffi::va_list,
) {
    if level > ffmpeg::ffi::av_log_get_level() {
        return;
    }

    let mut buf = [0 as std::ffi::c_char; 1024];
    let mut print_prefix: std::ffi::c_int = 1;
    ffmpeg::ffi::av_log_format_line(
        avcl,
        level,
        fmt,
        vl,
        buf.as_mut_ptr(),
        buf.len() as std::ffi::c_int,
        &mut print_prefix,
    );
    let line = std::ffi::CStr::from_ptr(buf.as_ptr()).to_string_lossy();
    let line = line.trim_end();
    if line.is_empty() || is_muxer_noise(line) {
        return;
    }

    match level {
        l if l <= ffmpeg::ffi::AV_LOG_ERROR as std::ffi::c_int => {
            tracing::error!(target: "ffmpeg", "{}", line)
        }
        l if l <= ffmpeg::ffi::AV_LOG_WARNING as std::ffi::c_int => {
            tracing::warn!(target: "ffmpeg", "{}", line)
        }
        l if l <= ffmpeg::ffi::AV_LOG_INFO as std::ffi::c_int => {
            tracing::debug!(target: "ffmpeg", "{}", line)
        }
        _ => tracing::trace!(target: "ffmpeg", "{}", line),
    }
}

/// Get the version information of the linked FFmpeg libraries.
pub fn version_info() -> String {
    // SAFETY: `avformat_version` reads a compile-time constant.
    let v = unsafe { ffmpeg::ffi::avformat_version() };
    format!("libavformat {}.{}.{}", v >> 16, (v >> 8) & 0xff, v & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_muxer_noise() {
        assert!(is_muxer_noise("[dash @ 0x55] Opening 'avpipe://chunk-stream0-00001.m4s' for writing"));
        assert!(!is_muxer_noise("[mp4 @ 0x55] Could not find tag for codec"));
    }

    #[test]
    fn test_version_info() {
        assert!(version_info().starts_with("libavformat "));
    }
}
