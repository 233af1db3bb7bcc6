//! Pluggable I/O for the transcoding pipeline
//!
//! FFmpeg never touches a file or socket directly. Inputs are pulled through
//! an [`InputHandler`] and every file the muxer produces (manifests, init
//! segments, media segments, keys) is pushed through an [`OutputHandler`]
//! obtained from an [`OutputOpener`]. The [`avio`] module bridges these traits
//! into `AVIOContext` callbacks.

pub mod avio;
pub mod crypto;
pub mod file;
pub mod handle;
pub mod layout;
pub mod memory;
pub mod udp;

use std::fmt;

use serde::Serialize;

use crate::error::{AvpipeError, Result};

pub use file::{FileInput, FileOutput};
pub use handle::{ConnectionGuard, HandleRegistry, Openers};
pub use layout::{classify_output, output_name, OutputClass};
pub use memory::{MemoryInput, MemoryOutput, MemoryStore};
pub use udp::UdpInput;

/// `whence` flag asking for the stream size instead of a position change
pub const AVSEEK_SIZE: i32 = 0x10000;

/// `whence` flag allowing the seek to be expensive
pub const AVSEEK_FORCE: i32 = 0x20000;

/// Kind of file the muxer asked to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AvType {
    Unknown,
    DashManifest,
    DashVideoInit,
    DashVideoSegment,
    DashAudioInit,
    DashAudioSegment,
    HlsMasterM3u,
    HlsVideoM3u,
    HlsAudioM3u,
    Aes128Key,
    Mp4Stream,
    Fmp4Stream,
    Mp4Segment,
    Fmp4Segment,
}

impl AvType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvType::Unknown => "unknown",
            AvType::DashManifest => "dash_manifest",
            AvType::DashVideoInit => "dash_video_init",
            AvType::DashVideoSegment => "dash_video_segment",
            AvType::DashAudioInit => "dash_audio_init",
            AvType::DashAudioSegment => "dash_audio_segment",
            AvType::HlsMasterM3u => "hls_master_m3u",
            AvType::HlsVideoM3u => "hls_video_m3u",
            AvType::HlsAudioM3u => "hls_audio_m3u",
            AvType::Aes128Key => "aes128_key",
            AvType::Mp4Stream => "mp4_stream",
            AvType::Fmp4Stream => "fmp4_stream",
            AvType::Mp4Segment => "mp4_segment",
            AvType::Fmp4Segment => "fmp4_segment",
        }
    }

    /// Outputs the muxer rewrites in place and therefore must be seekable.
    pub fn needs_seek(&self) -> bool {
        matches!(self, AvType::Mp4Stream | AvType::Mp4Segment)
    }
}

impl fmt::Display for AvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter or timestamp reported to a handler through `stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    BytesRead,
    BytesWritten,
    DecodingStartPts,
    EncodingEndPts,
}

/// Seek origin after the high-bit flags have been interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
    /// Report the total size; the position does not change
    Size,
}

impl Whence {
    /// Decode an FFmpeg `whence` value.
    ///
    /// `AVSEEK_SIZE` wins over the base origin; `AVSEEK_FORCE` and any other
    /// high bits are masked off before dispatch.
    pub fn from_raw(whence: i32) -> Result<Self> {
        if whence & AVSEEK_SIZE != 0 {
            return Ok(Whence::Size);
        }
        match whence & 0xFFFF {
            0 => Ok(Whence::Start),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(AvpipeError::io("seek", format!("invalid whence {}", other))),
        }
    }
}

/// Resolve a seek request against a cursor and a known size.
///
/// End-relative offsets follow `lseek`: the new position is `size + offset`.
pub(crate) fn resolve_seek(pos: i64, size: Option<i64>, offset: i64, whence: Whence) -> Result<i64> {
    let target = match whence {
        Whence::Start => offset,
        Whence::Current => pos + offset,
        Whence::End => match size {
            Some(sz) => sz + offset,
            None => return Err(AvpipeError::io("seek", "size unknown for end-relative seek")),
        },
        Whence::Size => return size.ok_or_else(|| AvpipeError::io("seek", "size unknown")),
    };
    if target < 0 {
        return Err(AvpipeError::io("seek", format!("negative position {}", target)));
    }
    Ok(target)
}

/// Source of input bytes for one session
pub trait InputHandler: Send {
    /// Fill `buf`; `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Move the read cursor and return the new position (or the size for
    /// [`Whence::Size`]).
    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64>;

    fn close(&mut self) -> Result<()>;

    /// Total size in bytes when known up front.
    fn size(&self) -> Option<i64>;

    /// Progress notification; the default ignores it.
    fn stat(&mut self, _kind: StatKind, _value: i64) -> Result<()> {
        Ok(())
    }
}

/// Sink for one file produced by the muxer
pub trait OutputHandler: Send {
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64>;

    fn close(&mut self) -> Result<()>;

    fn stat(&mut self, _kind: StatKind, _value: i64) -> Result<()> {
        Ok(())
    }
}

/// Creates the input handler for a URL
pub trait InputOpener: Send + Sync {
    /// `fd` is the connection id the registry assigned to this input.
    fn open(&self, fd: i64, url: &str) -> Result<Box<dyn InputHandler>>;
}

/// Creates output handlers for the files a session produces
pub trait OutputOpener: Send + Sync {
    /// `handle` is the connection id of the paired input; `fd` identifies the
    /// new output within that connection.
    fn open(
        &self,
        handle: i64,
        fd: i64,
        stream_index: i32,
        seg_index: i32,
        kind: AvType,
    ) -> Result<Box<dyn OutputHandler>>;
}

/// Concrete input backend
pub enum InputBackend {
    File(FileInput),
    Memory(MemoryInput),
    Udp(UdpInput),
    External(Box<dyn InputHandler>),
}

impl InputBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            InputBackend::File(_) => "file",
            InputBackend::Memory(_) => "memory",
            InputBackend::Udp(_) => "udp",
            InputBackend::External(_) => "external",
        }
    }

    fn handler(&mut self) -> &mut dyn InputHandler {
        match self {
            InputBackend::File(h) => h,
            InputBackend::Memory(h) => h,
            InputBackend::Udp(h) => h,
            InputBackend::External(h) => h.as_mut(),
        }
    }
}

impl InputHandler for InputBackend {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.handler().read(buf)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        self.handler().seek(offset, whence)
    }

    fn close(&mut self) -> Result<()> {
        self.handler().close()
    }

    fn size(&self) -> Option<i64> {
        match self {
            InputBackend::File(h) => h.size(),
            InputBackend::Memory(h) => h.size(),
            InputBackend::Udp(h) => h.size(),
            InputBackend::External(h) => h.size(),
        }
    }

    fn stat(&mut self, kind: StatKind, value: i64) -> Result<()> {
        self.handler().stat(kind, value)
    }
}

/// Concrete output backend
pub enum OutputBackend {
    File(FileOutput),
    Memory(MemoryOutput),
    External(Box<dyn OutputHandler>),
}

impl OutputBackend {
    fn handler(&mut self) -> &mut dyn OutputHandler {
        match self {
            OutputBackend::File(h) => h,
            OutputBackend::Memory(h) => h,
            OutputBackend::External(h) => h.as_mut(),
        }
    }
}

impl OutputHandler for OutputBackend {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.handler().write(buf)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        self.handler().seek(offset, whence)
    }

    fn close(&mut self) -> Result<()> {
        self.handler().close()
    }

    fn stat(&mut self, kind: StatKind, value: i64) -> Result<()> {
        self.handler().stat(kind, value)
    }
}

/// Where the built-in output opener puts finished files
#[derive(Clone)]
pub enum OutputTarget {
    /// `<root>/O<connection>/<name>`
    Files { root: std::path::PathBuf },
    /// `O<connection>/<name>` keys in a shared store
    Memory {
        store: MemoryStore,
        initial_capacity: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whence_masks_force_flag() {
        assert_eq!(Whence::from_raw(AVSEEK_FORCE).unwrap(), Whence::Start);
        assert_eq!(Whence::from_raw(1 | AVSEEK_FORCE).unwrap(), Whence::Current);
        assert_eq!(Whence::from_raw(2).unwrap(), Whence::End);
    }

    #[test]
    fn test_whence_size_probe() {
        assert_eq!(Whence::from_raw(AVSEEK_SIZE).unwrap(), Whence::Size);
        assert_eq!(
            Whence::from_raw(AVSEEK_SIZE | AVSEEK_FORCE).unwrap(),
            Whence::Size
        );
        assert!(Whence::from_raw(7).is_err());
    }

    #[test]
    fn test_resolve_seek() {
        assert_eq!(resolve_seek(10, Some(100), 5, Whence::Start).unwrap(), 5);
        assert_eq!(resolve_seek(10, Some(100), 5, Whence::Current).unwrap(), 15);
        assert_eq!(resolve_seek(10, Some(100), -30, Whence::End).unwrap(), 70);
        assert_eq!(resolve_seek(10, Some(100), 0, Whence::Size).unwrap(), 100);
        assert!(resolve_seek(10, None, 0, Whence::End).is_err());
        assert!(resolve_seek(10, Some(100), -20, Whence::Current).is_err());
    }
}
