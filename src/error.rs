use thiserror::Error;

/// Main error type for avpipe
#[derive(Error, Debug)]
pub enum AvpipeError {
    /// An error originating from the underlying FFmpeg library
    #[error("FFmpeg error: {0}")]
    Ffmpeg(#[from] FfmpegError),

    /// A standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend operation returned a failure status
    #[error("IO failure during {op}: {detail}")]
    IoFailure { op: &'static str, detail: String },

    /// No datagram arrived within the receive window
    #[error("Timed out waiting for input")]
    Timeout,

    /// Malformed or missing transcode parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session table has no free slot
    #[error("Session table is full (capacity {capacity})")]
    Capacity { capacity: usize },

    /// A session table slot no longer matches the index recorded in its session
    #[error("Session table corrupted: {0}")]
    Consistency(String),

    /// No live session is registered under this handle
    #[error("Session not found: handle={0}")]
    SessionNotFound(i32),

    /// A requested stream could not be found in the media file
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// The session was cancelled before it completed
    #[error("Transcoding cancelled")]
    Cancelled,
}

impl AvpipeError {
    /// Integer status for callers that expect the classic negative return codes.
    pub fn status(&self) -> i32 {
        match self {
            AvpipeError::Config(_) => -2,
            AvpipeError::Io(_) | AvpipeError::IoFailure { .. } => -5,
            AvpipeError::Timeout => -110,
            AvpipeError::Capacity { .. } => -12,
            AvpipeError::Consistency(_) => -14,
            AvpipeError::SessionNotFound(_) | AvpipeError::StreamNotFound(_) => -3,
            AvpipeError::Cancelled => -125,
            AvpipeError::Ffmpeg(_) => -1,
        }
    }

    pub(crate) fn io(op: &'static str, detail: impl Into<String>) -> Self {
        AvpipeError::IoFailure {
            op,
            detail: detail.into(),
        }
    }
}

/// FFmpeg-specific errors
#[derive(Error, Debug)]
pub enum FfmpegError {
    /// Failure during global FFmpeg initialization
    #[error("FFmpeg initialization failed: {0}")]
    InitFailed(String),

    /// Failure allocating an FFmpeg structure
    #[error("Allocation failed: {0}")]
    Alloc(String),

    /// Failure opening the input container
    #[error("Failed to open input: {0}")]
    OpenInput(String),

    /// Failure locating stream information within the input
    #[error("Failed to find stream info: {0}")]
    FindStreamInfo(String),

    /// No decoder is registered for the stream's codec
    #[error("Failed to find decoder: {0}")]
    DecoderNotFound(String),

    /// Failure opening a decoder
    #[error("Failed to open decoder: {0}")]
    DecoderOpen(String),

    /// No encoder is registered under the requested name
    #[error("Failed to find encoder: {0}")]
    EncoderNotFound(String),

    /// Failure opening an encoder
    #[error("Failed to open encoder: {0}")]
    EncoderOpen(String),

    /// Failure building or feeding the filter graph
    #[error("Filter graph error: {0}")]
    FilterGraph(String),

    /// Failure creating an output format muxer
    #[error("Failed to create muxer: {0}")]
    MuxerCreate(String),

    /// Failure configuring stream contexts or parameters
    #[error("Stream configuration failed: {0}")]
    StreamConfig(String),

    /// Failure writing the container header
    #[error("Failed to write header: {0}")]
    WriteHeader(String),

    /// Failure writing a media packet to the container
    #[error("Failed to write packet: {0}")]
    WritePacket(String),

    /// Failure writing the container trailer
    #[error("Failed to write trailer: {0}")]
    WriteTrailer(String),

    /// Failure reading a packet from the input
    #[error("Failed to read packet: {0}")]
    ReadPacket(String),

    /// Failure decoding a packet into frames
    #[error("Failed to decode packet: {0}")]
    Decode(String),

    /// Failure encoding a frame into packets
    #[error("Failed to encode frame: {0}")]
    Encode(String),

    /// Failure seeking the input to the start position
    #[error("Failed to seek: {0}")]
    Seek(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AvpipeError>;
