//! Video decoder for the transcoding pipeline
//!
//! Wraps an FFmpeg `AVCodecContext` that turns compressed packets of the
//! selected video stream into raw pictures for the filter graph.

use crate::error::{AvpipeError, FfmpegError, Result};
use crate::ffmpeg_utils::helpers;
use ffmpeg_next as ffmpeg;

/// Video decoder backed by an FFmpeg codec context
pub struct VideoDecoder {
    decoder: ffmpeg::decoder::Video,
    stream_index: usize,
    time_base: ffmpeg::Rational,
}

impl VideoDecoder {
    /// Open a decoder for `stream`.
    ///
    /// `name` selects a decoder explicitly (e.g. `h264_cuvid`); otherwise the
    /// stream's codec id decides. The codec context takes the stream's time
    /// base so decoded pts stay in stream ticks.
    pub fn open(stream: &ffmpeg::format::stream::Stream, name: Option<&str>) -> Result<Self> {
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let codec_id = stream.parameters().id();

        let codec = match name {
            Some(name) => ffmpeg::decoder::find_by_name(name).ok_or_else(|| {
                FfmpegError::DecoderNotFound(format!("no decoder named {}", name))
            })?,
            None => ffmpeg::decoder::find(codec_id).ok_or_else(|| {
                FfmpegError::DecoderNotFound(format!(
                    "no decoder for {} on stream {}",
                    crate::ffmpeg_utils::codec_name(codec_id),
                    stream_index
                ))
            })?,
        };

        let mut context = ffmpeg::codec::Context::from_parameters(stream.parameters())
            .map_err(|e| {
                FfmpegError::DecoderOpen(format!(
                    "codec context for stream {}: {}",
                    stream_index, e
                ))
            })?;
        helpers::decoder_set_timebase(&mut context, time_base);

        let decoder = context
            .decoder()
            .open_as(codec)
            .and_then(|opened| opened.video())
            .map_err(|e| {
                FfmpegError::DecoderOpen(format!(
                    "{} on stream {}: {}",
                    codec.name(),
                    stream_index,
                    e
                ))
            })?;

        tracing::debug!(
            stream_index,
            codec = codec.name(),
            width = decoder.width(),
            height = decoder.height(),
            format = ?decoder.format(),
            time_base = %crate::ffmpeg_utils::rational_string(time_base),
            "video decoder opened"
        );

        Ok(Self {
            decoder,
            stream_index,
            time_base,
        })
    }

    pub fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<()> {
        match self.decoder.send_packet(packet) {
            Ok(()) => Ok(()),
            // Damaged packets are skipped; the next key frame resynchronises
            Err(ffmpeg::Error::InvalidData) => {
                tracing::debug!(
                    stream_index = self.stream_index,
                    pts = ?packet.pts(),
                    "send_packet: skipping invalid packet"
                );
                Ok(())
            }
            Err(e) => Err(AvpipeError::Ffmpeg(FfmpegError::Decode(format!(
                "send_packet error on stream {}: {}",
                self.stream_index, e
            )))),
        }
    }

    /// Send EOF so buffered pictures can be drained.
    pub fn send_eof(&mut self) -> Result<()> {
        match self.decoder.send_eof() {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(()),
            Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(AvpipeError::Ffmpeg(FfmpegError::Decode(format!(
                "send_eof error on stream {}: {}",
                self.stream_index, e
            )))),
        }
    }

    /// One decoded picture, or `None` when the decoder needs more input.
    pub fn receive_frame(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                // best effort pts survives decoders that leave pts unset
                let pts = frame.timestamp().or(frame.pts());
                frame.set_pts(pts);
                Ok(Some(frame))
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(None),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(AvpipeError::Ffmpeg(FfmpegError::Decode(format!(
                "receive_frame error on stream {}: {}",
                self.stream_index, e
            )))),
        }
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn time_base(&self) -> ffmpeg::Rational {
        self.time_base
    }

    pub fn width(&self) -> u32 {
        self.decoder.width()
    }

    pub fn height(&self) -> u32 {
        self.decoder.height()
    }

    pub fn format(&self) -> ffmpeg::format::Pixel {
        self.decoder.format()
    }

    pub fn sample_aspect_ratio(&self) -> ffmpeg::Rational {
        self.decoder.aspect_ratio()
    }
}

/// Resolve a decoder for an audio stream that is copied, not decoded.
///
/// Streams FFmpeg cannot decode are refused up front, before any output is
/// produced.
pub fn check_audio_decoder(stream: &ffmpeg::format::stream::Stream) -> Result<()> {
    let codec_id = stream.parameters().id();
    if helpers::decoder_exists(codec_id) {
        Ok(())
    } else {
        Err(FfmpegError::DecoderNotFound(format!(
            "no decoder for {} on audio stream {}",
            crate::ffmpeg_utils::codec_name(codec_id),
            stream.index()
        ))
        .into())
    }
}
