//! Video encoder for the transcoding pipeline
//!
//! Wraps an FFmpeg `AVCodecContext` that compresses filtered pictures with
//! the session's encoder (libx264 unless configured otherwise).

use std::ops::Deref;

use crate::error::{AvpipeError, FfmpegError, Result};
use crate::ffmpeg_utils::helpers;
use ffmpeg_next as ffmpeg;

/// Everything needed to open the encoder, gathered from the session
/// parameters and the opened decoder.
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub time_base: ffmpeg::Rational,
    pub frame_rate: Option<ffmpeg::Rational>,
    pub sample_aspect_ratio: ffmpeg::Rational,
    /// Used when the codec does not restrict its input formats
    pub fallback_format: ffmpeg::format::Pixel,
    pub bit_rate: i64,
    pub rc_max_rate: i64,
    pub rc_buffer_size: i32,
    pub crf: Option<String>,
    pub gop: i32,
    pub global_header: bool,
}

/// Video encoder backed by an FFmpeg codec context
pub struct VideoEncoder {
    encoder: ffmpeg::encoder::Video,
    codec_name: String,
    time_base: ffmpeg::Rational,
}

impl VideoEncoder {
    pub fn open(config: &VideoEncoderConfig) -> Result<Self> {
        let codec = ffmpeg::encoder::find_by_name(&config.codec_name).ok_or_else(|| {
            FfmpegError::EncoderNotFound(format!("no encoder named {}", config.codec_name))
        })?;
        let format = helpers::encoder_default_pix_fmt(&codec).unwrap_or(config.fallback_format);

        let mut context = ffmpeg::codec::Context::new_with_codec(codec);
        context.set_time_base(config.time_base);
        if config.rc_max_rate > 0 || config.rc_buffer_size > 0 {
            helpers::encoder_set_rate_control(
                &mut context,
                config.rc_max_rate,
                config.rc_buffer_size,
            );
        }
        if config.global_header {
            helpers::encoder_set_global_header(&mut context);
        }

        let mut video = context.encoder().video().map_err(|e| {
            FfmpegError::EncoderOpen(format!("{} is not a video encoder: {}", codec.name(), e))
        })?;
        video.set_width(config.width);
        video.set_height(config.height);
        video.set_format(format);
        video.set_aspect_ratio(config.sample_aspect_ratio);
        video.set_frame_rate(config.frame_rate);
        if config.bit_rate > 0 {
            video.set_bit_rate(config.bit_rate as usize);
        }
        if config.gop > 0 {
            video.set_gop(config.gop as u32);
        }

        let mut options = ffmpeg::Dictionary::new();
        if let Some(crf) = &config.crf {
            options.set("crf", crf);
        }

        let encoder = video.open_as_with(codec, options).map_err(|e| {
            FfmpegError::EncoderOpen(format!(
                "{} at {}x{} {:?}: {}",
                codec.name(),
                config.width,
                config.height,
                format,
                e
            ))
        })?;

        tracing::debug!(
            codec = codec.name(),
            width = config.width,
            height = config.height,
            format = ?format,
            bit_rate = config.bit_rate,
            crf = ?config.crf,
            gop = config.gop,
            "video encoder opened"
        );

        Ok(Self {
            encoder,
            codec_name: codec.name().to_string(),
            time_base: config.time_base,
        })
    }

    /// Send one picture, or `None` to start flushing.
    pub fn send_frame(&mut self, frame: Option<&ffmpeg::frame::Video>) -> Result<()> {
        let result = match frame {
            Some(frame) => self.encoder.send_frame(frame),
            None => self.encoder.send_eof(),
        };
        match result {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::Eof) if frame.is_none() => Ok(()),
            Err(e) => Err(AvpipeError::Ffmpeg(FfmpegError::Encode(format!(
                "{} send_frame error: {}",
                self.codec_name, e
            )))),
        }
    }

    /// One encoded packet, or `None` when the encoder needs more input.
    pub fn receive_packet(&mut self) -> Result<Option<ffmpeg::Packet>> {
        let mut packet = ffmpeg::Packet::empty();
        match self.encoder.receive_packet(&mut packet) {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(None),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(AvpipeError::Ffmpeg(FfmpegError::Encode(format!(
                "{} receive_packet error: {}",
                self.codec_name, e
            )))),
        }
    }

    /// Codec parameters of the opened encoder, for the output stream.
    pub fn codec_parameters(&self) -> Result<ffmpeg::codec::Parameters> {
        let ctx: &ffmpeg::codec::Context = self.encoder.deref();
        Ok(helpers::encoder_codec_parameters(ctx)?)
    }

    pub fn format(&self) -> ffmpeg::format::Pixel {
        self.encoder.format()
    }

    pub fn time_base(&self) -> ffmpeg::Rational {
        self.time_base
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }
}
