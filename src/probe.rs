//! Stream discovery
//!
//! Opens an input through the same handlers a transcode would use and
//! describes every elementary stream plus the container. Nothing is decoded
//! and no session is created.

use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use serde::Serialize;

use crate::error::Result;
use crate::ffmpeg_utils::{self, helpers};
use crate::io::avio::open_input;
use crate::io::{ConnectionGuard, HandleRegistry};

/// One elementary stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub stream_index: usize,
    pub codec_type: &'static str,
    pub codec_id: i32,
    pub codec_name: &'static str,
    pub duration_ts: i64,
    pub time_base: String,
    pub nb_frames: i64,
    pub start_time: i64,
    pub avg_frame_rate: String,
    pub frame_rate: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub channel_layout: u64,
    pub channel_layout_name: Option<String>,
    pub ticks_per_frame: i32,
    pub bit_rate: i64,
    pub has_b_frames: bool,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: Option<i32>,
    pub pix_fmt_name: Option<String>,
    pub sample_aspect_ratio: String,
    pub display_aspect_ratio: String,
    pub field_order: &'static str,
    pub profile: i32,
    pub profile_name: Option<String>,
    pub level: i32,
}

/// The container as a whole
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerInfo {
    pub format_name: String,
    /// Seconds, never negative
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeInfo {
    pub streams: Vec<StreamInfo>,
    pub container: ContainerInfo,
}

/// Probe `url` through `registry`. `seekable` controls whether the input
/// AVIO exposes seeking to the demuxer.
pub fn probe(registry: &Arc<HandleRegistry>, url: &str, seekable: bool) -> Result<ProbeInfo> {
    let (id, backend) = registry.open_input(url)?;
    let _connection = ConnectionGuard::new(registry.clone(), id);
    let input = open_input(backend, id, url, registry.io_config(), seekable)?;

    let streams: Vec<StreamInfo> = input
        .input
        .streams()
        .map(|stream| describe_stream(&stream))
        .collect();

    let duration = input.input.duration();
    let container = ContainerInfo {
        format_name: input.input.format().name().to_string(),
        duration: if duration > 0 {
            duration as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        } else {
            0.0
        },
    };

    tracing::info!(
        url,
        streams = streams.len(),
        format = %container.format_name,
        duration = container.duration,
        "input probed"
    );
    Ok(ProbeInfo { streams, container })
}

fn describe_stream(stream: &ffmpeg::format::stream::Stream) -> StreamInfo {
    let params = stream.parameters();
    let medium = params.medium();
    let codec_id = params.id();
    let width = helpers::codec_params_width(&params);
    let height = helpers::codec_params_height(&params);
    let sar = helpers::codec_params_sample_aspect_ratio(&params);
    let profile = helpers::codec_params_profile(&params);

    let pix_fmt = if medium == ffmpeg::media::Type::Video {
        video_pixel_format(&params)
    } else {
        None
    };
    let (channel_layout_name, ticks_per_frame) = match medium {
        ffmpeg::media::Type::Audio => (helpers::codec_params_channel_layout_name(&params), 1),
        ffmpeg::media::Type::Video if helpers::codec_uses_fields(codec_id) => (None, 2),
        _ => (None, 1),
    };

    ffmpeg_utils::debug_stream_info(stream, stream.index());

    StreamInfo {
        stream_index: stream.index(),
        codec_type: ffmpeg_utils::media_type_name(medium),
        codec_id: ffmpeg::ffi::AVCodecID::from(codec_id) as i32,
        codec_name: ffmpeg_utils::codec_name(codec_id),
        duration_ts: stream.duration(),
        time_base: ffmpeg_utils::rational_string(stream.time_base()),
        nb_frames: stream.frames(),
        start_time: stream.start_time(),
        avg_frame_rate: ffmpeg_utils::rational_string(stream.avg_frame_rate()),
        frame_rate: ffmpeg_utils::rational_string(stream.rate()),
        sample_rate: helpers::codec_params_sample_rate(&params),
        channels: helpers::codec_params_channels(&params),
        channel_layout: helpers::codec_params_channel_layout(&params),
        channel_layout_name,
        ticks_per_frame,
        bit_rate: helpers::codec_params_bit_rate(&params),
        has_b_frames: helpers::codec_params_video_delay(&params) > 0,
        width,
        height,
        pix_fmt: pix_fmt.map(|p| ffmpeg::ffi::AVPixelFormat::from(p) as i32),
        pix_fmt_name: pix_fmt.and_then(|p| p.descriptor()).map(|d| d.name().to_string()),
        sample_aspect_ratio: ffmpeg_utils::rational_string(sar),
        display_aspect_ratio: ffmpeg_utils::rational_string(ffmpeg_utils::display_aspect_ratio(
            width, height, sar,
        )),
        field_order: helpers::codec_params_field_order(&params),
        profile,
        profile_name: helpers::profile_name(codec_id, profile),
        level: helpers::codec_params_level(&params),
    }
}

/// Pixel format recorded in the stream parameters, without opening a decoder.
fn video_pixel_format(params: &ffmpeg::codec::Parameters) -> Option<ffmpeg::format::Pixel> {
    let context = ffmpeg::codec::Context::from_parameters(params.clone()).ok()?;
    let video = context.decoder().video().ok()?;
    match video.format() {
        ffmpeg::format::Pixel::None => None,
        format => Some(format),
    }
}
