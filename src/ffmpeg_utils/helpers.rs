//! Safe wrappers around FFmpeg FFI calls.
//!
//! Every function in this module is `pub` and **safe** to call.  All `unsafe`
//! blocks are contained here with explicit safety arguments.  Callers outside
//! this module should never need to write `unsafe` for routine FFmpeg access.

use ffmpeg_next as ffmpeg;
use std::ffi::CStr;

// ── Codec-parameter field accessors ─────────────────────────────────────────

/// Read `sample_rate` from an `AVCodecParameters` struct.
///
/// `ffmpeg-next` does not expose this field through a safe accessor.
pub fn codec_params_sample_rate(params: &ffmpeg::codec::parameters::Parameters) -> u32 {
    // SAFETY: `params.as_ptr()` returns a valid non-null pointer for the
    // lifetime of `params`.  `sample_rate` is a plain i32 field with no
    // ownership semantics.
    unsafe { (*params.as_ptr()).sample_rate.max(0) as u32 }
}

/// Read `ch_layout.nb_channels` from an `AVCodecParameters` struct.
pub fn codec_params_channels(params: &ffmpeg::codec::parameters::Parameters) -> u16 {
    // SAFETY: same as `codec_params_sample_rate`.
    unsafe { (*params.as_ptr()).ch_layout.nb_channels.max(0) as u16 }
}

/// Channel mask of a native-order layout, 0 for unspecified or custom layouts.
pub fn codec_params_channel_layout(params: &ffmpeg::codec::parameters::Parameters) -> u64 {
    // SAFETY: `u.mask` is only the active union member when `order` is
    // `AV_CHANNEL_ORDER_NATIVE`, which is checked first.
    unsafe {
        let layout = &(*params.as_ptr()).ch_layout;
        if layout.order == ffmpeg::ffi::AVChannelOrder::AV_CHANNEL_ORDER_NATIVE {
            layout.u.mask
        } else {
            0
        }
    }
}

/// Human readable channel layout (`stereo`, `5.1(side)`, ...), if known.
pub fn codec_params_channel_layout_name(
    params: &ffmpeg::codec::parameters::Parameters,
) -> Option<String> {
    let mut buf = [0 as std::ffi::c_char; 64];
    // SAFETY: `ch_layout` is a valid layout inside live parameters; the
    // buffer size is passed so the description is always NUL terminated.
    unsafe {
        let layout = &(*params.as_ptr()).ch_layout;
        if layout.nb_channels <= 0 {
            return None;
        }
        let ret = ffmpeg::ffi::av_channel_layout_describe(layout, buf.as_mut_ptr(), buf.len());
        if ret < 0 {
            return None;
        }
        Some(
            std::ffi::CStr::from_ptr(buf.as_ptr())
                .to_string_lossy()
                .into_owned(),
        )
    }
}

/// Read `width` from an `AVCodecParameters` struct.
pub fn codec_params_width(params: &ffmpeg::codec::parameters::Parameters) -> u32 {
    unsafe { (*params.as_ptr()).width.max(0) as u32 }
}

/// Read `height` from an `AVCodecParameters` struct.
pub fn codec_params_height(params: &ffmpeg::codec::parameters::Parameters) -> u32 {
    unsafe { (*params.as_ptr()).height.max(0) as u32 }
}

/// Read `profile` from an `AVCodecParameters` struct.
pub fn codec_params_profile(params: &ffmpeg::codec::parameters::Parameters) -> i32 {
    unsafe { (*params.as_ptr()).profile }
}

/// Read `level` from an `AVCodecParameters` struct.
pub fn codec_params_level(params: &ffmpeg::codec::parameters::Parameters) -> i32 {
    unsafe { (*params.as_ptr()).level }
}

/// Read `bit_rate` from an `AVCodecParameters` struct.
pub fn codec_params_bit_rate(params: &ffmpeg::codec::parameters::Parameters) -> i64 {
    unsafe { (*params.as_ptr()).bit_rate }
}

/// Read `video_delay` (the "has B-frames" reorder depth).
pub fn codec_params_video_delay(params: &ffmpeg::codec::parameters::Parameters) -> i32 {
    unsafe { (*params.as_ptr()).video_delay }
}

/// Read `sample_aspect_ratio` from an `AVCodecParameters` struct.
pub fn codec_params_sample_aspect_ratio(
    params: &ffmpeg::codec::parameters::Parameters,
) -> ffmpeg::Rational {
    unsafe { (*params.as_ptr()).sample_aspect_ratio.into() }
}

/// Field order as the short names used in probe output.
pub fn codec_params_field_order(params: &ffmpeg::codec::parameters::Parameters) -> &'static str {
    use ffmpeg::ffi::AVFieldOrder::*;
    // SAFETY: plain enum field read, valid for the lifetime of `params`.
    match unsafe { (*params.as_ptr()).field_order } {
        AV_FIELD_PROGRESSIVE => "progressive",
        AV_FIELD_TT => "tt",
        AV_FIELD_BB => "bb",
        AV_FIELD_TB => "tb",
        AV_FIELD_BT => "bt",
        _ => "",
    }
}

/// Profile name registered for `codec_id`, if FFmpeg knows one.
pub fn profile_name(codec_id: ffmpeg::codec::Id, profile: i32) -> Option<String> {
    // SAFETY: `avcodec_profile_name` returns either null or a pointer into a
    // static table owned by libavcodec.
    unsafe {
        let ptr = ffmpeg::ffi::avcodec_profile_name(codec_id.into(), profile);
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }
}

/// Returns `true` when frames of this codec are coded as field pairs, which
/// makes the container tick twice per frame.
pub fn codec_uses_fields(codec_id: ffmpeg::codec::Id) -> bool {
    // AV_CODEC_PROP_FIELDS
    const PROP_FIELDS: i32 = 1 << 4;
    // SAFETY: `avcodec_descriptor_get` returns null or a pointer to a static
    // descriptor.
    unsafe {
        let desc = ffmpeg::ffi::avcodec_descriptor_get(codec_id.into());
        !desc.is_null() && ((*desc).props & PROP_FIELDS) != 0
    }
}

/// Zero out `codec_tag` on the `AVCodecParameters` attached to an output
/// stream, so the muxer picks the correct tag for the target container.
///
/// Must be called after `out_stream.set_parameters(...)` and before
/// `write_header`.
pub fn stream_reset_codec_tag(out_stream: &mut ffmpeg::format::stream::StreamMut) {
    // SAFETY: `out_stream.as_mut_ptr()` is valid for the lifetime of the
    // stream.  `codecpar` is set by `set_parameters` and is non-null.
    unsafe {
        (*(*out_stream.as_mut_ptr()).codecpar).codec_tag = 0;
    }
}

/// Override the sample rate on an output stream whose parameters were copied
/// from a source that did not declare one.
pub fn stream_set_sample_rate(out_stream: &mut ffmpeg::format::stream::StreamMut, rate: u32) {
    // SAFETY: as in `stream_reset_codec_tag`.
    unsafe {
        (*(*out_stream.as_mut_ptr()).codecpar).sample_rate = rate as i32;
    }
}

/// Allocate a fresh `AVCodecParameters`, copy an opened encoder context into
/// it, and return it as a safe `ffmpeg::codec::Parameters`.
pub fn encoder_codec_parameters(
    ctx: &ffmpeg::codec::Context,
) -> Result<ffmpeg::codec::Parameters, crate::error::FfmpegError> {
    use std::rc::Rc;
    // SAFETY: `avcodec_parameters_alloc` returns a valid pointer or null,
    // checked below.  `avcodec_parameters_from_context` copies fields from a
    // live codec context.
    unsafe {
        let params = ffmpeg::ffi::avcodec_parameters_alloc();
        if params.is_null() {
            return Err(crate::error::FfmpegError::Alloc(
                "avcodec_parameters_alloc".to_string(),
            ));
        }
        ffmpeg::ffi::avcodec_parameters_from_context(params, ctx.as_ptr());
        Ok(ffmpeg::codec::Parameters::wrap(
            params,
            None::<Rc<dyn std::any::Any>>,
        ))
    }
}

/// Set `pkt_timebase` and `time_base` on a decoder context before it is opened.
///
/// Decoders use `pkt_timebase` to interpret packet timestamps; without it the
/// frame `best_effort_timestamp` is computed in an unknown unit.
pub fn decoder_set_timebase(ctx: &mut ffmpeg::codec::Context, tb: ffmpeg::Rational) {
    // SAFETY: `ctx.as_mut_ptr()` is a valid codec context; both fields are
    // plain AVRational values.
    unsafe {
        let p = ctx.as_mut_ptr();
        (*p).pkt_timebase = tb.into();
        (*p).time_base = tb.into();
    }
}

/// Decoder thread count; 0 lets libavcodec pick.
pub fn decoder_set_threads(ctx: &mut ffmpeg::codec::Context, count: i32) {
    unsafe {
        (*ctx.as_mut_ptr()).thread_count = count;
    }
}

/// Set `rc_max_rate` and `rc_buffer_size` on an unopened encoder context.
pub fn encoder_set_rate_control(ctx: &mut ffmpeg::codec::Context, max_rate: i64, buffer_size: i32) {
    // SAFETY: plain scalar fields on a valid codec context.
    unsafe {
        let p = ctx.as_mut_ptr();
        if max_rate > 0 {
            (*p).rc_max_rate = max_rate;
        }
        if buffer_size > 0 {
            (*p).rc_buffer_size = buffer_size;
        }
    }
}

/// Set the encoder's GOP size (`gop_size`) on an unopened context.
pub fn encoder_set_gop(ctx: &mut ffmpeg::codec::Context, gop: i32) {
    unsafe {
        (*ctx.as_mut_ptr()).gop_size = gop;
    }
}

/// Request global headers when the muxer stores codec config out of band.
pub fn encoder_set_global_header(ctx: &mut ffmpeg::codec::Context) {
    // SAFETY: `flags` is a plain bitfield on a valid codec context.
    unsafe {
        (*ctx.as_mut_ptr()).flags |= ffmpeg::ffi::AV_CODEC_FLAG_GLOBAL_HEADER as i32;
    }
}

/// First pixel format an encoder advertises, if it restricts them at all.
pub fn encoder_default_pix_fmt(codec: &ffmpeg::Codec) -> Option<ffmpeg::format::Pixel> {
    // SAFETY: `codec` points into the static codec registry. The returned
    // array is owned by libavcodec, lives as long as the codec and holds
    // `count` entries.
    unsafe {
        let mut configs: *const std::ffi::c_void = std::ptr::null();
        let mut count: std::ffi::c_int = 0;
        let ret = ffmpeg::ffi::avcodec_get_supported_config(
            std::ptr::null(),
            codec.as_ptr(),
            ffmpeg::ffi::AVCodecConfig::AV_CODEC_CONFIG_PIX_FORMAT,
            0,
            &mut configs,
            &mut count,
        );
        if ret < 0 || configs.is_null() || count <= 0 {
            return None;
        }
        let first = *(configs as *const ffmpeg::ffi::AVPixelFormat);
        Some(ffmpeg::format::Pixel::from(first))
    }
}

/// Record the output's nominal start time and duration (in the video
/// stream's ticks) on the container context.
pub fn output_set_timing(
    output: &mut ffmpeg::format::context::Output,
    start_time: Option<i64>,
    duration: Option<i64>,
) {
    // SAFETY: plain scalar fields on a valid format context.
    unsafe {
        let ctx = output.as_mut_ptr();
        if let Some(start) = start_time {
            (*ctx).start_time = start;
        }
        if let Some(duration) = duration {
            (*ctx).duration = duration;
        }
    }
}

/// Seek `stream_index` to the key frame at or before `ts` (stream ticks).
pub fn input_seek_stream(
    input: &mut ffmpeg::format::context::Input,
    stream_index: usize,
    ts: i64,
) -> Result<(), crate::error::FfmpegError> {
    // SAFETY: valid demuxer context owned by `input`.
    let ret = unsafe {
        ffmpeg::ffi::av_seek_frame(
            input.as_mut_ptr(),
            stream_index as std::ffi::c_int,
            ts,
            ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as std::ffi::c_int,
        )
    };
    if ret < 0 {
        return Err(crate::error::FfmpegError::Seek(format!(
            "stream {} to {}: {}",
            stream_index,
            ts,
            ffmpeg::Error::from(ret)
        )));
    }
    Ok(())
}

/// Returns `true` if the output format wants codec headers out of band.
pub fn output_wants_global_header(output: &ffmpeg::format::context::Output) -> bool {
    // SAFETY: `oformat` is set for every allocated output context.
    unsafe {
        let oformat = (*output.as_ptr()).oformat;
        !oformat.is_null() && ((*oformat).flags & ffmpeg::ffi::AVFMT_GLOBALHEADER as i32) != 0
    }
}

// ── AVIO context management ──────────────────────────────────────────────────

/// Detach the `AVIOContext` (`pb`) from an output `AVFormatContext` by
/// setting it to null, preventing `avformat_free_context` from touching it.
///
/// Call this before dropping an `Output` whose `pb` was allocated manually.
pub fn detach_avio(output: &mut ffmpeg::format::context::Output) {
    // SAFETY: `output.as_mut_ptr()` is valid for the lifetime of `output`.
    // Setting `pb` to null is the documented way to prevent double-free when
    // the caller owns the AVIO context separately.
    unsafe {
        let ctx = output.as_mut_ptr();
        if !ctx.is_null() && !(*ctx).pb.is_null() {
            (*ctx).pb = std::ptr::null_mut();
        }
    }
}

/// Returns `true` if an encoder is registered under `name`.
pub fn encoder_exists(name: &str) -> bool {
    ffmpeg::encoder::find_by_name(name).is_some()
}

/// Returns `true` if a decoder is registered for `codec_id`.
pub fn decoder_exists(codec_id: ffmpeg::codec::Id) -> bool {
    // SAFETY: `avcodec_find_decoder` reads a global read-only registry after
    // `ffmpeg::init()`.  The returned pointer is only used for a null check.
    let ptr = unsafe { ffmpeg::ffi::avcodec_find_decoder(codec_id.into()) };
    !ptr.is_null()
}
