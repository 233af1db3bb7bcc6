//! FFmpeg utility functions

use ffmpeg_next as ffmpeg;

/// Convert timestamps from one timebase to another
///
/// This is essential when copying packets between streams with different timebases.
pub fn rescale_ts(ts: i64, from: ffmpeg::Rational, to: ffmpeg::Rational) -> i64 {
    unsafe { ffmpeg::ffi::av_rescale_q(ts, from.into(), to.into()) }
}

/// Get the codec name for a codec ID
pub fn codec_name(codec_id: ffmpeg::codec::Id) -> &'static str {
    codec_id.name()
}

/// Get the media type name
pub fn media_type_name(media_type: ffmpeg::media::Type) -> &'static str {
    match media_type {
        ffmpeg::media::Type::Video => "video",
        ffmpeg::media::Type::Audio => "audio",
        ffmpeg::media::Type::Subtitle => "subtitle",
        ffmpeg::media::Type::Data => "data",
        ffmpeg::media::Type::Attachment => "attachment",
        _ => "unknown",
    }
}

/// Get frame rate as f64
pub fn framerate_to_f64(framerate: ffmpeg::Rational) -> f64 {
    if framerate.denominator() == 0 {
        0.0
    } else {
        framerate.numerator() as f64 / framerate.denominator() as f64
    }
}

/// Format a rational as `num/den`, the form probe output uses.
pub fn rational_string(r: ffmpeg::Rational) -> String {
    format!("{}/{}", r.numerator(), r.denominator())
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Display aspect ratio for a picture of `width` x `height` with the given
/// sample aspect ratio, reduced to lowest terms.
///
/// An unset (0/x) sample aspect ratio is treated as square pixels.
pub fn display_aspect_ratio(width: u32, height: u32, sar: ffmpeg::Rational) -> ffmpeg::Rational {
    if width == 0 || height == 0 {
        return ffmpeg::Rational::new(0, 1);
    }
    let (sn, sd) = if sar.numerator() <= 0 || sar.denominator() <= 0 {
        (1, 1)
    } else {
        (sar.numerator() as i64, sar.denominator() as i64)
    };
    let num = width as i64 * sn;
    let den = height as i64 * sd;
    let g = gcd(num, den).max(1);
    ffmpeg::Rational::new((num / g) as i32, (den / g) as i32)
}

/// Convert a timestamp in `timebase` units to seconds.
pub fn ts_to_secs(ts: i64, timebase: ffmpeg::Rational) -> f64 {
    if timebase.denominator() == 0 {
        return 0.0;
    }
    ts as f64 * timebase.numerator() as f64 / timebase.denominator() as f64
}

/// Order two timestamps expressed in different time bases.
///
/// Exact: both sides are cross-multiplied in 128-bit integers.
pub fn compare_ts(
    a: i64,
    tb_a: ffmpeg::Rational,
    b: i64,
    tb_b: ffmpeg::Rational,
) -> std::cmp::Ordering {
    let lhs = a as i128 * tb_a.numerator() as i128 * tb_b.denominator() as i128;
    let rhs = b as i128 * tb_b.numerator() as i128 * tb_a.denominator() as i128;
    lhs.cmp(&rhs)
}

/// Print stream information for debugging
pub fn debug_stream_info(stream: &ffmpeg::Stream, index: usize) {
    let params = stream.parameters();
    tracing::debug!(
        "Stream {}: type={}, codec={}, time_base={}",
        index,
        media_type_name(params.medium()),
        codec_name(params.id()),
        rational_string(stream.time_base())
    );
}
