//! Test fixtures
//!
//! Synthesizes a short MP4 (mpeg4 video, AAC audio) with the linked FFmpeg so
//! the end-to-end tests need no checked-in media.

use std::path::{Path, PathBuf};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::channel_layout::ChannelLayout;

use crate::ffmpeg_utils::helpers;
use crate::io::MemoryStore;
use crate::params::{OutputFormat, TxParams};
use crate::probe::ProbeInfo;
use crate::transcode::encoder::{VideoEncoder, VideoEncoderConfig};
use crate::{Avpipe, AvpipeConfig};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;
pub const FPS: i32 = 25;
pub const SAMPLE_RATE: i32 = 48_000;

/// A synthesized media file that lives as long as this value.
pub struct TestMedia {
    _dir: tempfile::TempDir,
    pub path: PathBuf,
    pub frames: i64,
}

impl TestMedia {
    pub fn url(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn bytes(&self) -> Vec<u8> {
        std::fs::read(&self.path).unwrap()
    }
}

/// Both encoders the fixture needs, or `None` with a skip message.
pub fn encoders_available() -> bool {
    crate::ffmpeg_utils::init().unwrap();
    for name in ["mpeg4", "aac"] {
        if !helpers::encoder_exists(name) {
            eprintln!("skipping: {} encoder not built in", name);
            return false;
        }
    }
    true
}

/// Write `seconds` of test pattern and tone to a fresh mp4.
pub fn synth_mp4(seconds: i64) -> Option<TestMedia> {
    if !encoders_available() {
        return None;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.mp4");
    let frames = seconds * FPS as i64;
    write_media(&path, frames);
    Some(TestMedia {
        _dir: dir,
        path,
        frames,
    })
}

fn write_media(path: &Path, frames: i64) {
    let mut octx = ffmpeg::format::output(&path).unwrap();
    let global_header = octx
        .format()
        .flags()
        .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

    let video_tb = ffmpeg::Rational::new(1, FPS);
    let mut venc = VideoEncoder::open(&VideoEncoderConfig {
        codec_name: "mpeg4".to_string(),
        width: WIDTH,
        height: HEIGHT,
        time_base: video_tb,
        frame_rate: Some(ffmpeg::Rational::new(FPS, 1)),
        sample_aspect_ratio: ffmpeg::Rational::new(1, 1),
        fallback_format: ffmpeg::format::Pixel::YUV420P,
        bit_rate: 200_000,
        rc_max_rate: 0,
        rc_buffer_size: 0,
        crf: None,
        gop: FPS,
        global_header,
    })
    .unwrap();

    let aac = ffmpeg::encoder::find(ffmpeg::codec::Id::AAC).unwrap();
    let mut context = ffmpeg::codec::Context::new_with_codec(aac);
    context.set_time_base(ffmpeg::Rational::new(1, SAMPLE_RATE));
    if global_header {
        context.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
    }
    let mut audio = context.encoder().audio().unwrap();
    audio.set_rate(SAMPLE_RATE);
    audio.set_format(ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Planar));
    audio.set_channel_layout(ChannelLayout::STEREO);
    audio.set_bit_rate(96_000);
    let mut aenc = audio.open_as(aac).unwrap();
    let frame_size = match aenc.frame_size() {
        0 => 1024,
        n => n as usize,
    };

    {
        let mut vst = octx.add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None)).unwrap();
        vst.set_parameters(venc.codec_parameters().unwrap());
        vst.set_time_base(video_tb);
        vst.set_avg_frame_rate(ffmpeg::Rational::new(FPS, 1));
    }
    {
        let mut ast = octx.add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None)).unwrap();
        ast.set_parameters(&aenc);
        ast.set_time_base(ffmpeg::Rational::new(1, SAMPLE_RATE));
    }
    octx.write_header().unwrap();
    let vout_tb = octx.stream(0).unwrap().time_base();
    let aout_tb = octx.stream(1).unwrap().time_base();
    let atb = ffmpeg::Rational::new(1, SAMPLE_RATE);

    let samples_per_frame = (SAMPLE_RATE / FPS) as i64;
    let mut next_sample: i64 = 0;
    let mut picture = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::YUV420P, WIDTH, HEIGHT);
    let mut tone = ffmpeg::frame::Audio::new(
        ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Planar),
        frame_size,
        ChannelLayout::STEREO,
    );
    tone.set_rate(SAMPLE_RATE as u32);

    for i in 0..frames {
        paint(&mut picture, i);
        picture.set_pts(Some(i));
        venc.send_frame(Some(&picture)).unwrap();
        drain_video(&mut venc, &mut octx, video_tb, vout_tb);

        while next_sample < (i + 1) * samples_per_frame {
            fill_tone(&mut tone, next_sample);
            tone.set_pts(Some(next_sample));
            aenc.send_frame(&tone).unwrap();
            drain_audio(&mut aenc, &mut octx, atb, aout_tb);
            next_sample += frame_size as i64;
        }
    }

    venc.send_frame(None).unwrap();
    drain_video(&mut venc, &mut octx, video_tb, vout_tb);
    aenc.send_eof().unwrap();
    drain_audio(&mut aenc, &mut octx, atb, aout_tb);
    octx.write_trailer().unwrap();
}

fn paint(picture: &mut ffmpeg::frame::Video, index: i64) {
    for plane in 0..3 {
        let stride = picture.stride(plane);
        let data = picture.data_mut(plane);
        for (n, byte) in data.iter_mut().enumerate() {
            let (y, x) = (n / stride, n % stride);
            *byte = if plane == 0 {
                ((x + y) as i64 * 3 + index * 5) as u8
            } else {
                128
            };
        }
    }
}

fn fill_tone(frame: &mut ffmpeg::frame::Audio, first_sample: i64) {
    let samples = frame.samples();
    for ch in 0..2 {
        let plane = frame.plane_mut::<f32>(ch);
        for (n, s) in plane.iter_mut().take(samples).enumerate() {
            let t = (first_sample + n as i64) as f32 / SAMPLE_RATE as f32;
            *s = 0.2 * (t * 440.0 * std::f32::consts::TAU).sin();
        }
    }
}

fn drain_video(
    enc: &mut VideoEncoder,
    octx: &mut ffmpeg::format::context::Output,
    from: ffmpeg::Rational,
    to: ffmpeg::Rational,
) {
    while let Some(mut packet) = enc.receive_packet().unwrap() {
        packet.set_stream(0);
        packet.rescale_ts(from, to);
        packet.write_interleaved(octx).unwrap();
    }
}

fn drain_audio(
    enc: &mut ffmpeg::encoder::Audio,
    octx: &mut ffmpeg::format::context::Output,
    from: ffmpeg::Rational,
    to: ffmpeg::Rational,
) {
    let mut packet = ffmpeg::Packet::empty();
    while enc.receive_packet(&mut packet).is_ok() {
        packet.set_stream(1);
        packet.rescale_ts(from, to);
        packet.write_interleaved(octx).unwrap();
    }
}

/// An `Avpipe` writing into a fresh memory store.
pub fn memory_pipe() -> (Avpipe, MemoryStore) {
    let store = MemoryStore::new();
    let pipe = Avpipe::in_memory(AvpipeConfig::default(), store.clone()).unwrap();
    (pipe, store)
}

/// Transcode parameters with two-second segments for the fixture's video
/// time base, re-encoding with mpeg4.
pub fn params_for(info: &ProbeInfo, format: OutputFormat) -> TxParams {
    let video = info
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .unwrap();
    let (num, den) = parse_rational(&video.time_base);
    let ticks_per_frame = den / (num * FPS as i64);
    TxParams {
        format,
        ecodec: "mpeg4".to_string(),
        seg_duration_fr: 2 * FPS as i64,
        seg_duration_ts: 2 * FPS as i64 * ticks_per_frame,
        seg_duration: "2".to_string(),
        force_keyint: Some(FPS as u32),
        video_bitrate: Some(200_000),
        ..TxParams::default()
    }
}

pub fn parse_rational(s: &str) -> (i64, i64) {
    let (num, den) = s.split_once('/').unwrap();
    (num.parse().unwrap(), den.parse().unwrap())
}
