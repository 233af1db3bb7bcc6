//! FFmpeg-backed transcoding session
//!
//! [`Transcoder::build`] runs the preparation phases (open input, pick
//! streams, open coders, build the filter, write the container header) and
//! [`Transcoder`] then drives [`pump`] through its [`Stages`] impl. All
//! contexts are owned fields, so dropping a half-built or finished
//! transcoder releases everything exactly once.

use std::sync::Arc;

use ffmpeg_next as ffmpeg;

use super::decoder::{check_audio_decoder, VideoDecoder};
use super::encoder::{VideoEncoder, VideoEncoderConfig};
use super::filter::{filter_description, FilterInput, VideoFilter};
use super::muxer::MuxerPlan;
use super::pump::{pump, MediaFrame, MediaPacket, PumpWindow, Stages, StreamRoute};
use super::TxStats;
use crate::error::{AvpipeError, FfmpegError, Result};
use crate::ffmpeg_utils::{helpers, rational_string};
use crate::io::avio::{open_input, CustomInput, CustomOutput, OutputTracker};
use crate::io::{ConnectionGuard, HandleRegistry};
use crate::params::{TxParams, TxType};
use crate::session::{CancelFlags, TxJob};

impl MediaPacket for ffmpeg::Packet {
    fn stream_index(&self) -> usize {
        ffmpeg::Packet::stream(self)
    }

    fn pts(&self) -> Option<i64> {
        ffmpeg::Packet::pts(self)
    }

    fn dts(&self) -> Option<i64> {
        ffmpeg::Packet::dts(self)
    }

    fn duration(&self) -> i64 {
        ffmpeg::Packet::duration(self)
    }

    fn set_duration(&mut self, duration: i64) {
        ffmpeg::Packet::set_duration(self, duration)
    }
}

impl MediaFrame for ffmpeg::frame::Video {
    fn pts(&self) -> Option<i64> {
        ffmpeg::frame::Frame::pts(self)
    }

    fn force_keyframe(&mut self) {
        self.set_kind(ffmpeg::picture::Type::I);
    }
}

/// Input stream → output stream mapping
#[derive(Debug, Clone, Copy)]
struct Route {
    input_index: usize,
    output_index: usize,
    input_tb: ffmpeg::Rational,
    /// Known once the header is written; muxers may change it
    output_tb: ffmpeg::Rational,
}

/// One fully prepared transcoding session
///
/// Field order is drop order: coders and the muxer go before the demuxer,
/// and the connection is released last.
pub struct Transcoder {
    label: String,
    encoder: Option<VideoEncoder>,
    filter: Option<VideoFilter>,
    decoder: Option<VideoDecoder>,
    output: CustomOutput,
    input: CustomInput,
    video: Option<Route>,
    audio: Option<Route>,
    bypass: bool,
    window: PumpWindow,
    _connection: ConnectionGuard,
}

// SAFETY: the FFmpeg contexts are owned exclusively by this value and are
// only ever touched by the thread currently holding it. The tracker's
// interior mutability is confined to callbacks on that same thread.
unsafe impl Send for Transcoder {}

impl Transcoder {
    /// Open `url` and prepare everything up to and including the container
    /// header.
    pub fn build(
        registry: Arc<HandleRegistry>,
        params: &TxParams,
        url: &str,
        grace_frames: u32,
    ) -> Result<Self> {
        params.validate()?;
        let window = PumpWindow::from_params(params, grace_frames)?;

        let (id, backend) = registry.open_input(url)?;
        let connection = ConnectionGuard::new(registry.clone(), id);
        let mut input = open_input(backend, id, url, registry.io_config(), params.seekable)?;

        let (video_in, audio_in) = select_streams(&input.input, params)?;
        // video, when present, is always output stream 0
        let video_out = video_in.map(|_| 0usize);

        let plan = MuxerPlan::new(params, video_in.is_some(), audio_in.is_some())?;
        let tracker = OutputTracker::new(
            registry.clone(),
            id,
            video_out.map(|i| i as i32),
            params.start_segment,
        );
        let mut output = CustomOutput::new(plan.muxer, &plan.url, tracker)?;

        let mut decoder = None;
        let mut encoder = None;
        let mut filter = None;
        let mut video = None;

        if let Some(index) = video_in {
            let stream = input
                .input
                .stream(index)
                .ok_or_else(|| AvpipeError::StreamNotFound(format!("video stream {}", index)))?;
            let tb = stream.time_base();
            params.check_seg_duration_agreement((tb.numerator(), tb.denominator()))?;

            let parameters = if params.bypass {
                stream.parameters()
            } else {
                let dec = VideoDecoder::open(&stream, params.dcodec.as_deref())?;
                let enc = VideoEncoder::open(&encoder_config(params, &dec, &stream, &output)?)?;
                let filter_input = FilterInput {
                    width: dec.width(),
                    height: dec.height(),
                    format: dec.format(),
                    time_base: dec.time_base(),
                    sample_aspect_ratio: dec.sample_aspect_ratio(),
                };
                let desc = filter_description(
                    params.enc_width.unwrap_or(dec.width()),
                    params.enc_height.unwrap_or(dec.height()),
                    enc.format(),
                    params.watermark.as_ref(),
                )?;
                filter = Some(VideoFilter::new(&filter_input, enc.format(), &desc)?);
                let parameters = enc.codec_parameters()?;
                decoder = Some(dec);
                encoder = Some(enc);
                parameters
            };

            let mut out_stream = output
                .output
                .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
                .map_err(|e| FfmpegError::StreamConfig(format!("video output stream: {}", e)))?;
            out_stream.set_parameters(parameters);
            helpers::stream_reset_codec_tag(&mut out_stream);
            out_stream.set_time_base(tb);
            out_stream.set_avg_frame_rate(stream.avg_frame_rate());

            video = Some(Route {
                input_index: index,
                output_index: out_stream.index(),
                input_tb: tb,
                output_tb: tb,
            });
        }

        let mut audio = None;
        if let Some(index) = audio_in {
            let stream = input
                .input
                .stream(index)
                .ok_or_else(|| AvpipeError::StreamNotFound(format!("audio stream {}", index)))?;
            let tb = stream.time_base();
            let source_rate = helpers::codec_params_sample_rate(&stream.parameters());

            let mut out_stream = output
                .output
                .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
                .map_err(|e| FfmpegError::StreamConfig(format!("audio output stream: {}", e)))?;
            out_stream.set_parameters(stream.parameters());
            helpers::stream_reset_codec_tag(&mut out_stream);
            out_stream.set_time_base(tb);
            if source_rate == 0 {
                if let Some(rate) = params.sample_rate {
                    helpers::stream_set_sample_rate(&mut out_stream, rate);
                }
            }

            audio = Some(Route {
                input_index: index,
                output_index: out_stream.index(),
                input_tb: tb,
                output_tb: tb,
            });
        }

        helpers::output_set_timing(&mut output.output, params.start_time_ts, params.duration_ts);

        output
            .output
            .write_header_with(plan.dictionary())
            .map_err(|e| {
                output.tracker().take_error().unwrap_or_else(|| {
                    FfmpegError::WriteHeader(format!("{}: {}", plan.muxer, e)).into()
                })
            })?;

        for route in video.iter_mut().chain(audio.iter_mut()) {
            if let Some(stream) = output.output.stream(route.output_index) {
                route.output_tb = stream.time_base();
            }
        }

        if let (Some(start), Some(route)) = (params.start_time_ts, video) {
            if start > 0 {
                helpers::input_seek_stream(&mut input.input, route.input_index, start)?;
            }
        }

        tracing::info!(
            url,
            connection = id,
            format = params.format.as_str(),
            muxer = plan.muxer,
            video_stream = ?video.map(|r| r.input_index),
            audio_stream = ?audio.map(|r| r.input_index),
            bypass = params.bypass,
            video_tb = ?video.map(|r| rational_string(r.output_tb)),
            "transcoding session prepared"
        );

        Ok(Self {
            label: url.to_string(),
            encoder,
            filter,
            decoder,
            output,
            input,
            video,
            audio,
            bypass: params.bypass,
            window,
            _connection: connection,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// An I/O failure recorded by the output hooks beats FFmpeg's generic
    /// error code.
    fn muxer_error(&self, fallback: FfmpegError) -> AvpipeError {
        self.output
            .tracker()
            .take_error()
            .unwrap_or(AvpipeError::Ffmpeg(fallback))
    }

    fn write(&mut self, mut packet: ffmpeg::Packet, route: Route, from: ffmpeg::Rational) -> Result<()> {
        packet.rescale_ts(from, route.output_tb);
        packet.set_stream(route.output_index);
        packet.set_position(-1);
        let is_video = Some(route.input_index) == self.video.map(|r| r.input_index);
        let end = packet.pts().map(|pts| pts + packet.duration());
        packet
            .write_interleaved(&mut self.output.output)
            .map_err(|e| {
                self.muxer_error(FfmpegError::WritePacket(format!(
                    "stream {}: {}",
                    route.output_index, e
                )))
            })?;
        if is_video {
            if let Some(end) = end {
                self.output.tracker().set_encoding_end_pts(end);
            }
        }
        Ok(())
    }

    fn finish(&mut self, stats: super::PumpStats) -> Result<TxStats> {
        self.output
            .output
            .write_trailer()
            .map_err(|e| self.muxer_error(FfmpegError::WriteTrailer(e.to_string())))?;
        self.output.close_main()?;
        if let Some(e) = self.output.tracker().take_error() {
            return Err(e);
        }
        if let Some(e) = self.input.avio.take_error() {
            return Err(e);
        }
        let tracker = self.output.tracker();
        Ok(TxStats {
            pump: stats,
            bytes_read: self.input.avio.bytes_read(),
            bytes_written: tracker.bytes_written(),
            outputs: tracker.outputs_opened(),
        })
    }
}

/// Pick the video and audio input streams the session produces.
fn select_streams(
    input: &ffmpeg::format::context::Input,
    params: &TxParams,
) -> Result<(Option<usize>, Option<usize>)> {
    let video = if params.tx_type.wants_video() {
        input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .map(|s| s.index())
    } else {
        None
    };
    if video.is_none() && params.tx_type == TxType::Video {
        return Err(AvpipeError::StreamNotFound("input has no video stream".into()));
    }

    let audio = if params.tx_type.wants_audio() {
        let stream = match params.audio_index {
            Some(index) => {
                let stream = input.stream(index).ok_or_else(|| {
                    AvpipeError::StreamNotFound(format!("audio_index {} out of range", index))
                })?;
                if stream.parameters().medium() != ffmpeg::media::Type::Audio {
                    return Err(AvpipeError::StreamNotFound(format!(
                        "stream {} is not audio",
                        index
                    )));
                }
                Some(stream)
            }
            None => input.streams().best(ffmpeg::media::Type::Audio),
        };
        match stream {
            Some(stream) => {
                check_audio_decoder(&stream)?;
                Some(stream.index())
            }
            None => None,
        }
    } else {
        None
    };
    if audio.is_none() && params.tx_type == TxType::Audio {
        return Err(AvpipeError::StreamNotFound("input has no audio stream".into()));
    }
    Ok((video, audio))
}

fn encoder_config(
    params: &TxParams,
    decoder: &VideoDecoder,
    stream: &ffmpeg::format::stream::Stream,
    output: &CustomOutput,
) -> Result<VideoEncoderConfig> {
    let rc_buffer_size = match params.rc_buffer_size {
        Some(size) => i32::try_from(size)
            .map_err(|_| AvpipeError::Config(format!("rc_buffer_size {} too large", size)))?,
        None => 0,
    };
    let avg = stream.avg_frame_rate();
    Ok(VideoEncoderConfig {
        codec_name: params.ecodec.clone(),
        width: params.enc_width.unwrap_or(decoder.width()),
        height: params.enc_height.unwrap_or(decoder.height()),
        time_base: decoder.time_base(),
        frame_rate: (avg.numerator() > 0).then_some(avg),
        sample_aspect_ratio: decoder.sample_aspect_ratio(),
        fallback_format: decoder.format(),
        bit_rate: params.video_bitrate.unwrap_or(0),
        rc_max_rate: params.rc_max_rate.unwrap_or(0),
        rc_buffer_size,
        crf: params.crf.clone(),
        gop: params.force_keyint.map(|k| k as i32).unwrap_or(0),
        global_header: helpers::output_wants_global_header(&output.output),
    })
}

impl Stages for Transcoder {
    type Packet = ffmpeg::Packet;
    type Frame = ffmpeg::frame::Video;

    fn read_packet(&mut self) -> Result<Option<ffmpeg::Packet>> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input.input) {
                Ok(()) => return Ok(Some(packet)),
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => continue,
                Err(e) => {
                    return Err(self.input.avio.take_error().unwrap_or_else(|| {
                        FfmpegError::ReadPacket(format!("{}: {}", self.label, e)).into()
                    }))
                }
            }
        }
    }

    fn route(&self, stream_index: usize) -> StreamRoute {
        match (self.video, self.audio) {
            (Some(v), _) if v.input_index == stream_index => {
                if self.bypass {
                    StreamRoute::CopyVideo
                } else {
                    StreamRoute::Transcode
                }
            }
            (_, Some(a)) if a.input_index == stream_index => StreamRoute::CopyAudio,
            _ => StreamRoute::Drop,
        }
    }

    fn copy_packet(&mut self, packet: ffmpeg::Packet) -> Result<()> {
        let index = packet.stream();
        let route = [self.video, self.audio]
            .into_iter()
            .flatten()
            .find(|r| r.input_index == index)
            .ok_or_else(|| AvpipeError::StreamNotFound(format!("no route for stream {}", index)))?;
        if self.bypass && Some(route.input_index) == self.video.map(|r| r.input_index) {
            if let Some(pts) = packet.pts() {
                self.output.tracker().set_decoding_start_pts(pts);
            }
        }
        self.write(packet, route, route.input_tb)
    }

    fn send_packet(&mut self, packet: &ffmpeg::Packet) -> Result<()> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder.send_packet(packet),
            None => Ok(()),
        }
    }

    fn send_decoder_eof(&mut self) -> Result<()> {
        match self.decoder.as_mut() {
            Some(decoder) => decoder.send_eof(),
            None => Ok(()),
        }
    }

    fn receive_frame(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(None);
        };
        let frame = decoder.receive_frame()?;
        if let Some(pts) = frame.as_ref().and_then(|f| f.pts()) {
            self.output.tracker().set_decoding_start_pts(pts);
        }
        Ok(frame)
    }

    fn filter(&mut self, frame: &ffmpeg::frame::Video) -> Result<Vec<ffmpeg::frame::Video>> {
        match self.filter.as_mut() {
            Some(filter) => filter.filter(frame),
            None => Ok(Vec::new()),
        }
    }

    fn send_frame(&mut self, frame: Option<&ffmpeg::frame::Video>) -> Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder.send_frame(frame),
            None => Ok(()),
        }
    }

    fn receive_packet(&mut self) -> Result<Option<ffmpeg::Packet>> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder.receive_packet(),
            None => Ok(None),
        }
    }

    fn write_encoded(&mut self, packet: ffmpeg::Packet) -> Result<()> {
        let (Some(route), Some(encoder)) = (self.video, self.encoder.as_ref()) else {
            return Err(AvpipeError::StreamNotFound("encoded packet without video route".into()));
        };
        let from = encoder.time_base();
        self.write(packet, route, from)
    }
}

impl TxJob for Transcoder {
    fn run(&mut self, cancel: &CancelFlags) -> Result<TxStats> {
        let window = self.window;
        match pump(self, window, cancel) {
            Ok(stats) => {
                let stats = self.finish(stats)?;
                tracing::info!(
                    label = %self.label,
                    packets = stats.pump.packets_read,
                    frames = stats.pump.frames_encoded,
                    outputs = stats.outputs,
                    bytes_written = stats.bytes_written,
                    "transcoding finished"
                );
                Ok(stats)
            }
            Err(AvpipeError::Cancelled) => {
                tracing::info!(label = %self.label, "transcoding cancelled; trailer skipped");
                Err(AvpipeError::Cancelled)
            }
            Err(e) => {
                tracing::error!(label = %self.label, error = %e, "transcoding failed");
                Err(e)
            }
        }
    }
}
