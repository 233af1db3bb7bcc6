//! Video filter graph
//!
//! Decoded pictures go through `buffer -> scale,format[,drawtext] ->
//! buffersink` so they reach the encoder at its size and pixel format,
//! optionally with a text watermark burnt in.

use crate::error::{AvpipeError, FfmpegError, Result};
use crate::params::Watermark;
use ffmpeg_next as ffmpeg;

/// Input side of the graph, taken from the opened decoder
#[derive(Debug, Clone, Copy)]
pub struct FilterInput {
    pub width: u32,
    pub height: u32,
    pub format: ffmpeg::format::Pixel,
    pub time_base: ffmpeg::Rational,
    pub sample_aspect_ratio: ffmpeg::Rational,
}

impl FilterInput {
    /// Arguments for the `buffer` source filter.
    pub fn buffer_args(&self) -> String {
        let pix_fmt: ffmpeg::ffi::AVPixelFormat = self.format.into();
        // an unknown aspect ratio is passed as 0/1, which buffer rejects
        let sar = if self.sample_aspect_ratio.numerator() == 0 {
            ffmpeg::Rational::new(1, 1)
        } else {
            self.sample_aspect_ratio
        };
        format!(
            "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}",
            self.width,
            self.height,
            pix_fmt as i32,
            self.time_base.numerator(),
            self.time_base.denominator(),
            sar.numerator(),
            sar.denominator()
        )
    }
}

/// Filter chain between the source and the sink.
pub fn filter_description(
    width: u32,
    height: u32,
    format: ffmpeg::format::Pixel,
    watermark: Option<&Watermark>,
) -> Result<String> {
    let name = format
        .descriptor()
        .map(|d| d.name().to_string())
        .ok_or_else(|| AvpipeError::Config(format!("pixel format {:?} has no name", format)))?;
    let mut desc = format!("scale={}:{},format=pix_fmts={}", width, height, name);
    if let Some(wm) = watermark {
        desc.push(',');
        desc.push_str(&drawtext(wm, height));
    }
    Ok(desc)
}

fn drawtext(wm: &Watermark, height: u32) -> String {
    let fontsize = (height as f64 * wm.relative_size as f64).round().max(1.0) as u32;
    let mut s = format!(
        "drawtext=text='{}':fontsize={}:fontcolor={}:x={}:y={}",
        escape_text(&wm.text),
        fontsize,
        wm.font_color,
        wm.xloc,
        wm.yloc
    );
    if wm.shadow {
        s.push_str(&format!(
            ":shadowx=2:shadowy=2:shadowcolor={}",
            wm.shadow_color
        ));
    }
    s
}

/// Quote watermark text for the drawtext option parser inside a
/// single-quoted graph argument.
fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\:"),
            '%' => out.push_str("\\\\%"),
            '\'' => out.push_str("'\\\\\\''"),
            c => out.push(c),
        }
    }
    out
}

/// Configured filter graph with one source and one sink
pub struct VideoFilter {
    graph: ffmpeg::filter::Graph,
}

impl VideoFilter {
    pub fn new(input: &FilterInput, output_format: ffmpeg::format::Pixel, description: &str) -> Result<Self> {
        let mut graph = ffmpeg::filter::Graph::new();
        let buffer = ffmpeg::filter::find("buffer")
            .ok_or_else(|| FfmpegError::FilterGraph("buffer filter missing".into()))?;
        let sink = ffmpeg::filter::find("buffersink")
            .ok_or_else(|| FfmpegError::FilterGraph("buffersink filter missing".into()))?;

        graph
            .add(&buffer, "in", &input.buffer_args())
            .map_err(|e| FfmpegError::FilterGraph(format!("buffer source: {}", e)))?;
        graph
            .add(&sink, "out", "")
            .map_err(|e| FfmpegError::FilterGraph(format!("buffer sink: {}", e)))?;
        if let Some(mut out) = graph.get("out") {
            out.set_pixel_format(output_format);
        }

        graph
            .output("in", 0)
            .and_then(|parser| parser.input("out", 0))
            .and_then(|parser| parser.parse(description))
            .map_err(|e| FfmpegError::FilterGraph(format!("parse '{}': {}", description, e)))?;
        graph
            .validate()
            .map_err(|e| FfmpegError::FilterGraph(format!("validate '{}': {}", description, e)))?;

        tracing::debug!(description, args = %input.buffer_args(), "video filter configured");
        Ok(Self { graph })
    }

    /// Push one decoded picture and collect everything the sink yields.
    pub fn filter(&mut self, frame: &ffmpeg::frame::Video) -> Result<Vec<ffmpeg::frame::Video>> {
        let mut source = self
            .graph
            .get("in")
            .ok_or_else(|| FfmpegError::FilterGraph("source vanished".into()))?;
        source
            .source()
            .add(frame)
            .map_err(|e| FfmpegError::FilterGraph(format!("feed frame: {}", e)))?;

        let mut frames = Vec::new();
        let mut sink = self
            .graph
            .get("out")
            .ok_or_else(|| FfmpegError::FilterGraph("sink vanished".into()))?;
        loop {
            let mut filtered = ffmpeg::frame::Video::empty();
            match sink.sink().frame(&mut filtered) {
                Ok(()) => frames.push(filtered),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    return Err(FfmpegError::FilterGraph(format!("pull frame: {}", e)).into())
                }
            }
        }
        Ok(frames)
    }
}
