//! Muxing elementary-stream files into one fragmented MP4
//!
//! A mux spec names the files to combine:
//!
//! ```text
//! mez-mux
//! video,1,mem://v-part1.mp4
//! video,1,mem://v-part2.mp4
//! audio,1,mem://a1.mp4
//! audio,2,mem://a2.mp4
//! ```
//!
//! Repeated `kind,index` lines are parts of one track, played back to back.
//! Every track contributes the first stream of each of its files; packets
//! are copied without decoding, earliest timestamp first.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use serde::Serialize;

use crate::error::{AvpipeError, FfmpegError, Result};
use crate::ffmpeg_utils::{compare_ts, helpers};
use crate::io::avio::{open_input, CustomInput, CustomOutput, OutputTracker};
use crate::io::{ConnectionGuard, HandleRegistry};
use crate::params::TxParams;
use crate::transcode::muxer::URL_SCHEME;

/// Highest audio or caption track index
pub const MAX_MUX_TRACKS: usize = 8;

const MUX_MOVFLAGS: &str = "frag_every_frame";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MuxType {
    MezMux,
    AbrMux,
}

impl FromStr for MuxType {
    type Err = AvpipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "mez-mux" => Ok(MuxType::MezMux),
            "abr-mux" => Ok(MuxType::AbrMux),
            other => Err(AvpipeError::Config(format!("unknown mux type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackKind {
    Video,
    Audio,
    Caption,
}

/// Parsed mux spec: each track is its list of parts, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxSpec {
    pub mux_type: MuxType,
    pub video: Vec<String>,
    pub audios: Vec<Vec<String>>,
    pub captions: Vec<Vec<String>>,
}

impl MuxSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let mux_type: MuxType = lines
            .next()
            .ok_or_else(|| AvpipeError::Config("empty mux spec".into()))?
            .parse()?;

        let mut spec = Self {
            mux_type,
            video: Vec::new(),
            audios: Vec::new(),
            captions: Vec::new(),
        };

        for line in lines {
            let mut fields = line.splitn(3, ',').map(str::trim);
            let (Some(kind), Some(index), Some(url)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(AvpipeError::Config(format!("malformed mux line '{}'", line)));
            };
            let index: usize = index
                .parse()
                .ok()
                .filter(|i| *i > 0)
                .ok_or_else(|| AvpipeError::Config(format!("invalid mux index in '{}'", line)))?;

            match kind {
                "video" => {
                    if index > 1 {
                        return Err(AvpipeError::Config(format!(
                            "video index must be 1, got {}",
                            index
                        )));
                    }
                    spec.video.push(url.to_string());
                }
                "audio" => add_part(&mut spec.audios, "audio", index, url)?,
                "caption" => add_part(&mut spec.captions, "caption", index, url)?,
                other => {
                    tracing::debug!(kind = other, "ignoring unknown mux stream kind");
                }
            }
        }

        if spec.video.is_empty() && spec.audios.is_empty() && spec.captions.is_empty() {
            return Err(AvpipeError::Config("mux spec names no inputs".into()));
        }
        Ok(spec)
    }

    /// Tracks in output order: video, audios, captions.
    pub fn tracks(&self) -> Vec<(TrackKind, &[String])> {
        let mut tracks = Vec::new();
        if !self.video.is_empty() {
            tracks.push((TrackKind::Video, self.video.as_slice()));
        }
        tracks.extend(self.audios.iter().map(|p| (TrackKind::Audio, p.as_slice())));
        tracks.extend(self.captions.iter().map(|p| (TrackKind::Caption, p.as_slice())));
        tracks
    }
}

/// Indices must grow by at most one so tracks stay contiguous.
fn add_part(tracks: &mut Vec<Vec<String>>, kind: &str, index: usize, url: &str) -> Result<()> {
    if index > MAX_MUX_TRACKS || index > tracks.len() + 1 {
        return Err(AvpipeError::Config(format!(
            "invalid {} index {} (have {}, max {})",
            kind,
            index,
            tracks.len(),
            MAX_MUX_TRACKS
        )));
    }
    if index == tracks.len() + 1 {
        tracks.push(Vec::new());
    }
    tracks[index - 1].push(url.to_string());
    Ok(())
}

/// Index of the earliest timestamp; the first candidate wins ties.
pub fn pick_earliest(candidates: &[Option<(i64, ffmpeg::Rational)>]) -> Option<usize> {
    let mut best: Option<(usize, i64, ffmpeg::Rational)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        let Some((ts, tb)) = *candidate else { continue };
        match best {
            Some((_, best_ts, best_tb)) if compare_ts(ts, tb, best_ts, best_tb) != Ordering::Less => {}
            _ => best = Some((i, ts, tb)),
        }
    }
    best.map(|(i, _, _)| i)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MuxStats {
    pub tracks: usize,
    pub parts: usize,
    pub packets: u64,
    pub bytes_written: u64,
}

struct OpenPart {
    input: CustomInput,
    _connection: ConnectionGuard,
    time_base: ffmpeg::Rational,
    first: bool,
}

struct Track {
    kind: TrackKind,
    parts: VecDeque<String>,
    current: Option<OpenPart>,
    /// Time base of the first part; later parts are rescaled to it
    time_base: ffmpeg::Rational,
    output_index: usize,
    output_tb: ffmpeg::Rational,
    offset: i64,
    end: i64,
    last_pts: Option<i64>,
    parts_opened: usize,
    pending: Option<ffmpeg::Packet>,
}

impl Track {
    fn open_next(&mut self, registry: &Arc<HandleRegistry>, seekable: bool) -> Result<bool> {
        let Some(url) = self.parts.pop_front() else {
            return Ok(false);
        };
        let (id, backend) = registry.open_input(&url)?;
        let connection = ConnectionGuard::new(registry.clone(), id);
        let input = open_input(backend, id, &url, registry.io_config(), seekable)?;
        let time_base = input
            .input
            .stream(0)
            .map(|s| s.time_base())
            .ok_or_else(|| AvpipeError::StreamNotFound(format!("{} has no streams", url)))?;
        tracing::debug!(kind = ?self.kind, url, part = self.parts_opened, "mux part opened");
        self.parts_opened += 1;
        self.current = Some(OpenPart {
            input,
            _connection: connection,
            time_base,
            first: true,
        });
        Ok(true)
    }

    /// Next packet of stream 0 across parts, in the track's time base.
    fn read(&mut self, registry: &Arc<HandleRegistry>, seekable: bool) -> Result<Option<ffmpeg::Packet>> {
        loop {
            if self.current.is_none() && !self.open_next(registry, seekable)? {
                return Ok(None);
            }
            let Some(part) = self.current.as_mut() else {
                return Ok(None);
            };

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut part.input.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    self.current = None;
                    continue;
                }
                // a damaged tail ends the part, as end of file does
                Err(ffmpeg::Error::InvalidData) => {
                    tracing::warn!(kind = ?self.kind, "invalid data; moving to next part");
                    self.current = None;
                    continue;
                }
                Err(e) => {
                    return Err(part.input.avio.take_error().unwrap_or_else(|| {
                        FfmpegError::ReadPacket(format!("mux input: {}", e)).into()
                    }))
                }
            }
            if packet.stream() != 0 {
                continue;
            }

            packet.rescale_ts(part.time_base, self.time_base);
            if part.first {
                part.first = false;
                if self.parts_opened > 1 {
                    self.offset = self.end - packet.dts().or(packet.pts()).unwrap_or(0);
                }
            }
            if self.offset != 0 {
                packet.set_pts(packet.pts().map(|t| t + self.offset));
                packet.set_dts(packet.dts().map(|t| t + self.offset));
            }
            if packet.pts().is_some() && packet.pts() == self.last_pts {
                continue;
            }
            self.last_pts = packet.pts();
            if let Some(pts) = packet.pts() {
                self.end = self.end.max(pts + packet.duration().max(0));
            }
            return Ok(Some(packet));
        }
    }

    fn head(&self) -> Option<(i64, ffmpeg::Rational)> {
        self.pending
            .as_ref()
            .map(|p| (p.dts().or(p.pts()).unwrap_or(0), self.time_base))
    }
}

/// Mux the tracks named by `params.mux_spec`; `url` names the output
/// connection.
pub fn mux(registry: &Arc<HandleRegistry>, params: &TxParams, url: &str) -> Result<MuxStats> {
    let text = params
        .mux_spec
        .as_deref()
        .ok_or_else(|| AvpipeError::Config("mux_spec is required for muxing".into()))?;
    let spec = MuxSpec::parse(text)?;

    let mut tracks = Vec::new();
    for (kind, parts) in spec.tracks() {
        let mut track = Track {
            kind,
            parts: parts.iter().cloned().collect(),
            current: None,
            time_base: ffmpeg::Rational::new(1, 1),
            output_index: tracks.len(),
            output_tb: ffmpeg::Rational::new(1, 1),
            offset: 0,
            end: 0,
            last_pts: None,
            parts_opened: 0,
            pending: None,
        };
        if !track.open_next(registry, params.seekable)? {
            return Err(AvpipeError::Config(format!("{:?} track without parts", kind)));
        }
        if let Some(part) = &track.current {
            track.time_base = part.time_base;
        }
        tracks.push(track);
    }

    let out_id = registry.open_connection(url);
    let _out_connection = ConnectionGuard::new(registry.clone(), out_id);
    let video_out = tracks
        .iter()
        .position(|t| t.kind == TrackKind::Video)
        .map(|i| i as i32);
    let tracker = OutputTracker::new(registry.clone(), out_id, video_out, 1);
    let out_url = format!("{}out.mp4", URL_SCHEME);
    let mut output = CustomOutput::new("mp4", &out_url, tracker)?;

    for track in &tracks {
        let Some(part) = &track.current else { continue };
        let stream = part
            .input
            .input
            .stream(0)
            .ok_or_else(|| AvpipeError::StreamNotFound("mux input stream 0".into()))?;
        let mut out_stream = output
            .output
            .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
            .map_err(|e| FfmpegError::StreamConfig(format!("mux output stream: {}", e)))?;
        out_stream.set_parameters(stream.parameters());
        helpers::stream_reset_codec_tag(&mut out_stream);
        out_stream.set_time_base(stream.time_base());
        out_stream.set_avg_frame_rate(stream.avg_frame_rate());
        out_stream.set_rate(stream.rate());
    }

    let mut options = ffmpeg::Dictionary::new();
    options.set("movflags", MUX_MOVFLAGS);
    output.output.write_header_with(options).map_err(|e| {
        output
            .tracker()
            .take_error()
            .unwrap_or_else(|| FfmpegError::WriteHeader(format!("mux: {}", e)).into())
    })?;
    for track in tracks.iter_mut() {
        if let Some(stream) = output.output.stream(track.output_index) {
            track.output_tb = stream.time_base();
        }
    }

    for track in tracks.iter_mut() {
        track.pending = track.read(registry, params.seekable)?;
    }

    let mut stats = MuxStats {
        tracks: tracks.len(),
        ..MuxStats::default()
    };
    loop {
        let heads: Vec<_> = tracks.iter().map(Track::head).collect();
        let Some(i) = pick_earliest(&heads) else { break };
        let track = &mut tracks[i];
        let Some(mut packet) = track.pending.take() else { break };

        packet.rescale_ts(track.time_base, track.output_tb);
        packet.set_stream(track.output_index);
        packet.set_position(-1);
        packet.write_interleaved(&mut output.output).map_err(|e| {
            output.tracker().take_error().unwrap_or_else(|| {
                FfmpegError::WritePacket(format!("mux track {}: {}", i, e)).into()
            })
        })?;
        stats.packets += 1;
        if Some(i as i32) == video_out {
            if let Some(pts) = packet.pts() {
                output.tracker().set_encoding_end_pts(pts);
            }
        }

        track.pending = track.read(registry, params.seekable)?;
    }

    output
        .output
        .write_trailer()
        .map_err(|e| FfmpegError::WriteTrailer(format!("mux: {}", e)))?;
    output.close_main()?;
    if let Some(e) = output.tracker().take_error() {
        return Err(e);
    }

    stats.parts = tracks.iter().map(|t| t.parts_opened).sum();
    stats.bytes_written = output.tracker().bytes_written();
    tracing::info!(
        url,
        mux_type = ?spec.mux_type,
        tracks = stats.tracks,
        parts = stats.parts,
        packets = stats.packets,
        "mux finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parts_and_order() {
        let spec = MuxSpec::parse(
            "abr-mux\nvideo,1,v1.mp4\naudio,1,a1.mp4\nvideo,1,v2.mp4\naudio,2,a2.mp4\ncaption,1,c.vtt\n",
        )
        .unwrap();
        assert_eq!(spec.mux_type, MuxType::AbrMux);
        assert_eq!(spec.video, vec!["v1.mp4", "v2.mp4"]);
        assert_eq!(spec.audios.len(), 2);
        assert_eq!(spec.captions, vec![vec!["c.vtt".to_string()]]);

        let kinds: Vec<TrackKind> = spec.tracks().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![TrackKind::Video, TrackKind::Audio, TrackKind::Audio, TrackKind::Caption]
        );
    }

    #[test]
    fn test_parse_rejects_bad_indices() {
        assert!(MuxSpec::parse("mez-mux\nvideo,2,v.mp4").is_err());
        assert!(MuxSpec::parse("mez-mux\naudio,2,a.mp4").is_err());
        assert!(MuxSpec::parse("mez-mux\naudio,0,a.mp4").is_err());
        assert!(MuxSpec::parse("mez-mux\naudio,x,a.mp4").is_err());

        let mut nine = String::from("mez-mux\n");
        for i in 1..=9 {
            nine.push_str(&format!("audio,{},a{}.mp4\n", i, i));
        }
        assert!(MuxSpec::parse(&nine).is_err());
    }

    #[test]
    fn test_parse_requires_type_and_inputs() {
        assert!(matches!(MuxSpec::parse(""), Err(AvpipeError::Config(_))));
        assert!(matches!(MuxSpec::parse("mux\nvideo,1,v"), Err(AvpipeError::Config(_))));
        assert!(matches!(MuxSpec::parse("mez-mux\n"), Err(AvpipeError::Config(_))));
        assert!(matches!(
            MuxSpec::parse("mez-mux\nsubtitle,1,s.srt"),
            Err(AvpipeError::Config(_))
        ));
    }

    #[test]
    fn test_pick_earliest_across_time_bases() {
        let ms = ffmpeg::Rational::new(1, 1000);
        let mpeg = ffmpeg::Rational::new(1, 90_000);
        assert_eq!(pick_earliest(&[]), None);
        assert_eq!(pick_earliest(&[None, None]), None);
        assert_eq!(
            pick_earliest(&[Some((90_000, mpeg)), Some((999, ms))]),
            Some(1)
        );
        // ties go to the earlier track
        assert_eq!(
            pick_earliest(&[Some((90_000, mpeg)), Some((1000, ms))]),
            Some(0)
        );
        assert_eq!(pick_earliest(&[None, Some((5, ms))]), Some(1));
    }
}
