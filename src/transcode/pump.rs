//! The decode → filter → encode → mux loop
//!
//! [`pump`] implements the timing protocol and nothing else: stop window and
//! reorder grace, forced key frames on segment boundaries, packet duration
//! fill-in and audio passthrough. Every FFmpeg call sits behind [`Stages`],
//! which the FFmpeg pipeline implements and tests replace with mocks.

use serde::Serialize;

use crate::error::{AvpipeError, Result};
use crate::params::TxParams;
use crate::session::CancelFlags;

/// What the pump needs from a compressed packet
pub trait MediaPacket {
    fn stream_index(&self) -> usize;
    fn pts(&self) -> Option<i64>;
    fn dts(&self) -> Option<i64>;
    fn duration(&self) -> i64;
    fn set_duration(&mut self, duration: i64);
}

/// What the pump needs from a decoded picture
pub trait MediaFrame {
    fn pts(&self) -> Option<i64>;
    /// Ask the encoder to code this picture as an I-frame.
    fn force_keyframe(&mut self);
}

/// How the pump treats packets of a demuxed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRoute {
    /// Decode, filter and re-encode the selected video stream
    Transcode,
    /// Copy the selected video stream without decoding
    CopyVideo,
    /// Copy the selected audio stream
    CopyAudio,
    Drop,
}

/// Codec and muxer operations driven by [`pump`]
///
/// The decoder side and the encoder side each follow FFmpeg's send/receive
/// model: `receive_*` returns `Ok(None)` when more input is needed or the
/// coder is drained.
pub trait Stages {
    type Packet: MediaPacket;
    type Frame: MediaFrame;

    /// Next demuxed packet, `None` at end of input.
    fn read_packet(&mut self) -> Result<Option<Self::Packet>>;

    fn route(&self, stream_index: usize) -> StreamRoute;

    /// Rescale a packet to the output stream's time base and write it as is.
    fn copy_packet(&mut self, packet: Self::Packet) -> Result<()>;

    fn send_packet(&mut self, packet: &Self::Packet) -> Result<()>;
    fn send_decoder_eof(&mut self) -> Result<()>;
    fn receive_frame(&mut self) -> Result<Option<Self::Frame>>;

    /// Push a decoded frame through the filter graph and collect its output.
    fn filter(&mut self, frame: &Self::Frame) -> Result<Vec<Self::Frame>>;

    /// Send a frame to the encoder; `None` signals end of stream.
    fn send_frame(&mut self, frame: Option<&Self::Frame>) -> Result<()>;
    fn receive_packet(&mut self) -> Result<Option<Self::Packet>>;

    /// Rescale an encoded packet to the output stream and write it interleaved.
    fn write_encoded(&mut self, packet: Self::Packet) -> Result<()>;
}

/// Stop window for the selected video stream, in its own time base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpWindow {
    pub start_ts: i64,
    /// `None` transcodes the whole input
    pub duration_ts: Option<i64>,
    pub seg_duration_ts: i64,
    pub frame_duration: i64,
    pub grace_frames: u32,
}

impl PumpWindow {
    pub fn from_params(params: &TxParams, grace_frames: u32) -> Result<Self> {
        let frame_duration = params.frame_duration()?;
        Ok(Self {
            start_ts: params.start_time_ts.unwrap_or(0),
            duration_ts: params.duration_ts,
            seg_duration_ts: params.seg_duration_ts,
            frame_duration,
            grace_frames,
        })
    }

    /// First pts past the requested window, if bounded.
    pub fn end(&self) -> Option<i64> {
        self.duration_ts.map(|d| self.start_ts + d)
    }

    /// Extra ticks decoded past the end so reordered frames still make it.
    pub fn grace_ts(&self) -> i64 {
        self.grace_frames as i64 * self.frame_duration
    }

    pub fn contains(&self, pts: Option<i64>) -> bool {
        match (self.end(), pts) {
            (Some(end), Some(pts)) => pts < end,
            _ => true,
        }
    }

    /// True once a packet is past both the window and the grace period.
    pub fn exhausted(&self, pts: Option<i64>) -> bool {
        match (self.end(), pts) {
            (Some(end), Some(pts)) => pts >= end + self.grace_ts(),
            _ => false,
        }
    }

    pub fn is_boundary(&self, pts: Option<i64>) -> bool {
        match pts {
            Some(pts) if self.seg_duration_ts > 0 => pts % self.seg_duration_ts == 0,
            _ => false,
        }
    }
}

/// Counters collected by one pump run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    pub packets_read: u64,
    pub video_packets: u64,
    pub audio_packets: u64,
    pub dropped_packets: u64,
    pub frames_decoded: u64,
    pub frames_encoded: u64,
    pub frames_skipped: u64,
    pub forced_keyframes: u64,
    pub packets_written: u64,
}

struct Pump<'a, S: Stages> {
    stages: &'a mut S,
    window: PumpWindow,
    last_dts: Option<i64>,
    stats: PumpStats,
}

impl<'a, S: Stages> Pump<'a, S> {
    fn run(mut self, cancel: &CancelFlags) -> Result<PumpStats> {
        loop {
            if cancel.is_cancelled() {
                tracing::info!(packets = self.stats.packets_read, "pump cancelled");
                return Err(AvpipeError::Cancelled);
            }
            let Some(packet) = self.stages.read_packet()? else {
                break;
            };
            self.stats.packets_read += 1;

            match self.stages.route(packet.stream_index()) {
                StreamRoute::CopyAudio => {
                    self.stats.audio_packets += 1;
                    self.stages.copy_packet(packet)?;
                    self.stats.packets_written += 1;
                }
                StreamRoute::CopyVideo => {
                    self.stats.video_packets += 1;
                    if self.window.exhausted(packet.pts()) {
                        tracing::debug!(pts = ?packet.pts(), "stop window reached");
                        break;
                    }
                    if self.window.contains(packet.pts()) {
                        self.stages.copy_packet(packet)?;
                        self.stats.packets_written += 1;
                    }
                }
                StreamRoute::Transcode => {
                    self.stats.video_packets += 1;
                    if self.window.exhausted(packet.pts()) {
                        tracing::debug!(pts = ?packet.pts(), "stop window reached");
                        break;
                    }
                    if !self.window.contains(packet.pts()) {
                        tracing::trace!(pts = ?packet.pts(), "decoding past window for reordering");
                    }
                    self.stages.send_packet(&packet)?;
                    self.drain_decoder()?;
                }
                StreamRoute::Drop => {
                    self.stats.dropped_packets += 1;
                }
            }
        }

        self.stages.send_decoder_eof()?;
        self.drain_decoder()?;
        self.stages.send_frame(None)?;
        self.drain_encoder()?;

        tracing::debug!(stats = ?self.stats, "pump finished");
        Ok(self.stats)
    }

    fn drain_decoder(&mut self) -> Result<()> {
        while let Some(mut frame) = self.stages.receive_frame()? {
            self.stats.frames_decoded += 1;
            if self.window.is_boundary(frame.pts()) {
                frame.force_keyframe();
                self.stats.forced_keyframes += 1;
                tracing::trace!(pts = ?frame.pts(), "forcing key frame at segment boundary");
            }
            for filtered in self.stages.filter(&frame)? {
                if self.window.contains(filtered.pts()) {
                    self.stages.send_frame(Some(&filtered))?;
                    self.stats.frames_encoded += 1;
                    self.drain_encoder()?;
                } else {
                    self.stats.frames_skipped += 1;
                }
            }
        }
        Ok(())
    }

    fn drain_encoder(&mut self) -> Result<()> {
        while let Some(mut packet) = self.stages.receive_packet()? {
            if packet.duration() == 0 {
                if let (Some(dts), Some(last)) = (packet.dts(), self.last_dts) {
                    packet.set_duration(dts - last);
                }
            }
            self.last_dts = packet.dts();
            self.stages.write_encoded(packet)?;
            self.stats.packets_written += 1;
        }
        Ok(())
    }
}

/// Run the loop until end of input, the end of the window, an error or a
/// cancellation.
///
/// Cancellation is checked before every packet and aborts without flushing
/// the coders; the caller must not write a trailer afterwards.
pub fn pump<S: Stages>(stages: &mut S, window: PumpWindow, cancel: &CancelFlags) -> Result<PumpStats> {
    Pump {
        stages,
        window,
        last_dts: None,
        stats: PumpStats::default(),
    }
    .run(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const VIDEO: usize = 0;
    const AUDIO: usize = 1;
    const DATA: usize = 2;
    const FD: i64 = 1000;

    #[derive(Debug, Clone, PartialEq)]
    struct Pkt {
        stream: usize,
        pts: Option<i64>,
        dts: Option<i64>,
        duration: i64,
        payload: Vec<u8>,
        key: bool,
    }

    impl Pkt {
        fn new(stream: usize, ts: i64) -> Self {
            Self {
                stream,
                pts: Some(ts),
                dts: Some(ts),
                duration: 0,
                payload: ts.to_le_bytes().to_vec(),
                key: false,
            }
        }
    }

    impl MediaPacket for Pkt {
        fn stream_index(&self) -> usize {
            self.stream
        }
        fn pts(&self) -> Option<i64> {
            self.pts
        }
        fn dts(&self) -> Option<i64> {
            self.dts
        }
        fn duration(&self) -> i64 {
            self.duration
        }
        fn set_duration(&mut self, duration: i64) {
            self.duration = duration;
        }
    }

    #[derive(Debug, Clone)]
    struct Frm {
        pts: Option<i64>,
        key: bool,
    }

    impl MediaFrame for Frm {
        fn pts(&self) -> Option<i64> {
            self.pts
        }
        fn force_keyframe(&mut self) {
            self.key = true;
        }
    }

    /// Decoder and encoder hold back `delay` items until drained
    #[derive(Default)]
    struct Mock {
        input: VecDeque<Pkt>,
        bypass: bool,
        delay: usize,
        decoded: VecDeque<Frm>,
        decoder_eof: bool,
        encoded: VecDeque<Pkt>,
        encoder_eof: bool,
        copied: Vec<Pkt>,
        written: Vec<Pkt>,
        sent_to_decoder: Vec<Option<i64>>,
    }

    impl Mock {
        fn with_input(input: Vec<Pkt>) -> Self {
            Self {
                input: input.into(),
                ..Self::default()
            }
        }
    }

    impl Stages for Mock {
        type Packet = Pkt;
        type Frame = Frm;

        fn read_packet(&mut self) -> Result<Option<Pkt>> {
            Ok(self.input.pop_front())
        }

        fn route(&self, stream_index: usize) -> StreamRoute {
            match stream_index {
                VIDEO if self.bypass => StreamRoute::CopyVideo,
                VIDEO => StreamRoute::Transcode,
                AUDIO => StreamRoute::CopyAudio,
                _ => StreamRoute::Drop,
            }
        }

        fn copy_packet(&mut self, mut packet: Pkt) -> Result<()> {
            // 1/1000 → 1/2000
            packet.pts = packet.pts.map(|t| t * 2);
            packet.dts = packet.dts.map(|t| t * 2);
            self.copied.push(packet);
            Ok(())
        }

        fn send_packet(&mut self, packet: &Pkt) -> Result<()> {
            self.sent_to_decoder.push(packet.pts);
            self.decoded.push_back(Frm {
                pts: packet.pts,
                key: false,
            });
            Ok(())
        }

        fn send_decoder_eof(&mut self) -> Result<()> {
            self.decoder_eof = true;
            Ok(())
        }

        fn receive_frame(&mut self) -> Result<Option<Frm>> {
            if self.decoded.len() > self.delay || self.decoder_eof {
                Ok(self.decoded.pop_front())
            } else {
                Ok(None)
            }
        }

        fn filter(&mut self, frame: &Frm) -> Result<Vec<Frm>> {
            Ok(vec![frame.clone()])
        }

        fn send_frame(&mut self, frame: Option<&Frm>) -> Result<()> {
            match frame {
                Some(f) => {
                    let ts = f.pts.unwrap_or(0);
                    let mut p = Pkt::new(VIDEO, ts);
                    p.key = f.key;
                    self.encoded.push_back(p);
                }
                None => self.encoder_eof = true,
            }
            Ok(())
        }

        fn receive_packet(&mut self) -> Result<Option<Pkt>> {
            if self.encoded.len() > self.delay || self.encoder_eof {
                Ok(self.encoded.pop_front())
            } else {
                Ok(None)
            }
        }

        fn write_encoded(&mut self, packet: Pkt) -> Result<()> {
            self.written.push(packet);
            Ok(())
        }
    }

    fn window(duration_ts: Option<i64>, seg_frames: i64) -> PumpWindow {
        PumpWindow {
            start_ts: 0,
            duration_ts,
            seg_duration_ts: seg_frames * FD,
            frame_duration: FD,
            grace_frames: 5,
        }
    }

    fn video(frames: i64) -> Vec<Pkt> {
        (0..frames).map(|i| Pkt::new(VIDEO, i * FD)).collect()
    }

    #[test]
    fn test_audio_passthrough_preserves_payload_and_order() {
        let input: Vec<Pkt> = (0..50).map(|i| Pkt::new(AUDIO, i * 21)).collect();
        let mut stages = Mock::with_input(input.clone());

        let stats = pump(&mut stages, window(None, 4), &CancelFlags::default()).unwrap();

        assert_eq!(stats.audio_packets, 50);
        assert_eq!(stages.copied.len(), 50);
        for (orig, out) in input.iter().zip(&stages.copied) {
            assert_eq!(orig.payload, out.payload);
            assert_eq!(out.pts, orig.pts.map(|t| t * 2));
        }
        assert!(stages
            .copied
            .windows(2)
            .all(|w| w[0].dts <= w[1].dts));
    }

    #[test]
    fn test_keyframes_forced_on_segment_boundaries() {
        let mut stages = Mock::with_input(video(12));

        let stats = pump(&mut stages, window(None, 4), &CancelFlags::default()).unwrap();

        let keys: Vec<i64> = stages
            .written
            .iter()
            .filter(|p| p.key)
            .filter_map(|p| p.pts)
            .collect();
        assert_eq!(keys, vec![0, 4 * FD, 8 * FD]);
        assert_eq!(stats.forced_keyframes, 3);
        assert_eq!(stats.frames_encoded, 12);
    }

    #[test]
    fn test_reorder_grace_window() {
        // Window ends at 10 frames; packets continue to 20 frames with one
        // late frame (pts 9) arriving after pts 12.
        let mut input = video(20);
        let late = input.remove(9);
        input.insert(12, late);
        let mut stages = Mock::with_input(input);

        let stats = pump(&mut stages, window(Some(10 * FD), 4), &CancelFlags::default()).unwrap();

        // Decoded everything below end + 5 frames, then stopped at pts 15
        assert_eq!(stages.sent_to_decoder.len(), 15);
        assert!(stages
            .sent_to_decoder
            .iter()
            .all(|pts| pts.unwrap() < 15 * FD));
        assert_eq!(stages.input.front().and_then(|p| p.pts), Some(16 * FD));

        // Only frames inside the window were encoded, the late one included
        let encoded: Vec<i64> = stages.written.iter().filter_map(|p| p.pts).collect();
        assert_eq!(encoded.len(), 10);
        assert!(encoded.contains(&(9 * FD)));
        assert!(encoded.iter().all(|&pts| pts < 10 * FD));
        assert_eq!(stats.frames_skipped, 5);
    }

    #[test]
    fn test_cancel_before_run_skips_flush() {
        let mut stages = Mock::with_input(video(8));
        stages.delay = 1;
        let cancel = CancelFlags::default();
        cancel.cancel();

        let result = pump(&mut stages, window(None, 4), &cancel);

        assert!(matches!(result, Err(AvpipeError::Cancelled)));
        assert!(stages.written.is_empty());
        assert!(!stages.decoder_eof);
        assert!(!stages.encoder_eof);
        assert_eq!(stages.input.len(), 8);
    }

    #[test]
    fn test_encoder_cancel_flag_alone_stops_pump() {
        let mut stages = Mock::with_input(video(3));
        let cancel = CancelFlags::default();
        cancel.encoder.cancel();
        assert!(matches!(
            pump(&mut stages, window(None, 4), &cancel),
            Err(AvpipeError::Cancelled)
        ));
    }

    #[test]
    fn test_flush_drains_delayed_frames() {
        let mut stages = Mock::with_input(video(6));
        stages.delay = 2;

        let stats = pump(&mut stages, window(None, 3), &CancelFlags::default()).unwrap();

        assert!(stages.decoder_eof);
        assert!(stages.encoder_eof);
        assert_eq!(stats.frames_decoded, 6);
        assert_eq!(stages.written.len(), 6);
    }

    #[test]
    fn test_missing_duration_filled_from_dts() {
        let mut stages = Mock::with_input(video(4));

        pump(&mut stages, window(None, 4), &CancelFlags::default()).unwrap();

        let durations: Vec<i64> = stages.written.iter().map(|p| p.duration).collect();
        assert_eq!(durations, vec![0, FD, FD, FD]);
    }

    #[test]
    fn test_unselected_streams_dropped() {
        let mut input = video(2);
        input.push(Pkt::new(DATA, 0));
        input.push(Pkt::new(AUDIO, 0));
        input.push(Pkt::new(DATA, 10));
        let mut stages = Mock::with_input(input);

        let stats = pump(&mut stages, window(None, 4), &CancelFlags::default()).unwrap();

        assert_eq!(stats.dropped_packets, 2);
        assert_eq!(stages.copied.len(), 1);
        assert_eq!(stages.written.len(), 2);
    }

    #[test]
    fn test_bypass_copies_video_within_window() {
        let mut stages = Mock::with_input(video(20));
        stages.bypass = true;

        let stats = pump(&mut stages, window(Some(4 * FD), 4), &CancelFlags::default()).unwrap();

        assert!(stages.sent_to_decoder.is_empty());
        assert_eq!(stages.copied.len(), 4);
        assert_eq!(stats.video_packets, 10);
    }

    #[test]
    fn test_window_from_params() {
        let params = TxParams {
            seg_duration_ts: 6000,
            seg_duration_fr: 4,
            duration_ts: Some(9000),
            start_time_ts: Some(3000),
            ..TxParams::default()
        };
        let w = PumpWindow::from_params(&params, 5).unwrap();
        assert_eq!(w.frame_duration, 1500);
        assert_eq!(w.end(), Some(12000));
        assert_eq!(w.grace_ts(), 7500);
        assert!(w.contains(Some(11999)));
        assert!(!w.contains(Some(12000)));
        assert!(!w.exhausted(Some(19499)));
        assert!(w.exhausted(Some(19500)));

        let bad = TxParams {
            seg_duration_fr: 7,
            ..params
        };
        assert!(matches!(
            PumpWindow::from_params(&bad, 5),
            Err(AvpipeError::Config(_))
        ));
    }
}
