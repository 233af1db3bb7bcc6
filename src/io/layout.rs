//! Output classification and naming
//!
//! The muxer names the files it opens after the templates we hand it
//! (`chunk-stream0-00001.m4s`, `media_1.m3u8`, ...). Classification recovers
//! the output kind and stream from that URL; naming maps a kind back to the
//! deterministic file name handed to the output backends.

use super::AvType;

/// Result of classifying a URL the muxer asked to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputClass {
    pub kind: AvType,
    pub stream_index: i32,
    /// Media segments get a per-stream counter; everything else uses -1
    /// (init segments) or 0 (manifests).
    pub numbered: bool,
}

/// First ASCII digit in `url`, as a stream index.
fn first_digit(url: &str) -> Option<i32> {
    url.bytes()
        .find(|b| b.is_ascii_digit())
        .map(|b| (b - b'0') as i32)
}

/// Classify a muxer-requested URL.
///
/// `video_index` is the output stream index carrying video, or `None` for
/// audio-only sessions.
pub fn classify_output(url: &str, video_index: Option<i32>) -> OutputClass {
    // Only the file name matters; muxers may prefix a directory.
    let name = url.rsplit('/').next().unwrap_or(url);
    let stream_index = first_digit(name).unwrap_or(0);
    let is_video = Some(stream_index) == video_index;

    let pick = |video: AvType, audio: AvType| if is_video { video } else { audio };

    let (kind, numbered) = if name.is_empty() || name.ends_with(".mpd") {
        (AvType::DashManifest, false)
    } else if name.ends_with(".key") {
        // HLS names the key after the playlist, so this precedes "media"
        (AvType::Aes128Key, false)
    } else if name.starts_with("master") {
        (AvType::HlsMasterM3u, false)
    } else if name.starts_with("media") {
        (pick(AvType::HlsVideoM3u, AvType::HlsAudioM3u), false)
    } else if name.contains("chunk") {
        (pick(AvType::DashVideoSegment, AvType::DashAudioSegment), true)
    } else if name.starts_with("fsegment") {
        (AvType::Fmp4Segment, true)
    } else if name.starts_with("segment") {
        (AvType::Mp4Segment, true)
    } else if name == "out.mp4" {
        (AvType::Mp4Stream, false)
    } else if name == "out-frag.mp4" {
        (AvType::Fmp4Stream, false)
    } else {
        (pick(AvType::DashVideoInit, AvType::DashAudioInit), false)
    };

    let stream_index = match kind {
        AvType::DashManifest | AvType::HlsMasterM3u | AvType::Aes128Key => 0,
        AvType::Mp4Stream | AvType::Fmp4Stream => 0,
        // One segment file carries every stream
        AvType::Mp4Segment | AvType::Fmp4Segment => 0,
        _ => stream_index,
    };

    OutputClass {
        kind,
        stream_index,
        numbered,
    }
}

/// Deterministic file name for an output.
pub fn output_name(kind: AvType, stream_index: i32, seg_index: i32) -> String {
    match kind {
        AvType::DashManifest => "dash.mpd".to_string(),
        AvType::HlsMasterM3u => "master.m3u8".to_string(),
        AvType::DashVideoInit | AvType::DashAudioInit => {
            format!("init-stream{}.m4s", stream_index)
        }
        AvType::HlsVideoM3u | AvType::HlsAudioM3u => format!("media_{}.m3u8", stream_index),
        AvType::DashVideoSegment | AvType::DashAudioSegment => {
            format!("chunk-stream{}-{:05}.m4s", stream_index, seg_index)
        }
        AvType::Mp4Segment => format!("segment{}-{:05}.mp4", stream_index, seg_index),
        AvType::Fmp4Segment => format!("fsegment{}-{:05}.mp4", stream_index, seg_index),
        AvType::Aes128Key => "key.bin".to_string(),
        AvType::Mp4Stream => "out.mp4".to_string(),
        AvType::Fmp4Stream => "out-frag.mp4".to_string(),
        AvType::Unknown => format!("unknown{}-{}", stream_index, seg_index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_dash_outputs() {
        let v = Some(0);
        assert_eq!(classify_output("", v).kind, AvType::DashManifest);
        assert_eq!(classify_output("dash.mpd", v).kind, AvType::DashManifest);

        let init = classify_output("init-stream1.m4s", v);
        assert_eq!(init.kind, AvType::DashAudioInit);
        assert_eq!(init.stream_index, 1);
        assert!(!init.numbered);

        let chunk = classify_output("chunk-stream0-00003.m4s", v);
        assert_eq!(chunk.kind, AvType::DashVideoSegment);
        assert_eq!(chunk.stream_index, 0);
        assert!(chunk.numbered);
    }

    #[test]
    fn test_classify_hls_outputs() {
        let v = Some(0);
        assert_eq!(classify_output("master.m3u8", v).kind, AvType::HlsMasterM3u);
        assert_eq!(classify_output("media_0.m3u8", v).kind, AvType::HlsVideoM3u);
        assert_eq!(classify_output("media_1.m3u8", v).kind, AvType::HlsAudioM3u);
        assert_eq!(classify_output("media_0.m3u8.key", v).kind, AvType::Aes128Key);
    }

    #[test]
    fn test_classify_audio_only_session() {
        let c = classify_output("chunk-stream0-00001.m4s", None);
        assert_eq!(c.kind, AvType::DashAudioSegment);
    }

    #[test]
    fn test_classify_segments_and_streams() {
        assert_eq!(
            classify_output("fsegment-00002.mp4", Some(0)).kind,
            AvType::Fmp4Segment
        );
        let seg = classify_output("segment-00002.mp4", Some(0));
        assert_eq!(seg.kind, AvType::Mp4Segment);
        assert_eq!(seg.stream_index, 0);
        assert_eq!(classify_output("out.mp4", Some(0)).kind, AvType::Mp4Stream);
        assert_eq!(
            classify_output("out-frag.mp4", Some(0)).kind,
            AvType::Fmp4Stream
        );
    }

    #[test]
    fn test_classify_ignores_directory_prefix() {
        let c = classify_output("/tmp/O3/chunk-stream1-00001.m4s", Some(0));
        assert_eq!(c.kind, AvType::DashAudioSegment);
        assert_eq!(c.stream_index, 1);
    }

    #[test]
    fn test_output_names() {
        assert_eq!(output_name(AvType::DashVideoInit, 0, -1), "init-stream0.m4s");
        assert_eq!(
            output_name(AvType::DashAudioSegment, 1, 12),
            "chunk-stream1-00012.m4s"
        );
        assert_eq!(output_name(AvType::HlsAudioM3u, 1, -1), "media_1.m3u8");
        assert_eq!(output_name(AvType::Fmp4Segment, 0, 7), "fsegment0-00007.mp4");
        assert_eq!(output_name(AvType::Aes128Key, 0, 0), "key.bin");
    }
}
