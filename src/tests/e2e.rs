//! End-to-end tests

use crate::io::MemoryStore;
use crate::params::{OutputFormat, TxType, Watermark};
use crate::probe::ProbeInfo;
use crate::tests::fixtures::{self, synth_mp4, FPS, HEIGHT, WIDTH};
use crate::{Avpipe, AvpipeConfig, TxParams};

/// Names of everything written under the output prefix, sorted.
fn outputs(store: &MemoryStore) -> Vec<String> {
    let mut names = store.names("O");
    names.sort();
    names
}

fn find_output(store: &MemoryStore, suffix: &str) -> String {
    outputs(store)
        .into_iter()
        .find(|n| n.ends_with(suffix))
        .unwrap_or_else(|| panic!("no output ending in {} in {:?}", suffix, outputs(store)))
}

fn probe_output(pipe: &Avpipe, store: &MemoryStore, suffix: &str) -> ProbeInfo {
    let name = find_output(store, suffix);
    pipe.probe(&format!("mem://{}", name), true).unwrap()
}

fn setup(seconds: i64, format: OutputFormat) -> Option<(fixtures::TestMedia, Avpipe, MemoryStore, TxParams)> {
    let media = synth_mp4(seconds)?;
    let (pipe, store) = fixtures::memory_pipe();
    let info = pipe.probe(&media.url(), true).unwrap();
    let params = fixtures::params_for(&info, format);
    Some((media, pipe, store, params))
}

#[test]
fn test_fmp4_transcode() {
    let Some((media, pipe, store, params)) = setup(2, OutputFormat::Fmp4) else { return };

    let handle = pipe.tx_init(&params, &media.url()).unwrap();
    let stats = pipe.tx_run(handle).unwrap();
    assert_eq!(stats.outputs, 1);
    assert!(stats.bytes_written > 0);
    assert!(stats.bytes_read > 0);
    assert_eq!(stats.pump.frames_encoded, media.frames as u64);
    assert!(stats.pump.audio_packets > 0);
    assert!(stats.pump.forced_keyframes >= 1);

    let name = find_output(&store, "out-frag.mp4");
    let data = store.get(&name).unwrap();
    assert!(data.windows(4).any(|w| w == b"moof"));

    let info = probe_output(&pipe, &store, "out-frag.mp4");
    assert_eq!(info.streams.len(), 2);
    assert_eq!(info.streams[0].codec_name, "mpeg4");
    assert_eq!((info.streams[0].width, info.streams[0].height), (WIDTH, HEIGHT));
    assert_eq!(info.streams[1].codec_name, "aac");
    assert_eq!(pipe.registry().connection_count(), 0);
}

#[test]
fn test_memory_input_to_mp4() {
    let Some((media, pipe, store, params)) = setup(1, OutputFormat::Mp4) else { return };
    store.insert("in/fixture.mp4", media.bytes());

    let stats = pipe.tx(&params, "mem://in/fixture.mp4").unwrap();
    assert_eq!(stats.outputs, 1);

    let info = probe_output(&pipe, &store, "out.mp4");
    assert_eq!(info.streams.len(), 2);
    assert!(info.container.duration > 0.5);
}

#[test]
fn test_dash_package() {
    let Some((media, pipe, store, params)) = setup(4, OutputFormat::Dash) else { return };

    pipe.tx(&params, &media.url()).unwrap();

    let names = outputs(&store);
    let manifest = store.get(&find_output(&store, "dash.mpd")).unwrap();
    assert!(String::from_utf8_lossy(&manifest).contains("<MPD"));
    find_output(&store, "init-stream0.m4s");
    find_output(&store, "init-stream1.m4s");
    find_output(&store, "chunk-stream0-00001.m4s");
    let video_chunks = names.iter().filter(|n| n.contains("chunk-stream0-")).count();
    assert!(video_chunks >= 2, "{:?}", names);
}

#[test]
fn test_hls_package() {
    let Some((media, pipe, store, params)) = setup(4, OutputFormat::Hls) else { return };

    pipe.tx(&params, &media.url()).unwrap();

    let master = store.get(&find_output(&store, "master.m3u8")).unwrap();
    assert!(String::from_utf8_lossy(&master).starts_with("#EXTM3U"));
    let video = store.get(&find_output(&store, "media_0.m3u8")).unwrap();
    let video = String::from_utf8_lossy(&video);
    assert!(video.contains("#EXT-X-ENDLIST"));
    assert!(video.contains("init-stream0.m4s"));
}

#[test]
fn test_segment_window() {
    let Some((media, pipe, store, mut params)) = setup(4, OutputFormat::Segment) else { return };
    params.start_time_ts = Some(0);
    params.duration_ts = Some(params.seg_duration_ts);

    let stats = pipe.tx(&params, &media.url()).unwrap();
    // the window holds exactly one segment's worth of frames
    assert_eq!(stats.pump.frames_encoded, params.seg_duration_fr as u64);

    let segments: Vec<_> = outputs(&store)
        .into_iter()
        .filter(|n| n.contains("/segment"))
        .collect();
    assert_eq!(segments.len(), 1, "{:?}", segments);
}

#[test]
fn test_fmp4_segments_start_number() {
    let Some((media, pipe, store, mut params)) = setup(4, OutputFormat::Fmp4Segment) else { return };
    params.start_segment = 5;

    pipe.tx(&params, &media.url()).unwrap();
    let segments: Vec<_> = outputs(&store)
        .into_iter()
        .filter(|n| n.contains("/fsegment"))
        .collect();
    assert!(segments.len() >= 2, "{:?}", segments);
}

#[test]
fn test_bypass_copies_video() {
    let Some((media, pipe, store, mut params)) = setup(2, OutputFormat::Fmp4) else { return };
    params.bypass = true;

    let stats = pipe.tx(&params, &media.url()).unwrap();
    assert_eq!(stats.pump.frames_decoded, 0);
    assert_eq!(stats.pump.frames_encoded, 0);
    assert_eq!(stats.pump.video_packets, media.frames as u64);

    let info = probe_output(&pipe, &store, "out-frag.mp4");
    assert_eq!(info.streams[0].codec_name, "mpeg4");
}

#[test]
fn test_audio_only() {
    let Some((media, pipe, store, mut params)) = setup(2, OutputFormat::Fmp4) else { return };
    params.tx_type = TxType::Audio;

    let stats = pipe.tx(&params, &media.url()).unwrap();
    assert_eq!(stats.pump.video_packets, 0);
    assert!(stats.pump.audio_packets > 0);

    let info = probe_output(&pipe, &store, "out-frag.mp4");
    assert_eq!(info.streams.len(), 1);
    assert_eq!(info.streams[0].codec_type, "audio");
}

#[test]
fn test_scaled_output() {
    let Some((media, pipe, store, mut params)) = setup(1, OutputFormat::Fmp4) else { return };
    params.enc_width = Some(WIDTH / 2);
    params.enc_height = Some(HEIGHT / 2);

    pipe.tx(&params, &media.url()).unwrap();
    let info = probe_output(&pipe, &store, "out-frag.mp4");
    assert_eq!(
        (info.streams[0].width, info.streams[0].height),
        (WIDTH / 2, HEIGHT / 2)
    );
}

#[test]
fn test_watermark() {
    if ffmpeg_next::filter::find("drawtext").is_none() {
        eprintln!("skipping: drawtext filter not built in");
        return;
    }
    let Some((media, pipe, store, mut params)) = setup(1, OutputFormat::Fmp4) else { return };
    params.watermark = Some(Watermark {
        text: "avpipe: 100%".to_string(),
        shadow: true,
        ..Watermark::default()
    });

    let stats = pipe.tx(&params, &media.url()).unwrap();
    assert_eq!(stats.pump.frames_encoded, media.frames as u64);
    find_output(&store, "out-frag.mp4");
}

#[test]
fn test_file_target() {
    let Some(media) = synth_mp4(1) else { return };
    let root = tempfile::tempdir().unwrap();
    let mut config = AvpipeConfig::default();
    config.output.root = root.path().to_path_buf();
    let pipe = Avpipe::new(config).unwrap();
    let info = pipe.probe(&media.url(), true).unwrap();
    let params = fixtures::params_for(&info, OutputFormat::Fmp4);

    pipe.tx(&params, &media.url()).unwrap();

    let written: Vec<_> = walk(root.path())
        .into_iter()
        .filter(|p| p.ends_with("out-frag.mp4"))
        .collect();
    assert_eq!(written.len(), 1);
    assert!(std::fs::metadata(&written[0]).unwrap().len() > 0);
}

fn walk(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            found.extend(walk(&path));
        } else {
            found.push(path);
        }
    }
    found
}

#[test]
fn test_mux_two_parts() {
    let Some((media, pipe, store, mut params)) = setup(1, OutputFormat::Fmp4) else { return };

    // an audio-only elementary file to pair with the video parts
    params.tx_type = TxType::Audio;
    pipe.tx(&params, &media.url()).unwrap();
    let audio = find_output(&store, "out-frag.mp4");

    let video = TxParams {
        mux_spec: Some(format!(
            "mez-mux\nvideo,1,{url}\nvideo,1,{url}\naudio,1,mem://{audio}\n",
            url = media.url(),
            audio = audio
        )),
        ..TxParams::default()
    };
    let stats = pipe.mux(&video, "muxed").unwrap();
    assert_eq!(stats.tracks, 2);
    assert_eq!(stats.parts, 3);
    assert!(stats.packets >= 2 * media.frames as u64);
    assert!(stats.bytes_written > 0);

    let info = probe_output(&pipe, &store, "/out.mp4");
    assert_eq!(info.streams.len(), 2);
    assert_eq!(info.streams[0].codec_name, "mpeg4");
    assert_eq!(info.streams[1].codec_name, "aac");
    assert!(info.streams[0].nb_frames >= 2 * FPS as i64);
    assert_eq!(pipe.registry().connection_count(), 0);
}
