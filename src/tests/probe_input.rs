//! Probing synthesized inputs

use crate::tests::fixtures::{self, synth_mp4, FPS, HEIGHT, SAMPLE_RATE, WIDTH};

#[test]
fn test_probe_file_streams() {
    let Some(media) = synth_mp4(2) else { return };
    let (pipe, _store) = fixtures::memory_pipe();

    let info = pipe.probe(&media.url(), true).unwrap();
    assert_eq!(info.streams.len(), 2);
    assert!(info.container.format_name.contains("mp4"));
    assert!(info.container.duration >= 1.9 && info.container.duration <= 2.2);

    let video = &info.streams[0];
    assert_eq!(video.stream_index, 0);
    assert_eq!(video.codec_type, "video");
    assert_eq!(video.codec_name, "mpeg4");
    assert_eq!((video.width, video.height), (WIDTH, HEIGHT));
    assert_eq!(video.pix_fmt_name.as_deref(), Some("yuv420p"));
    assert_eq!(video.avg_frame_rate, format!("{}/1", FPS));
    assert_eq!(video.ticks_per_frame, 1);
    assert!(video.nb_frames > 0);

    let audio = &info.streams[1];
    assert_eq!(audio.codec_type, "audio");
    assert_eq!(audio.codec_name, "aac");
    assert_eq!(audio.sample_rate, SAMPLE_RATE as u32);
    assert_eq!(audio.channels, 2);
    assert_eq!(audio.channel_layout_name.as_deref(), Some("stereo"));
    assert_eq!(audio.pix_fmt, None);
}

#[test]
fn test_probe_memory_input() {
    let Some(media) = synth_mp4(1) else { return };
    let (pipe, store) = fixtures::memory_pipe();
    store.insert("fixture.mp4", media.bytes());

    let info = pipe.probe("mem://fixture.mp4", true).unwrap();
    assert_eq!(info.streams.len(), 2);
    assert_eq!(info.streams[0].codec_name, "mpeg4");
    assert_eq!(pipe.registry().connection_count(), 0);
}

#[test]
fn test_probe_missing_inputs() {
    let Some(_media) = synth_mp4(1) else { return };
    let (pipe, _store) = fixtures::memory_pipe();

    assert!(pipe.probe("mem://nothing-here.mp4", true).is_err());
    assert!(pipe.probe("/definitely/not/a/file.mp4", true).is_err());
    assert_eq!(pipe.registry().connection_count(), 0);
}
