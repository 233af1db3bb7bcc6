//! Output muxer selection
//!
//! Maps an [`OutputFormat`] and the session's encryption settings onto the
//! stock FFmpeg muxer that produces it and the private options that muxer
//! needs. Every URL carries the `avpipe://` scheme so no muxer ever falls back
//! to the file protocol: all files go through the I/O hooks and are named by
//! [`crate::io::output_name`].

use ffmpeg_next as ffmpeg;

use crate::error::{AvpipeError, Result};
use crate::params::{CryptScheme, OutputFormat, TxParams};

/// Scheme prefixed to every muxer URL
pub const URL_SCHEME: &str = "avpipe://";

const FRAG_MOVFLAGS: &str = "frag_keyframe+empty_moov+default_base_moof";

/// Muxer name, main URL and private options for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxerPlan {
    pub muxer: &'static str,
    pub url: String,
    pub options: Vec<(&'static str, String)>,
}

impl MuxerPlan {
    /// Build the plan for `params` given which elementary streams the output
    /// carries.
    pub fn new(params: &TxParams, has_video: bool, has_audio: bool) -> Result<Self> {
        if !has_video && !has_audio {
            return Err(AvpipeError::StreamNotFound(
                "no video or audio stream selected for output".into(),
            ));
        }
        let seg = params.seg_duration.trim().to_string();
        let start = params.start_segment.to_string();

        let mut plan = match params.format {
            OutputFormat::Dash => Self {
                muxer: "dash",
                url: format!("{}dash.mpd", URL_SCHEME),
                options: vec![
                    ("seg_duration", seg),
                    ("init_seg_name", "init-stream$RepresentationID$.m4s".into()),
                    (
                        "media_seg_name",
                        "chunk-stream$RepresentationID$-$Number%05d$.m4s".into(),
                    ),
                ],
            },
            OutputFormat::Hls => Self {
                muxer: "hls",
                url: format!("{}media_%v.m3u8", URL_SCHEME),
                options: vec![
                    ("hls_time", seg),
                    ("start_number", start),
                    ("hls_playlist_type", "vod".into()),
                    ("hls_segment_type", "fmp4".into()),
                    ("hls_fmp4_init_filename", "init-stream%v.m4s".into()),
                    ("hls_segment_filename", "chunk-stream%v-%05d.m4s".into()),
                    ("master_pl_name", "master.m3u8".into()),
                    ("var_stream_map", var_stream_map(has_video, has_audio)),
                ],
            },
            OutputFormat::Mp4 => Self {
                muxer: "mp4",
                url: format!("{}out.mp4", URL_SCHEME),
                options: Vec::new(),
            },
            OutputFormat::Fmp4 => Self {
                muxer: "mp4",
                url: format!("{}out-frag.mp4", URL_SCHEME),
                options: vec![("movflags", FRAG_MOVFLAGS.into())],
            },
            OutputFormat::Segment => Self {
                muxer: "segment",
                url: format!("{}segment-%05d.mp4", URL_SCHEME),
                options: vec![
                    ("segment_format", "mp4".into()),
                    ("segment_time", seg),
                    ("segment_start_number", start),
                ],
            },
            OutputFormat::Fmp4Segment => Self {
                muxer: "segment",
                url: format!("{}fsegment-%05d.mp4", URL_SCHEME),
                options: vec![
                    ("segment_format", "mp4".into()),
                    ("segment_time", seg),
                    ("segment_start_number", start),
                ],
            },
        };
        plan.add_encryption(params)?;
        plan.add_child_movflags(params.format);
        Ok(plan)
    }

    fn add_encryption(&mut self, params: &TxParams) -> Result<()> {
        let key = params.crypt_key.clone().unwrap_or_default();
        match (params.crypt_scheme, params.format) {
            (CryptScheme::None, _) => {}
            (CryptScheme::Aes128, OutputFormat::Hls) => {
                self.options.push(("hls_enc", "1".into()));
                self.options.push(("hls_enc_key", key));
                self.options.push((
                    "hls_enc_key_url",
                    params.crypt_key_url.clone().unwrap_or_default(),
                ));
                if let Some(iv) = &params.crypt_iv {
                    self.options.push(("hls_enc_iv", iv.clone()));
                }
            }
            (CryptScheme::Cenc, OutputFormat::Mp4 | OutputFormat::Fmp4) => {
                let kid = params.crypt_kid.clone().unwrap_or_default();
                self.options.push(("encryption_scheme", "cenc-aes-ctr".into()));
                self.options.push(("encryption_key", key));
                self.options.push(("encryption_kid", kid));
            }
            (CryptScheme::Cenc, OutputFormat::Dash | OutputFormat::Fmp4Segment) => {
                // handed down to the child mp4 muxer as a dictionary string
                let kid = params.crypt_kid.clone().unwrap_or_default();
                let child = format!(
                    "encryption_scheme=cenc-aes-ctr:encryption_key={}:encryption_kid={}",
                    key, kid
                );
                self.options.push((self.child_options_key(), child));
            }
            (scheme, format) => {
                return Err(AvpipeError::Config(format!(
                    "encryption scheme {:?} is not available for {} output",
                    scheme,
                    format.as_str()
                )));
            }
        }
        Ok(())
    }

    fn child_options_key(&self) -> &'static str {
        if self.muxer == "segment" {
            "segment_format_options"
        } else {
            "format_options"
        }
    }

    /// Fragmented segments need the fragmenting movflags on their child muxer.
    fn add_child_movflags(&mut self, format: OutputFormat) {
        if format != OutputFormat::Fmp4Segment {
            return;
        }
        let key = self.child_options_key();
        let flags = format!("movflags={}", FRAG_MOVFLAGS);
        match self.options.iter_mut().find(|(k, _)| *k == key) {
            Some((_, value)) => {
                value.push(':');
                value.push_str(&flags);
            }
            None => self.options.push((key, flags)),
        }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Options as the dictionary handed to `avformat_write_header`.
    pub fn dictionary(&self) -> ffmpeg::Dictionary<'static> {
        let mut dict = ffmpeg::Dictionary::new();
        for (key, value) in &self.options {
            dict.set(key, value);
        }
        dict
    }
}

/// One HLS variant per elementary stream, audio grouped under the video.
fn var_stream_map(has_video: bool, has_audio: bool) -> String {
    match (has_video, has_audio) {
        (true, true) => "v:0,agroup:audio a:0,agroup:audio".to_string(),
        (true, false) => "v:0".to_string(),
        _ => "a:0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f";

    fn params(format: OutputFormat) -> TxParams {
        TxParams {
            format,
            seg_duration_ts: 180_000,
            seg_duration_fr: 60,
            seg_duration: "2.0".into(),
            start_segment: 3,
            ..TxParams::default()
        }
    }

    #[test]
    fn test_dash_plan() {
        let plan = MuxerPlan::new(&params(OutputFormat::Dash), true, true).unwrap();
        assert_eq!(plan.muxer, "dash");
        assert_eq!(plan.url, "avpipe://dash.mpd");
        assert_eq!(plan.option("seg_duration"), Some("2.0"));
        // the dash muxer has no start number; output names carry it instead
        assert_eq!(plan.option("start_number"), None);

        let hls = MuxerPlan::new(&params(OutputFormat::Hls), true, true).unwrap();
        assert_eq!(hls.option("start_number"), Some("3"));
    }

    #[test]
    fn test_hls_variant_map() {
        let both = MuxerPlan::new(&params(OutputFormat::Hls), true, true).unwrap();
        assert_eq!(both.option("var_stream_map"), Some("v:0,agroup:audio a:0,agroup:audio"));
        assert_eq!(both.option("master_pl_name"), Some("master.m3u8"));

        let audio = MuxerPlan::new(&params(OutputFormat::Hls), false, true).unwrap();
        assert_eq!(audio.option("var_stream_map"), Some("a:0"));
    }

    #[test]
    fn test_fmp4_movflags() {
        let plan = MuxerPlan::new(&params(OutputFormat::Fmp4), true, false).unwrap();
        assert_eq!(plan.url, "avpipe://out-frag.mp4");
        assert_eq!(plan.option("movflags"), Some(FRAG_MOVFLAGS));

        let seg = MuxerPlan::new(&params(OutputFormat::Fmp4Segment), true, false).unwrap();
        assert_eq!(seg.muxer, "segment");
        assert_eq!(
            seg.option("segment_format_options"),
            Some("movflags=frag_keyframe+empty_moov+default_base_moof")
        );
    }

    #[test]
    fn test_aes128_hls_options() {
        let p = TxParams {
            crypt_scheme: CryptScheme::Aes128,
            crypt_key: Some(KEY.into()),
            crypt_key_url: Some("https://keys.example/k".into()),
            ..params(OutputFormat::Hls)
        };
        let plan = MuxerPlan::new(&p, true, true).unwrap();
        assert_eq!(plan.option("hls_enc"), Some("1"));
        assert_eq!(plan.option("hls_enc_key"), Some(KEY));
        assert_eq!(plan.option("hls_enc_iv"), None);
    }

    #[test]
    fn test_cenc_routes_to_child_muxer() {
        let p = TxParams {
            crypt_scheme: CryptScheme::Cenc,
            crypt_key: Some(KEY.into()),
            crypt_kid: Some(KEY.into()),
            ..params(OutputFormat::Dash)
        };
        let dash = MuxerPlan::new(&p, true, false).unwrap();
        assert!(dash
            .option("format_options")
            .unwrap()
            .starts_with("encryption_scheme=cenc-aes-ctr:"));

        let mp4 = MuxerPlan::new(
            &TxParams {
                format: OutputFormat::Mp4,
                ..p.clone()
            },
            true,
            false,
        )
        .unwrap();
        assert_eq!(mp4.option("encryption_kid"), Some(KEY));

        let fseg = MuxerPlan::new(
            &TxParams {
                format: OutputFormat::Fmp4Segment,
                ..p
            },
            true,
            false,
        )
        .unwrap();
        let child = fseg.option("segment_format_options").unwrap();
        assert!(child.contains("encryption_kid="));
        assert!(child.ends_with("movflags=frag_keyframe+empty_moov+default_base_moof"));
    }

    #[test]
    fn test_mismatched_scheme_rejected() {
        let p = TxParams {
            crypt_scheme: CryptScheme::Aes128,
            ..params(OutputFormat::Dash)
        };
        assert!(matches!(
            MuxerPlan::new(&p, true, true),
            Err(AvpipeError::Config(_))
        ));
    }

    #[test]
    fn test_no_streams() {
        assert!(MuxerPlan::new(&params(OutputFormat::Mp4), false, false).is_err());
    }
}
