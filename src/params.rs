//! Per-session transcode parameters
//!
//! `TxParams` is built once from caller input (TOML or JSON) and stays
//! read-only for the lifetime of the session. [`TxParams::validate`] runs
//! before any input is opened, so malformed parameters never touch FFmpeg.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AvpipeError, Result};

/// Output package format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Dash,
    Hls,
    Mp4,
    Fmp4,
    Segment,
    Fmp4Segment,
}

impl OutputFormat {
    /// Name of the FFmpeg muxer that produces this format
    pub fn muxer_name(&self) -> &'static str {
        match self {
            OutputFormat::Dash => "dash",
            OutputFormat::Hls => "hls",
            OutputFormat::Mp4 | OutputFormat::Fmp4 => "mp4",
            OutputFormat::Segment | OutputFormat::Fmp4Segment => "segment",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Dash => "dash",
            OutputFormat::Hls => "hls",
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Fmp4 => "fmp4",
            OutputFormat::Segment => "segment",
            OutputFormat::Fmp4Segment => "fmp4-segment",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = AvpipeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dash" => Ok(OutputFormat::Dash),
            "hls" => Ok(OutputFormat::Hls),
            "mp4" => Ok(OutputFormat::Mp4),
            "fmp4" => Ok(OutputFormat::Fmp4),
            "segment" => Ok(OutputFormat::Segment),
            "fmp4-segment" => Ok(OutputFormat::Fmp4Segment),
            other => Err(AvpipeError::Config(format!("unknown format '{}'", other))),
        }
    }
}

/// Content encryption scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CryptScheme {
    #[default]
    None,
    #[serde(rename = "aes-128")]
    Aes128,
    Cenc,
    Cbc1,
    Cens,
    Cbcs,
}

/// Which elementary streams a session produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Video,
    Audio,
    #[default]
    All,
}

impl TxType {
    pub fn wants_video(&self) -> bool {
        matches!(self, TxType::Video | TxType::All)
    }

    pub fn wants_audio(&self) -> bool {
        matches!(self, TxType::Audio | TxType::All)
    }
}

/// Text overlay drawn on every video frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Watermark {
    pub text: String,
    /// Horizontal position expression, e.g. `W/2` or `10`
    pub xloc: String,
    /// Vertical position expression
    pub yloc: String,
    /// Font size as a fraction of the output height
    pub relative_size: f32,
    pub font_color: String,
    pub shadow: bool,
    pub shadow_color: String,
}

impl Default for Watermark {
    fn default() -> Self {
        Self {
            text: String::new(),
            xloc: "(w-tw)/2".to_string(),
            yloc: "h-(2*lh)".to_string(),
            relative_size: 0.05,
            font_color: "white".to_string(),
            shadow: false,
            shadow_color: "black".to_string(),
        }
    }
}

/// Transcoding parameters for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxParams {
    /// Copy video packets instead of decoding and re-encoding them
    pub bypass: bool,
    pub format: OutputFormat,

    /// First pts (in video stream ticks) to transcode; the input is seeked there
    pub start_time_ts: Option<i64>,
    /// Length of the window in video stream ticks; `None` means the whole input
    pub duration_ts: Option<i64>,
    /// First segment number handed to the segmenting muxer
    pub start_segment: u32,

    pub video_bitrate: Option<i64>,
    pub audio_bitrate: Option<i64>,
    /// Audio sample rate used when the source does not declare one
    pub sample_rate: Option<u32>,
    pub rc_max_rate: Option<i64>,
    pub rc_buffer_size: Option<i64>,
    pub crf: Option<String>,

    /// Segment duration in video stream ticks
    pub seg_duration_ts: i64,
    /// Segment duration in frames
    pub seg_duration_fr: i64,
    /// Segment duration in seconds, as passed to the muxer
    pub seg_duration: String,
    /// Group-of-pictures size handed to the encoder
    pub force_keyint: Option<u32>,

    /// Video encoder name
    pub ecodec: String,
    /// Video decoder name; the stream's codec id is used when unset
    pub dcodec: Option<String>,
    pub enc_height: Option<u32>,
    pub enc_width: Option<u32>,

    pub crypt_scheme: CryptScheme,
    pub crypt_iv: Option<String>,
    pub crypt_key: Option<String>,
    pub crypt_kid: Option<String>,
    pub crypt_key_url: Option<String>,

    pub tx_type: TxType,
    /// Whether the input adapter exposes seeking to the demuxer
    pub seekable: bool,
    pub watermark: Option<Watermark>,
    /// Source audio stream to use; the first audio stream when unset
    pub audio_index: Option<usize>,
    /// Mux spec text for the muxing-only path
    pub mux_spec: Option<String>,
}

impl Default for TxParams {
    fn default() -> Self {
        Self {
            bypass: false,
            format: OutputFormat::Dash,
            start_time_ts: None,
            duration_ts: None,
            start_segment: 1,
            video_bitrate: None,
            audio_bitrate: None,
            sample_rate: None,
            rc_max_rate: None,
            rc_buffer_size: None,
            crf: None,
            seg_duration_ts: 0,
            seg_duration_fr: 0,
            seg_duration: String::new(),
            force_keyint: None,
            ecodec: "libx264".to_string(),
            dcodec: None,
            enc_height: None,
            enc_width: None,
            crypt_scheme: CryptScheme::None,
            crypt_iv: None,
            crypt_key: None,
            crypt_kid: None,
            crypt_key_url: None,
            tx_type: TxType::All,
            seekable: true,
            watermark: None,
            audio_index: None,
            mux_spec: None,
        }
    }
}

impl TxParams {
    /// Load parameters from a file; `.json` is parsed as JSON, anything else as TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Self::from_json(&contents)
        } else {
            Self::from_toml(&contents)
        }
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| AvpipeError::Config(format!("params: {}", e)))
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| AvpipeError::Config(format!("params: {}", e)))
    }

    /// Duration of one frame in video stream ticks.
    ///
    /// The segment duration in ticks must be an exact multiple of the segment
    /// duration in frames.
    pub fn frame_duration(&self) -> Result<i64> {
        if self.seg_duration_ts <= 0 {
            return Err(AvpipeError::Config(format!(
                "seg_duration_ts must be > 0 (got {})",
                self.seg_duration_ts
            )));
        }
        if self.seg_duration_fr <= 0 {
            return Err(AvpipeError::Config(format!(
                "seg_duration_fr must be > 0 (got {})",
                self.seg_duration_fr
            )));
        }
        if self.seg_duration_ts % self.seg_duration_fr != 0 {
            return Err(AvpipeError::Config(format!(
                "frame duration is not an integer: seg_duration_ts={} seg_duration_fr={}",
                self.seg_duration_ts, self.seg_duration_fr
            )));
        }
        Ok(self.seg_duration_ts / self.seg_duration_fr)
    }

    /// Segment duration in seconds, parsed from `seg_duration`
    pub fn seg_duration_secs(&self) -> Result<f64> {
        let secs: f64 = self.seg_duration.trim().parse().map_err(|_| {
            AvpipeError::Config(format!("invalid seg_duration '{}'", self.seg_duration))
        })?;
        if secs.is_nan() || secs <= 0.0 {
            return Err(AvpipeError::Config(format!(
                "seg_duration must be > 0 (got {})",
                secs
            )));
        }
        Ok(secs)
    }

    /// Check that the tick-based and second-based segment durations describe
    /// the same length once the video time base is known.
    pub fn check_seg_duration_agreement(&self, time_base: (i32, i32)) -> Result<()> {
        let (num, den) = time_base;
        if num <= 0 || den <= 0 {
            return Err(AvpipeError::Config(format!(
                "invalid video time base {}/{}",
                num, den
            )));
        }
        let secs = self.seg_duration_secs()?;
        let from_ticks = self.seg_duration_ts as f64 * num as f64 / den as f64;
        // one tick of slack for decimal-rounded second values
        let tolerance = num as f64 / den as f64;
        if (from_ticks - secs).abs() > tolerance.max(1e-3) {
            return Err(AvpipeError::Config(format!(
                "seg_duration_ts={} ({:.3}s at {}/{}) does not match seg_duration={}",
                self.seg_duration_ts, from_ticks, num, den, self.seg_duration
            )));
        }
        Ok(())
    }

    /// Validate everything that can be checked without opening the input
    pub fn validate(&self) -> Result<()> {
        self.frame_duration()?;
        self.seg_duration_secs()?;

        if let Some(d) = self.duration_ts {
            if d <= 0 {
                return Err(AvpipeError::Config(format!(
                    "duration_ts must be > 0 (got {})",
                    d
                )));
            }
        }
        if let Some(s) = self.start_time_ts {
            if s < 0 {
                return Err(AvpipeError::Config(format!(
                    "start_time_ts must be >= 0 (got {})",
                    s
                )));
            }
        }
        if !self.bypass && self.tx_type.wants_video() && self.ecodec.trim().is_empty() {
            return Err(AvpipeError::Config("ecodec is required".into()));
        }
        if matches!(self.enc_width, Some(0)) || matches!(self.enc_height, Some(0)) {
            return Err(AvpipeError::Config("enc_width/enc_height must be > 0".into()));
        }
        if let Some(wm) = &self.watermark {
            if wm.text.is_empty() {
                return Err(AvpipeError::Config("watermark text is empty".into()));
            }
            if wm.relative_size.is_nan() || wm.relative_size <= 0.0 || wm.relative_size > 1.0 {
                return Err(AvpipeError::Config(format!(
                    "watermark relative_size must be in (0, 1] (got {})",
                    wm.relative_size
                )));
            }
        }
        self.validate_crypt()
    }

    fn validate_crypt(&self) -> Result<()> {
        match self.crypt_scheme {
            CryptScheme::None => return Ok(()),
            CryptScheme::Aes128 => {
                if self.format != OutputFormat::Hls {
                    return Err(AvpipeError::Config(format!(
                        "aes-128 encryption requires hls output, not {}",
                        self.format.as_str()
                    )));
                }
                require_hex("crypt_key", self.crypt_key.as_deref())?;
                if self.crypt_key_url.as_deref().unwrap_or("").is_empty() {
                    return Err(AvpipeError::Config(
                        "crypt_key_url is required for aes-128".into(),
                    ));
                }
            }
            CryptScheme::Cenc => {
                if matches!(self.format, OutputFormat::Hls | OutputFormat::Segment) {
                    return Err(AvpipeError::Config(format!(
                        "cenc encryption is not available for {} output",
                        self.format.as_str()
                    )));
                }
                require_hex("crypt_key", self.crypt_key.as_deref())?;
                require_hex("crypt_kid", self.crypt_kid.as_deref())?;
            }
            CryptScheme::Cbc1 | CryptScheme::Cens | CryptScheme::Cbcs => {
                return Err(AvpipeError::Config(format!(
                    "encryption scheme {:?} is not supported by the linked muxers",
                    self.crypt_scheme
                )));
            }
        }
        if let Some(iv) = self.crypt_iv.as_deref() {
            require_hex("crypt_iv", Some(iv))?;
        }
        Ok(())
    }
}

/// Keys, key ids and IVs are 16 bytes written as 32 hex digits
fn require_hex(name: &str, value: Option<&str>) -> Result<()> {
    let value = value.unwrap_or("");
    if value.len() != 32 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AvpipeError::Config(format!(
            "{} must be 32 hex digits",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dash_params() -> TxParams {
        TxParams {
            seg_duration_ts: 180_000,
            seg_duration_fr: 60,
            seg_duration: "2.0".to_string(),
            ..TxParams::default()
        }
    }

    #[test]
    fn test_frame_duration() {
        assert_eq!(dash_params().frame_duration().unwrap(), 3000);
    }

    #[test]
    fn test_indivisible_segment_duration_is_config_error() {
        let params = TxParams {
            seg_duration_ts: 180_001,
            ..dash_params()
        };
        assert!(matches!(
            params.frame_duration(),
            Err(AvpipeError::Config(_))
        ));
        assert!(matches!(params.validate(), Err(AvpipeError::Config(_))));
    }

    #[test]
    fn test_zero_frames_is_config_error() {
        let params = TxParams {
            seg_duration_fr: 0,
            ..dash_params()
        };
        assert!(matches!(params.validate(), Err(AvpipeError::Config(_))));
    }

    #[test]
    fn test_seg_duration_agreement() {
        let params = dash_params();
        assert!(params.check_seg_duration_agreement((1, 90_000)).is_ok());
        assert!(params.check_seg_duration_agreement((1, 30_000)).is_err());
    }

    #[test]
    fn test_parse_toml() {
        let params = TxParams::from_toml(
            r#"
format = "fmp4-segment"
seg_duration_ts = 90000
seg_duration_fr = 30
seg_duration = "1"
ecodec = "mpeg4"
enc_width = 320
tx_type = "video"
crypt_scheme = "none"
"#,
        )
        .unwrap();
        assert_eq!(params.format, OutputFormat::Fmp4Segment);
        assert_eq!(params.enc_width, Some(320));
        assert_eq!(params.tx_type, TxType::Video);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_parse_json_crypt_scheme() {
        let params =
            TxParams::from_json(r#"{"crypt_scheme":"aes-128","format":"hls"}"#).unwrap();
        assert_eq!(params.crypt_scheme, CryptScheme::Aes128);
    }

    #[test]
    fn test_aes128_requires_key_material() {
        let mut params = TxParams {
            format: OutputFormat::Hls,
            crypt_scheme: CryptScheme::Aes128,
            ..dash_params()
        };
        assert!(params.validate().is_err());

        params.crypt_key = Some("000102030405060708090a0b0c0d0e0f".into());
        params.crypt_key_url = Some("https://keys.example/k".into());
        assert!(params.validate().is_ok());

        params.format = OutputFormat::Dash;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_cbcs_rejected() {
        let params = TxParams {
            crypt_scheme: CryptScheme::Cbcs,
            crypt_key: Some("000102030405060708090a0b0c0d0e0f".into()),
            crypt_kid: Some("000102030405060708090a0b0c0d0e0f".into()),
            ..dash_params()
        };
        assert!(matches!(params.validate(), Err(AvpipeError::Config(_))));
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!(
            "fmp4-segment".parse::<OutputFormat>().unwrap(),
            OutputFormat::Fmp4Segment
        );
        assert!("flv".parse::<OutputFormat>().is_err());
    }
}
