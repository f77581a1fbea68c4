//! Probes source files with ffprobe and normalizes the result into `StreamInfo`.
//!
//! Raw ffprobe JSON is only ever touched inside the private `ffprobe_json` adapter
//! module; every other module consumes the normalized `StreamInfo`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),
    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),
    #[error("ffprobe timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoInfo {
    pub codec: String,
    pub pix_fmt: String,
    pub profile: String,
    pub level: i32,
    pub bit_depth: u8,
    pub color_primaries: String,
    pub color_transfer: String,
    pub width: u32,
    pub height: u32,
}

impl VideoInfo {
    pub fn is_hdr(&self) -> bool {
        matches!(
            self.color_primaries.as_str(),
            "bt2020" | "bt2020nc" | "bt2020c"
        ) || matches!(self.color_transfer.as_str(), "smpte2084" | "arib-std-b67")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioInfo {
    pub index: usize,
    pub codec: String,
    pub channels: u32,
    pub language: Option<String>,
    pub title: Option<String>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleInfo {
    pub index: usize,
    pub codec: String,
    pub language: Option<String>,
    pub forced: bool,
    pub hearing_impaired: bool,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamInfo {
    pub format_name: String,
    pub video: Option<VideoInfo>,
    pub audio: Vec<AudioInfo>,
    pub subtitles: Vec<SubtitleInfo>,
    pub duration_ms: u64,
}

/// Raw, defensive ffprobe JSON shapes. Every field is optional; this is the one
/// place in the crate that touches ffprobe's actual JSON structure.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<usize>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub profile: Option<String>,
        pub level: Option<i32>,
        pub pix_fmt: Option<String>,
        pub color_primaries: Option<String>,
        pub color_transfer: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub channels: Option<u32>,
        pub duration: Option<String>,
        pub tags: Option<Tags>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct Tags {
        pub language: Option<String>,
        pub title: Option<String>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct Disposition {
        #[serde(default)]
        pub forced: i32,
        #[serde(default)]
        pub hearing_impaired: i32,
        #[serde(default)]
        pub default: i32,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
    }
}

fn parse_bit_depth(pix_fmt: &str) -> u8 {
    if pix_fmt.contains("10le") || pix_fmt.contains("10be") || pix_fmt.starts_with("p010") {
        10
    } else if pix_fmt.contains("12le") || pix_fmt.contains("12be") {
        12
    } else {
        8
    }
}

/// Parses ffprobe JSON text into a normalized `StreamInfo`.
pub fn parse_ffprobe_output(json_str: &str) -> Result<StreamInfo, ProbeError> {
    let raw: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = raw.streams.unwrap_or_default();
    let format = raw
        .format
        .ok_or_else(|| ProbeError::ParseError("missing format block".to_string()))?;

    let mut video = None;
    let mut video_duration: Option<String> = None;
    let mut audio = Vec::new();
    let mut subtitles = Vec::new();

    for stream in streams {
        let index = stream.index.unwrap_or(0);
        match stream.codec_type.as_deref().unwrap_or("") {
            "video" if video.is_none() => {
                video_duration = stream.duration.clone();
                let pix_fmt = stream.pix_fmt.clone().unwrap_or_default();
                video = Some(VideoInfo {
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    bit_depth: parse_bit_depth(&pix_fmt),
                    pix_fmt,
                    profile: stream.profile.clone().unwrap_or_default(),
                    level: stream.level.unwrap_or(0),
                    color_primaries: stream.color_primaries.clone().unwrap_or_default(),
                    color_transfer: stream.color_transfer.clone().unwrap_or_default(),
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                });
            }
            "audio" => {
                let tags = stream.tags.unwrap_or_default();
                let disposition = stream.disposition.unwrap_or_default();
                audio.push(AudioInfo {
                    index,
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    channels: stream.channels.unwrap_or(0),
                    language: tags.language,
                    title: tags.title,
                    is_default: disposition.default != 0,
                });
            }
            "subtitle" => {
                let tags = stream.tags.unwrap_or_default();
                let disposition = stream.disposition.unwrap_or_default();
                subtitles.push(SubtitleInfo {
                    index,
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    language: tags.language,
                    forced: disposition.forced != 0,
                    hearing_impaired: disposition.hearing_impaired != 0,
                    title: tags.title,
                });
            }
            _ => {}
        }
    }

    let duration_ms = format
        .duration
        .as_ref()
        .or(video_duration.as_ref())
        .and_then(|d| d.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
        .unwrap_or(0);

    Ok(StreamInfo {
        format_name: format.format_name.unwrap_or_default(),
        video,
        audio,
        subtitles,
        duration_ms,
    })
}

/// Runs `ffprobe` against `path` with the given timeout and returns a `StreamInfo`.
pub fn probe(path: &Path, timeout: Duration) -> Result<StreamInfo, ProbeError> {
    let output = crate::process::run_with_timeout(
        "ffprobe",
        &[
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
            path.to_str().unwrap_or(""),
        ],
        timeout,
    )?;

    if !output.success {
        return Err(ProbeError::FfprobeFailed(output.stderr.trim().to_string()));
    }
    parse_ffprobe_output(&output.stdout)
}

/// Container duration in milliseconds, already resolved by
/// `parse_ffprobe_output` against the container and, failing that, the first
/// video stream; 0 if neither reports a positive duration.
pub fn duration_ms(info: &StreamInfo) -> u64 {
    info.duration_ms
}
