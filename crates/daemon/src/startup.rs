//! Preflight checks run before the daemon begins scanning: `ffmpeg` and
//! `ffprobe` must be on PATH. Used both at daemon startup and by the CLI's
//! `--check-requirements` diagnostic subcommand (§6, §10.3).

use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementsReport {
    pub ffmpeg_version: Option<String>,
    pub ffprobe_version: Option<String>,
}

/// Extracts the version token from `ffmpeg -version`/`ffprobe -version`
/// output, handling both the standard `X.Y.Z` format and the n-prefixed
/// git-build format (`nX.Y-123-gabcdef`).
pub fn parse_tool_version(version_output: &str) -> Option<String> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("version"))?;

    version_line
        .split("version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()
        .map(str::to_string)
}

pub fn check_ffmpeg_available() -> Result<String, StartupError> {
    let output = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map_err(|e| StartupError::FfmpegUnavailable(format!("ffmpeg -version failed: {e}")))?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(
            "ffmpeg -version exited with failure".to_string(),
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_tool_version(&stdout).unwrap_or_else(|| "unknown".to_string()))
}

pub fn check_ffprobe_available() -> Result<String, StartupError> {
    let output = Command::new("ffprobe")
        .arg("-version")
        .output()
        .map_err(|e| StartupError::FfprobeUnavailable(format!("ffprobe -version failed: {e}")))?;

    if !output.status.success() {
        return Err(StartupError::FfprobeUnavailable(
            "ffprobe -version exited with failure".to_string(),
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_tool_version(&stdout).unwrap_or_else(|| "unknown".to_string()))
}

/// Runs all preflight checks: ffmpeg present, ffprobe present. Returns their
/// reported versions for diagnostic display.
pub fn run_startup_checks() -> Result<RequirementsReport, StartupError> {
    let ffmpeg_version = check_ffmpeg_available()?;
    let ffprobe_version = check_ffprobe_available()?;
    Ok(RequirementsReport {
        ffmpeg_version: Some(ffmpeg_version),
        ffprobe_version: Some(ffprobe_version),
    })
}
