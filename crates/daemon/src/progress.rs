//! Parses ffmpeg `-progress pipe:1` key=value lines and turns them into
//! progress events with an ETA estimate (§4.7).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ProgressState {
    Continue,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub frame: u64,
    pub out_time_ms: u64,
    pub speed: f64,
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub size_bytes: u64,
    pub state: ProgressState,
    pub percent: f64,
    pub eta_seconds: Option<u64>,
}

/// Parses one `-progress` block (the key=value lines ffmpeg emits per
/// update, terminated by `progress=continue` or `progress=end`) into a map.
fn parse_kv_block(block: &str) -> HashMap<&str, &str> {
    block
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

fn parse_out_time_ms(kv: &HashMap<&str, &str>) -> u64 {
    if let Some(us) = kv.get("out_time_us").and_then(|v| v.parse::<i64>().ok()) {
        return (us.max(0) / 1000) as u64;
    }
    if let Some(ms) = kv.get("out_time_ms").and_then(|v| v.parse::<i64>().ok()) {
        return ms.max(0) as u64;
    }
    if let Some(time_str) = kv.get("out_time").or_else(|| kv.get("time")) {
        return parse_timecode_ms(time_str);
    }
    0
}

/// Parses `HH:MM:SS.ss`, accepting both `.` and `,` as the decimal separator
/// (ffmpeg's stderr stats lines use `.`; some locales emit `,`).
fn parse_timecode_ms(s: &str) -> u64 {
    let normalized = s.replace(',', ".");
    let parts: Vec<&str> = normalized.split(':').collect();
    if parts.len() != 3 {
        return 0;
    }
    let hours: f64 = parts[0].parse().unwrap_or(0.0);
    let minutes: f64 = parts[1].parse().unwrap_or(0.0);
    let seconds: f64 = parts[2].parse().unwrap_or(0.0);
    ((hours * 3600.0 + minutes * 60.0 + seconds) * 1000.0) as u64
}

fn parse_speed(kv: &HashMap<&str, &str>) -> f64 {
    kv.get("speed")
        .and_then(|v| v.trim_end_matches('x').parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn parse_fps(kv: &HashMap<&str, &str>) -> f64 {
    kv.get("fps").and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0)
}

fn parse_frame(kv: &HashMap<&str, &str>) -> u64 {
    kv.get("frame").and_then(|v| v.parse::<u64>().ok()).unwrap_or(0)
}

fn parse_size_bytes(kv: &HashMap<&str, &str>) -> u64 {
    kv.get("total_size")
        .or_else(|| kv.get("size"))
        .and_then(|v| v.trim_end_matches("kB").trim().parse::<u64>().ok())
        .unwrap_or(0)
}

fn parse_bitrate_kbps(kv: &HashMap<&str, &str>) -> f64 {
    kv.get("bitrate")
        .and_then(|v| v.trim_end_matches("kbits/s").trim().parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Computes remaining-time estimate from current progress and encode speed.
/// `duration_ms` is the source's total duration; `out_time_ms` is how far the
/// encode has progressed; `speed` is ffmpeg's self-reported x-realtime speed.
pub fn calculate_eta(duration_ms: u64, out_time_ms: u64, speed: f64) -> Option<u64> {
    if speed <= 0.0 || duration_ms == 0 || out_time_ms >= duration_ms {
        return None;
    }
    let remaining_ms = (duration_ms - out_time_ms) as f64;
    Some((remaining_ms / speed / 1000.0) as u64)
}

/// Wall-clock-rate ETA fallback used when ffmpeg hasn't yet reported a speed
/// (e.g. the very first progress update): `elapsed * remaining_pct / done_pct`.
pub fn calculate_eta_wallclock(elapsed_ms: u64, duration_ms: u64, out_time_ms: u64) -> Option<u64> {
    if duration_ms == 0 || out_time_ms == 0 || out_time_ms >= duration_ms {
        return None;
    }
    let done_pct = out_time_ms as f64 / duration_ms as f64;
    let remaining_pct = 1.0 - done_pct;
    Some(((elapsed_ms as f64) * remaining_pct / done_pct / 1000.0) as u64)
}

fn calculate_percent(duration_ms: u64, out_time_ms: u64) -> f64 {
    if duration_ms == 0 {
        return 0.0;
    }
    ((out_time_ms as f64 / duration_ms as f64) * 100.0).clamp(0.0, 100.0)
}

/// Parses a single progress block into an event, given the source's known
/// total duration for percent/ETA computation and (optionally) wall-clock
/// elapsed time since the encode started, used as an ETA fallback when
/// ffmpeg hasn't reported a `speed` yet.
pub fn parse_progress_block(block: &str, duration_ms: u64, elapsed_ms: Option<u64>) -> Option<ProgressEvent> {
    let kv = parse_kv_block(block);
    if kv.is_empty() {
        return None;
    }

    let out_time_ms = parse_out_time_ms(&kv);
    let speed = parse_speed(&kv);
    let state = match kv.get("progress") {
        Some(&"end") => ProgressState::End,
        _ => ProgressState::Continue,
    };

    let eta_seconds = calculate_eta(duration_ms, out_time_ms, speed)
        .or_else(|| elapsed_ms.and_then(|e| calculate_eta_wallclock(e, duration_ms, out_time_ms)));

    Some(ProgressEvent {
        frame: parse_frame(&kv),
        out_time_ms,
        speed,
        fps: parse_fps(&kv),
        bitrate_kbps: parse_bitrate_kbps(&kv),
        size_bytes: parse_size_bytes(&kv),
        state,
        percent: calculate_percent(duration_ms, out_time_ms),
        eta_seconds,
    })
}

/// Splits raw ffmpeg stderr/progress text into per-update blocks and parses
/// each one, returning events in emission order. Progress is monotonic per
/// job per stage by construction: ffmpeg always reports increasing
/// `out_time_us`, and callers should keep only the latest event.
pub fn parse_progress_stream(text: &str, duration_ms: u64) -> Vec<ProgressEvent> {
    text.split("progress=")
        .filter(|chunk| !chunk.trim().is_empty())
        .filter_map(|chunk| {
            let marker = if chunk.trim_start().starts_with("end") {
                "end"
            } else {
                "continue"
            };
            let full_block = format!("{chunk}\nprogress={marker}");
            parse_progress_block(&full_block, duration_ms, None)
        })
        .collect()
}
