//! Pure decision engine: given a `StreamInfo`, the source filename, and a
//! `Config`, decides what to do with each track. No I/O; every rule here is
//! a deterministic function of its inputs, which is what makes this module
//! cheap to test exhaustively.

use crate::probe::{AudioInfo, StreamInfo, SubtitleInfo, VideoInfo};
use mkv2cast_config::Config;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackAction {
    Copy,
    Transcode,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDecision {
    pub source_index: Option<usize>,
    pub action: TrackAction,
    pub add_silence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleDecision {
    pub source_index: Option<usize>,
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub need_v: bool,
    pub need_a: bool,
    pub video_reason: String,
    pub audio: AudioDecision,
    pub subtitle: SubtitleDecision,
    /// true when every track is already compatible and `skip_when_ok` applies.
    pub skip: bool,
    pub skip_reason: Option<String>,
}

impl Decision {
    pub fn video_action(&self) -> TrackAction {
        if self.need_v {
            TrackAction::Transcode
        } else {
            TrackAction::Copy
        }
    }
}

const HIGH_BIT_PROFILES: &[&str] = &["high 10", "high 4:2:2", "high 4:4:4"];

/// Video-copy eligibility, first match wins (§4.3):
/// 1. AV1 codec or filename contains "AV1" (case-insensitive) -> transcode.
/// 2. `force_h264` -> transcode.
/// 3. h264, <=8-bit, yuv420p family, not HDR, not a high-bit-depth profile,
///    level 0 or <=41 -> copy.
/// 4. hevc/h265: copy iff `allow_hevc` and 8-bit and not HDR.
/// 5. otherwise -> transcode.
fn decide_video(video: &VideoInfo, filename: &str, cfg: &Config) -> (bool, String) {
    let codec = video.codec.to_lowercase();

    if codec == "av1" || filename.to_uppercase().contains("AV1") {
        return (true, "av1 source must be transcoded".to_string());
    }

    if cfg.decision.force_h264 {
        return (true, "force_h264 configured".to_string());
    }

    if codec == "h264" {
        let profile = video.profile.to_lowercase();
        let pix_ok = matches!(video.pix_fmt.as_str(), "yuv420p" | "yuvj420p");
        let level_ok = video.level == 0 || video.level <= 41;
        if video.bit_depth <= 8
            && pix_ok
            && !video.is_hdr()
            && !HIGH_BIT_PROFILES.contains(&profile.as_str())
            && level_ok
        {
            return (false, "h264 already compatible".to_string());
        }
        return (true, "h264 outside compatible profile/level".to_string());
    }

    if codec == "hevc" || codec == "h265" {
        if cfg.decision.allow_hevc && video.bit_depth <= 8 && !video.is_hdr() {
            return (false, "hevc allowed and sdr 8-bit".to_string());
        }
        return (true, "hevc not allowed or not sdr 8-bit".to_string());
    }

    (true, format!("{codec} requires transcode"))
}

fn is_audio_description(title: &str) -> bool {
    let lower = title.to_lowercase();
    ["audio description", "audiodescription", "visual impaired", " ad", " v.i"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn lang_matches(track: &AudioInfo, lang: &str) -> bool {
    track.language.as_deref() == Some(lang)
}

/// Audio track selection (§4.3): explicit index, then each configured
/// language with a two-pass (non-AD first, then any) search, then a
/// hardcoded `{fre, fra, fr}` fallback with the same two passes, then the
/// first track present.
fn select_audio_track<'a>(audio: &'a [AudioInfo], cfg: &Config) -> Option<&'a AudioInfo> {
    if audio.is_empty() {
        return None;
    }

    if let Some(idx) = cfg.audio_subtitle.audio_track {
        if let Some(track) = audio.iter().find(|a| a.index == idx) {
            return Some(track);
        }
    }

    for lang in &cfg.audio_subtitle.audio_lang {
        if let Some(track) = audio
            .iter()
            .find(|a| lang_matches(a, lang) && !a.title.as_deref().map(is_audio_description).unwrap_or(false))
        {
            return Some(track);
        }
    }
    for lang in &cfg.audio_subtitle.audio_lang {
        if let Some(track) = audio.iter().find(|a| lang_matches(a, lang)) {
            return Some(track);
        }
    }

    const DEFAULT_FALLBACK_LANGS: &[&str] = &["fre", "fra", "fr"];
    for lang in DEFAULT_FALLBACK_LANGS {
        if let Some(track) = audio
            .iter()
            .find(|a| lang_matches(a, lang) && !a.title.as_deref().map(is_audio_description).unwrap_or(false))
        {
            return Some(track);
        }
    }
    for lang in DEFAULT_FALLBACK_LANGS {
        if let Some(track) = audio.iter().find(|a| lang_matches(a, lang)) {
            return Some(track);
        }
    }

    audio.first()
}

const COPYABLE_AUDIO_CODECS: &[&str] = &["aac", "mp3"];

fn audio_copy_eligible(track: &AudioInfo, cfg: &Config) -> bool {
    if cfg.decision.force_aac {
        return false;
    }
    COPYABLE_AUDIO_CODECS.contains(&track.codec.to_lowercase().as_str())
}

fn lang_prefix_matches(lang_a: &str, lang_b: &str) -> bool {
    lang_a.len() >= 2 && lang_b.len() >= 2 && lang_a[..2].eq_ignore_ascii_case(&lang_b[..2])
}

/// Subtitle selection (§4.3), skipped entirely when `no_subtitles` is set:
/// explicit index; then, if `prefer_forced_subs`, a forced subtitle whose
/// language prefix matches the selected audio's; then per configured
/// language a three-pass search (forced, then non-SDH, then any); otherwise
/// none.
fn select_subtitle_track<'a>(
    subs: &'a [SubtitleInfo],
    selected_audio_lang: Option<&str>,
    cfg: &Config,
) -> Option<(&'a SubtitleInfo, bool)> {
    if cfg.audio_subtitle.no_subtitles || subs.is_empty() {
        return None;
    }

    if let Some(idx) = cfg.audio_subtitle.subtitle_track {
        if let Some(track) = subs.iter().find(|s| s.index == idx) {
            let forced = track.forced;
            return Some((track, forced));
        }
    }

    if cfg.audio_subtitle.prefer_forced_subs {
        if let Some(audio_lang) = selected_audio_lang {
            if let Some(track) = subs
                .iter()
                .find(|s| s.forced && s.language.as_deref().map(|l| lang_prefix_matches(l, audio_lang)).unwrap_or(false))
            {
                return Some((track, true));
            }
        }
    }

    for lang in &cfg.audio_subtitle.subtitle_lang {
        if let Some(track) = subs
            .iter()
            .find(|s| s.forced && s.language.as_deref() == Some(lang.as_str()))
        {
            return Some((track, true));
        }
    }
    for lang in &cfg.audio_subtitle.subtitle_lang {
        if let Some(track) = subs.iter().find(|s| {
            !s.hearing_impaired
                && !s.title.as_deref().unwrap_or("").to_lowercase().contains("sdh")
                && s.language.as_deref() == Some(lang.as_str())
        }) {
            return Some((track, track.forced));
        }
    }
    for lang in &cfg.audio_subtitle.subtitle_lang {
        if let Some(track) = subs.iter().find(|s| s.language.as_deref() == Some(lang.as_str())) {
            return Some((track, track.forced));
        }
    }

    None
}

/// Produces a full `Decision` for a probed source given the active config and
/// the source's filename (needed for the AV1-filename override rule).
/// Pure function: same inputs always produce the same decision.
pub fn decide(info: &StreamInfo, filename: &str, cfg: &Config) -> Decision {
    let Some(video) = &info.video else {
        return Decision {
            need_v: false,
            need_a: false,
            video_reason: "no video stream".to_string(),
            audio: AudioDecision {
                source_index: None,
                action: TrackAction::Drop,
                add_silence: false,
            },
            subtitle: SubtitleDecision {
                source_index: None,
                forced: false,
            },
            skip: false,
            skip_reason: None,
        };
    };

    let (need_v, video_reason) = decide_video(video, filename, cfg);

    let selected_audio = select_audio_track(&info.audio, cfg);
    let (audio, need_a) = match selected_audio {
        Some(track) => {
            let copy = audio_copy_eligible(track, cfg);
            (
                AudioDecision {
                    source_index: Some(track.index),
                    action: if copy { TrackAction::Copy } else { TrackAction::Transcode },
                    add_silence: false,
                },
                !copy,
            )
        }
        None => {
            let add_silence = cfg.decision.add_silence_if_no_audio;
            (
                AudioDecision {
                    source_index: None,
                    action: TrackAction::Drop,
                    add_silence,
                },
                add_silence,
            )
        }
    };

    let selected_audio_lang = selected_audio.and_then(|t| t.language.as_deref());
    let subtitle = match select_subtitle_track(&info.subtitles, selected_audio_lang, cfg) {
        Some((track, forced)) => SubtitleDecision {
            source_index: Some(track.index),
            forced,
        },
        None => SubtitleDecision {
            source_index: None,
            forced: false,
        },
    };

    let skip = cfg.decision.skip_when_ok && !need_v && !need_a;

    Decision {
        need_v,
        need_a,
        video_reason,
        audio,
        subtitle,
        skip,
        skip_reason: if skip { Some("already compatible".to_string()) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_video(codec: &str) -> VideoInfo {
        VideoInfo {
            codec: codec.to_string(),
            pix_fmt: "yuv420p".to_string(),
            profile: "High".to_string(),
            level: 40,
            bit_depth: 8,
            color_primaries: "bt709".to_string(),
            color_transfer: "bt709".to_string(),
            width: 1920,
            height: 1080,
        }
    }

    fn sample_info(codec: &str, audio: Vec<AudioInfo>) -> StreamInfo {
        StreamInfo {
            format_name: "matroska".to_string(),
            video: Some(sample_video(codec)),
            audio,
            subtitles: vec![],
            duration_ms: 60_000,
        }
    }

    #[test]
    fn test_h264_compatible_copies_by_default() {
        let info = sample_info("h264", vec![]);
        let cfg = Config::default();
        let decision = decide(&info, "clip.mkv", &cfg);
        assert!(!decision.need_v);
        assert!(decision.skip);
    }

    #[test]
    fn test_h264_high10_profile_transcodes() {
        let mut info = sample_info("h264", vec![]);
        info.video.as_mut().unwrap().profile = "High 10".to_string();
        info.video.as_mut().unwrap().bit_depth = 10;
        let decision = decide(&info, "clip.mkv", &Config::default());
        assert!(decision.need_v);
    }

    #[test]
    fn test_hevc_transcodes_unless_allowed() {
        let info = sample_info("hevc", vec![]);
        let cfg = Config::default();
        assert!(decide(&info, "movie.hevc.mkv", &cfg).need_v);

        let mut allow_cfg = Config::default();
        allow_cfg.decision.allow_hevc = true;
        assert!(!decide(&info, "movie.hevc.mkv", &allow_cfg).need_v);
    }

    #[test]
    fn test_av1_filename_forces_transcode_even_if_codec_is_h264() {
        let info = sample_info("h264", vec![]);
        let decision = decide(&info, "show.AV1.clip.mkv", &Config::default());
        assert!(decision.need_v);
    }

    #[test]
    fn test_no_video_stream_is_not_transcode_candidate() {
        let info = StreamInfo {
            format_name: "matroska".to_string(),
            video: None,
            audio: vec![],
            subtitles: vec![],
            duration_ms: 0,
        };
        let decision = decide(&info, "bad.mkv", &Config::default());
        assert!(!decision.need_v);
        assert_eq!(decision.video_reason, "no video stream");
    }

    #[test]
    fn test_no_audio_adds_silence_when_configured() {
        let info = sample_info("h264", vec![]);
        let decision = decide(&info, "clip.mkv", &Config::default());
        assert!(decision.audio.add_silence);
        assert!(decision.need_a);
    }

    #[test]
    fn test_no_audio_no_silence_when_disabled() {
        let mut cfg = Config::default();
        cfg.decision.add_silence_if_no_audio = false;
        let info = sample_info("h264", vec![]);
        let decision = decide(&info, "clip.mkv", &cfg);
        assert!(!decision.audio.add_silence);
        assert!(!decision.need_a);
    }

    fn audio_track(index: usize, codec: &str, lang: Option<&str>, title: Option<&str>) -> AudioInfo {
        AudioInfo {
            index,
            codec: codec.to_string(),
            channels: 2,
            language: lang.map(str::to_string),
            title: title.map(str::to_string),
            is_default: false,
        }
    }

    #[test]
    fn test_audio_track_selected_by_explicit_index() {
        let audio = vec![
            audio_track(1, "aac", Some("eng"), None),
            audio_track(2, "ac3", Some("fre"), None),
        ];
        let info = sample_info("h264", audio);
        let mut cfg = Config::default();
        cfg.audio_subtitle.audio_track = Some(2);
        let decision = decide(&info, "clip.mkv", &cfg);
        assert_eq!(decision.audio.source_index, Some(2));
    }

    #[test]
    fn test_audio_lang_prefers_non_ad_track_first_pass() {
        let audio = vec![
            audio_track(1, "aac", Some("eng"), Some("English (Audio Description)")),
            audio_track(2, "aac", Some("eng"), None),
        ];
        let info = sample_info("h264", audio);
        let mut cfg = Config::default();
        cfg.audio_subtitle.audio_lang = vec!["eng".to_string()];
        let decision = decide(&info, "clip.mkv", &cfg);
        assert_eq!(decision.audio.source_index, Some(2));
    }

    #[test]
    fn test_audio_falls_back_to_french_then_first() {
        let audio = vec![
            audio_track(1, "aac", Some("ger"), None),
            audio_track(2, "aac", Some("fre"), None),
        ];
        let info = sample_info("h264", audio);
        let decision = decide(&info, "clip.mkv", &Config::default());
        assert_eq!(decision.audio.source_index, Some(2));
    }

    #[test]
    fn test_audio_copy_eligible_only_for_aac_mp3() {
        let audio = vec![audio_track(1, "ac3", None, None)];
        let info = sample_info("h264", audio);
        let decision = decide(&info, "clip.mkv", &Config::default());
        assert_eq!(decision.audio.action, TrackAction::Transcode);
    }

    #[test]
    fn test_force_aac_forces_transcode_even_for_aac_source() {
        let audio = vec![audio_track(1, "aac", None, None)];
        let info = sample_info("h264", audio);
        let mut cfg = Config::default();
        cfg.decision.force_aac = true;
        let decision = decide(&info, "clip.mkv", &cfg);
        assert_eq!(decision.audio.action, TrackAction::Transcode);
    }

    fn subtitle(index: usize, lang: &str, forced: bool, hi: bool) -> SubtitleInfo {
        SubtitleInfo {
            index,
            codec: "subrip".to_string(),
            language: Some(lang.to_string()),
            forced,
            hearing_impaired: hi,
            title: None,
        }
    }

    #[test]
    fn test_no_subtitles_flag_skips_selection_entirely() {
        let mut info = sample_info("h264", vec![]);
        info.subtitles = vec![subtitle(1, "eng", false, false)];
        let mut cfg = Config::default();
        cfg.audio_subtitle.no_subtitles = true;
        cfg.audio_subtitle.subtitle_lang = vec!["eng".to_string()];
        let decision = decide(&info, "clip.mkv", &cfg);
        assert!(decision.subtitle.source_index.is_none());
    }

    #[test]
    fn test_subtitle_lang_prefers_forced_over_full() {
        let mut info = sample_info("h264", vec![]);
        info.subtitles = vec![subtitle(1, "eng", false, false), subtitle(2, "eng", true, false)];
        let mut cfg = Config::default();
        cfg.audio_subtitle.subtitle_lang = vec!["eng".to_string()];
        let decision = decide(&info, "clip.mkv", &cfg);
        assert_eq!(decision.subtitle.source_index, Some(2));
        assert!(decision.subtitle.forced);
    }

    #[test]
    fn test_subtitle_selection_skips_sdh_in_second_pass() {
        let mut info = sample_info("h264", vec![]);
        info.subtitles = vec![subtitle(1, "eng", false, true), subtitle(2, "eng", false, false)];
        let mut cfg = Config::default();
        cfg.audio_subtitle.subtitle_lang = vec!["eng".to_string()];
        let decision = decide(&info, "clip.mkv", &cfg);
        assert_eq!(decision.subtitle.source_index, Some(2));
    }

    #[test]
    fn test_subtitle_selection_skips_sdh_title_in_second_pass() {
        let mut info = sample_info("h264", vec![]);
        let mut titled_sdh = subtitle(1, "eng", false, false);
        titled_sdh.title = Some("English SDH".to_string());
        info.subtitles = vec![titled_sdh, subtitle(2, "eng", false, false)];
        let mut cfg = Config::default();
        cfg.audio_subtitle.subtitle_lang = vec!["eng".to_string()];
        let decision = decide(&info, "clip.mkv", &cfg);
        assert_eq!(decision.subtitle.source_index, Some(2));
    }

    // **Feature: decision engine, Property: video action is always copy or transcode when a video stream exists**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_video_action_total(codec in "[a-z0-9]{1,10}", bit_depth in 8u8..13u8) {
            let mut video = sample_video(&codec);
            video.bit_depth = bit_depth;
            let info = StreamInfo {
                format_name: "matroska".to_string(),
                video: Some(video),
                audio: vec![],
                subtitles: vec![],
                duration_ms: 1000,
            };
            let decision = decide(&info, "clip.mkv", &Config::default());
            prop_assert!(matches!(decision.video_action(), TrackAction::Copy | TrackAction::Transcode));
        }

        #[test]
        fn prop_skip_implies_no_reencode_needed(codec in "[a-z0-9]{1,10}") {
            let info = sample_info(&codec, vec![]);
            let decision = decide(&info, "clip.mkv", &Config::default());
            if decision.skip {
                prop_assert!(!decision.need_v && !decision.need_a);
            }
        }

        #[test]
        fn prop_decision_is_pure(codec in "h264|hevc|av1", bit_depth in 8u8..11u8) {
            let mut video = sample_video(&codec);
            video.bit_depth = bit_depth;
            let info = StreamInfo {
                format_name: "matroska".to_string(),
                video: Some(video),
                audio: vec![],
                subtitles: vec![],
                duration_ms: 1000,
            };
            let cfg = Config::default();
            let d1 = decide(&info, "clip.mkv", &cfg);
            let d2 = decide(&info, "clip.mkv", &cfg);
            prop_assert_eq!(d1, d2);
        }
    }
}
