//! Builds the ffmpeg argument vector for a job from its `Decision` and the
//! selected hardware backend. No process spawning happens here; this module
//! is a pure function from (input, decision, backend, tmp_output, config) to
//! argv, which keeps it trivially testable without touching ffmpeg at all.

use crate::decision::{Decision, TrackAction};
use mkv2cast_config::{Container, HwBackend};
use std::path::Path;

/// Maps a configured x264-style preset name onto the nvenc/amf quality
/// tiers those backends expose instead of libx264's preset ladder (§4.5).
fn preset_tier(preset: &str) -> &'static str {
    match preset {
        "ultrafast" => "p1",
        "superfast" => "p2",
        "veryfast" => "p3",
        "faster" | "fast" => "p4",
        "medium" => "p5",
        "slow" => "p6",
        "slower" | "veryslow" => "p7",
        _ => "p5",
    }
}

fn amf_quality_mode(preset: &str) -> &'static str {
    match preset {
        "ultrafast" | "superfast" | "veryfast" | "faster" | "fast" => "speed",
        "medium" | "slow" => "balanced",
        "slower" | "veryslow" => "quality",
        _ => "balanced",
    }
}

fn video_args(backend: HwBackend, decision: &Decision, cfg: &mkv2cast_config::Config) -> Vec<String> {
    if !decision.need_v {
        return vec!["-c:v".to_string(), "copy".to_string()];
    }

    match backend {
        HwBackend::Cpu => vec![
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            cfg.quality.preset.clone(),
            "-crf".to_string(),
            cfg.quality.crf.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
        ],
        HwBackend::Vaapi => vec![
            "-vaapi_device".to_string(),
            cfg.backend.vaapi_device.clone(),
            "-vf".to_string(),
            "format=nv12,hwupload".to_string(),
            "-c:v".to_string(),
            "h264_vaapi".to_string(),
            "-qp".to_string(),
            cfg.quality.vaapi_qp.to_string(),
        ],
        HwBackend::Qsv => vec![
            "-c:v".to_string(),
            "h264_qsv".to_string(),
            "-global_quality".to_string(),
            cfg.quality.qsv_quality.to_string(),
        ],
        HwBackend::Nvenc => vec![
            "-c:v".to_string(),
            "h264_nvenc".to_string(),
            "-preset".to_string(),
            preset_tier(&cfg.quality.preset).to_string(),
            "-rc".to_string(),
            "vbr".to_string(),
            "-cq".to_string(),
            cfg.quality.nvenc_cq.to_string(),
        ],
        HwBackend::Amf => vec![
            "-c:v".to_string(),
            "h264_amf".to_string(),
            "-quality".to_string(),
            amf_quality_mode(&cfg.quality.preset).to_string(),
            "-rc".to_string(),
            "cqp".to_string(),
            "-qp_i".to_string(),
            cfg.quality.amf_quality.to_string(),
            "-qp_p".to_string(),
            cfg.quality.amf_quality.to_string(),
            "-qp_b".to_string(),
            cfg.quality.amf_quality.to_string(),
        ],
        HwBackend::Auto => video_args(HwBackend::Cpu, decision, cfg),
    }
}

fn audio_args(decision: &Decision, cfg: &mkv2cast_config::Config) -> Vec<String> {
    let mut args = Vec::new();

    match (decision.audio.source_index, decision.audio.action) {
        (Some(idx), TrackAction::Copy) => {
            args.push("-map".to_string());
            args.push(format!("0:{idx}"));
            args.push("-c:a".to_string());
            args.push("copy".to_string());
        }
        (Some(idx), TrackAction::Transcode) => {
            args.push("-map".to_string());
            args.push(format!("0:{idx}"));
            args.push("-c:a".to_string());
            args.push("aac".to_string());
            args.push("-b:a".to_string());
            args.push(cfg.quality.abr.clone());
            if !cfg.decision.keep_surround {
                args.push("-ac".to_string());
                args.push("2".to_string());
            }
        }
        (None, _) if decision.audio.add_silence => {
            args.push("-map".to_string());
            args.push("1:a:0".to_string());
            args.push("-c:a".to_string());
            args.push("aac".to_string());
            args.push("-shortest".to_string());
        }
        _ => {}
    }

    args
}

fn subtitle_args(decision: &Decision, container: Container, has_any_subtitles: bool, no_subtitles: bool) -> Vec<String> {
    let codec = match container {
        Container::Mkv => "copy",
        Container::Mp4 => "mov_text",
    };

    match decision.subtitle.source_index {
        Some(idx) => vec!["-map".to_string(), format!("0:{idx}"), "-c:s".to_string(), codec.to_string()],
        None if !no_subtitles && has_any_subtitles => {
            vec!["-map".to_string(), "0:s?".to_string(), "-c:s".to_string(), codec.to_string()]
        }
        None => vec![],
    }
}

fn metadata_args(cfg: &mkv2cast_config::Config, container: Container) -> Vec<String> {
    let mut args = Vec::new();
    if cfg.safety.preserve_metadata {
        args.push("-map_metadata".to_string());
        args.push("0".to_string());
    }
    if cfg.safety.preserve_chapters {
        args.push("-map_chapters".to_string());
        args.push("0".to_string());
    }
    if cfg.safety.preserve_attachments && container == Container::Mkv {
        args.push("-map".to_string());
        args.push("0:t?".to_string());
    }
    args
}

fn container_args(container: Container) -> Vec<String> {
    match container {
        Container::Mkv => vec!["-f".to_string(), "matroska".to_string()],
        Container::Mp4 => vec![
            "-f".to_string(),
            "mp4".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ],
    }
}

/// Builds the full ffmpeg argv for one job. `input` is the source path,
/// `output` is the temporary output path (finalized later by `commit`).
/// `has_any_subtitles`/`no_subtitles` tell the subtitle mapper whether to
/// fall back to "copy every subtitle track" when none was explicitly
/// selected (§4.5's "all subtitles if none selected and not no_subtitles").
pub fn build_ffmpeg_args(
    input: &Path,
    output: &Path,
    decision: &Decision,
    cfg: &mkv2cast_config::Config,
    backend: HwBackend,
    has_any_subtitles: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-nostdin".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
    ];

    if decision.audio.add_silence {
        args.push("-f".to_string());
        args.push("lavfi".to_string());
        args.push("-i".to_string());
        args.push("anullsrc=channel_layout=stereo:sample_rate=48000".to_string());
    }

    args.extend(container_args(cfg.output.container));

    args.push("-map".to_string());
    args.push("0:v:0".to_string());
    args.extend(video_args(backend, decision, cfg));
    args.extend(audio_args(decision, cfg));
    args.extend(subtitle_args(
        decision,
        cfg.output.container,
        has_any_subtitles,
        cfg.audio_subtitle.no_subtitles,
    ));
    args.extend(metadata_args(cfg, cfg.output.container));

    args.push("-max_muxing_queue_size".to_string());
    args.push("2048".to_string());

    args.push("-progress".to_string());
    args.push("pipe:1".to_string());
    args.push("-nostats".to_string());
    args.push("-stats_period".to_string());
    args.push(cfg.pipeline.stats_period.max(1).to_string());

    args.push(output.to_string_lossy().to_string());
    args
}

/// Stage tag summarizing how much work the job needs (§4.5): `REMUX` when
/// neither stream needs re-encoding, `AUDIO` when only audio does,
/// `TRANSCODE` otherwise.
pub fn stage_tag(decision: &Decision) -> &'static str {
    match (decision.need_v, decision.need_a) {
        (false, false) => "REMUX",
        (false, true) => "AUDIO",
        (true, _) => "TRANSCODE",
    }
}

/// The filename tag inserted before the configured suffix (§6): `.h264` when
/// only video was re-encoded, `.aac` when only audio was, `.h264.aac` when
/// both were, `.remux` when neither was.
pub fn output_tag(decision: &Decision) -> &'static str {
    match (decision.need_v, decision.need_a) {
        (true, true) => ".h264.aac",
        (true, false) => ".h264",
        (false, true) => ".aac",
        (false, false) => ".remux",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{AudioDecision, SubtitleDecision};
    use mkv2cast_config::Config;
    use std::path::PathBuf;

    fn base_decision() -> Decision {
        Decision {
            need_v: true,
            need_a: false,
            video_reason: String::new(),
            audio: AudioDecision {
                source_index: Some(1),
                action: TrackAction::Copy,
                add_silence: false,
            },
            subtitle: SubtitleDecision {
                source_index: None,
                forced: false,
            },
            skip: false,
            skip_reason: None,
        }
    }

    #[test]
    fn test_copy_video_uses_copy_codec() {
        let mut decision = base_decision();
        decision.need_v = false;
        let cfg = Config::default();
        let args = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &cfg, HwBackend::Cpu, false);
        let pos = args.iter().position(|a| a == "-c:v").unwrap();
        assert_eq!(args[pos + 1], "copy");
    }

    #[test]
    fn test_cpu_transcode_uses_libx264_and_crf() {
        let decision = base_decision();
        let cfg = Config::default();
        let args = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &cfg, HwBackend::Cpu, false);
        assert!(args.iter().any(|a| a == "libx264"));
        assert!(args.iter().any(|a| a == "-crf"));
    }

    #[test]
    fn test_vaapi_includes_device_and_hwupload_filter() {
        let decision = base_decision();
        let cfg = Config::default();
        let args = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &cfg, HwBackend::Vaapi, false);
        assert!(args.iter().any(|a| a == "-vaapi_device"));
        assert!(args.iter().any(|a| a.contains("hwupload")));
    }

    #[test]
    fn test_nvenc_maps_medium_preset_to_p5() {
        let decision = base_decision();
        let cfg = Config::default();
        let args = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &cfg, HwBackend::Nvenc, false);
        assert!(args.iter().any(|a| a == "p5"));
    }

    #[test]
    fn test_no_audio_with_silence_maps_synthesized_input() {
        let mut decision = base_decision();
        decision.audio.source_index = None;
        decision.audio.action = TrackAction::Drop;
        decision.audio.add_silence = true;
        let cfg = Config::default();
        let args = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &cfg, HwBackend::Cpu, false);
        assert!(args.iter().any(|a| a == "anullsrc=channel_layout=stereo:sample_rate=48000"));
        assert!(args.iter().any(|a| a == "1:a:0"));
    }

    #[test]
    fn test_audio_transcode_downmixes_unless_keep_surround() {
        let mut decision = base_decision();
        decision.audio.action = TrackAction::Transcode;
        let cfg = Config::default();
        let args = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &cfg, HwBackend::Cpu, false);
        assert!(args.iter().any(|a| a == "-ac"));

        let mut keep_cfg = Config::default();
        keep_cfg.decision.keep_surround = true;
        let args2 = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &keep_cfg, HwBackend::Cpu, false);
        assert!(!args2.iter().any(|a| a == "-ac"));
    }

    #[test]
    fn test_mp4_container_uses_mov_text_and_faststart() {
        let mut decision = base_decision();
        decision.subtitle.source_index = Some(2);
        let mut cfg = Config::default();
        cfg.output.container = Container::Mp4;
        let args = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &cfg, HwBackend::Cpu, true);
        assert!(args.iter().any(|a| a == "mov_text"));
        assert!(args.iter().any(|a| a == "+faststart"));
    }

    #[test]
    fn test_metadata_preservation_flags_only_when_configured() {
        let decision = base_decision();
        let mut cfg = Config::default();
        cfg.safety.preserve_metadata = true;
        let args = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &cfg, HwBackend::Cpu, false);
        assert!(args.iter().any(|a| a == "-map_metadata"));
    }

    #[test]
    fn test_stats_period_is_threaded_from_config() {
        let decision = base_decision();
        let mut cfg = Config::default();
        cfg.pipeline.stats_period = 5;
        let args = build_ffmpeg_args(&PathBuf::from("in.mkv"), &PathBuf::from("out.mkv"), &decision, &cfg, HwBackend::Cpu, false);
        let pos = args.iter().position(|a| a == "-stats_period").unwrap();
        assert_eq!(args[pos + 1], "5");
    }

    #[test]
    fn test_stage_tag_remux_audio_transcode() {
        let mut decision = base_decision();
        decision.need_v = false;
        decision.need_a = false;
        assert_eq!(stage_tag(&decision), "REMUX");

        decision.need_a = true;
        assert_eq!(stage_tag(&decision), "AUDIO");

        decision.need_v = true;
        assert_eq!(stage_tag(&decision), "TRANSCODE");
    }

    #[test]
    fn test_output_tag_matches_stage_combination() {
        let mut decision = base_decision();
        decision.need_v = true;
        decision.need_a = true;
        assert_eq!(output_tag(&decision), ".h264.aac");
        decision.need_a = false;
        assert_eq!(output_tag(&decision), ".h264");
        decision.need_v = false;
        assert_eq!(output_tag(&decision), ".remux");
    }
}
