//! CLI entry point for mkv2cast.
//!
//! Resolves configuration (system + user TOML, then CLI flags), then either
//! runs the batch pipeline over a file/directory, watches a directory for
//! new sources, or serves one of the utility subcommands (`--show-dirs`,
//! `--history`, `--clean-tmp`, `--check-requirements`, ...).

use clap::Parser;
use mkv2cast_config::{Config, Container, HwBackend};
use mkv2cast_daemon::{runtime, scan};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mkv2cast")]
#[command(author, version, about = "Batch-normalize MKVs to H.264/AAC for cast-friendly playback", long_about = None)]
struct Args {
    /// A single source file or a directory to scan. Defaults to the current directory.
    file: Option<PathBuf>,

    /// Path to an explicit config.toml, overriding the layered system/user config.
    #[arg(long)]
    config: Option<PathBuf>,

    // --- scan controls ---
    #[arg(short = 'r', long = "no-recursive", action = clap::ArgAction::SetFalse, default_value_t = true)]
    recursive: bool,
    #[arg(short = 'I', long = "ignore-pattern")]
    ignore_pattern: Vec<String>,
    #[arg(short = 'i', long = "include-pattern")]
    include_pattern: Vec<String>,
    #[arg(long)]
    ignore_path: Vec<String>,
    #[arg(long)]
    include_path: Vec<String>,

    // --- hardware ---
    #[arg(long, value_enum)]
    hw: Option<HwArg>,
    #[arg(long)]
    vaapi_device: Option<String>,
    #[arg(long)]
    vaapi_qp: Option<u32>,
    #[arg(long)]
    qsv_quality: Option<u32>,
    #[arg(long)]
    nvenc_cq: Option<u32>,

    // --- quality ---
    #[arg(long)]
    abr: Option<String>,
    #[arg(long)]
    crf: Option<u32>,
    #[arg(long)]
    preset: Option<String>,

    // --- codec policy ---
    #[arg(long)]
    force_h264: bool,
    #[arg(long)]
    allow_hevc: bool,
    #[arg(long)]
    force_aac: bool,
    #[arg(long)]
    keep_surround: bool,
    #[arg(long)]
    no_silence: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    skip_when_ok: bool,
    #[arg(long = "no-skip-when-ok", action = clap::ArgAction::SetTrue)]
    no_skip_when_ok: bool,

    // --- audio/subtitle ---
    #[arg(long)]
    audio_lang: Vec<String>,
    #[arg(long)]
    audio_track: Option<usize>,
    #[arg(long)]
    subtitle_lang: Vec<String>,
    #[arg(long)]
    subtitle_track: Option<usize>,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    prefer_forced_subs: bool,
    #[arg(long = "no-forced-subs", action = clap::ArgAction::SetTrue)]
    no_forced_subs: bool,
    #[arg(long)]
    no_subtitles: bool,

    // --- integrity ---
    #[arg(long, action = clap::ArgAction::SetTrue)]
    integrity_check: bool,
    #[arg(long = "no-integrity-check", action = clap::ArgAction::SetTrue)]
    no_integrity_check: bool,
    #[arg(long)]
    stable_wait: Option<u64>,
    #[arg(long)]
    deep_check: bool,

    // --- pipeline ---
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pipeline: bool,
    #[arg(long = "no-pipeline", action = clap::ArgAction::SetTrue)]
    no_pipeline: bool,
    #[arg(long)]
    encode_workers: Option<usize>,
    #[arg(long)]
    integrity_workers: Option<usize>,

    // --- container ---
    #[arg(long, value_enum)]
    container: Option<ContainerArg>,

    // --- watch mode ---
    #[arg(short = 'w', long)]
    watch: bool,
    #[arg(long, default_value_t = 5)]
    watch_interval: u64,

    // --- utility subcommands ---
    #[arg(long)]
    show_dirs: bool,
    #[arg(long, num_args = 0..=1, default_missing_value = "20")]
    history: Option<usize>,
    #[arg(long)]
    history_stats: bool,
    #[arg(long)]
    clean_tmp: bool,
    #[arg(long)]
    clean_logs: Option<u64>,
    #[arg(long)]
    clean_history: Option<u64>,
    #[arg(long)]
    check_requirements: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum HwArg {
    Auto,
    Nvenc,
    Amf,
    Qsv,
    Vaapi,
    Cpu,
}

impl From<HwArg> for HwBackend {
    fn from(v: HwArg) -> Self {
        match v {
            HwArg::Auto => HwBackend::Auto,
            HwArg::Nvenc => HwBackend::Nvenc,
            HwArg::Amf => HwBackend::Amf,
            HwArg::Qsv => HwBackend::Qsv,
            HwArg::Vaapi => HwBackend::Vaapi,
            HwArg::Cpu => HwBackend::Cpu,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ContainerArg {
    Mkv,
    Mp4,
}

impl From<ContainerArg> for Container {
    fn from(v: ContainerArg) -> Self {
        match v {
            ContainerArg::Mkv => Container::Mkv,
            ContainerArg::Mp4 => Container::Mp4,
        }
    }
}

/// Applies every CLI flag onto a layered-config base, CLI always winning.
fn apply_cli_overrides(mut cfg: Config, args: &Args) -> Config {
    cfg.scan.recursive = args.recursive;
    cfg.scan.ignore_patterns.extend(args.ignore_pattern.iter().cloned());
    cfg.scan.include_patterns.extend(args.include_pattern.iter().cloned());
    cfg.scan.ignore_paths.extend(args.ignore_path.iter().cloned());
    cfg.scan.include_paths.extend(args.include_path.iter().cloned());

    if let Some(hw) = args.hw {
        cfg.backend.hw = hw.into();
    }
    if let Some(ref dev) = args.vaapi_device {
        cfg.backend.vaapi_device = dev.clone();
    }
    if let Some(qp) = args.vaapi_qp {
        cfg.quality.vaapi_qp = qp;
    }
    if let Some(q) = args.qsv_quality {
        cfg.quality.qsv_quality = q;
    }
    if let Some(cq) = args.nvenc_cq {
        cfg.quality.nvenc_cq = cq;
    }

    if let Some(ref abr) = args.abr {
        cfg.quality.abr = abr.clone();
    }
    if let Some(crf) = args.crf {
        cfg.quality.crf = crf;
    }
    if let Some(ref preset) = args.preset {
        cfg.quality.preset = preset.clone();
    }

    if args.force_h264 {
        cfg.decision.force_h264 = true;
    }
    if args.allow_hevc {
        cfg.decision.allow_hevc = true;
    }
    if args.force_aac {
        cfg.decision.force_aac = true;
    }
    if args.keep_surround {
        cfg.decision.keep_surround = true;
    }
    if args.no_silence {
        cfg.decision.add_silence_if_no_audio = false;
    }
    if args.skip_when_ok {
        cfg.decision.skip_when_ok = true;
    }
    if args.no_skip_when_ok {
        cfg.decision.skip_when_ok = false;
    }

    cfg.audio_subtitle.audio_lang.extend(args.audio_lang.iter().cloned());
    if let Some(track) = args.audio_track {
        cfg.audio_subtitle.audio_track = Some(track);
    }
    cfg.audio_subtitle.subtitle_lang.extend(args.subtitle_lang.iter().cloned());
    if let Some(track) = args.subtitle_track {
        cfg.audio_subtitle.subtitle_track = Some(track);
    }
    if args.prefer_forced_subs {
        cfg.audio_subtitle.prefer_forced_subs = true;
    }
    if args.no_forced_subs {
        cfg.audio_subtitle.prefer_forced_subs = false;
    }
    if args.no_subtitles {
        cfg.audio_subtitle.no_subtitles = true;
    }

    if args.integrity_check {
        cfg.integrity.integrity_check = true;
    }
    if args.no_integrity_check {
        cfg.integrity.integrity_check = false;
    }
    if let Some(wait) = args.stable_wait {
        cfg.integrity.stable_wait = wait;
    }
    if args.deep_check {
        cfg.integrity.deep_check = true;
    }

    if args.no_pipeline {
        cfg.pipeline.pipeline = false;
        // The legacy sequential mode is just the pipelined mode with a
        // single worker of each kind (§9 Open Questions), not a separate path.
        cfg.pipeline.encode_workers = 1;
        cfg.pipeline.integrity_workers = 1;
    }
    if args.pipeline {
        cfg.pipeline.pipeline = true;
    }
    if let Some(n) = args.encode_workers {
        cfg.pipeline.encode_workers = n;
    }
    if let Some(n) = args.integrity_workers {
        cfg.pipeline.integrity_workers = n;
    }

    if let Some(container) = args.container {
        cfg.output.container = container.into();
    }

    cfg
}

fn init_logging(debug: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn show_dirs() {
    println!("config (system): {}", mkv2cast_config::xdg::system_config_path().display());
    println!("config (user):   {}", mkv2cast_config::xdg::user_config_path().display());
    println!("history log:     {}", mkv2cast_config::xdg::history_log_path().display());
    println!("logs dir:        {}", mkv2cast_config::xdg::logs_dir().display());
    println!("tmp dir:         {}", mkv2cast_config::xdg::tmp_dir().display());
}

fn show_history(limit: usize, log_path: &std::path::Path) -> ExitCode {
    match mkv2cast_daemon::history::recent(log_path, limit) {
        Ok(records) => {
            for r in records {
                println!(
                    "{:<24} {:<9} {}{}",
                    r.input_path,
                    format!("{:?}", r.status).to_lowercase(),
                    r.output_path.as_deref().unwrap_or("-"),
                    r.reason.as_deref().map(|m| format!("  ({m})")).unwrap_or_default(),
                );
            }
            ExitCode::from(0)
        }
        Err(e) => {
            error!(error = %e, "failed to read history");
            ExitCode::from(1)
        }
    }
}

fn show_history_stats(log_path: &std::path::Path) -> ExitCode {
    match mkv2cast_daemon::history::stats(log_path) {
        Ok(s) => {
            println!("total:       {}", s.total);
            println!("done:        {}", s.done);
            println!("failed:      {}", s.failed);
            println!("skipped:     {}", s.skipped);
            println!("interrupted: {}", s.interrupted);
            println!("input bytes:  {}", s.total_input_bytes);
            println!("output bytes: {}", s.total_output_bytes);
            println!("avg encode:   {:.1}s", s.avg_encode_time_s);
            ExitCode::from(0)
        }
        Err(e) => {
            error!(error = %e, "failed to compute history stats");
            ExitCode::from(1)
        }
    }
}

fn clean_tmp() -> ExitCode {
    let dir = mkv2cast_config::xdg::tmp_dir();
    let mut removed = 0usize;
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    println!("removed {removed} temp file(s) from {}", dir.display());
    ExitCode::from(0)
}

fn clean_logs(days: u64) -> ExitCode {
    let dir = mkv2cast_config::xdg::logs_dir();
    let cutoff = std::time::SystemTime::now() - std::time::Duration::from_secs(days * 86_400);
    let mut removed = 0usize;
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let is_old = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|m| m < cutoff)
                .unwrap_or(false);
            if is_old && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    println!("removed {removed} log file(s) older than {days} day(s)");
    ExitCode::from(0)
}

fn clean_history(days: u64, log_path: &std::path::Path) -> ExitCode {
    let cutoff_ms = chrono_now_ms() - (days as i64) * 86_400_000;
    match mkv2cast_daemon::history::clean_older_than(log_path, cutoff_ms) {
        Ok(kept) => {
            println!("kept {kept} record(s) newer than {days} day(s) (or still running)");
            ExitCode::from(0)
        }
        Err(e) => {
            error!(error = %e, "failed to clean history");
            ExitCode::from(1)
        }
    }
}

fn chrono_now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn check_requirements() -> ExitCode {
    match runtime::run_requirements_check() {
        Ok(report) => {
            println!("ffmpeg:  {}", report.ffmpeg_version.as_deref().unwrap_or("unknown"));
            println!("ffprobe: {}", report.ffprobe_version.as_deref().unwrap_or("unknown"));
            ExitCode::from(0)
        }
        Err(e) => {
            eprintln!("requirements check failed: {e}");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let base_cfg = match runtime::load_config(args.config.clone()) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "failed to load configuration, proceeding with defaults");
            Config::default()
        }
    };
    let cfg = apply_cli_overrides(base_cfg, &args);
    init_logging(cfg.debug);

    if args.show_dirs {
        show_dirs();
        return ExitCode::from(0);
    }

    let log_path = mkv2cast_config::xdg::history_log_path();

    if let Some(limit) = args.history {
        return show_history(limit, &log_path);
    }
    if args.history_stats {
        return show_history_stats(&log_path);
    }
    if args.clean_tmp {
        return clean_tmp();
    }
    if let Some(days) = args.clean_logs {
        return clean_logs(days);
    }
    if let Some(days) = args.clean_history {
        return clean_history(days, &log_path);
    }
    if args.check_requirements {
        return check_requirements();
    }

    if let Err(e) = runtime::run_requirements_check() {
        eprintln!("startup check failed: {e}");
        return ExitCode::from(1);
    }

    let target = args.file.clone().unwrap_or_else(|| PathBuf::from("."));
    let cfg = Arc::new(cfg);
    let handles = runtime::build(cfg.clone(), log_path, true);

    let cancel = handles.cancel.clone();
    let shutdown = tokio::spawn(runtime::install_shutdown_signal(cancel));

    let stats = if args.watch {
        info!(path = %target.display(), "entering watch mode");
        let stop = async {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(args.watch_interval.max(1))).await;
                if handles.cancel.load(Ordering::SeqCst) {
                    break;
                }
            }
        };
        mkv2cast_daemon::watch_directory(&target, cfg.scan.recursive, &cfg, handles.pipeline.clone(), stop)
            .await
            .map(|results| results.into_iter().fold(mkv2cast_daemon::PipelineStats::default(), |mut acc, s| {
                acc.ok += s.ok;
                acc.skipped += s.skipped;
                acc.failed += s.failed;
                acc.interrupted += s.interrupted;
                acc.was_interrupted |= s.was_interrupted;
                acc
            }))
            .unwrap_or_default()
    } else if target.is_file() {
        handles.pipeline.run_single(target.clone()).await.unwrap_or_default()
    } else {
        let ignore: Vec<String> = cfg
            .scan
            .ignore_patterns
            .iter()
            .chain(cfg.scan.ignore_paths.iter())
            .cloned()
            .collect();
        let include: Vec<String> = cfg
            .scan
            .include_patterns
            .iter()
            .chain(cfg.scan.include_paths.iter())
            .cloned()
            .collect();
        let candidates = scan::scan_libraries(&[target.clone()], &ignore, &include, &cfg.output.suffix);
        let targets: Vec<PathBuf> = candidates.into_iter().map(|c| c.path).collect();
        info!(count = targets.len(), path = %target.display(), "scanned sources");
        handles.pipeline.run(targets).await.unwrap_or_default()
    };

    shutdown.abort();
    handles.shutdown();

    info!(
        ok = stats.ok,
        skipped = stats.skipped,
        failed = stats.failed,
        interrupted = stats.interrupted,
        "run complete"
    );

    if stats.was_interrupted {
        ExitCode::from(130)
    } else if stats.failed > 0 {
        ExitCode::from(2)
    } else {
        ExitCode::from(0)
    }
}
