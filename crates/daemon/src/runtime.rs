//! Glue between the CLI binary and the pipeline: config resolution, signal
//! handling, and the startup sequence, generalized from the teacher's old
//! `Daemon::new`/`run_with_server` flow (config load -> startup checks ->
//! concurrency plan -> metrics -> main loop) to this crate's single-pass
//! batch/watch pipeline instead of a persistent job queue.

use crate::metrics::{new_shared_metrics, run_metrics_updater, SharedMetrics};
use crate::metrics_server::{run_metrics_server, ServerError};
use crate::pipeline::JobPipeline;
use crate::sink::{ProgressSink, StdMetricsSink};
use crate::startup::{self, RequirementsReport, StartupError};
use mkv2cast_config::{Config, ConfigError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("metrics server error: {0}")]
    Server(#[from] ServerError),
}

/// Loads configuration the way the CLI does: an explicit `--config` path
/// wins outright, otherwise system and user config files are layered,
/// then either way environment overrides (`MKV2CAST_*`) are applied on top.
pub fn load_config(explicit_path: Option<PathBuf>) -> Result<Config, RuntimeError> {
    let mut config = match explicit_path {
        Some(path) => Config::load_from_file(path)?,
        None => {
            let system = mkv2cast_config::xdg::system_config_path();
            let user = mkv2cast_config::xdg::user_config_path();
            Config::load_layered(Some(system), Some(user))?
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

/// Runs ffmpeg/ffprobe availability checks and returns the report, for both
/// daemon startup and the CLI's `--check-requirements` diagnostic.
pub fn run_requirements_check() -> Result<RequirementsReport, RuntimeError> {
    Ok(startup::run_startup_checks()?)
}

/// Bundles everything a CLI run needs once configuration is resolved: the
/// shared metrics state, a progress sink wired into it, and the pipeline
/// itself, plus background tasks for the metrics HTTP server and updater.
pub struct RuntimeHandles {
    pub sink: Arc<dyn ProgressSink>,
    pub metrics: SharedMetrics,
    pub pipeline: Arc<JobPipeline>,
    pub cancel: Arc<AtomicBool>,
    server_task: tokio::task::JoinHandle<()>,
    updater_task: tokio::task::JoinHandle<()>,
}

impl RuntimeHandles {
    pub fn shutdown(self) {
        self.server_task.abort();
        self.updater_task.abort();
    }
}

/// Assembles the pipeline and spawns its support tasks (metrics server +
/// periodic updater). `serve_metrics` is false for one-shot utility
/// subcommands that don't want a background HTTP listener.
pub fn build(cfg: Arc<Config>, log_path: PathBuf, serve_metrics: bool) -> RuntimeHandles {
    let sink: Arc<dyn ProgressSink> = Arc::new(StdMetricsSink::default());
    let metrics = new_shared_metrics();
    let cancel = Arc::new(AtomicBool::new(false));
    let pipeline = Arc::new(JobPipeline::new(cfg.clone(), sink.clone(), log_path, cancel.clone()));

    let updater_task = {
        let sink = sink.clone();
        let metrics = metrics.clone();
        let period = Duration::from_millis(cfg.pipeline.ui_refresh_ms.max(100));
        tokio::spawn(run_metrics_updater(sink, metrics, period))
    };

    let server_task = if serve_metrics {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics).await {
                error!(error = %e, "metrics server exited");
            }
        })
    } else {
        tokio::spawn(async {})
    };

    RuntimeHandles { sink, metrics, pipeline, cancel, server_task, updater_task }
}

/// Waits for ctrl-c (and, on unix, SIGTERM) and flips `cancel` to true so
/// in-flight pipeline workers wind down into `Interrupted` history records
/// instead of being killed outright.
pub async fn install_shutdown_signal(cancel: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                cancel.store(true, Ordering::SeqCst);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received, finishing in-flight jobs as interrupted");
    cancel.store(true, Ordering::SeqCst);
}
