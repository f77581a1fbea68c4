//! The job pipeline: two bounded channels, N integrity workers, M encode
//! workers, sentinel-driven shutdown (§4.8). This is the orchestrator that
//! ties every other module in this crate together into one run.
//!
//! Scanning a directory into a list of source paths is the caller's job
//! (see `scan::scan_libraries`); this module only ever sees a flat list of
//! targets to push through the two-stage queue.

use crate::backend::{self, BackendError};
use crate::commit::{self, CommitError};
use crate::concurrency::{self, HostFacts};
use crate::decision::{self, Decision};
use crate::history::{self, HistoryStatus};
use crate::integrity::{self, IntegrityError};
use crate::probe;
use crate::process::{self, ProcessError};
use crate::progress;
use crate::sink::{ProgressSink, ProgressTick};
use mkv2cast_config::{Config, HwBackend};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("backend selection failed: {0}")]
    Backend(#[from] BackendError),
}

/// A source path waiting for integrity checking, or a worker-exit marker.
enum IntegrityItem {
    Target(PathBuf),
    Sentinel,
}

/// A fully-decided job waiting for its encode attempt, or a worker-exit marker.
enum EncodeItem {
    Job(Box<EncodeJob>),
    Sentinel,
}

/// The work item carried across the inner queue (§3).
struct EncodeJob {
    job_id: String,
    input_path: PathBuf,
    input_bytes: u64,
    decision: Decision,
    final_path: PathBuf,
    tmp_path: PathBuf,
    duration_ms: u64,
    has_any_subtitles: bool,
    integrity_time_seconds: f64,
    record_id: String,
    started_at_ms: i64,
}

/// Aggregate outcome of a pipeline run (§7, §8).
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub ok: u64,
    pub skipped: u64,
    pub failed: u64,
    pub interrupted: u64,
    pub was_interrupted: bool,
}

#[derive(Default)]
struct Counters {
    ok: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    was_interrupted: AtomicBool,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            ok: self.ok.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            interrupted: self.interrupted.load(Ordering::SeqCst),
            was_interrupted: self.was_interrupted.load(Ordering::SeqCst),
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

fn backend_name(backend: HwBackend) -> &'static str {
    match backend {
        HwBackend::Auto => "auto",
        HwBackend::Nvenc => "nvenc",
        HwBackend::Amf => "amf",
        HwBackend::Qsv => "qsv",
        HwBackend::Vaapi => "vaapi",
        HwBackend::Cpu => "cpu",
    }
}

/// Checks whether a final output under any of the four possible tags
/// already exists for this source, so a second run over the same directory
/// skips every input without re-probing it (§8 idempotence law).
fn existing_output(path: &Path, cfg: &Config) -> Option<PathBuf> {
    [".h264.aac", ".h264", ".aac", ".remux"]
        .into_iter()
        .map(|tag| commit::final_path_for(path, tag, cfg))
        .find(|candidate| candidate.exists())
}

/// The orchestrator. One instance drives one run over a set of targets, from
/// the integrity queue through to committed output and history records.
pub struct JobPipeline {
    cfg: Arc<Config>,
    sink: Arc<dyn ProgressSink>,
    log_path: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl JobPipeline {
    pub fn new(cfg: Arc<Config>, sink: Arc<dyn ProgressSink>, log_path: PathBuf, cancel: Arc<AtomicBool>) -> Self {
        Self { cfg, sink, log_path, cancel }
    }

    /// Convenience entry point for the watch-mode single-file path (§10.4):
    /// runs the same pipeline over exactly one target.
    pub async fn run_single(&self, path: PathBuf) -> Result<PipelineStats, PipelineError> {
        self.run(vec![path]).await
    }

    /// Runs the full pipeline over `targets`, returning once every source has
    /// reached a terminal state (or cancellation unwound every worker).
    pub async fn run(&self, targets: Vec<PathBuf>) -> Result<PipelineStats, PipelineError> {
        // Crash recovery (I4): any record left `running` from a previous,
        // ungracefully-ended invocation is promoted before this run starts.
        let _ = history::interrupt_all_running(&self.log_path, now_ms());

        let backend = backend::select_backend(self.cfg.backend.hw, Path::new(&self.cfg.backend.vaapi_device))?;
        let facts = HostFacts::gather();
        let plan = concurrency::derive_plan(&self.cfg, backend, facts);

        let integrity_workers = if self.cfg.pipeline.integrity_workers > 0 {
            self.cfg.pipeline.integrity_workers
        } else {
            plan.integrity_workers
        };
        let encode_workers = if self.cfg.pipeline.encode_workers > 0 {
            self.cfg.pipeline.encode_workers
        } else {
            plan.encode_workers
        };

        let queue_capacity = (integrity_workers + encode_workers).max(2) * 4;
        let (iq_tx, iq_rx) = mpsc::channel::<IntegrityItem>(queue_capacity);
        let (eq_tx, eq_rx) = mpsc::channel::<EncodeItem>(queue_capacity);
        let iq_rx = Arc::new(Mutex::new(iq_rx));
        let eq_rx = Arc::new(Mutex::new(eq_rx));

        let counters = Arc::new(Counters::default());
        let sentinels_remaining = Arc::new(AtomicU64::new(integrity_workers as u64));

        let mut integrity_handles = Vec::with_capacity(integrity_workers);
        for _ in 0..integrity_workers {
            let iq_rx = iq_rx.clone();
            let eq_tx = eq_tx.clone();
            let sink = self.sink.clone();
            let cfg = self.cfg.clone();
            let cancel = self.cancel.clone();
            let sentinels_remaining = sentinels_remaining.clone();
            let log_path = self.log_path.clone();
            let counters = counters.clone();
            integrity_handles.push(tokio::spawn(async move {
                integrity_worker(
                    iq_rx,
                    eq_tx,
                    sink,
                    cfg,
                    cancel,
                    sentinels_remaining,
                    encode_workers as u64,
                    log_path,
                    counters,
                )
                .await;
            }));
        }
        drop(eq_tx);

        let mut encode_handles = Vec::with_capacity(encode_workers);
        for _ in 0..encode_workers {
            let eq_rx = eq_rx.clone();
            let sink = self.sink.clone();
            let cfg = self.cfg.clone();
            let cancel = self.cancel.clone();
            let log_path = self.log_path.clone();
            let counters = counters.clone();
            encode_handles.push(tokio::spawn(async move {
                encode_worker(eq_rx, sink, cfg, cancel, backend, log_path, counters).await;
            }));
        }

        for target in targets {
            if iq_tx.send(IntegrityItem::Target(target)).await.is_err() {
                break;
            }
        }
        for _ in 0..integrity_workers {
            let _ = iq_tx.send(IntegrityItem::Sentinel).await;
        }
        drop(iq_tx);

        for handle in integrity_handles {
            let _ = handle.await;
        }
        for handle in encode_handles {
            let _ = handle.await;
        }

        if self.cancel.load(Ordering::SeqCst) {
            let _ = history::interrupt_all_running(&self.log_path, now_ms());
        }

        Ok(counters.snapshot())
    }
}

#[allow(clippy::too_many_arguments)]
async fn integrity_worker(
    iq_rx: Arc<Mutex<mpsc::Receiver<IntegrityItem>>>,
    eq_tx: mpsc::Sender<EncodeItem>,
    sink: Arc<dyn ProgressSink>,
    cfg: Arc<Config>,
    cancel: Arc<AtomicBool>,
    sentinels_remaining: Arc<AtomicU64>,
    encode_workers: u64,
    log_path: PathBuf,
    counters: Arc<Counters>,
) {
    loop {
        let item = {
            let mut rx = iq_rx.lock().await;
            rx.recv().await
        };
        match item {
            None => break,
            Some(IntegrityItem::Sentinel) => {
                if sentinels_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    for _ in 0..encode_workers {
                        let _ = eq_tx.send(EncodeItem::Sentinel).await;
                    }
                }
                break;
            }
            Some(IntegrityItem::Target(path)) => {
                process_integrity_item(path, &eq_tx, &sink, &cfg, &cancel, &log_path, &counters).await;
            }
        }
    }
}

async fn process_integrity_item(
    path: PathBuf,
    eq_tx: &mpsc::Sender<EncodeItem>,
    sink: &Arc<dyn ProgressSink>,
    cfg: &Arc<Config>,
    cancel: &Arc<AtomicBool>,
    log_path: &Path,
    counters: &Arc<Counters>,
) {
    let job_id = uuid::Uuid::new_v4().to_string();
    let input_path_str = path.to_string_lossy().to_string();
    sink.register_job(&job_id, &input_path_str);

    if cancel.load(Ordering::SeqCst) {
        sink.mark_failed(&job_id, "interrupted");
        counters.interrupted.fetch_add(1, Ordering::SeqCst);
        counters.was_interrupted.store(true, Ordering::SeqCst);
        return;
    }

    if existing_output(&path, cfg).is_some() {
        sink.mark_skipped(&job_id, "already processed");
        let _ = history::skip(log_path, &input_path_str, "already processed", None, 0, now_ms());
        counters.skipped.fetch_add(1, Ordering::SeqCst);
        return;
    }

    let input_bytes = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            sink.mark_failed(&job_id, &format!("stat error: {e}"));
            counters.failed.fetch_add(1, Ordering::SeqCst);
            return;
        }
    };

    sink.start_integrity(&job_id);
    let outcome = match integrity::check(&path, cfg, &job_id, sink.as_ref()).await {
        Ok(outcome) => outcome,
        Err(IntegrityError::Probe(_)) => {
            sink.stop_integrity(&job_id, 0.0);
            sink.mark_failed(&job_id, "analysis error");
            let _ = history::fail(log_path, &input_path_str, "analysis error", None, input_bytes, now_ms());
            counters.failed.fetch_add(1, Ordering::SeqCst);
            return;
        }
        Err(_) => {
            sink.stop_integrity(&job_id, 0.0);
            sink.mark_skipped(&job_id, "integrity failed");
            let _ = history::skip(log_path, &input_path_str, "integrity failed", None, input_bytes, now_ms());
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            return;
        }
    };
    sink.stop_integrity(&job_id, outcome.elapsed_seconds);

    let filename = path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
    let decision = decision::decide(&outcome.info, &filename, cfg);

    if decision.skip {
        let reason = decision.skip_reason.clone().unwrap_or_else(|| "compatible".to_string());
        sink.mark_skipped(&job_id, &reason);
        let _ = history::skip(log_path, &input_path_str, &reason, None, input_bytes, now_ms());
        counters.skipped.fetch_add(1, Ordering::SeqCst);
        return;
    }

    let tag = crate::command::output_tag(&decision);
    let final_path = commit::final_path_for(&path, tag, cfg);
    let tmp_path = commit::tmp_path(&final_path, &job_id);

    if let Some(dest_dir) = final_path.parent() {
        if commit::check_disk_space(dest_dir, input_bytes, cfg.safety.disk_min_free_mb).is_err() {
            sink.mark_failed(&job_id, "insufficient space");
            let _ = history::fail(log_path, &input_path_str, "insufficient space", None, input_bytes, now_ms());
            counters.failed.fetch_add(1, Ordering::SeqCst);
            return;
        }
    }

    // tmp always lives beside final_path (§4.9), so this only bites when the
    // two preflight thresholds diverge and the shared directory is tighter
    // against the tmp-specific floor than the destination one.
    let tmp_dir = tmp_path.parent().unwrap_or(Path::new("."));
    if commit::check_disk_space(tmp_dir, input_bytes, cfg.safety.disk_min_free_tmp_mb).is_err() {
        sink.mark_failed(&job_id, "insufficient space");
        let _ = history::fail(log_path, &input_path_str, "insufficient space", None, input_bytes, now_ms());
        counters.failed.fetch_add(1, Ordering::SeqCst);
        return;
    }

    let duration_ms = probe::duration_ms(&outcome.info);
    let has_any_subtitles = !outcome.info.subtitles.is_empty();

    if cfg.dryrun {
        sink.mark_skipped(&job_id, "dryrun");
        let _ = history::skip(log_path, &input_path_str, "dryrun", None, input_bytes, now_ms());
        counters.skipped.fetch_add(1, Ordering::SeqCst);
        return;
    }

    let started_at_ms = now_ms();
    let record_id = match history::start(log_path, &input_path_str, None, input_bytes, started_at_ms) {
        Ok(id) => id,
        Err(_) => {
            sink.mark_failed(&job_id, "history start failed");
            counters.failed.fetch_add(1, Ordering::SeqCst);
            return;
        }
    };

    let job = EncodeJob {
        job_id,
        input_path: path,
        input_bytes,
        decision,
        final_path,
        tmp_path,
        duration_ms,
        has_any_subtitles,
        integrity_time_seconds: outcome.elapsed_seconds,
        record_id,
        started_at_ms,
    };

    let _ = eq_tx.send(EncodeItem::Job(Box::new(job))).await;
}

async fn encode_worker(
    eq_rx: Arc<Mutex<mpsc::Receiver<EncodeItem>>>,
    sink: Arc<dyn ProgressSink>,
    cfg: Arc<Config>,
    cancel: Arc<AtomicBool>,
    backend: HwBackend,
    log_path: PathBuf,
    counters: Arc<Counters>,
) {
    loop {
        let item = {
            let mut rx = eq_rx.lock().await;
            rx.recv().await
        };
        let job = match item {
            Some(EncodeItem::Job(job)) => *job,
            Some(EncodeItem::Sentinel) | None => break,
        };
        run_encode_job(job, &sink, &cfg, &cancel, backend, &log_path, &counters).await;
    }
}

fn finalize_interrupted(job: &EncodeJob, sink: &Arc<dyn ProgressSink>, log_path: &Path, counters: &Arc<Counters>) {
    commit::cleanup_tmp(&job.tmp_path);
    sink.mark_failed(&job.job_id, "interrupted");
    let _ = history::finish(
        log_path,
        &job.record_id,
        &job.input_path.to_string_lossy(),
        None,
        job.input_bytes,
        job.started_at_ms,
        HistoryStatus::Interrupted,
        None,
        None,
        None,
        Some(job.integrity_time_seconds),
        Some("interrupted"),
        now_ms(),
    );
    counters.interrupted.fetch_add(1, Ordering::SeqCst);
    counters.was_interrupted.store(true, Ordering::SeqCst);
}

#[allow(clippy::too_many_arguments)]
async fn run_encode_job(
    job: EncodeJob,
    sink: &Arc<dyn ProgressSink>,
    cfg: &Arc<Config>,
    cancel: &Arc<AtomicBool>,
    initial_backend: HwBackend,
    log_path: &Path,
    counters: &Arc<Counters>,
) {
    let max_attempts = 1 + cfg.safety.retry_attempts;
    sink.start_encode(&job.job_id, backend_name(initial_backend), job.duration_ms);
    let encode_start = Instant::now();
    let mut attempt_backend = initial_backend;
    let mut last_reason = String::from("encode failed");

    for attempt in 1..=max_attempts {
        if cancel.load(Ordering::SeqCst) {
            finalize_interrupted(&job, sink, log_path, counters);
            return;
        }

        if attempt == max_attempts && cfg.safety.retry_fallback_cpu && attempt_backend != HwBackend::Cpu {
            attempt_backend = HwBackend::Cpu;
        }

        let args = crate::command::build_ffmpeg_args(
            &job.input_path,
            &job.tmp_path,
            &job.decision,
            cfg,
            attempt_backend,
            job.has_any_subtitles,
        );

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let progress_sink = sink.clone();
        let progress_job_id = job.job_id.clone();
        let duration_ms = job.duration_ms;
        let progress_started = Instant::now();
        let progress_task = tokio::spawn(async move {
            let mut block = String::new();
            while let Some(line) = line_rx.recv().await {
                block.push_str(&line);
                block.push('\n');
                if line.starts_with("progress=") {
                    if let Some(event) =
                        progress::parse_progress_block(&block, duration_ms, Some(progress_started.elapsed().as_millis() as u64))
                    {
                        progress_sink.update_encode(
                            &progress_job_id,
                            ProgressTick {
                                percent: event.percent,
                                fps: event.fps,
                                speed: event.speed,
                                bitrate_kbps: event.bitrate_kbps,
                                eta_seconds: event.eta_seconds,
                                current_time_ms: event.out_time_ms,
                                duration_ms,
                            },
                        );
                    }
                    block.clear();
                }
            }
        });

        let result = process::run_streaming("ffmpeg", &args, line_tx).await;
        let _ = progress_task.await;

        match result {
            Ok(output) if output.success => match commit::commit(&job.tmp_path, &job.final_path, job.input_bytes, cfg) {
                Ok(output_bytes) => {
                    let encode_time_s = encode_start.elapsed().as_secs_f64();
                    sink.mark_done(&job.job_id, encode_time_s, "done");
                    let _ = history::finish(
                        log_path,
                        &job.record_id,
                        &job.input_path.to_string_lossy(),
                        Some(backend_name(attempt_backend)),
                        job.input_bytes,
                        job.started_at_ms,
                        HistoryStatus::Done,
                        Some(&job.final_path.to_string_lossy()),
                        Some(output_bytes),
                        Some(encode_time_s),
                        Some(job.integrity_time_seconds),
                        None,
                        now_ms(),
                    );
                    counters.ok.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                Err(CommitError::QuotaExceeded { .. }) => {
                    fail_job(&job, sink, log_path, counters, attempt_backend, "quota exceeded", encode_start);
                    return;
                }
                Err(_) => {
                    fail_job(&job, sink, log_path, counters, attempt_backend, "move error", encode_start);
                    return;
                }
            },
            Ok(output) => {
                commit::cleanup_tmp(&job.tmp_path);
                let rc_line = output.stderr.lines().last().unwrap_or("ffmpeg exited with an error").to_string();
                last_reason = format!("ffmpeg: {rc_line}");
                if attempt < max_attempts {
                    sink.mark_retry(&job.job_id, attempt, &last_reason);
                    tokio::time::sleep(Duration::from_secs(cfg.safety.retry_delay_sec)).await;
                    continue;
                }
                fail_job(&job, sink, log_path, counters, attempt_backend, &last_reason, encode_start);
                return;
            }
            Err(ProcessError::Cancelled) => {
                commit::cleanup_tmp(&job.tmp_path);
                finalize_interrupted(&job, sink, log_path, counters);
                return;
            }
            Err(e) => {
                commit::cleanup_tmp(&job.tmp_path);
                if cancel.load(Ordering::SeqCst) {
                    finalize_interrupted(&job, sink, log_path, counters);
                    return;
                }
                last_reason = e.to_string();
                if attempt < max_attempts {
                    sink.mark_retry(&job.job_id, attempt, &last_reason);
                    tokio::time::sleep(Duration::from_secs(cfg.safety.retry_delay_sec)).await;
                    continue;
                }
                fail_job(&job, sink, log_path, counters, attempt_backend, &last_reason, encode_start);
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn fail_job(
    job: &EncodeJob,
    sink: &Arc<dyn ProgressSink>,
    log_path: &Path,
    counters: &Arc<Counters>,
    backend: HwBackend,
    reason: &str,
    encode_start: Instant,
) {
    sink.mark_failed(&job.job_id, reason);
    let _ = history::finish(
        log_path,
        &job.record_id,
        &job.input_path.to_string_lossy(),
        Some(backend_name(backend)),
        job.input_bytes,
        job.started_at_ms,
        HistoryStatus::Failed,
        None,
        None,
        Some(encode_start.elapsed().as_secs_f64()),
        Some(job.integrity_time_seconds),
        Some(reason),
        now_ms(),
    );
    counters.failed.fetch_add(1, Ordering::SeqCst);
}
