//! Directory watch mode (§10.4), grounded in the original's `watcher.py`:
//! a filesystem watcher (event-driven via `notify`, falling back to polling
//! when the native backend can't be established) feeds newly-appeared `.mkv`
//! files into the same single-file pipeline entry point batch mode uses.
//!
//! Per the Open Question recorded in DESIGN.md, a `notify` create event and a
//! rename-into-the-watched-directory event are treated identically: both
//! funnel into `handle_candidate` after a stability wait.

use crate::pipeline::{JobPipeline, PipelineStats};
use crate::scan::is_output_or_temp;
use mkv2cast_config::Config;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to start filesystem watcher: {0}")]
    Notify(#[from] notify::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn is_watchable_mkv(path: &Path, suffix: &str) -> bool {
    if !path.is_file() {
        return false;
    }
    let ext_is_mkv = path.extension().map(|e| e.eq_ignore_ascii_case("mkv")).unwrap_or(false);
    ext_is_mkv && !is_output_or_temp(path, suffix)
}

/// Watches `root` for newly-appeared source `.mkv` files and runs each one
/// through `pipeline` once it stabilizes. Blocks until `stop` resolves
/// (typically a ctrl-c future) or the watcher's channel closes.
pub async fn watch_directory(
    root: &Path,
    recursive: bool,
    cfg: &Config,
    pipeline: Arc<JobPipeline>,
    stop: impl std::future::Future<Output = ()>,
) -> Result<Vec<PipelineStats>, WatchError> {
    if !root.is_dir() {
        return Err(WatchError::NotADirectory(root.to_path_buf()));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
    let mode = if recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };

    // Both branches' handles are bound here rather than dropped: an active
    // `RecommendedWatcher` stops delivering events the moment it is dropped,
    // and the poll fallback task is aborted if its handle goes out of scope.
    let mut _native_watcher = None;
    let mut _poll_handle = None;
    match build_native_watcher(root, mode, tx.clone()) {
        Ok(w) => {
            info!(path = %root.display(), "watching directory via native filesystem events");
            _native_watcher = Some(w);
        }
        Err(e) => {
            warn!(error = %e, "native watcher unavailable, falling back to polling");
            _poll_handle = Some(spawn_polling_fallback(root.to_path_buf(), recursive, tx.clone()));
        }
    };

    let suffix = cfg.output.suffix.clone();
    let stable_wait = cfg.integrity.stable_wait;
    let mut results = Vec::new();
    let processing: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));

    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => {
                info!("watch mode stopping");
                break;
            }
            candidate = rx.recv() => {
                match candidate {
                    Some(path) => {
                        if let Some(stats) = handle_candidate(path, &suffix, stable_wait, &processing, &pipeline).await {
                            results.push(stats);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(results)
}

fn build_native_watcher(
    root: &Path,
    mode: RecursiveMode,
    tx: mpsc::UnboundedSender<PathBuf>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(root, mode)?;
    Ok(watcher)
}

/// Fallback when the native backend can't be established (e.g. some network
/// filesystems): re-scan the directory on an interval and diff against the
/// previously seen set, mirroring the original's polling loop.
fn spawn_polling_fallback(
    root: PathBuf,
    recursive: bool,
    tx: mpsc::UnboundedSender<PathBuf>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut known: HashSet<PathBuf> = scan_mkvs(&root, recursive).into_iter().collect();
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let current: HashSet<PathBuf> = scan_mkvs(&root, recursive).into_iter().collect();
            for path in current.difference(&known) {
                if tx.send(path.clone()).is_err() {
                    return;
                }
            }
            known = current;
        }
    })
}

fn scan_mkvs(root: &Path, recursive: bool) -> Vec<PathBuf> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    walkdir::WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect()
}

async fn handle_candidate(
    path: PathBuf,
    suffix: &str,
    stable_wait: u64,
    processing: &Arc<Mutex<HashSet<PathBuf>>>,
    pipeline: &Arc<JobPipeline>,
) -> Option<PipelineStats> {
    if !is_watchable_mkv(&path, suffix) {
        return None;
    }

    {
        let mut guard = processing.lock().unwrap();
        if !guard.insert(path.clone()) {
            return None;
        }
    }

    let outcome = {
        let initial_size = match tokio::fs::metadata(&path).await {
            Ok(m) => m.len(),
            Err(_) => {
                processing.lock().unwrap().remove(&path);
                return None;
            }
        };
        match crate::stability::check_stability(&path, initial_size, stable_wait, |_| {}).await {
            Ok(crate::stability::StabilityResult::Stable) => {
                info!(path = %path.display(), "new stable file detected, submitting to pipeline");
                pipeline.run_single(path.clone()).await.ok()
            }
            _ => {
                warn!(path = %path.display(), "file did not stabilize, skipping");
                None
            }
        }
    };

    processing.lock().unwrap().remove(&path);
    outcome
}
