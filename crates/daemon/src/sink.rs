//! The progress-sink abstraction the pipeline reports through.
//!
//! `ProgressSink` is the only thing a worker touches to make its state
//! visible outside the pipeline; it owns every `JobStatus` and is the sole
//! writer of it, so nothing else needs to hold a lock on job state. Two
//! concrete sinks are provided: `MetricsSink`, which feeds the `/metrics`
//! HTTP surface consumed by the TUI, and `NullSink`, used by tests and the
//! library entry point when no renderer is attached.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle stage of a job, mirrored 1:1 into the progress-event contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Waiting,
    Checking,
    WaitingEncode,
    Encoding,
    Done,
    Skipped,
    Failed,
    Retry,
}

/// Cumulative, externally-visible state of one job. Owned exclusively by the
/// sink; workers only ever send it events, never mutate it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub input_path: String,
    pub stage: Stage,
    pub progress_percent: f64,
    pub fps: f64,
    pub speed: f64,
    pub bitrate_kbps: f64,
    pub eta_seconds: Option<u64>,
    pub current_time_ms: u64,
    pub duration_ms: u64,
    pub backend: Option<String>,
    pub integrity_elapsed_s: f64,
    pub encode_elapsed_s: f64,
    pub total_elapsed_s: f64,
    pub result_message: Option<String>,
}

impl JobStatus {
    fn new(job_id: &str, input_path: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            input_path: input_path.to_string(),
            stage: Stage::Waiting,
            progress_percent: 0.0,
            fps: 0.0,
            speed: 0.0,
            bitrate_kbps: 0.0,
            eta_seconds: None,
            current_time_ms: 0,
            duration_ms: 0,
            backend: None,
            integrity_elapsed_s: 0.0,
            encode_elapsed_s: 0.0,
            total_elapsed_s: 0.0,
            result_message: None,
        }
    }
}

/// One tick of encode/integrity progress, as parsed from ffmpeg or produced
/// by the integrity checker.
#[derive(Debug, Clone, Default)]
pub struct ProgressTick {
    pub percent: f64,
    pub fps: f64,
    pub speed: f64,
    pub bitrate_kbps: f64,
    pub eta_seconds: Option<u64>,
    pub current_time_ms: u64,
    pub duration_ms: u64,
}

/// The renderer-facing interface. Implementors must be `Send + Sync` since
/// both integrity and encode workers call it concurrently from different
/// tasks. Every method is synchronous from the caller's perspective (sinks
/// that need async I/O, like the metrics HTTP surface, buffer internally).
pub trait ProgressSink: Send + Sync {
    fn register_job(&self, job_id: &str, input_path: &str);
    fn start_integrity(&self, job_id: &str);
    fn update_integrity(&self, job_id: &str, tick: ProgressTick);
    fn stop_integrity(&self, job_id: &str, elapsed_s: f64);
    fn start_encode(&self, job_id: &str, backend: &str, duration_ms: u64);
    fn update_encode(&self, job_id: &str, tick: ProgressTick);
    fn mark_retry(&self, job_id: &str, attempt: u32, reason: &str);
    fn mark_done(&self, job_id: &str, elapsed_s: f64, message: &str);
    fn mark_skipped(&self, job_id: &str, reason: &str);
    fn mark_failed(&self, job_id: &str, reason: &str);
    fn get_status(&self, job_id: &str) -> Option<JobStatus>;
    fn snapshot(&self) -> Vec<JobStatus>;
}

/// The concrete sink used by the daemon: a `std::sync::Mutex`-backed
/// map so every `ProgressSink` method stays fully synchronous (no `.await`
/// needed from inside a blocking worker loop), with a cheap async snapshot
/// method for the axum handler.
#[derive(Clone)]
pub struct StdMetricsSink {
    jobs: Arc<std::sync::Mutex<HashMap<String, JobStatus>>>,
}

impl StdMetricsSink {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    fn with_job<F: FnOnce(&mut JobStatus)>(&self, job_id: &str, f: F) {
        let mut guard = self.jobs.lock().unwrap();
        if let Some(status) = guard.get_mut(job_id) {
            f(status);
        }
    }

    fn apply_tick(status: &mut JobStatus, tick: ProgressTick) {
        // I5: percent is monotonic non-decreasing within a stage.
        if tick.percent > status.progress_percent {
            status.progress_percent = tick.percent;
        }
        status.fps = tick.fps;
        status.speed = tick.speed;
        status.bitrate_kbps = tick.bitrate_kbps;
        status.eta_seconds = tick.eta_seconds;
        status.current_time_ms = tick.current_time_ms;
        if tick.duration_ms > 0 {
            status.duration_ms = tick.duration_ms;
        }
    }
}

impl Default for StdMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for StdMetricsSink {
    fn register_job(&self, job_id: &str, input_path: &str) {
        let mut guard = self.jobs.lock().unwrap();
        guard.insert(job_id.to_string(), JobStatus::new(job_id, input_path));
    }

    fn start_integrity(&self, job_id: &str) {
        self.with_job(job_id, |s| {
            s.stage = Stage::Checking;
            s.progress_percent = 0.0;
        });
    }

    fn update_integrity(&self, job_id: &str, tick: ProgressTick) {
        self.with_job(job_id, |s| Self::apply_tick(s, tick));
    }

    fn stop_integrity(&self, job_id: &str, elapsed_s: f64) {
        self.with_job(job_id, |s| {
            s.integrity_elapsed_s = elapsed_s;
            s.total_elapsed_s += elapsed_s;
            s.stage = Stage::WaitingEncode;
            s.progress_percent = 0.0;
        });
    }

    fn start_encode(&self, job_id: &str, backend: &str, duration_ms: u64) {
        self.with_job(job_id, |s| {
            s.stage = Stage::Encoding;
            s.backend = Some(backend.to_string());
            s.duration_ms = duration_ms;
            s.progress_percent = 0.0;
        });
    }

    fn update_encode(&self, job_id: &str, tick: ProgressTick) {
        self.with_job(job_id, |s| Self::apply_tick(s, tick));
    }

    fn mark_retry(&self, job_id: &str, attempt: u32, reason: &str) {
        self.with_job(job_id, |s| {
            s.stage = Stage::Retry;
            s.result_message = Some(format!("attempt {attempt} failed: {reason}"));
            s.progress_percent = 0.0;
        });
    }

    fn mark_done(&self, job_id: &str, elapsed_s: f64, message: &str) {
        self.with_job(job_id, |s| {
            s.stage = Stage::Done;
            s.encode_elapsed_s = elapsed_s;
            s.total_elapsed_s += elapsed_s;
            s.progress_percent = 100.0;
            s.result_message = Some(message.to_string());
        });
    }

    fn mark_skipped(&self, job_id: &str, reason: &str) {
        self.with_job(job_id, |s| {
            s.stage = Stage::Skipped;
            s.result_message = Some(reason.to_string());
        });
    }

    fn mark_failed(&self, job_id: &str, reason: &str) {
        self.with_job(job_id, |s| {
            s.stage = Stage::Failed;
            s.result_message = Some(reason.to_string());
        });
    }

    fn get_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    fn snapshot(&self) -> Vec<JobStatus> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }
}

/// Discards every event; used by library callers and tests that don't need
/// a renderer attached.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn register_job(&self, _job_id: &str, _input_path: &str) {}
    fn start_integrity(&self, _job_id: &str) {}
    fn update_integrity(&self, _job_id: &str, _tick: ProgressTick) {}
    fn stop_integrity(&self, _job_id: &str, _elapsed_s: f64) {}
    fn start_encode(&self, _job_id: &str, _backend: &str, _duration_ms: u64) {}
    fn update_encode(&self, _job_id: &str, _tick: ProgressTick) {}
    fn mark_retry(&self, _job_id: &str, _attempt: u32, _reason: &str) {}
    fn mark_done(&self, _job_id: &str, _elapsed_s: f64, _message: &str) {}
    fn mark_skipped(&self, _job_id: &str, _reason: &str) {}
    fn mark_failed(&self, _job_id: &str, _reason: &str) {}
    fn get_status(&self, _job_id: &str) -> Option<JobStatus> {
        None
    }
    fn snapshot(&self) -> Vec<JobStatus> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_register_then_start_integrity_sets_stage() {
        let sink = StdMetricsSink::new();
        sink.register_job("job-1", "/media/movie.mkv");
        sink.start_integrity("job-1");
        let status = sink.get_status("job-1").unwrap();
        assert_eq!(status.stage, Stage::Checking);
    }

    #[test]
    fn test_mark_done_sets_percent_to_100() {
        let sink = StdMetricsSink::new();
        sink.register_job("job-1", "/media/movie.mkv");
        sink.mark_done("job-1", 12.5, "ok");
        let status = sink.get_status("job-1").unwrap();
        assert_eq!(status.stage, Stage::Done);
        assert_eq!(status.progress_percent, 100.0);
    }

    #[test]
    fn test_unregistered_job_is_noop() {
        let sink = StdMetricsSink::new();
        sink.start_integrity("missing");
        assert!(sink.get_status("missing").is_none());
    }

    // **Feature: progress sink, Property: percent is monotonic non-decreasing within a stage (I5)**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_percent_monotonic_within_stage(ticks in proptest::collection::vec(0.0f64..100.0, 1..20)) {
            let sink = StdMetricsSink::new();
            sink.register_job("job-1", "/media/movie.mkv");
            sink.start_encode("job-1", "cpu", 10_000);
            let mut last = 0.0;
            for pct in ticks {
                sink.update_encode("job-1", ProgressTick { percent: pct, ..Default::default() });
                let status = sink.get_status("job-1").unwrap();
                prop_assert!(status.progress_percent >= last);
                last = status.progress_percent;
            }
        }
    }
}
