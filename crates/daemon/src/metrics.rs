//! Metrics types served over the daemon's `/metrics` HTTP endpoint and
//! consumed by the TUI dashboard.

use crate::sink::{JobStatus, ProgressSink, Stage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Per-job metrics tracking pipeline progress through a single encode job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub input_path: String,
    pub stage: String,
    pub progress_percent: f32,
    pub fps: f32,
    pub speed: f32,
    pub eta_seconds: Option<u64>,
    pub backend: String,
    pub size_in_bytes_before: u64,
    pub size_in_bytes_after: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete snapshot of pipeline state, served whole on every `/metrics` poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub integrity_queue_len: usize,
    pub encode_queue_len: usize,
    pub integrity_running: usize,
    pub encode_running: usize,
    pub ok_count: u64,
    pub skipped_count: u64,
    pub failed_count: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
}

pub type SharedMetrics = Arc<RwLock<PipelineSnapshot>>;

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            mem_usage_percent: 0.0,
            load_avg_1: 0.0,
            load_avg_5: 0.0,
            load_avg_15: 0.0,
        }
    }
}

impl Default for PipelineSnapshot {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            jobs: Vec::new(),
            system: SystemMetrics::default(),
            integrity_queue_len: 0,
            encode_queue_len: 0,
            integrity_running: 0,
            encode_running: 0,
            ok_count: 0,
            skipped_count: 0,
            failed_count: 0,
            total_bytes_in: 0,
            total_bytes_out: 0,
        }
    }
}

pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(PipelineSnapshot::default()))
}

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Waiting => "waiting",
        Stage::Checking => "checking",
        Stage::WaitingEncode => "waiting_encode",
        Stage::Encoding => "encoding",
        Stage::Done => "done",
        Stage::Skipped => "skipped",
        Stage::Failed => "failed",
        Stage::Retry => "retry",
    }
}

impl From<&JobStatus> for JobMetrics {
    fn from(status: &JobStatus) -> Self {
        JobMetrics {
            id: status.job_id.clone(),
            input_path: status.input_path.clone(),
            stage: stage_label(status.stage).to_string(),
            progress_percent: status.progress_percent as f32,
            fps: status.fps as f32,
            speed: status.speed as f32,
            eta_seconds: status.eta_seconds,
            backend: status.backend.clone().unwrap_or_default(),
            size_in_bytes_before: 0,
            size_in_bytes_after: 0,
        }
    }
}

/// Builds a full snapshot from the sink's current job map, for the periodic
/// updater below to publish onto the shared `/metrics` state.
pub fn build_snapshot(jobs: &[JobStatus], timestamp_unix_ms: i64) -> PipelineSnapshot {
    let mut snapshot = PipelineSnapshot {
        timestamp_unix_ms,
        system: collect_system_metrics(),
        ..PipelineSnapshot::default()
    };

    for status in jobs {
        match status.stage {
            Stage::Waiting | Stage::Checking => snapshot.integrity_running += 1,
            Stage::WaitingEncode | Stage::Encoding | Stage::Retry => snapshot.encode_running += 1,
            Stage::Done => snapshot.ok_count += 1,
            Stage::Skipped => snapshot.skipped_count += 1,
            Stage::Failed => snapshot.failed_count += 1,
        }
        snapshot.jobs.push(JobMetrics::from(status));
    }

    snapshot
}

/// Runs forever (until the task is aborted), periodically republishing the
/// sink's current job state as a `PipelineSnapshot` for `/metrics` to serve,
/// mirroring the teacher's `start_metrics_updater` loop.
pub async fn run_metrics_updater(sink: Arc<dyn ProgressSink>, metrics: SharedMetrics, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let jobs = sink.snapshot();
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let snapshot = build_snapshot(&jobs, now_ms);
        *metrics.write().await = snapshot;
    }
}

pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // **Feature: metrics, Property: PipelineSnapshot survives a JSON round-trip**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_pipeline_snapshot_round_trip(
            timestamp in any::<i64>(),
            integrity_queue_len in 0usize..1000,
            encode_queue_len in 0usize..1000,
            ok_count in any::<u64>(),
            failed_count in any::<u64>(),
            total_bytes_in in any::<u64>(),
            job_count in 0usize..5,
        ) {
            let jobs: Vec<JobMetrics> = (0..job_count).map(|i| JobMetrics {
                id: format!("job-{}", i),
                input_path: format!("/media/video{}.mkv", i),
                stage: "transcode:cpu".to_string(),
                progress_percent: 45.0,
                fps: 24.0,
                speed: 1.5,
                eta_seconds: Some(120),
                backend: "cpu".to_string(),
                size_in_bytes_before: 5_000_000_000,
                size_in_bytes_after: 2_000_000_000,
            }).collect();

            let snapshot = PipelineSnapshot {
                timestamp_unix_ms: timestamp,
                jobs,
                system: SystemMetrics::default(),
                integrity_queue_len,
                encode_queue_len,
                integrity_running: 0,
                encode_running: 0,
                ok_count,
                skipped_count: 0,
                failed_count,
                total_bytes_in,
                total_bytes_out: 0,
            };

            let json = serde_json::to_string(&snapshot).expect("serialization should succeed");
            let deserialized: PipelineSnapshot = serde_json::from_str(&json).expect("deserialization should succeed");
            prop_assert_eq!(snapshot, deserialized);
        }
    }
}
