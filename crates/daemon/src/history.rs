//! Append-only JSON-lines history log.
//!
//! `start` writes a `running` record; `finish`/`skip` append a second (or
//! sole) record for the same id. The log is never edited in place except by
//! `clean_older_than`; readers reconstruct current state by merging records
//! sharing a `record_id`, the latest occurrence winning. This is why
//! `interrupt_all_running` exists: a process crash between `start` and
//! `finish` leaves a record permanently `running` unless something promotes
//! it on the next startup (I4).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialize history record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Running,
    Done,
    Failed,
    Skipped,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub record_id: String,
    pub input_path: String,
    pub output_path: Option<String>,
    pub status: HistoryStatus,
    pub reason: Option<String>,
    pub input_bytes: u64,
    pub output_bytes: Option<u64>,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
    pub backend: Option<String>,
    pub encode_time_s: Option<f64>,
    pub integrity_time_s: Option<f64>,
}

impl HistoryRecord {
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at_ms.map(|f| (f - self.started_at_ms).max(0))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryStats {
    pub total: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
    pub interrupted: u64,
    pub total_input_bytes: u64,
    pub total_output_bytes: u64,
    pub avg_encode_time_s: f64,
}

fn append_line(log_path: &Path, record: &HistoryRecord) -> Result<(), HistoryError> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn read_raw(log_path: &Path) -> Result<Vec<HistoryRecord>, HistoryError> {
    if !log_path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(log_path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed history record");
            }
        }
    }
    Ok(records)
}

/// Merges raw log lines by `record_id`, the last occurrence for each id
/// winning, preserving first-seen order.
fn merge_records(raw: Vec<HistoryRecord>) -> Vec<HistoryRecord> {
    let mut order = Vec::new();
    let mut by_id: HashMap<String, HistoryRecord> = HashMap::new();
    for record in raw {
        if !by_id.contains_key(&record.record_id) {
            order.push(record.record_id.clone());
        }
        by_id.insert(record.record_id.clone(), record);
    }
    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

/// Begins a job, appending a `running` record and returning its id.
pub fn start(
    log_path: &Path,
    input_path: &str,
    backend: Option<&str>,
    input_bytes: u64,
    started_at_ms: i64,
) -> Result<String, HistoryError> {
    let record_id = uuid::Uuid::new_v4().to_string();
    let record = HistoryRecord {
        record_id: record_id.clone(),
        input_path: input_path.to_string(),
        output_path: None,
        status: HistoryStatus::Running,
        reason: None,
        input_bytes,
        output_bytes: None,
        started_at_ms,
        finished_at_ms: None,
        backend: backend.map(str::to_string),
        encode_time_s: None,
        integrity_time_s: None,
    };
    append_line(log_path, &record)?;
    Ok(record_id)
}

/// Finalizes a job started with `start`, appending a record carrying the
/// terminal status. `status` must not be `Running`.
#[allow(clippy::too_many_arguments)]
pub fn finish(
    log_path: &Path,
    record_id: &str,
    input_path: &str,
    backend: Option<&str>,
    input_bytes: u64,
    started_at_ms: i64,
    status: HistoryStatus,
    output_path: Option<&str>,
    output_bytes: Option<u64>,
    encode_time_s: Option<f64>,
    integrity_time_s: Option<f64>,
    reason: Option<&str>,
    finished_at_ms: i64,
) -> Result<(), HistoryError> {
    let record = HistoryRecord {
        record_id: record_id.to_string(),
        input_path: input_path.to_string(),
        output_path: output_path.map(str::to_string),
        status,
        reason: reason.map(str::to_string),
        input_bytes,
        output_bytes,
        started_at_ms,
        finished_at_ms: Some(finished_at_ms),
        backend: backend.map(str::to_string),
        encode_time_s,
        integrity_time_s,
    };
    append_line(log_path, &record)
}

/// Records a job that never started encoding (e.g. skipped as already
/// compatible), as a single self-contained record.
pub fn skip(
    log_path: &Path,
    input_path: &str,
    reason: &str,
    backend: Option<&str>,
    input_bytes: u64,
    at_ms: i64,
) -> Result<String, HistoryError> {
    let record_id = uuid::Uuid::new_v4().to_string();
    let record = HistoryRecord {
        record_id: record_id.clone(),
        input_path: input_path.to_string(),
        output_path: None,
        status: HistoryStatus::Skipped,
        reason: Some(reason.to_string()),
        input_bytes,
        output_bytes: None,
        started_at_ms: at_ms,
        finished_at_ms: Some(at_ms),
        backend: backend.map(str::to_string),
        encode_time_s: None,
        integrity_time_s: None,
    };
    append_line(log_path, &record)?;
    Ok(record_id)
}

/// Records a job that failed before (or without) ever starting encoding
/// (e.g. a disk-space preflight or an analysis error), as a single
/// self-contained record, mirroring `skip` but with a terminal `failed`
/// status instead of `skipped`.
pub fn fail(
    log_path: &Path,
    input_path: &str,
    reason: &str,
    backend: Option<&str>,
    input_bytes: u64,
    at_ms: i64,
) -> Result<String, HistoryError> {
    let record_id = uuid::Uuid::new_v4().to_string();
    let record = HistoryRecord {
        record_id: record_id.clone(),
        input_path: input_path.to_string(),
        output_path: None,
        status: HistoryStatus::Failed,
        reason: Some(reason.to_string()),
        input_bytes,
        output_bytes: None,
        started_at_ms: at_ms,
        finished_at_ms: Some(at_ms),
        backend: backend.map(str::to_string),
        encode_time_s: None,
        integrity_time_s: None,
    };
    append_line(log_path, &record)?;
    Ok(record_id)
}

/// Promotes every record still in state `running` to `interrupted`, as
/// should happen on startup or after a delivered cancellation signal.
/// Returns the number of records promoted.
pub fn interrupt_all_running(log_path: &Path, at_ms: i64) -> Result<usize, HistoryError> {
    let merged = merge_records(read_raw(log_path)?);
    let running: Vec<_> = merged.into_iter().filter(|r| r.status == HistoryStatus::Running).collect();
    for record in &running {
        finish(
            log_path,
            &record.record_id,
            &record.input_path,
            record.backend.as_deref(),
            record.input_bytes,
            record.started_at_ms,
            HistoryStatus::Interrupted,
            None,
            None,
            None,
            None,
            Some("interrupted"),
            at_ms,
        )?;
    }
    Ok(running.len())
}

/// Returns the most recent `limit` merged records, newest first.
pub fn recent(log_path: &Path, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
    let mut merged = merge_records(read_raw(log_path)?);
    merged.sort_by_key(|r| std::cmp::Reverse(r.finished_at_ms.unwrap_or(r.started_at_ms)));
    merged.truncate(limit);
    Ok(merged)
}

/// Aggregates counts and byte totals across the whole log.
pub fn stats(log_path: &Path) -> Result<HistoryStats, HistoryError> {
    let merged = merge_records(read_raw(log_path)?);
    let mut stats = HistoryStats::default();
    let mut encode_time_total = 0.0;
    let mut encode_time_count = 0u64;
    for record in &merged {
        match record.status {
            HistoryStatus::Done => stats.done += 1,
            HistoryStatus::Failed => stats.failed += 1,
            HistoryStatus::Skipped => stats.skipped += 1,
            HistoryStatus::Interrupted => stats.interrupted += 1,
            HistoryStatus::Running => continue,
        }
        stats.total += 1;
        stats.total_input_bytes += record.input_bytes;
        stats.total_output_bytes += record.output_bytes.unwrap_or(0);
        if let Some(t) = record.encode_time_s {
            encode_time_total += t;
            encode_time_count += 1;
        }
    }
    if encode_time_count > 0 {
        stats.avg_encode_time_s = encode_time_total / encode_time_count as f64;
    }
    Ok(stats)
}

/// Rewrites the log keeping only merged records finished after `cutoff_ms`
/// (a still-`running` record is always kept), returning the number dropped.
pub fn clean_older_than(log_path: &Path, cutoff_ms: i64) -> Result<usize, HistoryError> {
    let merged = merge_records(read_raw(log_path)?);
    let (keep, drop): (Vec<_>, Vec<_>) = merged
        .into_iter()
        .partition(|r| r.finished_at_ms.map(|f| f >= cutoff_ms).unwrap_or(true));

    let tmp_path = log_path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp_path)?;
        for record in &keep {
            let line = serde_json::to_string(record)?;
            writeln!(file, "{line}")?;
        }
    }
    fs::rename(&tmp_path, log_path)?;
    Ok(drop.len())
}

pub fn all_records(log_path: &Path) -> Result<Vec<HistoryRecord>, HistoryError> {
    Ok(merge_records(read_raw(log_path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_start_then_finish_yields_one_merged_record_with_final_status() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("history.jsonl");
        let id = start(&log_path, "/media/a.mkv", Some("cpu"), 1000, 0).unwrap();
        finish(
            &log_path,
            &id,
            "/media/a.mkv",
            Some("cpu"),
            1000,
            0,
            HistoryStatus::Done,
            Some("/media/a.cast.mkv"),
            Some(500),
            Some(12.5),
            Some(0.3),
            None,
            5000,
        )
        .unwrap();

        let records = all_records(&log_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, HistoryStatus::Done);
        assert_eq!(records[0].duration_ms(), Some(5000));
    }

    #[test]
    fn test_interrupt_all_running_promotes_unfinished_records() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("history.jsonl");
        let id1 = start(&log_path, "/media/a.mkv", None, 1000, 0).unwrap();
        let _id2 = start(&log_path, "/media/b.mkv", None, 2000, 0).unwrap();
        finish(
            &log_path,
            &id1,
            "/media/a.mkv",
            None,
            1000,
            0,
            HistoryStatus::Done,
            None,
            None,
            None,
            None,
            None,
            100,
        )
        .unwrap();

        let promoted = interrupt_all_running(&log_path, 999).unwrap();
        assert_eq!(promoted, 1);

        let records = all_records(&log_path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status != HistoryStatus::Running));
    }

    #[test]
    fn test_skip_creates_self_contained_record() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("history.jsonl");
        skip(&log_path, "/media/c.mkv", "compatible", Some("cpu"), 900, 10).unwrap();
        let records = all_records(&log_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, HistoryStatus::Skipped);
        assert_eq!(records[0].reason.as_deref(), Some("compatible"));
    }

    #[test]
    fn test_fail_creates_self_contained_record_with_failed_status() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("history.jsonl");
        fail(&log_path, "/media/c.mkv", "insufficient space", None, 900, 10).unwrap();
        let records = all_records(&log_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, HistoryStatus::Failed);
        assert_eq!(records[0].reason.as_deref(), Some("insufficient space"));
    }

    #[test]
    fn test_stats_aggregates_by_status_excluding_running() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("history.jsonl");
        let id = start(&log_path, "/media/a.mkv", None, 1000, 0).unwrap();
        finish(
            &log_path, &id, "/media/a.mkv", None, 1000, 0,
            HistoryStatus::Done, None, Some(500), Some(10.0), None, None, 100,
        ).unwrap();
        skip(&log_path, "/media/b.mkv", "compatible", None, 2000, 50).unwrap();
        let _running = start(&log_path, "/media/c.mkv", None, 3000, 60).unwrap();

        let stats = stats(&log_path).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.done, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.avg_encode_time_s, 10.0);
    }

    #[test]
    fn test_recent_orders_newest_first_and_respects_limit() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("history.jsonl");
        skip(&log_path, "/media/a.mkv", "compatible", None, 100, 10).unwrap();
        skip(&log_path, "/media/b.mkv", "compatible", None, 100, 30).unwrap();
        skip(&log_path, "/media/c.mkv", "compatible", None, 100, 20).unwrap();

        let recent = recent(&log_path, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].input_path, "/media/b.mkv");
        assert_eq!(recent[1].input_path, "/media/c.mkv");
    }

    #[test]
    fn test_clean_older_than_keeps_running_and_recent_finished() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("history.jsonl");
        skip(&log_path, "/media/old.mkv", "compatible", None, 100, 1000).unwrap();
        skip(&log_path, "/media/new.mkv", "compatible", None, 100, 5000).unwrap();
        let _running = start(&log_path, "/media/running.mkv", None, 100, 0).unwrap();

        let dropped = clean_older_than(&log_path, 3000).unwrap();
        assert_eq!(dropped, 1);
        let remaining = all_records(&log_path).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn test_malformed_line_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("history.jsonl");
        skip(&log_path, "/media/a.mkv", "compatible", None, 100, 1).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
            writeln!(file, "not json").unwrap();
        }
        skip(&log_path, "/media/b.mkv", "compatible", None, 100, 2).unwrap();

        let records = all_records(&log_path).unwrap();
        assert_eq!(records.len(), 2);
    }
}
