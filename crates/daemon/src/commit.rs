//! Atomic commit: moves a finished temp output into place at its final path
//! and runs the postflight disk-quota check.
//!
//! Unlike an in-place replace, commit never touches an original file: the
//! source stays where it was, and the new output lands beside it (or in the
//! configured output tree) under a name derived from the source plus the
//! configured suffix and container extension.

use mkv2cast_config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("not enough free disk space: need {needed} bytes, have {available}")]
    InsufficientSpace { needed: u64, available: u64 },
    #[error("failed to commit temp output: {0}")]
    CommitFailed(std::io::Error),
    #[error("failed to remove temp output after failure: {0}")]
    CleanupFailed(std::io::Error),
    #[error("output exceeds quota: {output_bytes} bytes ({ratio:.2}x input)")]
    QuotaExceeded { output_bytes: u64, ratio: f64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds a unique temp path for a job's in-progress output, living next to
/// the eventual final path so the final rename stays on the same filesystem.
pub fn tmp_path(final_path: &Path, job_id: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let mut tmp = final_path.to_path_buf();
    tmp.set_file_name(format!(".{file_name}.{job_id}.{timestamp}.tmp"));
    tmp
}

/// Derives the final output path for a source file (§6): same directory and
/// stem, with the decision-driven tag (`.h264`/`.aac`/`.h264.aac`/`.remux`)
/// inserted before the configured suffix and container extension.
pub fn final_path_for(source: &Path, tag: &str, cfg: &Config) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_name = format!("{stem}{tag}{}.{}", cfg.output.suffix, cfg.output.container.extension());
    source.with_file_name(file_name)
}

fn free_space_bytes(path: &Path) -> Option<u64> {
    // std has no portable statvfs; callers pass disk_min_free_mb = 0 to skip
    // this check entirely when the platform can't answer it. On Linux this is
    // read via `/proc` through a best-effort `df`-style probe.
    let dir = if path.is_dir() { path } else { path.parent()? };
    let output = std::process::Command::new("df")
        .arg("--output=avail")
        .arg("-B1")
        .arg(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .nth(1)
        .and_then(|l| l.trim().parse::<u64>().ok())
}

/// Preflight check: enough free space at the destination for the temp write.
pub fn check_disk_space(dest_dir: &Path, estimated_bytes: u64, min_free_mb: u64) -> Result<(), CommitError> {
    if min_free_mb == 0 {
        return Ok(());
    }
    let min_free_bytes = min_free_mb * 1024 * 1024;
    if let Some(available) = free_space_bytes(dest_dir) {
        let needed = estimated_bytes + min_free_bytes;
        if available < needed {
            return Err(CommitError::InsufficientSpace { needed, available });
        }
    }
    Ok(())
}

/// Postflight quota check: if output is too large or too close to input size,
/// the caller should treat the job as failed and the output removed.
pub fn check_output_quota(
    input_bytes: u64,
    output_bytes: u64,
    max_output_mb: u64,
    max_output_ratio: f64,
) -> Result<(), CommitError> {
    if max_output_mb > 0 {
        let max_bytes = max_output_mb * 1024 * 1024;
        if output_bytes > max_bytes {
            return Err(CommitError::QuotaExceeded {
                output_bytes,
                ratio: if input_bytes > 0 {
                    output_bytes as f64 / input_bytes as f64
                } else {
                    f64::INFINITY
                },
            });
        }
    }

    if max_output_ratio > 0.0 && input_bytes > 0 {
        let ratio = output_bytes as f64 / input_bytes as f64;
        if ratio > max_output_ratio {
            return Err(CommitError::QuotaExceeded { output_bytes, ratio });
        }
    }

    Ok(())
}

/// Commits a finished temp output to its final path: renames if possible,
/// falls back to copy+delete across filesystems, then runs the quota check.
/// The temp file is always removed on any exit path: on quota rejection the
/// final file is deleted too, leaving nothing but the untouched source.
pub fn commit(
    tmp_path: &Path,
    final_path: &Path,
    input_bytes: u64,
    cfg: &Config,
) -> Result<u64, CommitError> {
    if fs::rename(tmp_path, final_path).is_err() {
        fs::copy(tmp_path, final_path).map_err(CommitError::CommitFailed)?;
        fs::remove_file(tmp_path).map_err(CommitError::CleanupFailed)?;
    }

    let output_bytes = fs::metadata(final_path)?.len();

    if let Err(e) = check_output_quota(
        input_bytes,
        output_bytes,
        cfg.safety.max_output_mb,
        cfg.safety.max_output_ratio,
    ) {
        let _ = fs::remove_file(final_path);
        return Err(e);
    }

    Ok(output_bytes)
}

/// Removes a leftover temp file; used on any failure path before commit is
/// reached so a crashed or cancelled job never leaves `.tmp` files behind.
pub fn cleanup_tmp(tmp_path: &Path) {
    if tmp_path.exists() {
        let _ = fs::remove_file(tmp_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_final_path_uses_suffix_and_extension() {
        let cfg = Config::default();
        let path = final_path_for(Path::new("/media/movie.mkv"), "", &cfg);
        assert_eq!(path, PathBuf::from("/media/movie.cast.mkv"));
    }

    #[test]
    fn test_final_path_inserts_tag_before_suffix() {
        let cfg = Config::default();
        let path = final_path_for(Path::new("/media/movie.mkv"), ".h264.aac", &cfg);
        assert_eq!(path, PathBuf::from("/media/movie.h264.aac.cast.mkv"));
    }

    #[test]
    fn test_tmp_path_is_hidden_and_unique_per_job() {
        let final_path = PathBuf::from("/media/movie.cast.mkv");
        let a = tmp_path(&final_path, "job-1");
        let b = tmp_path(&final_path, "job-2");
        assert!(a.file_name().unwrap().to_string_lossy().starts_with('.'));
        assert_ne!(a, b);
    }

    #[test]
    fn test_commit_renames_and_returns_size() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join(".out.tmp");
        let final_path = dir.path().join("out.mkv");
        fs::write(&tmp, b"hello world").unwrap();

        let cfg = Config::default();
        let size = commit(&tmp, &final_path, 1000, &cfg).unwrap();
        assert_eq!(size, 11);
        assert!(final_path.exists());
        assert!(!tmp.exists());
    }

    #[test]
    fn test_commit_quota_rejection_deletes_final() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join(".out.tmp");
        let final_path = dir.path().join("out.mkv");
        fs::write(&tmp, vec![0u8; 2_000_000]).unwrap();

        let mut cfg = Config::default();
        cfg.safety.max_output_mb = 1;
        let result = commit(&tmp, &final_path, 1_000_000, &cfg);
        assert!(matches!(result, Err(CommitError::QuotaExceeded { .. })));
        assert!(!final_path.exists());
    }

    #[test]
    fn test_cleanup_tmp_is_noop_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.tmp");
        cleanup_tmp(&path);
    }

    // **Feature: atomic commit, Property: quota check agrees with max_output_ratio threshold**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_quota_ratio_threshold(
            input_bytes in 1u64..=1_000_000_000,
            output_bytes in 0u64..=1_000_000_000,
            ratio in 0.01f64..=2.0,
        ) {
            let result = check_output_quota(input_bytes, output_bytes, 0, ratio);
            let actual_ratio = output_bytes as f64 / input_bytes as f64;
            if actual_ratio > ratio {
                prop_assert!(result.is_err());
            } else {
                prop_assert!(result.is_ok());
            }
        }
    }
}
