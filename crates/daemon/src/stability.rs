//! Stability checking module for verifying files are not being written to.
//!
//! Before processing a file, verifies it is not still being written to by
//! sampling its size once per second for up to `stable_wait` seconds (§4.6).
//! A `stable_wait` of zero bypasses the loop entirely and the caller's
//! initial size is taken as final.

use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

/// Result of a stability check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged across the sampling window.
    Stable,
    /// File size changed between the first and last sample.
    Unstable {
        /// Size when first checked.
        initial_size: u64,
        /// Size after waiting.
        current_size: u64,
    },
}

/// Compare two file sizes and return the appropriate `StabilityResult`. A
/// pure function, extracted for property testing.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable { initial_size, current_size }
    }
}

/// Samples `path`'s size once per second for up to `stable_wait` ticks,
/// calling `on_tick(sample_index)` after each sample so the caller can
/// surface progress. Bypassed entirely when `stable_wait == 0`.
pub async fn check_stability<F: FnMut(u64)>(
    path: &Path,
    initial_size: u64,
    stable_wait: u64,
    mut on_tick: F,
) -> Result<StabilityResult, std::io::Error> {
    if stable_wait == 0 {
        return Ok(StabilityResult::Stable);
    }

    let mut last_size = initial_size;
    for tick in 1..=stable_wait {
        sleep(Duration::from_secs(1)).await;
        let metadata = tokio::fs::metadata(path).await?;
        last_size = metadata.len();
        on_tick(tick);
    }

    Ok(compare_sizes(initial_size, last_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_stability_size_comparison(initial_size: u64, current_size: u64) {
            let result = compare_sizes(initial_size, current_size);
            if initial_size == current_size {
                prop_assert_eq!(result, StabilityResult::Stable);
            } else {
                match result {
                    StabilityResult::Unstable { initial_size: i, current_size: c } => {
                        prop_assert_eq!(i, initial_size);
                        prop_assert_eq!(c, current_size);
                    }
                    StabilityResult::Stable => prop_assert!(false, "Expected Unstable when sizes differ"),
                }
            }
        }
    }

    #[test]
    fn test_compare_sizes_stable() {
        assert_eq!(compare_sizes(1000, 1000), StabilityResult::Stable);
    }

    #[test]
    fn test_compare_sizes_unstable_larger() {
        assert_eq!(
            compare_sizes(1000, 2000),
            StabilityResult::Unstable { initial_size: 1000, current_size: 2000 }
        );
    }

    #[tokio::test]
    async fn test_zero_wait_bypasses_loop_and_reports_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"data").await.unwrap();
        let mut ticks = 0;
        let result = check_stability(&path, 4, 0, |_| ticks += 1).await.unwrap();
        assert_eq!(result, StabilityResult::Stable);
        assert_eq!(ticks, 0);
    }

    #[tokio::test]
    async fn test_unstable_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"data").await.unwrap();
        tokio::fs::write(&path, b"longer data now").await.unwrap();
        let result = check_stability(&path, 4, 1, |_| {}).await.unwrap();
        assert!(matches!(result, StabilityResult::Unstable { .. }));
    }
}
