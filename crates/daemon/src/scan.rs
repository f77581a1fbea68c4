//! Scanner module for discovering source video files under configured roots.
//!
//! Recursively walks each root, filtering by extension and by the configured
//! ignore/include glob-style patterns, which may match either the file's
//! basename or any path fragment.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Scan candidates are MKV containers only (§1, §6); the engine's whole
/// decision/encode pipeline targets this one input container.
pub const VIDEO_EXTENSIONS: &[&str] = &[".mkv"];

#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: SystemTime,
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Minimal glob match supporting `*` and `?` wildcards, enough for the
/// ignore/include pattern lists in config without pulling in a dedicated
/// glob crate for a feature this small.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Filename fragments that mark a file as a produced output, never a scan
/// source (§6). `suffix` is the configured output suffix (default `.cast`)
/// and is included dynamically since it is not a fixed literal.
const OUTPUT_TEMP_FRAGMENTS: &[&str] = &[".h264.", ".aac.", ".remux."];

/// True if `path`'s basename looks like a produced output or a leftover
/// `commit::tmp_path` temp file (`.<name>.<job-id>.<timestamp>.tmp`) rather
/// than a scan source.
pub fn is_output_or_temp(path: &Path, suffix: &str) -> bool {
    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if basename.ends_with(".tmp") {
        return true;
    }
    if OUTPUT_TEMP_FRAGMENTS.iter().any(|frag| basename.contains(frag)) {
        return true;
    }
    !suffix.is_empty() && basename.contains(suffix)
}

/// Whether `path` matches any pattern, checked against both the basename and
/// the full path string.
fn matches_any_pattern(path: &Path, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let full = path.to_string_lossy();
    patterns
        .iter()
        .any(|pat| glob_match(pat, basename) || glob_match(pat, &full))
}

/// Decides whether a discovered candidate should be scanned, applying
/// ignore patterns first and then, if any include patterns are configured,
/// requiring a match against them too.
pub fn passes_patterns(path: &Path, ignore_patterns: &[String], include_patterns: &[String]) -> bool {
    if matches_any_pattern(path, ignore_patterns) {
        return false;
    }
    if !include_patterns.is_empty() && !matches_any_pattern(path, include_patterns) {
        return false;
    }
    true
}

/// Scans the given roots for video files, applying extension filtering, the
/// hidden-directory exclusion, and ignore/include pattern matching.
pub fn scan_libraries(
    roots: &[PathBuf],
    ignore_patterns: &[String],
    include_patterns: &[String],
    output_suffix: &str,
) -> Vec<ScanCandidate> {
    use walkdir::WalkDir;

    let mut candidates = Vec::new();

    for root in roots {
        if !root.exists() {
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            if entry.file_type().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with('.') && entry.depth() > 0 {
                        return false;
                    }
                }
            }
            true
        });

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();

            if !entry.file_type().is_file() {
                continue;
            }
            if !is_video_file(path) {
                continue;
            }
            if is_output_or_temp(path, output_suffix) {
                continue;
            }
            if !passes_patterns(path, ignore_patterns, include_patterns) {
                continue;
            }

            if let Ok(metadata) = entry.metadata() {
                candidates.push(ScanCandidate {
                    path: path.to_path_buf(),
                    size_bytes: metadata.len(),
                    modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/media/movie.mkv")));
        assert!(is_video_file(Path::new("/media/movie.MKV")));
        assert!(!is_video_file(Path::new("/media/movie.mp4")));
        assert!(!is_video_file(Path::new("/media/movie.txt")));
        assert!(!is_video_file(Path::new("/media/movie")));
    }

    #[test]
    fn test_glob_match_wildcard() {
        assert!(glob_match("*.sample.mkv", "movie.sample.mkv"));
        assert!(glob_match("Sample*", "Sample.mkv"));
        assert!(!glob_match("Sample*", "movie.mkv"));
    }

    #[test]
    fn test_passes_patterns_ignore_wins_over_include() {
        let path = Path::new("/media/Sample/movie.mkv");
        let ignore = vec!["*Sample*".to_string()];
        let include: Vec<String> = vec![];
        assert!(!passes_patterns(path, &ignore, &include));
    }

    #[test]
    fn test_passes_patterns_include_required_when_nonempty() {
        let path = Path::new("/media/movie.mkv");
        let ignore: Vec<String> = vec![];
        let include = vec!["*.mp4".to_string()];
        assert!(!passes_patterns(path, &ignore, &include));

        let include_match = vec!["*.mkv".to_string()];
        assert!(passes_patterns(path, &ignore, &include_match));
    }

    #[test]
    fn test_hidden_directory_exclusion() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let visible = root.join("visible");
        fs::create_dir_all(&visible).unwrap();
        let visible_video = visible.join("movie.mkv");
        File::create(&visible_video).unwrap();

        let hidden = root.join(".hidden");
        fs::create_dir_all(&hidden).unwrap();
        let hidden_video = hidden.join("movie.mkv");
        File::create(&hidden_video).unwrap();

        let candidates = scan_libraries(&[root.to_path_buf()], &[], &[], ".cast");
        assert!(candidates.iter().any(|c| c.path == visible_video));
        assert!(!candidates.iter().any(|c| c.path == hidden_video));
    }

    #[test]
    fn test_ignore_pattern_excludes_matching_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let sample = root.join("movie-sample.mkv");
        File::create(&sample).unwrap();
        let real = root.join("movie.mkv");
        File::create(&real).unwrap();

        let candidates = scan_libraries(&[root.to_path_buf()], &["*sample*".to_string()], &[], ".cast");
        assert!(candidates.iter().any(|c| c.path == real));
        assert!(!candidates.iter().any(|c| c.path == sample));
    }

    #[test]
    fn test_is_output_or_temp_matches_tag_fragments_and_suffix() {
        assert!(is_output_or_temp(Path::new("/media/movie.h264.aac.cast.mkv"), ".cast"));
        assert!(is_output_or_temp(Path::new("/media/movie.remux.cast.mkv"), ".cast"));
        assert!(is_output_or_temp(Path::new("/media/movie.cast.mkv"), ".cast"));
        assert!(!is_output_or_temp(Path::new("/media/movie.mkv"), ".cast"));
    }

    #[test]
    fn test_is_output_or_temp_matches_real_commit_tmp_path_format() {
        // Matches the literal shape produced by commit::tmp_path:
        // ".<final-file-name>.<job-id>.<timestamp>.tmp"
        let tmp = Path::new("/media/.movie.h264.cast.mkv.3f2c-job.1700000000000.tmp");
        assert!(is_output_or_temp(tmp, ".cast"));
    }

    #[test]
    fn test_scan_libraries_excludes_prior_outputs() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let source = root.join("movie.mkv");
        File::create(&source).unwrap();
        let output = root.join("movie.h264.aac.cast.mkv");
        File::create(&output).unwrap();

        let candidates = scan_libraries(&[root.to_path_buf()], &[], &[], ".cast");
        assert!(candidates.iter().any(|c| c.path == source));
        assert!(!candidates.iter().any(|c| c.path == output));
    }

    // **Feature: scanning, Property: extension filtering agrees with the configured video extension list**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_video_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![
                Just("mkv"), Just("MKV"), Just("mp4"), Just("avi"),
                Just("mov"), Just("m4v"), Just("ts"), Just("m2ts"),
                Just("txt"), Just("jpg"), Just("srt"),
            ],
        ) {
            let path = PathBuf::from(format!("/media/{}.{}", basename, ext));
            let is_video = is_video_file(&path);
            let ext_lower = ext.to_lowercase();
            let expected = ext_lower == "mkv";
            prop_assert_eq!(is_video, expected);
        }
    }
}
